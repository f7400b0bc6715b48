pub mod browse;
pub mod fees;
pub mod order_api;
pub mod trading;
pub mod xml;

pub use browse::{AppTokenCache, BrowseApiSource};
pub use order_api::OrderApiSource;
pub use trading::TradingApiSource;

use crate::ebay::{EbayAuthError, EbayToken};
use crate::http::truncate_body;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use serde_with::skip_serializing_none;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info, warn};

/// Flat per-sale financial summary handed to reporting.
///
/// `final_price` is what the buyer paid (subtotal + shipping + sales tax).
/// `total_fees` and `net_earnings` are derived in [`FinancialRecord::build`]
/// and nowhere else.
#[skip_serializing_none]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FinancialRecord {
    pub final_price: f64,
    pub subtotal: f64,
    pub shipping: f64,
    pub listing_fees: f64,
    pub final_value_fee: f64,
    pub paypal_fee: f64,
    pub sales_tax: f64,
    pub total_fees: f64,
    pub net_earnings: f64,
    pub has_actual_fees: bool,
    pub order_id: Option<String>,
    pub source: String,
}

/// Provider-reported amounts for one sale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FeeBreakdown {
    pub subtotal: f64,
    pub shipping: f64,
    pub sales_tax: f64,
    pub final_value_fee: f64,
    pub paypal_fee: f64,
    pub listing_fees: f64,
    pub order_id: Option<String>,
}

/// What a source could establish about a sale when no itemized fees exist.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SaleFacts {
    pub price: f64,
    pub shipping: f64,
    pub sales_tax: f64,
    pub order_id: Option<String>,
}

impl FinancialRecord {
    fn build(parts: FeeBreakdown, has_actual_fees: bool, source: &str) -> Self {
        let final_price = round_cents(parts.subtotal + parts.shipping + parts.sales_tax);
        let total_fees = round_cents(parts.final_value_fee + parts.paypal_fee + parts.listing_fees);
        Self {
            final_price,
            subtotal: round_cents(parts.subtotal),
            shipping: round_cents(parts.shipping),
            listing_fees: round_cents(parts.listing_fees),
            final_value_fee: round_cents(parts.final_value_fee),
            paypal_fee: round_cents(parts.paypal_fee),
            sales_tax: round_cents(parts.sales_tax),
            total_fees,
            net_earnings: round_cents(final_price - parts.sales_tax - total_fees),
            has_actual_fees,
            order_id: parts.order_id,
            source: source.to_string(),
        }
    }

    /// Record built from fees the provider reported.
    pub fn confirmed(parts: FeeBreakdown, source: &str) -> Self {
        Self::build(parts, true, source)
    }

    /// Record whose fees come from the flat-rate schedule in [`fees`].
    pub fn estimated(sale: SaleFacts, source: &str) -> Self {
        let estimate = fees::estimate(sale.price);
        Self::build(
            FeeBreakdown {
                subtotal: sale.price,
                shipping: sale.shipping,
                sales_tax: sale.sales_tax,
                final_value_fee: estimate.final_value_fee,
                paypal_fee: estimate.payment_fee,
                listing_fees: estimate.listing_fee,
                order_id: sale.order_id,
            },
            false,
            source,
        )
    }
}

pub(crate) fn round_cents(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// Result of one step in the fallback chain.
#[derive(Debug, Clone, PartialEq)]
pub enum SourceOutcome {
    Confirmed(FinancialRecord),
    SaleOnly(SaleFacts),
    Nothing,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(String),
    #[error("provider returned HTTP {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("provider reported failure: {0}")]
    Rejected(String),
    #[error("invalid response: {0}")]
    Malformed(String),
    #[error("app token unavailable: {0}")]
    AppToken(#[from] EbayAuthError),
}

impl FetchError {
    pub(crate) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Self::Provider {
            status,
            message: truncate_body(&body),
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        Self::Request(err.to_string())
    }
}

#[derive(Debug, Error)]
pub enum FinancialsError {
    #[error("item or order id is empty")]
    InvalidId,
    #[error("no financial data available for {0}")]
    NoData(String),
}

/// One strategy in the fallback chain.
#[async_trait]
pub trait FinancialSource: Send + Sync {
    fn name(&self) -> &'static str;

    fn supports(&self, _token: &EbayToken) -> bool {
        true
    }

    async fn fetch(&self, token: &EbayToken, id: &str) -> Result<SourceOutcome, FetchError>;
}

/// Identifiers with a dash are order ids (`12-34567-89012`) or order line
/// items (`itemid-transactionid`); plain digits are listing ids.
pub fn is_order_id(id: &str) -> bool {
    id.contains('-')
}

/// Walks the sources in order and stops at the first provider-confirmed,
/// non-zero price. Falls back to estimated fees on the first raw price seen.
pub struct FinancialResolver {
    sources: Vec<Arc<dyn FinancialSource>>,
}

impl FinancialResolver {
    pub fn new(sources: Vec<Arc<dyn FinancialSource>>) -> Self {
        Self { sources }
    }

    pub async fn fetch_financials(
        &self,
        token: &EbayToken,
        id: &str,
    ) -> Result<FinancialRecord, FinancialsError> {
        let id = id.trim();
        if id.is_empty() {
            return Err(FinancialsError::InvalidId);
        }

        let mut sale: Option<(SaleFacts, &'static str)> = None;
        for source in &self.sources {
            if !source.supports(token) {
                continue;
            }
            match source.fetch(token, id).await {
                Ok(SourceOutcome::Confirmed(record)) if record.final_price > 0.0 => {
                    crate::metrics::financial_step(source.name(), "confirmed");
                    info!(target = "ledger.financials", item_id = id, source = source.name(), "financials_confirmed");
                    return Ok(record);
                }
                Ok(SourceOutcome::Confirmed(_)) => {
                    crate::metrics::financial_step(source.name(), "zero_price");
                }
                Ok(SourceOutcome::SaleOnly(facts)) if facts.price > 0.0 => {
                    crate::metrics::financial_step(source.name(), "price_only");
                    debug!(target = "ledger.financials", item_id = id, source = source.name(), price = facts.price, "sale_price_found");
                    if sale.is_none() {
                        sale = Some((facts, source.name()));
                    }
                }
                Ok(_) => {
                    crate::metrics::financial_step(source.name(), "empty");
                }
                Err(err) => {
                    crate::metrics::financial_step(source.name(), "failed");
                    warn!(target = "ledger.financials", item_id = id, source = source.name(), error = %err, "financial_step_failed");
                }
            }
        }

        match sale {
            Some((facts, name)) => {
                info!(target = "ledger.financials", item_id = id, source = name, "financials_estimated");
                Ok(FinancialRecord::estimated(facts, name))
            }
            None => Err(FinancialsError::NoData(id.to_string())),
        }
    }
}

/// eBay money amount; `value` arrives as a string in most APIs.
#[derive(Debug, Clone, Default, Deserialize)]
pub(crate) struct Amount {
    #[serde(default)]
    value: Value,
}

impl Amount {
    pub(crate) fn amount(&self) -> f64 {
        match &self.value {
            Value::String(raw) => raw.trim().parse().unwrap_or(0.0),
            Value::Number(number) => number.as_f64().unwrap_or(0.0),
            _ => 0.0,
        }
    }
}

pub(crate) fn amount_of(amount: &Option<Amount>) -> f64 {
    amount.as_ref().map(Amount::amount).unwrap_or(0.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Scripted {
        name: &'static str,
        outcome: Result<SourceOutcome, ()>,
        oauth_only: bool,
        calls: AtomicUsize,
    }

    impl Scripted {
        fn new(name: &'static str, outcome: Result<SourceOutcome, ()>) -> Arc<Self> {
            Arc::new(Self {
                name,
                outcome,
                oauth_only: false,
                calls: AtomicUsize::new(0),
            })
        }

        fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl FinancialSource for Scripted {
        fn name(&self) -> &'static str {
            self.name
        }

        fn supports(&self, token: &EbayToken) -> bool {
            !(self.oauth_only && token.is_legacy())
        }

        async fn fetch(&self, _token: &EbayToken, _id: &str) -> Result<SourceOutcome, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            self.outcome
                .clone()
                .map_err(|_| FetchError::Request("connection reset".into()))
        }
    }

    fn confirmed(subtotal: f64) -> SourceOutcome {
        SourceOutcome::Confirmed(FinancialRecord::confirmed(
            FeeBreakdown {
                subtotal,
                shipping: 5.0,
                sales_tax: 2.0,
                final_value_fee: 3.0,
                paypal_fee: 1.0,
                listing_fees: 0.0,
                order_id: Some("01-23456-78901".into()),
            },
            "scripted",
        ))
    }

    fn sale(price: f64) -> SourceOutcome {
        SourceOutcome::SaleOnly(SaleFacts {
            price,
            ..SaleFacts::default()
        })
    }

    fn oauth() -> EbayToken {
        EbayToken::OAuth("v^1.1#token".into())
    }

    #[test]
    fn derived_fields_follow_one_definition() {
        let SourceOutcome::Confirmed(record) = confirmed(20.0) else {
            unreachable!()
        };
        assert_eq!(record.final_price, 27.0);
        assert_eq!(record.total_fees, 4.0);
        assert_eq!(record.net_earnings, 21.0);
        assert!(record.has_actual_fees);
    }

    #[test]
    fn net_earnings_deducts_tax_and_every_fee() {
        let record = FinancialRecord::confirmed(
            FeeBreakdown {
                subtotal: 45.0,
                shipping: 5.0,
                sales_tax: 3.6,
                final_value_fee: 5.85,
                paypal_fee: 1.61,
                listing_fees: 0.35,
                order_id: None,
            },
            "trading_api",
        );
        assert_eq!(record.final_price, 53.6);
        assert_eq!(record.total_fees, 7.81);
        assert_eq!(
            record.net_earnings,
            round_cents(record.final_price - record.sales_tax - record.total_fees)
        );
        assert_eq!(record.net_earnings, 42.19);
        assert_ne!(
            record.net_earnings,
            round_cents(record.final_price - record.sales_tax - record.final_value_fee)
        );
    }

    #[test]
    fn estimated_record_uses_fee_schedule() {
        let record = FinancialRecord::estimated(
            SaleFacts {
                price: 100.0,
                ..SaleFacts::default()
            },
            "test",
        );
        assert!(!record.has_actual_fees);
        assert_eq!(record.final_value_fee, 10.0);
        assert_eq!(record.paypal_fee, 3.2);
        assert_eq!(record.listing_fees, 0.35);
        assert_eq!(record.total_fees, 13.55);
        assert_eq!(record.net_earnings, 86.45);
    }

    #[tokio::test]
    async fn confirmed_price_short_circuits_chain() {
        let orders = Scripted::new("order_api", Ok(confirmed(40.0)));
        let trading = Scripted::new("trading_api", Ok(sale(40.0)));
        let browse = Scripted::new("browse_api", Ok(sale(40.0)));
        let chain = FinancialResolver::new(vec![orders.clone(), trading.clone(), browse.clone()]);

        let record = chain.fetch_financials(&oauth(), "1234").await.unwrap();
        assert!(record.has_actual_fees);
        assert_eq!(orders.calls(), 1);
        assert_eq!(trading.calls(), 0);
        assert_eq!(browse.calls(), 0);
    }

    #[tokio::test]
    async fn failures_fall_through_to_next_source() {
        let orders = Scripted::new("order_api", Err(()));
        let trading = Scripted::new("trading_api", Ok(confirmed(15.0)));
        let chain = FinancialResolver::new(vec![orders.clone(), trading.clone()]);

        let record = chain.fetch_financials(&oauth(), "1234").await.unwrap();
        assert_eq!(record.subtotal, 15.0);
        assert_eq!(orders.calls(), 1);
        assert_eq!(trading.calls(), 1);
    }

    #[tokio::test]
    async fn zero_confirmed_price_does_not_stop_chain() {
        let empty = SourceOutcome::Confirmed(FinancialRecord::confirmed(
            FeeBreakdown::default(),
            "scripted",
        ));
        let orders = Scripted::new("order_api", Ok(empty.clone()));
        let trading = Scripted::new("trading_api", Ok(empty));
        let browse = Scripted::new("browse_api", Ok(sale(1000.0)));
        let chain = FinancialResolver::new(vec![orders, trading.clone(), browse.clone()]);

        let record = chain.fetch_financials(&oauth(), "1234").await.unwrap();
        assert_eq!(trading.calls(), 1);
        assert_eq!(browse.calls(), 1);
        assert!(!record.has_actual_fees);
        assert_eq!(record.final_value_fee, 80.0);
    }

    #[tokio::test]
    async fn raw_price_is_estimated_when_no_fees_found() {
        let orders = Scripted::new("order_api", Ok(SourceOutcome::Nothing));
        let trading = Scripted::new("trading_api", Ok(sale(1000.0)));
        let browse = Scripted::new("browse_api", Ok(sale(999.0)));
        let chain = FinancialResolver::new(vec![orders, trading, browse]);

        let record = chain.fetch_financials(&oauth(), "1234").await.unwrap();
        assert!(!record.has_actual_fees);
        assert_eq!(record.subtotal, 1000.0);
        assert_eq!(record.final_value_fee, 80.0);
        assert_eq!(record.source, "trading_api");
    }

    #[tokio::test]
    async fn nothing_anywhere_is_no_data() {
        let orders = Scripted::new("order_api", Err(()));
        let browse = Scripted::new("browse_api", Ok(SourceOutcome::Nothing));
        let chain = FinancialResolver::new(vec![orders, browse]);

        let err = chain.fetch_financials(&oauth(), "1234").await.unwrap_err();
        assert!(matches!(err, FinancialsError::NoData(id) if id == "1234"));
    }

    #[tokio::test]
    async fn unsupported_sources_are_skipped_for_legacy_tokens() {
        let orders = Arc::new(Scripted {
            name: "order_api",
            outcome: Ok(confirmed(10.0)),
            oauth_only: true,
            calls: AtomicUsize::new(0),
        });
        let trading = Scripted::new("trading_api", Ok(sale(10.0)));
        let chain = FinancialResolver::new(vec![orders.clone(), trading.clone()]);

        let record = chain
            .fetch_financials(&EbayToken::Legacy("AgAAAA**x".into()), "1234")
            .await
            .unwrap();
        assert_eq!(orders.calls(), 0);
        assert_eq!(trading.calls(), 1);
        assert!(!record.has_actual_fees);
    }

    #[tokio::test]
    async fn blank_id_is_rejected() {
        let chain = FinancialResolver::new(vec![]);
        let err = chain.fetch_financials(&oauth(), "  ").await.unwrap_err();
        assert!(matches!(err, FinancialsError::InvalidId));
    }

    #[test]
    fn amount_accepts_strings_and_numbers() {
        let text: Amount = serde_json::from_str(r#"{"value":"12.50","currency":"USD"}"#).unwrap();
        let number: Amount = serde_json::from_str(r#"{"value":3.25}"#).unwrap();
        assert_eq!(text.amount(), 12.5);
        assert_eq!(number.amount(), 3.25);
        assert_eq!(amount_of(&None), 0.0);
    }
}
