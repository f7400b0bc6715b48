use crate::clock::Clock;
use crate::ebay::EbayToken;
use crate::financials::{
    Amount, FeeBreakdown, FetchError, FinancialRecord, FinancialSource, SaleFacts, SourceOutcome,
    amount_of, is_order_id,
};
use async_trait::async_trait;
use chrono::{SecondsFormat, TimeDelta};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tracing::debug;
use urlencoding::encode;

const LOOKBACK_DAYS: i64 = 30;
const PAGE_LIMIT: &str = "200";
const MAX_PAGES: usize = 5;

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderSearchResponse {
    #[serde(default)]
    orders: Vec<Order>,
    #[serde(default)]
    next: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Order {
    order_id: String,
    #[serde(default)]
    line_items: Vec<LineItem>,
    #[serde(default)]
    pricing_summary: Option<PricingSummary>,
    #[serde(default)]
    total_marketplace_fee: Option<Amount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PricingSummary {
    #[serde(default)]
    price_subtotal: Option<Amount>,
    #[serde(default)]
    delivery_cost: Option<Amount>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LineItem {
    #[serde(default)]
    legacy_item_id: Option<String>,
    #[serde(default)]
    line_item_cost: Option<Amount>,
    #[serde(default)]
    delivery_cost: Option<DeliveryCost>,
    #[serde(default)]
    ebay_collect_and_remit_taxes: Vec<RemitTax>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DeliveryCost {
    #[serde(default)]
    shipping_cost: Option<Amount>,
}

#[derive(Debug, Deserialize)]
struct RemitTax {
    #[serde(default)]
    amount: Option<Amount>,
}

impl LineItem {
    fn tax(&self) -> f64 {
        self.ebay_collect_and_remit_taxes
            .iter()
            .map(|tax| amount_of(&tax.amount))
            .sum()
    }

    fn shipping(&self) -> f64 {
        self.delivery_cost
            .as_ref()
            .map(|cost| amount_of(&cost.shipping_cost))
            .unwrap_or(0.0)
    }
}

/// Fulfillment API lookup: the only step whose fees come straight from a
/// structured order document.
pub struct OrderApiSource {
    http: Client,
    api_root: String,
    clock: Arc<dyn Clock>,
}

impl OrderApiSource {
    pub fn new(http: Client, api_root: impl Into<String>, clock: Arc<dyn Clock>) -> Self {
        Self {
            http,
            api_root: api_root.into(),
            clock,
        }
    }

    async fn get_order(&self, token: &str, order_id: &str) -> Result<Option<Order>, FetchError> {
        let url = format!(
            "{}/sell/fulfillment/v1/order/{}",
            self.api_root,
            encode(order_id)
        );
        let response = self.http.get(url).bearer_auth(token).send().await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        if !response.status().is_success() {
            return Err(FetchError::from_response(response).await);
        }
        let order = response
            .json::<Order>()
            .await
            .map_err(|err| FetchError::Malformed(err.to_string()))?;
        Ok(Some(order))
    }

    async fn find_by_item(
        &self,
        token: &str,
        item_id: &str,
    ) -> Result<Option<(Order, usize)>, FetchError> {
        let since = self.clock.now() - TimeDelta::days(LOOKBACK_DAYS);
        let filter = format!(
            "creationdate:[{}..]",
            since.to_rfc3339_opts(SecondsFormat::Millis, true)
        );
        let mut request = self
            .http
            .get(format!("{}/sell/fulfillment/v1/order", self.api_root))
            .query(&[("filter", filter.as_str()), ("limit", PAGE_LIMIT)]);

        for page in 0..MAX_PAGES {
            let response = request.bearer_auth(token).send().await?;
            if !response.status().is_success() {
                return Err(FetchError::from_response(response).await);
            }
            let payload = response
                .json::<OrderSearchResponse>()
                .await
                .map_err(|err| FetchError::Malformed(err.to_string()))?;
            debug!(target = "ledger.financials", page, orders = payload.orders.len(), "order_page");

            for order in payload.orders {
                if let Some(index) = order
                    .line_items
                    .iter()
                    .position(|line| line.legacy_item_id.as_deref() == Some(item_id))
                {
                    return Ok(Some((order, index)));
                }
            }
            match payload.next {
                Some(next) if !next.is_empty() => request = self.http.get(next),
                _ => break,
            }
        }
        Ok(None)
    }
}

/// Amounts for one line item, or the whole order when `line` is `None`.
/// The order-level marketplace fee is split across line items by cost.
fn summarize(order: Order, line: Option<usize>) -> SourceOutcome {
    let summary_subtotal = order
        .pricing_summary
        .as_ref()
        .map(|summary| amount_of(&summary.price_subtotal))
        .unwrap_or(0.0);
    let (subtotal, shipping, sales_tax) = match line.and_then(|i| order.line_items.get(i)) {
        Some(item) => (amount_of(&item.line_item_cost), item.shipping(), item.tax()),
        None => (
            summary_subtotal,
            order
                .pricing_summary
                .as_ref()
                .map(|summary| amount_of(&summary.delivery_cost))
                .unwrap_or(0.0),
            order.line_items.iter().map(LineItem::tax).sum(),
        ),
    };

    let Some(fee) = order.total_marketplace_fee.as_ref().map(Amount::amount) else {
        return SourceOutcome::SaleOnly(SaleFacts {
            price: subtotal,
            shipping,
            sales_tax,
            order_id: Some(order.order_id),
        });
    };
    let share = if line.is_some() && order.line_items.len() > 1 && summary_subtotal > 0.0 {
        subtotal / summary_subtotal
    } else {
        1.0
    };

    SourceOutcome::Confirmed(FinancialRecord::confirmed(
        FeeBreakdown {
            subtotal,
            shipping,
            sales_tax,
            final_value_fee: fee * share,
            paypal_fee: 0.0,
            listing_fees: 0.0,
            order_id: Some(order.order_id),
        },
        "order_api",
    ))
}

#[async_trait]
impl FinancialSource for OrderApiSource {
    fn name(&self) -> &'static str {
        "order_api"
    }

    fn supports(&self, token: &EbayToken) -> bool {
        !token.is_legacy()
    }

    async fn fetch(&self, token: &EbayToken, id: &str) -> Result<SourceOutcome, FetchError> {
        if is_order_id(id) {
            return Ok(match self.get_order(token.secret(), id).await? {
                Some(order) => summarize(order, None),
                None => SourceOutcome::Nothing,
            });
        }
        Ok(match self.find_by_item(token.secret(), id).await? {
            Some((order, index)) => summarize(order, Some(index)),
            None => SourceOutcome::Nothing,
        })
    }
}
