use crate::config::EbayConfig;
use crate::ebay::EbayToken;
use crate::financials::xml::XmlDoc;
use crate::financials::{
    FeeBreakdown, FetchError, FinancialRecord, FinancialSource, SaleFacts, SourceOutcome,
    is_order_id,
};
use async_trait::async_trait;
use quick_xml::escape::escape;
use reqwest::Client;
use std::sync::Arc;
use tracing::debug;

const COMPATIBILITY_LEVEL: &str = "1193";
const XML_NS: &str = "urn:ebay:apis:eBLBaseComponents";

/// Trading (XML) API lookup. Works with both token kinds; legacy tokens
/// travel in the request body, OAuth tokens in the IAF header.
pub struct TradingApiSource {
    http: Client,
    config: Arc<EbayConfig>,
}

impl TradingApiSource {
    pub fn new(http: Client, config: Arc<EbayConfig>) -> Self {
        Self { http, config }
    }

    fn envelope(token: &EbayToken, call: &str, inner: &str) -> String {
        let credentials = match token {
            EbayToken::Legacy(secret) => format!(
                "<RequesterCredentials><eBayAuthToken>{}</eBayAuthToken></RequesterCredentials>",
                escape(secret.as_str())
            ),
            EbayToken::OAuth(_) => String::new(),
        };
        format!(
            r#"<?xml version="1.0" encoding="utf-8"?><{call}Request xmlns="{XML_NS}">{credentials}{inner}</{call}Request>"#
        )
    }

    async fn call(&self, token: &EbayToken, call: &str, inner: &str) -> Result<XmlDoc, FetchError> {
        let mut request = self
            .http
            .post(self.config.trading_url())
            .header("Content-Type", "text/xml")
            .header("X-EBAY-API-CALL-NAME", call)
            .header("X-EBAY-API-SITEID", self.config.site_id.to_string())
            .header("X-EBAY-API-COMPATIBILITY-LEVEL", COMPATIBILITY_LEVEL)
            .header("X-EBAY-API-APP-NAME", &self.config.app_id)
            .header("X-EBAY-API-DEV-NAME", &self.config.dev_id)
            .header("X-EBAY-API-CERT-NAME", &self.config.cert_id);
        if let EbayToken::OAuth(secret) = token {
            request = request.header("X-EBAY-API-IAF-TOKEN", secret);
        }

        let response = request
            .body(Self::envelope(token, call, inner))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(FetchError::from_response(response).await);
        }
        let raw = response.text().await?;
        let doc = XmlDoc::parse(&raw).map_err(|err| FetchError::Malformed(err.to_string()))?;
        if !doc.is_success() {
            let message = doc.error_message().unwrap_or("Ack Failure");
            return Err(FetchError::Rejected(format!("{call}: {message}")));
        }
        Ok(doc)
    }

    async fn get_orders(&self, token: &EbayToken, order_id: &str) -> Result<XmlDoc, FetchError> {
        self.call(
            token,
            "GetOrders",
            &format!(
                "<OrderIDArray><OrderID>{}</OrderID></OrderIDArray><DetailLevel>ReturnAll</DetailLevel>",
                escape(order_id)
            ),
        )
        .await
    }
}

fn outcome(parts: FeeBreakdown) -> SourceOutcome {
    if parts.final_value_fee > 0.0 {
        SourceOutcome::Confirmed(FinancialRecord::confirmed(parts, "trading_api"))
    } else if parts.subtotal > 0.0 {
        SourceOutcome::SaleOnly(SaleFacts {
            price: parts.subtotal,
            shipping: parts.shipping,
            sales_tax: parts.sales_tax,
            order_id: parts.order_id,
        })
    } else {
        SourceOutcome::Nothing
    }
}

/// First transaction of a `GetItemTransactions` response.
fn transaction_parts(doc: &XmlDoc) -> FeeBreakdown {
    let quantity = doc
        .first_f64("Transaction/QuantityPurchased")
        .filter(|quantity| *quantity > 0.0)
        .unwrap_or(1.0);
    FeeBreakdown {
        subtotal: doc.first_f64("Transaction/TransactionPrice").unwrap_or(0.0) * quantity,
        shipping: doc
            .first_f64("Transaction/ShippingServiceSelected/ShippingServiceCost")
            .unwrap_or(0.0),
        sales_tax: doc.first_f64("Transaction/Taxes/TotalTaxAmount").unwrap_or(0.0),
        final_value_fee: doc.first_f64("Transaction/FinalValueFee").unwrap_or(0.0),
        paypal_fee: 0.0,
        listing_fees: 0.0,
        order_id: doc
            .first("Transaction/ContainingOrder/OrderID")
            .or_else(|| doc.first("Transaction/OrderLineItemID"))
            .map(str::to_string),
    }
}

/// Order-level totals; fees are summed over every transaction in the order.
fn order_parts(doc: &XmlDoc) -> FeeBreakdown {
    let transaction_tax = doc.sum_f64("Transaction/Taxes/TotalTaxAmount");
    let sales_tax = if transaction_tax > 0.0 {
        transaction_tax
    } else {
        doc.first_f64("Order/ShippingDetails/SalesTax/SalesTaxAmount")
            .unwrap_or(0.0)
    };
    FeeBreakdown {
        subtotal: doc.first_f64("Order/Subtotal").unwrap_or(0.0),
        shipping: doc
            .first_f64("Order/ShippingServiceSelected/ShippingServiceCost")
            .unwrap_or(0.0),
        sales_tax,
        final_value_fee: doc.sum_f64("Transaction/FinalValueFee"),
        paypal_fee: doc.sum_f64("ExternalTransaction/FeeOrCreditAmount"),
        listing_fees: 0.0,
        order_id: doc.first("Order/OrderID").map(str::to_string),
    }
}

fn from_orders(doc: &XmlDoc) -> SourceOutcome {
    outcome(order_parts(doc))
}

/// Item-level amounts from the transaction, with the order's fees added.
/// Order-wide fees are split by the item's share of the order subtotal.
fn merge_order_fees(mut item: FeeBreakdown, order: &FeeBreakdown) -> FeeBreakdown {
    let share = if order.subtotal > item.subtotal && item.subtotal > 0.0 {
        item.subtotal / order.subtotal
    } else {
        1.0
    };
    if item.final_value_fee <= 0.0 {
        item.final_value_fee = order.final_value_fee * share;
    }
    item.paypal_fee = order.paypal_fee * share;
    if item.subtotal <= 0.0 {
        item.subtotal = order.subtotal;
        item.shipping = order.shipping;
        item.sales_tax = order.sales_tax;
    }
    item.order_id = item.order_id.or_else(|| order.order_id.clone());
    item
}

fn from_item(doc: &XmlDoc) -> SourceOutcome {
    outcome(FeeBreakdown {
        subtotal: doc.first_f64("Item/SellingStatus/CurrentPrice").unwrap_or(0.0),
        shipping: doc
            .first_f64("Item/ShippingDetails/ShippingServiceOptions/ShippingServiceCost")
            .unwrap_or(0.0),
        ..FeeBreakdown::default()
    })
}

#[async_trait]
impl FinancialSource for TradingApiSource {
    fn name(&self) -> &'static str {
        "trading_api"
    }

    async fn fetch(&self, token: &EbayToken, id: &str) -> Result<SourceOutcome, FetchError> {
        if is_order_id(id) {
            let doc = self.get_orders(token, id).await?;
            return Ok(from_orders(&doc));
        }

        let mut last_error = None;
        match self
            .call(
                token,
                "GetItemTransactions",
                &format!("<ItemID>{}</ItemID>", escape(id)),
            )
            .await
        {
            Ok(doc) => {
                let item = transaction_parts(&doc);
                let item = match item.order_id.clone() {
                    Some(order_id) => match self.get_orders(token, &order_id).await {
                        Ok(orders) => merge_order_fees(item, &order_parts(&orders)),
                        Err(err) => {
                            debug!(target = "ledger.financials", item_id = id, order_id = %order_id, error = %err, "trading_orders_failed");
                            item
                        }
                    },
                    None => item,
                };
                match outcome(item) {
                    SourceOutcome::Nothing => {}
                    found => return Ok(found),
                }
            }
            Err(err) => {
                debug!(target = "ledger.financials", item_id = id, error = %err, "trading_transactions_failed");
                last_error = Some(err);
            }
        }

        match self
            .call(
                token,
                "GetItem",
                &format!(
                    "<ItemID>{}</ItemID><DetailLevel>ReturnAll</DetailLevel>",
                    escape(id)
                ),
            )
            .await
        {
            Ok(doc) => match from_item(&doc) {
                SourceOutcome::Nothing => {}
                found => return Ok(found),
            },
            Err(err) => {
                debug!(target = "ledger.financials", item_id = id, error = %err, "trading_item_failed");
                last_error = Some(err);
            }
        }

        match last_error {
            Some(err) => Err(err),
            None => Ok(SourceOutcome::Nothing),
        }
    }
}
