use crate::clock::Clock;
use crate::ebay::{EbayAuthError, EbayToken, TokenEndpoint};
use crate::financials::{
    Amount, FetchError, FinancialSource, SaleFacts, SourceOutcome, amount_of, is_order_id,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

const MARKETPLACE_ID: &str = "EBAY_US";
const APP_TOKEN_MARGIN_SECS: i64 = 60;

/// Client-credentials token shared by every Browse call, renewed a minute
/// before it lapses.
pub struct AppTokenCache {
    endpoint: Arc<dyn TokenEndpoint>,
    clock: Arc<dyn Clock>,
    cached: Mutex<Option<(String, DateTime<Utc>)>>,
}

impl AppTokenCache {
    pub fn new(endpoint: Arc<dyn TokenEndpoint>, clock: Arc<dyn Clock>) -> Self {
        Self {
            endpoint,
            clock,
            cached: Mutex::new(None),
        }
    }

    pub async fn token(&self) -> Result<String, EbayAuthError> {
        let mut cached = self.cached.lock().await;
        let now = self.clock.now();
        if let Some((token, expires_at)) = cached.as_ref()
            && now < *expires_at - TimeDelta::seconds(APP_TOKEN_MARGIN_SECS)
        {
            return Ok(token.clone());
        }

        let grant = self.endpoint.app_token().await?;
        let expires_at = grant.expires_at(now)?;
        debug!(
            target = "ledger.ebay",
            expires_in = grant.expires_in,
            token_type = grant.token_type.as_deref().unwrap_or("unknown"),
            "app_token_issued"
        );
        *cached = Some((grant.access_token.clone(), expires_at));
        Ok(grant.access_token)
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BrowseItem {
    #[serde(default)]
    price: Option<Amount>,
    #[serde(default)]
    shipping_options: Vec<ShippingOption>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ShippingOption {
    #[serde(default)]
    shipping_cost: Option<Amount>,
}

/// Public listing price from the Browse API. Never carries fees, so it only
/// ever feeds the estimate.
pub struct BrowseApiSource {
    http: Client,
    api_root: String,
    app_tokens: Arc<AppTokenCache>,
}

impl BrowseApiSource {
    pub fn new(http: Client, api_root: impl Into<String>, app_tokens: Arc<AppTokenCache>) -> Self {
        Self {
            http,
            api_root: api_root.into(),
            app_tokens,
        }
    }
}

#[async_trait]
impl FinancialSource for BrowseApiSource {
    fn name(&self) -> &'static str {
        "browse_api"
    }

    async fn fetch(&self, _token: &EbayToken, id: &str) -> Result<SourceOutcome, FetchError> {
        if is_order_id(id) {
            return Ok(SourceOutcome::Nothing);
        }
        let app_token = self.app_tokens.token().await?;
        let response = self
            .http
            .get(format!(
                "{}/buy/browse/v1/item/get_item_by_legacy_id",
                self.api_root
            ))
            .query(&[("legacy_item_id", id)])
            .bearer_auth(app_token)
            .header("X-EBAY-C-MARKETPLACE-ID", MARKETPLACE_ID)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(SourceOutcome::Nothing);
        }
        if !response.status().is_success() {
            return Err(FetchError::from_response(response).await);
        }
        let item = response
            .json::<BrowseItem>()
            .await
            .map_err(|err| FetchError::Malformed(err.to_string()))?;

        let price = amount_of(&item.price);
        if price <= 0.0 {
            return Ok(SourceOutcome::Nothing);
        }
        Ok(SourceOutcome::SaleOnly(SaleFacts {
            price,
            shipping: item
                .shipping_options
                .first()
                .map(|option| amount_of(&option.shipping_cost))
                .unwrap_or(0.0),
            sales_tax: 0.0,
            order_id: None,
        }))
    }
}
