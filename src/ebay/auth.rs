use crate::config::EbayConfig;
use crate::http::truncate_body;
use async_trait::async_trait;
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::{Client, header::AUTHORIZATION};
use serde::Deserialize;
use std::sync::Arc;
use thiserror::Error;

/// Scope granting the client-credentials token used for public Buy APIs.
pub const APP_SCOPE: &str = "https://api.ebay.com/oauth/api_scope";

#[derive(Debug, Error)]
pub enum EbayAuthError {
    #[error("missing ebay app credentials")]
    MissingCredentials,
    #[error("oauth request failed: {0}")]
    Request(String),
    #[error("oauth endpoint returned HTTP {status}: {message}")]
    Provider { status: u16, message: String },
    #[error("invalid oauth response: {0}")]
    Malformed(String),
}

/// Token endpoint payload. `refresh_token` is only present when rotated.
#[derive(Debug, Clone, Deserialize)]
pub struct TokenGrant {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    pub expires_in: i64,
    #[serde(default)]
    pub token_type: Option<String>,
}

impl TokenGrant {
    /// Instant the grant lapses when issued at `issued_at`. Negative or
    /// unrepresentable lifetimes are rejected.
    pub fn expires_at(&self, issued_at: DateTime<Utc>) -> Result<DateTime<Utc>, EbayAuthError> {
        if self.expires_in < 0 {
            return Err(EbayAuthError::Malformed(format!(
                "negative expires_in: {}",
                self.expires_in
            )));
        }
        TimeDelta::try_seconds(self.expires_in)
            .and_then(|lifetime| issued_at.checked_add_signed(lifetime))
            .ok_or_else(|| {
                EbayAuthError::Malformed(format!("expires_in out of range: {}", self.expires_in))
            })
    }
}

#[derive(Deserialize)]
struct OAuthErrorBody {
    error: Option<String>,
    error_description: Option<String>,
}

/// The provider's token endpoint.
#[async_trait]
pub trait TokenEndpoint: Send + Sync {
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, EbayAuthError>;

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, EbayAuthError>;

    /// Client-credentials token for application-level calls.
    async fn app_token(&self) -> Result<TokenGrant, EbayAuthError>;
}

#[derive(Clone)]
pub struct EbayOAuthClient {
    http: Client,
    config: Arc<EbayConfig>,
}

impl EbayOAuthClient {
    pub fn new(http: Client, config: Arc<EbayConfig>) -> Self {
        Self { http, config }
    }

    fn basic_auth_header(&self) -> Result<String, EbayAuthError> {
        if self.config.app_id.is_empty() || self.config.cert_id.is_empty() {
            return Err(EbayAuthError::MissingCredentials);
        }
        let raw = format!("{}:{}", self.config.app_id, self.config.cert_id);
        Ok(format!("Basic {}", BASE64.encode(raw)))
    }

    async fn request_token(&self, params: &[(&str, &str)]) -> Result<TokenGrant, EbayAuthError> {
        let authorization = self.basic_auth_header()?;
        let response = self
            .http
            .post(self.config.token_url())
            .header(AUTHORIZATION, authorization)
            .form(params)
            .send()
            .await
            .map_err(|err| EbayAuthError::Request(err.to_string()))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|err| EbayAuthError::Request(err.to_string()))?;

        if !status.is_success() {
            return Err(EbayAuthError::Provider {
                status: status.as_u16(),
                message: provider_message(&body),
            });
        }

        let grant: TokenGrant = serde_json::from_str(&body)
            .map_err(|err| EbayAuthError::Malformed(err.to_string()))?;
        if grant.access_token.trim().is_empty() {
            return Err(EbayAuthError::Malformed("empty access_token".into()));
        }
        grant.expires_at(Utc::now())?;
        Ok(grant)
    }
}

fn provider_message(body: &str) -> String {
    match serde_json::from_str::<OAuthErrorBody>(body) {
        Ok(OAuthErrorBody {
            error_description: Some(description),
            ..
        }) => description,
        Ok(OAuthErrorBody {
            error: Some(error), ..
        }) => error,
        _ => truncate_body(body),
    }
}

#[async_trait]
impl TokenEndpoint for EbayOAuthClient {
    async fn exchange_code(&self, code: &str) -> Result<TokenGrant, EbayAuthError> {
        let body = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", self.config.redirect_uri.as_str()),
        ];
        self.request_token(&body).await
    }

    async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, EbayAuthError> {
        let scopes = self.config.scopes.join(" ");
        let body = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
            ("scope", scopes.as_str()),
        ];
        self.request_token(&body).await
    }

    async fn app_token(&self) -> Result<TokenGrant, EbayAuthError> {
        let body = [("grant_type", "client_credentials"), ("scope", APP_SCOPE)];
        self.request_token(&body).await
    }
}
