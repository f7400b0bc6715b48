use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize)]
pub struct ApiError {
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// `GET /users/{user_id}/ebay/token` success body.
#[derive(Debug, Serialize)]
pub struct TokenResponse {
    pub success: bool,
    pub access_token: String,
    pub legacy: bool,
}

/// Body returned instead of a token when the user must re-consent.
#[derive(Debug, Serialize)]
pub struct NeedsAuthResponse {
    pub success: bool,
    pub needs_auth: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

impl NeedsAuthResponse {
    pub fn new(detail: impl Into<String>) -> Self {
        Self {
            success: false,
            needs_auth: true,
            detail: Some(detail.into()),
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct LegacyTokenRequest {
    pub token: String,
}

#[derive(Debug, Deserialize)]
pub struct CallbackParams {
    #[serde(default)]
    pub code: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct CallbackResponse {
    pub success: bool,
    pub user_id: String,
}

#[derive(Debug, Serialize)]
pub struct ClearTokenResponse {
    pub success: bool,
    pub removed: bool,
}
