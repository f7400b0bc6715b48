use crate::models::ApiError;
use axum::{
    Json,
    body::Body,
    extract::State,
    http::{self, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use std::{collections::HashMap, convert::Infallible, env, sync::Arc};
use tracing::{info, warn};

#[derive(Clone)]
pub struct AuthState {
    records: Arc<HashMap<String, KeyRecord>>,
}

#[derive(Clone, Debug)]
pub struct AuthContext {
    pub tenant_id: String,
    pub api_key_id: String,
}

#[derive(Clone)]
struct KeyRecord {
    tenant_id: String,
    api_key_id: String,
}

impl AuthState {
    pub fn from_env() -> Self {
        Self::from_keys(&env::var("LEDGER_API_KEYS").unwrap_or_default())
    }

    /// Parses `tenant:key,tenant:key`.
    pub fn from_keys(raw: &str) -> Self {
        let records = Arc::new(parse_keys(raw));
        Self { records }
    }

    fn authenticate(&self, presented: &str) -> Option<AuthContext> {
        self.records.get(presented).map(|record| AuthContext {
            tenant_id: record.tenant_id.clone(),
            api_key_id: record.api_key_id.clone(),
        })
    }
}

pub async fn require_api_auth(
    State(state): State<AuthState>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, Infallible> {
    let Some(presented) = extract_api_key(request.headers()) else {
        let response =
            unauthorized_response("missing_api_key", "Provide X-Ledger-Key or Bearer token");
        return Ok(response);
    };

    let Some(context) = state.authenticate(&presented) else {
        let response = unauthorized_response("invalid_api_key", "Key not recognized");
        return Ok(response);
    };

    request.extensions_mut().insert(context);
    Ok(next.run(request).await)
}

fn extract_api_key(headers: &http::HeaderMap) -> Option<String> {
    if let Some(value) = headers.get(http::header::AUTHORIZATION)
        && let Ok(raw) = value.to_str()
        && raw.len() >= 7
        && raw[..6].eq_ignore_ascii_case("bearer")
    {
        return Some(raw[6..].trim().to_string());
    }
    headers
        .get("X-Ledger-Key")
        .and_then(|value| value.to_str().ok())
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn unauthorized_response(code: &str, message: &str) -> Response {
    let payload = ApiError {
        error: code.to_string(),
        detail: Some(message.to_string()),
    };
    (StatusCode::UNAUTHORIZED, Json(payload)).into_response()
}

fn parse_keys(raw: &str) -> HashMap<String, KeyRecord> {
    let mut entries = HashMap::new();
    for (idx, token) in raw.split(',').enumerate() {
        let trimmed = token.trim();
        if trimmed.is_empty() {
            continue;
        }
        let mut parts = trimmed.splitn(2, ':');
        let tenant_id = parts.next().map(str::trim).filter(|s| !s.is_empty());
        let key = parts.next().map(str::trim).filter(|s| !s.is_empty());
        match (tenant_id, key) {
            (Some(tenant), Some(secret)) => {
                let record = KeyRecord {
                    tenant_id: tenant.to_string(),
                    api_key_id: format!("key-{:02}", idx + 1),
                };
                entries.insert(secret.to_string(), record);
            }
            _ => warn!(
                target = "ledger.api",
                "ignored malformed LEDGER_API_KEYS entry at position {}",
                idx + 1
            ),
        }
    }

    if entries.is_empty() {
        warn!(
            target = "ledger.api",
            "LEDGER_API_KEYS produced no keys; protected routes will reject every request"
        );
    } else {
        info!(
            target = "ledger.api",
            key_count = entries.len(),
            "loaded API keys"
        );
    }

    entries
}
