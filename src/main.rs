mod cache;
mod clock;
mod config;
mod ebay;
mod financials;
mod gateway;
mod http;
mod metrics;
mod models;
mod scheduler;
mod security;
mod store;
mod tokens;

use axum::{
    Json, Router,
    extract::{Extension, Path, Query, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post, put},
};
use cache::FinancialCache;
use eyre::WrapErr;
use financials::{FinancialRecord, FinancialsError};
use gateway::{Authorization, EbayGateway, GatewayError};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use models::{
    ApiError, CallbackParams, CallbackResponse, ClearTokenResponse, LegacyTokenRequest,
    NeedsAuthResponse, TokenResponse,
};
use once_cell::sync::OnceCell;
use scheduler::{RefreshSummary, SchedulerStatus};
use security::{AuthContext, AuthState, require_api_auth};
use serde_json::json;
use std::{net::SocketAddr, sync::Arc};
use store::{MemoryTokenStore, PostgresTokenStore, TokenStore};
use tokens::ResolveError;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info, warn};
use tracing_subscriber::{EnvFilter, fmt};

static PROMETHEUS: OnceCell<PrometheusHandle> = OnceCell::new();

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "ledger.api", "server crashed: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> eyre::Result<()> {
    let _ = dotenvy::dotenv();
    init_tracing();

    let settings = config::Settings::from_env().wrap_err("invalid configuration")?;
    info!(
        target = "ledger.api",
        environment = ?settings.ebay.environment,
        api_root = %settings.ebay.api_root,
        "ebay environment selected"
    );
    let clock = clock::default_clock();
    let http = http::build_client(&settings.http).wrap_err("building http client")?;

    let store: Arc<dyn TokenStore> = match &settings.database_url {
        Some(url) => {
            let store = PostgresTokenStore::connect(url)
                .await
                .wrap_err("connecting to token database")?;
            store
                .initialize()
                .await
                .wrap_err("preparing token table")?;
            Arc::new(store)
        }
        None => {
            warn!(
                target = "ledger.api",
                "DATABASE_URL not set; tokens are kept in memory and lost on restart"
            );
            Arc::new(MemoryTokenStore::new())
        }
    };
    let cache = match &settings.redis_url {
        Some(url) => FinancialCache::redis(
            redis::Client::open(url.as_str()).wrap_err("invalid REDIS_URL")?,
            settings.cache_ttl_secs,
        ),
        None => FinancialCache::memory(clock.clone(), settings.cache_ttl_secs),
    };

    let gateway = Arc::new(EbayGateway::connect(
        Arc::new(settings.ebay),
        http,
        store,
        cache,
        clock,
        settings.scheduler,
    ));
    let scheduler = settings
        .scheduler
        .enabled
        .then(|| gateway.scheduler().spawn());

    let app = router(AppState::new(gateway), AuthState::from_env());
    let addr: SocketAddr = ([0, 0, 0, 0], settings.port).into();
    info!(target = "ledger.api", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = scheduler {
        handle.shutdown().await;
    }
    info!(target = "ledger.api", "shutdown complete");
    Ok(())
}

#[derive(Clone)]
struct AppState {
    gateway: Arc<EbayGateway>,
    openapi: Arc<serde_json::Value>,
    prometheus_handle: Option<PrometheusHandle>,
}

impl AppState {
    fn new(gateway: Arc<EbayGateway>) -> Self {
        let openapi = serde_yaml::from_str(include_str!("../docs/openapi.yaml"))
            .unwrap_or(json!({"openapi": "3.0.3"}));
        let prometheus_handle = PROMETHEUS
            .get_or_try_init(|| PrometheusBuilder::new().install_recorder())
            .map_err(|err| warn!(target = "ledger.api", "prometheus recorder unavailable: {err}"))
            .ok()
            .cloned();
        Self {
            gateway,
            openapi: Arc::new(openapi),
            prometheus_handle,
        }
    }
}

fn router(state: AppState, auth_state: AuthState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    let protected = Router::new()
        .nest(
            "/users/{user_id}",
            Router::new()
                .route("/ebay/authorize", get(authorize))
                .route("/ebay/token", get(get_token).delete(clear_token))
                .route("/ebay/token/legacy", put(store_legacy_token))
                .route("/financials/{item_id}", get(get_financials)),
        )
        .route("/ebay/tokens/refresh", post(force_refresh))
        .route("/ebay/tokens/status", get(scheduler_status))
        .route_layer(middleware::from_fn_with_state(auth_state, require_api_auth));

    Router::new()
        .route("/health", get(health))
        .route("/metrics", get(metrics_endpoint))
        .route("/openapi.json", get(openapi_json))
        .route("/ebay/callback", get(oauth_callback))
        .merge(protected)
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

/// Health and readiness check.
///
/// - Method: `GET`
/// - Path: `/health`
/// - Auth: none
async fn health() -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": "resale-ledger-api",
    }))
}

async fn openapi_json(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Result<Json<serde_json::Value>, AppError> {
    if let Ok(key) = std::env::var("OPENAPI_KEY") {
        let presented = headers
            .get("X-Docs-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != key {
            return Err(AppError::Unauthorized("docs key required"));
        }
    }
    Ok(Json((*state.openapi).clone()))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

async fn metrics_endpoint(
    State(state): State<AppState>,
    headers: axum::http::HeaderMap,
) -> Response {
    if let Ok(secret) = std::env::var("METRICS_KEY") {
        let presented = headers
            .get("X-Metrics-Key")
            .and_then(|v| v.to_str().ok())
            .unwrap_or("");
        if presented != secret {
            return (StatusCode::UNAUTHORIZED, "unauthorized").into_response();
        }
    }
    match &state.prometheus_handle {
        Some(handle) => (
            [("Content-Type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => (StatusCode::SERVICE_UNAVAILABLE, "metrics unavailable").into_response(),
    }
}

/// Browser redirect target after eBay consent.
///
/// - Method: `GET`
/// - Path: `/ebay/callback?code=..&state=..`
/// - Auth: the one-time `state` issued by `/users/{user_id}/ebay/authorize`
async fn oauth_callback(
    State(state): State<AppState>,
    Query(params): Query<CallbackParams>,
) -> Result<Json<CallbackResponse>, AppError> {
    crate::metrics::inc_requests("/ebay/callback");
    if let Some(error) = params.error {
        warn!(target = "ledger.api", error = %error, "authorization_declined");
        return Err(AppError::BadRequest(
            "authorization_declined",
            params.error_description.unwrap_or(error),
        ));
    }
    let (Some(code), Some(oauth_state)) = (params.code, params.state) else {
        return Err(AppError::BadRequest(
            "invalid_callback",
            "code and state are required".into(),
        ));
    };
    let user_id = state
        .gateway
        .complete_authorization(&oauth_state, &code)
        .await?;
    Ok(Json(CallbackResponse {
        success: true,
        user_id,
    }))
}

/// Start the consent flow.
///
/// - Method: `GET`
/// - Path: `/users/{user_id}/ebay/authorize`
/// - Response: `{authorization_url, state}`
async fn authorize(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(user_id): Path<String>,
) -> Result<Json<Authorization>, AppError> {
    crate::metrics::inc_requests("/users/{user_id}/ebay/authorize");
    info!(
        target = "ledger.api",
        tenant_id = %context.tenant_id,
        api_key = %context.api_key_id,
        user_id = %user_id,
        "authorization_started",
    );
    Ok(Json(state.gateway.authorization_url(&user_id).await?))
}

/// Resolve a usable access token, refreshing it if needed.
///
/// - Method: `GET`
/// - Path: `/users/{user_id}/ebay/token`
/// - Response: `{success, access_token, legacy}`, or 401 `{success:false, needs_auth:true}`
async fn get_token(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
) -> Result<Json<TokenResponse>, AppError> {
    crate::metrics::inc_requests("/users/{user_id}/ebay/token");
    let token = state.gateway.get_valid_token(&user_id).await?;
    Ok(Json(TokenResponse {
        success: true,
        legacy: token.is_legacy(),
        access_token: token.secret().to_string(),
    }))
}

async fn clear_token(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
    Path(user_id): Path<String>,
) -> Result<Json<ClearTokenResponse>, AppError> {
    crate::metrics::inc_requests("/users/{user_id}/ebay/token:delete");
    let removed = state.gateway.clear_tokens(&user_id).await?;
    info!(target = "ledger.api", tenant_id = %context.tenant_id, user_id = %user_id, removed, "token_cleared");
    Ok(Json(ClearTokenResponse {
        success: true,
        removed,
    }))
}

async fn store_legacy_token(
    State(state): State<AppState>,
    Path(user_id): Path<String>,
    Json(payload): Json<LegacyTokenRequest>,
) -> Result<StatusCode, AppError> {
    crate::metrics::inc_requests("/users/{user_id}/ebay/token/legacy");
    state
        .gateway
        .store_legacy_token(&user_id, &payload.token)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Per-sale financial summary.
///
/// - Method: `GET`
/// - Path: `/users/{user_id}/financials/{item_id}`
/// - `item_id` is a listing id, or an order id when it contains `-`
async fn get_financials(
    State(state): State<AppState>,
    Path((user_id, item_id)): Path<(String, String)>,
) -> Result<Json<FinancialRecord>, AppError> {
    crate::metrics::inc_requests("/users/{user_id}/financials/{item_id}");
    let record = state
        .gateway
        .financials_for_user(&user_id, &item_id)
        .await?;
    Ok(Json(record))
}

async fn force_refresh(
    State(state): State<AppState>,
    Extension(context): Extension<AuthContext>,
) -> Json<RefreshSummary> {
    crate::metrics::inc_requests("/ebay/tokens/refresh");
    info!(target = "ledger.api", tenant_id = %context.tenant_id, "force_refresh_requested");
    Json(state.gateway.force_refresh_all().await)
}

async fn scheduler_status(
    State(state): State<AppState>,
) -> Result<Json<SchedulerStatus>, AppError> {
    crate::metrics::inc_requests("/ebay/tokens/status");
    Ok(Json(state.gateway.status().await?))
}

#[derive(Debug)]
enum AppError {
    Gateway(GatewayError),
    BadRequest(&'static str, String),
    Unauthorized(&'static str),
}

impl From<GatewayError> for AppError {
    fn from(value: GatewayError) -> Self {
        Self::Gateway(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let (status, code, detail) = match self {
            AppError::Gateway(GatewayError::Resolve(ResolveError::AuthRequired { user_id })) => {
                let body = NeedsAuthResponse::new(format!(
                    "ebay authorization required for user {user_id}"
                ));
                return (StatusCode::UNAUTHORIZED, Json(body)).into_response();
            }
            AppError::Gateway(err) => {
                let (status, code) = match &err {
                    GatewayError::Resolve(_) | GatewayError::Store(_) => {
                        (StatusCode::SERVICE_UNAVAILABLE, "persistence_unavailable")
                    }
                    GatewayError::Financials(FinancialsError::NoData(_)) => {
                        (StatusCode::NOT_FOUND, "no_financial_data")
                    }
                    GatewayError::Financials(FinancialsError::InvalidId) => {
                        (StatusCode::BAD_REQUEST, "invalid_item_id")
                    }
                    GatewayError::Exchange(_) => (StatusCode::BAD_GATEWAY, "provider_error"),
                    GatewayError::InvalidState => (StatusCode::BAD_REQUEST, "invalid_state"),
                    GatewayError::InvalidInput(_) => (StatusCode::BAD_REQUEST, "invalid_input"),
                };
                if status.is_server_error() {
                    error!(target = "ledger.api", error = %err, "request_failed");
                }
                (status, code, err.to_string())
            }
            AppError::BadRequest(code, detail) => (StatusCode::BAD_REQUEST, code, detail),
            AppError::Unauthorized(detail) => {
                (StatusCode::UNAUTHORIZED, "unauthorized", detail.to_string())
            }
        };
        let payload = ApiError {
            error: code.to_string(),
            detail: Some(detail),
        };
        (status, Json(payload)).into_response()
    }
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// Waits for Ctrl-C or SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            warn!(target = "ledger.api", "failed to listen for Ctrl+C: {err}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                warn!(target = "ledger.api", "failed to listen for SIGTERM: {err}");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
    info!(target = "ledger.api", "shutdown signal received");
}
