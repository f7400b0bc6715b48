use crate::cache::FinancialCache;
use crate::clock::Clock;
use crate::config::{EbayConfig, SchedulerSettings};
use crate::ebay::{EbayAuthError, EbayOAuthClient, EbayToken, TokenEndpoint};
use crate::financials::{
    AppTokenCache, BrowseApiSource, FinancialRecord, FinancialResolver, FinancialsError,
    OrderApiSource, TradingApiSource,
};
use crate::scheduler::{RefreshScheduler, RefreshSummary, SchedulerStatus};
use crate::store::{MemoryTokenStore, StoreError, TokenRecord, TokenStore};
use crate::tokens::{RefreshError, ResolveError, TokenRefresher, TokenResolver};
use chrono::{DateTime, TimeDelta, Utc};
use reqwest::Client;
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

const PENDING_STATE_MINUTES: i64 = 10;
const LEGACY_TOKEN_LIFETIME_DAYS: i64 = 540;

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error(transparent)]
    Resolve(#[from] ResolveError),
    #[error(transparent)]
    Financials(#[from] FinancialsError),
    #[error("code exchange failed: {0}")]
    Exchange(#[from] EbayAuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("unknown or expired authorization state")]
    InvalidState,
    #[error("{0}")]
    InvalidInput(&'static str),
}

impl From<RefreshError> for GatewayError {
    fn from(err: RefreshError) -> Self {
        match err {
            RefreshError::Provider(err) => Self::Exchange(err),
            RefreshError::Store(err) => Self::Store(err),
            RefreshError::NotFound(user_id) | RefreshError::NoRefreshToken(user_id) => {
                Self::Resolve(ResolveError::AuthRequired { user_id })
            }
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct Authorization {
    pub authorization_url: String,
    pub state: String,
}

struct PendingAuth {
    user_id: String,
    created_at: DateTime<Utc>,
}

/// Everything callers need from eBay: consent flow, valid tokens, per-sale
/// financials, and control of the refresh sweep.
pub struct EbayGateway {
    config: Arc<EbayConfig>,
    endpoint: Arc<dyn TokenEndpoint>,
    store: Arc<dyn TokenStore>,
    refresher: Arc<TokenRefresher>,
    financials: FinancialResolver,
    cache: FinancialCache,
    scheduler: Arc<RefreshScheduler>,
    clock: Arc<dyn Clock>,
    pending: Mutex<HashMap<String, PendingAuth>>,
}

/// Order API, then Trading API, then Browse.
pub fn standard_chain(
    http: &Client,
    config: &Arc<EbayConfig>,
    endpoint: Arc<dyn TokenEndpoint>,
    clock: Arc<dyn Clock>,
) -> FinancialResolver {
    let app_tokens = Arc::new(AppTokenCache::new(endpoint, clock.clone()));
    FinancialResolver::new(vec![
        Arc::new(OrderApiSource::new(
            http.clone(),
            config.api_root.clone(),
            clock,
        )),
        Arc::new(TradingApiSource::new(http.clone(), config.clone())),
        Arc::new(BrowseApiSource::new(
            http.clone(),
            config.api_root.clone(),
            app_tokens,
        )),
    ])
}

impl EbayGateway {
    pub fn new(
        config: Arc<EbayConfig>,
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<dyn TokenStore>,
        financials: FinancialResolver,
        cache: FinancialCache,
        clock: Arc<dyn Clock>,
        scheduler: SchedulerSettings,
    ) -> Self {
        let refresher = Arc::new(TokenRefresher::new(
            endpoint.clone(),
            store.clone(),
            clock.clone(),
        ));
        let scheduler = Arc::new(RefreshScheduler::new(
            refresher.clone(),
            store.clone(),
            clock.clone(),
            scheduler,
        ));
        Self {
            config,
            endpoint,
            store,
            refresher,
            financials,
            cache,
            scheduler,
            clock,
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Production wiring: the real OAuth client and the standard fallback chain.
    pub fn connect(
        config: Arc<EbayConfig>,
        http: Client,
        store: Arc<dyn TokenStore>,
        cache: FinancialCache,
        clock: Arc<dyn Clock>,
        scheduler: SchedulerSettings,
    ) -> Self {
        let endpoint: Arc<dyn TokenEndpoint> =
            Arc::new(EbayOAuthClient::new(http.clone(), config.clone()));
        let financials = standard_chain(&http, &config, endpoint.clone(), clock.clone());
        Self::new(config, endpoint, store, financials, cache, clock, scheduler)
    }

    pub fn scheduler(&self) -> Arc<RefreshScheduler> {
        self.scheduler.clone()
    }

    /// Starts the consent flow for `user_id`. The returned state is accepted
    /// once, for ten minutes.
    pub async fn authorization_url(&self, user_id: &str) -> Result<Authorization, GatewayError> {
        let user_id = non_empty(user_id, "user_id is required")?;
        let state = Uuid::new_v4().simple().to_string();
        let now = self.clock.now();

        let mut pending = self.pending.lock().await;
        pending.retain(|_, entry| !expired(entry, now));
        pending.insert(
            state.clone(),
            PendingAuth {
                user_id: user_id.to_string(),
                created_at: now,
            },
        );
        Ok(Authorization {
            authorization_url: self.config.consent_url(&state),
            state,
        })
    }

    /// Redeems the browser callback. Returns the user the token now belongs to.
    pub async fn complete_authorization(
        &self,
        state: &str,
        code: &str,
    ) -> Result<String, GatewayError> {
        let entry = self.pending.lock().await.remove(state);
        let Some(entry) = entry.filter(|entry| !expired(entry, self.clock.now())) else {
            warn!(target = "ledger.tokens", "authorization_state_rejected");
            return Err(GatewayError::InvalidState);
        };
        self.exchange_code(&entry.user_id, code).await?;
        Ok(entry.user_id)
    }

    /// Trades an authorization code for the user's first token pair.
    pub async fn exchange_code(
        &self,
        user_id: &str,
        code: &str,
    ) -> Result<TokenRecord, GatewayError> {
        let user_id = non_empty(user_id, "user_id is required")?;
        let code = non_empty(code, "authorization code is required")?;
        let grant = self.endpoint.exchange_code(code).await?;
        let record = self.refresher.store_grant(user_id, grant, None).await?;
        info!(
            target = "ledger.tokens",
            user_id,
            expires_at = %record.expires_at,
            "authorization_completed"
        );
        Ok(record)
    }

    /// Resolver with a session cache scoped to a single request, so other
    /// instances' writes to the durable store are seen on the next call.
    fn resolver(&self) -> TokenResolver {
        TokenResolver::new(
            Arc::new(MemoryTokenStore::new()),
            self.store.clone(),
            self.refresher.clone(),
            self.clock.clone(),
        )
    }

    pub async fn get_valid_token(&self, user_id: &str) -> Result<EbayToken, GatewayError> {
        Ok(self.resolver().get_valid_token(user_id).await?)
    }

    /// Stores a pasted Auth'n'Auth token. These carry no refresh token and
    /// are never refreshed.
    pub async fn store_legacy_token(
        &self,
        user_id: &str,
        token: &str,
    ) -> Result<(), GatewayError> {
        let user_id = non_empty(user_id, "user_id is required")?;
        let token = EbayToken::classify(token.trim());
        if !token.is_legacy() {
            return Err(GatewayError::InvalidInput("not a legacy auth token"));
        }
        let now = self.clock.now();
        let record = TokenRecord {
            user_id: user_id.to_string(),
            access_token: token.secret().to_string(),
            refresh_token: None,
            expires_at: now + TimeDelta::days(LEGACY_TOKEN_LIFETIME_DAYS),
            updated_at: now,
        };
        self.store.upsert(record).await?;
        info!(target = "ledger.tokens", user_id, "legacy_token_stored");
        Ok(())
    }

    /// Logout: drops stored tokens and cached financials. Returns whether a
    /// token existed.
    pub async fn clear_tokens(&self, user_id: &str) -> Result<bool, GatewayError> {
        let removed = self.store.delete(user_id).await?;
        self.cache.forget_user(user_id).await;
        info!(target = "ledger.tokens", user_id, removed, "tokens_cleared");
        Ok(removed)
    }

    pub async fn get_financials(
        &self,
        token: &EbayToken,
        item_id: &str,
    ) -> Result<FinancialRecord, GatewayError> {
        Ok(self.financials.fetch_financials(token, item_id).await?)
    }

    /// Resolves the user's token, then the sale's financials. The cache is
    /// only consulted once the user still holds a usable token.
    pub async fn financials_for_user(
        &self,
        user_id: &str,
        item_id: &str,
    ) -> Result<FinancialRecord, GatewayError> {
        let item_id = non_empty(item_id, "item id is required")?;
        let token = self.get_valid_token(user_id).await?;
        if let Some(record) = self.cache.get(user_id, item_id).await {
            return Ok(record);
        }
        let record = self.get_financials(&token, item_id).await?;
        self.cache.put(user_id, item_id, &record).await;
        Ok(record)
    }

    pub async fn force_refresh_all(&self) -> RefreshSummary {
        self.scheduler.force_refresh_all().await
    }

    pub async fn status(&self) -> Result<SchedulerStatus, GatewayError> {
        Ok(self.scheduler.status().await?)
    }
}

fn expired(entry: &PendingAuth, now: DateTime<Utc>) -> bool {
    now - entry.created_at >= TimeDelta::minutes(PENDING_STATE_MINUTES)
}

fn non_empty<'a>(value: &'a str, message: &'static str) -> Result<&'a str, GatewayError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(GatewayError::InvalidInput(message));
    }
    Ok(value)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::financials::{FetchError, FinancialSource, SaleFacts, SourceOutcome};
    use crate::tokens::refresher::tests::{FakeEndpoint, start};
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Source that always reports the same listing price.
    pub(crate) struct FixedPrice {
        pub price: f64,
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl FinancialSource for FixedPrice {
        fn name(&self) -> &'static str {
            "fixed"
        }

        async fn fetch(&self, _token: &EbayToken, _id: &str) -> Result<SourceOutcome, FetchError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(SourceOutcome::SaleOnly(SaleFacts {
                price: self.price,
                ..SaleFacts::default()
            }))
        }
    }

    pub(crate) struct Harness {
        pub gateway: EbayGateway,
        pub store: Arc<MemoryTokenStore>,
        pub endpoint: Arc<FakeEndpoint>,
        pub source: Arc<FixedPrice>,
        pub clock: Arc<MockClock>,
    }

    pub(crate) fn harness() -> Harness {
        harness_on(
            Arc::new(MemoryTokenStore::new()),
            Arc::new(MockClock::new(start())),
        )
    }

    /// Gateway over an existing durable store, as a second instance would be.
    fn harness_on(store: Arc<MemoryTokenStore>, clock: Arc<MockClock>) -> Harness {
        let endpoint = Arc::new(FakeEndpoint::ok());
        let source = Arc::new(FixedPrice {
            price: 1000.0,
            calls: AtomicUsize::new(0),
        });
        let gateway = EbayGateway::new(
            Arc::new(EbayConfig::for_tests("http://ebay.test")),
            endpoint.clone(),
            store.clone(),
            FinancialResolver::new(vec![source.clone()]),
            FinancialCache::memory(clock.clone(), 900),
            clock.clone(),
            SchedulerSettings::default(),
        );
        Harness {
            gateway,
            store,
            endpoint,
            source,
            clock,
        }
    }

    #[tokio::test]
    async fn consent_flow_makes_token_available() {
        let h = harness();
        let err = h.gateway.get_valid_token("42").await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Resolve(ResolveError::AuthRequired { .. })
        ));

        let auth = h.gateway.authorization_url("42").await.unwrap();
        assert!(auth.authorization_url.contains(&format!("state={}", auth.state)));
        let user = h
            .gateway
            .complete_authorization(&auth.state, "abc")
            .await
            .unwrap();
        assert_eq!(user, "42");

        let token = h.gateway.get_valid_token("42").await.unwrap();
        assert_eq!(token, EbayToken::OAuth("v^1.1#from-abc".into()));
        let stored = h.store.get("42").await.unwrap().unwrap();
        assert_eq!(stored.access_token, "v^1.1#from-abc");
        assert_eq!(stored.refresh_token.as_deref(), Some("refresh-abc"));
    }

    #[tokio::test]
    async fn authorization_state_is_single_use_and_expires() {
        let h = harness();
        let auth = h.gateway.authorization_url("42").await.unwrap();
        h.gateway
            .complete_authorization(&auth.state, "abc")
            .await
            .unwrap();
        let replay = h.gateway.complete_authorization(&auth.state, "abc").await;
        assert!(matches!(replay, Err(GatewayError::InvalidState)));

        let stale = h.gateway.authorization_url("42").await.unwrap();
        h.clock.advance(TimeDelta::minutes(11));
        let late = h.gateway.complete_authorization(&stale.state, "abc").await;
        assert!(matches!(late, Err(GatewayError::InvalidState)));
    }

    #[tokio::test]
    async fn expiring_token_is_refreshed_once() {
        let h = harness();
        h.store
            .upsert(TokenRecord {
                user_id: "42".into(),
                access_token: "v^1.1#old".into(),
                refresh_token: Some("refresh-0".into()),
                expires_at: start() + TimeDelta::minutes(5),
                updated_at: start(),
            })
            .await
            .unwrap();

        let token = h.gateway.get_valid_token("42").await.unwrap();
        assert_eq!(token.secret(), "v^1.1#refreshed-1");
        assert_eq!(h.endpoint.calls(), 1);
        let stored = h.store.get("42").await.unwrap().unwrap();
        assert!(stored.expires_at > start() + TimeDelta::minutes(5));
    }

    #[tokio::test]
    async fn legacy_tokens_are_stored_and_returned_verbatim() {
        let h = harness();
        h.gateway
            .store_legacy_token("42", " AgAAAA**legacy ")
            .await
            .unwrap();
        let token = h.gateway.get_valid_token("42").await.unwrap();
        assert_eq!(token, EbayToken::Legacy("AgAAAA**legacy".into()));

        let err = h
            .gateway
            .store_legacy_token("42", "v^1.1#oauth")
            .await
            .unwrap_err();
        assert!(matches!(err, GatewayError::InvalidInput(_)));
    }

    #[tokio::test]
    async fn financials_are_cached_per_user() {
        let h = harness();
        h.gateway
            .store_legacy_token("42", "AgAAAA**legacy")
            .await
            .unwrap();

        let first = h.gateway.financials_for_user("42", "1234").await.unwrap();
        let second = h.gateway.financials_for_user("42", "1234").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first.final_value_fee, 80.0);
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 1);

        h.clock.advance(TimeDelta::minutes(16));
        h.gateway.financials_for_user("42", "1234").await.unwrap();
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn clearing_tokens_requires_reauthorization() {
        let h = harness();
        let auth = h.gateway.authorization_url("42").await.unwrap();
        h.gateway
            .complete_authorization(&auth.state, "abc")
            .await
            .unwrap();

        assert!(h.gateway.clear_tokens("42").await.unwrap());
        assert!(!h.gateway.clear_tokens("42").await.unwrap());
        let err = h.gateway.get_valid_token("42").await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Resolve(ResolveError::AuthRequired { .. })
        ));
    }

    #[tokio::test]
    async fn logout_on_another_instance_is_seen_immediately() {
        let a = harness();
        let b = harness_on(a.store.clone(), a.clock.clone());
        a.gateway
            .store_legacy_token("42", "AgAAAA**legacy")
            .await
            .unwrap();
        assert!(a.gateway.get_valid_token("42").await.is_ok());

        assert!(b.gateway.clear_tokens("42").await.unwrap());
        a.clock.advance(TimeDelta::days(30));
        let err = a.gateway.get_valid_token("42").await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Resolve(ResolveError::AuthRequired { .. })
        ));
    }

    #[tokio::test]
    async fn reconsent_on_another_instance_replaces_token() {
        let a = harness();
        let b = harness_on(a.store.clone(), a.clock.clone());
        a.gateway
            .store_legacy_token("42", "AgAAAA**legacy")
            .await
            .unwrap();
        a.gateway.get_valid_token("42").await.unwrap();

        let auth = b.gateway.authorization_url("42").await.unwrap();
        b.gateway
            .complete_authorization(&auth.state, "abc")
            .await
            .unwrap();
        let token = a.gateway.get_valid_token("42").await.unwrap();
        assert_eq!(token, EbayToken::OAuth("v^1.1#from-abc".into()));
    }

    #[tokio::test]
    async fn cached_financials_are_withheld_after_logout() {
        let h = harness();
        h.gateway
            .store_legacy_token("42", "AgAAAA**legacy")
            .await
            .unwrap();
        h.gateway.financials_for_user("42", "1234").await.unwrap();

        let other = harness_on(h.store.clone(), h.clock.clone());
        other.gateway.clear_tokens("42").await.unwrap();
        let err = h.gateway.financials_for_user("42", "1234").await.unwrap_err();
        assert!(matches!(
            err,
            GatewayError::Resolve(ResolveError::AuthRequired { .. })
        ));
        assert_eq!(h.source.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn force_refresh_and_status_cover_all_users() {
        let h = harness();
        for user in ["a", "b"] {
            let auth = h.gateway.authorization_url(user).await.unwrap();
            h.gateway
                .complete_authorization(&auth.state, user)
                .await
                .unwrap();
        }

        let summary = h.gateway.force_refresh_all().await;
        assert_eq!(summary.refreshed_count, 2);
        assert_eq!(summary.failed_count, 0);

        let status = h.gateway.status().await.unwrap();
        assert_eq!(status.tokens.total_tokens, 2);
        assert_eq!(status.tokens.with_refresh_token, 2);
        assert_eq!(status.last_refreshed, 2);
    }

    #[tokio::test]
    async fn blank_identifiers_are_rejected() {
        let h = harness();
        assert!(matches!(
            h.gateway.authorization_url(" ").await,
            Err(GatewayError::InvalidInput(_))
        ));
        assert!(matches!(
            h.gateway.financials_for_user("42", "").await,
            Err(GatewayError::InvalidInput(_))
        ));
    }
}
