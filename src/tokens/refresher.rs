use crate::clock::Clock;
use crate::ebay::{EbayAuthError, TokenEndpoint, TokenGrant};
use crate::store::{StoreError, TokenRecord, TokenStore};
use chrono::TimeDelta;
use std::{
    collections::HashMap,
    sync::{Arc, Mutex},
};
use thiserror::Error;
use tracing::{info, warn};

#[derive(Debug, Error)]
pub enum RefreshError {
    #[error("no token stored for user {0}")]
    NotFound(String),
    #[error("no refresh token stored for user {0}")]
    NoRefreshToken(String),
    #[error(transparent)]
    Provider(#[from] EbayAuthError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Exchanges refresh tokens for new access tokens and writes the result
/// through to the durable store.
///
/// Refreshes for the same user run one at a time.
pub struct TokenRefresher {
    endpoint: Arc<dyn TokenEndpoint>,
    store: Arc<dyn TokenStore>,
    clock: Arc<dyn Clock>,
    locks: UserLocks,
}

impl TokenRefresher {
    pub fn new(
        endpoint: Arc<dyn TokenEndpoint>,
        store: Arc<dyn TokenStore>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            endpoint,
            store,
            clock,
            locks: UserLocks::default(),
        }
    }

    /// Unconditionally refreshes `user_id` with `refresh_token`.
    pub async fn refresh(
        &self,
        user_id: &str,
        refresh_token: &str,
    ) -> Result<TokenRecord, RefreshError> {
        let lock = self.locks.for_user(user_id);
        let _guard = lock.lock().await;
        self.refresh_locked(user_id, refresh_token).await
    }

    /// Refreshes only if the durable record is still inside `buffer` once the
    /// user's lock is held; a concurrent caller may already have done it.
    pub async fn refresh_if_expiring(
        &self,
        user_id: &str,
        buffer: TimeDelta,
    ) -> Result<TokenRecord, RefreshError> {
        let lock = self.locks.for_user(user_id);
        let _guard = lock.lock().await;

        let current = self
            .store
            .get(user_id)
            .await?
            .ok_or_else(|| RefreshError::NotFound(user_id.to_string()))?;
        if current.is_fresh(self.clock.now(), buffer) {
            return Ok(current);
        }
        let refresh_token = current
            .refresh_token
            .filter(|token| !token.trim().is_empty())
            .ok_or_else(|| RefreshError::NoRefreshToken(user_id.to_string()))?;
        self.refresh_locked(user_id, &refresh_token).await
    }

    /// Persists a grant obtained outside the refresh path (code exchange).
    pub async fn store_grant(
        &self,
        user_id: &str,
        grant: TokenGrant,
        previous_refresh_token: Option<&str>,
    ) -> Result<TokenRecord, RefreshError> {
        let now = self.clock.now();
        let expires_at = grant.expires_at(now)?;
        let record = TokenRecord {
            user_id: user_id.to_string(),
            access_token: grant.access_token,
            refresh_token: grant
                .refresh_token
                .filter(|token| !token.trim().is_empty())
                .or_else(|| previous_refresh_token.map(str::to_string)),
            expires_at,
            updated_at: now,
        };
        self.store.upsert(record.clone()).await?;
        Ok(record)
    }

    async fn refresh_locked(
        &self,
        user_id: &str,
        refresh_token: &str,
    ) -> Result<TokenRecord, RefreshError> {
        let grant = match self.endpoint.refresh(refresh_token).await {
            Ok(grant) => grant,
            Err(err) => {
                crate::metrics::refresh_outcome(false);
                warn!(target = "ledger.tokens", user_id, error = %err, "token_refresh_failed");
                return Err(err.into());
            }
        };
        let record = self.store_grant(user_id, grant, Some(refresh_token)).await?;
        crate::metrics::refresh_outcome(true);
        info!(
            target = "ledger.tokens",
            user_id,
            expires_at = %record.expires_at,
            "token_refreshed"
        );
        Ok(record)
    }
}

#[derive(Default)]
struct UserLocks {
    inner: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
}

impl UserLocks {
    fn for_user(&self, user_id: &str) -> Arc<tokio::sync::Mutex<()>> {
        let mut map = self
            .inner
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        // drop locks nobody is holding or waiting on
        map.retain(|_, lock| Arc::strong_count(lock) > 1);
        map.entry(user_id.to_string()).or_default().clone()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::store::MemoryTokenStore;
    use async_trait::async_trait;
    use chrono::{DateTime, Utc};
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Token endpoint double that hands out numbered tokens.
    pub(crate) struct FakeEndpoint {
        pub calls: AtomicUsize,
        pub fail: bool,
        pub rotate: bool,
    }

    impl FakeEndpoint {
        pub fn ok() -> Self {
            Self {
                calls: AtomicUsize::new(0),
                fail: false,
                rotate: true,
            }
        }

        pub fn failing() -> Self {
            Self {
                fail: true,
                ..Self::ok()
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl TokenEndpoint for FakeEndpoint {
        async fn exchange_code(&self, code: &str) -> Result<TokenGrant, EbayAuthError> {
            Ok(TokenGrant {
                access_token: format!("v^1.1#from-{code}"),
                refresh_token: Some(format!("refresh-{code}")),
                expires_in: 7200,
                token_type: None,
            })
        }

        async fn refresh(&self, refresh_token: &str) -> Result<TokenGrant, EbayAuthError> {
            let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
            if self.fail {
                return Err(EbayAuthError::Provider {
                    status: 400,
                    message: "invalid_grant".into(),
                });
            }
            Ok(TokenGrant {
                access_token: format!("v^1.1#refreshed-{n}"),
                refresh_token: self.rotate.then(|| format!("{refresh_token}-r{n}")),
                expires_in: 7200,
                token_type: None,
            })
        }

        async fn app_token(&self) -> Result<TokenGrant, EbayAuthError> {
            Ok(TokenGrant {
                access_token: "app-token".into(),
                refresh_token: None,
                expires_in: 7200,
                token_type: None,
            })
        }
    }

    pub(crate) fn start() -> DateTime<Utc> {
        DateTime::parse_from_rfc3339("2026-03-01T12:00:00Z")
            .unwrap()
            .with_timezone(&Utc)
    }

    fn setup(endpoint: Arc<FakeEndpoint>) -> (TokenRefresher, Arc<MemoryTokenStore>) {
        let store = Arc::new(MemoryTokenStore::new());
        let clock = Arc::new(MockClock::new(start()));
        (TokenRefresher::new(endpoint, store.clone(), clock), store)
    }

    fn stored(user: &str, expires_in_min: i64) -> TokenRecord {
        TokenRecord {
            user_id: user.into(),
            access_token: "v^1.1#old".into(),
            refresh_token: Some("refresh-0".into()),
            expires_at: start() + TimeDelta::minutes(expires_in_min),
            updated_at: start(),
        }
    }

    #[tokio::test]
    async fn refresh_writes_through_to_store() {
        let endpoint = Arc::new(FakeEndpoint::ok());
        let (refresher, store) = setup(endpoint.clone());

        let record = refresher.refresh("42", "refresh-0").await.unwrap();
        assert_eq!(record.access_token, "v^1.1#refreshed-1");
        assert_eq!(record.refresh_token.as_deref(), Some("refresh-0-r1"));
        assert_eq!(record.expires_at, start() + TimeDelta::seconds(7200));
        assert_eq!(store.get("42").await.unwrap(), Some(record));
    }

    #[tokio::test]
    async fn unrotated_refresh_token_is_kept() {
        let endpoint = Arc::new(FakeEndpoint {
            rotate: false,
            ..FakeEndpoint::ok()
        });
        let (refresher, _) = setup(endpoint);
        let record = refresher.refresh("42", "refresh-0").await.unwrap();
        assert_eq!(record.refresh_token.as_deref(), Some("refresh-0"));
    }

    #[tokio::test]
    async fn store_reflects_most_recent_refresh() {
        let endpoint = Arc::new(FakeEndpoint::ok());
        let (refresher, store) = setup(endpoint.clone());

        let first = refresher.refresh("42", "refresh-0").await.unwrap();
        let second = refresher.refresh("42", "refresh-0").await.unwrap();
        assert_ne!(first.access_token, second.access_token);
        assert_eq!(endpoint.calls(), 2);
        assert_eq!(store.get("42").await.unwrap(), Some(second));
    }

    #[tokio::test]
    async fn provider_failure_leaves_store_untouched() {
        let endpoint = Arc::new(FakeEndpoint::failing());
        let (refresher, store) = setup(endpoint);
        store.upsert(stored("42", 5)).await.unwrap();

        let err = refresher.refresh("42", "refresh-0").await.unwrap_err();
        assert!(matches!(err, RefreshError::Provider(_)));
        assert_eq!(store.get("42").await.unwrap(), Some(stored("42", 5)));
    }

    #[tokio::test]
    async fn unrepresentable_expiry_is_rejected_without_writing() {
        let endpoint = Arc::new(FakeEndpoint::ok());
        let (refresher, store) = setup(endpoint);
        store.upsert(stored("42", 5)).await.unwrap();

        let grant = TokenGrant {
            access_token: "v^1.1#x".into(),
            refresh_token: None,
            expires_in: i64::MAX,
            token_type: None,
        };
        let err = refresher.store_grant("42", grant, None).await.unwrap_err();
        assert!(matches!(
            err,
            RefreshError::Provider(EbayAuthError::Malformed(_))
        ));
        assert_eq!(store.get("42").await.unwrap(), Some(stored("42", 5)));
    }

    #[tokio::test]
    async fn refresh_if_expiring_skips_fresh_record() {
        let endpoint = Arc::new(FakeEndpoint::ok());
        let (refresher, store) = setup(endpoint.clone());
        store.upsert(stored("42", 60)).await.unwrap();

        let record = refresher
            .refresh_if_expiring("42", TimeDelta::minutes(10))
            .await
            .unwrap();
        assert_eq!(record.access_token, "v^1.1#old");
        assert_eq!(endpoint.calls(), 0);
    }

    #[tokio::test]
    async fn concurrent_expiring_refreshes_call_provider_once() {
        let endpoint = Arc::new(FakeEndpoint::ok());
        let (refresher, store) = setup(endpoint.clone());
        store.upsert(stored("42", 5)).await.unwrap();
        let refresher = Arc::new(refresher);

        let a = {
            let refresher = refresher.clone();
            tokio::spawn(async move {
                refresher
                    .refresh_if_expiring("42", TimeDelta::minutes(10))
                    .await
            })
        };
        let b = {
            let refresher = refresher.clone();
            tokio::spawn(async move {
                refresher
                    .refresh_if_expiring("42", TimeDelta::minutes(10))
                    .await
            })
        };
        let a = a.await.unwrap().unwrap();
        let b = b.await.unwrap().unwrap();
        assert_eq!(a.access_token, b.access_token);
        assert_eq!(endpoint.calls(), 1);
    }

    #[tokio::test]
    async fn refresh_if_expiring_requires_refresh_token() {
        let endpoint = Arc::new(FakeEndpoint::ok());
        let (refresher, store) = setup(endpoint.clone());
        let mut record = stored("42", 5);
        record.refresh_token = None;
        store.upsert(record).await.unwrap();

        let err = refresher
            .refresh_if_expiring("42", TimeDelta::minutes(10))
            .await
            .unwrap_err();
        assert!(matches!(err, RefreshError::NoRefreshToken(_)));
        assert_eq!(endpoint.calls(), 0);
    }
}
