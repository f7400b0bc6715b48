use crate::clock::Clock;
use crate::ebay::EbayToken;
use crate::store::{StoreError, TokenStore};
use crate::tokens::refresher::{RefreshError, TokenRefresher};
use chrono::TimeDelta;
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Tokens expiring within this many minutes are refreshed before use.
pub const EXPIRY_BUFFER_MINUTES: i64 = 10;

#[derive(Debug, Error)]
pub enum ResolveError {
    /// The user must go through the OAuth consent flow again.
    #[error("ebay authorization required for user {user_id}")]
    AuthRequired { user_id: String },
    #[error("token storage unavailable: {0}")]
    Persistence(#[from] StoreError),
}

impl ResolveError {
    fn auth_required(user_id: &str) -> Self {
        Self::AuthRequired {
            user_id: user_id.to_string(),
        }
    }
}

/// Picks a usable access token for a user: session cache first, then the
/// durable store, refreshing when the token is inside the expiry buffer.
///
/// The session is meant to live for one request; the durable store stays the
/// authority on every refresh decision.
pub struct TokenResolver {
    session: Arc<dyn TokenStore>,
    store: Arc<dyn TokenStore>,
    refresher: Arc<TokenRefresher>,
    clock: Arc<dyn Clock>,
    buffer: TimeDelta,
}

impl TokenResolver {
    pub fn new(
        session: Arc<dyn TokenStore>,
        store: Arc<dyn TokenStore>,
        refresher: Arc<TokenRefresher>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            session,
            store,
            refresher,
            clock,
            buffer: TimeDelta::minutes(EXPIRY_BUFFER_MINUTES),
        }
    }

    pub async fn get_valid_token(&self, user_id: &str) -> Result<EbayToken, ResolveError> {
        let record = match self.session.get(user_id).await? {
            Some(record) => record,
            None => match self.store.get(user_id).await? {
                Some(record) => {
                    debug!(target = "ledger.tokens", user_id, "session_populated_from_store");
                    self.session.upsert(record.clone()).await?;
                    record
                }
                None => return Err(ResolveError::auth_required(user_id)),
            },
        };

        let token = EbayToken::classify(record.access_token.as_str());
        if token.is_legacy() || record.is_fresh(self.clock.now(), self.buffer) {
            return Ok(token);
        }

        // the refresher re-reads the durable record, which may be newer than
        // the session copy
        match self.refresher.refresh_if_expiring(user_id, self.buffer).await {
            Ok(fresh) => {
                self.session.upsert(fresh.clone()).await?;
                Ok(EbayToken::classify(fresh.access_token))
            }
            Err(RefreshError::Store(err)) => Err(ResolveError::Persistence(err)),
            Err(err) => {
                warn!(target = "ledger.tokens", user_id, error = %err, "token_unusable");
                self.session.delete(user_id).await?;
                Err(ResolveError::auth_required(user_id))
            }
        }
    }
}
