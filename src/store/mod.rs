pub mod mem;
pub mod postgres;

pub use mem::MemoryTokenStore;
pub use postgres::PostgresTokenStore;

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde::Serialize;
use thiserror::Error;

/// The single OAuth token record owned by one user.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenRecord {
    pub user_id: String,
    pub access_token: String,
    pub refresh_token: Option<String>,
    pub expires_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TokenRecord {
    /// True when the token is still usable `buffer` from `now`.
    pub fn is_fresh(&self, now: DateTime<Utc>, buffer: TimeDelta) -> bool {
        now < self.expires_at - buffer
    }

    pub fn has_refresh_token(&self) -> bool {
        self.refresh_token
            .as_deref()
            .is_some_and(|token| !token.trim().is_empty())
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct TokenStats {
    pub total_tokens: u64,
    pub with_refresh_token: u64,
    pub expiring_soon: u64,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("no user id resolvable for token record")]
    MissingUser,
    #[error("database error: {0}")]
    Database(String),
}

impl StoreError {
    pub fn database(message: impl Into<String>) -> Self {
        Self::Database(message.into())
    }
}

/// Persists one token record per user.
///
/// Implemented by the durable Postgres store and by the short-lived session
/// cache; the resolver consumes both through this interface.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Inserts or replaces the record for `record.user_id`.
    ///
    /// # Errors
    /// `StoreError::MissingUser` when the user id is blank, database errors otherwise.
    async fn upsert(&self, record: TokenRecord) -> Result<(), StoreError>;

    async fn get(&self, user_id: &str) -> Result<Option<TokenRecord>, StoreError>;

    /// Removes the record. Returns whether one existed.
    async fn delete(&self, user_id: &str) -> Result<bool, StoreError>;

    /// Records holding a refresh token, optionally restricted to those
    /// expiring before `cutoff`.
    async fn refreshable(
        &self,
        expiring_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<TokenRecord>, StoreError>;

    async fn stats(&self, expiring_before: DateTime<Utc>) -> Result<TokenStats, StoreError>;
}

pub(crate) fn ensure_user(user_id: &str) -> Result<(), StoreError> {
    if user_id.trim().is_empty() {
        return Err(StoreError::MissingUser);
    }
    Ok(())
}
