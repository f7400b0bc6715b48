use crate::store::{StoreError, TokenRecord, TokenStats, TokenStore, ensure_user};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use tokio::sync::RwLock;

/// Token store kept in process memory.
///
/// Serves as the session cache in front of the durable store, and as the
/// durable store itself when no database is configured.
#[derive(Default)]
pub struct MemoryTokenStore {
    records: RwLock<HashMap<String, TokenRecord>>,
}

impl MemoryTokenStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TokenStore for MemoryTokenStore {
    async fn upsert(&self, record: TokenRecord) -> Result<(), StoreError> {
        ensure_user(&record.user_id)?;
        self.records
            .write()
            .await
            .insert(record.user_id.clone(), record);
        Ok(())
    }

    async fn get(&self, user_id: &str) -> Result<Option<TokenRecord>, StoreError> {
        Ok(self.records.read().await.get(user_id).cloned())
    }

    async fn delete(&self, user_id: &str) -> Result<bool, StoreError> {
        Ok(self.records.write().await.remove(user_id).is_some())
    }

    async fn refreshable(
        &self,
        expiring_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<TokenRecord>, StoreError> {
        let guard = self.records.read().await;
        let mut records: Vec<TokenRecord> = guard
            .values()
            .filter(|record| record.has_refresh_token())
            .filter(|record| expiring_before.is_none_or(|cutoff| record.expires_at < cutoff))
            .cloned()
            .collect();
        records.sort_by_key(|record| record.expires_at);
        Ok(records)
    }

    async fn stats(&self, expiring_before: DateTime<Utc>) -> Result<TokenStats, StoreError> {
        let guard = self.records.read().await;
        let mut stats = TokenStats::default();
        for record in guard.values() {
            stats.total_tokens += 1;
            if record.has_refresh_token() {
                stats.with_refresh_token += 1;
            }
            if record.expires_at < expiring_before {
                stats.expiring_soon += 1;
            }
        }
        Ok(stats)
    }
}
