use crate::clock::Clock;
use crate::financials::FinancialRecord;
use chrono::{DateTime, TimeDelta, Utc};
use redis::AsyncCommands;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;
use urlencoding::encode;

const SCAN_BATCH: usize = 100;

/// Short-lived cache of resolved financial records, keyed per user and item.
/// Uses redis when configured and an in-process map otherwise.
pub struct FinancialCache {
    backend: Backend,
    ttl_secs: u64,
}

enum Backend {
    Redis(redis::Client),
    Memory {
        clock: Arc<dyn Clock>,
        entries: Mutex<HashMap<String, (DateTime<Utc>, FinancialRecord)>>,
    },
}

/// Key prefix for one user. The id is percent-encoded so it never contains
/// the `:` separator or a SCAN glob character.
fn user_prefix(user_id: &str) -> String {
    format!("financials:{}:", encode(user_id))
}

fn key(user_id: &str, item_id: &str) -> String {
    format!("{}{item_id}", user_prefix(user_id))
}

impl FinancialCache {
    pub fn redis(client: redis::Client, ttl_secs: u64) -> Self {
        Self {
            backend: Backend::Redis(client),
            ttl_secs,
        }
    }

    pub fn memory(clock: Arc<dyn Clock>, ttl_secs: u64) -> Self {
        Self {
            backend: Backend::Memory {
                clock,
                entries: Mutex::new(HashMap::new()),
            },
            ttl_secs,
        }
    }

    pub async fn get(&self, user_id: &str, item_id: &str) -> Option<FinancialRecord> {
        if self.ttl_secs == 0 {
            return None;
        }
        let key = key(user_id, item_id);
        let found = match &self.backend {
            Backend::Redis(client) => redis_get(client, &key).await,
            Backend::Memory { clock, entries } => {
                let mut entries = entries.lock().await;
                match entries.get(&key) {
                    Some((expires_at, record)) if clock.now() < *expires_at => Some(record.clone()),
                    Some(_) => {
                        entries.remove(&key);
                        None
                    }
                    None => None,
                }
            }
        };
        crate::metrics::cache_lookup(found.is_some());
        found
    }

    pub async fn put(&self, user_id: &str, item_id: &str, record: &FinancialRecord) {
        if self.ttl_secs == 0 {
            return;
        }
        let key = key(user_id, item_id);
        match &self.backend {
            Backend::Redis(client) => redis_set(client, &key, record, self.ttl_secs).await,
            Backend::Memory { clock, entries } => {
                let expires_at = clock.now() + TimeDelta::seconds(self.ttl_secs as i64);
                let mut entries = entries.lock().await;
                entries.retain(|_, (at, _)| clock.now() < *at);
                entries.insert(key, (expires_at, record.clone()));
            }
        }
    }

    /// Drops every cached record for `user_id`.
    pub async fn forget_user(&self, user_id: &str) {
        let prefix = user_prefix(user_id);
        match &self.backend {
            Backend::Redis(client) => {
                if let Err(err) = redis_forget(client, &prefix).await {
                    debug!(target = "ledger.financials", user_id, error = %err, "cache_purge_failed");
                }
            }
            Backend::Memory { entries, .. } => {
                entries.lock().await.retain(|key, _| !key.starts_with(&prefix));
            }
        }
    }
}

async fn redis_get(client: &redis::Client, key: &str) -> Option<FinancialRecord> {
    let mut conn = match client.get_multiplexed_async_connection().await {
        Ok(c) => c,
        Err(err) => {
            debug!(target = "ledger.financials", error = %err, "cache_unavailable");
            return None;
        }
    };
    let raw: Option<String> = conn.get(key).await.ok();
    raw.and_then(|v| serde_json::from_str(&v).ok())
}

async fn redis_set(client: &redis::Client, key: &str, value: &FinancialRecord, ttl_secs: u64) {
    if let Ok(mut conn) = client.get_multiplexed_async_connection().await
        && let Ok(json) = serde_json::to_string(value)
    {
        let _: Result<(), _> = conn.set_ex(key, json, ttl_secs).await;
    }
}

async fn redis_forget(client: &redis::Client, prefix: &str) -> redis::RedisResult<()> {
    let mut conn = client.get_multiplexed_async_connection().await?;
    let pattern = format!("{prefix}*");
    let mut cursor: u64 = 0;
    loop {
        let (next, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .arg(cursor)
            .arg("MATCH")
            .arg(&pattern)
            .arg("COUNT")
            .arg(SCAN_BATCH)
            .query_async(&mut conn)
            .await?;
        if !keys.is_empty() {
            let _: () = conn.del(keys).await?;
        }
        if next == 0 {
            return Ok(());
        }
        cursor = next;
    }
}
