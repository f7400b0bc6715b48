use crate::store::{StoreError, TokenRecord, TokenStats, TokenStore, ensure_user};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{PgPool, Row, postgres::PgRow};

/// Durable token store on the `ebay_tokens` table, one row per user.
///
/// Concurrent writers rely on row-level locking; the last upsert wins.
#[derive(Clone)]
pub struct PostgresTokenStore {
    pool: PgPool,
}

impl PostgresTokenStore {
    pub async fn connect(database_url: &str) -> Result<Self, StoreError> {
        let pool = sqlx::postgres::PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await
            .map_err(|e| StoreError::database(format!("failed to connect: {e}")))?;
        Ok(Self { pool })
    }

    /// Creates the table and expiry index if they are missing.
    pub async fn initialize(&self) -> Result<(), StoreError> {
        sqlx::query(
            "CREATE TABLE IF NOT EXISTS ebay_tokens (
                user_id TEXT PRIMARY KEY,
                access_token TEXT NOT NULL,
                refresh_token TEXT NULL,
                expires_at TIMESTAMP WITH TIME ZONE NOT NULL,
                updated_at TIMESTAMP WITH TIME ZONE NOT NULL
            )",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("failed to create ebay_tokens: {e}")))?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_ebay_tokens_expires_at ON ebay_tokens(expires_at)",
        )
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("failed to create expires_at index: {e}")))?;
        Ok(())
    }
}

fn record_from_row(row: &PgRow) -> Result<TokenRecord, StoreError> {
    let read = |e: sqlx::Error| StoreError::database(format!("failed to decode row: {e}"));
    Ok(TokenRecord {
        user_id: row.try_get("user_id").map_err(read)?,
        access_token: row.try_get("access_token").map_err(read)?,
        refresh_token: row.try_get("refresh_token").map_err(read)?,
        expires_at: row.try_get("expires_at").map_err(read)?,
        updated_at: row.try_get("updated_at").map_err(read)?,
    })
}

#[async_trait]
impl TokenStore for PostgresTokenStore {
    async fn upsert(&self, record: TokenRecord) -> Result<(), StoreError> {
        ensure_user(&record.user_id)?;
        sqlx::query(
            "INSERT INTO ebay_tokens (user_id, access_token, refresh_token, expires_at, updated_at)
             VALUES ($1, $2, $3, $4, $5)
             ON CONFLICT (user_id) DO UPDATE SET
                access_token = EXCLUDED.access_token,
                refresh_token = EXCLUDED.refresh_token,
                expires_at = EXCLUDED.expires_at,
                updated_at = EXCLUDED.updated_at",
        )
        .bind(&record.user_id)
        .bind(&record.access_token)
        .bind(&record.refresh_token)
        .bind(record.expires_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("failed to upsert token: {e}")))?;
        Ok(())
    }

    async fn get(&self, user_id: &str) -> Result<Option<TokenRecord>, StoreError> {
        let row = sqlx::query(
            "SELECT user_id, access_token, refresh_token, expires_at, updated_at
             FROM ebay_tokens WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("failed to fetch token: {e}")))?;
        row.as_ref().map(record_from_row).transpose()
    }

    async fn delete(&self, user_id: &str) -> Result<bool, StoreError> {
        let result = sqlx::query("DELETE FROM ebay_tokens WHERE user_id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await
            .map_err(|e| StoreError::database(format!("failed to delete token: {e}")))?;
        Ok(result.rows_affected() > 0)
    }

    async fn refreshable(
        &self,
        expiring_before: Option<DateTime<Utc>>,
    ) -> Result<Vec<TokenRecord>, StoreError> {
        let rows = sqlx::query(
            "SELECT user_id, access_token, refresh_token, expires_at, updated_at
             FROM ebay_tokens
             WHERE refresh_token IS NOT NULL AND refresh_token <> ''
               AND ($1::timestamptz IS NULL OR expires_at < $1)
             ORDER BY expires_at",
        )
        .bind(expiring_before)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("failed to list tokens: {e}")))?;
        rows.iter().map(record_from_row).collect()
    }

    async fn stats(&self, expiring_before: DateTime<Utc>) -> Result<TokenStats, StoreError> {
        let row = sqlx::query(
            "SELECT COUNT(*) AS total,
                    COUNT(*) FILTER (WHERE refresh_token IS NOT NULL AND refresh_token <> '') AS with_refresh,
                    COUNT(*) FILTER (WHERE expires_at < $1) AS expiring
             FROM ebay_tokens",
        )
        .bind(expiring_before)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| StoreError::database(format!("failed to count tokens: {e}")))?;
        let count = |name: &str| -> Result<u64, StoreError> {
            let value: i64 = row
                .try_get(name)
                .map_err(|e| StoreError::database(format!("failed to decode {name}: {e}")))?;
            Ok(value.max(0) as u64)
        };
        Ok(TokenStats {
            total_tokens: count("total")?,
            with_refresh_token: count("with_refresh")?,
            expiring_soon: count("expiring")?,
        })
    }
}
