//! `PostgreSQL`-backed attempt store.
//!
//! Attempts live in an append-only table indexed by `(identifier, attempted_at)`;
//! lockouts live in a table keyed by the lockout key and are written with an
//! upsert, so the last write wins.
//!
//! # Table Schema
//!
//! ```sql
//! CREATE TABLE auth_attempts (
//!     id BIGSERIAL PRIMARY KEY,
//!     identifier TEXT NOT NULL,
//!     attempted_at BIGINT NOT NULL,
//!     expires_at BIGINT NOT NULL
//! );
//! CREATE INDEX idx_auth_attempts_identifier_time ON auth_attempts (identifier, attempted_at);
//! CREATE INDEX idx_auth_attempts_expires_at ON auth_attempts (expires_at);
//!
//! CREATE TABLE auth_lockouts (
//!     identifier TEXT PRIMARY KEY,
//!     set_at BIGINT NOT NULL,
//!     lockout_until BIGINT NOT NULL,
//!     expires_at BIGINT NOT NULL
//! );
//! ```

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;
use tracing::error;

use super::{ttl_to_i64, AttemptStore, LockoutRecord, StoreError};
use crate::ratelimit::Identifier;

const SCHEMA: &[&str] = &[
    r"CREATE TABLE IF NOT EXISTS auth_attempts (
        id BIGSERIAL PRIMARY KEY,
        identifier TEXT NOT NULL,
        attempted_at BIGINT NOT NULL,
        expires_at BIGINT NOT NULL
    )",
    r"CREATE INDEX IF NOT EXISTS idx_auth_attempts_identifier_time
        ON auth_attempts (identifier, attempted_at)",
    "CREATE INDEX IF NOT EXISTS idx_auth_attempts_expires_at ON auth_attempts (expires_at)",
    r"CREATE TABLE IF NOT EXISTS auth_lockouts (
        identifier TEXT PRIMARY KEY,
        set_at BIGINT NOT NULL,
        lockout_until BIGINT NOT NULL,
        expires_at BIGINT NOT NULL
    )",
];

fn db_error(operation: &'static str, err: sqlx::Error) -> StoreError {
    error!(operation = operation, error = %err, "Database error");
    StoreError::unavailable(operation, err)
}

#[derive(sqlx::FromRow)]
struct LockoutRow {
    identifier: String,
    set_at: i64,
    lockout_until: i64,
    expires_at: i64,
}

/// Attempt store shared by every instance pointing at the same database.
#[derive(Clone)]
pub struct PostgresAttemptStore {
    pool: PgPool,
}

impl PostgresAttemptStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Open a connection pool for `database_url`.
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .connect(database_url)
            .await
            .map_err(|e| db_error("connect", e))?;
        Ok(Self::new(pool))
    }

    /// Create the tables and indexes if they do not exist yet.
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        for statement in SCHEMA {
            sqlx::query(*statement)
                .execute(&self.pool)
                .await
                .map_err(|e| db_error("ensure_schema", e))?;
        }
        Ok(())
    }

    /// Delete attempts and lockouts whose expiry instant has passed.
    ///
    /// Call this periodically to bound table growth.
    pub async fn purge_expired(&self, now: i64) -> Result<u64, StoreError> {
        let attempts = sqlx::query("DELETE FROM auth_attempts WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("purge_expired", e))?;

        let lockouts = sqlx::query("DELETE FROM auth_lockouts WHERE expires_at <= $1")
            .bind(now)
            .execute(&self.pool)
            .await
            .map_err(|e| db_error("purge_expired", e))?;

        Ok(attempts.rows_affected() + lockouts.rows_affected())
    }
}

#[async_trait]
impl AttemptStore for PostgresAttemptStore {
    async fn count_since(
        &self,
        identifier: &Identifier,
        window_start: i64,
    ) -> Result<u64, StoreError> {
        let count: i64 = sqlx::query_scalar(
            "SELECT COUNT(*) FROM auth_attempts WHERE identifier = $1 AND attempted_at >= $2",
        )
        .bind(identifier.storage_key())
        .bind(window_start)
        .fetch_one(&self.pool)
        .await
        .map_err(|e| db_error("count_since", e))?;

        Ok(u64::try_from(count).unwrap_or(0))
    }

    async fn append(
        &self,
        identifier: &Identifier,
        timestamp: i64,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        sqlx::query(
            "INSERT INTO auth_attempts (identifier, attempted_at, expires_at) VALUES ($1, $2, $3)",
        )
        .bind(identifier.storage_key())
        .bind(timestamp)
        .bind(timestamp.saturating_add(ttl_to_i64(ttl_secs)))
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("append", e))?;

        Ok(())
    }

    async fn get_lockout(
        &self,
        identifier: &Identifier,
    ) -> Result<Option<LockoutRecord>, StoreError> {
        let row: Option<LockoutRow> = sqlx::query_as(
            r"
            SELECT identifier, set_at, lockout_until, expires_at
            FROM auth_lockouts
            WHERE identifier = $1
            ",
        )
        .bind(identifier.lockout_key())
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_error("get_lockout", e))?;

        Ok(row.map(|r| LockoutRecord {
            identifier: r.identifier,
            set_at: r.set_at,
            lockout_until: r.lockout_until,
            expires_at: r.expires_at,
        }))
    }

    async fn set_lockout(
        &self,
        identifier: &Identifier,
        now: i64,
        lockout_secs: u64,
    ) -> Result<(), StoreError> {
        let until = now.saturating_add(ttl_to_i64(lockout_secs));
        let record = LockoutRecord::new(identifier, now, until);

        sqlx::query(
            r"
            INSERT INTO auth_lockouts (identifier, set_at, lockout_until, expires_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (identifier) DO UPDATE SET
                set_at = EXCLUDED.set_at,
                lockout_until = EXCLUDED.lockout_until,
                expires_at = EXCLUDED.expires_at
            ",
        )
        .bind(&record.identifier)
        .bind(record.set_at)
        .bind(record.lockout_until)
        .bind(record.expires_at)
        .execute(&self.pool)
        .await
        .map_err(|e| db_error("set_lockout", e))?;

        Ok(())
    }
}
