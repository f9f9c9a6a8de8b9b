//! Attempt store contract and adapters.
//!
//! The engine only needs four operations from storage: append an attempt,
//! count attempts since a bound, and read/write a per-identifier lockout.
//! Every write is an independent insert or a keyed upsert, so concurrent
//! checks never need a read-modify-write cycle on shared state.

mod memory;
#[cfg(feature = "postgres")]
mod postgres;

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::ratelimit::Identifier;

pub use memory::MemoryAttemptStore;
#[cfg(feature = "postgres")]
pub use postgres::PostgresAttemptStore;

/// Failures reported by an attempt store.
#[derive(Debug, Error)]
pub enum StoreError {
    /// The backend could not serve the request
    #[error("attempt store unavailable during {operation}: {reason}")]
    Unavailable {
        operation: &'static str,
        reason: String,
    },

    /// The backend did not answer within the configured deadline
    #[error("attempt store timed out during {operation} after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },
}

impl StoreError {
    pub fn unavailable(operation: &'static str, reason: impl ToString) -> Self {
        StoreError::Unavailable {
            operation,
            reason: reason.to_string(),
        }
    }
}

/// One recorded authentication attempt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AttemptRecord {
    pub identifier: String,
    pub timestamp: i64,
    pub expires_at: i64,
}

/// Lockout state for one identifier, keyed by `lockout:<identifier>`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LockoutRecord {
    pub identifier: String,
    pub set_at: i64,
    pub lockout_until: i64,
    pub expires_at: i64,
}

impl LockoutRecord {
    pub fn new(identifier: &Identifier, now: i64, lockout_until: i64) -> Self {
        Self {
            identifier: identifier.lockout_key(),
            set_at: now,
            lockout_until,
            expires_at: lockout_until,
        }
    }

    pub fn is_active(&self, now: i64) -> bool {
        self.lockout_until > now
    }
}

/// Storage collaborator consumed by the rate limiter engine.
///
/// Implementations must tolerate concurrent calls for the same identifier and
/// must make every `append` visible to subsequent `count_since` calls on the
/// same backend. Physical expiry of records is best-effort; callers always
/// filter by timestamp.
#[async_trait]
pub trait AttemptStore: Send + Sync {
    /// Count attempts for `identifier` with `timestamp >= window_start`.
    async fn count_since(
        &self,
        identifier: &Identifier,
        window_start: i64,
    ) -> Result<u64, StoreError>;

    /// Record one attempt at `timestamp`, physically expiring `ttl_secs` later.
    async fn append(
        &self,
        identifier: &Identifier,
        timestamp: i64,
        ttl_secs: u64,
    ) -> Result<(), StoreError>;

    /// Read the lockout record for `identifier`, active or not.
    async fn get_lockout(
        &self,
        identifier: &Identifier,
    ) -> Result<Option<LockoutRecord>, StoreError>;

    /// Upsert the lockout for `identifier` to end `lockout_secs` after `now`.
    async fn set_lockout(
        &self,
        identifier: &Identifier,
        now: i64,
        lockout_secs: u64,
    ) -> Result<(), StoreError>;
}

pub(crate) fn ttl_to_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}
