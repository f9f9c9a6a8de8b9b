//! In-process attempt store backed by concurrent hash maps.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{ttl_to_i64, AttemptRecord, AttemptStore, LockoutRecord, StoreError};
use crate::ratelimit::{Clock, Identifier};

/// Attempt store that keeps records in memory.
///
/// Suitable for a single instance or for tests. Records carry an expiry
/// instant like any other backend; `purge_expired` (or the sweeper started by
/// `spawn_sweeper`) physically removes them.
#[derive(Debug, Default)]
pub struct MemoryAttemptStore {
    /// Attempt records indexed by identifier storage key
    attempts: DashMap<String, Vec<AttemptRecord>>,
    /// Lockout records indexed by lockout key
    lockouts: DashMap<String, LockoutRecord>,
}

impl MemoryAttemptStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Remove every record whose expiry instant is at or before `now`.
    ///
    /// Returns the number of records removed.
    pub fn purge_expired(&self, now: i64) -> usize {
        let mut removed = 0;

        self.attempts.retain(|_, records| {
            let before = records.len();
            records.retain(|r| r.expires_at > now);
            removed += before - records.len();
            !records.is_empty()
        });

        self.lockouts.retain(|_, lockout| {
            let keep = lockout.expires_at > now;
            if !keep {
                removed += 1;
            }
            keep
        });

        removed
    }

    /// Periodically purge expired records until the handle is aborted.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let removed = store.purge_expired(clock.now());
                if removed > 0 {
                    debug!(removed = removed, "Purged expired rate limit records");
                }
            }
        })
    }

    /// Number of attempt records currently held for `identifier`, expired or not.
    pub fn stored_attempts(&self, identifier: &Identifier) -> usize {
        self.attempts
            .get(&identifier.storage_key())
            .map(|records| records.len())
            .unwrap_or(0)
    }

    /// Insert a pre-built attempt record, e.g. to seed history.
    pub fn insert_attempt(&self, record: AttemptRecord) {
        self.attempts
            .entry(record.identifier.clone())
            .or_default()
            .push(record);
    }

    /// Insert a pre-built lockout record, replacing any existing one.
    pub fn insert_lockout(&self, record: LockoutRecord) {
        self.lockouts.insert(record.identifier.clone(), record);
    }
}

#[async_trait]
impl AttemptStore for MemoryAttemptStore {
    async fn count_since(
        &self,
        identifier: &Identifier,
        window_start: i64,
    ) -> Result<u64, StoreError> {
        let count = self
            .attempts
            .get(&identifier.storage_key())
            .map(|records| records.iter().filter(|r| r.timestamp >= window_start).count())
            .unwrap_or(0);

        trace!(
            identifier = %identifier,
            window_start = window_start,
            count = count,
            "Counted attempts"
        );
        Ok(count as u64)
    }

    async fn append(
        &self,
        identifier: &Identifier,
        timestamp: i64,
        ttl_secs: u64,
    ) -> Result<(), StoreError> {
        self.insert_attempt(AttemptRecord {
            identifier: identifier.storage_key(),
            timestamp,
            expires_at: timestamp.saturating_add(ttl_to_i64(ttl_secs)),
        });
        Ok(())
    }

    async fn get_lockout(
        &self,
        identifier: &Identifier,
    ) -> Result<Option<LockoutRecord>, StoreError> {
        Ok(self
            .lockouts
            .get(&identifier.lockout_key())
            .map(|entry| entry.value().clone()))
    }

    async fn set_lockout(
        &self,
        identifier: &Identifier,
        now: i64,
        lockout_secs: u64,
    ) -> Result<(), StoreError> {
        let until = now.saturating_add(ttl_to_i64(lockout_secs));
        self.insert_lockout(LockoutRecord::new(identifier, now, until));
        Ok(())
    }
}
