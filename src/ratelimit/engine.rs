//! Rate limiter engine.
//!
//! Each check reads both identifiers' state concurrently, asks the policy for
//! a decision and then applies the decision's writes concurrently. No state is
//! shared between concurrent checks beyond the attempt store itself; two
//! overlapping checks for the same pair may both observe a count just under
//! the threshold and both be allowed. That overshoot is bounded by the number
//! of overlapping checks and is accepted in exchange for not taking a lock on
//! every attempt.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, trace, warn};

use super::clock::Clock;
use super::identifier::Identifier;
use super::policy::{decide, Decision, IdentifierState, LimitSettings};
use crate::cleanup::{CleanupNotice, CleanupScheduler};
use crate::error::Result;
use crate::store::{AttemptStore, LockoutRecord, StoreError};

/// Default deadline for the read fan-out and for each write.
pub const DEFAULT_STORE_TIMEOUT: Duration = Duration::from_secs(2);

/// Why an attempt was denied.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DenialReason {
    /// This attempt pushed an identifier to the threshold; both are now locked
    RateLimitExceeded,
    /// An identifier is already locked
    Locked,
    /// The attempt store could not be consulted; the check failed closed
    ServiceUnavailable,
}

/// Outcome of a check, as reported to the authentication flow.
///
/// Serializes to `{"outcome":"allowed"}` or
/// `{"outcome":"denied","reason":"locked","retryAfterSeconds":42}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum CheckResult {
    Allowed,
    Denied {
        reason: DenialReason,
        #[serde(
            rename = "retryAfterSeconds",
            default,
            skip_serializing_if = "Option::is_none"
        )]
        retry_after_seconds: Option<u64>,
    },
}

impl CheckResult {
    pub fn is_allowed(&self) -> bool {
        matches!(self, CheckResult::Allowed)
    }

    pub fn reason(&self) -> Option<DenialReason> {
        match self {
            CheckResult::Allowed => None,
            CheckResult::Denied { reason, .. } => Some(*reason),
        }
    }

    pub fn retry_after_seconds(&self) -> Option<u64> {
        match self {
            CheckResult::Allowed => None,
            CheckResult::Denied {
                retry_after_seconds, ..
            } => *retry_after_seconds,
        }
    }

    fn service_unavailable() -> Self {
        CheckResult::Denied {
            reason: DenialReason::ServiceUnavailable,
            retry_after_seconds: None,
        }
    }
}

/// Decides whether authentication attempts may proceed and keeps the abuse
/// state for account and network origin identifiers up to date.
pub struct RateLimiterEngine {
    store: Arc<dyn AttemptStore>,
    clock: Arc<dyn Clock>,
    settings: LimitSettings,
    store_timeout: Duration,
    cleanup: Option<Arc<dyn CleanupScheduler>>,
}

impl RateLimiterEngine {
    /// Create an engine with default limits and no cleanup scheduler.
    pub fn new(store: Arc<dyn AttemptStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            settings: LimitSettings::default(),
            store_timeout: DEFAULT_STORE_TIMEOUT,
            cleanup: None,
        }
    }

    pub fn with_settings(mut self, settings: LimitSettings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_store_timeout(mut self, timeout: Duration) -> Self {
        self.store_timeout = timeout;
        self
    }

    pub fn with_cleanup_scheduler(mut self, scheduler: Arc<dyn CleanupScheduler>) -> Self {
        self.cleanup = Some(scheduler);
        self
    }

    pub fn settings(&self) -> &LimitSettings {
        &self.settings
    }

    /// Check an attempt at the clock's current time.
    pub async fn check(&self, email: &str, ip: &str) -> Result<CheckResult> {
        self.check_at(email, ip, self.clock.now()).await
    }

    /// Check an attempt at an explicit instant.
    ///
    /// Fails only when `email` or `ip` cannot be parsed; every rate limiting
    /// outcome, including infrastructure failure, is reported in the result.
    pub async fn check_at(&self, email: &str, ip: &str, now: i64) -> Result<CheckResult> {
        let email = Identifier::email(email)?;
        let ip = Identifier::ip(ip)?;
        Ok(self.evaluate(&email, &ip, now).await)
    }

    /// Run the full check for an already validated identifier pair.
    pub async fn evaluate(&self, email: &Identifier, ip: &Identifier, now: i64) -> CheckResult {
        let (email_state, ip_state) = match self.read_states(email, ip, now).await {
            Ok(states) => states,
            Err(e) => {
                error!(
                    email = %email,
                    ip = %ip,
                    error = %e,
                    "Attempt store unavailable, denying attempt"
                );
                return CheckResult::service_unavailable();
            }
        };

        trace!(
            email = %email,
            ip = %ip,
            email_count = email_state.count,
            ip_count = ip_state.count,
            "Evaluating rate limit"
        );

        match decide(&self.settings, now, email_state, ip_state) {
            Decision::Allow => {
                self.record_attempts(email, ip, now).await;
                debug!(email = %email, ip = %ip, "Attempt allowed");
                CheckResult::Allowed
            }
            Decision::DenyThreshold => {
                if self.set_lockouts(email, ip, now).await {
                    self.schedule_cleanup(email, ip, now);
                }
                info!(
                    email = %email,
                    ip = %ip,
                    email_count = email_state.count,
                    ip_count = ip_state.count,
                    lockout_secs = self.settings.lockout_secs,
                    "Rate limit exceeded, identifiers locked"
                );
                CheckResult::Denied {
                    reason: DenialReason::RateLimitExceeded,
                    retry_after_seconds: Some(self.settings.lockout_secs),
                }
            }
            Decision::DenyLocked { retry_after } => {
                info!(
                    email = %email,
                    ip = %ip,
                    retry_after = retry_after,
                    "Attempt rejected, identifier locked"
                );
                CheckResult::Denied {
                    reason: DenialReason::Locked,
                    retry_after_seconds: Some(retry_after),
                }
            }
        }
    }

    /// Read counts and lockouts for both identifiers under one deadline.
    async fn read_states(
        &self,
        email: &Identifier,
        ip: &Identifier,
        now: i64,
    ) -> std::result::Result<(IdentifierState, IdentifierState), StoreError> {
        let window_start = self.settings.window_start(now);

        let reads = futures::future::try_join4(
            self.store.count_since(email, window_start),
            self.store.get_lockout(email),
            self.store.count_since(ip, window_start),
            self.store.get_lockout(ip),
        );

        let (email_count, email_lockout, ip_count, ip_lockout) =
            tokio::time::timeout(self.store_timeout, reads)
                .await
                .map_err(|_| StoreError::Timeout {
                    operation: "read",
                    after: self.store_timeout,
                })??;

        Ok((
            state_at(email_count, email_lockout, now),
            state_at(ip_count, ip_lockout, now),
        ))
    }

    async fn record_attempts(&self, email: &Identifier, ip: &Identifier, now: i64) {
        let ttl = self.settings.window_secs;
        let (email_result, ip_result) = futures::join!(
            self.bounded("append", self.store.append(email, now, ttl)),
            self.bounded("append", self.store.append(ip, now, ttl))
        );

        for (identifier, result) in [(email, email_result), (ip, ip_result)] {
            if let Err(e) = result {
                error!(
                    identifier = %identifier,
                    error = %e,
                    "Failed to record attempt; later counts will undercount"
                );
            }
        }
    }

    /// Lock both identifiers. Returns whether at least one lockout was stored.
    async fn set_lockouts(&self, email: &Identifier, ip: &Identifier, now: i64) -> bool {
        let duration = self.settings.lockout_secs;
        let (email_result, ip_result) = futures::join!(
            self.bounded("set_lockout", self.store.set_lockout(email, now, duration)),
            self.bounded("set_lockout", self.store.set_lockout(ip, now, duration))
        );

        let mut stored = false;
        for (identifier, result) in [(email, email_result), (ip, ip_result)] {
            match result {
                Ok(()) => stored = true,
                Err(e) => error!(
                    identifier = %identifier,
                    error = %e,
                    "Failed to set lockout; identifier stays unlocked"
                ),
            }
        }
        stored
    }

    /// Apply the store deadline to a single write.
    async fn bounded<F>(
        &self,
        operation: &'static str,
        write: F,
    ) -> std::result::Result<(), StoreError>
    where
        F: Future<Output = std::result::Result<(), StoreError>>,
    {
        match tokio::time::timeout(self.store_timeout, write).await {
            Ok(result) => result,
            Err(_) => Err(StoreError::Timeout {
                operation,
                after: self.store_timeout,
            }),
        }
    }

    /// Fire-and-forget notice for when the new lockout runs out.
    fn schedule_cleanup(&self, email: &Identifier, ip: &Identifier, now: i64) {
        let Some(scheduler) = self.cleanup.as_ref().map(Arc::clone) else {
            return;
        };

        let notice = CleanupNotice::new(
            email.value(),
            ip.value(),
            now,
            self.settings.lockout_until(now),
        );

        let runtime = match tokio::runtime::Handle::try_current() {
            Ok(runtime) => runtime,
            Err(e) => {
                warn!(error = %e, "Cannot schedule lockout cleanup outside a runtime");
                return;
            }
        };

        runtime.spawn(async move {
            if let Err(e) = scheduler.schedule(notice).await {
                warn!(error = %e, "Failed to schedule lockout cleanup");
            }
        });
    }
}

/// Build an identifier's state, ignoring a lockout that has already ended.
fn state_at(count: u64, lockout: Option<LockoutRecord>, now: i64) -> IdentifierState {
    let locked_until = lockout
        .filter(|record| record.is_active(now))
        .map(|record| record.lockout_until);
    IdentifierState::new(count, locked_until)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::AuthGuardError;
    use crate::ratelimit::ManualClock;
    use crate::store::MemoryAttemptStore;
    use async_trait::async_trait;

    const NOW: i64 = 1_700_000_000;
    const EMAIL: &str = "test@ocupop.com";
    const IP: &str = "127.0.0.1";

    fn engine_with(store: Arc<dyn AttemptStore>) -> RateLimiterEngine {
        RateLimiterEngine::new(store, Arc::new(ManualClock::new(NOW)))
    }

    type StoreResult<T> = std::result::Result<T, StoreError>;

    /// Store whose reads and/or writes always fail.
    struct BrokenStore {
        fail_reads: bool,
        inner: MemoryAttemptStore,
    }

    #[async_trait]
    impl AttemptStore for BrokenStore {
        async fn count_since(
            &self,
            identifier: &Identifier,
            window_start: i64,
        ) -> StoreResult<u64> {
            if self.fail_reads {
                return Err(StoreError::unavailable("count_since", "connection refused"));
            }
            self.inner.count_since(identifier, window_start).await
        }

        async fn append(&self, _: &Identifier, _: i64, _: u64) -> StoreResult<()> {
            Err(StoreError::unavailable("append", "read-only replica"))
        }

        async fn get_lockout(&self, identifier: &Identifier) -> StoreResult<Option<LockoutRecord>> {
            self.inner.get_lockout(identifier).await
        }

        async fn set_lockout(&self, _: &Identifier, _: i64, _: u64) -> StoreResult<()> {
            Err(StoreError::unavailable("set_lockout", "read-only replica"))
        }
    }

    /// Store whose lockout reads never finish in time.
    struct SlowStore;

    #[async_trait]
    impl AttemptStore for SlowStore {
        async fn count_since(&self, _: &Identifier, _: i64) -> StoreResult<u64> {
            Ok(0)
        }

        async fn append(&self, _: &Identifier, _: i64, _: u64) -> StoreResult<()> {
            Ok(())
        }

        async fn get_lockout(&self, _: &Identifier) -> StoreResult<Option<LockoutRecord>> {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok(None)
        }

        async fn set_lockout(&self, _: &Identifier, _: i64, _: u64) -> StoreResult<()> {
            Ok(())
        }
    }

    /// Store that answers reads with a fixed count and never completes a write.
    struct HangingWritesStore {
        count: u64,
    }

    #[async_trait]
    impl AttemptStore for HangingWritesStore {
        async fn count_since(&self, _: &Identifier, _: i64) -> StoreResult<u64> {
            Ok(self.count)
        }

        async fn append(&self, _: &Identifier, _: i64, _: u64) -> StoreResult<()> {
            std::future::pending::<StoreResult<()>>().await
        }

        async fn get_lockout(&self, _: &Identifier) -> StoreResult<Option<LockoutRecord>> {
            Ok(None)
        }

        async fn set_lockout(&self, _: &Identifier, _: i64, _: u64) -> StoreResult<()> {
            std::future::pending::<StoreResult<()>>().await
        }
    }

    #[derive(Default)]
    struct RecordingScheduler {
        notices: std::sync::Mutex<Vec<CleanupNotice>>,
    }

    impl RecordingScheduler {
        fn recorded(&self) -> Vec<CleanupNotice> {
            self.notices.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CleanupScheduler for RecordingScheduler {
        async fn schedule(
            &self,
            notice: CleanupNotice,
        ) -> std::result::Result<(), crate::cleanup::SchedulerError> {
            self.notices.lock().unwrap().push(notice);
            Ok(())
        }
    }

    /// Let detached scheduling tasks run.
    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    async fn seeded_email_attempts(count: usize) -> MemoryAttemptStore {
        let store = MemoryAttemptStore::new();
        let email = Identifier::email(EMAIL).unwrap();
        for _ in 0..count {
            store.append(&email, NOW - 60, 900).await.unwrap();
        }
        store
    }

    #[tokio::test]
    async fn test_first_attempt_allowed_and_recorded() {
        let store = Arc::new(MemoryAttemptStore::new());
        let engine = engine_with(store.clone());

        let result = engine.check_at(EMAIL, IP, NOW).await.unwrap();
        assert_eq!(result, CheckResult::Allowed);

        let email = Identifier::email(EMAIL).unwrap();
        let ip = Identifier::ip(IP).unwrap();
        assert_eq!(store.count_since(&email, NOW).await.unwrap(), 1);
        assert_eq!(store.count_since(&ip, NOW).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_check_uses_clock() {
        let store = Arc::new(MemoryAttemptStore::new());
        let clock = Arc::new(ManualClock::new(NOW));
        let engine = RateLimiterEngine::new(store.clone(), clock.clone());

        engine.check(EMAIL, IP).await.unwrap();

        let email = Identifier::email(EMAIL).unwrap();
        assert_eq!(store.count_since(&email, NOW).await.unwrap(), 1);
        assert_eq!(store.count_since(&email, NOW + 1).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_invalid_identifiers_rejected_before_store_access() {
        let store = Arc::new(MemoryAttemptStore::new());
        let engine = engine_with(store.clone());

        let err = engine.check_at("", IP, NOW).await.unwrap_err();
        assert!(matches!(err, AuthGuardError::InvalidIdentifier(_)));

        let err = engine.check_at(EMAIL, "not-an-ip", NOW).await.unwrap_err();
        assert!(matches!(err, AuthGuardError::InvalidIdentifier(_)));

        let email = Identifier::email(EMAIL).unwrap();
        assert_eq!(store.stored_attempts(&email), 0);
    }

    #[tokio::test]
    async fn test_read_failure_fails_closed() {
        let store = Arc::new(BrokenStore {
            fail_reads: true,
            inner: MemoryAttemptStore::new(),
        });
        let engine = engine_with(store);

        let result = engine.check_at(EMAIL, IP, NOW).await.unwrap();
        assert_eq!(
            result,
            CheckResult::Denied {
                reason: DenialReason::ServiceUnavailable,
                retry_after_seconds: None,
            }
        );
    }

    #[tokio::test]
    async fn test_write_failure_keeps_allow() {
        let store = Arc::new(BrokenStore {
            fail_reads: false,
            inner: MemoryAttemptStore::new(),
        });
        let engine = engine_with(store);

        let result = engine.check_at(EMAIL, IP, NOW).await.unwrap();
        assert_eq!(result, CheckResult::Allowed);
    }

    #[tokio::test]
    async fn test_lockout_write_failure_keeps_denial() {
        let engine = engine_with(Arc::new(BrokenStore {
            fail_reads: false,
            inner: seeded_email_attempts(5).await,
        }));

        let result = engine.check_at(EMAIL, IP, NOW).await.unwrap();
        assert_eq!(result.reason(), Some(DenialReason::RateLimitExceeded));
        assert_eq!(result.retry_after_seconds(), Some(3600));
    }

    #[tokio::test]
    async fn test_cleanup_scheduled_after_lockout_stored() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine_with(Arc::new(seeded_email_attempts(5).await))
            .with_cleanup_scheduler(scheduler.clone());

        let result = engine.check_at(EMAIL, IP, NOW).await.unwrap();
        assert_eq!(result.reason(), Some(DenialReason::RateLimitExceeded));

        settle().await;
        let notices = scheduler.recorded();
        assert_eq!(notices.len(), 1);
        assert_eq!(notices[0].email, EMAIL);
        assert_eq!(notices[0].set_at, NOW);
        assert_eq!(notices[0].due_at, NOW + 3600);
    }

    #[tokio::test]
    async fn test_no_cleanup_when_lockout_not_stored() {
        let inner = seeded_email_attempts(5).await;
        let scheduler = Arc::new(RecordingScheduler::default());
        let store = Arc::new(BrokenStore {
            fail_reads: false,
            inner,
        });
        let engine = engine_with(store.clone()).with_cleanup_scheduler(scheduler.clone());

        let result = engine.check_at(EMAIL, IP, NOW).await.unwrap();
        assert_eq!(result.reason(), Some(DenialReason::RateLimitExceeded));

        settle().await;
        let email = Identifier::email(EMAIL).unwrap();
        assert!(store.get_lockout(&email).await.unwrap().is_none());
        assert!(scheduler.recorded().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_read_timeout_fails_closed() {
        let engine = engine_with(Arc::new(SlowStore))
            .with_store_timeout(Duration::from_millis(500));

        let result = engine.check_at(EMAIL, IP, NOW).await.unwrap();
        assert_eq!(result.reason(), Some(DenialReason::ServiceUnavailable));
    }

    #[tokio::test(start_paused = true)]
    async fn test_append_timeout_keeps_allow() {
        let engine = engine_with(Arc::new(HangingWritesStore { count: 0 }))
            .with_store_timeout(Duration::from_millis(500));

        let started = tokio::time::Instant::now();
        let result = engine.check_at(EMAIL, IP, NOW).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result, CheckResult::Allowed);
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_secs(1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_lockout_timeout_keeps_denial() {
        let scheduler = Arc::new(RecordingScheduler::default());
        let engine = engine_with(Arc::new(HangingWritesStore { count: 5 }))
            .with_store_timeout(Duration::from_millis(500))
            .with_cleanup_scheduler(scheduler.clone());

        let started = tokio::time::Instant::now();
        let result = engine.check_at(EMAIL, IP, NOW).await.unwrap();
        let elapsed = started.elapsed();

        assert_eq!(result.reason(), Some(DenialReason::RateLimitExceeded));
        assert_eq!(result.retry_after_seconds(), Some(3600));
        assert!(elapsed >= Duration::from_millis(500));
        assert!(elapsed < Duration::from_secs(1));

        settle().await;
        assert!(scheduler.recorded().is_empty());
    }

    #[tokio::test]
    async fn test_custom_settings_respected() {
        let store = Arc::new(MemoryAttemptStore::new());
        let engine = engine_with(store.clone()).with_settings(LimitSettings {
            max_attempts: 2,
            window_secs: 60,
            lockout_secs: 120,
        });

        assert!(engine.check_at(EMAIL, IP, NOW).await.unwrap().is_allowed());
        assert!(engine.check_at(EMAIL, IP, NOW + 1).await.unwrap().is_allowed());

        let result = engine.check_at(EMAIL, IP, NOW + 2).await.unwrap();
        assert_eq!(result.retry_after_seconds(), Some(120));

        let ip = Identifier::ip(IP).unwrap();
        let lockout = store.get_lockout(&ip).await.unwrap().unwrap();
        assert_eq!(lockout.lockout_until, NOW + 2 + 120);
    }

    #[test]
    fn test_check_result_json() {
        let allowed = serde_json::to_value(CheckResult::Allowed).unwrap();
        assert_eq!(allowed, serde_json::json!({"outcome": "allowed"}));

        let locked = serde_json::to_value(CheckResult::Denied {
            reason: DenialReason::Locked,
            retry_after_seconds: Some(42),
        })
        .unwrap();
        assert_eq!(
            locked,
            serde_json::json!({
                "outcome": "denied",
                "reason": "locked",
                "retryAfterSeconds": 42
            })
        );

        let unavailable = serde_json::to_value(CheckResult::service_unavailable()).unwrap();
        assert_eq!(
            unavailable,
            serde_json::json!({"outcome": "denied", "reason": "service_unavailable"})
        );
    }
}
