//! Rate limit decision logic.
//!
//! The policy is a pure function of the evaluation instant and a snapshot of
//! both identifiers' state. It performs no I/O; the engine applies whatever
//! side effects the decision calls for.

use serde::{Deserialize, Serialize};

/// Default number of in-window attempts at which an identifier trips.
pub const DEFAULT_MAX_ATTEMPTS: u64 = 5;
/// Default sliding window length in seconds (15 minutes).
pub const DEFAULT_WINDOW_SECS: u64 = 900;
/// Default lockout duration in seconds (1 hour).
pub const DEFAULT_LOCKOUT_SECS: u64 = 3600;

/// Thresholds applied by the policy and engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LimitSettings {
    /// Attempts within the window at which the identifier pair is locked
    pub max_attempts: u64,
    /// Trailing window over which attempts are counted
    pub window_secs: u64,
    /// How long a lockout lasts once set
    pub lockout_secs: u64,
}

impl Default for LimitSettings {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            window_secs: DEFAULT_WINDOW_SECS,
            lockout_secs: DEFAULT_LOCKOUT_SECS,
        }
    }
}

impl LimitSettings {
    /// Earliest attempt timestamp that still counts at `now`.
    pub fn window_start(&self, now: i64) -> i64 {
        now.saturating_sub(secs_to_i64(self.window_secs))
    }

    /// Instant at which a lockout set at `now` expires.
    pub fn lockout_until(&self, now: i64) -> i64 {
        now.saturating_add(secs_to_i64(self.lockout_secs))
    }
}

fn secs_to_i64(secs: u64) -> i64 {
    i64::try_from(secs).unwrap_or(i64::MAX)
}

/// Snapshot of one identifier's abuse state at the evaluation instant.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IdentifierState {
    /// Attempts recorded within the current window
    pub count: u64,
    /// End of an active lockout, if any
    pub locked_until: Option<i64>,
}

impl IdentifierState {
    pub fn new(count: u64, locked_until: Option<i64>) -> Self {
        Self { count, locked_until }
    }

    /// Lockout end if it is still in the future at `now`.
    fn active_lockout(&self, now: i64) -> Option<i64> {
        self.locked_until.filter(|until| *until > now)
    }
}

/// Verdict for one authentication attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Decision {
    /// Proceed, and record the attempt against both identifiers
    Allow,
    /// Reject; at least one identifier has an active lockout
    DenyLocked { retry_after: u64 },
    /// Reject and lock both identifiers; a count reached the threshold
    DenyThreshold,
}

/// Compute the decision for an (email, ip) pair.
///
/// An active lockout on either identifier wins over any count. Otherwise the
/// pair trips as soon as either count reaches `max_attempts`, and both are
/// locked together so that an abuser cannot pivot between account and origin.
pub fn decide(
    settings: &LimitSettings,
    now: i64,
    email: IdentifierState,
    ip: IdentifierState,
) -> Decision {
    let latest_lockout = [email.active_lockout(now), ip.active_lockout(now)]
        .into_iter()
        .flatten()
        .max();

    if let Some(until) = latest_lockout {
        let retry_after = u64::try_from(until.saturating_sub(now)).unwrap_or(0);
        return Decision::DenyLocked { retry_after };
    }

    if email.count >= settings.max_attempts || ip.count >= settings.max_attempts {
        return Decision::DenyThreshold;
    }

    Decision::Allow
}
