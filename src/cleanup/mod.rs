//! Deferred lockout-expiry notifications.
//!
//! Lockouts expire on their own; these notices only tell interested parties
//! (caches, audit sinks, an external task runner) when one has run out.
//! Scheduling is best-effort and never influences a rate limit decision.

mod scheduler;

pub use scheduler::{CleanupNotice, CleanupScheduler, DeferredCleanupScheduler, SchedulerError};
