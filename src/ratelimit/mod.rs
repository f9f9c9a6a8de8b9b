//! Rate limiting logic: identifiers, clock, policy and the engine that ties
//! them to an attempt store.

mod clock;
mod engine;
mod identifier;
mod policy;

pub use clock::{Clock, ManualClock, SystemClock};
pub use engine::{CheckResult, DenialReason, RateLimiterEngine, DEFAULT_STORE_TIMEOUT};
pub use identifier::{Identifier, IdentifierClass, IdentifierError, LOCKOUT_PREFIX};
pub use policy::{
    decide, Decision, IdentifierState, LimitSettings, DEFAULT_LOCKOUT_SECS, DEFAULT_MAX_ATTEMPTS,
    DEFAULT_WINDOW_SECS,
};
