//! Authguard - Pre-authentication Abuse Gate
//!
//! This crate decides, for every magic link authentication attempt, whether
//! it may proceed. Attempts are counted in a sliding window per account email
//! and per network origin; once either reaches the threshold both are locked
//! out together for a fixed period.

pub mod cleanup;
pub mod config;
pub mod error;
pub mod grpc;
pub mod ratelimit;
pub mod store;
