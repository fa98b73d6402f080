//! Turnstile - Request Admission Gateway
//!
//! This crate decides, per caller identity, whether a request may proceed.
//! Limits are calendar-aligned (minute, hour, day) and sit under a monthly
//! quota. All counters live in a shared counter store, so any number of
//! gateway instances enforce the same limits without talking to each other.

pub mod clock;
pub mod config;
pub mod error;
pub mod http;
pub mod metrics;
pub mod ratelimit;
pub mod store;
