//! s3gate - admission control for S3 gateways
//!
//! This crate bounds, per action, how many requests and how many declared
//! content bytes may be in flight at once, both per bucket and across all
//! buckets. Requests over a limit are rejected immediately rather than queued.
//! Limits are read from a configuration store and can be reloaded without
//! disturbing in-flight counts.

pub mod breaker;
pub mod config;
pub mod error;
pub mod middleware;
