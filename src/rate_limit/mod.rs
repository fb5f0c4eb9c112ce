//! Rate limiter service
//!
//! Runs as its own process and keeps one [`RateCounter`] per API, shared by
//! every gateway instance through the RPC link. Three limits are supported:
//!
//! - **QPS**: calls per one-second window
//! - **Concurrency**: in-flight calls, released by `DecApiRate`
//! - **Quota**: calls per parameter value (e.g. per user) within a window
//!
//! Counters reset themselves once their window is stale.

pub mod counter;
pub mod service;

pub use counter::RateCounter;
pub use service::RateLimiterService;
