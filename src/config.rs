//! Client configuration surface.

use ballast_batch::BatchConfig;
use ballast_cache::CacheConfig;
use ballast_retry::{BreakerConfig, RetryPolicy};

/// Configuration for a [`crate::Client`], grouping each subsystem's options.
///
/// Every section has workable defaults; construct with struct update syntax:
///
/// ```ignore
/// let config = Config {
///     retry: RetryPolicy { max_attempts: 5, ..RetryPolicy::default() },
///     ..Config::default()
/// };
/// ```
#[derive(Debug, Clone, Default)]
pub struct Config {
    /// Cache backend kind, capacity bound, default TTL, negative caching.
    pub cache: CacheConfig,
    /// Attempt budget, backoff shape, per-attempt timeout.
    pub retry: RetryPolicy,
    /// Failure threshold and cooldown per call category.
    pub breaker: BreakerConfig,
    /// Chunk size, concurrency bound, per-item timeout.
    pub batch: BatchConfig,
}
