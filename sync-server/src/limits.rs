//! Rate limiting for watch streams.
//!
//! Watch streams are long lived and each one holds signal subscriptions
//! and fetchers, so opening them is what gets limited:
//! - **Organization** for watch opens (one agent per device, many devices
//!   per organization)
//! - **Global** across every request
//!
//! Both use the governor crate; the keyed limiter is backed by DashMap.

use crate::config::LimitsConfig;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use uuid::Uuid;

/// Type alias for a keyed rate limiter using DashMap.
type KeyedLimiter<K> = RateLimiter<
    K,
    dashmap::DashMap<K, InMemoryState>,
    DefaultClock,
    NoOpMiddleware<governor::clock::QuantaInstant>,
>;

/// Type alias for a direct (non-keyed) rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Rate limiters for the API server.
#[derive(Clone)]
pub struct RateLimits {
    /// Limits watch opens per organization.
    ///
    /// Configured via `limits.watches_per_minute`.
    watch_limiter: Arc<KeyedLimiter<Uuid>>,

    /// Global rate limiter across all clients.
    ///
    /// Configured via `limits.global_requests_per_second`.
    global_limiter: Arc<DirectLimiter>,
}

impl std::fmt::Debug for RateLimits {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimits")
            .field("watch_limiter", &"KeyedLimiter<Uuid>")
            .field("global_limiter", &"DirectLimiter")
            .finish()
    }
}

impl RateLimits {
    /// Create rate limiters from configuration.
    ///
    /// Zero quotas are rejected by config validation; here they clamp to one.
    pub fn new(config: &LimitsConfig) -> Self {
        let watches_per_minute =
            NonZeroU32::new(config.watches_per_minute).unwrap_or(NonZeroU32::MIN);
        let global_rps =
            NonZeroU32::new(config.global_requests_per_second).unwrap_or(NonZeroU32::MIN);

        Self {
            watch_limiter: Arc::new(RateLimiter::keyed(Quota::per_minute(watches_per_minute))),
            global_limiter: Arc::new(RateLimiter::direct(Quota::per_second(global_rps))),
        }
    }

    /// Check if `organization` may open another watch stream.
    pub fn check_watch(&self, organization: &Uuid) -> Result<(), RateLimitError> {
        self.watch_limiter
            .check_key(organization)
            .map_err(|_| RateLimitError::WatchLimitExceeded)
    }

    /// Check if the global request rate is within limits.
    pub fn check_global(&self) -> Result<(), RateLimitError> {
        self.global_limiter
            .check()
            .map_err(|_| RateLimitError::GlobalLimitExceeded)
    }

    /// Number of tracked organization keys (for metrics).
    pub fn watch_keys_count(&self) -> usize {
        self.watch_limiter.len()
    }

    /// Evict organizations whose quota has fully recharged.
    pub fn shrink(&self) {
        self.watch_limiter.retain_recent();
    }
}

/// Rate limit error types.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RateLimitError {
    /// Too many watch opens for this organization.
    #[error("watch rate limit exceeded")]
    WatchLimitExceeded,
    /// Global request rate exceeded across all clients.
    #[error("global rate limit exceeded")]
    GlobalLimitExceeded,
}
