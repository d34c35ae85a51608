//! Resilience utilities: reconnect backoff, rate limiting, bulkheads.
//!
//! These protect both sides of the mirror: the remote backends from
//! reconnect storms and snapshot stampedes, and the local process from
//! unbounded event bursts.
//!
//! - [`RetryConfig`]: exponential backoff with jitter for reconnects
//! - [`RateLimiter`]: token bucket over a session's event application
//! - [`Bulkhead`]: caps how many clusters snapshot at once
//!
//! # Example
//!
//! ```rust,no_run
//! # async fn example() -> Result<(), mesh_mirror::resilience::BulkheadFull> {
//! use mesh_mirror::resilience::{Bulkhead, RateLimitConfig, RateLimiter};
//!
//! let limiter = RateLimiter::new(RateLimitConfig::default());
//! limiter.acquire().await; // Blocks if over limit
//!
//! let bulkhead = Bulkhead::new(16);
//! let _permit = bulkhead.acquire().await?;
//! // permit dropped = slot released
//! # Ok(())
//! # }
//! ```

use governor::{
    clock::DefaultClock,
    middleware::NoOpMiddleware,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter as GovLimiter,
};
use rand::Rng;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Configuration for reconnect behavior.
///
/// Attempts are uncapped: a session retries until shutdown, and this
/// schedule only shapes how fast.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Delay before the first retry.
    pub initial_delay: Duration,

    /// Ceiling for the exponential backoff.
    pub max_delay: Duration,

    /// Backoff multiplier (e.g., 2.0 = double delay each retry).
    pub backoff_factor: f64,

    /// Timeout for each individual connection attempt.
    pub connection_timeout: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::reconnect()
    }
}

impl RetryConfig {
    /// Infinite retry for session reconnects (never give up).
    ///
    /// A remote cluster that is down for hours is an expected condition.
    /// The session keeps trying and recovers without operator action.
    ///
    /// # Backoff Schedule
    ///
    /// ```text
    /// Attempt  Delay     Reasoning
    /// -------  -----     ---------
    /// 1        1s        Immediate transient retry
    /// 2        2s        Brief network blip
    /// 3        4s        DNS propagation
    /// 4        8s        Container restart
    /// 5        16s       Service recovery
    /// 6        32s       Load balancer failover
    /// 7        64s       Datacenter maintenance
    /// 8        128s      Extended outage
    /// 9        256s      Multi-hour incident
    /// 10+      300s      Cap at 5 minutes, retry forever
    /// ```
    pub fn reconnect() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(300),
            backoff_factor: 2.0,
            connection_timeout: Duration::from_secs(10),
        }
    }

    /// Calculate the deterministic delay for a given attempt (1-indexed).
    pub fn delay_for_attempt(&self, attempt: usize) -> Duration {
        if attempt == 0 {
            return self.initial_delay;
        }

        // Clamp before converting: the multiplier leaves f64 range long
        // before a multi-hour outage runs out of attempts.
        let exponent = (attempt - 1).min(1024) as i32;
        let multiplier = self.backoff_factor.powi(exponent);
        let delay_secs =
            (self.initial_delay.as_secs_f64() * multiplier).min(self.max_delay.as_secs_f64());
        Duration::from_secs_f64(delay_secs)
    }

    /// Backoff delay with additive jitter: base plus up to half the base.
    ///
    /// Many sessions losing the same backend at once must not reconnect in
    /// lockstep. The jitter is added after the ceiling, so spread survives
    /// even once every session sits at `max_delay`.
    pub fn jittered_delay_for_attempt(&self, attempt: usize) -> Duration {
        let base = self.delay_for_attempt(attempt);
        let base_ms = base.as_millis() as u64;
        let jitter_ms = rand::rng().random_range(0..=base_ms / 2);
        base + Duration::from_millis(jitter_ms)
    }
}

// =============================================================================
// Event Rate Limiting
// =============================================================================

/// Token bucket parameters for one session's event application.
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Tokens that may accumulate while the stream is quiet (burst).
    pub burst_size: u32,

    /// Tokens replenished per second (sustained events/sec).
    pub refill_rate: u32,
}

impl Default for RateLimitConfig {
    /// 5000 events/sec sustained with bursts of 500, per session.
    fn default() -> Self {
        Self {
            burst_size: 500,
            refill_rate: 5000,
        }
    }
}

/// Paces how fast one session drains its watch stream into the mirror.
///
/// A remote replaying a huge snapshot, or one misbehaving writer, must
/// not starve the other sessions' tasks. One applied event costs one
/// token; zero rates are clamped up to one rather than rejected here,
/// configuration validation refuses them earlier.
pub struct RateLimiter {
    bucket: GovLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        let quota =
            Quota::per_second(NonZeroU32::new(config.refill_rate).unwrap_or(NonZeroU32::MIN))
                .allow_burst(NonZeroU32::new(config.burst_size).unwrap_or(NonZeroU32::MIN));

        Self {
            bucket: GovLimiter::direct(quota),
        }
    }

    /// Wait until the next event may be applied. Cancel-safe.
    pub async fn acquire(&self) {
        self.bucket.until_ready().await;
    }

    /// Try to take a token without waiting.
    pub fn try_acquire(&self) -> bool {
        self.bucket.check().is_ok()
    }
}

// =============================================================================
// Snapshot Bulkhead
// =============================================================================

/// Error when a bulkhead slot cannot be issued.
#[derive(Debug, Clone, thiserror::Error)]
#[error("bulkhead full: all {width} slots in use")]
pub struct BulkheadFull {
    /// Total slots the bulkhead was built with.
    pub width: usize,
}

/// Caps how many sessions run their snapshot phase at once.
///
/// Process boot and mesh-wide reconnects start every session within the
/// same tick; unchecked, each would list its whole remote prefix and
/// bulk-write the mirror simultaneously.
#[derive(Debug)]
pub struct Bulkhead {
    slots: Arc<Semaphore>,
    width: usize,
}

impl Bulkhead {
    pub fn new(width: usize) -> Self {
        Self {
            slots: Arc::new(Semaphore::new(width)),
            width,
        }
    }

    /// Default width for snapshot phases: 16 clusters at once.
    pub fn for_snapshots() -> Self {
        Self::new(16)
    }

    /// Wait for a slot. Dropping the returned permit frees it.
    pub async fn acquire(&self) -> Result<OwnedSemaphorePermit, BulkheadFull> {
        self.slots
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| BulkheadFull { width: self.width })
    }

    /// Slots not currently held.
    pub fn available(&self) -> usize {
        self.slots.available_permits()
    }
}
