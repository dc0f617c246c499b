//! Global RPC throttling.
//!
//! A single token bucket gates every `modify_sl`/`close_position` call
//! system-wide. Callers never block on it: an exhausted bucket aborts the
//! update for the current tick and the caller records a rate-limited skip.

use std::num::NonZeroU32;

use governor::{
    clock::DefaultClock,
    state::{InMemoryState, NotKeyed},
    Quota, RateLimiter,
};

/// Non-blocking token bucket with capacity = rate, refilled continuously.
pub struct RpcLimiter {
    bucket: RateLimiter<NotKeyed, InMemoryState, DefaultClock>,
    rate_per_sec: u32,
}

impl RpcLimiter {
    /// Bucket allowing `rate_per_sec` broker mutations per second.
    #[must_use]
    pub fn new(rate_per_sec: u32) -> Self {
        let rate = NonZeroU32::new(rate_per_sec.max(1)).expect("max(1) is non-zero");
        Self {
            bucket: RateLimiter::direct(Quota::per_second(rate)),
            rate_per_sec: rate.get(),
        }
    }

    /// Take one token if available. Never blocks.
    #[must_use]
    pub fn try_acquire(&self) -> bool {
        self.bucket.check().is_ok()
    }

    /// Configured refill rate.
    #[must_use]
    pub fn rate_per_sec(&self) -> u32 {
        self.rate_per_sec
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bucket_capacity_matches_rate() {
        let limiter = RpcLimiter::new(5);
        let granted = (0..10).filter(|_| limiter.try_acquire()).count();
        assert_eq!(granted, 5);
    }

    #[test]
    fn exhausted_bucket_denies_without_blocking() {
        let limiter = RpcLimiter::new(1);
        assert!(limiter.try_acquire());
        assert!(!limiter.try_acquire());
    }

    #[test]
    fn zero_rate_is_clamped_to_one() {
        let limiter = RpcLimiter::new(0);
        assert_eq!(limiter.rate_per_sec(), 1);
        assert!(limiter.try_acquire());
    }
}
