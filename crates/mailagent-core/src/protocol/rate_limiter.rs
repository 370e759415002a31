//! Shared rate limiter for capability requests to avoid provider throttling

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};
use std::num::NonZeroU32;
use std::sync::Arc;
use tracing::debug;

/// Token bucket shared by every session talking to the same provider
#[derive(Clone)]
pub struct CallRateLimiter {
    limiter: Arc<DefaultDirectRateLimiter>,
}

impl CallRateLimiter {
    /// Create a new rate limiter with the specified requests per second
    pub fn new(requests_per_second: u32) -> Self {
        let per_second = NonZeroU32::new(requests_per_second).unwrap_or(NonZeroU32::MIN);
        Self {
            limiter: Arc::new(RateLimiter::direct(Quota::per_second(per_second))),
        }
    }

    /// Wait until a request is allowed
    pub async fn wait(&self) {
        self.limiter.until_ready().await;
        debug!("Rate limiter: request allowed");
    }

    /// Check if a request can be made immediately
    pub fn check(&self) -> bool {
        self.limiter.check().is_ok()
    }
}

impl Default for CallRateLimiter {
    fn default() -> Self {
        Self::new(10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_burst_is_bounded_by_quota() {
        let limiter = CallRateLimiter::new(3);
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(limiter.check());
        assert!(!limiter.check());
    }

    #[test]
    fn test_clones_share_the_bucket() {
        let limiter = CallRateLimiter::new(1);
        let other = limiter.clone();
        assert!(limiter.check());
        assert!(!other.check());
    }

    #[test]
    fn test_zero_rate_falls_back_to_one() {
        let limiter = CallRateLimiter::new(0);
        assert!(limiter.check());
    }
}
