use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter};

/// Token bucket shared by every caller of one provider.
///
/// `acquire()` is the only suspension point; request timeouts are applied by
/// the HTTP client separately.
pub struct ProviderRateLimiter {
    limiter: DefaultDirectRateLimiter,
    qps: f64,
}

impl ProviderRateLimiter {
    /// `None` for a non-positive or non-finite QPS.
    pub fn new(qps: f64) -> Option<Self> {
        if !qps.is_finite() || qps <= 0.0 {
            return None;
        }
        let quota = Quota::with_period(Duration::from_secs_f64(1.0 / qps))?;
        Some(Self {
            limiter: RateLimiter::direct(quota),
            qps,
        })
    }

    pub async fn acquire(&self) {
        self.limiter.until_ready().await;
    }

    pub fn qps(&self) -> f64 {
        self.qps
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    #[test]
    fn rejects_bad_qps() {
        assert!(ProviderRateLimiter::new(0.0).is_none());
        assert!(ProviderRateLimiter::new(f64::NAN).is_none());
        assert!(ProviderRateLimiter::new(2.0).is_some());
    }

    #[tokio::test]
    async fn spaces_out_calls() {
        let limiter = ProviderRateLimiter::new(20.0).unwrap();
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        // First call is free, the next two each wait ~50ms.
        assert!(start.elapsed() >= Duration::from_millis(80));
    }
}
