//! Token bucket limiting deliveries per route.
//!
//! Unlike an admission limiter this one waits: a delivery that finds the
//! bucket empty sleeps until the next token is due, so `max_rate` smooths
//! traffic while `queue_depth` bounds how much can pile up behind it.

use parking_lot::Mutex;
use std::time::Duration;
use tokio::time::Instant;

#[derive(Debug)]
struct TokenBucket {
    tokens: f64,
    last_update: Instant,
    max_tokens: f64,
    refill_rate: f64,
}

impl TokenBucket {
    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_update);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_rate).min(self.max_tokens);
        self.last_update = now;
    }

    /// Take a token, or report how long until one is available.
    fn try_consume(&mut self) -> Result<(), Duration> {
        self.refill();
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let needed = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(needed / self.refill_rate))
        }
    }
}

/// Limits calls to `max_rate` per second with a burst of `max(1, max_rate)`.
#[derive(Debug)]
pub struct RateLimiter {
    bucket: Mutex<TokenBucket>,
}

impl RateLimiter {
    /// Returns `None` for a non-positive or non-finite rate (unlimited).
    pub fn new(max_rate: f64) -> Option<Self> {
        if !max_rate.is_finite() || max_rate <= 0.0 {
            return None;
        }
        let burst = max_rate.max(1.0).floor();
        Some(Self {
            bucket: Mutex::new(TokenBucket {
                tokens: burst,
                last_update: Instant::now(),
                max_tokens: burst,
                refill_rate: max_rate,
            }),
        })
    }

    /// Wait until a token is available and take it.
    pub async fn acquire(&self) {
        loop {
            let wait = match self.bucket.lock().try_consume() {
                Ok(()) => return,
                Err(wait) => wait,
            };
            tokio::time::sleep(wait).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_invalid_rate_is_unlimited() {
        assert!(RateLimiter::new(0.0).is_none());
        assert!(RateLimiter::new(-1.0).is_none());
        assert!(RateLimiter::new(f64::NAN).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_then_spacing() {
        let limiter = RateLimiter::new(2.0).unwrap();
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(start.elapsed(), Duration::ZERO);

        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(500));
        assert!(start.elapsed() < Duration::from_millis(600));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fractional_rate() {
        let limiter = RateLimiter::new(0.5).unwrap();
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_secs(2));
    }
}
