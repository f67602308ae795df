//! Sliding-window rate limiter, one window per client id.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;

/// Requests admitted per window.
pub const RATE_LIMIT: u32 = 60;

/// Window length.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Outcome of a rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    /// Seconds until the oldest entry ages out of the window.
    Limited { retry_after: u64 },
}

/// Sliding-window rate limiter.
pub struct RateLimiter {
    max_requests: u32,
    window: Duration,
    windows: Mutex<HashMap<String, VecDeque<Instant>>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            windows: Mutex::new(HashMap::new()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.max_requests
    }

    /// Drop timestamps outside the window, then admit or reject.
    pub fn check(&self, client_id: &str) -> RateDecision {
        let mut windows = self.windows.lock().unwrap();
        let now = Instant::now();
        let window = windows.entry(client_id.to_string()).or_default();

        while let Some(front) = window.front() {
            if now.duration_since(*front) > self.window {
                window.pop_front();
            } else {
                break;
            }
        }

        if window.len() as u32 >= self.max_requests {
            let retry_after = window
                .front()
                .map(|oldest| {
                    let age = now.duration_since(*oldest);
                    self.window.saturating_sub(age).as_secs().max(1)
                })
                .unwrap_or(1);
            return RateDecision::Limited { retry_after };
        }

        window.push_back(now);
        RateDecision::Allowed {
            remaining: self.max_requests - window.len() as u32,
        }
    }

    /// Remaining admissions in the current window, without consuming one.
    pub fn remaining(&self, client_id: &str) -> u32 {
        let windows = self.windows.lock().unwrap();
        let now = Instant::now();
        let used = windows
            .get(client_id)
            .map(|w| {
                w.iter()
                    .filter(|t| now.duration_since(**t) <= self.window)
                    .count() as u32
            })
            .unwrap_or(0);
        self.max_requests.saturating_sub(used)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn admits_up_to_limit_then_rejects() {
        let limiter = RateLimiter::new(RATE_LIMIT, RATE_WINDOW);
        for _ in 0..RATE_LIMIT {
            assert!(matches!(limiter.check("client"), RateDecision::Allowed { .. }));
        }
        match limiter.check("client") {
            RateDecision::Limited { retry_after } => assert!(retry_after > 0),
            other => panic!("expected limited, got {other:?}"),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn window_slides() {
        let limiter = RateLimiter::new(2, Duration::from_secs(60));
        assert!(matches!(limiter.check("c"), RateDecision::Allowed { .. }));
        tokio::time::advance(Duration::from_secs(30)).await;
        assert!(matches!(limiter.check("c"), RateDecision::Allowed { .. }));
        assert!(matches!(limiter.check("c"), RateDecision::Limited { .. }));
        // the first entry ages out after 61s total
        tokio::time::advance(Duration::from_secs(31)).await;
        assert!(matches!(limiter.check("c"), RateDecision::Allowed { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn clients_are_independent() {
        let limiter = RateLimiter::new(1, Duration::from_secs(60));
        assert!(matches!(limiter.check("a"), RateDecision::Allowed { .. }));
        assert!(matches!(limiter.check("b"), RateDecision::Allowed { .. }));
        assert!(matches!(limiter.check("a"), RateDecision::Limited { .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn remaining_reflects_usage() {
        let limiter = RateLimiter::new(5, Duration::from_secs(60));
        assert_eq!(limiter.remaining("c"), 5);
        limiter.check("c");
        limiter.check("c");
        assert_eq!(limiter.remaining("c"), 3);
    }
}
