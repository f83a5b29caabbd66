//! LLM request rate limiter
//!
//! Both the per-snippet batch path and the holistic page path share one
//! limiter enforcing two rules: at most N requests per rolling 60-second
//! window, and a minimum spacing of 60/N seconds between consecutive
//! requests. Admission is serialized through the mutex, so the spacing rule
//! holds even with many concurrent callers.

use std::collections::VecDeque;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

const WINDOW: Duration = Duration::from_secs(60);

pub struct LlmRateLimiter {
    max_per_window: usize,
    min_interval: Duration,
    recent: Mutex<VecDeque<Instant>>,
}

impl LlmRateLimiter {
    pub fn new(requests_per_minute: u32) -> Self {
        let requests_per_minute = requests_per_minute.max(1);
        Self {
            max_per_window: requests_per_minute as usize,
            min_interval: Duration::from_secs_f64(60.0 / requests_per_minute as f64),
            recent: Mutex::new(VecDeque::new()),
        }
    }

    /// Wait until a request may be issued, then record it.
    pub async fn acquire(&self) {
        let mut recent = self.recent.lock().await;
        let now = Instant::now();

        while let Some(front) = recent.front() {
            if now.duration_since(*front) >= WINDOW {
                recent.pop_front();
            } else {
                break;
            }
        }

        let mut wait = Duration::ZERO;

        if recent.len() >= self.max_per_window {
            if let Some(oldest) = recent.front() {
                let window_free_at = *oldest + WINDOW;
                wait = window_free_at.saturating_duration_since(now);
            }
        }

        if let Some(last) = recent.back() {
            let spacing_free_at = *last + self.min_interval;
            wait = wait.max(spacing_free_at.saturating_duration_since(now));
        }

        if !wait.is_zero() {
            tracing::debug!(wait_ms = wait.as_millis() as u64, "rate limiter pausing");
            tokio::time::sleep(wait).await;
        }

        let now = Instant::now();
        while let Some(front) = recent.front() {
            if now.duration_since(*front) >= WINDOW {
                recent.pop_front();
            } else {
                break;
            }
        }
        recent.push_back(now);
    }

    pub fn min_interval(&self) -> Duration {
        self.min_interval
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn enforces_minimum_spacing() {
        let limiter = LlmRateLimiter::new(60); // 1 req/s spacing
        let start = Instant::now();

        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        // Two waits of one second each.
        assert!(start.elapsed() >= Duration::from_secs(2));
    }

    #[tokio::test(start_paused = true)]
    async fn enforces_rolling_window() {
        let limiter = LlmRateLimiter::new(2); // 2 per minute, 30 s spacing

        let start = Instant::now();
        limiter.acquire().await;
        limiter.acquire().await;
        limiter.acquire().await;

        // Third request cannot land inside the first minute.
        assert!(start.elapsed() >= Duration::from_secs(60));
    }

    #[tokio::test(start_paused = true)]
    async fn first_request_is_immediate() {
        let limiter = LlmRateLimiter::new(60);
        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() < Duration::from_millis(10));
    }

    #[test]
    fn zero_rpm_is_clamped() {
        let limiter = LlmRateLimiter::new(0);
        assert_eq!(limiter.min_interval(), Duration::from_secs(60));
    }
}
