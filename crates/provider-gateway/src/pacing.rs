//! Request pacing for adapter HTTP clients.
//!
//! Two policies: a sliding-window limiter (at most N requests per window)
//! and a minimum-spacing pacer (at least D between same-host requests).
//! Each adapter owns its own instance; there is no process-global client.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;

/// Sliding-window rate limiter: at most `max_requests` per `window`.
#[derive(Clone)]
pub struct SlidingWindowLimiter {
    timestamps: Arc<Mutex<VecDeque<Instant>>>,
    max_requests: usize,
    window: Duration,
}

impl SlidingWindowLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            timestamps: Arc::new(Mutex::new(VecDeque::new())),
            max_requests,
            window,
        }
    }

    pub async fn acquire(&self) {
        loop {
            let mut ts = self.timestamps.lock().await;
            let now = Instant::now();

            while let Some(&front) = ts.front() {
                if now.duration_since(front) >= self.window {
                    ts.pop_front();
                } else {
                    break;
                }
            }

            if ts.len() < self.max_requests {
                ts.push_back(now);
                return;
            }

            let oldest = match ts.front() {
                Some(&t) => t,
                None => return,
            };
            let sleep_dur = self
                .window
                .saturating_sub(now.duration_since(oldest))
                + Duration::from_millis(50);
            drop(ts);
            tracing::debug!(
                wait_secs = sleep_dur.as_secs_f64(),
                "rate limiter waiting for request slot"
            );
            tokio::time::sleep(sleep_dur).await;
        }
    }
}

/// Minimum-spacing pacer: consecutive `acquire` calls are at least
/// `min_interval` apart.
#[derive(Clone)]
pub struct MinIntervalPacer {
    last: Arc<Mutex<Option<Instant>>>,
    min_interval: Duration,
}

impl MinIntervalPacer {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            last: Arc::new(Mutex::new(None)),
            min_interval,
        }
    }

    pub async fn acquire(&self) {
        let mut last = self.last.lock().await;
        if let Some(prev) = *last {
            let elapsed = prev.elapsed();
            if elapsed < self.min_interval {
                tokio::time::sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn min_interval_pacer_spaces_calls() {
        let pacer = MinIntervalPacer::new(Duration::from_millis(50));
        let start = Instant::now();
        pacer.acquire().await;
        pacer.acquire().await;
        pacer.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(100));
    }

    #[tokio::test]
    async fn sliding_window_allows_burst_up_to_limit() {
        let limiter = SlidingWindowLimiter::new(3, Duration::from_secs(60));
        let start = Instant::now();
        for _ in 0..3 {
            limiter.acquire().await;
        }
        // Burst within the limit must not sleep.
        assert!(start.elapsed() < Duration::from_millis(100));
    }
}
