//! Client-side rate limiting for the GitLab API.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tracing::warn;

/// Length of the rolling window the limit applies to.
pub const RATE_WINDOW: Duration = Duration::from_secs(60);

/// Time source for the limiter.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Current monotonic time.
    fn now(&self) -> Instant;

    /// Suspend the calling task.
    async fn sleep(&self, duration: Duration);
}

/// Wall clock backed by the tokio timer.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioClock;

#[async_trait]
impl Clock for TokioClock {
    fn now(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Allows at most `max_calls` acquisitions per rolling 60 seconds.
///
/// State lives in memory only; every process starts with a fresh window.
pub struct RateLimiter {
    max_calls: usize,
    clock: Arc<dyn Clock>,
    calls: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter on the tokio clock.
    pub fn new(max_calls_per_minute: usize) -> Self {
        Self::with_clock(max_calls_per_minute, Arc::new(TokioClock))
    }

    /// Create a limiter on a custom clock.
    pub fn with_clock(max_calls_per_minute: usize, clock: Arc<dyn Clock>) -> Self {
        Self {
            max_calls: max_calls_per_minute.max(1),
            clock,
            calls: Mutex::new(VecDeque::new()),
        }
    }

    /// Configured calls per window.
    pub fn max_calls(&self) -> usize {
        self.max_calls
    }

    /// Wait until one more call fits in the window, then record it.
    ///
    /// Concurrent callers queue on the internal lock, so the window is
    /// checked and updated atomically.
    pub async fn acquire(&self) {
        let mut calls = self.calls.lock().await;

        loop {
            let now = self.clock.now();
            while calls
                .front()
                .is_some_and(|&oldest| now.duration_since(oldest) >= RATE_WINDOW)
            {
                calls.pop_front();
            }

            if calls.len() < self.max_calls {
                calls.push_back(now);
                return;
            }

            let Some(&oldest) = calls.front() else {
                continue;
            };
            let wait = RATE_WINDOW.saturating_sub(now.duration_since(oldest));
            warn!("Rate limit reached, sleeping for {:.2}s", wait.as_secs_f64());
            self.clock.sleep(wait).await;
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    /// Clock that only moves when slept on.
    pub(crate) struct ManualClock {
        start: Instant,
        offset: StdMutex<Duration>,
    }

    impl ManualClock {
        pub(crate) fn new() -> Self {
            Self {
                start: Instant::now(),
                offset: StdMutex::new(Duration::ZERO),
            }
        }

        pub(crate) fn elapsed(&self) -> Duration {
            *self.offset.lock().unwrap()
        }
    }

    #[async_trait]
    impl Clock for ManualClock {
        fn now(&self) -> Instant {
            self.start + self.elapsed()
        }

        async fn sleep(&self, duration: Duration) {
            *self.offset.lock().unwrap() += duration;
        }
    }

    #[tokio::test]
    async fn test_never_exceeds_limit_in_any_window() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(3, clock.clone());

        let mut completions = Vec::new();
        for _ in 0..10 {
            limiter.acquire().await;
            completions.push(clock.elapsed());
        }

        for (i, &t) in completions.iter().enumerate() {
            let in_window = completions[i..].iter().filter(|&&c| c - t < RATE_WINDOW).count();
            assert!(in_window <= 3, "{in_window} calls within 60s of {t:?}");
        }
        assert_eq!(completions[2], Duration::ZERO);
        assert_eq!(completions[3], RATE_WINDOW);
        assert_eq!(completions[9], RATE_WINDOW * 3);
    }

    #[tokio::test]
    async fn test_expired_calls_free_capacity() {
        let clock = Arc::new(ManualClock::new());
        let limiter = RateLimiter::with_clock(2, clock.clone());

        limiter.acquire().await;
        clock.sleep(Duration::from_secs(45)).await;
        limiter.acquire().await;
        clock.sleep(Duration::from_secs(20)).await;

        // the first call is now 65s old
        limiter.acquire().await;
        assert_eq!(clock.elapsed(), Duration::from_secs(65));

        // second call (at 45s) must expire before a fourth fits
        limiter.acquire().await;
        assert_eq!(clock.elapsed(), Duration::from_secs(105));
    }

    #[tokio::test]
    async fn test_zero_limit_is_clamped() {
        let limiter = RateLimiter::with_clock(0, Arc::new(ManualClock::new()));
        assert_eq!(limiter.max_calls(), 1);
        limiter.acquire().await;
    }

    #[tokio::test]
    async fn test_concurrent_acquire() {
        let clock = Arc::new(ManualClock::new());
        let limiter = Arc::new(RateLimiter::with_clock(5, clock.clone()));

        let handles: Vec<_> = (0..5)
            .map(|_| {
                let limiter = limiter.clone();
                tokio::spawn(async move { limiter.acquire().await })
            })
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }

        assert_eq!(clock.elapsed(), Duration::ZERO);
        assert_eq!(limiter.calls.lock().await.len(), 5);
    }
}
