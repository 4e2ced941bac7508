//! Backend call rate limiting
//!
//! Fixed-window limiter keyed by task tree, sitting on the grant path in
//! front of every backend call.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::RwLock;
use tokio::time::Instant;
use tracing::debug;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Backend calls allowed per tree within one window
    pub max_requests: u32,
    pub window: Duration,
}

impl RateLimitConfig {
    pub fn per_second(max_requests: u32) -> Self {
        Self {
            max_requests,
            window: Duration::from_secs(1),
        }
    }
}

struct Window {
    calls: u32,
    opened: Instant,
}

/// Shared between every worker of the coordinator
#[derive(Clone)]
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Arc<RwLock<HashMap<String, Window>>>,
}

impl RateLimiter {
    pub fn with_config(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// Take a slot if one is free, otherwise return the wait until the
    /// window resets
    pub async fn try_acquire(&self, key: &str) -> Result<(), Duration> {
        let mut windows = self.windows.write().await;
        let now = Instant::now();

        let window = windows.entry(key.to_string()).or_insert(Window { calls: 0, opened: now });

        if now.duration_since(window.opened) >= self.config.window {
            window.calls = 0;
            window.opened = now;
        }
        if window.calls >= self.config.max_requests {
            return Err((window.opened + self.config.window).saturating_duration_since(now));
        }

        window.calls += 1;
        Ok(())
    }

    /// Wait until a slot is available
    pub async fn acquire(&self, key: &str) {
        while let Err(wait) = self.try_acquire(key).await {
            debug!(tree = key, wait_ms = wait.as_millis() as u64, "backend rate limit reached");
            tokio::time::sleep(wait).await;
        }
    }

    /// Forget the window of a finished tree
    pub async fn forget(&self, key: &str) {
        self.windows.write().await.remove(key);
    }

    pub async fn tracked(&self) -> usize {
        self.windows.read().await.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_window_limit_reports_wait() {
        let limiter = RateLimiter::with_config(RateLimitConfig {
            max_requests: 3,
            window: Duration::from_secs(60),
        });

        for _ in 0..3 {
            assert!(limiter.try_acquire("tree1").await.is_ok());
        }
        assert_eq!(limiter.try_acquire("tree1").await, Err(Duration::from_secs(60)));
    }

    #[tokio::test]
    async fn test_trees_limited_independently() {
        let limiter = RateLimiter::with_config(RateLimitConfig::per_second(1));

        assert!(limiter.try_acquire("tree1").await.is_ok());
        assert!(limiter.try_acquire("tree2").await.is_ok());
        assert!(limiter.try_acquire("tree1").await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_acquire_waits_for_next_window() {
        let limiter = RateLimiter::with_config(RateLimitConfig::per_second(2));
        let start = Instant::now();

        limiter.acquire("tree").await;
        limiter.acquire("tree").await;
        assert_eq!(Instant::now(), start);

        limiter.acquire("tree").await;
        assert!(Instant::now() - start >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn test_forget_resets_tree() {
        let limiter = RateLimiter::with_config(RateLimitConfig::per_second(1));
        assert!(limiter.try_acquire("a").await.is_ok());
        assert!(limiter.try_acquire("b").await.is_ok());
        assert_eq!(limiter.tracked().await, 2);

        limiter.forget("a").await;
        assert_eq!(limiter.tracked().await, 1);
        assert!(limiter.try_acquire("a").await.is_ok());
    }
}
