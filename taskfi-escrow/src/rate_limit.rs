//! Process-local rate limiting for sign-in attempts
//!
//! Fixed-window counters keyed by wallet address, held in memory and swept
//! periodically. Suitable for a single instance only: several instances
//! need a shared counter store.

use std::{collections::HashMap, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tracing::debug;

use crate::error::AuthError;

/// Configuration for the rate limiter
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Attempts allowed per window
    pub max_attempts: u32,
    /// Window length in seconds
    pub window_secs: i64,
    /// Interval between sweeps of expired windows
    pub sweep_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            window_secs: 60,
            sweep_interval_secs: 60,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

/// Fixed-window attempt counter
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count an attempt for `key` at the current time
    pub fn check(&self, key: &str) -> Result<(), AuthError> {
        self.check_at(key, Utc::now())
    }

    /// Count an attempt for `key` at `now`
    pub fn check_at(&self, key: &str, now: DateTime<Utc>) -> Result<(), AuthError> {
        let window_len = chrono::Duration::seconds(self.config.window_secs);
        let mut windows = self.windows.lock();
        let window = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if now - window.started_at >= window_len {
            *window = Window {
                started_at: now,
                count: 0,
            };
        }

        if window.count >= self.config.max_attempts {
            let retry_after = (window.started_at + window_len - now).num_seconds().max(1);
            return Err(AuthError::RateLimited {
                retry_after_secs: retry_after as u64,
            });
        }

        window.count += 1;
        Ok(())
    }

    /// Drop windows that have expired by `now`; returns how many were removed
    pub fn sweep_at(&self, now: DateTime<Utc>) -> usize {
        let window_len = chrono::Duration::seconds(self.config.window_secs);
        let mut windows = self.windows.lock();
        let before = windows.len();
        windows.retain(|_, w| now - w.started_at < window_len);
        before - windows.len()
    }

    pub fn sweep(&self) -> usize {
        self.sweep_at(Utc::now())
    }

    /// Number of keys currently tracked
    pub fn tracked(&self) -> usize {
        self.windows.lock().len()
    }

    /// Run `sweep` on a fixed interval until the handle is aborted
    pub fn spawn_sweeper(self: &Arc<Self>) -> JoinHandle<()> {
        let limiter = Arc::clone(self);
        let every = Duration::from_secs(self.config.sweep_interval_secs.max(1));
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(removed, "Swept expired rate-limit windows");
                }
            }
        })
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_attempts: u32) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_attempts,
            window_secs: 60,
            sweep_interval_secs: 1,
        })
    }

    #[test]
    fn test_limit_and_window_reset() {
        let limiter = limiter(3);
        let t0 = Utc::now();

        for _ in 0..3 {
            assert!(limiter.check_at("wallet", t0).is_ok());
        }
        let err = limiter.check_at("wallet", t0).unwrap_err();
        assert_eq!(err, AuthError::RateLimited { retry_after_secs: 60 });

        // Other keys are independent
        assert!(limiter.check_at("other", t0).is_ok());

        // A new window starts once the old one has elapsed
        let later = t0 + chrono::Duration::seconds(60);
        assert!(limiter.check_at("wallet", later).is_ok());
    }

    #[test]
    fn test_sweep_removes_expired_windows() {
        let limiter = limiter(5);
        let t0 = Utc::now();
        limiter.check_at("a", t0).unwrap();
        limiter.check_at("b", t0 + chrono::Duration::seconds(30)).unwrap();
        assert_eq!(limiter.tracked(), 2);

        assert_eq!(limiter.sweep_at(t0 + chrono::Duration::seconds(61)), 1);
        assert_eq!(limiter.tracked(), 1);
    }

    #[tokio::test]
    async fn test_background_sweeper() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig {
            max_attempts: 5,
            window_secs: 0,
            sweep_interval_secs: 1,
        }));
        limiter.check("a").unwrap();

        let handle = limiter.spawn_sweeper();
        // The first tick fires immediately
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(limiter.tracked(), 0);
        handle.abort();
    }
}
