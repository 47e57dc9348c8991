//! Rate limiting for repeated log lines and viewer advisories
//!
//! A failing capture pipeline retries every few hundred milliseconds; without
//! throttling each retry would produce a log line and a message to the viewer.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::time::{Duration, Instant};

/// Limits how often the same key is allowed through
///
/// # Example
///
/// ```rust
/// use std::time::Duration;
/// use droid_mirror::utils::LogThrottler;
///
/// let throttler = LogThrottler::new(Duration::from_secs(5));
/// assert!(throttler.should_log("capture_failed"));
/// assert!(!throttler.should_log("capture_failed"));
/// ```
pub struct LogThrottler {
    last_logged: Mutex<HashMap<String, Instant>>,
    interval: Duration,
}

impl LogThrottler {
    /// Create a throttler letting each key through at most once per `interval`
    pub fn new(interval: Duration) -> Self {
        Self {
            last_logged: Mutex::new(HashMap::new()),
            interval,
        }
    }

    /// Create a throttler with the interval given in seconds
    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Returns `true` (and records the time) if `key` is not throttled
    pub fn should_log(&self, key: &str) -> bool {
        self.should_log_at(key, Instant::now())
    }

    fn should_log_at(&self, key: &str, now: Instant) -> bool {
        let mut map = self.last_logged.lock();
        match map.get_mut(key) {
            Some(last) if now.duration_since(*last) < self.interval => false,
            Some(last) => {
                *last = now;
                true
            }
            None => {
                map.insert(key.to_string(), now);
                true
            }
        }
    }

    /// Forget `key`, so the next occurrence is let through immediately
    ///
    /// Call this when the condition recovers.
    pub fn clear(&self, key: &str) {
        self.last_logged.lock().remove(key);
    }

    /// Number of tracked keys
    pub fn len(&self) -> usize {
        self.last_logged.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.last_logged.lock().is_empty()
    }
}

impl Default for LogThrottler {
    /// 5 second interval
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `tracing::warn!`
///
/// ```rust
/// use droid_mirror::utils::LogThrottler;
/// use droid_mirror::warn_throttled;
///
/// let throttler = LogThrottler::default();
/// warn_throttled!(throttler, "snapshot", "Snapshot failed: {}", "timeout");
/// ```
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if $throttler.should_log($key) {
            tracing::warn!($($arg)*);
        }
    };
}
