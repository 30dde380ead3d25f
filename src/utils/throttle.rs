//! Rate-limited logging for errors that repeat every loop iteration
//!
//! A dead peer makes the receive loop fail many times per second. The
//! throttler lets the first occurrence through, swallows repeats for an
//! interval and reports how many were swallowed when it next logs.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

#[derive(Debug, Clone, Copy)]
struct Entry {
    last: Instant,
    suppressed: u64,
}

/// Per-key log limiter
pub struct LogThrottler {
    entries: Mutex<HashMap<&'static str, Entry>>,
    interval: Duration,
}

impl LogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            interval,
        }
    }

    pub fn with_secs(secs: u64) -> Self {
        Self::new(Duration::from_secs(secs))
    }

    /// Whether `key` may be logged now
    pub fn should_log(&self, key: &'static str) -> bool {
        self.check(key).is_some()
    }

    /// Like [`should_log`](Self::should_log), returning the number of
    /// occurrences swallowed since the last logged one
    pub fn check(&self, key: &'static str) -> Option<u64> {
        self.check_at(key, Instant::now())
    }

    fn check_at(&self, key: &'static str, now: Instant) -> Option<u64> {
        let mut entries = self.entries.lock();
        match entries.get_mut(key) {
            Some(entry) if now.duration_since(entry.last) < self.interval => {
                entry.suppressed += 1;
                None
            }
            Some(entry) => {
                let suppressed = entry.suppressed;
                *entry = Entry {
                    last: now,
                    suppressed: 0,
                };
                Some(suppressed)
            }
            None => {
                entries.insert(
                    key,
                    Entry {
                        last: now,
                        suppressed: 0,
                    },
                );
                Some(0)
            }
        }
    }

    /// Forget `key` so its next occurrence logs immediately
    ///
    /// Call when the condition recovers.
    pub fn clear(&self, key: &'static str) {
        self.entries.lock().remove(key);
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

impl Default for LogThrottler {
    fn default() -> Self {
        Self::with_secs(5)
    }
}

/// Throttled `warn!`, appending the suppressed count when non-zero
#[macro_export]
macro_rules! warn_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::warn!(suppressed, $($arg)*);
            } else {
                tracing::warn!($($arg)*);
            }
        }
    };
}

/// Throttled `error!`, appending the suppressed count when non-zero
#[macro_export]
macro_rules! error_throttled {
    ($throttler:expr, $key:expr, $($arg:tt)*) => {
        if let Some(suppressed) = $throttler.check($key) {
            if suppressed > 0 {
                tracing::error!(suppressed, $($arg)*);
            } else {
                tracing::error!($($arg)*);
            }
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_occurrence_logs() {
        let throttler = LogThrottler::with_secs(1);
        assert_eq!(throttler.check("recv"), Some(0));
        assert!(!throttler.should_log("recv"));
    }

    #[test]
    fn test_suppressed_count_reported() {
        let throttler = LogThrottler::new(Duration::from_millis(100));
        let start = Instant::now();

        assert_eq!(throttler.check_at("recv", start), Some(0));
        assert_eq!(throttler.check_at("recv", start + Duration::from_millis(10)), None);
        assert_eq!(throttler.check_at("recv", start + Duration::from_millis(20)), None);
        assert_eq!(
            throttler.check_at("recv", start + Duration::from_millis(150)),
            Some(2)
        );
    }

    #[test]
    fn test_keys_are_independent() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("a"));
        assert!(throttler.should_log("b"));
        assert!(!throttler.should_log("a"));
        assert_eq!(throttler.len(), 2);
    }

    #[test]
    fn test_clear_on_recovery() {
        let throttler = LogThrottler::with_secs(10);
        assert!(throttler.should_log("recv"));
        throttler.clear("recv");
        assert!(throttler.should_log("recv"));
        throttler.clear("recv");
        assert!(throttler.is_empty());
    }
}
