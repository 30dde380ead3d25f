//! Subscriber rebuild policy

use std::time::{Duration, Instant};

/// Decides when the subscribe endpoint should be rebuilt
///
/// Counts consecutive failures (socket errors, malformed messages).
/// Plain timeouts are not failures. Once the count exceeds the threshold
/// and the cooldown has passed since the previous rebuild, a rebuild is
/// due and the count starts over. Time is passed in so the policy is
/// deterministic under test.
#[derive(Debug, Clone)]
pub struct ReconnectPolicy {
    threshold: u32,
    cooldown: Duration,
    failures: u32,
    last_reconnect: Option<Instant>,
}

impl ReconnectPolicy {
    pub fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            threshold,
            cooldown,
            failures: 0,
            last_reconnect: None,
        }
    }

    pub fn failures(&self) -> u32 {
        self.failures
    }

    pub fn record_success(&mut self) {
        self.failures = 0;
    }

    /// Count one failure; returns `true` when a rebuild is due now
    pub fn record_failure(&mut self, now: Instant) -> bool {
        self.failures = self.failures.saturating_add(1);
        self.poll(now)
    }

    /// Re-evaluate without counting (after a timeout)
    ///
    /// Lets a rebuild that was held back by the cooldown happen once the
    /// cooldown expires even if only timeouts follow.
    pub fn record_timeout(&mut self, now: Instant) -> bool {
        self.poll(now)
    }

    fn poll(&mut self, now: Instant) -> bool {
        if self.failures <= self.threshold {
            return false;
        }
        let cooled_down = self
            .last_reconnect
            .map_or(true, |last| now.saturating_duration_since(last) >= self.cooldown);
        if !cooled_down {
            return false;
        }
        self.last_reconnect = Some(now);
        self.failures = 0;
        true
    }
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self::new(10, Duration::from_secs(5))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn rebuilds(policy: &mut ReconnectPolicy, failures: u32, now: Instant) -> u32 {
        (0..failures)
            .filter(|_| policy.record_failure(now))
            .count() as u32
    }

    #[test]
    fn test_eleven_failures_rebuild_once() {
        let mut policy = ReconnectPolicy::default();
        assert_eq!(rebuilds(&mut policy, 11, Instant::now()), 1);
        assert_eq!(policy.failures(), 0);
    }

    #[test]
    fn test_ten_failures_do_not_rebuild() {
        let mut policy = ReconnectPolicy::default();
        assert_eq!(rebuilds(&mut policy, 10, Instant::now()), 0);
        assert_eq!(policy.failures(), 10);
    }

    #[test]
    fn test_cooldown_holds_back_second_rebuild() {
        let mut policy = ReconnectPolicy::default();
        let start = Instant::now();
        assert_eq!(rebuilds(&mut policy, 11, start), 1);

        let soon = start + Duration::from_secs(2);
        assert_eq!(rebuilds(&mut policy, 20, soon), 0);
        assert_eq!(policy.failures(), 20);

        // Cooldown expires while the peer only times out
        assert!(policy.record_timeout(start + Duration::from_secs(5)));
        assert_eq!(policy.failures(), 0);
    }

    #[test]
    fn test_success_resets_count() {
        let mut policy = ReconnectPolicy::default();
        let now = Instant::now();
        rebuilds(&mut policy, 10, now);
        policy.record_success();
        assert_eq!(rebuilds(&mut policy, 10, now), 0);
    }

    #[test]
    fn test_timeouts_are_not_counted() {
        let mut policy = ReconnectPolicy::default();
        let now = Instant::now();
        for _ in 0..100 {
            assert!(!policy.record_timeout(now));
        }
        assert_eq!(policy.failures(), 0);
    }
}
