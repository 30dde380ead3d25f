//! Local/remote view selection driven by remote frame freshness

use std::sync::Arc;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

use crate::state::{Field, SharedState, Value};
use crate::video::DisplayFrame;

/// Which content the display shows
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum View {
    Local,
    Remote,
}

impl View {
    pub fn from_display_local(display_local: bool) -> Self {
        if display_local {
            Self::Local
        } else {
            Self::Remote
        }
    }

    /// Current view as recorded in `state`
    pub fn current(state: &SharedState) -> Self {
        Self::from_display_local(state.display_local())
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Local => "local",
            Self::Remote => "remote",
        }
    }
}

impl std::fmt::Display for View {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Result of a liveness check that left the remote view
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct StaleRemote {
    /// Age of the last remote frame, `None` if none was ever received
    pub age: Option<Duration>,
}

/// View-selector state machine
///
/// `Local` is the initial state. An accepted remote frame moves to
/// `Remote`; a remote frame older than the freshness window moves back.
/// State lives in [`SharedState`] so the display reads it directly.
#[derive(Debug, Clone)]
pub struct ViewSelector {
    freshness: Duration,
}

impl ViewSelector {
    pub fn new(freshness: Duration) -> Self {
        Self { freshness }
    }

    pub fn freshness(&self) -> Duration {
        self.freshness
    }

    /// Store a decoded remote frame and switch to `Remote`
    ///
    /// The frame, count, receive time and view flag change in a single
    /// critical section. Returns the view that was active before.
    pub fn accept_remote(
        &self,
        state: &SharedState,
        frame: Arc<DisplayFrame>,
        people_count: u32,
        now: Instant,
    ) -> View {
        state.with_lock(|fields| {
            let previous = View::from_display_local(fields.get(Field::DisplayLocal, true));
            fields.set(Field::RemoteFrame, Value::Frame(frame));
            fields.set(Field::RemoteNumPeople, people_count);
            fields.set(Field::LastRemoteFrameTime, now);
            fields.set(Field::DisplayLocal, false);
            previous
        })
    }

    /// Fall back to `Local` if the remote view has gone stale
    ///
    /// Stale means strictly older than the freshness window, or no
    /// remote frame at all. Only leaves `Remote`; `Local` is untouched.
    pub fn check_liveness(&self, state: &SharedState, now: Instant) -> Option<StaleRemote> {
        state.with_lock(|fields| {
            if fields.get(Field::DisplayLocal, true) {
                return None;
            }
            let last: Option<Instant> = fields.get(Field::LastRemoteFrameTime, None);
            let age = last.map(|t| now.saturating_duration_since(t));
            let stale = age.map_or(true, |age| age > self.freshness);
            if !stale {
                return None;
            }
            fields.set(Field::DisplayLocal, true);
            Some(StaleRemote { age })
        })
    }
}

impl Default for ViewSelector {
    fn default() -> Self {
        Self::new(Duration::from_secs(3))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;

    fn frame() -> Arc<DisplayFrame> {
        Arc::new(DisplayFrame::new(2, 2, Bytes::new(), Bytes::new()))
    }

    #[test]
    fn test_accept_switches_to_remote() {
        let state = SharedState::with_defaults();
        let selector = ViewSelector::default();
        let now = Instant::now();

        assert_eq!(selector.accept_remote(&state, frame(), 2, now), View::Local);
        assert_eq!(View::current(&state), View::Remote);
        assert_eq!(state.remote_num_people(), 2);
        assert_eq!(state.get::<Option<Instant>>(Field::LastRemoteFrameTime, None), Some(now));

        // Already remote: reported so the caller does not log again
        assert_eq!(selector.accept_remote(&state, frame(), 3, now), View::Remote);
    }

    #[test]
    fn test_freshness_boundary() {
        let state = SharedState::with_defaults();
        let selector = ViewSelector::default();
        let t = Instant::now();
        selector.accept_remote(&state, frame(), 1, t);

        assert!(selector
            .check_liveness(&state, t + Duration::from_millis(2999))
            .is_none());
        assert_eq!(View::current(&state), View::Remote);

        let stale = selector
            .check_liveness(&state, t + Duration::from_millis(3001))
            .unwrap();
        assert_eq!(stale.age, Some(Duration::from_millis(3001)));
        assert_eq!(View::current(&state), View::Local);
    }

    #[test]
    fn test_exactly_at_window_stays_remote() {
        let state = SharedState::with_defaults();
        let selector = ViewSelector::default();
        let t = Instant::now();
        selector.accept_remote(&state, frame(), 1, t);
        assert!(selector
            .check_liveness(&state, t + Duration::from_secs(3))
            .is_none());
    }

    #[test]
    fn test_local_is_never_changed_by_liveness() {
        let state = SharedState::with_defaults();
        let selector = ViewSelector::default();
        let later = Instant::now() + Duration::from_secs(60);
        assert!(selector.check_liveness(&state, later).is_none());
        assert_eq!(View::current(&state), View::Local);
    }

    #[test]
    fn test_remote_without_timestamp_falls_back() {
        let state = SharedState::with_defaults();
        state.set(Field::DisplayLocal, false);
        let stale = ViewSelector::default()
            .check_liveness(&state, Instant::now())
            .unwrap();
        assert_eq!(stale.age, None);
        assert!(state.display_local());
    }
}
