//! Shared link state and the run context handed to every task
//!
//! `SharedState` is a lock-guarded map of named fields. It is the only
//! data shared between the send loop, the receive loop, the preview
//! server and the worker supervisor. Multi-field updates that must be
//! observed together go through [`SharedState::update_many`] or
//! [`SharedState::with_lock`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::events::EventBus;
use crate::video::DisplayFrame;

/// Named fields held in [`SharedState`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Field {
    /// `true` while the local view is shown
    DisplayLocal,
    /// People detected by the local camera
    LocalNumPeople,
    /// People count reported by the peer
    RemoteNumPeople,
    /// When the last remote frame was accepted
    LastRemoteFrameTime,
    /// Last decoded remote frame
    RemoteFrame,
    /// Last locally encoded JPEG
    LocalFrame,
}

impl Field {
    pub fn name(&self) -> &'static str {
        match self {
            Self::DisplayLocal => "display_local",
            Self::LocalNumPeople => "local_num_people",
            Self::RemoteNumPeople => "remote_num_people",
            Self::LastRemoteFrameTime => "last_remote_frame_time",
            Self::RemoteFrame => "remote_frame",
            Self::LocalFrame => "local_frame",
        }
    }
}

impl std::fmt::Display for Field {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// A value stored under a [`Field`]
#[derive(Debug, Clone)]
pub enum Value {
    Bool(bool),
    Count(u32),
    Time(Instant),
    Frame(Arc<DisplayFrame>),
    Jpeg(Bytes),
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Self::Bool(v)
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Self::Count(v)
    }
}

impl From<Instant> for Value {
    fn from(v: Instant) -> Self {
        Self::Time(v)
    }
}

impl From<Arc<DisplayFrame>> for Value {
    fn from(v: Arc<DisplayFrame>) -> Self {
        Self::Frame(v)
    }
}

impl From<Bytes> for Value {
    fn from(v: Bytes) -> Self {
        Self::Jpeg(v)
    }
}

/// Typed extraction from a [`Value`]
///
/// Returns `None` when the stored value is of a different kind, which
/// makes [`SharedState::get`] fall back to the caller's default.
pub trait FromValue: Sized {
    fn from_value(value: &Value) -> Option<Self>;
}

impl FromValue for bool {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Bool(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for u32 {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Count(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for Instant {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Time(v) => Some(*v),
            _ => None,
        }
    }
}

impl FromValue for Arc<DisplayFrame> {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Frame(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl FromValue for Bytes {
    fn from_value(value: &Value) -> Option<Self> {
        match value {
            Value::Jpeg(v) => Some(v.clone()),
            _ => None,
        }
    }
}

impl<T: FromValue> FromValue for Option<T> {
    fn from_value(value: &Value) -> Option<Self> {
        T::from_value(value).map(Some)
    }
}

/// Field map visible inside a critical section
#[derive(Debug, Clone, Default)]
pub struct StateFields {
    values: HashMap<Field, Value>,
}

impl StateFields {
    pub fn get<T: FromValue>(&self, field: Field, default: T) -> T {
        self.values
            .get(&field)
            .and_then(T::from_value)
            .unwrap_or(default)
    }

    pub fn set(&mut self, field: Field, value: impl Into<Value>) {
        self.values.insert(field, value.into());
    }

    pub fn remove(&mut self, field: Field) -> Option<Value> {
        self.values.remove(&field)
    }

    pub fn contains(&self, field: Field) -> bool {
        self.values.contains_key(&field)
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Thread-safe container for the link state
#[derive(Debug, Default)]
pub struct SharedState {
    inner: Mutex<StateFields>,
}

impl SharedState {
    /// Create a state with explicit initial values
    pub fn new(initial: impl IntoIterator<Item = (Field, Value)>) -> Self {
        let state = Self::default();
        state.update_many(initial);
        state
    }

    /// Startup values: local view shown, nobody seen on either side
    pub fn with_defaults() -> Self {
        Self::new([
            (Field::DisplayLocal, Value::Bool(true)),
            (Field::LocalNumPeople, Value::Count(0)),
            (Field::RemoteNumPeople, Value::Count(0)),
        ])
    }

    /// Read a field, returning `default` when it is absent or of another kind
    pub fn get<T: FromValue>(&self, field: Field, default: T) -> T {
        self.inner.lock().get(field, default)
    }

    pub fn set(&self, field: Field, value: impl Into<Value>) {
        self.inner.lock().set(field, value);
    }

    pub fn remove(&self, field: Field) -> Option<Value> {
        self.inner.lock().remove(field)
    }

    /// Write several fields in one critical section
    pub fn update_many(&self, updates: impl IntoIterator<Item = (Field, Value)>) {
        let mut fields = self.inner.lock();
        for (field, value) in updates {
            fields.set(field, value);
        }
    }

    /// Run a compound read-modify-write under the lock
    ///
    /// The closure must not block or await; the lock is held for its
    /// whole duration.
    pub fn with_lock<R>(&self, f: impl FnOnce(&mut StateFields) -> R) -> R {
        let mut fields = self.inner.lock();
        f(&mut fields)
    }

    /// Copy of every field
    pub fn snapshot(&self) -> StateFields {
        self.inner.lock().clone()
    }

    pub fn display_local(&self) -> bool {
        self.get(Field::DisplayLocal, true)
    }

    pub fn local_num_people(&self) -> u32 {
        self.get(Field::LocalNumPeople, 0)
    }

    pub fn remote_num_people(&self) -> u32 {
        self.get(Field::RemoteNumPeople, 0)
    }
}

/// Handle passed to every task at creation
///
/// Carries the process-wide run flag together with the shared state and
/// the event bus, so no task depends on module-level globals.
#[derive(Clone)]
pub struct RunContext {
    running: Arc<AtomicBool>,
    stop_notify: Arc<Notify>,
    state: Arc<SharedState>,
    events: Arc<EventBus>,
}

impl RunContext {
    pub fn new(state: Arc<SharedState>, events: Arc<EventBus>) -> Self {
        Self {
            running: Arc::new(AtomicBool::new(true)),
            stop_notify: Arc::new(Notify::new()),
            state,
            events,
        }
    }

    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    pub fn events(&self) -> &Arc<EventBus> {
        &self.events
    }

    pub fn should_run(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Ask every task to finish its current iteration and exit
    pub fn stop(&self) {
        if self.running.swap(false, Ordering::AcqRel) {
            tracing::info!("Stop requested");
        }
        self.stop_notify.notify_waiters();
    }

    /// Sleep for `duration`, waking early on stop
    ///
    /// Returns whether the caller should keep running.
    pub async fn sleep(&self, duration: Duration) -> bool {
        let notified = self.stop_notify.notified();
        if !self.should_run() {
            return false;
        }
        tokio::select! {
            _ = tokio::time::sleep(duration) => self.should_run(),
            _ = notified => false,
        }
    }

    /// Resolve once [`RunContext::stop`] has been called
    pub async fn stopped(&self) {
        loop {
            let notified = self.stop_notify.notified();
            if !self.should_run() {
                return;
            }
            notified.await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn test_absent_field_returns_default() {
        let state = SharedState::default();
        assert_eq!(state.get(Field::LocalNumPeople, 7u32), 7);
        assert!(state.get(Field::DisplayLocal, true));
        assert!(state.get::<Option<Instant>>(Field::LastRemoteFrameTime, None).is_none());
    }

    #[test]
    fn test_mismatched_kind_returns_default() {
        let state = SharedState::default();
        state.set(Field::LocalNumPeople, true);
        assert_eq!(state.get(Field::LocalNumPeople, 3u32), 3);
    }

    #[test]
    fn test_defaults() {
        let state = SharedState::with_defaults();
        assert!(state.display_local());
        assert_eq!(state.local_num_people(), 0);
        assert_eq!(state.remote_num_people(), 0);
        assert!(!state.snapshot().contains(Field::RemoteFrame));
    }

    #[test]
    fn test_with_lock_read_modify_write() {
        let state = Arc::new(SharedState::with_defaults());
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let state = state.clone();
                thread::spawn(move || {
                    for _ in 0..1000 {
                        state.with_lock(|fields| {
                            let n = fields.get(Field::LocalNumPeople, 0u32);
                            fields.set(Field::LocalNumPeople, n + 1);
                        });
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(state.local_num_people(), 8000);
    }

    #[test]
    fn test_update_many_is_observed_atomically() {
        // Writer always stores count == frame width; readers must never
        // see a count paired with a frame from another write.
        let state = Arc::new(SharedState::with_defaults());
        let writer = {
            let state = state.clone();
            thread::spawn(move || {
                for i in 1..=2000u32 {
                    let frame = Arc::new(DisplayFrame::new(i, 1, Bytes::new(), Bytes::new()));
                    state.update_many([
                        (Field::RemoteFrame, Value::from(frame)),
                        (Field::RemoteNumPeople, Value::from(i)),
                        (Field::LastRemoteFrameTime, Value::from(Instant::now())),
                    ]);
                }
            })
        };
        let readers: Vec<_> = (0..4)
            .map(|_| {
                let state = state.clone();
                thread::spawn(move || {
                    for _ in 0..2000 {
                        let (frame, count) = state.with_lock(|fields| {
                            (
                                fields.get::<Option<Arc<DisplayFrame>>>(Field::RemoteFrame, None),
                                fields.get(Field::RemoteNumPeople, 0u32),
                            )
                        });
                        if let Some(frame) = frame {
                            assert_eq!(frame.width, count);
                        } else {
                            assert_eq!(count, 0);
                        }
                    }
                })
            })
            .collect();
        writer.join().unwrap();
        for reader in readers {
            reader.join().unwrap();
        }
    }

    #[tokio::test]
    async fn test_sleep_wakes_on_stop() {
        let ctx = RunContext::new(Arc::new(SharedState::with_defaults()), Arc::new(EventBus::new()));
        let sleeper = {
            let ctx = ctx.clone();
            tokio::spawn(async move { ctx.sleep(Duration::from_secs(30)).await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        ctx.stop();
        let keep_running = tokio::time::timeout(Duration::from_secs(2), sleeper)
            .await
            .unwrap()
            .unwrap();
        assert!(!keep_running);
        assert!(!ctx.should_run());
    }
}
