//! System event types
//!
//! Defines all event types that can be broadcast through the event bus.

use serde::{Deserialize, Serialize};

use crate::stream::View;
use crate::worker::RestartNotice;

/// System event enumeration
///
/// Serialized for the preview server's event stream as:
/// ```json
/// {
///   "event": "link.view_changed",
///   "data": { "view": "remote", "reason": "frame received" }
/// }
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum SystemEvent {
    // ============================================================================
    // Link Events
    // ============================================================================
    /// Displayed content switched between local and remote
    #[serde(rename = "link.view_changed")]
    ViewChanged {
        view: View,
        /// Human readable cause ("frame received", "remote stale for 3.2s")
        reason: String,
    },

    /// Subscriber endpoint was torn down and rebuilt
    #[serde(rename = "link.subscriber_recreated")]
    SubscriberRecreated {
        /// Remote address the new endpoint connects to
        remote: String,
        /// Consecutive failures that triggered the rebuild
        failures: u32,
    },

    /// Publish endpoint bound
    #[serde(rename = "link.publisher_bound")]
    PublisherBound { port: u16 },

    // ============================================================================
    // Worker Events
    // ============================================================================
    /// First worker instance launched
    #[serde(rename = "worker.started")]
    WorkerStarted { pid: Option<u32>, generation: u64 },

    /// A dead worker was replaced
    #[serde(rename = "worker.restarted")]
    WorkerRestarted(RestartNotice),

    /// Worker terminated during shutdown
    #[serde(rename = "worker.stopped")]
    WorkerStopped { generation: u64 },
}

impl SystemEvent {
    /// Get the event name (for filtering)
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::ViewChanged { .. } => "link.view_changed",
            Self::SubscriberRecreated { .. } => "link.subscriber_recreated",
            Self::PublisherBound { .. } => "link.publisher_bound",
            Self::WorkerStarted { .. } => "worker.started",
            Self::WorkerRestarted(_) => "worker.restarted",
            Self::WorkerStopped { .. } => "worker.stopped",
        }
    }

    /// Check if event matches a topic pattern
    ///
    /// Supports wildcards: `link.*` matches all link events, `*` matches everything.
    pub fn matches_topic(&self, topic: &str) -> bool {
        if topic == "*" {
            return true;
        }

        let event_name = self.event_name();

        if let Some(prefix) = topic.strip_suffix(".*") {
            event_name.starts_with(prefix)
                && event_name.as_bytes().get(prefix.len()) == Some(&b'.')
        } else {
            event_name == topic
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_serialization() {
        let event = SystemEvent::ViewChanged {
            view: View::Remote,
            reason: "frame received".to_string(),
        };

        let json = serde_json::to_string(&event).unwrap();
        assert!(json.contains("link.view_changed"));
        assert!(json.contains("\"remote\""));
    }

    #[test]
    fn test_matches_topic() {
        let event = SystemEvent::SubscriberRecreated {
            remote: "10.0.0.2:5555".to_string(),
            failures: 11,
        };

        assert!(event.matches_topic("*"));
        assert!(event.matches_topic("link.*"));
        assert!(event.matches_topic("link.subscriber_recreated"));
        assert!(!event.matches_topic("worker.*"));
        assert!(!event.matches_topic("lin.*"));
    }
}
