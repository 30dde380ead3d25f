use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{AppError, Result};
use crate::worker::AnimationKind;

/// Main application configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Publish endpoint settings
    pub local: LocalConfig,
    /// Peer (subscribe endpoint) settings
    pub remote: RemoteConfig,
    /// Send/receive loop timing and failover thresholds
    pub stream: StreamConfig,
    /// Camera source settings
    pub capture: CaptureConfig,
    /// LED worker supervision settings
    pub worker: WorkerConfig,
    /// LED strands and active hours (forwarded to the worker)
    pub leds: LedConfig,
    /// Preview HTTP server settings
    pub preview: PreviewConfig,
}

impl AppConfig {
    /// Reject values that would make a loop spin or a socket unusable
    pub fn validate(&self) -> Result<()> {
        if self.local.port == 0 {
            return Err(AppError::Config("local.port must be non-zero".into()));
        }
        if self.remote.port == 0 {
            return Err(AppError::Config("remote.port must be non-zero".into()));
        }
        if self.remote.host.trim().is_empty() {
            return Err(AppError::Config("remote.host must not be empty".into()));
        }
        if self.stream.fps == 0 {
            return Err(AppError::Config("stream.fps must be non-zero".into()));
        }
        if !(1..=100).contains(&self.stream.jpeg_quality) {
            return Err(AppError::Config(format!(
                "stream.jpeg_quality must be within 1..=100, got {}",
                self.stream.jpeg_quality
            )));
        }
        if self.stream.subscriber_queue == 0 || self.stream.publisher_queue == 0 {
            return Err(AppError::Config("stream queue sizes must be non-zero".into()));
        }
        if self.worker.queue_capacity == 0 {
            return Err(AppError::Config("worker.queue_capacity must be non-zero".into()));
        }
        let (start, end) = self.leds.active_hours;
        if start > 24 || end > 24 {
            return Err(AppError::Config(format!(
                "leds.active_hours out of range: ({}, {})",
                start, end
            )));
        }
        Ok(())
    }
}

/// Publish endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LocalConfig {
    /// Address the publisher binds to
    pub bind_address: String,
    /// Port the publisher binds to
    pub port: u16,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            bind_address: "0.0.0.0".to_string(),
            port: 5555,
        }
    }
}

/// Peer configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    /// Peer host name or IP address
    pub host: String,
    /// Peer publisher port
    pub port: u16,
}

impl RemoteConfig {
    /// `host:port` form used for connecting and logging
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 5556,
        }
    }
}

/// Stream loop configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Target send rate
    pub fps: u32,
    /// JPEG quality for raw captures (1-100)
    pub jpeg_quality: u32,
    /// Upper bound for one receive attempt
    pub receive_timeout_ms: u64,
    /// Age after which the remote view is considered dead
    pub freshness_ms: u64,
    /// Consecutive receive failures tolerated before rebuilding the subscriber
    pub failure_threshold: u32,
    /// Minimum spacing between subscriber rebuilds
    pub reconnect_cooldown_ms: u64,
    /// Backoff when the camera has no frame ready
    pub frame_retry_ms: u64,
    /// Backoff after an unexpected send-loop error
    pub error_backoff_ms: u64,
    /// Initial subscriber reconnect interval
    pub reconnect_interval_ms: u64,
    /// Cap for the subscriber reconnect interval
    pub reconnect_interval_max_ms: u64,
    /// Messages buffered on the receive side before new ones are dropped
    pub subscriber_queue: usize,
    /// Messages buffered per connected peer on the publish side
    pub publisher_queue: usize,
}

impl StreamConfig {
    pub fn frame_interval(&self) -> Duration {
        Duration::from_millis(1000 / self.fps.max(1) as u64)
    }

    pub fn receive_timeout(&self) -> Duration {
        Duration::from_millis(self.receive_timeout_ms)
    }

    pub fn freshness(&self) -> Duration {
        Duration::from_millis(self.freshness_ms)
    }

    pub fn reconnect_cooldown(&self) -> Duration {
        Duration::from_millis(self.reconnect_cooldown_ms)
    }

    pub fn frame_retry(&self) -> Duration {
        Duration::from_millis(self.frame_retry_ms)
    }

    pub fn error_backoff(&self) -> Duration {
        Duration::from_millis(self.error_backoff_ms)
    }
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            fps: 30,
            jpeg_quality: 30,
            receive_timeout_ms: 1000,
            freshness_ms: 3000,
            failure_threshold: 10,
            reconnect_cooldown_ms: 5000,
            frame_retry_ms: 500,
            error_backoff_ms: 1000,
            reconnect_interval_ms: 100,
            reconnect_interval_max_ms: 1000,
            subscriber_queue: 8,
            publisher_queue: 8,
        }
    }
}

/// Camera source type
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CaptureSource {
    /// Synthetic moving gradient, no camera required
    #[default]
    TestPattern,
    /// MJPEG capture from a V4L2 device
    V4l2,
}

/// Camera configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub source: CaptureSource,
    /// V4L2 device path
    pub device: String,
    pub width: u32,
    pub height: u32,
    /// Minimum detection score for a person to be counted
    pub detection_threshold: f32,
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            source: CaptureSource::TestPattern,
            device: "/dev/video0".to_string(),
            width: 640,
            height: 480,
            detection_threshold: 0.55,
        }
    }
}

/// Worker supervision configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Launch the LED worker at all
    pub enabled: bool,
    /// Command queue bound
    pub queue_capacity: usize,
    /// Liveness check period
    pub monitor_interval_ms: u64,
    /// Delay between launch and the first command
    pub settle_ms: u64,
    /// Time the worker gets to act on TurnOffAll before termination
    pub shutdown_grace_ms: u64,
    /// Wait after SIGTERM before SIGKILL
    pub terminate_timeout_ms: u64,
    /// Worker executable (defaults to the running binary)
    pub program: Option<String>,
}

impl WorkerConfig {
    pub fn monitor_interval(&self) -> Duration {
        Duration::from_millis(self.monitor_interval_ms)
    }

    pub fn settle(&self) -> Duration {
        Duration::from_millis(self.settle_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }

    pub fn terminate_timeout(&self) -> Duration {
        Duration::from_millis(self.terminate_timeout_ms)
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            queue_capacity: 64,
            monitor_interval_ms: 1000,
            settle_ms: 500,
            shutdown_grace_ms: 500,
            terminate_timeout_ms: 3000,
            program: None,
        }
    }
}

/// One LED strand
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StrandConfig {
    pub name: String,
    /// GPIO pin label (e.g. "D18")
    pub pin: String,
    pub pixels: u32,
    pub animation: AnimationKind,
    /// Whether animation speed follows the local people count
    #[serde(default)]
    pub responds_to_people: bool,
}

/// LED configuration forwarded to the worker process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LedConfig {
    /// `[start, end)` local hours; wraps midnight when start > end
    pub active_hours: (u8, u8),
    pub strands: Vec<StrandConfig>,
}

impl Default for LedConfig {
    fn default() -> Self {
        Self {
            active_hours: (0, 24),
            strands: vec![
                StrandConfig {
                    name: "main".to_string(),
                    pin: "D18".to_string(),
                    pixels: 48,
                    animation: AnimationKind::RainbowComet,
                    responds_to_people: true,
                },
                StrandConfig {
                    name: "accent".to_string(),
                    pin: "D12".to_string(),
                    pixels: 24,
                    animation: AnimationKind::SparklePulse,
                    responds_to_people: false,
                },
            ],
        }
    }
}

/// Preview server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PreviewConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for PreviewConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            bind: "0.0.0.0:8080".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_err, assert_ok};

    #[test]
    fn test_defaults_are_valid() {
        assert_ok!(AppConfig::default().validate());
    }

    #[test]
    fn test_frame_interval() {
        let stream = StreamConfig::default();
        assert_eq!(stream.frame_interval(), Duration::from_millis(33));
    }

    #[test]
    fn test_validate_rejects_zero_fps() {
        let mut config = AppConfig::default();
        config.stream.fps = 0;
        assert!(matches!(config.validate(), Err(AppError::Config(_))));
    }

    #[test]
    fn test_validate_rejects_empty_host() {
        let mut config = AppConfig::default();
        config.remote.host = "  ".to_string();
        assert_err!(config.validate());
    }

    #[test]
    fn test_validate_rejects_bad_quality_and_hours() {
        let mut config = AppConfig::default();
        config.stream.jpeg_quality = 0;
        assert_err!(config.validate());

        let mut config = AppConfig::default();
        config.leds.active_hours = (19, 25);
        assert_err!(config.validate());

        let mut config = AppConfig::default();
        config.leds.active_hours = (19, 7);
        assert_ok!(config.validate());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: AppConfig = toml::from_str(
            r#"
            [remote]
            host = "192.168.1.20"

            [stream]
            fps = 15
            "#,
        )
        .unwrap();
        assert_eq!(config.remote.host, "192.168.1.20");
        assert_eq!(config.remote.port, 5556);
        assert_eq!(config.stream.fps, 15);
        assert_eq!(config.stream.failure_threshold, 10);
        assert_eq!(config.leds.strands.len(), 2);
    }
}
