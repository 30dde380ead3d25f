//! One publish endpoint plus one subscribe endpoint

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::net::TcpStream;
use tracing::{debug, info, warn};

use super::publisher::Publisher;
use super::reconnect::ReconnectPolicy;
use super::subscriber::{Subscriber, SubscriberOptions};
use super::{Received, TransportError};
use crate::config::AppConfig;
use crate::error::{AppError, Result};
use crate::state::RunContext;
use crate::wire::decode;

/// Addresses and tuning for a [`DuplexChannel`]
#[derive(Debug, Clone)]
pub struct ChannelConfig {
    pub bind: SocketAddr,
    /// `host:port` of the peer's publisher
    pub remote: String,
    pub publisher_queue: usize,
    pub subscriber: SubscriberOptions,
    pub failure_threshold: u32,
    pub reconnect_cooldown: Duration,
}

impl ChannelConfig {
    pub fn from_app(config: &AppConfig) -> Result<Self> {
        let ip: IpAddr = config.local.bind_address.parse().map_err(|e| {
            AppError::Config(format!(
                "invalid local.bind_address '{}': {}",
                config.local.bind_address, e
            ))
        })?;
        let stream = &config.stream;
        Ok(Self {
            bind: SocketAddr::new(ip, config.local.port),
            remote: config.remote.address(),
            publisher_queue: stream.publisher_queue,
            subscriber: SubscriberOptions {
                queue: stream.subscriber_queue,
                reconnect_interval: Duration::from_millis(stream.reconnect_interval_ms),
                reconnect_interval_max: Duration::from_millis(stream.reconnect_interval_max_ms),
            },
            failure_threshold: stream.failure_threshold,
            reconnect_cooldown: stream.reconnect_cooldown(),
        })
    }
}

/// Symmetric link to the peer
///
/// The publisher is shared (the send loop publishes through it) and is
/// never rebuilt. The subscriber belongs to whoever receives, and is
/// rebuilt by [`DuplexChannel::apply_policy`] when failures pile up.
pub struct DuplexChannel {
    publisher: Arc<Publisher>,
    subscriber: Subscriber,
    options: SubscriberOptions,
    policy: ReconnectPolicy,
}

impl DuplexChannel {
    /// Bind the publish endpoint and start subscribing to the peer
    ///
    /// A bind failure is returned; the subscriber never fails to start.
    pub fn open(config: &ChannelConfig) -> std::result::Result<Self, TransportError> {
        let publisher = Publisher::bind(config.bind, config.publisher_queue)?;
        let subscriber = Subscriber::connect(config.remote.clone(), config.subscriber.clone());
        Ok(Self {
            publisher: Arc::new(publisher),
            subscriber,
            options: config.subscriber.clone(),
            policy: ReconnectPolicy::new(config.failure_threshold, config.reconnect_cooldown),
        })
    }

    pub fn publisher(&self) -> Arc<Publisher> {
        self.publisher.clone()
    }

    pub fn publish(&self, parts: Vec<Bytes>) -> bool {
        self.publisher.publish(parts)
    }

    pub fn remote(&self) -> &str {
        self.subscriber.remote()
    }

    pub fn is_connected(&self) -> bool {
        self.subscriber.is_connected()
    }

    pub fn policy(&self) -> &ReconnectPolicy {
        &self.policy
    }

    /// Wait up to `timeout` for one decoded message
    pub async fn try_receive(&mut self, timeout: Duration) -> Received {
        match self.subscriber.recv_timeout(timeout).await {
            None => Received::Timeout,
            Some(Ok(parts)) => match decode(parts) {
                Ok(message) => Received::Message(message),
                Err(e) => Received::Error(TransportError::Malformed(e)),
            },
            Some(Err(e)) => Received::Error(e),
        }
    }

    /// Tear down the subscribe endpoint and connect a fresh one
    pub fn recreate_subscriber(&mut self) {
        let remote = self.subscriber.remote().to_string();
        info!("Recreating subscriber for {}", remote);
        self.subscriber = Subscriber::connect(remote, self.options.clone());
    }

    /// Feed a receive outcome into the reconnect policy
    ///
    /// Rebuilds the subscriber when due and returns the failure count
    /// that triggered it.
    pub fn apply_policy(&mut self, outcome: &Received, now: Instant) -> Option<u32> {
        let mut failures = self.policy.failures();
        let rebuild = match outcome {
            Received::Message(_) => {
                self.policy.record_success();
                false
            }
            Received::Timeout => self.policy.record_timeout(now),
            Received::Error(_) => {
                failures = failures.saturating_add(1);
                self.policy.record_failure(now)
            }
        };
        if !rebuild {
            return None;
        }
        warn!(
            "Too many consecutive failures ({}), recreating subscriber",
            failures
        );
        self.recreate_subscriber();
        Some(failures)
    }
}

/// Connect to `addr`, retrying with a fixed backoff until it succeeds
///
/// Returns `None` when the run context stops first.
pub async fn connect_with_retry(
    addr: &str,
    backoff: Duration,
    ctx: &RunContext,
) -> Option<TcpStream> {
    let mut attempt: u32 = 0;
    while ctx.should_run() {
        attempt += 1;
        match TcpStream::connect(addr).await {
            Ok(stream) => {
                info!("Connected to {} after {} attempt(s)", addr, attempt);
                return Some(stream);
            }
            Err(e) => {
                debug!("Connect attempt {} to {} failed: {}", attempt, addr, e);
                if !ctx.sleep(backoff).await {
                    break;
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::state::SharedState;
    use crate::wire::encode;

    fn local_config(bind_port: u16, remote_port: u16) -> ChannelConfig {
        ChannelConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], bind_port)),
            remote: format!("127.0.0.1:{}", remote_port),
            publisher_queue: 8,
            subscriber: SubscriberOptions::default(),
            failure_threshold: 10,
            reconnect_cooldown: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn test_loopback_self_subscription() {
        let mut channel = DuplexChannel::open(&local_config(0, 1)).unwrap();
        let port = channel.publisher().local_addr().port();
        // Point the subscriber at our own publisher
        channel.subscriber = Subscriber::connect(
            format!("127.0.0.1:{}", port),
            SubscriberOptions::default(),
        );

        let deadline = Instant::now() + Duration::from_secs(5);
        let message = loop {
            assert!(Instant::now() < deadline, "no message looped back");
            channel.publish(encode(4, Bytes::from_static(b"jpeg")).unwrap());
            if let Received::Message(m) = channel.try_receive(Duration::from_millis(100)).await {
                break m;
            }
        };
        assert_eq!(message.metadata.people_count, 4);
        assert_eq!(message.image, Bytes::from_static(b"jpeg"));
    }

    #[tokio::test]
    async fn test_policy_rebuilds_after_threshold() {
        let mut channel = DuplexChannel::open(&local_config(0, 1)).unwrap();
        let now = Instant::now();
        let failure = || Received::Error(TransportError::Closed);

        for _ in 0..10 {
            assert_eq!(channel.apply_policy(&failure(), now), None);
        }
        assert_eq!(channel.apply_policy(&failure(), now), Some(11));
        assert_eq!(channel.policy().failures(), 0);
        assert_eq!(channel.apply_policy(&Received::Timeout, now), None);
    }

    #[tokio::test]
    async fn test_connect_with_retry_stops_with_context() {
        let ctx = RunContext::new(
            Arc::new(SharedState::with_defaults()),
            Arc::new(EventBus::new()),
        );
        ctx.stop();
        assert!(connect_with_retry("127.0.0.1:1", Duration::from_secs(3), &ctx)
            .await
            .is_none());
    }
}
