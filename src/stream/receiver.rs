//! Receive loop: consume peer frames, select the view, keep the link alive

use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use super::view::{View, ViewSelector};
use crate::events::SystemEvent;
use crate::state::RunContext;
use crate::transport::{DuplexChannel, Received};
use crate::utils::LogThrottler;
use crate::video::ImageCodec;
use crate::warn_throttled;
use crate::wire::FrameMessage;

/// Consumes the peer stream and drives the view selector
///
/// Owns the subscribe side of the [`DuplexChannel`]; it is the only task
/// that rebuilds the subscriber.
pub struct ReceiveLoop {
    ctx: RunContext,
    channel: DuplexChannel,
    codec: Arc<Mutex<Box<dyn ImageCodec>>>,
    selector: ViewSelector,
    receive_timeout: Duration,
    throttler: LogThrottler,
}

impl ReceiveLoop {
    pub fn new(
        ctx: RunContext,
        channel: DuplexChannel,
        codec: Box<dyn ImageCodec>,
        selector: ViewSelector,
        receive_timeout: Duration,
    ) -> Self {
        Self {
            ctx,
            channel,
            codec: Arc::new(Mutex::new(codec)),
            selector,
            receive_timeout,
            throttler: LogThrottler::default(),
        }
    }

    pub async fn run(mut self) {
        info!("Receive loop started (remote: {})", self.channel.remote());

        while self.ctx.should_run() {
            let ctx = self.ctx.clone();
            let outcome = tokio::select! {
                outcome = self.channel.try_receive(self.receive_timeout) => outcome,
                _ = ctx.stopped() => break,
            };
            self.handle(outcome, Instant::now()).await;
        }

        info!("Receive loop stopped");
    }

    /// Process one receive outcome
    pub async fn handle(&mut self, outcome: Received, now: Instant) {
        match &outcome {
            Received::Message(message) => {
                self.throttler.clear("recv_error");
                self.accept(message, now).await;
            }
            Received::Timeout => debug!("Timeout waiting for message"),
            Received::Error(e) => {
                warn_throttled!(self.throttler, "recv_error", "Receive failed: {}", e);
            }
        }

        if let Some(failures) = self.channel.apply_policy(&outcome, now) {
            self.ctx.events().publish(SystemEvent::SubscriberRecreated {
                remote: self.channel.remote().to_string(),
                failures,
            });
        }

        if let Some(stale) = self.selector.check_liveness(self.ctx.state(), now) {
            let reason = match stale.age {
                Some(age) => format!("remote stale for {:.1}s", age.as_secs_f64()),
                None => "no remote frame".to_string(),
            };
            info!("Switched to local view: {}", reason);
            self.ctx.events().publish(SystemEvent::ViewChanged {
                view: View::Local,
                reason,
            });
        }
    }

    async fn accept(&self, message: &FrameMessage, now: Instant) {
        let codec = self.codec.clone();
        let jpeg = message.image.clone();
        let decoded = tokio::task::spawn_blocking(move || codec.lock().decompress(jpeg)).await;

        let frame = match decoded {
            Ok(Ok(frame)) => Arc::new(frame),
            Ok(Err(e)) => {
                debug!("Discarding undecodable remote frame: {}", e);
                return;
            }
            Err(e) => {
                warn!("Decode task failed: {}", e);
                return;
            }
        };

        let previous = self.selector.accept_remote(
            self.ctx.state(),
            frame,
            message.metadata.people_count,
            now,
        );
        if previous == View::Local {
            info!("Switched to remote view: connection restored");
            self.ctx.events().publish(SystemEvent::ViewChanged {
                view: View::Remote,
                reason: "frame received".to_string(),
            });
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Result;
    use crate::events::EventBus;
    use crate::state::SharedState;
    use crate::transport::{ChannelConfig, SubscriberOptions, TransportError};
    use crate::video::DisplayFrame;
    use bytes::Bytes;
    use std::net::SocketAddr;

    struct StubCodec;

    impl ImageCodec for StubCodec {
        fn compress(&mut self, _width: u32, _height: u32, rgb: &[u8]) -> Result<Bytes> {
            Ok(Bytes::copy_from_slice(rgb))
        }

        fn decompress(&mut self, jpeg: Bytes) -> Result<DisplayFrame> {
            if jpeg.as_ref() == b"bad" {
                return Err(crate::error::AppError::VideoError("corrupt".into()));
            }
            Ok(DisplayFrame::new(4, 3, Bytes::new(), jpeg))
        }
    }

    fn receive_loop() -> (ReceiveLoop, RunContext) {
        let ctx = RunContext::new(
            Arc::new(SharedState::with_defaults()),
            Arc::new(EventBus::new()),
        );
        let config = ChannelConfig {
            bind: SocketAddr::from(([127, 0, 0, 1], 0)),
            remote: "127.0.0.1:1".to_string(),
            publisher_queue: 4,
            subscriber: SubscriberOptions::default(),
            failure_threshold: 10,
            reconnect_cooldown: Duration::from_secs(5),
        };
        let channel = DuplexChannel::open(&config).unwrap();
        let rx = ReceiveLoop::new(
            ctx.clone(),
            channel,
            Box::new(StubCodec),
            ViewSelector::default(),
            Duration::from_millis(50),
        );
        (rx, ctx)
    }

    #[tokio::test]
    async fn test_message_switches_to_remote_and_times_out() {
        let (mut rx, ctx) = receive_loop();
        let mut events = ctx.events().subscribe();
        let t = Instant::now();

        rx.handle(
            Received::Message(FrameMessage::new(5, Bytes::from_static(b"jpeg"))),
            t,
        )
        .await;
        assert_eq!(View::current(ctx.state()), View::Remote);
        assert_eq!(ctx.state().remote_num_people(), 5);
        assert!(matches!(
            events.try_recv().unwrap(),
            SystemEvent::ViewChanged { view: View::Remote, .. }
        ));

        rx.handle(Received::Timeout, t + Duration::from_millis(2999)).await;
        assert_eq!(View::current(ctx.state()), View::Remote);

        rx.handle(Received::Timeout, t + Duration::from_millis(3001)).await;
        assert_eq!(View::current(ctx.state()), View::Local);
        assert!(matches!(
            events.try_recv().unwrap(),
            SystemEvent::ViewChanged { view: View::Local, .. }
        ));
    }

    #[tokio::test]
    async fn test_undecodable_frame_is_discarded() {
        let (mut rx, ctx) = receive_loop();
        rx.handle(
            Received::Message(FrameMessage::new(5, Bytes::from_static(b"bad"))),
            Instant::now(),
        )
        .await;
        assert_eq!(View::current(ctx.state()), View::Local);
        assert_eq!(ctx.state().remote_num_people(), 0);
    }

    #[tokio::test]
    async fn test_failures_trigger_one_rebuild_event() {
        let (mut rx, ctx) = receive_loop();
        let mut events = ctx.events().subscribe();
        let now = Instant::now();

        for _ in 0..11 {
            rx.handle(Received::Error(TransportError::Closed), now).await;
        }
        match events.try_recv().unwrap() {
            SystemEvent::SubscriberRecreated { failures, .. } => assert_eq!(failures, 11),
            other => panic!("unexpected event {:?}", other),
        }
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_errors_while_remote_keep_view_and_count() {
        let (mut rx, ctx) = receive_loop();
        let t = Instant::now();

        rx.handle(
            Received::Message(FrameMessage::new(2, Bytes::from_static(b"jpeg"))),
            t,
        )
        .await;
        assert_eq!(View::current(ctx.state()), View::Remote);

        for i in 1..=3u64 {
            rx.handle(
                Received::Error(TransportError::Closed),
                t + Duration::from_millis(500 * i),
            )
            .await;
        }
        assert_eq!(View::current(ctx.state()), View::Remote);
        assert_eq!(rx.channel.policy().failures(), 3);

        rx.handle(Received::Timeout, t + Duration::from_millis(2000)).await;
        assert_eq!(rx.channel.policy().failures(), 3);

        // A message that fails to decode still proves the link is alive
        rx.handle(
            Received::Message(FrameMessage::new(9, Bytes::from_static(b"bad"))),
            t + Duration::from_millis(2500),
        )
        .await;
        assert_eq!(rx.channel.policy().failures(), 0);
        assert_eq!(View::current(ctx.state()), View::Remote);
        assert_eq!(ctx.state().remote_num_people(), 2);

        rx.handle(
            Received::Error(TransportError::Closed),
            t + Duration::from_millis(2900),
        )
        .await;
        assert_eq!(rx.channel.policy().failures(), 1);
        assert_eq!(View::current(ctx.state()), View::Remote);
    }
}
