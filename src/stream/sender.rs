//! Send loop: capture, compress, publish

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use tracing::{debug, info, trace};

use crate::config::StreamConfig;
use crate::error::{AppError, Result};
use crate::state::{Field, RunContext, Value};
use crate::transport::Publisher;
use crate::utils::LogThrottler;
use crate::video::{FrameImage, FrameSource, ImageCodec};
use crate::warn_throttled;
use crate::wire::encode;

/// Timing for the send loop
#[derive(Debug, Clone, Copy)]
pub struct SendTiming {
    /// Sleep after a published frame
    pub frame_interval: Duration,
    /// Sleep when the source had no frame ready
    pub frame_retry: Duration,
    /// Sleep after an error
    pub error_backoff: Duration,
}

impl From<&StreamConfig> for SendTiming {
    fn from(config: &StreamConfig) -> Self {
        Self {
            frame_interval: config.frame_interval(),
            frame_retry: config.frame_retry(),
            error_backoff: config.error_backoff(),
        }
    }
}

impl Default for SendTiming {
    fn default() -> Self {
        Self::from(&StreamConfig::default())
    }
}

/// Outcome of one iteration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SendStep {
    Sent { people_count: u32 },
    NoFrame,
}

/// Publishes the local camera at a fixed rate
pub struct SendLoop {
    ctx: RunContext,
    publisher: Arc<Publisher>,
    source: Arc<Mutex<Box<dyn FrameSource>>>,
    codec: Arc<Mutex<Box<dyn ImageCodec>>>,
    timing: SendTiming,
    throttler: LogThrottler,
}

impl SendLoop {
    pub fn new(
        ctx: RunContext,
        publisher: Arc<Publisher>,
        source: Box<dyn FrameSource>,
        codec: Box<dyn ImageCodec>,
        timing: SendTiming,
    ) -> Self {
        Self {
            ctx,
            publisher,
            source: Arc::new(Mutex::new(source)),
            codec: Arc::new(Mutex::new(codec)),
            timing,
            throttler: LogThrottler::default(),
        }
    }

    pub async fn run(self) {
        let source_name = self.source.lock().name().to_string();
        info!("Send loop started (source: {})", source_name);
        let mut sent: u64 = 0;

        while self.ctx.should_run() {
            let pause = match self.step().await {
                Ok(SendStep::Sent { people_count }) => {
                    sent += 1;
                    self.throttler.clear("send_error");
                    trace!("Sent frame {} ({} people)", sent, people_count);
                    self.timing.frame_interval
                }
                Ok(SendStep::NoFrame) => {
                    debug!("No frame available from {}", source_name);
                    self.timing.frame_retry
                }
                // A panicked capture task is retried like any other failure
                Err(e) => {
                    warn_throttled!(self.throttler, "send_error", "Send loop error: {}", e);
                    self.timing.error_backoff
                }
            };
            if !self.ctx.sleep(pause).await {
                break;
            }
        }

        info!("Send loop stopped after {} frames", sent);
    }

    /// Capture and publish one frame
    pub async fn step(&self) -> Result<SendStep> {
        let source = self.source.clone();
        let codec = self.codec.clone();
        let captured = tokio::task::spawn_blocking(move || capture_jpeg(&source, &codec))
            .await
            .map_err(|e| AppError::Internal(format!("capture task failed: {}", e)))??;

        let Some((people_count, jpeg)) = captured else {
            return Ok(SendStep::NoFrame);
        };

        let parts = encode(people_count, jpeg.clone())?;
        if !self.publisher.publish(parts) {
            debug!("Frame not published");
        }

        self.ctx.state().update_many([
            (Field::LocalNumPeople, Value::Count(people_count)),
            (Field::LocalFrame, Value::Jpeg(jpeg)),
        ]);
        Ok(SendStep::Sent { people_count })
    }
}

fn capture_jpeg(
    source: &Mutex<Box<dyn FrameSource>>,
    codec: &Mutex<Box<dyn ImageCodec>>,
) -> Result<Option<(u32, Bytes)>> {
    let Some(frame) = source.lock().next_frame()? else {
        return Ok(None);
    };
    let jpeg = match frame.image {
        FrameImage::Jpeg(jpeg) => jpeg,
        FrameImage::Raw { width, height, rgb } => codec.lock().compress(width, height, &rgb)?,
    };
    Ok(Some((frame.people_count, jpeg)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;
    use crate::state::SharedState;
    use crate::video::{CapturedFrame, DisplayFrame};

    /// Yields `None` once, then a JPEG frame with 2 people
    struct ScriptedSource {
        calls: u32,
    }

    impl FrameSource for ScriptedSource {
        fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
            self.calls += 1;
            if self.calls == 1 {
                return Ok(None);
            }
            Ok(Some(CapturedFrame::new(
                FrameImage::Jpeg(Bytes::from_static(b"jpeg")),
                2,
            )))
        }

        fn name(&self) -> &str {
            "scripted"
        }
    }

    struct NullCodec;

    impl ImageCodec for NullCodec {
        fn compress(&mut self, _width: u32, _height: u32, _rgb: &[u8]) -> Result<Bytes> {
            Ok(Bytes::from_static(b"compressed"))
        }

        fn decompress(&mut self, jpeg: Bytes) -> Result<DisplayFrame> {
            Ok(DisplayFrame::new(1, 1, Bytes::new(), jpeg))
        }
    }

    #[tokio::test]
    async fn test_step_updates_local_state() {
        let ctx = RunContext::new(
            Arc::new(SharedState::with_defaults()),
            Arc::new(EventBus::new()),
        );
        let publisher = Arc::new(Publisher::bind("127.0.0.1:0".parse().unwrap(), 4).unwrap());
        let send = SendLoop::new(
            ctx.clone(),
            publisher,
            Box::new(ScriptedSource { calls: 0 }),
            Box::new(NullCodec),
            SendTiming::default(),
        );

        assert_eq!(send.step().await.unwrap(), SendStep::NoFrame);
        assert_eq!(ctx.state().local_num_people(), 0);

        assert_eq!(send.step().await.unwrap(), SendStep::Sent { people_count: 2 });
        assert_eq!(ctx.state().local_num_people(), 2);
        let local: Option<Bytes> = ctx.state().get(Field::LocalFrame, None);
        assert_eq!(local, Some(Bytes::from_static(b"jpeg")));
    }

    #[tokio::test]
    async fn test_raw_frames_are_compressed() {
        let source = Mutex::new(Box::new(crate::video::TestPatternSource::new(4, 4, 0.5))
            as Box<dyn FrameSource>);
        let codec = Mutex::new(Box::new(NullCodec) as Box<dyn ImageCodec>);
        let (count, jpeg) = capture_jpeg(&source, &codec).unwrap().unwrap();
        assert_eq!(count, 0);
        assert_eq!(jpeg, Bytes::from_static(b"compressed"));
    }

    /// Panics on the first capture, then yields frames with 1 person
    struct PanicsOnceSource {
        calls: u32,
    }

    impl FrameSource for PanicsOnceSource {
        fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
            self.calls += 1;
            if self.calls == 1 {
                panic!("capture device vanished");
            }
            Ok(Some(CapturedFrame::new(
                FrameImage::Jpeg(Bytes::from_static(b"jpeg")),
                1,
            )))
        }

        fn name(&self) -> &str {
            "panics-once"
        }
    }

    #[tokio::test]
    async fn test_loop_survives_panicked_capture() {
        let ctx = RunContext::new(
            Arc::new(SharedState::with_defaults()),
            Arc::new(EventBus::new()),
        );
        let publisher = Arc::new(Publisher::bind("127.0.0.1:0".parse().unwrap(), 4).unwrap());
        let send = SendLoop::new(
            ctx.clone(),
            publisher,
            Box::new(PanicsOnceSource { calls: 0 }),
            Box::new(NullCodec),
            SendTiming {
                frame_interval: Duration::from_millis(10),
                frame_retry: Duration::from_millis(10),
                error_backoff: Duration::from_millis(20),
            },
        );
        let task = tokio::spawn(send.run());

        let deadline = std::time::Instant::now() + Duration::from_secs(5);
        while ctx.state().local_num_people() != 1 {
            assert!(!task.is_finished(), "send loop exited after a failed capture");
            assert!(std::time::Instant::now() < deadline, "no frame after the failure");
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        ctx.stop();
        task.await.unwrap();
    }
}
