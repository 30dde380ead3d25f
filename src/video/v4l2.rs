//! MJPEG capture from a V4L2 device

use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::watch;
use tracing::{debug, info};
use v4l::buffer::Type;
use v4l::io::mmap::Stream;
use v4l::io::traits::CaptureStream;
use v4l::prelude::*;
use v4l::video::Capture;
use v4l::FourCC;

use super::detection::{count_people, Detection};
use super::frame::{CapturedFrame, FrameImage};
use super::source::FrameSource;
use crate::error::{AppError, Result};

/// Number of mmap buffers requested from the driver
const BUFFER_COUNT: u32 = 4;

/// Poll timeout for one dequeue
const CAPTURE_TIMEOUT: Duration = Duration::from_millis(500);

/// Camera source backed by a V4L2 MJPEG stream
///
/// People counts come from an optional detections feed published by an
/// external inference process; without one the count is 0.
pub struct V4l2Source {
    path: PathBuf,
    name: String,
    stream: Stream<'static>,
    // Keeps the device handle alive alongside the stream
    _device: Device,
    detections: Option<watch::Receiver<Vec<Detection>>>,
    threshold: f32,
}

impl V4l2Source {
    /// Open `path` and start streaming MJPEG at the requested size
    pub fn open(path: impl AsRef<Path>, width: u32, height: u32, threshold: f32) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        debug!("Opening video device: {:?}", path);

        let device = Device::with_path(&path).map_err(|e| {
            AppError::VideoError(format!("Failed to open device {:?}: {}", path, e))
        })?;

        let mut format = device
            .format()
            .map_err(|e| AppError::VideoError(format!("Failed to get device format: {}", e)))?;
        format.width = width;
        format.height = height;
        format.fourcc = FourCC::new(b"MJPG");

        let actual = device
            .set_format(&format)
            .map_err(|e| AppError::VideoError(format!("Failed to set device format: {}", e)))?;
        if actual.fourcc != FourCC::new(b"MJPG") {
            return Err(AppError::VideoError(format!(
                "Device {:?} does not support MJPEG (got {})",
                path, actual.fourcc
            )));
        }

        let mut stream = Stream::with_buffers(&device, Type::VideoCapture, BUFFER_COUNT)
            .map_err(|e| AppError::VideoError(format!("Failed to request buffers: {}", e)))?;
        stream.set_timeout(CAPTURE_TIMEOUT);

        info!(
            "Capturing {}x{} MJPEG from {:?}",
            actual.width, actual.height, path
        );

        Ok(Self {
            name: format!("v4l2:{}", path.display()),
            path,
            stream,
            _device: device,
            detections: None,
            threshold,
        })
    }

    /// Attach a detections feed used to derive the people count
    pub fn with_detections(mut self, feed: watch::Receiver<Vec<Detection>>) -> Self {
        self.detections = Some(feed);
        self
    }

    fn current_count(&self) -> u32 {
        self.detections
            .as_ref()
            .map(|feed| count_people(&feed.borrow(), self.threshold))
            .unwrap_or(0)
    }
}

impl FrameSource for V4l2Source {
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        let (buf, meta) = match self.stream.next() {
            Ok(frame) => frame,
            Err(e) if e.kind() == io::ErrorKind::TimedOut => return Ok(None),
            Err(e) => {
                return Err(AppError::VideoDeviceLost {
                    device: self.path.display().to_string(),
                    reason: e.to_string(),
                })
            }
        };

        let used = (meta.bytesused as usize).min(buf.len());
        if used == 0 {
            return Ok(None);
        }
        let jpeg = Bytes::copy_from_slice(&buf[..used]);
        let count = self.current_count();
        Ok(Some(CapturedFrame::new(FrameImage::Jpeg(jpeg), count)))
    }

    fn name(&self) -> &str {
        &self.name
    }
}
