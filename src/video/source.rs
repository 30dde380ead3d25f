//! Frame sources: the camera collaborator behind the send loop

use bytes::Bytes;

use super::detection::{count_people, Detection};
use super::frame::{CapturedFrame, FrameImage};
use crate::error::Result;

/// Source of annotated local frames
///
/// `next_frame` may block on the device; the send loop calls it from a
/// blocking task. `Ok(None)` means no frame is ready yet.
pub trait FrameSource: Send + 'static {
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>>;

    /// Short identifier for logs
    fn name(&self) -> &str;
}

/// Synthetic moving gradient with a scripted people count
///
/// The count steps through 0..=4 every `frames_per_step` frames so the
/// LED speed mapping and the peer's count display can be exercised
/// without a camera or inference hardware.
pub struct TestPatternSource {
    width: u32,
    height: u32,
    threshold: f32,
    frames_per_step: u64,
    tick: u64,
}

impl TestPatternSource {
    pub fn new(width: u32, height: u32, threshold: f32) -> Self {
        Self {
            width,
            height,
            threshold,
            frames_per_step: 150,
            tick: 0,
        }
    }

    pub fn with_frames_per_step(mut self, frames: u64) -> Self {
        self.frames_per_step = frames.max(1);
        self
    }

    fn render(&self) -> Vec<u8> {
        let (w, h) = (self.width as usize, self.height as usize);
        let shift = (self.tick * 4) as usize;
        let mut rgb = Vec::with_capacity(w * h * 3);
        for y in 0..h {
            for x in 0..w {
                rgb.push(((x + shift) * 255 / w.max(1)) as u8);
                rgb.push((y * 255 / h.max(1)) as u8);
                rgb.push(((x + y + shift) % 256) as u8);
            }
        }
        rgb
    }

    fn detections(&self) -> Vec<Detection> {
        let people = (self.tick / self.frames_per_step) % 5;
        let mut detections: Vec<Detection> =
            (0..people).map(|_| Detection::new(0, 0.9)).collect();
        // Low-confidence person and a non-person, both filtered out
        detections.push(Detection::new(0, self.threshold * 0.5));
        detections.push(Detection::new(56, 0.95));
        detections
    }
}

impl FrameSource for TestPatternSource {
    fn next_frame(&mut self) -> Result<Option<CapturedFrame>> {
        let image = FrameImage::Raw {
            width: self.width,
            height: self.height,
            rgb: Bytes::from(self.render()),
        };
        let people_count = count_people(&self.detections(), self.threshold);
        self.tick = self.tick.wrapping_add(1);
        Ok(Some(CapturedFrame::new(image, people_count)))
    }

    fn name(&self) -> &str {
        "test_pattern"
    }
}
