//! Video capture, people counting and JPEG coding
//!
//! These are the narrow collaborators the stream loops depend on: a
//! [`FrameSource`] yielding frames with a people count, and an
//! [`ImageCodec`] for compressing raw captures and decoding peer frames.

pub mod detection;
pub mod frame;
pub mod jpeg;
pub mod source;
pub mod v4l2;

pub use detection::{count_people, Detection};
pub use frame::{CapturedFrame, DisplayFrame, FrameImage};
pub use jpeg::{ImageCodec, JpegCodec};
pub use source::{FrameSource, TestPatternSource};
pub use v4l2::V4l2Source;
