//! Wire protocol for frame transport
//!
//! A frame travels as a two-part message: a MessagePack metadata map
//! followed by the compressed image. On the byte stream every multipart
//! message is framed as:
//!
//! ```text
//! ┌─────────────────┬──────────────┬─────────┬──────────────┬─────────┬───
//! │ part_count (u32)│ len_0 (u32)  │ part_0  │ len_1 (u32)  │ part_1  │ ...
//! └─────────────────┴──────────────┴─────────┴──────────────┴─────────┴───
//! ```
//!
//! All integers are big-endian. Decoding never panics: any shape other
//! than two parts, or metadata that does not parse, is reported as
//! [`WireError::Malformed`].

pub mod codec;
pub mod message;

pub use codec::{MultipartCodec, MAX_PARTS, MAX_PART_LEN};
pub use message::{decode, encode, FrameMessage, FrameMetadata};

use thiserror::Error;

/// Errors from framing and message coding
#[derive(Error, Debug)]
pub enum WireError {
    #[error("Malformed message: {0}")]
    Malformed(String),

    #[error("Part count {count} exceeds limit {max}")]
    TooManyParts { count: usize, max: usize },

    #[error("Part length {len} exceeds limit {max}")]
    PartTooLarge { len: usize, max: usize },

    #[error("Metadata encode failed: {0}")]
    Encode(#[from] rmp_serde::encode::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
