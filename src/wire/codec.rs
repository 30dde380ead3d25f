//! Count-prefixed multipart framing

use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio_util::codec::{Decoder, Encoder};

use super::WireError;

/// Maximum parts in one message
pub const MAX_PARTS: usize = 16;

/// Maximum length of a single part (16 MiB)
pub const MAX_PART_LEN: usize = 16 * 1024 * 1024;

const HEADER_LEN: usize = 4;

/// Frames `Vec<Bytes>` multipart messages on a byte stream
#[derive(Debug, Clone)]
pub struct MultipartCodec {
    max_parts: usize,
    max_part_len: usize,
}

impl MultipartCodec {
    pub fn new() -> Self {
        Self {
            max_parts: MAX_PARTS,
            max_part_len: MAX_PART_LEN,
        }
    }

    pub fn with_limits(max_parts: usize, max_part_len: usize) -> Self {
        Self {
            max_parts,
            max_part_len,
        }
    }

    /// Total frame length if `src` holds a complete message
    fn complete_len(&self, src: &BytesMut) -> Result<Option<(usize, usize)>, WireError> {
        if src.len() < HEADER_LEN {
            return Ok(None);
        }
        let count = read_u32(&src[..HEADER_LEN]);
        if count > self.max_parts {
            return Err(WireError::TooManyParts {
                count,
                max: self.max_parts,
            });
        }

        let mut offset = HEADER_LEN;
        for _ in 0..count {
            if src.len() < offset + HEADER_LEN {
                return Ok(None);
            }
            let len = read_u32(&src[offset..offset + HEADER_LEN]);
            if len > self.max_part_len {
                return Err(WireError::PartTooLarge {
                    len,
                    max: self.max_part_len,
                });
            }
            offset += HEADER_LEN + len;
            if src.len() < offset {
                return Ok(None);
            }
        }
        Ok(Some((count, offset)))
    }
}

impl Default for MultipartCodec {
    fn default() -> Self {
        Self::new()
    }
}

fn read_u32(bytes: &[u8]) -> usize {
    u32::from_be_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]) as usize
}

impl Decoder for MultipartCodec {
    type Item = Vec<Bytes>;
    type Error = WireError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        let (count, total) = match self.complete_len(src)? {
            Some(found) => found,
            None => return Ok(None),
        };

        let mut frame = src.split_to(total);
        frame.advance(HEADER_LEN);
        let mut parts = Vec::with_capacity(count);
        for _ in 0..count {
            let len = frame.get_u32() as usize;
            parts.push(frame.split_to(len).freeze());
        }
        Ok(Some(parts))
    }
}

impl Encoder<Vec<Bytes>> for MultipartCodec {
    type Error = WireError;

    fn encode(&mut self, parts: Vec<Bytes>, dst: &mut BytesMut) -> Result<(), Self::Error> {
        if parts.len() > self.max_parts {
            return Err(WireError::TooManyParts {
                count: parts.len(),
                max: self.max_parts,
            });
        }
        if let Some(part) = parts.iter().find(|p| p.len() > self.max_part_len) {
            return Err(WireError::PartTooLarge {
                len: part.len(),
                max: self.max_part_len,
            });
        }

        let body: usize = parts.iter().map(|p| HEADER_LEN + p.len()).sum();
        dst.reserve(HEADER_LEN + body);
        dst.put_u32(parts.len() as u32);
        for part in &parts {
            dst.put_u32(part.len() as u32);
            dst.extend_from_slice(part);
        }
        Ok(())
    }
}
