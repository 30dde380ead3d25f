//! Frame message: MessagePack metadata plus compressed image

use bytes::Bytes;
use chrono::Utc;
use serde::{Deserialize, Serialize};

use super::WireError;

/// Metadata carried in the first part of every frame message
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FrameMetadata {
    /// People detected by the sender's camera
    #[serde(default)]
    pub people_count: u32,
    /// Send time, seconds since the Unix epoch
    pub timestamp: f64,
}

impl FrameMetadata {
    /// Metadata stamped with the current wall-clock time
    pub fn now(people_count: u32) -> Self {
        Self {
            people_count,
            timestamp: unix_now(),
        }
    }

    /// Seconds elapsed since the sender stamped this message
    ///
    /// Negative when the peers' clocks disagree.
    pub fn age_secs(&self) -> f64 {
        unix_now() - self.timestamp
    }
}

fn unix_now() -> f64 {
    Utc::now().timestamp_micros() as f64 / 1_000_000.0
}

/// A decoded frame message
#[derive(Debug, Clone)]
pub struct FrameMessage {
    pub metadata: FrameMetadata,
    /// Opaque compressed image bytes
    pub image: Bytes,
}

impl FrameMessage {
    pub fn new(people_count: u32, image: Bytes) -> Self {
        Self {
            metadata: FrameMetadata::now(people_count),
            image,
        }
    }

    /// Serialize into the two transport parts
    pub fn to_parts(&self) -> Result<Vec<Bytes>, WireError> {
        let meta = rmp_serde::to_vec_named(&self.metadata)?;
        Ok(vec![Bytes::from(meta), self.image.clone()])
    }

    /// Parse transport parts; anything but `[metadata, image]` is malformed
    pub fn from_parts(mut parts: Vec<Bytes>) -> Result<Self, WireError> {
        if parts.len() != 2 {
            return Err(WireError::Malformed(format!(
                "expected 2 parts, got {}",
                parts.len()
            )));
        }
        let image = parts.pop().unwrap_or_default();
        let meta = parts.pop().unwrap_or_default();

        let metadata: FrameMetadata = rmp_serde::from_slice(&meta)
            .map_err(|e| WireError::Malformed(format!("metadata: {}", e)))?;

        Ok(Self { metadata, image })
    }
}

/// Pack a people count and compressed image stamped with the current time
pub fn encode(people_count: u32, image: Bytes) -> Result<Vec<Bytes>, WireError> {
    FrameMessage::new(people_count, image).to_parts()
}

/// Unpack transport parts into metadata and image
pub fn decode(parts: Vec<Bytes>) -> Result<FrameMessage, WireError> {
    FrameMessage::from_parts(parts)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_encode_decode() {
        let image = Bytes::from_static(&[0xFF, 0xD8, 1, 2, 3, 0xFF, 0xD9]);
        let before = unix_now();
        let parts = encode(3, image.clone()).unwrap();
        let after = unix_now();
        assert_eq!(parts.len(), 2);

        let message = decode(parts).unwrap();
        assert_eq!(message.metadata.people_count, 3);
        assert_eq!(message.image, image);
        let ts = message.metadata.timestamp;
        assert!(before <= ts && ts <= after, "{} not in [{}, {}]", ts, before, after);
    }

    #[test]
    fn test_wrong_part_counts_are_malformed() {
        let meta = encode(1, Bytes::new()).unwrap().remove(0);
        for parts in [
            vec![],
            vec![meta.clone()],
            vec![meta.clone(), Bytes::new(), Bytes::new()],
        ] {
            assert!(matches!(decode(parts), Err(WireError::Malformed(_))));
        }
    }

    #[test]
    fn test_garbage_metadata_is_malformed() {
        let parts = vec![Bytes::from_static(&[0xC1, 0xFF, 0x00]), Bytes::new()];
        assert!(matches!(decode(parts), Err(WireError::Malformed(_))));
    }

    #[test]
    fn test_metadata_is_a_named_map() {
        // Peers written in other languages read the map by key
        let parts = encode(7, Bytes::new()).unwrap();
        let meta = &parts[0];
        assert_eq!(meta[0], 0x82, "fixmap with two entries");
        let has_key = |key: &[u8]| meta.windows(key.len()).any(|w| w == key);
        assert!(has_key(b"people_count"));
        assert!(has_key(b"timestamp"));
    }
}
