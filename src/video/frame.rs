//! Frame data structures shared by capture, transport and display

use bytes::Bytes;

/// Image produced by a [`FrameSource`](super::FrameSource)
#[derive(Debug, Clone)]
pub enum FrameImage {
    /// Packed RGB24, `width * height * 3` bytes
    Raw { width: u32, height: u32, rgb: Bytes },
    /// Already compressed (MJPEG capture)
    Jpeg(Bytes),
}

impl FrameImage {
    pub fn is_jpeg(&self) -> bool {
        matches!(self, Self::Jpeg(_))
    }
}

/// One sample from the local camera: image plus derived people count
#[derive(Debug, Clone)]
pub struct CapturedFrame {
    pub image: FrameImage,
    pub people_count: u32,
}

impl CapturedFrame {
    pub fn new(image: FrameImage, people_count: u32) -> Self {
        Self {
            image,
            people_count,
        }
    }
}

/// A decoded frame ready for display
///
/// Holds the decompressed pixels and the JPEG they came from, so the
/// preview server can serve the remote view without re-encoding.
#[derive(Debug, Clone)]
pub struct DisplayFrame {
    pub width: u32,
    pub height: u32,
    /// Packed RGB24
    pub rgb: Bytes,
    /// Source JPEG
    pub jpeg: Bytes,
}

impl DisplayFrame {
    pub fn new(width: u32, height: u32, rgb: Bytes, jpeg: Bytes) -> Self {
        Self {
            width,
            height,
            rgb,
            jpeg,
        }
    }

    /// Check the JPEG SOI marker
    pub fn has_valid_jpeg(&self) -> bool {
        is_jpeg(&self.jpeg)
    }
}

/// Cheap sanity check on JPEG bytes (SOI at the start, EOI or padding at the end)
pub fn is_jpeg(data: &[u8]) -> bool {
    if data.len() < 4 {
        return false;
    }
    if data[0] != 0xFF || data[1] != 0xD8 {
        return false;
    }
    let end = data.len();
    let end_marker = ((data[end - 2] as u16) << 8) | data[end - 1] as u16;
    matches!(end_marker, 0xFFD9 | 0xD900 | 0x0000)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_jpeg() {
        assert!(is_jpeg(&[0xFF, 0xD8, 0x00, 0x11, 0xFF, 0xD9]));
        assert!(!is_jpeg(&[0x89, 0x50, 0x4E, 0x47]));
        assert!(!is_jpeg(&[0xFF, 0xD8]));
    }
}
