//! JPEG compression and decompression via libjpeg-turbo

use bytes::Bytes;
use turbojpeg::{Compressor, Decompressor, Image, PixelFormat as TJPixelFormat, Subsamp};

use super::frame::DisplayFrame;
use crate::error::{AppError, Result};

/// Image codec collaborator used by the send and receive loops
///
/// Not `Sync`: turbojpeg handles are single-threaded, so each loop owns
/// its own codec.
pub trait ImageCodec: Send {
    /// Compress packed RGB24 to JPEG
    fn compress(&mut self, width: u32, height: u32, rgb: &[u8]) -> Result<Bytes>;

    /// Decompress a JPEG into a displayable frame
    fn decompress(&mut self, jpeg: Bytes) -> Result<DisplayFrame>;
}

/// turbojpeg-backed [`ImageCodec`]
pub struct JpegCodec {
    compressor: Compressor,
    decompressor: Decompressor,
    quality: u32,
}

impl JpegCodec {
    /// Create a codec compressing at `quality` (1-100)
    pub fn new(quality: u32) -> Result<Self> {
        let mut compressor = Compressor::new().map_err(|e| {
            AppError::VideoError(format!("Failed to create turbojpeg compressor: {}", e))
        })?;
        compressor
            .set_quality(quality.clamp(1, 100) as i32)
            .map_err(|e| AppError::VideoError(format!("Failed to set JPEG quality: {}", e)))?;
        compressor
            .set_subsamp(Subsamp::Sub2x2)
            .map_err(|e| AppError::VideoError(format!("Failed to set subsampling: {}", e)))?;

        let decompressor = Decompressor::new().map_err(|e| {
            AppError::VideoError(format!("Failed to create turbojpeg decoder: {}", e))
        })?;

        Ok(Self {
            compressor,
            decompressor,
            quality,
        })
    }

    pub fn quality(&self) -> u32 {
        self.quality
    }
}

impl ImageCodec for JpegCodec {
    fn compress(&mut self, width: u32, height: u32, rgb: &[u8]) -> Result<Bytes> {
        let width = width as usize;
        let height = height as usize;
        let pitch = width * 3;
        if rgb.len() < pitch * height {
            return Err(AppError::VideoError(format!(
                "RGB data too small: {} < {}",
                rgb.len(),
                pitch * height
            )));
        }

        let image = Image {
            pixels: rgb,
            width,
            pitch,
            height,
            format: TJPixelFormat::RGB,
        };

        let jpeg = self
            .compressor
            .compress_to_vec(image)
            .map_err(|e| AppError::VideoError(format!("JPEG compression failed: {}", e)))?;
        Ok(Bytes::from(jpeg))
    }

    fn decompress(&mut self, jpeg: Bytes) -> Result<DisplayFrame> {
        let header = self
            .decompressor
            .read_header(&jpeg)
            .map_err(|e| AppError::VideoError(format!("turbojpeg read_header failed: {}", e)))?;

        let pitch = header.width * 3;
        let mut image = Image {
            pixels: vec![0u8; header.height * pitch],
            width: header.width,
            pitch,
            height: header.height,
            format: TJPixelFormat::RGB,
        };

        self.decompressor
            .decompress(&jpeg, image.as_deref_mut())
            .map_err(|e| AppError::VideoError(format!("turbojpeg decode failed: {}", e)))?;

        Ok(DisplayFrame::new(
            header.width as u32,
            header.height as u32,
            Bytes::from(image.pixels),
            jpeg,
        ))
    }
}
