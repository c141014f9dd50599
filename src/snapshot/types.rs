// Define core types for screen sampling

use chrono::{DateTime, Utc};
use image::{GrayImage, RgbImage};
use serde::{Deserialize, Serialize};
use std::io::Cursor;
use std::path::PathBuf;

use crate::region::{PixelRect, Region};

/// A single screen snapshot (or a crop of one).
///
/// Frames are owned by the step that captured them and are never reused
/// across steps: the screen may have changed the moment after capture.
#[derive(Debug, Clone)]
pub struct Frame {
    image: RgbImage,
    /// Offset of this frame inside the full screen it was cut from
    origin: (u32, u32),
    captured_at: DateTime<Utc>,
}

impl Frame {
    /// Wrap a full-screen image
    pub fn new(image: RgbImage) -> Self {
        Self {
            image,
            origin: (0, 0),
            captured_at: Utc::now(),
        }
    }

    /// Decode an encoded screenshot (PNG, JPEG, ...)
    pub fn from_encoded(data: &[u8]) -> SnapshotResult<Self> {
        let img = image::load_from_memory(data)
            .map_err(|e| SnapshotError::Decode(e.to_string()))?;
        Ok(Self::new(img.to_rgb8()))
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    pub fn origin(&self) -> (u32, u32) {
        self.origin
    }

    pub fn captured_at(&self) -> DateTime<Utc> {
        self.captured_at
    }

    pub fn image(&self) -> &RgbImage {
        &self.image
    }

    pub fn is_empty(&self) -> bool {
        self.image.width() == 0 || self.image.height() == 0
    }

    /// Luma conversion used by every detector
    pub fn to_gray(&self) -> GrayImage {
        image::DynamicImage::ImageRgb8(self.image.clone()).to_luma8()
    }

    /// Cut out `region`, resolved against this frame's own pixel size.
    ///
    /// The region is interpreted relative to this frame, so cropping a crop
    /// narrows further; the origin keeps track of the full-screen offset.
    pub fn crop(&self, region: &Region) -> Frame {
        let rect = region.to_pixels(self.width(), self.height());
        self.crop_pixels(rect)
    }

    pub fn crop_pixels(&self, rect: PixelRect) -> Frame {
        let sub = image::imageops::crop_imm(&self.image, rect.x, rect.y, rect.width, rect.height).to_image();
        Frame {
            image: sub,
            origin: (self.origin.0 + rect.x, self.origin.1 + rect.y),
            captured_at: self.captured_at,
        }
    }

    /// Encode as PNG
    pub fn to_png(&self) -> SnapshotResult<Vec<u8>> {
        let mut bytes = Vec::new();
        self.image
            .write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)
            .map_err(|e| SnapshotError::Capture(format!("Failed to encode PNG: {}", e)))?;
        Ok(bytes)
    }
}

/// Record of a frame written to disk
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FrameRecord {
    /// Path to the image file
    pub image_path: PathBuf,

    /// Source type (e.g., "device", "mock")
    pub source: String,

    /// Optional metadata about the frame
    pub metadata: Option<serde_json::Value>,

    /// Timestamp when the frame was captured
    #[serde(with = "chrono::serde::ts_milliseconds")]
    pub timestamp: DateTime<Utc>,
}

/// Result type for snapshot operations
pub type SnapshotResult<T> = Result<T, SnapshotError>;

/// Error types for snapshot operations
#[derive(Debug)]
pub enum SnapshotError {
    /// No frame could be obtained within the retry budget
    Capture(String),

    /// Screenshot bytes could not be decoded
    Decode(String),

    /// I/O error
    Io(std::io::Error),

    /// Serialization error
    Serialization(serde_json::Error),
}

impl std::fmt::Display for SnapshotError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SnapshotError::Capture(msg) => write!(f, "Capture error: {}", msg),
            SnapshotError::Decode(msg) => write!(f, "Decode error: {}", msg),
            SnapshotError::Io(err) => write!(f, "I/O error: {}", err),
            SnapshotError::Serialization(err) => write!(f, "Serialization error: {}", err),
        }
    }
}

impl std::error::Error for SnapshotError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SnapshotError::Capture(_) | SnapshotError::Decode(_) => None,
            SnapshotError::Io(err) => Some(err),
            SnapshotError::Serialization(err) => Some(err),
        }
    }
}

// Implement From traits for automatic error conversion
impl From<std::io::Error> for SnapshotError {
    fn from(err: std::io::Error) -> Self {
        SnapshotError::Io(err)
    }
}

impl From<serde_json::Error> for SnapshotError {
    fn from(err: serde_json::Error) -> Self {
        SnapshotError::Serialization(err)
    }
}

impl From<image::ImageError> for SnapshotError {
    fn from(err: image::ImageError) -> Self {
        SnapshotError::Io(std::io::Error::other(err.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Rgb;

    fn gradient(width: u32, height: u32) -> RgbImage {
        RgbImage::from_fn(width, height, |x, y| Rgb([x as u8, y as u8, 0]))
    }

    #[test]
    fn test_crop_resolves_against_actual_size() {
        let region = Region::new(0.5, 1.0, 0.5, 1.0).unwrap();
        let small = Frame::new(gradient(100, 200)).crop(&region);
        let large = Frame::new(gradient(200, 100)).crop(&region);
        assert_eq!((small.width(), small.height()), (50, 100));
        assert_eq!((large.width(), large.height()), (100, 50));
        assert_eq!(small.origin(), (50, 100));
        assert_eq!(small.image().get_pixel(0, 0), &Rgb([50, 100, 0]));
    }

    #[test]
    fn test_nested_crop_tracks_origin() {
        let frame = Frame::new(gradient(100, 100));
        let half = frame.crop(&Region::new(0.5, 1.0, 0.0, 1.0).unwrap());
        let quarter = half.crop(&Region::new(0.5, 1.0, 0.5, 1.0).unwrap());
        assert_eq!(quarter.origin(), (75, 50));
        assert_eq!(quarter.image().get_pixel(0, 0), &Rgb([75, 50, 0]));
    }

    #[test]
    fn test_png_roundtrip() {
        let frame = Frame::new(gradient(16, 8));
        let decoded = Frame::from_encoded(&frame.to_png().unwrap()).unwrap();
        assert_eq!(decoded.image(), frame.image());
    }

    #[test]
    fn test_decode_garbage_fails() {
        assert!(matches!(Frame::from_encoded(b"not a png"), Err(SnapshotError::Decode(_))));
    }
}
