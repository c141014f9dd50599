//! Capture backend abstraction.
//!
//! This module provides a unified interface for frame sources:
//! - `DeviceBackend` pulls screenshots through a `DeviceChannel`
//! - `MockFramebuffer` renders frames programmatically (fixtures, dry runs)

use font8x8::{BASIC_FONTS, UnicodeFonts};
use image::{Rgb, RgbImage};

use super::types::{Frame, SnapshotError, SnapshotResult};
use crate::device::DeviceChannel;

/// Trait for capture backends
///
/// `Ok(None)` means no frame is available right now (device busy, encoder
/// slow, connection blip). Callers treat it as "no evidence yet" and retry;
/// `Err` is reserved for problems retrying cannot fix.
pub trait CaptureBackend {
    /// Grab one full-screen frame
    fn capture(&mut self) -> SnapshotResult<Option<Frame>>;

    /// Source type identifier (e.g. "device", "mock")
    fn source_type(&self) -> &str;
}

impl<B: CaptureBackend + ?Sized> CaptureBackend for &mut B {
    fn capture(&mut self) -> SnapshotResult<Option<Frame>> {
        (**self).capture()
    }

    fn source_type(&self) -> &str {
        (**self).source_type()
    }
}

/// Frames from a device channel's screenshot primitive
pub struct DeviceBackend<'a, C: DeviceChannel + ?Sized> {
    channel: &'a mut C,
}

impl<'a, C: DeviceChannel + ?Sized> DeviceBackend<'a, C> {
    pub fn new(channel: &'a mut C) -> Self {
        Self { channel }
    }
}

impl<C: DeviceChannel + ?Sized> CaptureBackend for DeviceBackend<'_, C> {
    fn capture(&mut self) -> SnapshotResult<Option<Frame>> {
        let bytes = match self.channel.screenshot() {
            Ok(bytes) => bytes,
            Err(e) => {
                // A failed screenshot during verification is missing evidence, not a verdict
                tracing::warn!(device = %self.channel.id(), error = %e, "screenshot failed");
                return Ok(None);
            }
        };
        if bytes.is_empty() {
            tracing::debug!(device = %self.channel.id(), "empty screenshot");
            return Ok(None);
        }
        match Frame::from_encoded(&bytes) {
            Ok(frame) if !frame.is_empty() => Ok(Some(frame)),
            Ok(_) => Ok(None),
            Err(e) => {
                // Truncated encodes show up as decode errors
                tracing::debug!(device = %self.channel.id(), error = %e, "screenshot not decodable");
                Ok(None)
            }
        }
    }

    fn source_type(&self) -> &str {
        "device"
    }
}

/// A virtual framebuffer for testing and programmatic drawing
///
/// Provides a drawing API for building screens:
/// - `fill()` - Fill entire buffer with a color
/// - `draw_rect()` - Draw a filled rectangle
/// - `draw_circle()` - Draw a filled disc (spinners, badges)
/// - `draw_text()` / `draw_text_scaled()` - Draw text using font8x8 glyphs
/// - `get_pixel()` / `set_pixel()` - Direct pixel access
#[derive(Debug, Clone)]
pub struct MockFramebuffer {
    image: RgbImage,
}

impl MockFramebuffer {
    /// Create a new framebuffer with the given dimensions, initialized to black
    pub fn new(width: u32, height: u32) -> Self {
        Self {
            image: RgbImage::new(width, height),
        }
    }

    /// Create a framebuffer initialized to a specific color
    pub fn with_color(width: u32, height: u32, color: [u8; 3]) -> Self {
        Self {
            image: RgbImage::from_pixel(width, height, Rgb(color)),
        }
    }

    /// Load a framebuffer from encoded image bytes
    pub fn from_png_bytes(data: &[u8]) -> SnapshotResult<Self> {
        let img = image::load_from_memory(data)
            .map_err(|e| SnapshotError::Decode(format!("Failed to load PNG: {}", e)))?;
        Ok(Self { image: img.to_rgb8() })
    }

    pub fn width(&self) -> u32 {
        self.image.width()
    }

    pub fn height(&self) -> u32 {
        self.image.height()
    }

    /// Fill the entire framebuffer with a color
    pub fn fill(&mut self, color: [u8; 3]) {
        for pixel in self.image.pixels_mut() {
            *pixel = Rgb(color);
        }
    }

    /// Draw a filled rectangle, clipped to the buffer
    pub fn draw_rect(&mut self, x: u32, y: u32, w: u32, h: u32, color: [u8; 3]) {
        for py in y..y.saturating_add(h).min(self.height()) {
            for px in x..x.saturating_add(w).min(self.width()) {
                self.image.put_pixel(px, py, Rgb(color));
            }
        }
    }

    /// Draw a filled disc
    pub fn draw_circle(&mut self, cx: u32, cy: u32, radius: u32, color: [u8; 3]) {
        let r = i64::from(radius);
        for dy in -r..=r {
            for dx in -r..=r {
                if dx * dx + dy * dy <= r * r {
                    self.set_pixel_signed(i64::from(cx) + dx, i64::from(cy) + dy, color);
                }
            }
        }
    }

    /// Draw text using font8x8 glyphs (8x8 per character, no wrapping)
    pub fn draw_text(&mut self, x: u32, y: u32, text: &str, fg: [u8; 3], bg: [u8; 3]) {
        self.draw_text_scaled(x, y, text, fg, bg, 1);
    }

    /// Draw text with each glyph pixel blown up to `scale`×`scale`
    pub fn draw_text_scaled(&mut self, x: u32, y: u32, text: &str, fg: [u8; 3], bg: [u8; 3], scale: u32) {
        let scale = scale.max(1);
        let advance = 8 * scale;
        let mut cursor_x = x;
        for ch in text.chars() {
            if cursor_x >= self.width() {
                break;
            }
            let glyph = BASIC_FONTS.get(ch).unwrap_or([0u8; 8]);
            for (row_idx, row) in glyph.iter().enumerate() {
                for bit in 0..8u32 {
                    // font8x8 stores LSB as leftmost pixel
                    let color = if (row >> bit) & 1 == 1 { fg } else { bg };
                    self.draw_rect(
                        cursor_x + bit * scale,
                        y + row_idx as u32 * scale,
                        scale,
                        scale,
                        color,
                    );
                }
            }
            cursor_x += advance;
        }
    }

    /// Get the color of a pixel (black outside the buffer)
    pub fn get_pixel(&self, x: u32, y: u32) -> [u8; 3] {
        if x >= self.width() || y >= self.height() {
            return [0, 0, 0];
        }
        self.image.get_pixel(x, y).0
    }

    /// Set the color of a pixel (ignored outside the buffer)
    pub fn set_pixel(&mut self, x: u32, y: u32, color: [u8; 3]) {
        if x < self.width() && y < self.height() {
            self.image.put_pixel(x, y, Rgb(color));
        }
    }

    fn set_pixel_signed(&mut self, x: i64, y: i64, color: [u8; 3]) {
        if x >= 0 && y >= 0 {
            self.set_pixel(x as u32, y as u32, color);
        }
    }

    pub fn to_image(&self) -> RgbImage {
        self.image.clone()
    }

    pub fn to_frame(&self) -> Frame {
        Frame::new(self.image.clone())
    }

    /// Encode the framebuffer as PNG bytes
    pub fn to_png(&self) -> SnapshotResult<Vec<u8>> {
        self.to_frame().to_png()
    }
}

impl CaptureBackend for MockFramebuffer {
    fn capture(&mut self) -> SnapshotResult<Option<Frame>> {
        Ok(Some(self.to_frame()))
    }

    fn source_type(&self) -> &str {
        "mock"
    }
}
