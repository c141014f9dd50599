//! Screen geometry: pixel points and fractional regions.
//!
//! Regions are authored as fractions of the screen (`0.0..=1.0` on both axes)
//! and resolved to pixels against whatever frame or device resolution is
//! current at the moment of use.

use serde::{Deserialize, Serialize};

/// Result type for region operations
pub type RegionResult<T> = Result<T, RegionError>;

/// Errors raised for malformed regions
#[derive(Debug, Clone, PartialEq)]
pub enum RegionError {
    /// Zero-area, inverted or out-of-range region
    InvalidRegion(String),
}

impl std::fmt::Display for RegionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RegionError::InvalidRegion(msg) => write!(f, "Invalid region: {}", msg),
        }
    }
}

impl std::error::Error for RegionError {}

/// A device pixel coordinate
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Point {
    pub x: f64,
    pub y: f64,
}

impl Point {
    pub fn new(x: f64, y: f64) -> Self {
        Self { x, y }
    }

    /// Rounded integer coordinates for the device channel
    pub fn to_pixel(self) -> (i32, i32) {
        (self.x.round() as i32, self.y.round() as i32)
    }
}

/// A rectangle in fractional screen coordinates
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Region {
    pub x_min: f64,
    pub x_max: f64,
    pub y_min: f64,
    pub y_max: f64,
}

/// A resolved pixel rectangle (half-open: `x..x+width`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PixelRect {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl PixelRect {
    pub fn contains(&self, point: Point) -> bool {
        point.x >= f64::from(self.x)
            && point.y >= f64::from(self.y)
            && point.x < f64::from(self.x + self.width)
            && point.y < f64::from(self.y + self.height)
    }
}

impl Region {
    /// Create a validated region
    pub fn new(x_min: f64, x_max: f64, y_min: f64, y_max: f64) -> RegionResult<Self> {
        let region = Self {
            x_min,
            x_max,
            y_min,
            y_max,
        };
        region.validate()?;
        Ok(region)
    }

    /// The whole screen
    pub fn full() -> Self {
        Self {
            x_min: 0.0,
            x_max: 1.0,
            y_min: 0.0,
            y_max: 1.0,
        }
    }

    /// Bounding box of four fractional corner points (regions traced off a
    /// screenshot are rarely perfectly axis-aligned)
    pub fn from_corners(corners: [(f64, f64); 4]) -> RegionResult<Self> {
        let xs = corners.map(|c| c.0);
        let ys = corners.map(|c| c.1);
        let fold_min = |v: [f64; 4]| v.into_iter().fold(f64::INFINITY, f64::min);
        let fold_max = |v: [f64; 4]| v.into_iter().fold(f64::NEG_INFINITY, f64::max);
        Self::new(fold_min(xs), fold_max(xs), fold_min(ys), fold_max(ys))
    }

    /// Convert a pixel rectangle measured on a screen of the given resolution
    pub fn from_pixels(x1: u32, y1: u32, x2: u32, y2: u32, width: u32, height: u32) -> RegionResult<Self> {
        if width == 0 || height == 0 {
            return Err(RegionError::InvalidRegion(format!(
                "reference resolution {}x{} is empty",
                width, height
            )));
        }
        let w = f64::from(width);
        let h = f64::from(height);
        Self::new(
            f64::from(x1.min(x2)) / w,
            f64::from(x1.max(x2)) / w,
            f64::from(y1.min(y2)) / h,
            f64::from(y1.max(y2)) / h,
        )
    }

    /// Check bounds and ordering
    pub fn validate(&self) -> RegionResult<()> {
        let values = [self.x_min, self.x_max, self.y_min, self.y_max];
        if values.iter().any(|v| !v.is_finite() || *v < 0.0 || *v > 1.0) {
            return Err(RegionError::InvalidRegion(format!(
                "{} lies outside [0,1]",
                self
            )));
        }
        if self.x_max <= self.x_min || self.y_max <= self.y_min {
            return Err(RegionError::InvalidRegion(format!(
                "{} has zero or negative extent",
                self
            )));
        }
        Ok(())
    }

    pub fn width(&self) -> f64 {
        self.x_max - self.x_min
    }

    pub fn height(&self) -> f64 {
        self.y_max - self.y_min
    }

    pub fn centroid(&self) -> (f64, f64) {
        (
            (self.x_min + self.x_max) / 2.0,
            (self.y_min + self.y_max) / 2.0,
        )
    }

    /// Resolve against a pixel resolution. The result always covers at least
    /// one pixel and never exceeds the frame.
    pub fn to_pixels(&self, width: u32, height: u32) -> PixelRect {
        let x1 = ((self.x_min * f64::from(width)) as u32).min(width.saturating_sub(1));
        let y1 = ((self.y_min * f64::from(height)) as u32).min(height.saturating_sub(1));
        let x2 = ((self.x_max * f64::from(width)) as u32).clamp(x1 + 1, width.max(1));
        let y2 = ((self.y_max * f64::from(height)) as u32).clamp(y1 + 1, height.max(1));
        PixelRect {
            x: x1,
            y: y1,
            width: x2 - x1,
            height: y2 - y1,
        }
    }

    /// Fractional point to device pixels
    pub fn fraction_to_pixels(fx: f64, fy: f64, width: u32, height: u32) -> Point {
        Point::new(fx * f64::from(width), fy * f64::from(height))
    }
}

impl Default for Region {
    fn default() -> Self {
        Self::full()
    }
}

impl std::fmt::Display for Region {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "({:.3}, {:.3})-({:.3}, {:.3})",
            self.x_min, self.y_min, self.x_max, self.y_max
        )
    }
}

impl std::str::FromStr for Region {
    type Err = RegionError;

    /// Parse `x_min,x_max,y_min,y_max`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let parts: Vec<f64> = s
            .split(',')
            .map(|p| p.trim().parse::<f64>())
            .collect::<Result<_, _>>()
            .map_err(|e| RegionError::InvalidRegion(format!("'{}': {}", s, e)))?;
        if parts.len() != 4 {
            return Err(RegionError::InvalidRegion(format!(
                "'{}': expected x_min,x_max,y_min,y_max",
                s
            )));
        }
        Self::new(parts[0], parts[1], parts[2], parts[3])
    }
}
