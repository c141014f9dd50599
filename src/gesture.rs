//! Human-like gesture synthesis.
//!
//! Swipes follow a cubic Bézier curve whose control points are jittered
//! along and across the start→end vector, sampled into 15–25 micro-moves
//! with slow ends and a fast middle. Taps land near the centre of a region
//! with a bounded random offset, so no two taps on the same target share a
//! pixel pattern.

use rand::Rng;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::region::{Point, Region, RegionError};

/// Minimum and maximum number of samples per synthesized path
pub const MIN_PATH_SAMPLES: usize = 15;
pub const MAX_PATH_SAMPLES: usize = 25;

/// Fraction of the path (at each end) that moves at the slower speed
const EASE_FRACTION: f64 = 0.2;
const SLOW_MULTIPLIER: (f64, f64) = (1.2, 1.5);
const FAST_MULTIPLIER: (f64, f64) = (0.7, 1.0);

/// Control-point jitter, as a fraction of the start→end distance
const ALONG_DEVIATION: f64 = 0.1;
const PERPENDICULAR_DEVIATION: f64 = 0.2;

/// Jitter floor in pixels so very short (or zero-length) drags still vary
const MIN_DEVIATION_BASE: f64 = 8.0;

/// Tap offset cap, as a fraction of the region extent on each axis
const TAP_OFFSET_FRACTION: f64 = 0.2;

/// Result type for gesture synthesis
pub type GestureResult<T> = Result<T, GestureError>;

/// Errors raised while synthesizing gestures
#[derive(Debug, Clone, PartialEq)]
pub enum GestureError {
    /// Target region is malformed (a workflow-definition bug)
    InvalidRegion(RegionError),
    /// Zero-length duration requested for a path
    InvalidDuration(Duration),
}

impl std::fmt::Display for GestureError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            GestureError::InvalidRegion(err) => write!(f, "{}", err),
            GestureError::InvalidDuration(d) => write!(f, "Invalid gesture duration: {:?}", d),
        }
    }
}

impl std::error::Error for GestureError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            GestureError::InvalidRegion(err) => Some(err),
            GestureError::InvalidDuration(_) => None,
        }
    }
}

impl From<RegionError> for GestureError {
    fn from(err: RegionError) -> Self {
        GestureError::InvalidRegion(err)
    }
}

/// One step of a synthesized motion: move to `point` after waiting `delay`
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PathSample {
    pub point: Point,
    #[serde(with = "duration_ms")]
    pub delay: Duration,
}

/// An immutable, ordered pointer trajectory
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GesturePath {
    samples: Vec<PathSample>,
}

impl GesturePath {
    pub fn samples(&self) -> &[PathSample] {
        &self.samples
    }

    pub fn points(&self) -> impl Iterator<Item = Point> + '_ {
        self.samples.iter().map(|s| s.point)
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn start(&self) -> Option<Point> {
        self.samples.first().map(|s| s.point)
    }

    pub fn end(&self) -> Option<Point> {
        self.samples.last().map(|s| s.point)
    }

    /// Sum of all per-sample delays
    pub fn total_duration(&self) -> Duration {
        self.samples.iter().map(|s| s.delay).sum()
    }
}

/// Direction of a swipe inside a region
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SwipeDirection {
    /// Finger moves top → bottom
    Down,
    /// Finger moves bottom → top
    Up,
}

/// Synthesize a curved path from `p0` to `p3` using the thread RNG
pub fn synthesize_path(p0: Point, p3: Point, duration: Duration) -> GestureResult<GesturePath> {
    synthesize_path_with_rng(&mut rand::thread_rng(), p0, p3, duration)
}

/// Synthesize a curved path with a caller-supplied RNG
pub fn synthesize_path_with_rng<R: Rng + ?Sized>(
    rng: &mut R,
    p0: Point,
    p3: Point,
    duration: Duration,
) -> GestureResult<GesturePath> {
    if duration.is_zero() {
        return Err(GestureError::InvalidDuration(duration));
    }

    let dx = p3.x - p0.x;
    let dy = p3.y - p0.y;
    let length = (dx * dx + dy * dy).sqrt();
    let scale = length.max(MIN_DEVIATION_BASE);

    // Unit perpendicular; any direction will do for a zero-length drag
    let (px, py) = if length > f64::EPSILON {
        (-dy / length, dx / length)
    } else {
        let angle = rng.gen_range(0.0..std::f64::consts::TAU);
        (angle.cos(), angle.sin())
    };

    let mut control = |fraction: f64| {
        let along = scale * ALONG_DEVIATION;
        let across = rng.gen_range(-PERPENDICULAR_DEVIATION..PERPENDICULAR_DEVIATION) * scale;
        Point::new(
            p0.x + dx * fraction + rng.gen_range(-along..along) + px * across,
            p0.y + dy * fraction + rng.gen_range(-along..along) + py * across,
        )
    };
    let p1 = control(0.33);
    let p2 = control(0.66);

    let count = rng.gen_range(MIN_PATH_SAMPLES..=MAX_PATH_SAMPLES);
    let segments = (count - 1) as f64;
    let base = duration.as_secs_f64() / segments;

    let mut samples = Vec::with_capacity(count);
    for i in 0..count {
        let t = i as f64 / segments;
        let delay = if i == 0 {
            Duration::ZERO
        } else {
            let (lo, hi) = if t <= EASE_FRACTION || t >= 1.0 - EASE_FRACTION {
                SLOW_MULTIPLIER
            } else {
                FAST_MULTIPLIER
            };
            Duration::from_secs_f64(base * rng.gen_range(lo..=hi))
        };
        samples.push(PathSample {
            point: cubic_bezier(p0, p1, p2, p3, t),
            delay,
        });
    }

    Ok(GesturePath { samples })
}

fn cubic_bezier(p0: Point, p1: Point, p2: Point, p3: Point, t: f64) -> Point {
    let u = 1.0 - t;
    let (a, b, c, d) = (u * u * u, 3.0 * u * u * t, 3.0 * u * t * t, t * t * t);
    Point::new(
        a * p0.x + b * p1.x + c * p2.x + d * p3.x,
        a * p0.y + b * p1.y + c * p2.y + d * p3.y,
    )
}

/// Pick a tap point for `region` on a `width`×`height` screen
pub fn synthesize_tap(region: &Region, width: u32, height: u32) -> GestureResult<Point> {
    synthesize_tap_with_rng(&mut rand::thread_rng(), region, width, height)
}

/// Tap point near the centroid; the offset never leaves the region
pub fn synthesize_tap_with_rng<R: Rng + ?Sized>(
    rng: &mut R,
    region: &Region,
    width: u32,
    height: u32,
) -> GestureResult<Point> {
    region.validate()?;
    if width == 0 || height == 0 {
        return Err(GestureError::InvalidRegion(RegionError::InvalidRegion(format!(
            "screen resolution {}x{} is empty",
            width, height
        ))));
    }

    let (cx, cy) = region.centroid();
    let max_x = (region.width() * TAP_OFFSET_FRACTION).min(region.width() / 2.0);
    let max_y = (region.height() * TAP_OFFSET_FRACTION).min(region.height() / 2.0);
    let fx = cx + rng.gen_range(-max_x..=max_x);
    let fy = cy + rng.gen_range(-max_y..=max_y);

    // Pixel rounding can push a tiny region's point onto its border
    let rect = region.to_pixels(width, height);
    let point = Region::fraction_to_pixels(fx, fy, width, height);
    Ok(Point::new(
        point.x.round().clamp(f64::from(rect.x), f64::from(rect.x + rect.width - 1)),
        point.y.round().clamp(f64::from(rect.y), f64::from(rect.y + rect.height - 1)),
    ))
}

/// Start/end pixel points of a vertical swipe along a region's centre line.
///
/// `extend` carries the end point past the region edge by that fraction of
/// the screen height, clamped to stay on screen.
pub fn swipe_within(
    region: &Region,
    direction: SwipeDirection,
    extend: f64,
    width: u32,
    height: u32,
) -> GestureResult<(Point, Point)> {
    region.validate()?;
    let (cx, _) = region.centroid();
    let x = cx * f64::from(width);
    let h = f64::from(height);
    let margin = 10.0_f64.min(h / 2.0);
    let (start, end) = match direction {
        SwipeDirection::Down => (region.y_min * h, ((region.y_max + extend) * h).min(h - margin)),
        SwipeDirection::Up => (region.y_max * h, ((region.y_min - extend) * h).max(margin)),
    };
    Ok((Point::new(x, start), Point::new(x, end)))
}

mod duration_ms {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_millis() as u64)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_millis(u64::deserialize(d)?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn pts(path: &GesturePath) -> Vec<(f64, f64)> {
        path.points().map(|p| (p.x, p.y)).collect()
    }

    #[test]
    fn test_path_endpoints_are_exact() {
        let p0 = Point::new(100.0, 200.0);
        let p3 = Point::new(500.0, 1500.0);
        let path = synthesize_path(p0, p3, Duration::from_millis(600)).unwrap();
        assert_eq!(path.start(), Some(p0));
        let end = path.end().unwrap();
        assert!((end.x - p3.x).abs() < 1e-9 && (end.y - p3.y).abs() < 1e-9);
    }

    #[test]
    fn test_path_sample_count_in_range() {
        let mut rng = StdRng::seed_from_u64(7);
        for _ in 0..200 {
            let path = synthesize_path_with_rng(
                &mut rng,
                Point::new(0.0, 0.0),
                Point::new(300.0, 300.0),
                Duration::from_millis(500),
            )
            .unwrap();
            assert!((MIN_PATH_SAMPLES..=MAX_PATH_SAMPLES).contains(&path.len()));
        }
    }

    #[test]
    fn test_paths_are_never_identical() {
        let p0 = Point::new(540.0, 720.0);
        let p3 = Point::new(540.0, 1680.0);
        let paths: Vec<_> = (0..20)
            .map(|_| pts(&synthesize_path(p0, p3, Duration::from_millis(600)).unwrap()))
            .collect();
        for i in 0..paths.len() {
            for j in (i + 1)..paths.len() {
                assert_ne!(paths[i], paths[j], "paths {} and {} are identical", i, j);
            }
        }
    }

    #[test]
    fn test_zero_length_drag_still_varies() {
        let p = Point::new(50.0, 50.0);
        let a = pts(&synthesize_path(p, p, Duration::from_millis(200)).unwrap());
        let b = pts(&synthesize_path(p, p, Duration::from_millis(200)).unwrap());
        assert_ne!(a, b);
    }

    #[test]
    fn test_ends_are_slower_than_middle() {
        let mut rng = StdRng::seed_from_u64(42);
        let path = synthesize_path_with_rng(
            &mut rng,
            Point::new(0.0, 0.0),
            Point::new(0.0, 1000.0),
            Duration::from_millis(1000),
        )
        .unwrap();
        let samples = path.samples();
        let n = samples.len();
        assert_eq!(samples[0].delay, Duration::ZERO);
        // Every slow segment is at least 1.2x base, every fast one at most 1.0x
        let first = samples[1].delay;
        let last = samples[n - 1].delay;
        let middle = samples[n / 2].delay;
        assert!(first > middle);
        assert!(last > middle);
    }

    #[test]
    fn test_zero_duration_rejected() {
        let err = synthesize_path(Point::new(0.0, 0.0), Point::new(1.0, 1.0), Duration::ZERO);
        assert!(matches!(err, Err(GestureError::InvalidDuration(_))));
    }

    #[test]
    fn test_tap_stays_inside_random_regions() {
        let mut rng = StdRng::seed_from_u64(1234);
        for _ in 0..1000 {
            let x0 = rng.gen_range(0.0..0.95);
            let y0 = rng.gen_range(0.0..0.95);
            let x1 = rng.gen_range((x0 + 0.001)..=1.0);
            let y1 = rng.gen_range((y0 + 0.001)..=1.0);
            let region = Region::new(x0, x1, y0, y1).unwrap();
            let (w, h) = (rng.gen_range(320..2000), rng.gen_range(480..3200));
            let point = synthesize_tap_with_rng(&mut rng, &region, w, h).unwrap();
            let rect = region.to_pixels(w, h);
            assert!(rect.contains(point), "{:?} outside {:?}", point, rect);
        }
    }

    #[test]
    fn test_tap_rejects_invalid_region() {
        let region = Region {
            x_min: 0.5,
            x_max: 0.5,
            y_min: 0.1,
            y_max: 0.2,
        };
        assert!(matches!(
            synthesize_tap(&region, 1080, 2400),
            Err(GestureError::InvalidRegion(_))
        ));
        let outside = Region {
            x_min: 0.5,
            x_max: 1.4,
            y_min: 0.1,
            y_max: 0.2,
        };
        assert!(synthesize_tap(&outside, 1080, 2400).is_err());
    }

    #[test]
    fn test_swipe_within_down_is_clamped() {
        let region = Region::new(0.2, 0.8, 0.5, 0.95).unwrap();
        let (start, end) = swipe_within(&region, SwipeDirection::Down, 0.2, 1000, 2000).unwrap();
        assert_eq!(start, Point::new(500.0, 1000.0));
        assert_eq!(end, Point::new(500.0, 1990.0));
    }

    #[test]
    fn test_swipe_within_up() {
        let region = Region::new(0.0, 1.0, 0.3, 0.7).unwrap();
        let (start, end) = swipe_within(&region, SwipeDirection::Up, 0.0, 100, 1000).unwrap();
        assert!(start.y > end.y);
        assert!((end.y - 300.0).abs() < 1e-9);
    }
}
