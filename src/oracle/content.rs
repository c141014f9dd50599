//! "Has real content loaded?" heuristic.
//!
//! A blank screen with a spinner and a populated screen differ on three
//! cheap axes: how much of the area sits on an edge, how spread out the
//! brightness is, and how many intensity levels are in use. Each signal is
//! normalised to [0,1] and combined as a weighted sum.

use image::{GrayImage, RgbImage, imageops};
use serde::{Deserialize, Serialize};

use super::enhance::histogram;

pub const EDGE_WEIGHT: f64 = 0.3;
pub const VARIANCE_WEIGHT: f64 = 0.3;
pub const ENTROPY_WEIGHT: f64 = 0.4;

/// Edge density that saturates the edge signal
const EDGE_SCALE: f64 = 10.0;
/// Value-channel variance that saturates the variance signal
const VARIANCE_SCALE: f64 = 1000.0;
/// Maximum entropy of a 256-bin histogram, in bits
const MAX_ENTROPY: f64 = 8.0;

/// Hysteresis thresholds on the Sobel gradient magnitude
pub const CANNY_LOW: f32 = 50.0;
pub const CANNY_HIGH: f32 = 150.0;
const BLUR_SIGMA: f32 = 1.4;

/// Raw and combined content signals for one region
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct ContentSignals {
    /// Fraction of pixels on a detected edge
    pub edge_density: f64,
    /// Variance of V = max(R,G,B)
    pub value_variance: f64,
    /// Shannon entropy of gray levels (bits)
    pub entropy: f64,
    /// Weighted, normalised combination in [0,1]
    pub score: f64,
}

/// Compute all three signals and the combined score
pub fn content_signals(image: &RgbImage) -> ContentSignals {
    if image.width() == 0 || image.height() == 0 {
        return ContentSignals {
            edge_density: 0.0,
            value_variance: 0.0,
            entropy: 0.0,
            score: 0.0,
        };
    }

    let gray = image::DynamicImage::ImageRgb8(image.clone()).to_luma8();
    let edge_density = edge_density(&gray);
    let value_variance = value_variance(image);
    let entropy = entropy(&gray);

    let score = EDGE_WEIGHT * (edge_density * EDGE_SCALE).min(1.0)
        + VARIANCE_WEIGHT * (value_variance / VARIANCE_SCALE).min(1.0)
        + ENTROPY_WEIGHT * (entropy / MAX_ENTROPY).min(1.0);

    ContentSignals {
        edge_density,
        value_variance,
        entropy,
        score,
    }
}

/// Combined score only
pub fn content_score(image: &RgbImage) -> f64 {
    content_signals(image).score
}

/// Fraction of pixels marked as edges by a Canny-style detector
pub fn edge_density(gray: &GrayImage) -> f64 {
    let edges = canny(gray, CANNY_LOW, CANNY_HIGH);
    let total = edges.len();
    if total == 0 {
        return 0.0;
    }
    edges.iter().filter(|&&e| e).count() as f64 / total as f64
}

/// Population variance of the HSV value channel
pub fn value_variance(image: &RgbImage) -> f64 {
    let n = f64::from(image.width()) * f64::from(image.height());
    if n == 0.0 {
        return 0.0;
    }
    let (sum, sum_sq) = image.pixels().fold((0.0f64, 0.0f64), |(s, sq), p| {
        let v = f64::from(p.0[0].max(p.0[1]).max(p.0[2]));
        (s + v, sq + v * v)
    });
    let mean = sum / n;
    (sum_sq / n - mean * mean).max(0.0)
}

/// Shannon entropy (bits) of the 256-bin gray histogram
pub fn entropy(gray: &GrayImage) -> f64 {
    let total = f64::from(gray.width()) * f64::from(gray.height());
    if total == 0.0 {
        return 0.0;
    }
    histogram(gray)
        .iter()
        .filter(|&&c| c > 0)
        .map(|&c| {
            let p = c as f64 / total;
            -p * p.log2()
        })
        .sum()
}

/// Blur, Sobel, non-maximum suppression, hysteresis. Row-major edge mask.
fn canny(gray: &GrayImage, low: f32, high: f32) -> Vec<bool> {
    let (w, h) = gray.dimensions();
    let (w, h) = (w as usize, h as usize);
    if w < 3 || h < 3 {
        return vec![false; w * h];
    }

    let blurred = imageops::blur(gray, BLUR_SIGMA);
    let px = |x: usize, y: usize| f32::from(blurred.get_pixel(x as u32, y as u32).0[0]);

    let mut magnitude = vec![0.0f32; w * h];
    let mut direction = vec![0u8; w * h];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let gx = px(x + 1, y - 1) + 2.0 * px(x + 1, y) + px(x + 1, y + 1)
                - px(x - 1, y - 1)
                - 2.0 * px(x - 1, y)
                - px(x - 1, y + 1);
            let gy = px(x - 1, y + 1) + 2.0 * px(x, y + 1) + px(x + 1, y + 1)
                - px(x - 1, y - 1)
                - 2.0 * px(x, y - 1)
                - px(x + 1, y - 1);
            let idx = y * w + x;
            magnitude[idx] = (gx * gx + gy * gy).sqrt();
            direction[idx] = quantize_direction(gy.atan2(gx));
        }
    }

    // Thin to local maxima along the gradient
    let mut suppressed = vec![0.0f32; w * h];
    for y in 1..h - 1 {
        for x in 1..w - 1 {
            let idx = y * w + x;
            let m = magnitude[idx];
            if m < low {
                continue;
            }
            let (a, b) = match direction[idx] {
                0 => (magnitude[idx - 1], magnitude[idx + 1]),
                1 => (magnitude[idx - w + 1], magnitude[idx + w - 1]),
                2 => (magnitude[idx - w], magnitude[idx + w]),
                _ => (magnitude[idx - w - 1], magnitude[idx + w + 1]),
            };
            if m >= a && m >= b {
                suppressed[idx] = m;
            }
        }
    }

    let mut edges = vec![false; w * h];
    let mut stack: Vec<usize> = suppressed
        .iter()
        .enumerate()
        .filter(|&(_, &m)| m >= high)
        .map(|(i, _)| i)
        .collect();
    for &i in &stack {
        edges[i] = true;
    }
    while let Some(idx) = stack.pop() {
        let (x, y) = (idx % w, idx / w);
        for ny in y.saturating_sub(1)..=(y + 1).min(h - 1) {
            for nx in x.saturating_sub(1)..=(x + 1).min(w - 1) {
                let n = ny * w + nx;
                if !edges[n] && suppressed[n] >= low {
                    edges[n] = true;
                    stack.push(n);
                }
            }
        }
    }
    edges
}

/// 0: horizontal gradient, 1: 45°, 2: vertical, 3: 135°
fn quantize_direction(angle: f32) -> u8 {
    let mut deg = angle.to_degrees();
    if deg < 0.0 {
        deg += 180.0;
    }
    if !(22.5..157.5).contains(&deg) {
        0
    } else if deg < 67.5 {
        1
    } else if deg < 112.5 {
        2
    } else {
        3
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::MockFramebuffer;

    fn blank_with_marker() -> RgbImage {
        let mut fb = MockFramebuffer::with_color(200, 200, [250, 250, 250]);
        fb.draw_circle(100, 100, 6, [40, 40, 40]);
        fb.to_image()
    }

    fn dense_colored_text() -> RgbImage {
        let palette = [
            [230, 40, 40],
            [40, 160, 60],
            [30, 60, 200],
            [240, 200, 30],
            [20, 20, 20],
            [250, 250, 250],
            [150, 60, 180],
            [0, 170, 170],
        ];
        let mut fb = MockFramebuffer::new(200, 200);
        for row in 0..20u32 {
            let bg = palette[(row as usize + 3) % palette.len()];
            let fg = palette[row as usize % palette.len()];
            fb.draw_rect(0, row * 10, 200, 10, bg);
            fb.draw_text(2, row * 10 + 1, "Lorem ipsum 42 dolor", fg, bg);
        }
        fb.to_image()
    }

    #[test]
    fn test_blank_with_single_marker_scores_low() {
        let signals = content_signals(&blank_with_marker());
        assert!(signals.score < 0.3, "{:?}", signals);
    }

    #[test]
    fn test_dense_colored_text_scores_high() {
        let signals = content_signals(&dense_colored_text());
        assert!(signals.score > 0.4, "{:?}", signals);
        assert!(signals.edge_density > 0.05);
    }

    #[test]
    fn test_flat_image_has_no_signal() {
        let img = RgbImage::from_pixel(64, 64, image::Rgb([128, 128, 128]));
        let signals = content_signals(&img);
        assert_eq!(signals.edge_density, 0.0);
        assert_eq!(signals.value_variance, 0.0);
        assert_eq!(signals.entropy, 0.0);
        assert_eq!(signals.score, 0.0);
    }

    #[test]
    fn test_entropy_of_two_equal_levels_is_one_bit() {
        let gray = GrayImage::from_fn(10, 10, |x, _| image::Luma([if x < 5 { 0 } else { 255 }]));
        assert!((entropy(&gray) - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_empty_image() {
        assert_eq!(content_score(&RgbImage::new(0, 0)), 0.0);
    }
}
