//! Normalized cross-correlation template matching (correlation coefficient).
//!
//! Window sums come from summed-area tables, so only the cross term is
//! computed per position. Large searches run coarse-to-fine: a downscaled
//! pass picks the candidate, a full-resolution pass refines around it.

use image::{GrayImage, imageops};
use serde::{Deserialize, Serialize};

/// Above this many multiply-adds the search goes coarse-to-fine
const DIRECT_SEARCH_BUDGET: u64 = 40_000_000;
/// Smallest template side kept after downscaling
const MIN_COARSE_TEMPLATE: u32 = 8;
/// Variance below which a patch counts as flat
const FLAT_EPSILON: f64 = 1e-6;

/// Best match of a template inside an image
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct TemplateMatch {
    /// Correlation coefficient in [-1, 1]
    pub score: f64,
    /// Top-left corner of the best window, in image pixels
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl TemplateMatch {
    /// Centre of the matched window
    pub fn center(&self) -> (f64, f64) {
        (
            f64::from(self.x) + f64::from(self.width) / 2.0,
            f64::from(self.y) + f64::from(self.height) / 2.0,
        )
    }
}

/// Find the best position of `template` in `image`.
///
/// Returns `None` when the template is empty or larger than the image.
pub fn match_template(image: &GrayImage, template: &GrayImage) -> Option<TemplateMatch> {
    let (iw, ih) = image.dimensions();
    let (tw, th) = template.dimensions();
    if tw == 0 || th == 0 || tw > iw || th > ih {
        return None;
    }

    let positions = u64::from(iw - tw + 1) * u64::from(ih - th + 1);
    let cost = positions * u64::from(tw) * u64::from(th);
    let factor = coarse_factor(cost, tw.min(th));
    if factor <= 1 {
        return Some(search(image, template, 0..=iw - tw, 0..=ih - th));
    }

    let small_image = imageops::resize(image, iw / factor, ih / factor, imageops::FilterType::Triangle);
    let small_template = imageops::resize(template, tw / factor, th / factor, imageops::FilterType::Triangle);
    let coarse = search(
        &small_image,
        &small_template,
        0..=small_image.width() - small_template.width(),
        0..=small_image.height() - small_template.height(),
    );

    let cx = coarse.x * factor;
    let cy = coarse.y * factor;
    let x_range = cx.saturating_sub(factor)..=(cx + factor).min(iw - tw);
    let y_range = cy.saturating_sub(factor)..=(cy + factor).min(ih - th);
    Some(search(image, template, x_range, y_range))
}

fn coarse_factor(cost: u64, min_side: u32) -> u32 {
    if cost <= DIRECT_SEARCH_BUDGET {
        return 1;
    }
    // Cost falls with the fourth power of the scale factor
    let wanted = ((cost as f64 / DIRECT_SEARCH_BUDGET as f64).powf(0.25)).ceil() as u32;
    wanted.min(min_side / MIN_COARSE_TEMPLATE).max(1)
}

/// Exhaustive correlation-coefficient search over the given top-left ranges
fn search(
    image: &GrayImage,
    template: &GrayImage,
    xs: std::ops::RangeInclusive<u32>,
    ys: std::ops::RangeInclusive<u32>,
) -> TemplateMatch {
    let (tw, th) = template.dimensions();
    let n = f64::from(tw) * f64::from(th);

    let t: Vec<f64> = template.pixels().map(|p| f64::from(p.0[0])).collect();
    let t_mean = t.iter().sum::<f64>() / n;
    let t_centered: Vec<f64> = t.iter().map(|v| v - t_mean).collect();
    let t_energy: f64 = t_centered.iter().map(|v| v * v).sum();

    let table = SummedArea::new(image);
    let iw = image.width() as usize;
    let raw = image.as_raw();

    let mut best = TemplateMatch {
        score: f64::NEG_INFINITY,
        x: *xs.start(),
        y: *ys.start(),
        width: tw,
        height: th,
    };

    for y in ys {
        for x in xs.clone() {
            let (sum, sum_sq) = table.window(x, y, tw, th);
            let w_energy = sum_sq - sum * sum / n;

            let score = if t_energy < FLAT_EPSILON || w_energy < FLAT_EPSILON {
                // Correlation is undefined for flat patches; two flat patches
                // of the same level are treated as identical
                let same_level = (sum / n - t_mean).abs() < 0.5;
                if t_energy < FLAT_EPSILON && w_energy < FLAT_EPSILON && same_level {
                    1.0
                } else {
                    0.0
                }
            } else {
                let mut cross = 0.0;
                for ty in 0..th as usize {
                    let row = (y as usize + ty) * iw + x as usize;
                    let t_row = &t_centered[ty * tw as usize..(ty + 1) * tw as usize];
                    for (tx, tv) in t_row.iter().enumerate() {
                        cross += f64::from(raw[row + tx]) * tv;
                    }
                }
                (cross / (t_energy * w_energy).sqrt()).clamp(-1.0, 1.0)
            };

            if score > best.score {
                best.score = score;
                best.x = x;
                best.y = y;
            }
        }
    }
    best
}

/// Summed-area tables of intensity and squared intensity
struct SummedArea {
    width: usize,
    sum: Vec<f64>,
    sum_sq: Vec<f64>,
}

impl SummedArea {
    fn new(image: &GrayImage) -> Self {
        let (w, h) = (image.width() as usize, image.height() as usize);
        let stride = w + 1;
        let mut sum = vec![0.0; stride * (h + 1)];
        let mut sum_sq = vec![0.0; stride * (h + 1)];
        for y in 0..h {
            let mut row_sum = 0.0;
            let mut row_sq = 0.0;
            for x in 0..w {
                let v = f64::from(image.get_pixel(x as u32, y as u32).0[0]);
                row_sum += v;
                row_sq += v * v;
                let idx = (y + 1) * stride + x + 1;
                sum[idx] = sum[idx - stride] + row_sum;
                sum_sq[idx] = sum_sq[idx - stride] + row_sq;
            }
        }
        Self { width: stride, sum, sum_sq }
    }

    /// (sum, sum of squares) over the `w`×`h` window at (x, y)
    fn window(&self, x: u32, y: u32, w: u32, h: u32) -> (f64, f64) {
        let (x0, y0) = (x as usize, y as usize);
        let (x1, y1) = (x0 + w as usize, y0 + h as usize);
        let at = |table: &[f64], x: usize, y: usize| table[y * self.width + x];
        let rect = |table: &[f64]| at(table, x1, y1) - at(table, x0, y1) - at(table, x1, y0) + at(table, x0, y0);
        (rect(&self.sum), rect(&self.sum_sq))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    fn noise(width: u32, height: u32, seed: u32) -> GrayImage {
        GrayImage::from_fn(width, height, |x, y| {
            let v = (x.wrapping_mul(7919) ^ y.wrapping_mul(104_729) ^ seed).wrapping_mul(2_654_435_761);
            Luma([(v >> 24) as u8])
        })
    }

    #[test]
    fn test_exact_patch_found() {
        let image = noise(80, 60, 1);
        let template = imageops::crop_imm(&image, 30, 20, 16, 12).to_image();
        let found = match_template(&image, &template).unwrap();
        assert_eq!((found.x, found.y), (30, 20));
        assert!(found.score > 0.999);
        assert_eq!(found.center(), (38.0, 26.0));
    }

    #[test]
    fn test_brightness_shift_still_matches() {
        let image = noise(50, 50, 7);
        let template = GrayImage::from_fn(10, 10, |x, y| {
            let v = image.get_pixel(x + 5, y + 25).0[0];
            Luma([v / 2 + 20])
        });
        let found = match_template(&image, &template).unwrap();
        assert_eq!((found.x, found.y), (5, 25));
        assert!(found.score > 0.95);
    }

    #[test]
    fn test_unrelated_template_scores_low() {
        let image = GrayImage::from_fn(60, 60, |x, _| Luma([if x % 20 < 10 { 0 } else { 255 }]));
        let template = noise(12, 12, 99);
        let found = match_template(&image, &template).unwrap();
        assert!(found.score < 0.8, "{}", found.score);
    }

    #[test]
    fn test_template_larger_than_image() {
        assert!(match_template(&noise(10, 10, 0), &noise(11, 5, 0)).is_none());
    }

    #[test]
    fn test_coarse_to_fine_on_large_search() {
        let mut image = GrayImage::from_pixel(900, 700, Luma([200]));
        let template = GrayImage::from_fn(96, 96, |x, y| {
            Luma([if (x / 12 + y / 12) % 2 == 0 { 20 } else { 230 }])
        });
        imageops::replace(&mut image, &template, 512, 300);
        let found = match_template(&image, &template).unwrap();
        assert_eq!((found.x, found.y), (512, 300));
        assert!(found.score > 0.99);
    }
}
