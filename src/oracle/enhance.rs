//! Pre-processing applied before text recognition.

use image::GrayImage;
use image::imageops;

/// 3x3 sharpen kernel
pub const SHARPEN_KERNEL: [f32; 9] = [-1.0, -1.0, -1.0, -1.0, 9.0, -1.0, -1.0, -1.0, -1.0];

/// Contrast normalisation followed by sharpening
pub fn enhance(gray: &GrayImage) -> GrayImage {
    let equalized = equalize_histogram(gray);
    let mut sharpened = imageops::filter3x3(&equalized, &SHARPEN_KERNEL);

    // filter3x3 leaves the outer ring at zero
    let (width, height) = equalized.dimensions();
    for (x, y, pixel) in equalized.enumerate_pixels() {
        if x == 0 || y == 0 || x + 1 == width || y + 1 == height {
            sharpened.put_pixel(x, y, *pixel);
        }
    }
    sharpened
}

/// Global histogram equalisation
pub fn equalize_histogram(gray: &GrayImage) -> GrayImage {
    let total = u64::from(gray.width()) * u64::from(gray.height());
    if total == 0 {
        return gray.clone();
    }

    let hist = histogram(gray);
    let mut cdf = [0u64; 256];
    let mut running = 0u64;
    for (level, count) in hist.iter().enumerate() {
        running += count;
        cdf[level] = running;
    }

    let cdf_min = cdf.iter().copied().find(|&c| c > 0).unwrap_or(0);
    if total == cdf_min {
        // Single gray level, nothing to spread
        return gray.clone();
    }
    let denom = (total - cdf_min) as f64;

    let mut lut = [0u8; 256];
    for (level, slot) in lut.iter_mut().enumerate() {
        let scaled = (cdf[level].saturating_sub(cdf_min)) as f64 / denom * 255.0;
        *slot = scaled.round().clamp(0.0, 255.0) as u8;
    }

    let mut out = gray.clone();
    for pixel in out.pixels_mut() {
        pixel.0[0] = lut[pixel.0[0] as usize];
    }
    out
}

/// 256-bin intensity histogram
pub fn histogram(gray: &GrayImage) -> [u64; 256] {
    let mut hist = [0u64; 256];
    for pixel in gray.pixels() {
        hist[pixel.0[0] as usize] += 1;
    }
    hist
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::Luma;

    #[test]
    fn test_equalize_stretches_low_contrast() {
        let img = GrayImage::from_fn(16, 16, |x, _| Luma([100 + (x % 2) as u8 * 10]));
        let eq = equalize_histogram(&img);
        let values: Vec<u8> = eq.pixels().map(|p| p.0[0]).collect();
        assert_eq!(*values.iter().min().unwrap(), 0);
        assert_eq!(*values.iter().max().unwrap(), 255);
    }

    #[test]
    fn test_equalize_flat_image_unchanged() {
        let img = GrayImage::from_pixel(8, 8, Luma([42]));
        assert_eq!(equalize_histogram(&img), img);
    }

    #[test]
    fn test_enhance_keeps_dimensions() {
        let img = GrayImage::from_fn(20, 10, |x, y| Luma([(x * 10 + y) as u8]));
        let out = enhance(&img);
        assert_eq!(out.dimensions(), (20, 10));
    }

    #[test]
    fn test_enhance_flat_white_stays_white() {
        let img = GrayImage::from_pixel(160, 60, Luma([255]));
        let out = enhance(&img);
        assert!(out.pixels().all(|p| p.0[0] == 255));
    }

    #[test]
    fn test_enhance_border_follows_equalized_input() {
        let img = GrayImage::from_fn(12, 9, |x, y| Luma([((x + y) % 2) as u8 * 200]));
        let equalized = equalize_histogram(&img);
        let out = enhance(&img);
        for (x, y) in [(0, 0), (11, 0), (0, 8), (11, 8), (5, 0), (0, 4)] {
            assert_eq!(out.get_pixel(x, y), equalized.get_pixel(x, y));
        }
    }
}
