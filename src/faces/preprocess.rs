use anyhow::{anyhow, Result};
use image::{DynamicImage, GenericImageView, ImageReader, Limits};
use std::io::Cursor;

/// Mean luma below which an image counts as dim
const DIM_LUMA: f64 = 100.0;

/// Largest buffer a decoder may allocate for one image
const MAX_DECODE_ALLOC: u64 = 512 * 1024 * 1024;

/// A decoded image ready for detection, plus the factor it was scaled by.
pub struct PreparedImage {
    pub image: DynamicImage,
    pub scale: f32,
}

pub fn decode(bytes: &[u8]) -> Result<DynamicImage> {
    let mut limits = Limits::default();
    limits.max_alloc = Some(MAX_DECODE_ALLOC);

    let mut reader = ImageReader::new(Cursor::new(bytes))
        .with_guessed_format()
        .map_err(|e| anyhow!("Failed to read image: {}", e))?;
    reader.limits(limits);
    reader.decode().map_err(|e| anyhow!("Failed to load image: {}", e))
}

/// Upscale small images so small faces survive detection; optionally lift
/// dim images and sharpen slightly.
///
/// The upscale factor is bounded so the longer side never passes `max_side`;
/// an image already longer than that is not upscaled at all.
pub fn prepare(img: DynamicImage, min_side: u32, max_side: u32, enhance: bool) -> PreparedImage {
    let scale = upscale_factor(img.dimensions(), min_side, max_side);

    let (mut image, scale) = if scale > 1.0 {
        let (width, height) = img.dimensions();
        let new_width = (width as f32 * scale).round() as u32;
        let new_height = (height as f32 * scale).round() as u32;
        (
            img.resize_exact(new_width, new_height, image::imageops::FilterType::Lanczos3),
            scale,
        )
    } else {
        (img, 1.0)
    };

    if enhance {
        if mean_luma(&image) < DIM_LUMA {
            image = image.brighten(40).adjust_contrast(10.0);
        }
        image = image.unsharpen(2.0, 1);
    }

    PreparedImage { image, scale }
}

fn upscale_factor((width, height): (u32, u32), min_side: u32, max_side: u32) -> f32 {
    let shorter = width.min(height).max(1);
    let longer = width.max(height).max(1);
    if min_side == 0 || shorter >= min_side {
        return 1.0;
    }
    let wanted = min_side as f32 / shorter as f32;
    let allowed = max_side as f32 / longer as f32;
    wanted.min(allowed)
}

fn mean_luma(img: &DynamicImage) -> f64 {
    let luma = img.to_luma8();
    let count = luma.width() as usize * luma.height() as usize;
    if count == 0 {
        return 0.0;
    }
    luma.pixels().map(|p| p[0] as f64).sum::<f64>() / count as f64
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};

    #[test]
    fn test_small_images_upscaled() {
        let img = DynamicImage::new_rgb8(240, 120);
        let prepared = prepare(img, 480, 4096, false);
        assert_eq!(prepared.image.dimensions(), (960, 480));
        assert!((prepared.scale - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_large_images_untouched() {
        let img = DynamicImage::new_rgb8(800, 600);
        let prepared = prepare(img, 480, 4096, false);
        assert_eq!(prepared.image.dimensions(), (800, 600));
        assert_eq!(prepared.scale, 1.0);
    }

    #[test]
    fn test_thin_images_stay_bounded() {
        let prepared = prepare(DynamicImage::new_rgb8(1, 100), 480, 4096, false);
        let (w, h) = prepared.image.dimensions();
        assert_eq!((w, h), (41, 4096));
        assert!((prepared.scale - 40.96).abs() < 1e-4);

        // Already past the cap on its long side: left alone
        let prepared = prepare(DynamicImage::new_rgb8(1, 20_000), 480, 4096, false);
        assert_eq!(prepared.image.dimensions(), (1, 20_000));
        assert_eq!(prepared.scale, 1.0);
    }

    #[test]
    fn test_enhance_brightens_dark_images() {
        let dark = DynamicImage::ImageRgb8(ImageBuffer::from_pixel(32, 32, Rgb([20u8, 20, 20])));
        let before = mean_luma(&dark);
        let prepared = prepare(dark, 0, 4096, true);
        assert!(mean_luma(&prepared.image) > before);
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"definitely not an image").is_err());
    }
}
