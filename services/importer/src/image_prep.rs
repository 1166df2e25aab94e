//! Down-scaling and JPEG re-encoding shared by classification and upload.

use bytes::Bytes;
use image::codecs::jpeg::JpegEncoder;
use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use thiserror::Error;

/// Errors that can occur while preparing an image
#[derive(Debug, Error)]
pub enum PrepError {
    #[error("Failed to decode image: {0}")]
    Decode(image::ImageError),

    #[error("Failed to encode JPEG: {0}")]
    Encode(image::ImageError),

    #[error("Image preparation task failed: {0}")]
    Task(String),
}

/// A re-encoded JPEG image
#[derive(Debug, Clone)]
pub struct PreparedImage {
    pub bytes: Bytes,
    pub width: u32,
    pub height: u32,
}

/// Scale `(w, h)` proportionally so that `w * h` fits in `max_pixels`.
///
/// Images already within the budget are returned unchanged; nothing is upscaled.
pub fn scaled_dimensions(w: u32, h: u32, max_pixels: u64) -> (u32, u32) {
    let pixels = w as u64 * h as u64;
    if pixels == 0 || pixels <= max_pixels {
        return (w, h);
    }

    let sf = (max_pixels as f64 / pixels as f64).sqrt();
    (
        ((w as f64 * sf).floor() as u32).max(1),
        ((h as f64 * sf).floor() as u32).max(1),
    )
}

/// Decode `data`, shrink it to `max_pixels` and re-encode it as JPEG
pub fn prepare_jpeg(data: &[u8], max_pixels: u64, quality: u8) -> Result<PreparedImage, PrepError> {
    let img = image::load_from_memory(data).map_err(PrepError::Decode)?;

    let (w, h) = img.dimensions();
    let (target_w, target_h) = scaled_dimensions(w, h, max_pixels);

    let img = if (target_w, target_h) != (w, h) {
        img.resize_exact(target_w, target_h, FilterType::Triangle)
    } else {
        img
    };

    // JPEG has no alpha channel
    let rgb = DynamicImage::ImageRgb8(img.to_rgb8());

    let mut out = Vec::new();
    let encoder = JpegEncoder::new_with_quality(&mut out, quality.clamp(1, 100));
    rgb.write_with_encoder(encoder).map_err(PrepError::Encode)?;

    Ok(PreparedImage {
        bytes: Bytes::from(out),
        width: target_w,
        height: target_h,
    })
}

/// [`prepare_jpeg`] on the blocking thread pool
pub async fn prepare_jpeg_blocking(
    data: Bytes,
    max_pixels: u64,
    quality: u8,
) -> Result<PreparedImage, PrepError> {
    tokio::task::spawn_blocking(move || prepare_jpeg(&data, max_pixels, quality))
        .await
        .map_err(|e| PrepError::Task(e.to_string()))?
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use image::{ImageFormat, Rgba, RgbaImage};
    use std::io::Cursor;

    /// PNG-encoded test image of the given size
    pub(crate) fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = RgbaImage::from_fn(width, height, |x, y| {
            Rgba([(x % 256) as u8, (y % 256) as u8, 128, 200])
        });
        let mut out = Cursor::new(Vec::new());
        DynamicImage::ImageRgba8(img)
            .write_to(&mut out, ImageFormat::Png)
            .unwrap();
        out.into_inner()
    }

    #[test]
    fn test_scaled_dimensions_within_budget() {
        assert_eq!(scaled_dimensions(800, 600, 1_048_576), (800, 600));
        assert_eq!(scaled_dimensions(0, 0, 1_048_576), (0, 0));
    }

    #[test]
    fn test_scaled_dimensions_downscale() {
        let (w, h) = scaled_dimensions(4000, 3000, 1_048_576);
        assert!(w as u64 * h as u64 <= 1_048_576);
        assert_eq!((w, h), (1182, 886));
    }

    #[test]
    fn test_prepare_jpeg_resizes_and_encodes() {
        let png = png_bytes(400, 200);
        let prepared = prepare_jpeg(&png, 20_000, 70).unwrap();

        assert_eq!((prepared.width, prepared.height), (200, 100));
        // JPEG SOI marker
        assert_eq!(&prepared.bytes[..2], &[0xFF, 0xD8]);

        let decoded = image::load_from_memory(&prepared.bytes).unwrap();
        assert_eq!(decoded.dimensions(), (200, 100));
    }

    #[test]
    fn test_prepare_jpeg_rejects_garbage() {
        let result = prepare_jpeg(b"definitely not an image", 1_000_000, 70);
        assert!(matches!(result, Err(PrepError::Decode(_))));
    }

    #[tokio::test]
    async fn test_prepare_jpeg_blocking() {
        let png = Bytes::from(png_bytes(64, 64));
        let prepared = prepare_jpeg_blocking(png, 1_000_000, 80).await.unwrap();
        assert_eq!((prepared.width, prepared.height), (64, 64));
    }
}
