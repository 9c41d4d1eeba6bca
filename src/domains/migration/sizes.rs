//! Conventional image sizes consumers expect to exist next to every image.

use image::{imageops::FilterType, DynamicImage, GenericImageView, ImageEncoder};
use tokio::task;

use crate::domains::core::media_types::ImageFormat;
use crate::errors::{DomainError, DomainResult};

const JPEG_QUALITY: u8 = 82;

/// A named size. A zero dimension is unbounded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CriticalSize {
    pub name: &'static str,
    pub width: u32,
    pub height: u32,
    pub crop: bool,
}

impl CriticalSize {
    const fn new(name: &'static str, width: u32, height: u32, crop: bool) -> Self {
        Self { name, width, height, crop }
    }
}

pub const CORE_SIZES: [CriticalSize; 4] = [
    CriticalSize::new("thumbnail", 150, 150, true),
    CriticalSize::new("medium", 300, 300, false),
    CriticalSize::new("medium_large", 768, 0, false),
    CriticalSize::new("large", 1024, 1024, false),
];

pub const COMMERCE_SIZES: [CriticalSize; 3] = [
    CriticalSize::new("woocommerce_thumbnail", 300, 300, true),
    CriticalSize::new("woocommerce_single", 600, 600, false),
    CriticalSize::new("woocommerce_gallery_thumbnail", 100, 100, true),
];

pub fn critical_sizes(commerce: bool) -> Vec<CriticalSize> {
    let mut sizes = CORE_SIZES.to_vec();
    if commerce {
        sizes.extend_from_slice(&COMMERCE_SIZES);
    }
    sizes
}

/// Only these sources are resized locally.
pub fn can_generate(format: ImageFormat) -> bool {
    matches!(format, ImageFormat::Jpeg | ImageFormat::Png)
}

/// Output dimensions for `size`, or `None` when the source is not larger than the target.
pub fn target_dimensions(source_width: u32, source_height: u32, size: &CriticalSize) -> Option<(u32, u32)> {
    if source_width == 0 || source_height == 0 {
        return None;
    }

    if size.crop {
        let width = if size.width == 0 { source_width } else { size.width.min(source_width) };
        let height = if size.height == 0 { source_height } else { size.height.min(source_height) };
        return if (width, height) == (source_width, source_height) {
            None
        } else {
            Some((width, height))
        };
    }

    let mut ratio = f64::INFINITY;
    if size.width > 0 {
        ratio = ratio.min(size.width as f64 / source_width as f64);
    }
    if size.height > 0 {
        ratio = ratio.min(size.height as f64 / source_height as f64);
    }
    if !ratio.is_finite() || ratio >= 1.0 {
        return None;
    }

    let width = ((source_width as f64 * ratio).round() as u32).max(1);
    let height = ((source_height as f64 * ratio).round() as u32).max(1);
    Some((width, height))
}

/// `photo.jpg` at 300x200 -> `photo-300x200.jpg`
pub fn sized_file_name(primary_name: &str, width: u32, height: u32) -> String {
    match primary_name.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => format!("{}-{}x{}.{}", stem, width, height, ext),
        _ => format!("{}-{}x{}", primary_name, width, height),
    }
}

/// A generated size, ready to be written next to the primary file.
#[derive(Debug, Clone)]
pub struct GeneratedSize {
    pub size: CriticalSize,
    pub file_name: String,
    pub width: u32,
    pub height: u32,
    pub bytes: Vec<u8>,
}

/// Generates `sizes` from the primary image bytes. Sizes the source is too
/// small for are skipped.
pub async fn generate_sizes(
    primary_name: String,
    data: Vec<u8>,
    format: ImageFormat,
    sizes: Vec<CriticalSize>,
) -> DomainResult<Vec<GeneratedSize>> {
    if !can_generate(format) || sizes.is_empty() {
        return Ok(Vec::new());
    }

    task::spawn_blocking(move || -> DomainResult<Vec<GeneratedSize>> {
        let img = image::load_from_memory(&data)
            .map_err(|e| DomainError::Image(format!("Failed to load image: {}", e)))?;
        let (source_width, source_height) = img.dimensions();

        let mut generated = Vec::new();
        for size in sizes {
            let Some((width, height)) = target_dimensions(source_width, source_height, &size) else {
                continue;
            };
            let resized = if size.crop {
                img.resize_to_fill(width, height, FilterType::Lanczos3)
            } else {
                img.resize_exact(width, height, FilterType::Lanczos3)
            };
            let bytes = encode(&resized, format)?;
            generated.push(GeneratedSize {
                size,
                file_name: sized_file_name(&primary_name, width, height),
                width,
                height,
                bytes,
            });
        }
        Ok(generated)
    })
    .await
    .map_err(|e| DomainError::Internal(format!("Task join error: {}", e)))?
}

fn encode(img: &DynamicImage, format: ImageFormat) -> DomainResult<Vec<u8>> {
    let mut output = Vec::new();
    match format {
        ImageFormat::Jpeg => {
            let rgb = img.to_rgb8();
            let mut encoder = image::codecs::jpeg::JpegEncoder::new_with_quality(&mut output, JPEG_QUALITY);
            encoder
                .encode(&rgb, rgb.width(), rgb.height(), image::ColorType::Rgb8)
                .map_err(|e| DomainError::Image(format!("JPEG encoding error: {}", e)))?;
        }
        ImageFormat::Png => {
            let rgba = img.to_rgba8();
            let encoder = image::codecs::png::PngEncoder::new(&mut output);
            encoder
                .write_image(&rgba, rgba.width(), rgba.height(), image::ColorType::Rgba8)
                .map_err(|e| DomainError::Image(format!("PNG encoding error: {}", e)))?;
        }
        other => {
            return Err(DomainError::Image(format!("Cannot generate sizes for {}", other.name())));
        }
    }
    Ok(output)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn png(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::new_rgba8(width, height);
        let mut out = std::io::Cursor::new(Vec::new());
        img.write_to(&mut out, image::ImageOutputFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_target_dimensions() {
        let thumb = CORE_SIZES[0];
        assert_eq!(target_dimensions(1200, 800, &thumb), Some((150, 150)));
        assert_eq!(target_dimensions(100, 80, &thumb), None);
        assert_eq!(target_dimensions(100, 400, &thumb), Some((100, 150)));

        let medium = CORE_SIZES[1];
        assert_eq!(target_dimensions(1200, 800, &medium), Some((300, 200)));
        assert_eq!(target_dimensions(300, 200, &medium), None);

        let medium_large = CORE_SIZES[2];
        assert_eq!(target_dimensions(1536, 1000, &medium_large), Some((768, 500)));
        assert_eq!(target_dimensions(700, 5000, &medium_large), None);
    }

    #[test]
    fn test_sized_file_name() {
        assert_eq!(sized_file_name("photo.jpg", 300, 200), "photo-300x200.jpg");
        assert_eq!(sized_file_name("a.b.png", 150, 150), "a.b-150x150.png");
    }

    #[test]
    fn test_commerce_sizes_are_opt_in() {
        assert_eq!(critical_sizes(false).len(), 4);
        assert!(critical_sizes(true).iter().any(|s| s.name == "woocommerce_single"));
    }

    #[tokio::test]
    async fn test_generate_skips_sizes_larger_than_source() {
        let generated = generate_sizes("p.png".into(), png(400, 200), ImageFormat::Png, critical_sizes(false))
            .await
            .unwrap();
        let names: Vec<_> = generated.iter().map(|g| g.file_name.as_str()).collect();
        assert_eq!(names, vec!["p-150x150.png", "p-300x150.png"]);
        let thumb = image::load_from_memory(&generated[0].bytes).unwrap();
        assert_eq!(thumb.dimensions(), (150, 150));
    }

    #[tokio::test]
    async fn test_webp_sources_are_not_generated() {
        let generated = generate_sizes("p.webp".into(), vec![0u8; 10], ImageFormat::Webp, critical_sizes(true))
            .await
            .unwrap();
        assert!(generated.is_empty());
    }
}
