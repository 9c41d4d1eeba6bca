//! Image formats handled by the offload pipeline.

use std::path::Path;

/// Image formats known to the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ImageFormat {
    Jpeg,
    Png,
    Gif,
    Webp,
    Avif,
    Heic,
    Heif,
    Tiff,
    Svg,
    Bmp,
}

impl ImageFormat {
    /// Parses a mime type such as `image/jpeg` or `image/svg+xml`.
    pub fn from_mime(mime_type: &str) -> Option<Self> {
        let parsed: mime::Mime = mime_type.trim().parse().ok()?;
        if parsed.type_() != mime::IMAGE {
            return None;
        }
        let subtype = parsed.subtype().as_str().to_lowercase();
        let suffix = parsed.suffix().map(|s| s.as_str().to_lowercase());
        match (subtype.as_str(), suffix.as_deref()) {
            ("jpeg", _) | ("jpg", _) | ("pjpeg", _) => Some(ImageFormat::Jpeg),
            ("png", _) => Some(ImageFormat::Png),
            ("gif", _) => Some(ImageFormat::Gif),
            ("webp", _) => Some(ImageFormat::Webp),
            ("avif", _) => Some(ImageFormat::Avif),
            ("heic", _) => Some(ImageFormat::Heic),
            ("heif", _) => Some(ImageFormat::Heif),
            ("tiff", _) => Some(ImageFormat::Tiff),
            ("svg", Some("xml")) | ("svg", None) => Some(ImageFormat::Svg),
            ("bmp", _) => Some(ImageFormat::Bmp),
            _ => None,
        }
    }

    pub fn from_extension(extension: &str) -> Option<Self> {
        match extension.trim_start_matches('.').to_lowercase().as_str() {
            "jpg" | "jpeg" | "jpe" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "gif" => Some(ImageFormat::Gif),
            "webp" => Some(ImageFormat::Webp),
            "avif" => Some(ImageFormat::Avif),
            "heic" => Some(ImageFormat::Heic),
            "heif" => Some(ImageFormat::Heif),
            "tif" | "tiff" => Some(ImageFormat::Tiff),
            "svg" => Some(ImageFormat::Svg),
            "bmp" => Some(ImageFormat::Bmp),
            _ => None,
        }
    }

    /// Parses a `targetFormat` returned by the optimization API.
    /// Only formats the API may legitimately convert to are accepted.
    pub fn from_target(name: &str) -> Option<Self> {
        match name.trim().to_lowercase().as_str() {
            "jpg" | "jpeg" => Some(ImageFormat::Jpeg),
            "png" => Some(ImageFormat::Png),
            "gif" => Some(ImageFormat::Gif),
            "webp" => Some(ImageFormat::Webp),
            "avif" => Some(ImageFormat::Avif),
            "heif" => Some(ImageFormat::Heif),
            _ => None,
        }
    }

    pub fn mime_type(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "image/jpeg",
            ImageFormat::Png => "image/png",
            ImageFormat::Gif => "image/gif",
            ImageFormat::Webp => "image/webp",
            ImageFormat::Avif => "image/avif",
            ImageFormat::Heic => "image/heic",
            ImageFormat::Heif => "image/heif",
            ImageFormat::Tiff => "image/tiff",
            ImageFormat::Svg => "image/svg+xml",
            ImageFormat::Bmp => "image/bmp",
        }
    }

    pub fn extension(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpg",
            ImageFormat::Png => "png",
            ImageFormat::Gif => "gif",
            ImageFormat::Webp => "webp",
            ImageFormat::Avif => "avif",
            ImageFormat::Heic => "heic",
            ImageFormat::Heif => "heif",
            ImageFormat::Tiff => "tiff",
            ImageFormat::Svg => "svg",
            ImageFormat::Bmp => "bmp",
        }
    }

    /// Extension and mime type written for an optimized file of this format.
    /// HEIF output is stored in an AVIF container.
    pub fn output_extension_and_mime(&self) -> (&'static str, &'static str) {
        match self {
            ImageFormat::Heif => ("avif", "image/avif"),
            other => (other.extension(), other.mime_type()),
        }
    }

    /// Lowercase name used in optimization stats.
    pub fn name(&self) -> &'static str {
        match self {
            ImageFormat::Jpeg => "jpeg",
            other => other.extension(),
        }
    }
}

/// Mime type for a file, by extension first and by content sniffing second.
pub fn guess_mime_type(path: &Path) -> Option<String> {
    if let Some(format) = path
        .extension()
        .and_then(|ext| ext.to_str())
        .and_then(ImageFormat::from_extension)
    {
        return Some(format.mime_type().to_string());
    }

    match infer::get_from_path(path) {
        Ok(Some(kind)) => Some(kind.mime_type().to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_mime_handles_aliases() {
        assert_eq!(ImageFormat::from_mime("image/jpg"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_mime("IMAGE/JPEG"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_mime("image/svg+xml"), Some(ImageFormat::Svg));
        assert_eq!(ImageFormat::from_mime("application/pdf"), None);
        assert_eq!(ImageFormat::from_mime("not a mime"), None);
    }

    #[test]
    fn test_target_formats() {
        assert_eq!(ImageFormat::from_target("JPG"), Some(ImageFormat::Jpeg));
        assert_eq!(ImageFormat::from_target("heif"), Some(ImageFormat::Heif));
        assert_eq!(ImageFormat::from_target("tiff"), None);
        assert_eq!(ImageFormat::Heif.output_extension_and_mime(), ("avif", "image/avif"));
        assert_eq!(ImageFormat::Jpeg.output_extension_and_mime(), ("jpg", "image/jpeg"));
    }

    #[test]
    fn test_guess_mime_type_by_extension() {
        assert_eq!(guess_mime_type(Path::new("a/b/photo.JPG")).as_deref(), Some("image/jpeg"));
        assert_eq!(guess_mime_type(Path::new("icon.svg")).as_deref(), Some("image/svg+xml"));
    }
}
