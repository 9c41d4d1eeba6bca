//! Decoding and sanity checks for image payloads returned by the optimization API.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use once_cell::sync::Lazy;
use regex::Regex;

use crate::domains::core::media_types::ImageFormat;
use crate::errors::{DomainError, DomainResult};

static DATA_URL_PREFIX: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"(?i)^data:image/[a-z0-9.+-]+;base64,").expect("static regex")
});

static BASE64_BODY: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"^[A-Za-z0-9/\r\n+]*={0,2}$").expect("static regex")
});

const MIN_IMAGE_BYTES: usize = 50;
const MIN_ISOBMFF_BYTES: usize = 20;
const PNG_SIGNATURE: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1A, b'\n'];
const ISOBMFF_BRANDS: [&[u8]; 4] = [b"ftypavif", b"ftypavis", b"ftypheic", b"ftypheix"];

/// Decodes a base64 payload, with or without a `data:image/...;base64,` prefix.
pub fn decode_image_payload(payload: &str) -> DomainResult<Vec<u8>> {
    let body = match DATA_URL_PREFIX.find(payload) {
        Some(prefix) => &payload[prefix.end()..],
        None => payload,
    }
    .trim();

    if body.is_empty() {
        return Err(DomainError::Image("Empty base64 payload".to_string()));
    }
    if !BASE64_BODY.is_match(body) {
        return Err(DomainError::Image("Invalid base64 format".to_string()));
    }

    let compact: String = body.chars().filter(|c| !c.is_ascii_whitespace()).collect();
    let bytes = STANDARD
        .decode(compact.as_bytes())
        .map_err(|e| DomainError::Image(format!("Base64 decoding failed: {}", e)))?;

    if bytes.is_empty() {
        return Err(DomainError::Image("Base64 decoding produced no data".to_string()));
    }
    Ok(bytes)
}

/// Format-specific minimum size and signature checks.
///
/// AVIF/HEIF payloads can be legitimately tiny and carry several brands, so
/// they only produce warnings.
pub fn validate_image_bytes(bytes: &[u8], format: ImageFormat) -> DomainResult<()> {
    match format {
        ImageFormat::Avif | ImageFormat::Heif | ImageFormat::Heic => {
            let has_brand = bytes.len() >= 12 && ISOBMFF_BRANDS.contains(&&bytes[4..12]);
            if !has_brand {
                log::warn!("{} payload lacks a known ftyp brand, saving anyway", format.name());
            }
            if bytes.len() < MIN_ISOBMFF_BYTES {
                log::warn!("{} payload is very small ({} bytes), saving anyway", format.name(), bytes.len());
            }
            return Ok(());
        }
        _ => {}
    }

    if bytes.len() < MIN_IMAGE_BYTES {
        return Err(DomainError::Image(format!("Image data too small ({} bytes)", bytes.len())));
    }

    match format {
        ImageFormat::Jpeg if !bytes.starts_with(&[0xFF, 0xD8]) => {
            Err(DomainError::Image("Invalid JPEG data (missing SOI marker)".to_string()))
        }
        ImageFormat::Png if !bytes.starts_with(&PNG_SIGNATURE) => {
            Err(DomainError::Image("Invalid PNG data (incorrect signature)".to_string()))
        }
        ImageFormat::Webp if !(bytes.starts_with(b"RIFF") && &bytes[8..12] == b"WEBP") => {
            Err(DomainError::Image("Invalid WebP data (missing RIFF/WEBP markers)".to_string()))
        }
        _ => Ok(()),
    }
}
