//! Wire types for the optimization API and their normalized form.

use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

use crate::domains::asset::types::OptimizationStats;

/// One image in an optimize request.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ImagePayload {
    pub file: String,
    /// `data:<mime>;base64,<bytes>`
    pub image_data: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizeRequest {
    pub images: Vec<ImagePayload>,
    pub max_size_kb: u64,
    #[serde(rename = "supportsAVIF")]
    pub supports_avif: bool,
    #[serde(rename = "supportsHEIF")]
    pub supports_heif: bool,
}

/// `data` of a successful per-image result. Only `base64` is required; the
/// stats are informational and any unreadable value is dropped.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptimizedData {
    pub base64: String,
    #[serde(default, deserialize_with = "lenient_string")]
    pub target_format: Option<String>,
    #[serde(default, deserialize_with = "lenient_string")]
    pub original_format: Option<String>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub original_size: Option<u64>,
    #[serde(default, deserialize_with = "lenient_u64")]
    pub compressed_size: Option<u64>,
    #[serde(default, deserialize_with = "lenient_f64")]
    pub compression_ratio: Option<f64>,
    #[serde(default, deserialize_with = "lenient_u32")]
    pub optimized_quality: Option<u32>,
}

/// Numbers may arrive as floats, integers or numeric strings.
fn number_of(value: Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }
    .filter(|n| n.is_finite())
}

fn lenient_f64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<f64>, D::Error> {
    Ok(Option::<Value>::deserialize(deserializer)?.and_then(number_of))
}

fn lenient_u64<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u64>, D::Error> {
    Ok(lenient_f64(deserializer)?
        .filter(|n| *n >= 0.0)
        .map(|n| n.round() as u64))
}

fn lenient_u32<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<u32>, D::Error> {
    Ok(lenient_u64(deserializer)?.and_then(|n| u32::try_from(n).ok()))
}

fn lenient_string<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Option<String>, D::Error> {
    Ok(match Option::<Value>::deserialize(deserializer)? {
        Some(Value::String(s)) => Some(s),
        _ => None,
    })
}

impl OptimizedData {
    pub fn stats(&self, fallback_original: u64, written: u64) -> OptimizationStats {
        let original_size = self.original_size.unwrap_or(fallback_original);
        let compressed_size = self.compressed_size.unwrap_or(written);
        let compression_ratio = self.compression_ratio.unwrap_or_else(|| {
            if original_size == 0 {
                0.0
            } else {
                1.0 - compressed_size as f64 / original_size as f64
            }
        });
        OptimizationStats {
            original_format: self.original_format.clone(),
            target_format: self.target_format.clone(),
            original_size,
            compressed_size,
            compression_ratio,
            optimized_quality: self.optimized_quality,
        }
    }
}

/// Normalized per-image outcome, index-aligned with the request's images.
#[derive(Debug, Clone, PartialEq)]
pub enum OptimizeResult {
    Optimized(OptimizedData),
    /// Already optimal; mark as optimized without touching the bytes.
    Skipped,
    Failed(String),
}

impl OptimizeResult {
    /// Normalizes one raw result object.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            return OptimizeResult::Failed(format!("unexpected result entry: {}", value));
        };

        let success = obj.get("success").and_then(Value::as_bool).unwrap_or(false);
        if success {
            if let Some(data) = obj.get("data") {
                if data.get("base64").and_then(Value::as_str).is_some() {
                    return match serde_json::from_value::<OptimizedData>(data.clone()) {
                        Ok(data) => OptimizeResult::Optimized(data),
                        Err(e) => OptimizeResult::Failed(format!("malformed result data: {}", e)),
                    };
                }
            }
        }

        if obj.get("skipped").and_then(Value::as_bool).unwrap_or(false) {
            return OptimizeResult::Skipped;
        }

        let reason = obj
            .get("error")
            .map(|e| match e {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
            .unwrap_or_else(|| "Unknown reason".to_string());
        OptimizeResult::Failed(reason)
    }
}

/// Response of the account status check.
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountStatus {
    #[serde(default)]
    pub success: bool,
    #[serde(default)]
    pub credits: Option<i64>,
    #[serde(default)]
    pub plan: Option<String>,
    #[serde(default)]
    pub message: Option<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_request_field_names() {
        let request = OptimizeRequest {
            images: vec![ImagePayload { file: "a.png".into(), image_data: "data:image/png;base64,AA==".into() }],
            max_size_kb: 150,
            supports_avif: true,
            supports_heif: true,
        };
        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["maxSizeKb"], 150);
        assert_eq!(value["supportsAVIF"], true);
        assert_eq!(value["supportsHEIF"], true);
        assert_eq!(value["images"][0]["imageData"], "data:image/png;base64,AA==");
    }

    #[test]
    fn test_result_normalization() {
        let optimized = OptimizeResult::from_value(&json!({
            "success": true,
            "data": {"base64": "AAAA", "targetFormat": "webp", "originalSize": 2000, "compressedSize": 500}
        }));
        match optimized {
            OptimizeResult::Optimized(data) => {
                assert_eq!(data.target_format.as_deref(), Some("webp"));
                let stats = data.stats(0, 0);
                assert_eq!(stats.original_size, 2000);
                assert!((stats.compression_ratio - 0.75).abs() < 1e-9);
            }
            other => panic!("unexpected {:?}", other),
        }

        assert_eq!(OptimizeResult::from_value(&json!({"skipped": true})), OptimizeResult::Skipped);
        assert_eq!(
            OptimizeResult::from_value(&json!({"error": "too large"})),
            OptimizeResult::Failed("too large".into())
        );
        // success without data is not a success
        assert!(matches!(OptimizeResult::from_value(&json!({"success": true})), OptimizeResult::Failed(_)));
        assert!(matches!(OptimizeResult::from_value(&json!("nope")), OptimizeResult::Failed(_)));
    }

    #[test]
    fn test_odd_stats_do_not_discard_image() {
        let result = OptimizeResult::from_value(&json!({
            "success": true,
            "data": {
                "base64": "AAAA",
                "optimizedQuality": 82.5,
                "compressionRatio": "0.4",
                "originalSize": "2048",
                "compressedSize": null,
                "targetFormat": 7
            }
        }));
        match result {
            OptimizeResult::Optimized(data) => {
                assert_eq!(data.base64, "AAAA");
                assert_eq!(data.optimized_quality, Some(83));
                assert_eq!(data.compression_ratio, Some(0.4));
                assert_eq!(data.original_size, Some(2048));
                assert_eq!(data.compressed_size, None);
                assert_eq!(data.target_format, None);
            }
            other => panic!("unexpected {:?}", other),
        }

        // base64 of the wrong type is still a failure
        assert!(matches!(
            OptimizeResult::from_value(&json!({"success": true, "data": {"base64": 12}})),
            OptimizeResult::Failed(_)
        ));
    }
}
