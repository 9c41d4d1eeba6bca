//! HTTP client for the remote optimization API.
//!
//! The API has shipped several response shapes over time. Every shape is
//! normalized by [`parse_optimize_response`] into one list of per-image
//! results, index-aligned with the request. Callers never see the raw shapes.

use async_trait::async_trait;
use log::{debug, error, info, warn};
use reqwest::Client;
use serde_json::Value;
use std::time::Duration;

use crate::config::OffloadConfig;
use crate::errors::{ServiceError, ServiceResult};
use super::types::{AccountStatus, OptimizeRequest, OptimizeResult};

pub const OPTIMIZE_PATH: &str = "/v1/images/wp/optimize";
pub const ACCOUNT_STATUS_PATH: &str = "/v1/account/status";
pub const API_KEY_HEADER: &str = "x-api-key";

const STATUS_TIMEOUT: Duration = Duration::from_secs(30);

#[async_trait]
pub trait OptimizationApi: Send + Sync {
    /// Sends one batch. Any transport or shape problem fails the whole batch.
    async fn optimize(&self, api_key: &str, request: &OptimizeRequest) -> ServiceResult<Vec<OptimizeResult>>;

    async fn account_status(&self, api_key: &str) -> ServiceResult<AccountStatus>;
}

pub struct HttpOptimizationApi {
    client: Client,
    base_url: String,
    timeout: Duration,
}

impl HttpOptimizationApi {
    pub fn new(base_url: &str, timeout: Duration) -> Self {
        let client = Client::builder()
            .timeout(timeout)
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            timeout,
        }
    }

    pub fn from_config(config: &OffloadConfig) -> Self {
        Self::new(config.optimization_region.base_url(), config.optimization_timeout)
    }
}

#[async_trait]
impl OptimizationApi for HttpOptimizationApi {
    async fn optimize(&self, api_key: &str, request: &OptimizeRequest) -> ServiceResult<Vec<OptimizeResult>> {
        let payload_bytes: usize = request.images.iter().map(|image| image.image_data.len()).sum();
        info!(
            "Sending {} image(s) for optimization ({:.1} KB payload)",
            request.images.len(),
            payload_bytes as f64 / 1024.0
        );

        let url = format!("{}{}", self.base_url, OPTIMIZE_PATH);
        let response = self.client.post(&url)
            .header(API_KEY_HEADER, api_key)
            .timeout(self.timeout)
            .json(request)
            .send()
            .await
            .map_err(|e| {
                error!("Optimization request failed: {}", e);
                ServiceError::from(e)
            })?;

        let status = response.status().as_u16();
        let body = response.text().await.map_err(ServiceError::from)?;
        debug!("Optimization API responded {} ({} bytes)", status, body.len());

        parse_optimize_response(status, &body)
    }

    async fn account_status(&self, api_key: &str) -> ServiceResult<AccountStatus> {
        let url = format!("{}{}", self.base_url, ACCOUNT_STATUS_PATH);
        let response = self.client.get(&url)
            .header(API_KEY_HEADER, api_key)
            .timeout(STATUS_TIMEOUT)
            .send()
            .await
            .map_err(ServiceError::from)?;

        let status = response.status();
        if status.is_success() {
            let account = response.json::<AccountStatus>()
                .await
                .map_err(|e| ServiceError::InvalidResponse(format!("Failed to parse account status: {}", e)))?;
            return Ok(account);
        }

        let error_text = response.text().await
            .unwrap_or_else(|_| "Unable to get error details".to_string());
        Err(status_error(status.as_u16(), &error_text))
    }
}

fn status_error(status: u16, body: &str) -> ServiceError {
    match status {
        401 | 403 => ServiceError::Authentication("Invalid API key".to_string()),
        402 => ServiceError::InsufficientCredits("Account has no remaining credits".to_string()),
        429 => ServiceError::RateLimitExceeded,
        _ => {
            let message = serde_json::from_str::<Value>(body)
                .ok()
                .and_then(|v| v.get("message").and_then(Value::as_str).map(str::to_string))
                .unwrap_or_else(|| body.chars().take(200).collect());
            ServiceError::ExternalService(format!("Server returned error {}: {}", status, message))
        }
    }
}

/// Normalizes an optimize response into per-image results.
///
/// Failure statuses map to their error kinds before the body is inspected. A
/// successful status then requires a complete JSON document whose `results` is
/// an array (kept as-is) or a single object (wrapped). A body without `results`
/// but with `processed: 0` yields no results.
pub fn parse_optimize_response(status: u16, body: &str) -> ServiceResult<Vec<OptimizeResult>> {
    if matches!(status, 401 | 402 | 403 | 429) {
        let err = status_error(status, body);
        error!("Optimization API error: {}", err);
        return Err(err);
    }

    let trimmed = body.trim();
    if trimmed.is_empty() {
        return Err(ServiceError::InvalidResponse("API returned an empty response body".to_string()));
    }
    if !(trimmed.ends_with('}') || trimmed.ends_with(']')) {
        let tail: String = trimmed.chars().rev().take(100).collect::<Vec<_>>().into_iter().rev().collect();
        warn!("Optimization response appears truncated, ends with: ...{}", tail);
        return Err(ServiceError::InvalidResponse("API response appears to be truncated".to_string()));
    }
    if trimmed.matches('{').count() != trimmed.matches('}').count() {
        return Err(ServiceError::InvalidResponse("API response has unbalanced braces".to_string()));
    }

    let json: Value = serde_json::from_str(trimmed)
        .map_err(|e| ServiceError::InvalidResponse(format!("API returned invalid JSON: {}", e)))?;

    if !(200..300).contains(&status) {
        let err = status_error(status, trimmed);
        error!("Optimization API error: {}", err);
        return Err(err);
    }

    if json.get("success").and_then(Value::as_bool) == Some(false) {
        let message = json
            .get("message")
            .or_else(|| json.get("error"))
            .and_then(Value::as_str)
            .unwrap_or("success: false");
        return Err(ServiceError::ExternalService(format!("API reported failure: {}", message)));
    }

    if let Some(credits) = json.get("creditsUsed") {
        info!(
            "API credits used: {}, images processed: {}",
            credits,
            json.get("imagesProcessed").map(|v| v.to_string()).unwrap_or_else(|| "N/A".to_string())
        );
    }

    match json.get("results") {
        Some(Value::Array(items)) => {
            if items.is_empty() {
                warn!("Optimization API returned an empty results array");
            }
            Ok(items.iter().map(OptimizeResult::from_value).collect())
        }
        Some(single @ Value::Object(_)) => {
            debug!("Optimization API returned a single result object");
            Ok(vec![OptimizeResult::from_value(single)])
        }
        Some(other) => Err(ServiceError::InvalidResponse(format!("Unexpected results field: {}", other))),
        None if json.get("processed").and_then(Value::as_i64) == Some(0) => {
            warn!("Optimization API processed 0 images");
            Ok(Vec::new())
        }
        None => Err(ServiceError::InvalidResponse(
            "API response is missing the results field".to_string(),
        )),
    }
}

/// Scripted optimization API for tests.
#[cfg(test)]
pub struct MockOptimizationApi {
    responses: std::sync::Mutex<std::collections::VecDeque<ServiceResult<Vec<OptimizeResult>>>>,
    pub requests: std::sync::Mutex<Vec<OptimizeRequest>>,
}

#[cfg(test)]
impl MockOptimizationApi {
    pub fn new() -> Self {
        Self {
            responses: std::sync::Mutex::new(std::collections::VecDeque::new()),
            requests: std::sync::Mutex::new(Vec::new()),
        }
    }

    pub fn push_response(&self, response: ServiceResult<Vec<OptimizeResult>>) {
        self.responses.lock().unwrap().push_back(response);
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl OptimizationApi for MockOptimizationApi {
    async fn optimize(&self, _api_key: &str, request: &OptimizeRequest) -> ServiceResult<Vec<OptimizeResult>> {
        self.requests.lock().unwrap().push(request.clone());
        self.responses
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok(Vec::new()))
    }

    async fn account_status(&self, _api_key: &str) -> ServiceResult<AccountStatus> {
        Ok(AccountStatus { success: true, credits: Some(100), plan: None, message: None })
    }
}
