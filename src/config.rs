//! Runtime configuration loaded from the environment.
//!
//! Every setting has a default and can be overridden by an `OFFLOAD_*`
//! variable, optionally supplied through a `.env` file.

use std::env;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::errors::{ServiceError, ServiceResult};

pub const DEFAULT_MAX_FILE_SIZE_KB: u64 = 150;
/// Files at or above this size are never sent to the optimization API.
pub const OPTIMIZATION_CEILING_KB: u64 = 10 * 1024;
pub const DEFAULT_STORAGE_ENDPOINT: &str = "https://storage.bunnycdn.com";
const DEFAULT_REMOTE_DOMAIN: &str = "b-cdn.net";
const REMOTE_HOST_MARKERS: [&str; 2] = [".b-cdn.net", "bunnycdn.com"];

/// Region of the optimization API.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApiRegion {
    Us,
    Eu,
}

impl ApiRegion {
    pub fn from_setting(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "eu" | "me" => ApiRegion::Eu,
            _ => ApiRegion::Us,
        }
    }

    pub fn base_url(&self) -> &'static str {
        match self {
            ApiRegion::Us => "https://api-us.nofb.nexwinds.com",
            ApiRegion::Eu => "https://api-eu.nofb.nexwinds.com",
        }
    }
}

/// Rewrites an absolute path prefix recorded in another environment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathMapping {
    pub from: String,
    pub to: String,
}

/// Credentials needed to talk to remote storage.
#[derive(Debug, Clone, Copy)]
pub struct StorageCredentials<'a> {
    pub zone: &'a str,
    pub access_key: &'a str,
}

#[derive(Debug, Clone)]
pub struct OffloadConfig {
    pub uploads_dir: PathBuf,
    pub uploads_base_url: String,
    pub max_file_size_kb: u64,

    pub optimization_api_key: Option<String>,
    pub optimization_region: ApiRegion,
    pub optimization_batch_size: usize,
    pub optimization_timeout: Duration,

    pub storage_api_key: Option<String>,
    pub storage_zone: Option<String>,
    pub storage_endpoint: String,
    pub custom_hostname: Option<String>,
    pub migration_batch_size: usize,

    pub auto_optimize: bool,
    pub auto_migrate: bool,
    pub file_versioning: bool,
    /// Also generate and upload the commerce plugin's image sizes.
    pub commerce_sizes: bool,

    pub upload_delay: Duration,
    pub max_retries: u32,
    pub large_file_threshold: u64,
    pub primary_upload_timeout: Duration,
    pub variant_upload_timeout: Duration,
    pub delete_timeout: Duration,

    pub resolver_cache_ttl: Duration,
    pub stats_cache_ttl: Duration,
    pub scan_chunk_size: usize,
    pub worker_interval: Duration,
    pub path_mappings: Vec<PathMapping>,
}

impl Default for OffloadConfig {
    fn default() -> Self {
        Self {
            uploads_dir: PathBuf::from("./uploads"),
            uploads_base_url: "http://localhost/uploads".to_string(),
            max_file_size_kb: DEFAULT_MAX_FILE_SIZE_KB,
            optimization_api_key: None,
            optimization_region: ApiRegion::Us,
            optimization_batch_size: 5,
            optimization_timeout: Duration::from_secs(120),
            storage_api_key: None,
            storage_zone: None,
            storage_endpoint: DEFAULT_STORAGE_ENDPOINT.to_string(),
            custom_hostname: None,
            migration_batch_size: 3,
            auto_optimize: false,
            auto_migrate: false,
            file_versioning: false,
            commerce_sizes: false,
            upload_delay: Duration::from_millis(200),
            max_retries: 3,
            large_file_threshold: 5 * 1024 * 1024,
            primary_upload_timeout: Duration::from_secs(300),
            variant_upload_timeout: Duration::from_secs(60),
            delete_timeout: Duration::from_secs(30),
            resolver_cache_ttl: Duration::from_secs(60 * 60),
            stats_cache_ttl: Duration::from_secs(5 * 60),
            scan_chunk_size: 100,
            worker_interval: Duration::from_secs(5 * 60),
            path_mappings: Vec::new(),
        }
    }
}

fn env_string(key: &str) -> Option<String> {
    env::var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

fn env_parse<T: FromStr>(key: &str, default: T) -> T {
    env_string(key).and_then(|v| v.parse::<T>().ok()).unwrap_or(default)
}

fn env_bool(key: &str, default: bool) -> bool {
    match env_string(key) {
        Some(v) => matches!(v.to_lowercase().as_str(), "1" | "true" | "yes" | "on"),
        None => default,
    }
}

fn env_millis(key: &str, default: Duration) -> Duration {
    Duration::from_millis(env_parse(key, default.as_millis() as u64))
}

fn env_secs(key: &str, default: Duration) -> Duration {
    Duration::from_secs(env_parse(key, default.as_secs()))
}

/// Parses `from=>to;from=>to` into path mappings, skipping malformed pairs.
pub fn parse_path_mappings(raw: &str) -> Vec<PathMapping> {
    raw.split(';')
        .filter_map(|pair| {
            let (from, to) = pair.split_once("=>")?;
            let from = from.trim();
            if from.is_empty() {
                return None;
            }
            Some(PathMapping {
                from: from.to_string(),
                to: to.trim().to_string(),
            })
        })
        .collect()
}

impl OffloadConfig {
    /// Loads configuration from the process environment (and `.env` if present).
    pub fn from_env() -> Self {
        dotenv::dotenv().ok();
        let d = Self::default();

        Self {
            uploads_dir: env_string("OFFLOAD_UPLOADS_DIR").map(PathBuf::from).unwrap_or(d.uploads_dir),
            uploads_base_url: env_string("OFFLOAD_UPLOADS_BASE_URL")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(d.uploads_base_url),
            max_file_size_kb: env_parse("OFFLOAD_MAX_FILE_SIZE_KB", d.max_file_size_kb),
            optimization_api_key: env_string("OFFLOAD_OPTIMIZATION_API_KEY"),
            optimization_region: env_string("OFFLOAD_OPTIMIZATION_REGION")
                .map(|r| ApiRegion::from_setting(&r))
                .unwrap_or(d.optimization_region),
            optimization_batch_size: env_parse("OFFLOAD_OPTIMIZATION_BATCH_SIZE", d.optimization_batch_size).clamp(1, 5),
            optimization_timeout: env_secs("OFFLOAD_OPTIMIZATION_TIMEOUT_SECS", d.optimization_timeout),
            storage_api_key: env_string("OFFLOAD_STORAGE_API_KEY"),
            storage_zone: env_string("OFFLOAD_STORAGE_ZONE"),
            storage_endpoint: env_string("OFFLOAD_STORAGE_ENDPOINT")
                .map(|u| u.trim_end_matches('/').to_string())
                .unwrap_or(d.storage_endpoint),
            custom_hostname: env_string("OFFLOAD_CUSTOM_HOSTNAME").map(|h| strip_scheme(&h)),
            migration_batch_size: env_parse("OFFLOAD_MIGRATION_BATCH_SIZE", d.migration_batch_size).max(1),
            auto_optimize: env_bool("OFFLOAD_AUTO_OPTIMIZE", d.auto_optimize),
            auto_migrate: env_bool("OFFLOAD_AUTO_MIGRATE", d.auto_migrate),
            file_versioning: env_bool("OFFLOAD_FILE_VERSIONING", d.file_versioning),
            commerce_sizes: env_bool("OFFLOAD_COMMERCE_SIZES", d.commerce_sizes),
            upload_delay: env_millis("OFFLOAD_UPLOAD_DELAY_MS", d.upload_delay),
            max_retries: env_parse("OFFLOAD_MAX_RETRIES", d.max_retries).max(1),
            large_file_threshold: env_parse("OFFLOAD_LARGE_FILE_THRESHOLD", d.large_file_threshold),
            primary_upload_timeout: env_secs("OFFLOAD_PRIMARY_UPLOAD_TIMEOUT_SECS", d.primary_upload_timeout),
            variant_upload_timeout: env_secs("OFFLOAD_VARIANT_UPLOAD_TIMEOUT_SECS", d.variant_upload_timeout),
            delete_timeout: env_secs("OFFLOAD_DELETE_TIMEOUT_SECS", d.delete_timeout),
            resolver_cache_ttl: env_secs("OFFLOAD_RESOLVER_CACHE_TTL_SECS", d.resolver_cache_ttl),
            stats_cache_ttl: env_secs("OFFLOAD_STATS_CACHE_TTL_SECS", d.stats_cache_ttl),
            scan_chunk_size: env_parse("OFFLOAD_SCAN_CHUNK_SIZE", d.scan_chunk_size).max(1),
            worker_interval: env_secs("OFFLOAD_WORKER_INTERVAL_SECS", d.worker_interval),
            path_mappings: env_string("OFFLOAD_PATH_MAPPINGS")
                .map(|raw| parse_path_mappings(&raw))
                .unwrap_or_default(),
        }
    }

    /// Returns the optimization API key, or a configuration error when unset.
    pub fn optimization_credentials(&self) -> ServiceResult<&str> {
        self.optimization_api_key
            .as_deref()
            .ok_or_else(|| ServiceError::Configuration("Optimization API key is not configured".to_string()))
    }

    pub fn storage_credentials(&self) -> ServiceResult<StorageCredentials<'_>> {
        match (self.storage_zone.as_deref(), self.storage_api_key.as_deref()) {
            (Some(zone), Some(access_key)) => Ok(StorageCredentials { zone, access_key }),
            (None, _) => Err(ServiceError::Configuration("Storage zone is not configured".to_string())),
            (_, None) => Err(ServiceError::Configuration("Storage API key is not configured".to_string())),
        }
    }

    /// Public base URL of remote storage, without a trailing slash.
    pub fn remote_base_url(&self) -> Option<String> {
        if let Some(host) = &self.custom_hostname {
            return Some(format!("https://{}", host));
        }
        self.storage_zone
            .as_ref()
            .map(|zone| format!("https://{}.{}", zone, DEFAULT_REMOTE_DOMAIN))
    }

    pub fn remote_url(&self, relative_path: &str) -> Option<String> {
        self.remote_base_url()
            .map(|base| format!("{}/{}", base, relative_path.trim_start_matches('/')))
    }

    pub fn local_url(&self, relative_path: &str) -> String {
        format!(
            "{}/{}",
            self.uploads_base_url.trim_end_matches('/'),
            relative_path.trim_start_matches('/')
        )
    }

    /// Whether a public URL already points at remote storage.
    pub fn is_remote_url(&self, url: &str) -> bool {
        if url.is_empty() {
            return false;
        }
        if let Some(host) = &self.custom_hostname {
            if url.contains(host.as_str()) {
                return true;
            }
        }
        REMOTE_HOST_MARKERS.iter().any(|marker| url.contains(marker))
    }
}

fn strip_scheme(host: &str) -> String {
    host.trim_start_matches("https://")
        .trim_start_matches("http://")
        .trim_end_matches('/')
        .to_string()
}
