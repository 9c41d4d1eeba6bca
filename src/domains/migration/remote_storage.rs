//! Client for the remote object storage zone.

use async_trait::async_trait;
use futures::stream;
use log::{debug, error, info, warn};
use reqwest::{Body, Client, StatusCode};
use std::path::PathBuf;
use std::time::Duration;
use tokio::io::AsyncReadExt;

use crate::config::OffloadConfig;
use crate::errors::{DomainError, ServiceError, ServiceResult};

pub const ACCESS_KEY_HEADER: &str = "AccessKey";

const STREAM_CHUNK_BYTES: usize = 256 * 1024;
const CONNECTION_TEST_TIMEOUT: Duration = Duration::from_secs(15);

/// What to send in an upload.
#[derive(Debug, Clone)]
pub enum UploadBody {
    Bytes(Vec<u8>),
    /// Streamed from disk in fixed-size chunks.
    Stream(PathBuf),
}

#[async_trait]
pub trait RemoteStorage: Send + Sync {
    /// PUTs one object. `remote_path` is relative to the zone.
    async fn upload(
        &self,
        remote_path: &str,
        body: UploadBody,
        content_type: &str,
        timeout: Duration,
    ) -> ServiceResult<()>;

    /// Deletes one object. A missing object counts as deleted.
    async fn delete(&self, remote_path: &str, timeout: Duration) -> ServiceResult<()>;

    async fn test_connection(&self) -> ServiceResult<()>;
}

pub struct BunnyStorageClient {
    client: Client,
    endpoint: String,
    zone: String,
    access_key: String,
}

impl BunnyStorageClient {
    pub fn new(endpoint: &str, zone: &str, access_key: &str) -> Self {
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(10))
            .build()
            .unwrap_or_default();

        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            zone: zone.trim_matches('/').to_string(),
            access_key: access_key.to_string(),
        }
    }

    /// Client for the configured zone. Missing credentials are not checked
    /// here; callers check `OffloadConfig::storage_credentials` before use.
    pub fn from_config(config: &OffloadConfig) -> Self {
        Self::new(
            &config.storage_endpoint,
            config.storage_zone.as_deref().unwrap_or_default(),
            config.storage_api_key.as_deref().unwrap_or_default(),
        )
    }

    fn object_url(&self, remote_path: &str) -> String {
        format!("{}/{}/{}", self.endpoint, self.zone, encode_remote_path(remote_path))
    }

    async fn streamed_body(path: &PathBuf) -> ServiceResult<Body> {
        let file = tokio::fs::File::open(path)
            .await
            .map_err(|e| ServiceError::Domain(DomainError::File(format!("Failed to open {}: {}", path.display(), e))))?;

        let chunks = stream::try_unfold(file, |mut file| async move {
            let mut buffer = vec![0u8; STREAM_CHUNK_BYTES];
            let read = file.read(&mut buffer).await?;
            if read == 0 {
                return Ok::<_, std::io::Error>(None);
            }
            buffer.truncate(read);
            Ok(Some((buffer, file)))
        });
        Ok(Body::wrap_stream(chunks))
    }
}

/// Percent-encodes each segment of a relative path, keeping the separators.
pub fn encode_remote_path(remote_path: &str) -> String {
    remote_path
        .trim_start_matches('/')
        .split('/')
        .map(|segment| urlencoding::encode(segment).into_owned())
        .collect::<Vec<_>>()
        .join("/")
}

#[async_trait]
impl RemoteStorage for BunnyStorageClient {
    async fn upload(
        &self,
        remote_path: &str,
        body: UploadBody,
        content_type: &str,
        timeout: Duration,
    ) -> ServiceResult<()> {
        let url = self.object_url(remote_path);
        let (body, mode) = match body {
            UploadBody::Bytes(bytes) => {
                debug!("Uploading {} ({} bytes)", remote_path, bytes.len());
                (Body::from(bytes), "buffered")
            }
            UploadBody::Stream(path) => {
                debug!("Streaming {} from {}", remote_path, path.display());
                (Self::streamed_body(&path).await?, "streamed")
            }
        };

        let response = self.client.put(&url)
            .header(ACCESS_KEY_HEADER, &self.access_key)
            .header(reqwest::header::CONTENT_TYPE, content_type)
            .timeout(timeout)
            .body(body)
            .send()
            .await
            .map_err(|e| {
                error!("Upload of {} failed: {}", remote_path, e);
                ServiceError::from(e)
            })?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::CREATED {
            info!("Uploaded {} ({}, status {})", remote_path, mode, status.as_u16());
            return Ok(());
        }

        let error_text = response.text().await
            .unwrap_or_else(|_| "Unable to get error details".to_string());
        warn!("Upload of {} rejected with {}: {}", remote_path, status, error_text);
        Err(match status {
            StatusCode::UNAUTHORIZED => ServiceError::Authentication("Storage access key is invalid".to_string()),
            _ => ServiceError::ExternalService(format!("Server returned error {}: {}", status, error_text)),
        })
    }

    async fn delete(&self, remote_path: &str, timeout: Duration) -> ServiceResult<()> {
        let url = self.object_url(remote_path);
        let response = self.client.delete(&url)
            .header(ACCESS_KEY_HEADER, &self.access_key)
            .timeout(timeout)
            .send()
            .await
            .map_err(ServiceError::from)?;

        let status = response.status();
        if status == StatusCode::OK || status == StatusCode::NOT_FOUND {
            debug!("Deleted remote object {} (status {})", remote_path, status.as_u16());
            return Ok(());
        }

        let error_text = response.text().await
            .unwrap_or_else(|_| "Unable to get error details".to_string());
        Err(ServiceError::ExternalService(format!("Server returned error {}: {}", status, error_text)))
    }

    async fn test_connection(&self) -> ServiceResult<()> {
        let url = format!("{}/{}/", self.endpoint, self.zone);
        let response = self.client.get(&url)
            .header(ACCESS_KEY_HEADER, &self.access_key)
            .timeout(CONNECTION_TEST_TIMEOUT)
            .send()
            .await
            .map_err(ServiceError::from)?;

        match response.status() {
            StatusCode::OK => Ok(()),
            StatusCode::UNAUTHORIZED => Err(ServiceError::Authentication("Storage access key is invalid".to_string())),
            StatusCode::NOT_FOUND => Err(ServiceError::Configuration(format!("Storage zone '{}' not found", self.zone))),
            other => Err(ServiceError::ExternalService(format!("Storage API returned unexpected status: {}", other))),
        }
    }
}

/// In-memory remote storage for tests.
#[cfg(test)]
#[derive(Default)]
pub struct MockRemoteStorage {
    objects: std::sync::Mutex<std::collections::BTreeMap<String, Vec<u8>>>,
    failing: std::sync::Mutex<std::collections::HashSet<String>>,
    pub deleted: std::sync::Mutex<Vec<String>>,
    pub upload_log: std::sync::Mutex<Vec<(String, bool)>>,
}

#[cfg(test)]
impl MockRemoteStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every upload of `remote_path` fail until cleared.
    pub fn fail_path(&self, remote_path: &str) {
        self.failing.lock().unwrap().insert(remote_path.to_string());
    }

    pub fn clear_failures(&self) {
        self.failing.lock().unwrap().clear();
    }

    pub fn contains(&self, remote_path: &str) -> bool {
        self.objects.lock().unwrap().contains_key(remote_path)
    }

    pub fn object(&self, remote_path: &str) -> Option<Vec<u8>> {
        self.objects.lock().unwrap().get(remote_path).cloned()
    }

    pub fn keys(&self) -> Vec<String> {
        self.objects.lock().unwrap().keys().cloned().collect()
    }

    pub fn upload_count(&self) -> usize {
        self.upload_log.lock().unwrap().len()
    }
}

#[cfg(test)]
#[async_trait]
impl RemoteStorage for MockRemoteStorage {
    async fn upload(
        &self,
        remote_path: &str,
        body: UploadBody,
        _content_type: &str,
        _timeout: Duration,
    ) -> ServiceResult<()> {
        let (bytes, streamed) = match body {
            UploadBody::Bytes(bytes) => (bytes, false),
            UploadBody::Stream(path) => (
                tokio::fs::read(&path)
                    .await
                    .map_err(|e| ServiceError::Domain(DomainError::File(e.to_string())))?,
                true,
            ),
        };
        self.upload_log.lock().unwrap().push((remote_path.to_string(), streamed));
        if self.failing.lock().unwrap().contains(remote_path) {
            return Err(ServiceError::ExternalService("Server returned error 500: mock failure".to_string()));
        }
        self.objects.lock().unwrap().insert(remote_path.to_string(), bytes);
        Ok(())
    }

    async fn delete(&self, remote_path: &str, _timeout: Duration) -> ServiceResult<()> {
        self.objects.lock().unwrap().remove(remote_path);
        self.deleted.lock().unwrap().push(remote_path.to_string());
        Ok(())
    }

    async fn test_connection(&self) -> ServiceResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remote_path_segments_are_encoded() {
        assert_eq!(encode_remote_path("2024/05/a b.jpg"), "2024/05/a%20b.jpg");
        assert_eq!(encode_remote_path("/2024/05/ü.webp"), "2024/05/%C3%BC.webp");
    }

    #[test]
    fn test_object_url_layout() {
        let client = BunnyStorageClient::new("https://storage.bunnycdn.com/", "/zone/", "key");
        assert_eq!(
            client.object_url("2024/05/a.jpg"),
            "https://storage.bunnycdn.com/zone/2024/05/a.jpg"
        );
    }

    #[test]
    fn test_from_config_uses_zone_and_endpoint() {
        let config = OffloadConfig {
            storage_zone: Some("media".into()),
            storage_api_key: Some("key".into()),
            ..OffloadConfig::default()
        };
        let client = BunnyStorageClient::from_config(&config);
        assert_eq!(client.object_url("a.jpg"), "https://storage.bunnycdn.com/media/a.jpg");
        assert_eq!(client.access_key, "key");
    }

    #[tokio::test]
    async fn test_streamed_body_reads_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("big.bin");
        tokio::fs::write(&path, vec![3u8; STREAM_CHUNK_BYTES + 10]).await.unwrap();

        let mock = MockRemoteStorage::new();
        mock.upload("big.bin", UploadBody::Stream(path), "application/octet-stream", Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(mock.object("big.bin").unwrap().len(), STREAM_CHUNK_BYTES + 10);
        assert!(BunnyStorageClient::streamed_body(&dir.path().join("missing")).await.is_err());
    }
}
