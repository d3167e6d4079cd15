//! Object storage for artifacts and visual baselines.
//!
//! Run artifacts live at `{job_id}/{basename}`, baselines at
//! `baselines/{project}/{slug}_{WxH}.png`. Retrieval always goes through
//! fresh presigned URLs; when a public endpoint is configured it is used for
//! signing so the URLs are reachable from outside the deployment network.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use aws_sdk_s3::config::{BehaviorVersion, Credentials, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;

use crate::config::StorageConfig;

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("Storage not configured")]
    NotConfigured,

    #[error("Upload failed: {0}")]
    UploadFailed(String),

    #[error("Download failed: {0}")]
    DownloadFailed(String),

    #[error("Bucket operation failed: {0}")]
    BucketFailed(String),

    #[error("Presign failed: {0}")]
    PresignFailed(String),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// Capability surface the rest of the platform codes against
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Create the bucket if it does not exist; repeat calls are no-ops
    async fn ensure_bucket(&self) -> Result<()>;

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()>;

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Time-limited retrieval URL. Image keys are served inline so browsers
    /// render them instead of downloading.
    async fn presign(&self, key: &str, ttl: Duration) -> Result<String>;

    fn bucket(&self) -> &str;
}

/// Content type for keys that should render inline in a browser
fn inline_content_type(key: &str) -> Option<&'static str> {
    let ext = key.rsplit('.').next()?.to_ascii_lowercase();
    match ext.as_str() {
        "png" => Some("image/png"),
        "jpg" | "jpeg" => Some("image/jpeg"),
        "webp" => Some("image/webp"),
        "gif" => Some("image/gif"),
        "svg" => Some("image/svg+xml"),
        _ => None,
    }
}

/// S3-compatible store (AWS, MinIO). Holds two clients: one on the internal
/// endpoint for data transfer, one on the public endpoint for signing.
pub struct S3Store {
    client: Client,
    signer: Client,
    bucket: String,
}

impl S3Store {
    /// Build from configuration; None when the storage section lacks an
    /// endpoint or credentials.
    pub fn from_config(config: &StorageConfig) -> Option<Self> {
        let endpoint = config.endpoint.clone()?;
        let access_key = config.access_key.clone()?;
        let secret_key = config.secret_key.clone()?;
        let public_endpoint = config
            .public_endpoint
            .clone()
            .unwrap_or_else(|| endpoint.clone());

        let credentials = Credentials::new(access_key, secret_key, None, None, "proofbox");

        let build = |endpoint: String| {
            let conf = aws_sdk_s3::Config::builder()
                .behavior_version(BehaviorVersion::latest())
                .region(Region::new(config.region.clone()))
                .endpoint_url(endpoint)
                .credentials_provider(credentials.clone())
                .force_path_style(true)
                .build();
            Client::from_conf(conf)
        };

        Some(Self {
            client: build(endpoint),
            signer: build(public_endpoint),
            bucket: config.bucket.clone(),
        })
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn ensure_bucket(&self) -> Result<()> {
        match self.client.head_bucket().bucket(&self.bucket).send().await {
            Ok(_) => return Ok(()),
            Err(err) => {
                if !err.as_service_error().map_or(false, |e| e.is_not_found()) {
                    return Err(StorageError::BucketFailed(err.to_string()));
                }
            }
        }

        match self.client.create_bucket().bucket(&self.bucket).send().await {
            Ok(_) => {
                tracing::info!(bucket = %self.bucket, "Created artifact bucket");
                Ok(())
            }
            Err(err) => {
                let owned = err.as_service_error().map_or(false, |e| {
                    e.is_bucket_already_owned_by_you() || e.is_bucket_already_exists()
                });
                if owned {
                    Ok(())
                } else {
                    Err(StorageError::BucketFailed(err.to_string()))
                }
            }
        }
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        let size = bytes.len();
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(bytes))
            .send()
            .await
            .map_err(|e| StorageError::UploadFailed(e.to_string()))?;
        tracing::info!(key, size, "Uploaded to storage");
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let out = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match out {
            Ok(out) => {
                let data = out
                    .body
                    .collect()
                    .await
                    .map_err(|e| StorageError::DownloadFailed(e.to_string()))?;
                Ok(Some(data.into_bytes().to_vec()))
            }
            Err(err) => {
                if err.as_service_error().map_or(false, |e| e.is_no_such_key()) {
                    Ok(None)
                } else {
                    Err(StorageError::DownloadFailed(err.to_string()))
                }
            }
        }
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String> {
        let presigning = PresigningConfig::expires_in(ttl)
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;

        let mut request = self.signer.get_object().bucket(&self.bucket).key(key);
        if let Some(content_type) = inline_content_type(key) {
            request = request
                .response_content_disposition("inline")
                .response_content_type(content_type);
        }

        let presigned = request
            .presigned(presigning)
            .await
            .map_err(|e| StorageError::PresignFailed(e.to_string()))?;
        Ok(presigned.uri().to_string())
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

/// In-memory store for tests and local development
#[derive(Default)]
pub struct MemoryStore {
    objects: Mutex<HashMap<String, Vec<u8>>>,
    bucket: String,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            objects: Mutex::new(HashMap::new()),
            bucket: "proofbox-local".to_string(),
        }
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn ensure_bucket(&self) -> Result<()> {
        Ok(())
    }

    async fn put(&self, key: &str, bytes: Vec<u8>) -> Result<()> {
        self.objects
            .lock()
            .unwrap()
            .insert(key.to_string(), bytes);
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        Ok(self.objects.lock().unwrap().get(key).cloned())
    }

    async fn presign(&self, key: &str, ttl: Duration) -> Result<String> {
        Ok(format!(
            "https://storage.local/{}/{}?expires_in={}",
            self.bucket,
            key,
            ttl.as_secs()
        ))
    }

    fn bucket(&self) -> &str {
        &self.bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inline_content_type() {
        assert_eq!(inline_content_type("a/b/shot.png"), Some("image/png"));
        assert_eq!(inline_content_type("x.JPG"), Some("image/jpeg"));
        assert_eq!(inline_content_type("diff.webp"), Some("image/webp"));
        assert_eq!(inline_content_type("trace.zip"), None);
        assert_eq!(inline_content_type("report.html"), None);
    }

    #[tokio::test]
    async fn test_memory_store_round_trip() {
        let store = MemoryStore::new();
        store.ensure_bucket().await.unwrap();
        store.put("job1/shot.png", vec![1, 2, 3]).await.unwrap();

        assert_eq!(
            store.get("job1/shot.png").await.unwrap(),
            Some(vec![1, 2, 3])
        );
        assert_eq!(store.get("missing").await.unwrap(), None);

        let url = store
            .presign("job1/shot.png", Duration::from_secs(60))
            .await
            .unwrap();
        assert!(url.contains("job1/shot.png"));
        assert!(url.contains("expires_in=60"));
    }

    #[test]
    fn test_s3_store_requires_credentials() {
        let config = StorageConfig::default();
        assert!(S3Store::from_config(&config).is_none());
    }
}
