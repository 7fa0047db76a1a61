//! Cloudflare R2 artifact backend.

use async_trait::async_trait;
use std::path::Path;
use std::time::Duration;

use aws_config::BehaviorVersion;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::{Builder, Region};
use aws_sdk_s3::presigning::PresigningConfig;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::Client;
use tracing::{debug, info};

use crate::error::{StorageError, StorageResult};
use crate::storage::{join_url, validate_key, ObjectStorage};

/// Longest expiry S3 presigning accepts.
const MAX_PRESIGN_EXPIRY: Duration = Duration::from_secs(7 * 24 * 60 * 60);

#[derive(Debug, Clone)]
pub struct R2Config {
    /// S3 API endpoint of the account.
    pub endpoint_url: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket_name: String,
    pub region: String,
    /// Public base URL for artifacts. Presigned GET URLs are returned when unset.
    pub public_url: Option<String>,
}

fn required(name: &str) -> StorageResult<String> {
    std::env::var(name).map_err(|_| StorageError::misconfigured(format!("{name} not set")))
}

impl R2Config {
    pub fn from_env() -> StorageResult<Self> {
        Ok(Self {
            endpoint_url: required("R2_ENDPOINT_URL")?,
            access_key_id: required("R2_ACCESS_KEY_ID")?,
            secret_access_key: required("R2_SECRET_ACCESS_KEY")?,
            bucket_name: required("R2_BUCKET_NAME")?,
            region: std::env::var("R2_REGION").unwrap_or_else(|_| "auto".to_string()),
            public_url: std::env::var("R2_PUBLIC_URL").ok().filter(|s| !s.is_empty()),
        })
    }
}

/// Publishes rendered artifacts to an R2 bucket.
#[derive(Clone)]
pub struct R2Client {
    s3: Client,
    bucket: String,
    public_url: Option<String>,
}

impl R2Client {
    pub fn new(config: R2Config) -> Self {
        let credentials = Credentials::new(
            config.access_key_id,
            config.secret_access_key,
            None,
            None,
            "render-r2",
        );

        let s3_config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .endpoint_url(config.endpoint_url)
            .region(Region::new(config.region))
            .credentials_provider(credentials)
            .force_path_style(true)
            .build();

        Self {
            s3: Client::from_conf(s3_config),
            bucket: config.bucket_name,
            public_url: config.public_url,
        }
    }

    pub fn from_env() -> StorageResult<Self> {
        R2Config::from_env().map(Self::new)
    }

    /// Time-limited download link for an artifact.
    pub async fn presign_get(&self, key: &str, expires_in: Duration) -> StorageResult<String> {
        let signing = PresigningConfig::expires_in(expires_in.min(MAX_PRESIGN_EXPIRY))
            .map_err(|e| StorageError::Signing(e.to_string()))?;

        let request = self
            .s3
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .presigned(signing)
            .await
            .map_err(|e| StorageError::Signing(e.to_string()))?;

        Ok(request.uri().to_string())
    }

    async fn artifact_url(&self, key: &str) -> StorageResult<String> {
        if let Some(base) = &self.public_url {
            return Ok(join_url(base, key));
        }
        self.presign_get(key, MAX_PRESIGN_EXPIRY).await
    }

    async fn put_artifact(&self, key: &str, body: ByteStream, content_type: &str) -> StorageResult<String> {
        self.s3
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .body(body)
            .send()
            .await
            .map_err(StorageError::upload)?;
        self.artifact_url(key).await
    }
}

#[async_trait]
impl ObjectStorage for R2Client {
    async fn upload(&self, data: Vec<u8>, key: &str, content_type: &str) -> StorageResult<String> {
        validate_key(key)?;
        debug!(key, bytes = data.len(), "Publishing artifact bytes");
        self.put_artifact(key, ByteStream::from(data), content_type).await
    }

    async fn upload_file(&self, path: &Path, key: &str, content_type: &str) -> StorageResult<String> {
        validate_key(key)?;
        if !path.exists() {
            return Err(StorageError::source_missing(path.display().to_string()));
        }

        let body = ByteStream::from_path(path).await.map_err(StorageError::upload)?;
        let url = self.put_artifact(key, body, content_type).await?;
        info!(key, source = %path.display(), "Published artifact");
        Ok(url)
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        validate_key(key)?;
        self.s3
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(StorageError::removal)?;
        debug!(key, "Removed artifact");
        Ok(())
    }

    async fn check_connectivity(&self) -> StorageResult<()> {
        self.s3
            .head_bucket()
            .bucket(&self.bucket)
            .send()
            .await
            .map(|_| ())
            .map_err(|e| StorageError::Unreachable(format!("{}: {e}", self.bucket)))
    }
}
