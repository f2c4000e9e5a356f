//! S3-compatible object storage backend.
//!
//! Objects are stored under `<uuid>/<filename>`. Downloads resolve to the
//! configured public domain when there is one, otherwise to a presigned URL
//! that forces the original filename.

use crate::storage::{
    BackendKind, DownloadTarget, NETWORK_TIMEOUT, StorageBackend, StorageError, StorageResult,
    parse_config, public_url, require_fields, sanitize_filename,
};
use async_trait::async_trait;
use s3::{Bucket, Region, creds::Credentials, error::S3Error};
use serde::{Deserialize, Serialize};
use std::{collections::HashMap, path::Path};
use tokio::{fs::File, time::timeout};
use tracing::{debug, warn};
use uuid::Uuid;

/// Lifetime of presigned download URLs.
const PRESIGN_EXPIRY_SECS: u32 = 2 * 60 * 60;
const DEFAULT_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct S3Config {
    pub endpoint: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub bucket: String,
    #[serde(default)]
    pub region: String,
    /// Public domain serving the bucket; empty means presigned URLs.
    #[serde(default)]
    pub domain: String,
}

pub struct S3Backend {
    config: S3Config,
    bucket: Box<Bucket>,
}

impl S3Backend {
    pub fn from_config(raw: &str) -> StorageResult<Self> {
        let config: S3Config = parse_config(BackendKind::S3, raw)?;
        Self::new(config)
    }

    pub fn new(config: S3Config) -> StorageResult<Self> {
        require_fields(
            BackendKind::S3,
            &[
                ("endpoint", &config.endpoint),
                ("access_key_id", &config.access_key_id),
                ("secret_access_key", &config.secret_access_key),
                ("bucket", &config.bucket),
            ],
        )?;

        let credentials = Credentials::new(
            Some(&config.access_key_id),
            Some(&config.secret_access_key),
            None,
            None,
            None,
        )
        .map_err(|e| StorageError::Config(format!("s3 credentials: {}", e)))?;

        let endpoint = if config.endpoint.contains("://") {
            config.endpoint.clone()
        } else {
            format!("https://{}", config.endpoint)
        };
        let region = Region::Custom {
            region: if config.region.trim().is_empty() {
                DEFAULT_REGION.to_string()
            } else {
                config.region.clone()
            },
            endpoint,
        };

        let mut bucket = Bucket::new(&config.bucket, region, credentials)
            .map_err(|e| StorageError::Config(format!("s3 bucket: {}", e)))?;
        // Path-style addressing works for MinIO and most compatible services.
        bucket.set_path_style();

        Ok(Self { config, bucket })
    }

    /// Cheap authenticated round trip that tells an unreachable endpoint
    /// apart from one that refuses our credentials.
    async fn probe(&self) -> StorageResult<()> {
        match timeout(NETWORK_TIMEOUT, self.bucket.location()).await {
            Err(_) => Err(StorageError::Unreachable(format!(
                "no answer from {} within {:?}",
                self.config.endpoint, NETWORK_TIMEOUT
            ))),
            Ok(Err(err)) => Err(classify_error(err)),
            Ok(Ok((_, code))) => check_status(code, "bucket probe"),
        }
    }

    async fn put(&self, local_path: &Path, key: &str) -> StorageResult<()> {
        let mut file = File::open(local_path).await?;
        let response = self
            .bucket
            .put_object_stream(&mut file, key)
            .await
            .map_err(classify_error)?;
        check_status(response.status_code(), "upload")
    }
}

#[async_trait]
impl StorageBackend for S3Backend {
    fn kind(&self) -> BackendKind {
        BackendKind::S3
    }

    async fn upload(&self, local_path: &Path, desired_name: &str) -> StorageResult<String> {
        self.probe().await?;

        let key = format!("{}/{}", Uuid::new_v4(), sanitize_filename(desired_name));
        if let Err(err) = self.put(local_path, &key).await {
            if let Err(cleanup) = self.delete(&key).await {
                warn!(%key, error = %cleanup, "failed to remove partial s3 object");
            }
            return Err(err);
        }

        debug!(bucket = %self.config.bucket, %key, "stored object in s3");
        Ok(key)
    }

    async fn download(&self, key: &str, filename: &str) -> StorageResult<DownloadTarget> {
        let (_, code) = timeout(NETWORK_TIMEOUT, self.bucket.head_object(key))
            .await
            .map_err(|_| StorageError::Unreachable("head object timed out".into()))?
            .map_err(classify_error)?;
        if code == 404 {
            return Err(StorageError::FileUnavailable);
        }
        check_status(code, "head object")?;

        if !self.config.domain.trim().is_empty() {
            return Ok(DownloadTarget::Url(public_url(&self.config.domain, key)));
        }

        let mut queries = HashMap::new();
        queries.insert(
            "response-content-disposition".to_string(),
            format!(
                "attachment; filename=\"{}\"",
                sanitize_filename(filename).replace('"', "")
            ),
        );
        let url = self
            .bucket
            .presign_get(key, PRESIGN_EXPIRY_SECS, Some(queries))
            .await
            .map_err(classify_error)?;
        Ok(DownloadTarget::Url(url))
    }

    async fn delete(&self, key: &str) -> StorageResult<()> {
        let response = self
            .bucket
            .delete_object(key)
            .await
            .map_err(classify_error)?;
        match response.status_code() {
            404 => Ok(()),
            code => check_status(code, "delete"),
        }
    }

    fn serialize(&self) -> String {
        serde_json::to_string(&self.config).unwrap_or_default()
    }
}

fn check_status(code: u16, action: &str) -> StorageResult<()> {
    match code {
        200..=299 => Ok(()),
        500..=599 => Err(StorageError::Unreachable(format!(
            "{} failed with status {}",
            action, code
        ))),
        _ => Err(StorageError::Rejected(format!(
            "{} failed with status {}",
            action, code
        ))),
    }
}

fn classify_error(err: S3Error) -> StorageError {
    match err {
        S3Error::HttpFailWithBody(code, body) => {
            debug!(code, %body, "s3 request failed");
            match check_status(code, "s3 request") {
                Ok(()) => StorageError::Rejected(format!("unexpected status {}", code)),
                Err(err) => err,
            }
        }
        other => StorageError::Unreachable(other.to_string()),
    }
}
