//! Presigned URL issuance for scan result files.

use std::{fmt, path::Path as FsPath, time::Duration};

use async_trait::async_trait;
use kennel_config::StorageConfig;
use kennel_model::JobId;
use object_store::{
    aws::{AmazonS3, AmazonS3Builder},
    path::Path,
    signer::Signer,
};
use reqwest::Method;
use tracing::debug;
use url::Url;

use crate::error::{Result, ScanError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlMethod {
    Put,
    Get,
}

impl UrlMethod {
    fn http(self) -> Method {
        match self {
            UrlMethod::Put => Method::PUT,
            UrlMethod::Get => Method::GET,
        }
    }
}

/// Issues single-operation, time-boxed URLs for object keys.
#[async_trait]
pub trait ObjectStorageGateway: Send + Sync {
    async fn presign(&self, method: UrlMethod, key: &str) -> Result<Url>;
}

/// Object key for a job's result file: `scan-<id>/<basename>`.
pub fn result_key(job_id: JobId, file_name: &str) -> Result<String> {
    let base = FsPath::new(file_name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty() && *n != "..")
        .ok_or_else(|| {
            ScanError::InvalidJob(format!("invalid result file name '{file_name}'"))
        })?;
    Ok(format!("scan-{job_id}/{base}"))
}

/// S3-compatible gateway.
pub struct S3Gateway {
    store: AmazonS3,
    bucket: String,
    ttl: Duration,
}

impl fmt::Debug for S3Gateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("S3Gateway")
            .field("bucket", &self.bucket)
            .field("ttl", &self.ttl)
            .finish()
    }
}

impl S3Gateway {
    pub fn from_config(cfg: &StorageConfig) -> Result<Self> {
        let bucket = cfg.bucket.clone().ok_or_else(|| {
            ScanError::StorageUnavailable("no storage bucket configured".into())
        })?;

        let mut builder = AmazonS3Builder::new()
            .with_bucket_name(&bucket)
            .with_region(&cfg.region);

        if let Some(endpoint) = &cfg.endpoint {
            // Path-style requests for MinIO and other S3-compatible endpoints
            builder = builder
                .with_endpoint(endpoint)
                .with_virtual_hosted_style_request(false);
        }
        if cfg.allow_http {
            builder = builder.with_allow_http(true);
        }
        if let (Some(ak), Some(sk)) = (&cfg.access_key_id, &cfg.secret_access_key)
        {
            builder = builder
                .with_access_key_id(ak)
                .with_secret_access_key(sk);
        }

        let store = builder.build().map_err(|e| {
            ScanError::StorageUnavailable(format!("S3: {e}"))
        })?;

        Ok(Self {
            store,
            bucket,
            ttl: cfg.url_ttl,
        })
    }
}

#[async_trait]
impl ObjectStorageGateway for S3Gateway {
    async fn presign(&self, method: UrlMethod, key: &str) -> Result<Url> {
        let url = self
            .store
            .signed_url(method.http(), &Path::from(key), self.ttl)
            .await?;
        debug!(bucket = %self.bucket, key, ?method, "signed object url");
        Ok(url)
    }
}

/// Stand-in used when no bucket is configured. Every request fails with
/// [`ScanError::StorageUnavailable`].
#[derive(Debug, Default, Clone, Copy)]
pub struct DisabledStorage;

#[async_trait]
impl ObjectStorageGateway for DisabledStorage {
    async fn presign(&self, _method: UrlMethod, key: &str) -> Result<Url> {
        Err(ScanError::StorageUnavailable(format!(
            "cannot sign {key}: no storage bucket configured"
        )))
    }
}
