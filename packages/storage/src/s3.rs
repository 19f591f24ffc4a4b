//! S3-compatible object store (AWS S3, Cloudflare R2, `MinIO`).
//!
//! `head` returns the object `ETag`, which is the MD5 of the content for
//! single-part `PutObject` uploads, so it compares directly against a
//! locally computed [`ContentFingerprint`].

use std::time::Duration;

use async_trait::async_trait;
use aws_config::Region;
use aws_sdk_s3::config::{Credentials, StalledStreamProtectionConfig};
use bronze_ingest_models::ContentFingerprint;

use crate::{ObjectStore, StorageError};

/// Maximum number of read attempts (initial + retries).
const MAX_READ_ATTEMPTS: u32 = 3;

/// Base delay between read retries (doubles each attempt).
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// Explicit connection settings. Credentials are passed in by the caller;
/// nothing here reads the environment.
#[derive(Clone)]
pub struct S3Settings {
    /// Bucket name.
    pub bucket: String,
    /// Region (`"auto"` for R2).
    pub region: String,
    /// Custom endpoint for S3-compatible services.
    pub endpoint_url: Option<String>,
    /// Access key id.
    pub access_key_id: String,
    /// Secret access key.
    pub secret_access_key: String,
}

impl std::fmt::Debug for S3Settings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Settings")
            .field("bucket", &self.bucket)
            .field("region", &self.region)
            .field("endpoint_url", &self.endpoint_url)
            .field("access_key_id", &self.access_key_id)
            .field("secret_access_key", &"***")
            .finish()
    }
}

/// Object store backed by an S3 bucket.
pub struct S3Store {
    client: aws_sdk_s3::Client,
    bucket: String,
    retry_base_delay: Duration,
}

impl S3Store {
    /// Creates a store from explicit settings.
    #[must_use]
    pub fn new(settings: &S3Settings) -> Self {
        let creds = Credentials::new(
            &settings.access_key_id,
            &settings.secret_access_key,
            None,
            None,
            "bronze-catalog",
        );

        let mut builder = aws_sdk_s3::Config::builder()
            .region(Region::new(settings.region.clone()))
            .credentials_provider(creds)
            .stalled_stream_protection(StalledStreamProtectionConfig::disabled());

        if let Some(endpoint) = &settings.endpoint_url {
            builder = builder.endpoint_url(endpoint).force_path_style(true);
        }

        Self {
            client: aws_sdk_s3::Client::from_conf(builder.build()),
            bucket: settings.bucket.clone(),
            retry_base_delay: RETRY_BASE_DELAY,
        }
    }

    /// Single read attempt. `Ok(None)` means the object does not exist.
    async fn read_once(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let result = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(aws_sdk_s3::operation::get_object::GetObjectError::is_no_such_key)
                {
                    return Ok(None);
                }
                return Err(StorageError::Read {
                    key: self.url(key),
                    source: Box::new(err),
                });
            }
        };

        let bytes = output.body.collect().await.map_err(|e| StorageError::Read {
            key: self.url(key),
            source: Box::new(e),
        })?;

        Ok(Some(bytes.into_bytes().to_vec()))
    }

    fn url(&self, key: &str) -> String {
        format!("s3://{}/{key}", self.bucket)
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let mut attempt = 1;
        loop {
            match self.read_once(key).await {
                Err(e @ StorageError::Read { .. }) if attempt < MAX_READ_ATTEMPTS => {
                    let delay = self.retry_base_delay * 2u32.saturating_pow(attempt - 1);
                    log::warn!(
                        "read attempt {attempt}/{MAX_READ_ATTEMPTS} for {} failed ({e}), \
                         retrying in {delay:.1?}...",
                        self.url(key)
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
                other => return other,
            }
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        #[allow(clippy::cast_precision_loss)] // display-only MB value
        let mb = bytes.len() as f64 / 1_048_576.0;
        log::info!("Pushing {} ({mb:.1} MB)", self.url(key));

        let content_type = if std::path::Path::new(key)
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("json"))
        {
            "application/json"
        } else {
            "application/octet-stream"
        };

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(aws_sdk_s3::primitives::ByteStream::from(bytes.to_vec()))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| StorageError::Write {
                key: self.url(key),
                source: Box::new(e),
            })?;

        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ContentFingerprint>, StorageError> {
        let result = self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await;

        match result {
            Ok(output) => {
                let fingerprint = output.e_tag().and_then(ContentFingerprint::from_etag);
                if fingerprint.is_none() {
                    // Multipart uploads have no content digest in the ETag.
                    // Fall back to hashing the bytes.
                    log::debug!("{} has no MD5 ETag, hashing content", self.url(key));
                    return Ok(self.read(key).await?.map(|b| ContentFingerprint::of(&b)));
                }
                Ok(fingerprint)
            }
            Err(err) => {
                if err
                    .as_service_error()
                    .is_some_and(aws_sdk_s3::operation::head_object::HeadObjectError::is_not_found)
                {
                    return Ok(None);
                }
                Err(StorageError::Head {
                    key: self.url(key),
                    source: Box::new(err),
                })
            }
        }
    }

    fn describe(&self) -> String {
        format!("s3://{}", self.bucket)
    }
}
