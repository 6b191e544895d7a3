use super::ObjectStore;
use async_trait::async_trait;
use aws_sdk_s3::Client as S3Client;
use bytes::Bytes;
use pipeline_core::{Error, Result};
use tracing::{debug, instrument};

pub struct S3Store {
    client: S3Client,
    bucket: String,
}

impl S3Store {
    pub async fn new(bucket: String, region: String, aws_profile: Option<String>) -> Result<Self> {
        let mut config_loader = aws_config::defaults(aws_config::BehaviorVersion::latest())
            .region(aws_config::Region::new(region));

        if let Some(profile) = &aws_profile {
            config_loader = config_loader.profile_name(profile);
        }

        let config = config_loader.load().await;
        let client = S3Client::new(&config);

        Ok(Self { client, bucket })
    }

    fn storage_err(&self, key: &str, what: &str, e: impl std::fmt::Display) -> Error {
        Error::Storage(format!("{} failed for '{}': {}", what, key, e))
    }
}

#[async_trait]
impl ObjectStore for S3Store {
    #[instrument(skip(self, body), fields(bucket = %self.bucket))]
    async fn put_if_absent(&self, key: &str, body: Bytes) -> Result<()> {
        // Archived objects are write-once; reusing a key is a bug upstream,
        // never something to paper over with an overwrite.
        if self.exists(key).await? {
            return Err(Error::IdempotencyViolation(key.to_string()));
        }

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body.into())
            .send()
            .await
            .map_err(|e| self.storage_err(key, "put_object", aws_sdk_s3::error::DisplayErrorContext(e)))?;

        debug!(key, "Stored object");
        Ok(())
    }

    #[instrument(skip(self), fields(bucket = %self.bucket))]
    async fn get(&self, key: &str) -> Result<Bytes> {
        let response = self
            .client
            .get_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| self.storage_err(key, "get_object", aws_sdk_s3::error::DisplayErrorContext(e)))?;

        let body = response
            .body
            .collect()
            .await
            .map_err(|e| self.storage_err(key, "read body", e))?;

        Ok(body.into_bytes())
    }

    async fn exists(&self, key: &str) -> Result<bool> {
        match self
            .client
            .head_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
        {
            Ok(_) => Ok(true),
            Err(e) => {
                let not_found = e
                    .as_service_error()
                    .map(|se| se.is_not_found())
                    .unwrap_or(false);
                if not_found {
                    Ok(false)
                } else {
                    Err(self.storage_err(key, "head_object", aws_sdk_s3::error::DisplayErrorContext(e)))
                }
            }
        }
    }

    async fn health_check(&self) -> Result<()> {
        self.client
            .list_objects_v2()
            .bucket(&self.bucket)
            .max_keys(1)
            .send()
            .await
            .map_err(|e| {
                Error::Storage(format!(
                    "S3 health check failed for bucket '{}': {}",
                    self.bucket,
                    aws_sdk_s3::error::DisplayErrorContext(e)
                ))
            })?;

        Ok(())
    }
}
