//! Amazon S3 backend. References take the form `s3://bucket/key`.

mod client;
mod multipart;
mod upload;

use async_trait::async_trait;
use aws_sdk_s3::Client;
use tracing::debug;

pub use client::S3Client;
pub use multipart::MULTIPART_THRESHOLD;

use super::{DataReference, RawReader, RawStore, Result, StoreError};

const SCHEME: &str = "s3://";

/// A parsed `s3://bucket/key` reference
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct S3Location {
    pub bucket: String,
    pub key: String,
}

impl S3Location {
    pub fn parse(reference: &DataReference) -> Result<Self> {
        let raw = reference.as_str();
        let rest = raw
            .strip_prefix(SCHEME)
            .ok_or_else(|| StoreError::invalid_reference(raw, "expected an s3:// reference"))?;

        let (bucket, key) = match rest.split_once('/') {
            Some((bucket, key)) => (bucket, key),
            None => (rest, ""),
        };
        validate_bucket_name(bucket).map_err(|reason| StoreError::invalid_reference(raw, reason))?;

        Ok(Self {
            bucket: bucket.to_string(),
            key: key.to_string(),
        })
    }

    /// Objects need a non-empty key, prefixes do not
    fn object_key(&self, reference: &DataReference) -> Result<&str> {
        if self.key.is_empty() || self.key.ends_with('/') {
            return Err(StoreError::invalid_reference(
                reference.as_str(),
                "reference names a prefix, not an object",
            ));
        }
        Ok(&self.key)
    }
}

/// Validate S3 bucket name according to AWS rules
pub fn validate_bucket_name(bucket: &str) -> std::result::Result<(), String> {
    if bucket.is_empty() {
        return Err("bucket name cannot be empty".to_string());
    }

    if bucket.len() < 3 || bucket.len() > 63 {
        return Err(format!(
            "bucket '{}' must be between 3 and 63 characters (got {})",
            bucket,
            bucket.len()
        ));
    }

    let starts_ok = bucket
        .chars()
        .next()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    let ends_ok = bucket
        .chars()
        .last()
        .is_some_and(|c| c.is_ascii_lowercase() || c.is_ascii_digit());
    if !starts_ok || !ends_ok {
        return Err(format!(
            "bucket '{}' must start and end with a lowercase letter or number",
            bucket
        ));
    }

    if let Some(c) = bucket
        .chars()
        .find(|c| !c.is_ascii_lowercase() && !c.is_ascii_digit() && *c != '-' && *c != '.')
    {
        return Err(format!(
            "bucket '{}' contains invalid character '{}'",
            bucket, c
        ));
    }

    if bucket.contains("..") {
        return Err(format!("bucket '{}' cannot contain consecutive periods", bucket));
    }

    if bucket
        .split('.')
        .all(|part| !part.is_empty() && part.parse::<u8>().is_ok())
    {
        return Err(format!(
            "bucket '{}' cannot be formatted as an IP address",
            bucket
        ));
    }

    Ok(())
}

/// Remote store writing objects to S3
#[derive(Clone)]
pub struct S3Store {
    client: Client,
}

impl S3Store {
    pub fn new(client: S3Client) -> Self {
        Self {
            client: client.into_inner(),
        }
    }
}

#[async_trait]
impl RawStore for S3Store {
    async fn write_raw(
        &self,
        reference: &DataReference,
        body: RawReader,
        size: u64,
    ) -> Result<DataReference> {
        let location = S3Location::parse(reference)?;
        let key = location.object_key(reference)?;

        if size >= MULTIPART_THRESHOLD {
            multipart::upload_multipart(&self.client, &location.bucket, key, body, size).await?;
        } else {
            upload::put_object(&self.client, &location.bucket, key, body, size).await?;
        }

        Ok(reference.clone())
    }

    async fn read_raw(&self, reference: &DataReference) -> Result<RawReader> {
        let location = S3Location::parse(reference)?;
        let key = location.object_key(reference)?;

        let output = self
            .client
            .get_object()
            .bucket(&location.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    StoreError::NotFound(reference.clone())
                } else {
                    StoreError::from_aws_error(&location.bucket, e)
                }
            })?;

        debug!("Opened s3://{}/{} for reading", location.bucket, key);
        Ok(Box::pin(output.body.into_async_read()))
    }

    async fn delete(&self, reference: &DataReference) -> Result<()> {
        let location = S3Location::parse(reference)?;
        let key = location.object_key(reference)?;

        self.client
            .delete_object()
            .bucket(&location.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| StoreError::from_aws_error(&location.bucket, e))?;

        debug!("Deleted s3://{}/{}", location.bucket, key);
        Ok(())
    }
}
