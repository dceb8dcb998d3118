//! Remote store abstraction and the structured serializer built on top of it.

pub mod error;
pub mod local;
pub mod memory;
pub mod s3;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::io::Cursor;
use std::pin::Pin;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt};
use tracing::debug;

pub use error::StoreError;
pub use local::LocalStore;
pub use memory::MemoryStore;
pub use s3::S3Store;

pub type Result<T> = std::result::Result<T, StoreError>;

/// Byte stream handed to and returned by a store
pub type RawReader = Pin<Box<dyn AsyncRead + Send>>;

/// Opaque location in a store's namespace
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DataReference(String);

impl DataReference {
    pub fn new(reference: impl Into<String>) -> Self {
        Self(reference.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DataReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for DataReference {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

impl From<String> for DataReference {
    fn from(value: String) -> Self {
        Self(value)
    }
}

/// Raw byte storage. Implementations must be safe for concurrent use.
#[async_trait]
pub trait RawStore: Send + Sync {
    /// Write `size` bytes from `body` to `reference`, returning where they landed
    async fn write_raw(
        &self,
        reference: &DataReference,
        body: RawReader,
        size: u64,
    ) -> Result<DataReference>;

    async fn read_raw(&self, reference: &DataReference) -> Result<RawReader>;

    async fn delete(&self, reference: &DataReference) -> Result<()>;

    /// Derive a child reference from `base` and a `/`-separated relative path
    fn construct_reference(&self, base: &DataReference, relative: &str) -> Result<DataReference> {
        join_reference(base, relative)
    }
}

/// Join a relative key onto a base reference with exactly one `/` between them
pub fn join_reference(base: &DataReference, relative: &str) -> Result<DataReference> {
    if relative.is_empty() {
        return Err(StoreError::invalid_reference(relative, "empty relative path"));
    }
    if relative.starts_with('/') {
        return Err(StoreError::invalid_reference(
            relative,
            "relative path must not start with '/'",
        ));
    }
    for segment in relative.split('/') {
        match segment {
            "" => {
                return Err(StoreError::invalid_reference(
                    relative,
                    "empty path segment",
                ));
            }
            "." | ".." => {
                return Err(StoreError::invalid_reference(
                    relative,
                    "'.' and '..' segments are not allowed",
                ));
            }
            _ => {}
        }
    }

    let base = base.as_str();
    if base.is_empty() {
        return Ok(DataReference::new(relative));
    }
    if base.ends_with("://") {
        return Ok(DataReference::new(format!("{}{}", base, relative)));
    }
    Ok(DataReference::new(format!(
        "{}/{}",
        base.trim_end_matches('/'),
        relative
    )))
}

/// Encoding used for structured documents such as the output record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StructuredFormat {
    #[default]
    Json,
    Yaml,
}

impl StructuredFormat {
    fn encode<T: Serialize>(self, value: &T) -> Result<Vec<u8>> {
        match self {
            Self::Json => {
                serde_json::to_vec_pretty(value).map_err(|e| StoreError::Encode(e.to_string()))
            }
            Self::Yaml => serde_yaml::to_string(value)
                .map(String::into_bytes)
                .map_err(|e| StoreError::Encode(e.to_string())),
        }
    }

    fn decode<T: DeserializeOwned>(self, bytes: &[u8]) -> Result<T> {
        match self {
            Self::Json => {
                serde_json::from_slice(bytes).map_err(|e| StoreError::Decode(e.to_string()))
            }
            Self::Yaml => {
                serde_yaml::from_slice(bytes).map_err(|e| StoreError::Decode(e.to_string()))
            }
        }
    }
}

/// Shared handle over a raw store plus structured read/write helpers
#[derive(Clone)]
pub struct DataStore {
    raw: Arc<dyn RawStore>,
    format: StructuredFormat,
}

impl DataStore {
    pub fn new(raw: Arc<dyn RawStore>) -> Self {
        Self {
            raw,
            format: StructuredFormat::default(),
        }
    }

    pub fn with_format(mut self, format: StructuredFormat) -> Self {
        self.format = format;
        self
    }

    pub fn format(&self) -> StructuredFormat {
        self.format
    }

    pub async fn write_raw(
        &self,
        reference: &DataReference,
        body: RawReader,
        size: u64,
    ) -> Result<DataReference> {
        self.raw.write_raw(reference, body, size).await
    }

    pub async fn read_raw(&self, reference: &DataReference) -> Result<RawReader> {
        self.raw.read_raw(reference).await
    }

    /// Read the whole object into memory
    pub async fn read_bytes(&self, reference: &DataReference) -> Result<Vec<u8>> {
        let mut reader = self.raw.read_raw(reference).await?;
        let mut buf = Vec::new();
        reader.read_to_end(&mut buf).await?;
        Ok(buf)
    }

    pub async fn delete(&self, reference: &DataReference) -> Result<()> {
        self.raw.delete(reference).await
    }

    pub fn construct_reference(
        &self,
        base: &DataReference,
        relative: &str,
    ) -> Result<DataReference> {
        self.raw.construct_reference(base, relative)
    }

    /// Serialize `value` and store it at `reference`
    pub async fn write_structured<T: Serialize>(
        &self,
        reference: &DataReference,
        value: &T,
    ) -> Result<()> {
        let bytes = self.format.encode(value)?;
        let size = bytes.len() as u64;
        debug!("Writing {} bytes of structured data to {}", size, reference);
        self.raw
            .write_raw(reference, Box::pin(Cursor::new(bytes)), size)
            .await?;
        Ok(())
    }

    pub async fn read_structured<T: DeserializeOwned>(
        &self,
        reference: &DataReference,
    ) -> Result<T> {
        let bytes = self.read_bytes(reference).await?;
        self.format.decode(&bytes)
    }
}
