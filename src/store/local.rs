use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::PathBuf;
use tokio::fs::{self, File};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::debug;

use super::{DataReference, RawReader, RawStore, Result, StoreError};

const COPY_BUFFER_SIZE: usize = 64 * 1024;

/// Store backed by the local filesystem
///
/// References are plain paths or `file://` URIs. Relative paths resolve
/// against the store root.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn resolve(&self, reference: &DataReference) -> Result<PathBuf> {
        let raw = reference.as_str();
        let path = raw.strip_prefix("file://").unwrap_or(raw);
        if path.is_empty() {
            return Err(StoreError::invalid_reference(raw, "empty path"));
        }
        if path.contains("://") {
            return Err(StoreError::invalid_reference(
                raw,
                "only file:// references are supported by the local store",
            ));
        }

        let path = PathBuf::from(path);
        if path.is_absolute() {
            Ok(path)
        } else {
            Ok(self.root.join(path))
        }
    }
}

#[async_trait]
impl RawStore for LocalStore {
    async fn write_raw(
        &self,
        reference: &DataReference,
        mut body: RawReader,
        size: u64,
    ) -> Result<DataReference> {
        let path = self.resolve(reference)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut file = File::create(&path).await?;
        let mut buffer = vec![0u8; COPY_BUFFER_SIZE];
        let mut written = 0u64;

        loop {
            let bytes_read = body.read(&mut buffer).await.map_err(StoreError::Body)?;
            if bytes_read == 0 {
                break;
            }
            file.write_all(&buffer[..bytes_read]).await?;
            written += bytes_read as u64;
        }
        file.flush().await?;

        if written != size {
            debug!(
                "Wrote {} bytes to {} (expected {})",
                written,
                path.display(),
                size
            );
        }

        Ok(reference.clone())
    }

    async fn read_raw(&self, reference: &DataReference) -> Result<RawReader> {
        let path = self.resolve(reference)?;
        match File::open(&path).await {
            Ok(file) => Ok(Box::pin(file)),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(reference.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn delete(&self, reference: &DataReference) -> Result<()> {
        let path = self.resolve(reference)?;
        match fs::remove_file(&path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                Err(StoreError::NotFound(reference.clone()))
            }
            Err(e) => Err(e.into()),
        }
    }
}
