use async_trait::async_trait;
use std::collections::HashMap;
use std::io::Cursor;
use std::sync::Arc;
use tokio::io::AsyncReadExt;
use tokio::sync::RwLock;

use super::{DataReference, RawReader, RawStore, Result, StoreError};

/// Store that keeps every object in memory, keyed by its reference
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    objects: Arc<RwLock<HashMap<String, Vec<u8>>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// All stored references, sorted
    pub async fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.objects.read().await.keys().cloned().collect();
        keys.sort();
        keys
    }

    pub async fn len(&self) -> usize {
        self.objects.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.objects.read().await.is_empty()
    }
}

#[async_trait]
impl RawStore for MemoryStore {
    async fn write_raw(
        &self,
        reference: &DataReference,
        mut body: RawReader,
        size: u64,
    ) -> Result<DataReference> {
        let mut buf = Vec::with_capacity(size as usize);
        body.read_to_end(&mut buf).await.map_err(StoreError::Body)?;

        self.objects
            .write()
            .await
            .insert(reference.as_str().to_string(), buf);

        Ok(reference.clone())
    }

    async fn read_raw(&self, reference: &DataReference) -> Result<RawReader> {
        let objects = self.objects.read().await;
        let data = objects
            .get(reference.as_str())
            .cloned()
            .ok_or_else(|| StoreError::NotFound(reference.clone()))?;
        Ok(Box::pin(Cursor::new(data)))
    }

    async fn delete(&self, reference: &DataReference) -> Result<()> {
        self.objects
            .write()
            .await
            .remove(reference.as_str())
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(reference.clone()))
    }
}
