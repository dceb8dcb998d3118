//! Turn a task's local output directory into uploaded blobs and a typed
//! output record.
//!
//! [`Uploader::recursive_upload`] walks the declared outputs, classifies each
//! one against what is on disk and uploads it. Single blobs map to one remote
//! object, multipart blobs to one object per file below the base reference.

pub mod walk;

use futures::stream::{self, StreamExt};
use std::path::Path;
use tokio::fs::File;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::{CleanupPolicy, MissingOutputPolicy, UploadOptions, MAX_ERROR_FILE_SIZE};
use crate::error::{FileKind, Result, UploadError};
use crate::literal::{
    BlobDimensionality, BlobType, DataLoadingFormat, IoStrategy, Literal, LiteralMap, LiteralType,
    SimpleType, VariableMap, LOADING_FORMAT_KEY,
};
use crate::primitive::parse_primitive;
use crate::store::{DataReference, DataStore};

use walk::{collect_files, LocalFile};

pub struct Uploader {
    store: DataStore,
    format: DataLoadingFormat,
    io_strategy: IoStrategy,
    error_file_name: String,
    options: UploadOptions,
    cancel: CancellationToken,
}

impl Uploader {
    pub fn new(
        store: DataStore,
        format: DataLoadingFormat,
        io_strategy: IoStrategy,
        error_file_name: impl Into<String>,
    ) -> Self {
        Self {
            store,
            format,
            io_strategy,
            error_file_name: error_file_name.into(),
            options: UploadOptions::default(),
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_options(mut self, options: UploadOptions) -> Self {
        self.options = options;
        self
    }

    /// Abort uploads once `token` is cancelled
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Name of the file a task writes to report its own failure
    pub fn error_file_name(&self) -> &str {
        &self.error_file_name
    }

    pub fn store(&self) -> &DataStore {
        &self.store
    }

    /// Upload every declared output under `from_path` and write the resulting
    /// record to `output_ref`.
    ///
    /// Blob data lands below `raw_ref/<output name>`. The record is written
    /// once, only after every output resolved.
    pub async fn recursive_upload(
        &self,
        vars: &VariableMap,
        from_path: &Path,
        output_ref: &DataReference,
        raw_ref: &DataReference,
    ) -> Result<LiteralMap> {
        self.check_cancelled()?;
        info!(
            "Uploading {} output(s) from {} (format: {}, strategy: {})",
            vars.variables.len(),
            from_path.display(),
            self.format,
            self.io_strategy
        );

        self.check_local_root(from_path)?;
        self.check_task_error(from_path).await?;

        if vars.variables.contains_key(&self.error_file_name) {
            return Err(UploadError::ReservedOutputName {
                name: self.error_file_name.clone(),
            });
        }

        let mut outputs = LiteralMap::default();
        for (name, variable) in &vars.variables {
            self.check_cancelled()?;
            let local_path = from_path.join(name);

            let literal = match &variable.ty {
                LiteralType::Blob(blob_type) => {
                    self.handle_blob_output(name, blob_type, &local_path, raw_ref)
                        .await?
                }
                LiteralType::Simple(simple) => {
                    self.handle_simple_type(name, *simple, &local_path).await?
                }
            };

            match literal {
                Some(literal) => {
                    info!("Output [{}] completed", name);
                    let literal =
                        literal.with_metadata(LOADING_FORMAT_KEY, self.format.to_string());
                    outputs.literals.insert(name.clone(), literal);
                }
                None => warn!("Output [{}] not found on disk, skipping", name),
            }
        }

        info!("Uploading final outputs to [{}]", output_ref);
        self.store
            .write_structured(output_ref, &outputs)
            .await
            .map_err(|source| UploadError::Serialize {
                reference: output_ref.clone(),
                source,
            })?;

        Ok(outputs)
    }

    /// Upload a blob, inferring its dimensionality from disk
    ///
    /// Regular files become `SINGLE` blobs at `to`, directories become
    /// `MULTIPART` blobs whose files live below `to`.
    pub async fn handle_blob_type(&self, local_path: &Path, to: &DataReference) -> Result<Literal> {
        match probe(local_path)? {
            FileKind::File => self.upload_single(local_path, to, BlobType::single()).await,
            FileKind::Directory => {
                self.upload_directory(local_path, to, BlobType::multipart())
                    .await
            }
            FileKind::Missing => Err(UploadError::local_read(
                local_path,
                std::io::Error::new(std::io::ErrorKind::NotFound, "no such file or directory"),
            )),
            kind => Err(UploadError::UnsupportedFileKind {
                path: local_path.to_path_buf(),
                kind,
            }),
        }
    }

    async fn handle_blob_output(
        &self,
        name: &str,
        blob_type: &BlobType,
        local_path: &Path,
        raw_ref: &DataReference,
    ) -> Result<Option<Literal>> {
        let kind = probe(local_path)?;
        let declared = blob_type.dimensionality;

        match (kind, declared) {
            (FileKind::Missing, _) => self.missing_output(name, local_path).map(|_| None),
            (FileKind::Symlink | FileKind::Other, _) => Err(UploadError::UnsupportedFileKind {
                path: local_path.to_path_buf(),
                kind,
            }),
            (FileKind::File, BlobDimensionality::Single)
            | (FileKind::Directory, BlobDimensionality::Multipart) => {
                let to = self.store.construct_reference(raw_ref, name)?;
                debug!("Output [{}] is a {} blob, uploading to {}", name, declared, to);

                let literal = if kind == FileKind::File {
                    self.upload_single(local_path, &to, blob_type.clone()).await?
                } else {
                    self.upload_directory(local_path, &to, blob_type.clone())
                        .await?
                };
                Ok(Some(literal))
            }
            (observed, declared) => Err(UploadError::DimensionalityMismatch {
                name: name.to_string(),
                path: local_path.to_path_buf(),
                declared,
                observed,
            }),
        }
    }

    async fn handle_simple_type(
        &self,
        name: &str,
        ty: SimpleType,
        local_path: &Path,
    ) -> Result<Option<Literal>> {
        match probe(local_path)? {
            FileKind::File => {}
            FileKind::Missing => return self.missing_output(name, local_path).map(|_| None),
            kind => {
                return Err(UploadError::InvalidPrimitive {
                    name: name.to_string(),
                    reason: format!("expected a regular file, found a {}", kind),
                });
            }
        }

        let size = tokio::fs::metadata(local_path)
            .await
            .map_err(|e| UploadError::local_read(local_path, e))?
            .len();
        if size > self.options.max_primitive_size {
            return Err(UploadError::InvalidPrimitive {
                name: name.to_string(),
                reason: format!(
                    "file is {} bytes, primitives are limited to {} bytes",
                    size, self.options.max_primitive_size
                ),
            });
        }

        let raw = tokio::fs::read_to_string(local_path)
            .await
            .map_err(|e| UploadError::local_read(local_path, e))?;
        let value = parse_primitive(ty, &raw).map_err(|reason| UploadError::InvalidPrimitive {
            name: name.to_string(),
            reason,
        })?;

        debug!("Output [{}] parsed as {}", name, ty);
        Ok(Some(Literal::primitive(value)))
    }

    fn missing_output(&self, name: &str, local_path: &Path) -> Result<()> {
        match self.options.missing_output {
            MissingOutputPolicy::Fail => Err(UploadError::MissingOutput {
                name: name.to_string(),
                path: local_path.to_path_buf(),
            }),
            MissingOutputPolicy::Skip => Ok(()),
        }
    }

    async fn upload_single(
        &self,
        local_path: &Path,
        to: &DataReference,
        ty: BlobType,
    ) -> Result<Literal> {
        let uri = self.upload_file(local_path, to).await?;
        Ok(Literal::blob(uri.to_string(), ty))
    }

    /// Stream one local file to `to`. The handle is owned by the store write
    /// and closed when it returns.
    async fn upload_file(&self, local_path: &Path, to: &DataReference) -> Result<DataReference> {
        let file = File::open(local_path)
            .await
            .map_err(|e| UploadError::local_read(local_path, e))?;
        let size = file
            .metadata()
            .await
            .map_err(|e| UploadError::local_read(local_path, e))?
            .len();

        debug!("Uploading {} ({} bytes) to {}", local_path.display(), size, to);
        self.store
            .write_raw(to, Box::pin(file), size)
            .await
            .map_err(|e| UploadError::store_write(local_path, e))
    }

    async fn upload_directory(
        &self,
        local_path: &Path,
        to: &DataReference,
        ty: BlobType,
    ) -> Result<Literal> {
        let files = collect_files(local_path)?;
        if files.is_empty() {
            warn!("Directory {} is empty, no objects uploaded", local_path.display());
        } else {
            info!(
                "Uploading {} file(s), {} bytes, from {} to {}",
                files.len(),
                files.iter().map(|f| f.size).sum::<u64>(),
                local_path.display(),
                to
            );
        }

        // Stops new uploads after the first failure without touching the
        // caller's token.
        let abort = self.cancel.child_token();
        let outcomes: Vec<(String, Option<Result<DataReference>>)> = stream::iter(files)
            .map(|file| {
                let abort = abort.clone();
                async move {
                    let key = file.key.clone();
                    let outcome = self.upload_child(file, to, &abort).await;
                    if matches!(outcome, Some(Err(_))) {
                        abort.cancel();
                    }
                    (key, outcome)
                }
            })
            .buffer_unordered(self.options.max_concurrent.max(1))
            .collect()
            .await;

        let mut uploaded = Vec::new();
        let mut failures = Vec::new();
        for (key, outcome) in outcomes {
            match outcome {
                Some(Ok(reference)) => uploaded.push(reference),
                Some(Err(e)) => failures.push((key, e)),
                None => {}
            }
        }

        if let Some(err) = pick_failure(failures) {
            if self.options.cleanup == CleanupPolicy::BestEffort {
                self.cleanup(&uploaded).await;
            } else if !uploaded.is_empty() {
                warn!(
                    "{} object(s) already uploaded below {} were left in place",
                    uploaded.len(),
                    to
                );
            }
            return Err(err);
        }

        debug!("Uploaded {} object(s) below {}", uploaded.len(), to);
        Ok(Literal::blob(to.to_string(), ty))
    }

    /// `None` means the file was skipped because a sibling already failed
    async fn upload_child(
        &self,
        file: LocalFile,
        base: &DataReference,
        abort: &CancellationToken,
    ) -> Option<Result<DataReference>> {
        if self.cancel.is_cancelled() {
            return Some(Err(UploadError::Cancelled));
        }
        if abort.is_cancelled() {
            return None;
        }

        let result = match self.store.construct_reference(base, &file.key) {
            Ok(child) => self
                .upload_file(&file.path, &child)
                .await
                .map_err(|e| e.at_relative(&file.key)),
            Err(e) => Err(e.into()),
        };
        Some(result)
    }

    async fn cleanup(&self, uploaded: &[DataReference]) {
        info!("Removing {} partially uploaded object(s)", uploaded.len());
        for reference in uploaded {
            if let Err(e) = self.store.delete(reference).await {
                warn!("Failed to remove {}: {}", reference, e);
            }
        }
    }

    fn check_cancelled(&self) -> Result<()> {
        if self.cancel.is_cancelled() {
            return Err(UploadError::Cancelled);
        }
        Ok(())
    }

    fn check_local_root(&self, from_path: &Path) -> Result<()> {
        match std::fs::metadata(from_path) {
            Ok(meta) if meta.is_dir() => Ok(()),
            Ok(_) => Err(UploadError::InvalidLocalRoot {
                path: from_path.to_path_buf(),
                reason: "not a directory".to_string(),
            }),
            Err(e) => Err(UploadError::InvalidLocalRoot {
                path: from_path.to_path_buf(),
                reason: e.to_string(),
            }),
        }
    }

    /// A task that failed leaves its message in the error file
    async fn check_task_error(&self, from_path: &Path) -> Result<()> {
        let error_path = from_path.join(&self.error_file_name);
        let meta = match tokio::fs::metadata(&error_path).await {
            Ok(meta) => meta,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(UploadError::local_read(&error_path, e)),
        };

        if !meta.is_file() {
            return Err(UploadError::InvalidLocalRoot {
                path: error_path,
                reason: "error file is not a regular file".to_string(),
            });
        }
        if meta.len() > MAX_ERROR_FILE_SIZE {
            return Err(UploadError::InvalidLocalRoot {
                path: error_path,
                reason: format!("error file too large ({} bytes)", meta.len()),
            });
        }

        let contents = tokio::fs::read(&error_path)
            .await
            .map_err(|e| UploadError::local_read(&error_path, e))?;
        let message = String::from_utf8_lossy(&contents).trim().to_string();
        warn!("Task wrote {}, skipping upload", error_path.display());
        Err(UploadError::TaskFailed { message })
    }
}

fn probe(path: &Path) -> Result<FileKind> {
    FileKind::probe(path).map_err(|e| UploadError::local_read(path, e))
}

/// Prefer a genuine failure with the smallest relative path over cancellation
fn pick_failure(mut failures: Vec<(String, UploadError)>) -> Option<UploadError> {
    failures.sort_by(|(a_key, a_err), (b_key, b_err)| {
        a_err
            .is_cancelled()
            .cmp(&b_err.is_cancelled())
            .then_with(|| a_key.cmp(b_key))
    });
    failures.into_iter().next().map(|(_, err)| err)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::IoSide;
    use crate::literal::{Primitive, Scalar};
    use crate::store::{self, MemoryStore, RawReader, RawStore, StoreError};
    use async_trait::async_trait;
    use std::fs;
    use std::sync::Arc;

    fn uploader_with(raw: Arc<dyn RawStore>, options: UploadOptions) -> Uploader {
        Uploader::new(
            DataStore::new(raw),
            DataLoadingFormat::Json,
            IoStrategy::UploadOnExit,
            "error",
        )
        .with_options(options)
    }

    fn uploader(store: &MemoryStore) -> Uploader {
        uploader_with(Arc::new(store.clone()), UploadOptions::default())
    }

    async fn read_string(store: &DataStore, reference: &DataReference) -> String {
        String::from_utf8(store.read_bytes(reference).await.unwrap()).unwrap()
    }

    fn blob_schema() -> VariableMap {
        VariableMap::new()
            .with("x", LiteralType::Blob(BlobType::single()))
            .with("y", LiteralType::Blob(BlobType::multipart()))
    }

    fn write_blob_outputs(root: &Path) {
        fs::write(root.join("x"), b"data").unwrap();
        let y = root.join("y");
        fs::create_dir(&y).unwrap();
        fs::write(y.join("file1.txt"), b"dir data 1").unwrap();
        fs::write(y.join("file2.txt"), b"dir data 2").unwrap();
        fs::write(y.join("file3.json"), br#"{"key": "value"}"#).unwrap();
    }

    /// Memory store that rejects writes to references ending in `fail_suffix`
    struct FailingStore {
        inner: MemoryStore,
        fail_suffix: &'static str,
    }

    #[async_trait]
    impl RawStore for FailingStore {
        async fn write_raw(
            &self,
            reference: &DataReference,
            body: RawReader,
            size: u64,
        ) -> store::Result<DataReference> {
            if reference.as_str().ends_with(self.fail_suffix) {
                return Err(StoreError::S3 {
                    bucket: "test".to_string(),
                    message: "injected failure".to_string(),
                });
            }
            self.inner.write_raw(reference, body, size).await
        }

        async fn read_raw(&self, reference: &DataReference) -> store::Result<RawReader> {
            self.inner.read_raw(reference).await
        }

        async fn delete(&self, reference: &DataReference) -> store::Result<()> {
            self.inner.delete(reference).await
        }
    }

    /// Fails writes ending in `fail_suffix`; other writes wait until that
    /// failure has happened
    struct GatedStore {
        inner: MemoryStore,
        fail_suffix: &'static str,
        gate: CancellationToken,
    }

    #[async_trait]
    impl RawStore for GatedStore {
        async fn write_raw(
            &self,
            reference: &DataReference,
            body: RawReader,
            size: u64,
        ) -> store::Result<DataReference> {
            if reference.as_str().ends_with(self.fail_suffix) {
                self.gate.cancel();
                return Err(StoreError::S3 {
                    bucket: "test".to_string(),
                    message: "injected failure".to_string(),
                });
            }
            self.gate.cancelled().await;
            self.inner.write_raw(reference, body, size).await
        }

        async fn read_raw(&self, reference: &DataReference) -> store::Result<RawReader> {
            self.inner.read_raw(reference).await
        }

        async fn delete(&self, reference: &DataReference) -> store::Result<()> {
            self.inner.delete(reference).await
        }
    }

    /// Cancels `token` after every successful write
    struct CancellingStore {
        inner: MemoryStore,
        token: CancellationToken,
    }

    #[async_trait]
    impl RawStore for CancellingStore {
        async fn write_raw(
            &self,
            reference: &DataReference,
            body: RawReader,
            size: u64,
        ) -> store::Result<DataReference> {
            let written = self.inner.write_raw(reference, body, size).await?;
            self.token.cancel();
            Ok(written)
        }

        async fn read_raw(&self, reference: &DataReference) -> store::Result<RawReader> {
            self.inner.read_raw(reference).await
        }

        async fn delete(&self, reference: &DataReference) -> store::Result<()> {
            self.inner.delete(reference).await
        }
    }

    #[tokio::test]
    async fn test_recursive_upload_blobs() {
        let dir = tempfile::tempdir().unwrap();
        write_blob_outputs(dir.path());

        let memory = MemoryStore::new();
        let uploader = uploader(&memory);
        let output_ref = DataReference::from("output");
        let raw_ref = DataReference::from("raw");

        uploader
            .recursive_upload(&blob_schema(), dir.path(), &output_ref, &raw_ref)
            .await
            .unwrap();

        let store = uploader.store();
        let outputs: LiteralMap = store.read_structured(&output_ref).await.unwrap();
        assert_eq!(outputs.len(), 2);

        // Single file blob
        let x = outputs.get("x").and_then(Literal::as_blob).unwrap();
        assert_eq!(x.dimensionality(), BlobDimensionality::Single);
        assert_eq!(
            read_string(store, &DataReference::from(x.uri.as_str())).await,
            "data"
        );

        // Directory blob
        let y_literal = outputs.get("y").unwrap();
        assert_eq!(
            y_literal.metadata.get(LOADING_FORMAT_KEY).map(String::as_str),
            Some("JSON")
        );
        let y = y_literal.as_blob().unwrap();
        assert_eq!(y.dimensionality(), BlobDimensionality::Multipart);
        let dir_ref = DataReference::from(y.uri.as_str());

        for (name, expected) in [
            ("file1.txt", "dir data 1"),
            ("file2.txt", "dir data 2"),
            ("file3.json", r#"{"key": "value"}"#),
        ] {
            let file_ref = store.construct_reference(&dir_ref, name).unwrap();
            assert_eq!(read_string(store, &file_ref).await, expected);
        }

        // Directories are only key prefixes
        assert_eq!(
            memory.keys().await,
            vec![
                "output",
                "raw/x",
                "raw/y/file1.txt",
                "raw/y/file2.txt",
                "raw/y/file3.json"
            ]
        );
    }

    #[tokio::test]
    async fn test_handle_blob_type_directory() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("file.txt"), b"content").unwrap();

        let memory = MemoryStore::new();
        let uploader = uploader(&memory);
        let to = DataReference::from("s3://test-bucket/");

        let literal = uploader.handle_blob_type(dir.path(), &to).await.unwrap();
        let blob = literal.as_blob().unwrap();
        assert_eq!(blob.dimensionality(), BlobDimensionality::Multipart);
        assert_eq!(blob.uri, "s3://test-bucket/");
        assert_eq!(
            read_string(uploader.store(), &DataReference::from("s3://test-bucket/file.txt")).await,
            "content"
        );
    }

    #[tokio::test]
    async fn test_handle_blob_type_file() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("model.bin");
        fs::write(&file, b"").unwrap();

        let memory = MemoryStore::new();
        let uploader = uploader(&memory);
        let to = DataReference::from("mem://model");

        let literal = uploader.handle_blob_type(&file, &to).await.unwrap();
        let blob = literal.as_blob().unwrap();
        assert_eq!(blob.dimensionality(), BlobDimensionality::Single);
        assert_eq!(blob.uri, "mem://model");
        assert!(uploader.store().read_bytes(&to).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_nested_multipart_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("tree");
        let files = [
            ("top.txt", "top"),
            ("a/one.txt", "one"),
            ("a/b/two.txt", "two"),
            ("a/b/c/d/three.txt", "three"),
            ("empty.dat", ""),
        ];
        for (rel, content) in files {
            let path = out.join(rel);
            fs::create_dir_all(path.parent().unwrap()).unwrap();
            fs::write(path, content).unwrap();
        }
        fs::create_dir_all(out.join("no/files/here")).unwrap();

        let memory = MemoryStore::new();
        let uploader = uploader_with(
            Arc::new(memory.clone()),
            UploadOptions::default().with_max_concurrent(8).unwrap(),
        );
        let vars = VariableMap::new().with("tree", LiteralType::Blob(BlobType::multipart()));

        let outputs = uploader
            .recursive_upload(
                &vars,
                dir.path(),
                &DataReference::from("meta/outputs"),
                &DataReference::from("raw"),
            )
            .await
            .unwrap();

        let tree = outputs.get("tree").and_then(Literal::as_blob).unwrap();
        assert_eq!(tree.uri, "raw/tree");
        let base = DataReference::from(tree.uri.as_str());
        for (rel, content) in files {
            let reference = uploader.store().construct_reference(&base, rel).unwrap();
            assert_eq!(read_string(uploader.store(), &reference).await, content);
        }
        // five files plus the record
        assert_eq!(memory.len().await, files.len() + 1);
    }

    #[tokio::test]
    async fn test_upload_is_repeatable() {
        let dir = tempfile::tempdir().unwrap();
        write_blob_outputs(dir.path());
        let output_ref = DataReference::from("output");
        let raw_ref = DataReference::from("raw");

        let mut records = Vec::new();
        let mut contents = Vec::new();
        for _ in 0..2 {
            let memory = MemoryStore::new();
            let uploader = uploader(&memory);
            let record = uploader
                .recursive_upload(&blob_schema(), dir.path(), &output_ref, &raw_ref)
                .await
                .unwrap();

            let mut objects = Vec::new();
            for key in memory.keys().await {
                let reference = DataReference::new(key);
                objects.push(uploader.store().read_bytes(&reference).await.unwrap());
            }
            records.push(record);
            contents.push(objects);
        }

        assert_eq!(records[0], records[1]);
        assert_eq!(contents[0], contents[1]);
    }

    #[tokio::test]
    async fn test_missing_output_fails_without_record() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x"), b"data").unwrap();

        let memory = MemoryStore::new();
        let uploader = uploader(&memory);
        let vars = blob_schema();
        let output_ref = DataReference::from("output");

        let err = uploader
            .recursive_upload(&vars, dir.path(), &output_ref, &DataReference::from("raw"))
            .await
            .unwrap_err();

        assert!(matches!(err, UploadError::MissingOutput { ref name, .. } if name == "y"));
        assert!(matches!(
            uploader.store().read_raw(&output_ref).await,
            Err(StoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn test_missing_output_skip_policy() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("x"), b"data").unwrap();

        let memory = MemoryStore::new();
        let uploader = uploader_with(
            Arc::new(memory.clone()),
            UploadOptions::default().with_missing_output(MissingOutputPolicy::Skip),
        );
        let output_ref = DataReference::from("output");

        let outputs = uploader
            .recursive_upload(&blob_schema(), dir.path(), &output_ref, &DataReference::from("raw"))
            .await
            .unwrap();

        assert_eq!(outputs.len(), 1);
        assert!(outputs.get("x").is_some());
        let stored: LiteralMap = uploader.store().read_structured(&output_ref).await.unwrap();
        assert_eq!(stored, outputs);
    }

    #[tokio::test]
    async fn test_file_where_directory_declared() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("y"), b"not a directory").unwrap();

        let memory = MemoryStore::new();
        let uploader = uploader(&memory);
        let vars = VariableMap::new().with("y", LiteralType::Blob(BlobType::multipart()));

        let err = uploader
            .recursive_upload(
                &vars,
                dir.path(),
                &DataReference::from("output"),
                &DataReference::from("raw"),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::DimensionalityMismatch {
                ref name,
                declared: BlobDimensionality::Multipart,
                observed: FileKind::File,
                ..
            } if name == "y"
        ));
        assert!(memory.is_empty().await);
    }

    #[tokio::test]
    async fn test_directory_where_file_declared() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("x")).unwrap();
        fs::write(dir.path().join("x/inner.txt"), b"inner").unwrap();

        let memory = MemoryStore::new();
        let uploader = uploader(&memory);
        let vars = VariableMap::new().with("x", LiteralType::Blob(BlobType::single()));

        let err = uploader
            .recursive_upload(
                &vars,
                dir.path(),
                &DataReference::from("output"),
                &DataReference::from("raw"),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::DimensionalityMismatch {
                declared: BlobDimensionality::Single,
                observed: FileKind::Directory,
                ..
            }
        ));
        assert!(memory.is_empty().await);
    }

    fn write_three_files(root: &Path) {
        let y = root.join("y");
        fs::create_dir_all(y.join("b")).unwrap();
        fs::write(y.join("a.txt"), b"a").unwrap();
        fs::write(y.join("b/two.txt"), b"two").unwrap();
        fs::write(y.join("c.txt"), b"c").unwrap();
    }

    #[tokio::test]
    async fn test_failing_child_reports_relative_path() {
        let dir = tempfile::tempdir().unwrap();
        write_three_files(dir.path());

        let memory = MemoryStore::new();
        let failing = FailingStore {
            inner: memory.clone(),
            fail_suffix: "b/two.txt",
        };
        let uploader = uploader_with(
            Arc::new(failing),
            UploadOptions::default().with_max_concurrent(1).unwrap(),
        );
        let vars = VariableMap::new().with("y", LiteralType::Blob(BlobType::multipart()));

        let err = uploader
            .recursive_upload(
                &vars,
                dir.path(),
                &DataReference::from("output"),
                &DataReference::from("raw"),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::UploadIo {
                side: IoSide::RemoteWrite,
                relative: Some(ref rel),
                ..
            } if rel == "b/two.txt"
        ));
        // No rollback by default, no record, and nothing started after the failure
        assert_eq!(memory.keys().await, vec!["raw/y/a.txt"]);
    }

    #[tokio::test]
    async fn test_best_effort_cleanup_removes_uploaded_children() {
        let dir = tempfile::tempdir().unwrap();
        write_three_files(dir.path());

        let memory = MemoryStore::new();
        let failing = FailingStore {
            inner: memory.clone(),
            fail_suffix: "c.txt",
        };
        let uploader = uploader_with(
            Arc::new(failing),
            UploadOptions::default()
                .with_max_concurrent(1)
                .unwrap()
                .with_cleanup(CleanupPolicy::BestEffort),
        );

        let err = uploader
            .handle_blob_type(&dir.path().join("y"), &DataReference::from("raw/y"))
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::UploadIo { relative: Some(ref rel), .. } if rel == "c.txt"
        ));
        assert!(memory.is_empty().await);
    }

    #[tokio::test]
    async fn test_cancelled_upload_starts_nothing() {
        let dir = tempfile::tempdir().unwrap();
        write_blob_outputs(dir.path());

        let memory = MemoryStore::new();
        let token = CancellationToken::new();
        token.cancel();
        let uploader = uploader(&memory).with_cancellation(token);

        let err = uploader
            .recursive_upload(
                &blob_schema(),
                dir.path(),
                &DataReference::from("output"),
                &DataReference::from("raw"),
            )
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert!(memory.is_empty().await);
    }

    #[tokio::test]
    async fn test_parallel_failure_starts_no_new_files() {
        let dir = tempfile::tempdir().unwrap();
        let y = dir.path().join("y");
        fs::create_dir(&y).unwrap();
        for name in ["a.txt", "b.txt", "c.txt", "d.txt"] {
            fs::write(y.join(name), name).unwrap();
        }

        let memory = MemoryStore::new();
        let gated = GatedStore {
            inner: memory.clone(),
            fail_suffix: "a.txt",
            gate: CancellationToken::new(),
        };
        let uploader = uploader_with(
            Arc::new(gated),
            UploadOptions::default().with_max_concurrent(2).unwrap(),
        );
        let vars = VariableMap::new().with("y", LiteralType::Blob(BlobType::multipart()));

        let err = uploader
            .recursive_upload(
                &vars,
                dir.path(),
                &DataReference::from("output"),
                &DataReference::from("raw"),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::UploadIo { relative: Some(ref rel), .. } if rel == "a.txt"
        ));
        // b.txt was already in flight, c.txt and d.txt never started
        assert_eq!(memory.keys().await, vec!["raw/y/b.txt"]);
    }

    #[tokio::test]
    async fn test_cancel_during_directory_upload() {
        let dir = tempfile::tempdir().unwrap();
        let y = dir.path().join("y");
        fs::create_dir(&y).unwrap();
        for name in ["a", "b", "c"] {
            fs::write(y.join(name), name).unwrap();
        }

        let memory = MemoryStore::new();
        let token = CancellationToken::new();
        let cancelling = CancellingStore {
            inner: memory.clone(),
            token: token.clone(),
        };
        let uploader = uploader_with(
            Arc::new(cancelling),
            UploadOptions::default().with_max_concurrent(1).unwrap(),
        )
        .with_cancellation(token);
        let vars = VariableMap::new().with("y", LiteralType::Blob(BlobType::multipart()));

        let err = uploader
            .recursive_upload(
                &vars,
                dir.path(),
                &DataReference::from("output"),
                &DataReference::from("raw"),
            )
            .await
            .unwrap_err();

        assert!(err.is_cancelled());
        assert_eq!(memory.keys().await, vec!["raw/y/a"]);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_fifo_inside_directory_output_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let y = dir.path().join("y");
        fs::create_dir(&y).unwrap();
        fs::write(y.join("a.txt"), b"a").unwrap();
        let status = std::process::Command::new("mkfifo")
            .arg(y.join("pipe"))
            .status()
            .unwrap();
        assert!(status.success());

        let memory = MemoryStore::new();
        let uploader = uploader(&memory);
        let vars = VariableMap::new().with("y", LiteralType::Blob(BlobType::multipart()));

        let err = uploader
            .recursive_upload(
                &vars,
                dir.path(),
                &DataReference::from("output"),
                &DataReference::from("raw"),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::UnsupportedFileKind {
                kind: FileKind::Other,
                ref path,
            } if path.ends_with("pipe")
        ));
        assert!(memory.is_empty().await);
    }

    #[tokio::test]
    async fn test_task_error_file_short_circuits() {
        let dir = tempfile::tempdir().unwrap();
        write_blob_outputs(dir.path());
        fs::write(dir.path().join("error"), b"division by zero\n").unwrap();

        let memory = MemoryStore::new();
        let uploader = uploader(&memory);
        assert_eq!(uploader.error_file_name(), "error");

        let err = uploader
            .recursive_upload(
                &blob_schema(),
                dir.path(),
                &DataReference::from("output"),
                &DataReference::from("raw"),
            )
            .await
            .unwrap_err();

        assert!(matches!(
            err,
            UploadError::TaskFailed { ref message } if message == "division by zero"
        ));
        assert!(memory.is_empty().await);
    }

    #[tokio::test]
    async fn test_reserved_output_name() {
        let dir = tempfile::tempdir().unwrap();
        let memory = MemoryStore::new();
        let uploader = uploader(&memory);
        let vars = VariableMap::new().with("error", LiteralType::Blob(BlobType::single()));

        let err = uploader
            .recursive_upload(
                &vars,
                dir.path(),
                &DataReference::from("output"),
                &DataReference::from("raw"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::ReservedOutputName { .. }));
    }

    #[tokio::test]
    async fn test_invalid_local_root() {
        let dir = tempfile::tempdir().unwrap();
        let memory = MemoryStore::new();
        let uploader = uploader(&memory);

        let err = uploader
            .recursive_upload(
                &blob_schema(),
                &dir.path().join("does-not-exist"),
                &DataReference::from("output"),
                &DataReference::from("raw"),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::InvalidLocalRoot { .. }));
    }

    #[tokio::test]
    async fn test_simple_outputs() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("count"), b"42\n").unwrap();
        fs::write(dir.path().join("label"), b"hello").unwrap();
        fs::write(dir.path().join("ok"), b"true").unwrap();

        let memory = MemoryStore::new();
        let uploader = uploader(&memory);
        let vars = VariableMap::new()
            .with("count", LiteralType::Simple(SimpleType::Integer))
            .with("label", LiteralType::Simple(SimpleType::String))
            .with("ok", LiteralType::Simple(SimpleType::Boolean));

        let outputs = uploader
            .recursive_upload(
                &vars,
                dir.path(),
                &DataReference::from("output"),
                &DataReference::from("raw"),
            )
            .await
            .unwrap();

        assert_eq!(
            outputs.get("count").and_then(Literal::as_primitive),
            Some(&Primitive::Integer(42))
        );
        assert_eq!(
            outputs.get("label").map(|l| &l.scalar),
            Some(&Scalar::Primitive(Primitive::String("hello".to_string())))
        );
        assert_eq!(
            outputs.get("ok").and_then(Literal::as_primitive),
            Some(&Primitive::Boolean(true))
        );
        // Only the record is written for primitives
        assert_eq!(memory.keys().await, vec!["output"]);
    }

    #[tokio::test]
    async fn test_simple_output_rejects_bad_values() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("count"), b"forty-two").unwrap();
        fs::write(dir.path().join("big"), vec![b'1'; 64]).unwrap();

        let memory = MemoryStore::new();
        let uploader = uploader_with(
            Arc::new(memory.clone()),
            UploadOptions::default().with_max_primitive_size(16),
        );

        for name in ["count", "big"] {
            let vars = VariableMap::new().with(name, LiteralType::Simple(SimpleType::Integer));
            let err = uploader
                .recursive_upload(
                    &vars,
                    dir.path(),
                    &DataReference::from("output"),
                    &DataReference::from("raw"),
                )
                .await
                .unwrap_err();
            assert!(matches!(err, UploadError::InvalidPrimitive { name: ref n, .. } if n == name));
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_symlinked_output_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real"), b"data").unwrap();
        std::os::unix::fs::symlink(dir.path().join("real"), dir.path().join("x")).unwrap();

        let memory = MemoryStore::new();
        let uploader = uploader(&memory);
        let vars = VariableMap::new().with("x", LiteralType::Blob(BlobType::single()));

        let err = uploader
            .recursive_upload(
                &vars,
                dir.path(),
                &DataReference::from("output"),
                &DataReference::from("raw"),
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            UploadError::UnsupportedFileKind {
                kind: FileKind::Symlink,
                ..
            }
        ));
    }

    #[test]
    fn test_pick_failure_prefers_genuine_errors() {
        let failures = vec![
            ("a.txt".to_string(), UploadError::Cancelled),
            (
                "z.txt".to_string(),
                UploadError::local_read(Path::new("/z.txt"), std::io::Error::other("boom")),
            ),
            (
                "m.txt".to_string(),
                UploadError::local_read(Path::new("/m.txt"), std::io::Error::other("boom")),
            ),
        ];
        let picked = pick_failure(failures).unwrap();
        assert!(matches!(
            picked,
            UploadError::UploadIo { ref path, .. } if path == Path::new("/m.txt")
        ));

        let only_cancelled = vec![("a".to_string(), UploadError::Cancelled)];
        assert!(pick_failure(only_cancelled).unwrap().is_cancelled());
        assert!(pick_failure(Vec::new()).is_none());
    }
}
