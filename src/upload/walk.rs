use std::path::{Component, Path, PathBuf};
use walkdir::WalkDir;

use crate::error::{FileKind, Result, UploadError};

/// A regular file discovered under a multipart output directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LocalFile {
    pub path: PathBuf,
    /// Path relative to the walked root, `/`-separated
    pub key: String,
    pub size: u64,
}

/// Collect every regular file below `root`, sorted by relative key
///
/// Directories only contribute to keys. Symlinks and special files abort the
/// walk before anything is uploaded.
pub fn collect_files(root: &Path) -> Result<Vec<LocalFile>> {
    let mut files = Vec::new();

    for entry in WalkDir::new(root).follow_links(false).min_depth(1) {
        let entry = entry.map_err(|e| {
            let path = e.path().unwrap_or(root).to_path_buf();
            let io = e
                .into_io_error()
                .unwrap_or_else(|| std::io::Error::other("filesystem loop detected"));
            UploadError::local_read(&path, io)
        })?;

        match FileKind::from_file_type(entry.file_type()) {
            FileKind::Directory => continue,
            FileKind::File => {
                let size = entry
                    .metadata()
                    .map_err(|e| {
                        let io = e
                            .into_io_error()
                            .unwrap_or_else(|| std::io::Error::other("metadata unavailable"));
                        UploadError::local_read(entry.path(), io)
                    })?
                    .len();
                files.push(LocalFile {
                    key: relative_key(root, entry.path())?,
                    path: entry.into_path(),
                    size,
                });
            }
            kind => {
                return Err(UploadError::UnsupportedFileKind {
                    path: entry.into_path(),
                    kind,
                });
            }
        }
    }

    files.sort_by(|a, b| a.key.cmp(&b.key));
    Ok(files)
}

/// Build a portable `/`-joined key for `path` relative to `root`
pub fn relative_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path.strip_prefix(root).map_err(|_| UploadError::InvalidPath {
        path: path.to_path_buf(),
        reason: format!("not below {}", root.display()),
    })?;

    let mut segments = Vec::new();
    for component in relative.components() {
        match component {
            Component::Normal(name) => {
                let name = name.to_str().ok_or_else(|| UploadError::InvalidPath {
                    path: path.to_path_buf(),
                    reason: "file name is not valid UTF-8".to_string(),
                })?;
                segments.push(name);
            }
            Component::CurDir => {}
            _ => {
                return Err(UploadError::InvalidPath {
                    path: path.to_path_buf(),
                    reason: "unexpected path component".to_string(),
                });
            }
        }
    }

    if segments.is_empty() {
        return Err(UploadError::InvalidPath {
            path: path.to_path_buf(),
            reason: "path is the upload root itself".to_string(),
        });
    }

    Ok(segments.join("/"))
}
