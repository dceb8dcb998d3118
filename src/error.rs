use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::literal::BlobDimensionality;
use crate::store::{DataReference, StoreError};

type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// What was found on disk at an output path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileKind {
    File,
    Directory,
    Symlink,
    Other,
    Missing,
}

impl FileKind {
    /// Classify without following symlinks
    pub fn probe(path: &Path) -> std::io::Result<Self> {
        match std::fs::symlink_metadata(path) {
            Ok(meta) => Ok(Self::from_file_type(meta.file_type())),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Self::Missing),
            Err(e) => Err(e),
        }
    }

    pub fn from_file_type(ty: std::fs::FileType) -> Self {
        if ty.is_symlink() {
            Self::Symlink
        } else if ty.is_file() {
            Self::File
        } else if ty.is_dir() {
            Self::Directory
        } else {
            Self::Other
        }
    }
}

impl fmt::Display for FileKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::File => "regular file",
            Self::Directory => "directory",
            Self::Symlink => "symbolic link",
            Self::Other => "special file",
            Self::Missing => "nothing",
        };
        f.write_str(name)
    }
}

/// Which side of an upload failed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoSide {
    LocalRead,
    RemoteWrite,
}

impl fmt::Display for IoSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalRead => write!(f, "read"),
            Self::RemoteWrite => write!(f, "upload"),
        }
    }
}

/// Errors returned by the uploader
#[derive(Error, Debug)]
pub enum UploadError {
    /// A declared output never appeared under the local root
    #[error("Output '{name}' is declared but {path} does not exist")]
    MissingOutput { name: String, path: PathBuf },

    /// The on-disk kind contradicts the declared blob dimensionality
    #[error("Output '{name}' is declared {declared} but {path} is a {observed}")]
    DimensionalityMismatch {
        name: String,
        path: PathBuf,
        declared: BlobDimensionality,
        observed: FileKind,
    },

    /// Symlinks and special files are never uploaded
    #[error("Unsupported file kind at {path}: {kind}")]
    UnsupportedFileKind { path: PathBuf, kind: FileKind },

    /// Local read or remote write failure for one file
    #[error("Failed to {side} {}{}: {source}", .path.display(), relative_suffix(.relative))]
    UploadIo {
        side: IoSide,
        path: PathBuf,
        /// Path relative to the directory being uploaded, if any
        relative: Option<String>,
        #[source]
        source: BoxError,
    },

    #[error("Upload cancelled")]
    Cancelled,

    /// Local root missing, not a directory, or error file unreadable
    #[error("Invalid local output directory {path}: {reason}")]
    InvalidLocalRoot { path: PathBuf, reason: String },

    #[error("Output name '{name}' is reserved for the error file")]
    ReservedOutputName { name: String },

    /// A path that cannot be mapped to a portable remote key
    #[error("Invalid path {path}: {reason}")]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Output '{name}' has an invalid value: {reason}")]
    InvalidPrimitive { name: String, reason: String },

    /// The task wrote the error file instead of outputs
    #[error("Task reported an error: {message}")]
    TaskFailed { message: String },

    #[error("Failed to write output record to {reference}: {source}")]
    Serialize {
        reference: DataReference,
        #[source]
        source: StoreError,
    },

    #[error("Store error: {0}")]
    Store(#[from] StoreError),
}

fn relative_suffix(relative: &Option<String>) -> String {
    match relative {
        Some(rel) => format!(" (at '{}')", rel),
        None => String::new(),
    }
}

impl UploadError {
    pub fn local_read(path: &Path, error: std::io::Error) -> Self {
        Self::UploadIo {
            side: IoSide::LocalRead,
            path: path.to_path_buf(),
            relative: None,
            source: Box::new(error),
        }
    }

    /// Map a store write failure, keeping body read failures on the local side
    pub fn store_write(path: &Path, error: StoreError) -> Self {
        let side = if error.is_body_error() {
            IoSide::LocalRead
        } else {
            IoSide::RemoteWrite
        };
        Self::UploadIo {
            side,
            path: path.to_path_buf(),
            relative: None,
            source: Box::new(error),
        }
    }

    /// Attach the relative path inside a directory upload
    pub fn at_relative(self, key: &str) -> Self {
        match self {
            Self::UploadIo {
                side, path, source, ..
            } => Self::UploadIo {
                side,
                path,
                relative: Some(key.to_string()),
                source,
            },
            other => other,
        }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Get a user-friendly error message with suggestions
    pub fn user_message(&self) -> String {
        match self {
            Self::MissingOutput { name, path } => {
                format!(
                    "Output '{}' was declared but never written.\n\nPossible solutions:\n  \
                     1. Make sure the task writes {}\n  \
                     2. Remove '{}' from the output schema if it is optional",
                    name,
                    path.display(),
                    name
                )
            }
            Self::DimensionalityMismatch {
                name,
                declared,
                observed,
                ..
            } => {
                let expected = match declared {
                    BlobDimensionality::Single => "a single regular file",
                    BlobDimensionality::Multipart => "a directory",
                };
                format!(
                    "Output '{}' is declared {} and must be {}, but the task produced a {}.\n\n\
                     Possible solutions:\n  \
                     1. Write {} at the output path\n  \
                     2. Change the declared dimensionality in the output schema",
                    name, declared, expected, observed, expected
                )
            }
            Self::UnsupportedFileKind { path, kind } => {
                format!(
                    "Found a {} at {}.\n\nOnly regular files and directories can be uploaded. \
                     Replace links with copies of the data they point to.",
                    kind,
                    path.display()
                )
            }
            Self::TaskFailed { message } => message.clone(),
            _ => self.to_string(),
        }
    }
}

/// Result type for upload operations
pub type Result<T> = std::result::Result<T, UploadError>;
