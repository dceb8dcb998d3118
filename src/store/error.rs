use thiserror::Error;

use super::DataReference;

/// Errors raised by remote store backends
#[derive(Error, Debug)]
pub enum StoreError {
    /// Nothing stored under the reference
    #[error("Object not found: {0}")]
    NotFound(DataReference),

    /// Reference could not be parsed or joined
    #[error("Invalid reference '{reference}': {reason}")]
    InvalidReference { reference: String, reason: String },

    /// Reading the upload body failed, the remote side was not at fault
    #[error("Failed to read upload body: {0}")]
    Body(#[source] std::io::Error),

    /// IO error on the store side (local backend)
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// S3 access denied
    #[error("S3 access denied for bucket '{bucket}': {message}")]
    AccessDenied { bucket: String, message: String },

    /// Any other S3 failure
    #[error("S3 error for bucket '{bucket}': {message}")]
    S3 { bucket: String, message: String },

    #[error("Failed to encode structured data: {0}")]
    Encode(String),

    #[error("Failed to decode structured data: {0}")]
    Decode(String),
}

impl StoreError {
    pub fn invalid_reference(reference: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidReference {
            reference: reference.into(),
            reason: reason.into(),
        }
    }

    /// Classify an S3 SDK error, separating permission problems from the rest
    pub fn from_aws_error<E: std::fmt::Display>(bucket: &str, error: E) -> Self {
        let error_str = error.to_string();
        if error_str.to_lowercase().contains("access denied")
            || error_str.to_lowercase().contains("forbidden")
        {
            Self::AccessDenied {
                bucket: bucket.to_string(),
                message: error_str,
            }
        } else {
            Self::S3 {
                bucket: bucket.to_string(),
                message: error_str,
            }
        }
    }

    /// True when the failure happened while reading the local body
    pub fn is_body_error(&self) -> bool {
        matches!(self, Self::Body(_))
    }
}
