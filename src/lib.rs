//! Upload a task's local outputs to a remote store and record where they went.
//!
//! ```no_run
//! use std::path::Path;
//! use std::sync::Arc;
//! use taskout::literal::{BlobType, DataLoadingFormat, IoStrategy, LiteralType, VariableMap};
//! use taskout::store::{DataReference, DataStore, MemoryStore};
//! use taskout::upload::Uploader;
//!
//! # async fn run() -> taskout::error::Result<()> {
//! let vars = VariableMap::new().with("model", LiteralType::Blob(BlobType::multipart()));
//! let store = DataStore::new(Arc::new(MemoryStore::new()));
//! let uploader = Uploader::new(store, DataLoadingFormat::Json, IoStrategy::UploadOnExit, "error");
//!
//! uploader
//!     .recursive_upload(
//!         &vars,
//!         Path::new("/var/task/outputs"),
//!         &DataReference::from("meta/outputs.json"),
//!         &DataReference::from("raw"),
//!     )
//!     .await?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod literal;
pub mod primitive;
pub mod store;
pub mod upload;

pub use error::{Result, UploadError};
pub use upload::Uploader;
