#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Durable storage for bronze artifacts and their resumption metadata.
//!
//! The engine only needs three operations from a store: read a whole
//! object, replace a whole object, and ask for an object's content
//! fingerprint. Nothing here is transactional; idempotency is decided
//! by the caller by comparing [`ContentFingerprint`]s and
//! [`bronze_ingest_models::ResumptionMetadata`].
//!
//! | Backend | Use |
//! |---|---|
//! | [`LocalStore`] | a directory on disk |
//! | [`S3Store`] | AWS S3 or any S3-compatible service (Cloudflare R2) |
//! | [`MemoryStore`] | tests and dry runs |

pub mod local;
pub mod memory;
pub mod metadata;
pub mod s3;

use async_trait::async_trait;
use bronze_ingest_models::ContentFingerprint;

pub use local::LocalStore;
pub use memory::MemoryStore;
pub use metadata::{MetadataStore, metadata_key};
pub use s3::{S3Settings, S3Store};

/// Errors that can occur during storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    /// Reading an object failed.
    #[error("Failed to read {key}: {source}")]
    Read {
        /// Object key.
        key: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Writing an object failed.
    #[error("Failed to write {key}: {source}")]
    Write {
        /// Object key.
        key: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// Fetching object metadata failed.
    #[error("Failed to head {key}: {source}")]
    Head {
        /// Object key.
        key: String,
        /// Underlying error.
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    /// A key escapes the store root or is otherwise unusable.
    #[error("Invalid object key '{key}': {reason}")]
    InvalidKey {
        /// Offending key.
        key: String,
        /// Why it was rejected.
        reason: String,
    },

    /// A stored metadata object could not be decoded or encoded.
    #[error("Invalid metadata at {key}: {source}")]
    Metadata {
        /// Metadata object key.
        key: String,
        /// Underlying JSON error.
        source: serde_json::Error,
    },

    /// I/O error outside a specific object operation.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Whole-object storage used for artifacts and metadata.
///
/// `write` replaces the object wholesale; readers never observe a
/// half-written object.
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Reads an object. Returns `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Read`] if the backend fails.
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError>;

    /// Creates or replaces an object.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Write`] if the backend fails.
    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError>;

    /// Returns the content fingerprint of an object, or `None` if it does
    /// not exist.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::Head`] if the backend fails.
    async fn head(&self, key: &str) -> Result<Option<ContentFingerprint>, StorageError>;

    /// Short description for log lines (e.g. `s3://bucket`).
    fn describe(&self) -> String;
}
