#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Resumable, idempotent ingestion of paginated JSON APIs into a bronze
//! storage layer.
//!
//! Each dataset is driven by a [`controller::PaginationController`]:
//!
//! 1. decide a strategy from the stored [`ResumptionMetadata`] (fast-path
//!    probe, resume, reconstruction via [`boundary::BoundarySearch`], or
//!    cold start),
//! 2. fetch pages sequentially into a [`merger::StreamMerger`],
//! 3. write the merged artifact only when its fingerprint changed, then
//!    the metadata,
//! 4. append exactly one [`AuditRecord`] per run.
//!
//! [`runner::Runner`] runs many datasets with a shared rate limit and
//! retry rounds. [`verify`] checks stored state against upstream without
//! writing anything.
//!
//! [`ResumptionMetadata`]: bronze_ingest_models::ResumptionMetadata
//! [`AuditRecord`]: bronze_ingest_models::AuditRecord

pub mod audit;
pub mod boundary;
pub mod config;
pub mod controller;
pub mod merger;
pub mod progress;
pub mod runner;
pub mod skip_cache;
pub mod verify;

#[cfg(test)]
mod test_helpers;

use std::path::PathBuf;
use std::sync::Arc;

use bronze_fetch::{PageSource, Redactor};
use bronze_storage::{MetadataStore, ObjectStore, StorageError};
use tokio_util::sync::CancellationToken;

use crate::progress::RunProgress;

/// Errors that abort a dataset run outside of normal page outcomes.
#[derive(Debug, thiserror::Error)]
pub enum IngestError {
    /// Storage read or write failed.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Scratch I/O failed.
    #[error("Scratch I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A record could not be serialised.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The stored artifact is not a JSON array of records.
    #[error("Existing artifact {key} is not a JSON array: {source}")]
    CorruptArtifact {
        /// Artifact key.
        key: String,
        /// Parse error.
        source: serde_json::Error,
    },

    /// A page arrived out of order.
    #[error("Page {page} appended after page {previous}")]
    OutOfOrder {
        /// Last appended page.
        previous: u32,
        /// Offending page.
        page: u32,
    },

    /// An existing artifact was seeded after pages were appended.
    #[error("Existing artifact must be seeded before any page is appended")]
    SeedAfterAppend,

    /// The audit log could not be written.
    #[error(transparent)]
    Audit(#[from] audit::AuditError),

    /// The catalog is invalid.
    #[error(transparent)]
    Config(#[from] config::ConfigError),
}

/// Collaborators shared by every dataset run.
///
/// Cheap to clone; everything is behind `Arc`.
#[derive(Clone)]
pub struct IngestContext {
    /// Page fetcher (shares one rate gate across datasets).
    pub source: Arc<dyn PageSource>,
    /// Artifact storage.
    pub store: Arc<dyn ObjectStore>,
    /// Resumption metadata on top of `store`.
    pub metadata: MetadataStore,
    /// Redaction rules for audit params.
    pub redactor: Redactor,
    /// Progress reporting.
    pub progress: Arc<dyn RunProgress>,
    /// Cancels every in-flight run.
    pub cancel: CancellationToken,
    /// Parent directory for scratch space (system temp when `None`).
    pub scratch_dir: Option<PathBuf>,
}

impl IngestContext {
    /// Builds a context around a fetcher and a store.
    #[must_use]
    pub fn new(
        source: Arc<dyn PageSource>,
        store: Arc<dyn ObjectStore>,
        progress: Arc<dyn RunProgress>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            metadata: MetadataStore::new(Arc::clone(&store)),
            source,
            store,
            redactor: Redactor::default(),
            progress,
            cancel,
            scratch_dir: None,
        }
    }

    /// Sets the redaction rules.
    #[must_use]
    pub fn with_redactor(mut self, redactor: Redactor) -> Self {
        self.redactor = redactor;
        self
    }

    /// Sets the scratch parent directory.
    #[must_use]
    pub fn with_scratch_dir(mut self, dir: PathBuf) -> Self {
        self.scratch_dir = Some(dir);
        self
    }
}
