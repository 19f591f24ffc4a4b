//! Progress reporting for ingestion runs.
//!
//! The engine reports through [`RunProgress`] and never renders anything
//! itself. The CLI plugs in `indicatif` bars; tests and library callers
//! use [`NullProgress`].

use std::sync::Arc;

use bronze_ingest_models::AuditStatus;

/// Receives progress events from the runner and the pagination
/// controller.
///
/// Implementations must be `Send + Sync`: datasets run on concurrent
/// tasks and share one reporter.
pub trait RunProgress: Send + Sync {
    /// The number of datasets that will be attempted in this round.
    fn datasets_planned(&self, total: u64);

    /// A dataset run started.
    fn dataset_started(&self, dataset_id: &str);

    /// A non-empty page was fetched. `total_records` counts records
    /// fetched by this run so far.
    fn page_fetched(&self, dataset_id: &str, page: u32, total_records: u64);

    /// A dataset run reached its terminal state.
    fn dataset_finished(&self, dataset_id: &str, status: AuditStatus);

    /// Every round is done.
    fn run_finished(&self, summary: &str);
}

/// Ignores every event.
pub struct NullProgress;

impl RunProgress for NullProgress {
    fn datasets_planned(&self, _total: u64) {}
    fn dataset_started(&self, _dataset_id: &str) {}
    fn page_fetched(&self, _dataset_id: &str, _page: u32, _total_records: u64) {}
    fn dataset_finished(&self, _dataset_id: &str, _status: AuditStatus) {}
    fn run_finished(&self, _summary: &str) {}
}

/// Returns a shared [`NullProgress`].
#[must_use]
pub fn null_progress() -> Arc<dyn RunProgress> {
    Arc::new(NullProgress)
}
