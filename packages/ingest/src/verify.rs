//! Read-only comparison of stored state against upstream.
//!
//! Verification never writes to storage and never appends audit records.

use std::fmt;

use bronze_fetch::FetchRequest;
use bronze_ingest_models::{DatasetSpec, FetchOutcome, ResumptionMetadata};

use crate::{IngestContext, IngestError};

/// What verification found for one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VerifyStatus {
    /// `last_page` still has data and the page after it is empty.
    Current,
    /// Upstream has data past the stored `last_page`.
    NewData {
        /// First page with new data.
        next_page: u32,
    },
    /// The last run stopped early; the next run resumes.
    Incomplete {
        /// Last page stored.
        last_page: u32,
    },
    /// The stored `last_page` is now empty upstream. The artifact is
    /// left alone; an operator has to decide.
    Shrunk {
        /// Last page stored.
        last_page: u32,
    },
    /// No metadata to compare with.
    Unknown {
        /// Whether an artifact is stored.
        artifact_exists: bool,
    },
    /// A probe failed.
    Failed {
        /// Cause.
        message: String,
    },
}

impl fmt::Display for VerifyStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => f.write_str("current"),
            Self::NewData { next_page } => write!(f, "new data from page {next_page}"),
            Self::Incomplete { last_page } => {
                write!(f, "incomplete (stopped after page {last_page})")
            }
            Self::Shrunk { last_page } => {
                write!(f, "shrunk: page {last_page} is now empty (reconstruction ambiguous)")
            }
            Self::Unknown {
                artifact_exists: true,
            } => f.write_str("unknown (artifact without metadata)"),
            Self::Unknown {
                artifact_exists: false,
            } => f.write_str("unknown (never ingested)"),
            Self::Failed { message } => write!(f, "failed: {message}"),
        }
    }
}

/// Verification result for one dataset.
#[derive(Debug, Clone)]
pub struct VerifyReport {
    /// Dataset id.
    pub dataset_id: String,
    /// Finding.
    pub status: VerifyStatus,
    /// Stored metadata, if any.
    pub metadata: Option<ResumptionMetadata>,
}

/// Verifies one dataset.
///
/// Completed datasets cost at most two fetches: `last_page`, then
/// `last_page + 1`.
///
/// # Errors
///
/// Returns [`IngestError::Storage`] if metadata or the artifact cannot be
/// inspected. Failed probes are reported as [`VerifyStatus::Failed`].
pub async fn verify(ctx: &IngestContext, spec: &DatasetSpec) -> Result<VerifyReport, IngestError> {
    let id = &spec.id;
    let metadata = if spec.requires_pagination {
        ctx.metadata.get(id, &spec.storage_key).await?
    } else {
        None
    };

    let status = match &metadata {
        None => VerifyStatus::Unknown {
            artifact_exists: ctx.store.head(&spec.storage_key).await?.is_some(),
        },
        Some(meta) if !meta.completed => VerifyStatus::Incomplete {
            last_page: meta.last_page,
        },
        Some(meta) => probe_completed(ctx, spec, meta.last_page).await,
    };

    match &status {
        VerifyStatus::Shrunk { .. } | VerifyStatus::Failed { .. } => {
            log::warn!("[{id}] {status}");
        }
        _ => log::info!("[{id}] {status}"),
    }

    Ok(VerifyReport {
        dataset_id: id.clone(),
        status,
        metadata,
    })
}

async fn probe_completed(ctx: &IngestContext, spec: &DatasetSpec, last_page: u32) -> VerifyStatus {
    if last_page > 0 {
        match probe(ctx, spec, last_page).await {
            FetchOutcome::Success(_) => {}
            FetchOutcome::EmptyTerminator => return VerifyStatus::Shrunk { last_page },
            other => return failed(last_page, &other),
        }
    }

    if last_page >= spec.max_pages {
        return VerifyStatus::Current;
    }

    let next_page = last_page + 1;
    match probe(ctx, spec, next_page).await {
        FetchOutcome::EmptyTerminator => VerifyStatus::Current,
        FetchOutcome::Success(_) => VerifyStatus::NewData { next_page },
        other => failed(next_page, &other),
    }
}

async fn probe(ctx: &IngestContext, spec: &DatasetSpec, page: u32) -> FetchOutcome {
    if ctx.cancel.is_cancelled() {
        return FetchOutcome::Cancelled;
    }
    let params = spec.page_params(page);
    ctx.source
        .fetch(&FetchRequest {
            url: &spec.url,
            params: &params,
            page_index: page,
            records_path: spec.records_path.as_deref(),
            label: &spec.id,
        })
        .await
}

fn failed(page: u32, outcome: &FetchOutcome) -> VerifyStatus {
    VerifyStatus::Failed {
        message: format!(
            "page {page}: {}",
            outcome
                .failure_message()
                .unwrap_or_else(|| outcome.label().to_string())
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use bronze_storage::{MemoryStore, metadata_key};
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::progress::null_progress;
    use crate::test_helpers::{ScriptedSource, exhausted, paginated_spec, single_spec};

    fn setup(
        source: &Arc<ScriptedSource>,
        meta: Option<ResumptionMetadata>,
        artifact: bool,
    ) -> (IngestContext, Arc<MemoryStore>, DatasetSpec) {
        let store = Arc::new(MemoryStore::new());
        let spec = paginated_spec("transfers", 1000);
        if let Some(meta) = meta {
            store.seed(
                &metadata_key(&spec.storage_key),
                &serde_json::to_vec(&meta).unwrap(),
            );
        }
        if artifact {
            store.seed(&spec.storage_key, b"[]");
        }
        let ctx = IngestContext::new(
            source.clone(),
            store.clone(),
            null_progress(),
            CancellationToken::new(),
        );
        (ctx, store, spec)
    }

    #[tokio::test]
    async fn completed_dataset_with_empty_next_page_is_current() {
        let source = Arc::new(ScriptedSource::with_boundary(5, 3));
        let meta = ResumptionMetadata::now("transfers", 5, 15, true);
        let (ctx, store, spec) = setup(&source, Some(meta), true);

        let report = verify(&ctx, &spec).await.unwrap();

        assert_eq!(report.status, VerifyStatus::Current);
        assert_eq!(source.fetched(), vec![5, 6]);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn new_data_is_reported() {
        let source = Arc::new(ScriptedSource::with_boundary(7, 3));
        let meta = ResumptionMetadata::now("transfers", 5, 15, true);
        let (ctx, _, spec) = setup(&source, Some(meta), true);

        let report = verify(&ctx, &spec).await.unwrap();

        assert_eq!(report.status, VerifyStatus::NewData { next_page: 6 });
    }

    #[tokio::test]
    async fn shrinking_upstream_is_flagged_not_repaired() {
        let source = Arc::new(ScriptedSource::with_boundary(3, 3));
        let meta = ResumptionMetadata::now("transfers", 5, 15, true);
        let (ctx, store, spec) = setup(&source, Some(meta), true);

        let report = verify(&ctx, &spec).await.unwrap();

        assert_eq!(report.status, VerifyStatus::Shrunk { last_page: 5 });
        assert_eq!(source.fetched(), vec![5]);
        assert_eq!(store.write_count(), 0);
    }

    #[tokio::test]
    async fn incomplete_and_unknown_need_no_fetch() {
        let source = Arc::new(ScriptedSource::with_boundary(3, 3));
        let meta = ResumptionMetadata::now("transfers", 2, 6, false);
        let (ctx, _, spec) = setup(&source, Some(meta), true);
        assert_eq!(
            verify(&ctx, &spec).await.unwrap().status,
            VerifyStatus::Incomplete { last_page: 2 }
        );

        let (ctx, _, spec) = setup(&source, None, true);
        assert_eq!(
            verify(&ctx, &spec).await.unwrap().status,
            VerifyStatus::Unknown {
                artifact_exists: true
            }
        );

        let report = verify(&ctx, &single_spec("states")).await.unwrap();
        assert_eq!(
            report.status,
            VerifyStatus::Unknown {
                artifact_exists: false
            }
        );
        assert!(source.fetched().is_empty());
    }

    #[tokio::test]
    async fn failed_probe_is_reported() {
        let source = Arc::new(ScriptedSource::with_boundary(5, 3));
        source.fail_once(6, exhausted());
        let meta = ResumptionMetadata::now("transfers", 5, 15, true);
        let (ctx, _, spec) = setup(&source, Some(meta), true);

        let status = verify(&ctx, &spec).await.unwrap().status;

        assert!(matches!(status, VerifyStatus::Failed { ref message } if message.starts_with("page 6")));
    }
}
