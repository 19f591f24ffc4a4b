//! Runs a whole catalog: selection, concurrency, retry rounds, audit.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use bronze_ingest_models::{AuditRecord, AuditStatus, DatasetSpec};
use chrono::Utc;
use futures::StreamExt;

use crate::audit::AuditSink;
use crate::config::CatalogDataset;
use crate::controller::{ALREADY_CURRENT, PaginationController, RunReport};
use crate::skip_cache::SkipMarkerCache;
use crate::{IngestContext, IngestError};

/// Final outcome of [`Runner::run_all`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RunSummary {
    /// Datasets whose last attempt succeeded.
    pub succeeded: Vec<String>,
    /// Datasets whose last attempt failed.
    pub failed: Vec<String>,
    /// Datasets that were not attempted.
    pub skipped: Vec<String>,
    /// Records fetched across every attempt.
    pub records: u64,
}

impl RunSummary {
    /// Whether any dataset ended FAILED.
    #[must_use]
    pub fn has_failures(&self) -> bool {
        !self.failed.is_empty()
    }

    /// One-line summary for logs.
    #[must_use]
    pub fn describe(&self) -> String {
        let mut line = format!(
            "{} succeeded, {} failed, {} skipped, {} record(s) fetched",
            self.succeeded.len(),
            self.failed.len(),
            self.skipped.len(),
            self.records
        );
        if self.has_failures() {
            line.push_str(&format!(" (failed: {})", self.failed.join(", ")));
        }
        line
    }
}

/// Drives many datasets against one shared [`IngestContext`].
pub struct Runner {
    ctx: IngestContext,
    audit: Arc<dyn AuditSink>,
    skip_cache: Option<SkipMarkerCache>,
    retry_rounds: u32,
    jobs: usize,
}

impl Runner {
    /// Sequential runner without retry rounds or skip cache.
    #[must_use]
    pub fn new(ctx: IngestContext, audit: Arc<dyn AuditSink>) -> Self {
        Self {
            ctx,
            audit,
            skip_cache: None,
            retry_rounds: 0,
            jobs: 1,
        }
    }

    /// Enables the skip-marker cache.
    #[must_use]
    pub fn with_skip_cache(mut self, cache: Option<SkipMarkerCache>) -> Self {
        self.skip_cache = cache;
        self
    }

    /// Additional rounds for failed datasets.
    #[must_use]
    pub const fn with_retry_rounds(mut self, rounds: u32) -> Self {
        self.retry_rounds = rounds;
        self
    }

    /// Maximum datasets in flight at once.
    #[must_use]
    pub fn with_jobs(mut self, jobs: usize) -> Self {
        self.jobs = jobs.max(1);
        self
    }

    /// The shared context.
    #[must_use]
    pub const fn context(&self) -> &IngestContext {
        &self.ctx
    }

    /// Runs every enabled dataset selected by `filter` (all when `None`).
    ///
    /// Every attempt appends one audit record, including SKIPPED records
    /// for datasets that were excluded.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Audit`] if an audit record cannot be
    /// written. Datasets already in flight are still run to completion
    /// first. Dataset failures are reported in the summary, not as
    /// errors.
    pub async fn run_all(
        &self,
        datasets: &[CatalogDataset],
        filter: Option<&[String]>,
    ) -> Result<RunSummary, IngestError> {
        let selected: Option<BTreeSet<&str>> =
            filter.map(|names| names.iter().map(String::as_str).collect());

        if let Some(selected) = &selected {
            for name in selected {
                if !datasets.iter().any(|d| d.spec.id == *name) {
                    log::warn!("unknown dataset '{name}' requested, ignoring");
                }
            }
        }

        let mut summary = RunSummary::default();
        let mut pending = Vec::new();

        for dataset in datasets {
            let spec = &dataset.spec;
            let reason = if !dataset.enabled {
                Some("disabled in catalog")
            } else if selected
                .as_ref()
                .is_some_and(|s| !s.contains(spec.id.as_str()))
            {
                Some("not selected")
            } else {
                None
            };

            if let Some(reason) = reason {
                log::debug!("[{}] skipped: {reason}", spec.id);
                let record = self.record(spec, AuditStatus::Skipped, Some(reason));
                self.audit.append(&record).await?;
                summary.skipped.push(spec.id.clone());
            } else {
                pending.push(spec);
            }
        }

        log::info!(
            "🚀 ingesting {} dataset(s) ({} skipped, {} job(s))",
            pending.len(),
            summary.skipped.len(),
            self.jobs
        );

        let mut outcomes: BTreeMap<String, AuditStatus> = BTreeMap::new();
        let mut round = 0;

        while !pending.is_empty() {
            if round > 0 {
                log::info!(
                    "🔁 retry round {round}/{}: {} dataset(s)",
                    self.retry_rounds,
                    pending.len()
                );
            }
            self.ctx.progress.datasets_planned(pending.len() as u64);

            let mut retry = Vec::new();
            let mut audit_error = None;
            let mut reports = futures::stream::iter(pending.iter().copied())
                .map(|spec| async move { (spec, self.run_one(spec).await) })
                .buffer_unordered(self.jobs);

            while let Some((spec, report)) = reports.next().await {
                if let Err(e) = self.audit.append(&report.record).await {
                    log::error!("[{}] audit record not written: {e}", spec.id);
                    audit_error.get_or_insert(e);
                }
                summary.records += report.record.records_fetched;
                outcomes.insert(spec.id.clone(), report.record.status);

                if let Some(kind) = report.failure
                    && kind.is_retryable()
                {
                    retry.push(spec);
                }
            }
            drop(reports);

            if let Some(e) = audit_error {
                return Err(e.into());
            }

            round += 1;
            if round > self.retry_rounds || self.ctx.cancel.is_cancelled() {
                break;
            }
            pending = retry;
        }

        for (id, status) in outcomes {
            if status == AuditStatus::Success {
                summary.succeeded.push(id);
            } else {
                summary.failed.push(id);
            }
        }

        let line = summary.describe();
        if summary.has_failures() {
            log::warn!("🏁 ingestion finished: {line}");
        } else {
            log::info!("🏁 ingestion finished: {line}");
        }
        self.ctx.progress.run_finished(&line);

        Ok(summary)
    }

    /// Runs one dataset, honouring the skip-marker cache.
    pub async fn run_one(&self, spec: &DatasetSpec) -> RunReport {
        let key = &spec.storage_key;

        if let Some(cache) = &self.skip_cache
            && cache.is_fresh(key).await
        {
            log::info!("[{}] ⏭️ confirmed current recently, skipping fetch", spec.id);
            self.ctx.progress.dataset_started(&spec.id);
            self.ctx
                .progress
                .dataset_finished(&spec.id, AuditStatus::Success);
            return RunReport {
                record: self.record(
                    spec,
                    AuditStatus::Success,
                    Some(&format!("{ALREADY_CURRENT} (skip marker)")),
                ),
                failure: None,
                up_to_date: true,
                artifact_written: false,
                metadata_written: false,
            };
        }

        let report = PaginationController::new(&self.ctx, spec).run().await;

        if let Some(cache) = &self.skip_cache {
            if report.up_to_date {
                cache.mark_up_to_date(key).await;
            } else if report.artifact_written || report.metadata_written {
                cache.clear(key).await;
            }
        }

        report
    }

    fn record(&self, spec: &DatasetSpec, status: AuditStatus, note: Option<&str>) -> AuditRecord {
        let now = Utc::now();
        AuditRecord {
            dataset_id: spec.id.clone(),
            started_at: now,
            finished_at: now,
            status,
            pages_fetched: 0,
            records_fetched: 0,
            storage_key: spec.storage_key.clone(),
            error_message: None,
            last_page: None,
            note: note.map(str::to_string),
            warning: None,
            source_url: spec.url.clone(),
            params: self.ctx.redactor.params(&spec.params),
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use bronze_ingest_models::FetchOutcome;
    use bronze_storage::MemoryStore;
    use tokio_util::sync::CancellationToken;

    use super::*;
    use crate::audit::{AuditError, AuditLog, read_records};
    use crate::progress::null_progress;
    use crate::test_helpers::{ScriptedSource, exhausted, paginated_spec};

    /// Fails the first `failures` appends, then records like [`MemoryAudit`].
    struct FailingAudit {
        failures: Mutex<usize>,
        inner: MemoryAudit,
    }

    #[async_trait]
    impl AuditSink for FailingAudit {
        async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
            {
                let mut failures = self.failures.lock().unwrap();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(AuditError::Io {
                        path: "audit.jsonl".into(),
                        source: std::io::Error::other("disk full"),
                    });
                }
            }
            self.inner.append(record).await
        }
    }

    #[derive(Default)]
    struct MemoryAudit(Mutex<Vec<AuditRecord>>);

    #[async_trait]
    impl AuditSink for MemoryAudit {
        async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
            self.0.lock().unwrap().push(record.clone());
            Ok(())
        }
    }

    impl MemoryAudit {
        fn statuses(&self, id: &str) -> Vec<AuditStatus> {
            self.0
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.dataset_id == id)
                .map(|r| r.status)
                .collect()
        }
    }

    fn catalog(ids: &[&str]) -> Vec<CatalogDataset> {
        ids.iter()
            .map(|id| CatalogDataset {
                spec: paginated_spec(id, 1000),
                enabled: true,
            })
            .collect()
    }

    fn runner(source: &Arc<ScriptedSource>, audit: &Arc<MemoryAudit>) -> Runner {
        let ctx = IngestContext::new(
            source.clone(),
            Arc::new(MemoryStore::new()),
            null_progress(),
            CancellationToken::new(),
        );
        Runner::new(ctx, audit.clone())
    }

    #[tokio::test]
    async fn excluded_datasets_are_skipped_without_fetching() {
        let source = Arc::new(ScriptedSource::with_pages(&[3]));
        let audit = Arc::new(MemoryAudit::default());
        let mut datasets = catalog(&["a", "b", "c"]);
        datasets[1].enabled = false;

        let filter = vec!["a".to_string(), "b".to_string(), "nope".to_string()];
        let summary = runner(&source, &audit)
            .run_all(&datasets, Some(&filter))
            .await
            .unwrap();

        assert_eq!(summary.succeeded, vec!["a"]);
        assert_eq!(summary.skipped, vec!["b", "c"]);
        assert!(!summary.has_failures());
        assert_eq!(source.fetched(), vec![1, 2]);
        assert_eq!(audit.statuses("b"), vec![AuditStatus::Skipped]);
        assert_eq!(audit.statuses("c"), vec![AuditStatus::Skipped]);
    }

    #[tokio::test]
    async fn failed_dataset_is_retried_in_next_round() {
        let source = Arc::new(ScriptedSource::with_pages(&[3]));
        source.fail_once(1, exhausted());
        let audit = Arc::new(MemoryAudit::default());

        let summary = runner(&source, &audit)
            .with_retry_rounds(2)
            .run_all(&catalog(&["a"]), None)
            .await
            .unwrap();

        assert_eq!(summary.succeeded, vec!["a"]);
        assert_eq!(
            audit.statuses("a"),
            vec![AuditStatus::Failed, AuditStatus::Success]
        );
        assert_eq!(summary.records, 3);
    }

    #[tokio::test]
    async fn retry_rounds_are_bounded() {
        let source = Arc::new(ScriptedSource::with_pages(&[3]));
        source.always(1, exhausted());
        let audit = Arc::new(MemoryAudit::default());

        let summary = runner(&source, &audit)
            .with_retry_rounds(2)
            .run_all(&catalog(&["a"]), None)
            .await
            .unwrap();

        assert_eq!(summary.failed, vec!["a"]);
        assert_eq!(audit.statuses("a").len(), 3);
        assert!(summary.describe().contains("failed: a"));
    }

    #[tokio::test]
    async fn auth_failure_is_not_retried_and_does_not_stop_others() {
        let source = Arc::new(ScriptedSource::with_pages(&[3]));
        let audit = Arc::new(MemoryAudit::default());
        let runner = runner(&source, &audit).with_retry_rounds(2);

        let datasets = catalog(&["locked", "open"]);
        source.fail_once(
            1,
            FetchOutcome::AuthFailure {
                status: 403,
                message: "forbidden".to_string(),
            },
        );

        let summary = runner.run_all(&datasets, None).await.unwrap();

        assert_eq!(summary.failed, vec!["locked"]);
        assert_eq!(summary.succeeded, vec!["open"]);
        assert_eq!(audit.statuses("locked"), vec![AuditStatus::Failed]);
    }

    #[tokio::test]
    async fn concurrent_jobs_each_get_one_record() {
        let source = Arc::new(ScriptedSource::with_pages(&[2, 2]));
        let audit = Arc::new(MemoryAudit::default());
        let ids = ["a", "b", "c", "d"];

        let summary = runner(&source, &audit)
            .with_jobs(4)
            .run_all(&catalog(&ids), None)
            .await
            .unwrap();

        assert_eq!(summary.succeeded, ids);
        assert_eq!(summary.records, 16);
        for id in ids {
            assert_eq!(audit.statuses(id), vec![AuditStatus::Success]);
        }
    }

    #[tokio::test]
    async fn cancelled_run_is_not_retried() {
        let source = Arc::new(ScriptedSource::with_pages(&[2]));
        let audit = Arc::new(MemoryAudit::default());
        let runner = runner(&source, &audit).with_retry_rounds(2);
        runner.context().cancel.cancel();

        let summary = runner.run_all(&catalog(&["a"]), None).await.unwrap();

        assert_eq!(summary.failed, vec!["a"]);
        assert_eq!(audit.statuses("a"), vec![AuditStatus::Failed]);
        assert!(source.fetched().is_empty());
    }

    #[tokio::test]
    async fn skip_marker_short_circuits_current_dataset() {
        let dir = tempfile::tempdir().unwrap();
        let source = Arc::new(ScriptedSource::with_pages(&[2]));
        let audit = Arc::new(MemoryAudit::default());
        let cache = SkipMarkerCache::new(dir.path(), Duration::from_secs(300));
        let runner = runner(&source, &audit).with_skip_cache(cache);
        let datasets = catalog(&["a"]);

        runner.run_all(&datasets, None).await.unwrap();
        runner.run_all(&datasets, None).await.unwrap();
        source.reset_fetched();
        runner.run_all(&datasets, None).await.unwrap();

        assert!(source.fetched().is_empty());
        let notes: Vec<_> = audit
            .0
            .lock()
            .unwrap()
            .iter()
            .map(|r| r.note.clone())
            .collect();
        assert_eq!(notes[2].as_deref(), Some("already current (skip marker)"));
    }

    #[tokio::test]
    async fn audit_log_receives_every_attempt() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("logs/audit.jsonl");
        let log = Arc::new(AuditLog::open(&path).await.unwrap());
        let source = Arc::new(ScriptedSource::with_pages(&[1]));
        let ctx = IngestContext::new(
            source.clone(),
            Arc::new(MemoryStore::new()),
            null_progress(),
            CancellationToken::new(),
        );
        let mut datasets = catalog(&["a", "b"]);
        datasets[1].enabled = false;

        Runner::new(ctx, log).run_all(&datasets, None).await.unwrap();

        let records = read_records(&path).await.unwrap();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].status, AuditStatus::Skipped);
        assert_eq!(records[1].status, AuditStatus::Success);
    }

    #[tokio::test]
    async fn audit_failure_lets_in_flight_datasets_finish() {
        let source = Arc::new(ScriptedSource::with_pages(&[2, 2]));
        let audit = Arc::new(FailingAudit {
            failures: Mutex::new(1),
            inner: MemoryAudit::default(),
        });
        let ctx = IngestContext::new(
            source.clone(),
            Arc::new(MemoryStore::new()),
            null_progress(),
            CancellationToken::new(),
        );
        let runner = Runner::new(ctx, audit.clone())
            .with_jobs(3)
            .with_retry_rounds(2);
        let datasets = catalog(&["a", "b", "c"]);

        let result = runner.run_all(&datasets, None).await;

        assert!(matches!(result, Err(IngestError::Audit(_))));
        assert_eq!(audit.inner.0.lock().unwrap().len(), 2);
        for dataset in &datasets {
            let spec = &dataset.spec;
            let meta = runner
                .context()
                .metadata
                .get(&spec.id, &spec.storage_key)
                .await
                .unwrap()
                .unwrap();
            assert_eq!((meta.last_page, meta.total_records, meta.completed), (2, 4, true));
        }
    }
}
