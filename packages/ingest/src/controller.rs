//! Per-dataset pagination state machine.
//!
//! ```text
//! Idle → DecidingStrategy → {FastPath | Reconstructing | ColdStart}
//!      → Paginating → Finalizing → {Completed | Failed}
//! ```
//!
//! Strategy, from the stored metadata and artifact:
//!
//! | Metadata | Artifact | Strategy |
//! |---|---|---|
//! | `completed = true` | yes | probe `last_page + 1`; empty → done, no writes |
//! | `completed = false` | yes | resume at `last_page + 1` |
//! | not matching the artifact | yes | cold start (a previous run died between writes) |
//! | present | no | cold start (metadata is stale) |
//! | absent | yes | reconstruct the boundary, resume after it |
//! | absent | no | cold start at page 1 |
//!
//! Pages are fetched strictly one after another. The artifact is written
//! only when its fingerprint differs from the stored one, and metadata
//! only when progress changed, so a run with nothing new writes nothing.

use bronze_fetch::FetchRequest;
use bronze_ingest_models::{
    AuditRecord, AuditStatus, ContentFingerprint, DatasetSpec, FetchOutcome, PageResult,
    ResumptionMetadata,
};
use chrono::Utc;

use crate::boundary::BoundarySearch;
use crate::merger::StreamMerger;
use crate::{IngestContext, IngestError};

/// Note recorded when a run found nothing new.
pub const ALREADY_CURRENT: &str = "already current";

/// Controller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    /// Not started.
    Idle,
    /// Reading metadata and choosing a strategy.
    DecidingStrategy,
    /// Resuming from trusted metadata.
    FastPath,
    /// Searching for the last page of an artifact without metadata.
    Reconstructing,
    /// Starting from page 1.
    ColdStart,
    /// Fetching pages.
    Paginating,
    /// Merging and persisting.
    Finalizing,
    /// Finished successfully.
    Completed,
    /// Finished with an error.
    Failed,
}

impl std::fmt::Display for ControllerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Why a run failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// 401/403 from the API.
    Auth,
    /// The run was cancelled.
    Cancelled,
    /// A page fetch failed after retries, or was rejected.
    Page,
    /// Nothing came back on a cold start.
    NoData,
    /// Upstream no longer matches the stored artifact.
    Ambiguous,
    /// Storage, scratch, or encoding failure.
    Internal,
}

impl FailureKind {
    /// Whether another attempt in a later round could succeed.
    #[must_use]
    pub const fn is_retryable(self) -> bool {
        !matches!(self, Self::Auth | Self::Cancelled)
    }
}

/// Outcome of one dataset run.
#[derive(Debug, Clone)]
pub struct RunReport {
    /// The audit record for this run.
    pub record: AuditRecord,
    /// Set when `record.status` is FAILED.
    pub failure: Option<FailureKind>,
    /// The dataset was confirmed current without fetching new pages.
    pub up_to_date: bool,
    /// The artifact was written to storage.
    pub artifact_written: bool,
    /// The metadata was written to storage.
    pub metadata_written: bool,
}

impl RunReport {
    /// Whether the run succeeded.
    #[must_use]
    pub fn succeeded(&self) -> bool {
        self.record.status == AuditStatus::Success
    }
}

enum Finish {
    Completed { note: Option<String> },
    Failed { kind: FailureKind, message: String },
}

enum Termination {
    /// Empty page or `max_pages` reached.
    Exhausted,
    /// A page failed; progress so far is kept.
    PageFailed(String),
    /// Stop without writing anything.
    Abort(Finish),
}

/// Drives one dataset from strategy selection to its audit record.
pub struct PaginationController<'a> {
    ctx: &'a IngestContext,
    spec: &'a DatasetSpec,
    state: ControllerState,
    pages_fetched: u32,
    records_fetched: u64,
    last_page: Option<u32>,
    warning: Option<String>,
    up_to_date: bool,
    artifact_written: bool,
    metadata_written: bool,
}

impl<'a> PaginationController<'a> {
    /// Creates an idle controller.
    #[must_use]
    pub const fn new(ctx: &'a IngestContext, spec: &'a DatasetSpec) -> Self {
        Self {
            ctx,
            spec,
            state: ControllerState::Idle,
            pages_fetched: 0,
            records_fetched: 0,
            last_page: None,
            warning: None,
            up_to_date: false,
            artifact_written: false,
            metadata_written: false,
        }
    }

    /// Current state.
    #[must_use]
    pub const fn state(&self) -> ControllerState {
        self.state
    }

    /// Runs the dataset to a terminal state.
    pub async fn run(&mut self) -> RunReport {
        let spec = self.spec;
        let id = &spec.id;
        let started_at = Utc::now();
        self.ctx.progress.dataset_started(id);

        let finish = match self.execute().await {
            Ok(finish) => finish,
            Err(e) => Finish::Failed {
                kind: FailureKind::Internal,
                message: e.to_string(),
            },
        };

        let (status, failure, error_message, note) = match finish {
            Finish::Completed { note } => {
                self.transition(ControllerState::Completed);
                log::info!(
                    "[{id}] ✅ completed: {} page(s), {} record(s) fetched{}",
                    self.pages_fetched,
                    self.records_fetched,
                    note.as_deref().map_or_else(String::new, |n| format!(" ({n})"))
                );
                (AuditStatus::Success, None, None, note)
            }
            Finish::Failed { kind, message } => {
                self.transition(ControllerState::Failed);
                log::error!("[{id}] ❌ failed: {message}");
                (AuditStatus::Failed, Some(kind), Some(message), None)
            }
        };

        self.ctx.progress.dataset_finished(id, status);

        RunReport {
            record: AuditRecord {
                dataset_id: id.clone(),
                started_at,
                finished_at: Utc::now(),
                status,
                pages_fetched: self.pages_fetched,
                records_fetched: self.records_fetched,
                storage_key: spec.storage_key.clone(),
                error_message,
                last_page: self.last_page,
                note,
                warning: self.warning.clone(),
                source_url: spec.url.clone(),
                params: self.ctx.redactor.params(&spec.params),
            },
            failure,
            up_to_date: self.up_to_date,
            artifact_written: self.artifact_written,
            metadata_written: self.metadata_written,
        }
    }

    fn transition(&mut self, next: ControllerState) {
        log::debug!("[{}] {} -> {next}", self.spec.id, self.state);
        self.state = next;
    }

    async fn execute(&mut self) -> Result<Finish, IngestError> {
        self.transition(ControllerState::DecidingStrategy);

        if !self.spec.requires_pagination {
            return self.single_fetch().await;
        }

        let spec = self.spec;
        let ctx = self.ctx;
        let id = &spec.id;

        let metadata = ctx.metadata.get(id, &spec.storage_key).await?;
        let stored = ctx.store.head(&spec.storage_key).await?;
        let mut merger = StreamMerger::new(ctx.scratch_dir.as_deref())?;

        let trusted = match (&metadata, &stored) {
            (Some(meta), Some(fingerprint)) => self.matches_artifact(meta, fingerprint).await?,
            _ => true,
        };

        let (start, known_empty) = match (&metadata, stored.is_some()) {
            (Some(meta), true) if !trusted => {
                let message = format!(
                    "metadata (last_page={}, total_records={}) does not describe the stored \
                     {}; refetching from page 1",
                    meta.last_page, meta.total_records, spec.storage_key
                );
                log::warn!("[{id}] {message}");
                self.warning = Some(message);
                self.transition(ControllerState::ColdStart);
                (1, None)
            }
            (Some(meta), true) if meta.completed => {
                self.transition(ControllerState::FastPath);
                self.last_page = Some(meta.last_page);

                if meta.last_page >= spec.max_pages {
                    log::info!(
                        "[{id}] already at the max_pages ceiling ({}), nothing to fetch",
                        spec.max_pages
                    );
                    self.up_to_date = true;
                    return Ok(Finish::Completed {
                        note: Some(ALREADY_CURRENT.to_string()),
                    });
                }

                let probe = meta.last_page + 1;
                log::info!(
                    "[{id}] 📋 {} page(s) previously fetched, checking page {probe} for new data",
                    meta.last_page
                );
                match self.fetch(probe).await {
                    FetchOutcome::EmptyTerminator => {
                        log::info!("[{id}] ✓ up to date (page {probe} is empty)");
                        self.up_to_date = true;
                        return Ok(Finish::Completed {
                            note: Some(ALREADY_CURRENT.to_string()),
                        });
                    }
                    FetchOutcome::Success(page) => {
                        log::info!("[{id}] 🆕 new data at page {probe}, fetching new pages only");
                        self.seed(&mut merger).await?;
                        self.accept(&mut merger, &page).await?;
                        (probe + 1, None)
                    }
                    other => return Ok(Self::failure(other)),
                }
            }
            (Some(meta), true) => {
                self.transition(ControllerState::FastPath);
                log::info!(
                    "[{id}] 📋 previous run stopped after page {}, resuming at page {}",
                    meta.last_page,
                    meta.last_page + 1
                );
                self.last_page = Some(meta.last_page);
                self.seed(&mut merger).await?;
                (meta.last_page + 1, None)
            }
            (Some(_), false) => {
                log::warn!(
                    "[{id}] metadata exists but artifact {} is missing, starting over",
                    spec.storage_key
                );
                self.transition(ControllerState::ColdStart);
                (1, None)
            }
            (None, true) => {
                self.transition(ControllerState::Reconstructing);
                log::info!("[{id}] 🔍 artifact exists without metadata, reconstructing last page");

                let boundary = match BoundarySearch::new(ctx.source.as_ref(), spec).run().await {
                    Ok(boundary) => boundary,
                    Err(e) => {
                        return Ok(Finish::Failed {
                            kind: failure_kind(&e.outcome),
                            message: e.to_string(),
                        });
                    }
                };

                if boundary.last_page == 0 {
                    let message = format!(
                        "upstream returned no data on page 1 but {} exists; \
                         refusing to replace it (reconstruction ambiguous)",
                        spec.storage_key
                    );
                    self.warning = Some(message.clone());
                    return Ok(Finish::Failed {
                        kind: FailureKind::Ambiguous,
                        message,
                    });
                }

                if boundary.at_ceiling() {
                    let message = format!(
                        "data continues up to the max_pages ceiling ({}); \
                         treating it as the last page (reconstruction ambiguous)",
                        spec.max_pages
                    );
                    log::warn!("[{id}] {message}");
                    self.warning = Some(message);
                }

                self.last_page = Some(boundary.last_page);
                let seeded = self.seed(&mut merger).await?;
                if spec.page_size_param.is_some() {
                    let minimum = u64::from(boundary.last_page - 1) * u64::from(spec.page_size) + 1;
                    if seeded < minimum {
                        let message = format!(
                            "artifact holds {seeded} records but {} full page(s) of {} \
                             should precede page {}; it may be incomplete",
                            boundary.last_page - 1,
                            spec.page_size,
                            boundary.last_page
                        );
                        log::warn!("[{id}] {message}");
                        self.warning = Some(message);
                    }
                }
                (boundary.last_page + 1, boundary.first_empty)
            }
            (None, false) => {
                self.transition(ControllerState::ColdStart);
                log::info!("[{id}] 📋 no existing metadata, starting at page 1");
                (1, None)
            }
        };

        self.transition(ControllerState::Paginating);
        let termination = self.paginate(&mut merger, start, known_empty).await?;

        let completed = match termination {
            Termination::Abort(finish) => return Ok(finish),
            Termination::Exhausted => true,
            Termination::PageFailed(_) => false,
        };

        if merger.total_records() == 0 {
            return Ok(match termination {
                Termination::PageFailed(message) => Finish::Failed {
                    kind: FailureKind::Page,
                    message,
                },
                _ => Finish::Failed {
                    kind: FailureKind::NoData,
                    message: "no data returned".to_string(),
                },
            });
        }

        if ctx.cancel.is_cancelled() {
            return Ok(Self::failure(FetchOutcome::Cancelled));
        }

        self.transition(ControllerState::Finalizing);
        log::info!(
            "[{id}] 📦 merging {} record(s) ({} new)",
            merger.total_records(),
            merger.appended_records()
        );
        let artifact = merger.finalize().await?;
        self.store_artifact(&artifact, stored.as_ref()).await?;

        let updated =
            ResumptionMetadata::now(id, self.last_page.unwrap_or(0), artifact.records, completed)
                .with_fingerprint(artifact.fingerprint.clone());
        if metadata
            .as_ref()
            .is_some_and(|previous| previous.same_progress(&updated))
        {
            log::debug!("[{id}] metadata unchanged");
        } else {
            ctx.metadata.put(&spec.storage_key, &updated).await?;
            self.metadata_written = true;
            log::info!(
                "[{id}] 💾 metadata: last_page={} total_records={} completed={completed}",
                updated.last_page,
                updated.total_records
            );
        }

        Ok(match termination {
            Termination::PageFailed(message) => Finish::Failed {
                kind: FailureKind::Page,
                message,
            },
            _ => Finish::Completed {
                note: (!self.artifact_written && !self.metadata_written)
                    .then(|| ALREADY_CURRENT.to_string())
                    .or_else(|| {
                        (metadata.is_none() && stored.is_some() && self.metadata_written)
                            .then(|| "metadata reconstructed".to_string())
                    }),
            },
        })
    }

    /// Fetch-compare-write cycle for non-paginated datasets. No metadata.
    async fn single_fetch(&mut self) -> Result<Finish, IngestError> {
        let spec = self.spec;
        let ctx = self.ctx;
        let id = &spec.id;

        let stored = ctx.store.head(&spec.storage_key).await?;
        if spec.fast_skip_if_exists && stored.is_some() {
            log::info!("[{id}] ⏭️ {} exists, fast skip", spec.storage_key);
            self.up_to_date = true;
            return Ok(Finish::Completed {
                note: Some(format!("{ALREADY_CURRENT} (artifact exists)")),
            });
        }

        self.transition(ControllerState::ColdStart);
        self.transition(ControllerState::Paginating);
        let mut merger = StreamMerger::new(ctx.scratch_dir.as_deref())?;

        match self.fetch(1).await {
            FetchOutcome::Success(page) => self.accept(&mut merger, &page).await?,
            FetchOutcome::EmptyTerminator => {
                return Ok(Finish::Failed {
                    kind: FailureKind::NoData,
                    message: "no data returned".to_string(),
                });
            }
            other => return Ok(Self::failure(other)),
        }

        if ctx.cancel.is_cancelled() {
            return Ok(Self::failure(FetchOutcome::Cancelled));
        }

        self.transition(ControllerState::Finalizing);
        let artifact = merger.finalize().await?;
        self.store_artifact(&artifact, stored.as_ref()).await?;

        if self.artifact_written {
            Ok(Finish::Completed { note: None })
        } else {
            self.up_to_date = true;
            Ok(Finish::Completed {
                note: Some(ALREADY_CURRENT.to_string()),
            })
        }
    }

    async fn paginate(
        &mut self,
        merger: &mut StreamMerger,
        start: u32,
        known_empty: Option<u32>,
    ) -> Result<Termination, IngestError> {
        let spec = self.spec;
        let id = &spec.id;
        let max_pages = spec.max_pages;
        let mut page = start;

        loop {
            if page > max_pages {
                log::warn!("[{id}] 🛑 reached max_pages ({max_pages}), stopping");
                return Ok(Termination::Exhausted);
            }
            if known_empty == Some(page) {
                log::info!("[{id}] ✓ page {page} already known empty, pagination complete");
                return Ok(Termination::Exhausted);
            }

            match self.fetch(page).await {
                FetchOutcome::Success(result) => {
                    self.accept(merger, &result).await?;
                    page += 1;
                }
                FetchOutcome::EmptyTerminator => {
                    log::info!("[{id}] ✓ page {page} is empty, pagination complete");
                    return Ok(Termination::Exhausted);
                }
                outcome @ (FetchOutcome::AuthFailure { .. } | FetchOutcome::Cancelled) => {
                    return Ok(Termination::Abort(Self::failure(outcome)));
                }
                other => {
                    let message = format!(
                        "page {page}: {}",
                        other
                            .failure_message()
                            .unwrap_or_else(|| other.label().to_string())
                    );
                    log::warn!("[{id}] ⚠️ stopping at {message}, keeping pages before it");
                    return Ok(Termination::PageFailed(message));
                }
            }
        }
    }

    /// Whether `meta` describes the artifact currently stored.
    ///
    /// Sidecars carrying a fingerprint are compared against it; older ones
    /// fall back to the artifact's record count.
    async fn matches_artifact(
        &self,
        meta: &ResumptionMetadata,
        stored: &ContentFingerprint,
    ) -> Result<bool, IngestError> {
        if let Some(expected) = &meta.artifact_fingerprint {
            return Ok(expected == stored);
        }

        let key = &self.spec.storage_key;
        let Some(bytes) = self.ctx.store.read(key).await? else {
            return Ok(false);
        };
        let records: Vec<serde::de::IgnoredAny> =
            serde_json::from_slice(&bytes).map_err(|source| IngestError::CorruptArtifact {
                key: key.clone(),
                source,
            })?;
        Ok(records.len() as u64 == meta.total_records)
    }

    async fn fetch(&self, page: u32) -> FetchOutcome {
        if self.ctx.cancel.is_cancelled() {
            return FetchOutcome::Cancelled;
        }

        let spec = self.spec;
        log::info!(
            "[{}] 📄 fetching page {page} (total so far: {} records)",
            spec.id,
            self.records_fetched
        );
        let params = spec.page_params(page);
        self.ctx
            .source
            .fetch(&FetchRequest {
                url: &spec.url,
                params: &params,
                page_index: page,
                records_path: spec.records_path.as_deref(),
                label: &spec.id,
            })
            .await
    }

    async fn accept(
        &mut self,
        merger: &mut StreamMerger,
        page: &PageResult,
    ) -> Result<(), IngestError> {
        merger.append(page).await?;
        self.pages_fetched += 1;
        self.records_fetched += page.len() as u64;
        self.last_page = Some(page.page_index);
        log::info!(
            "[{}]   → collected {} records (total: {})",
            self.spec.id,
            page.len(),
            self.records_fetched
        );
        self.ctx
            .progress
            .page_fetched(&self.spec.id, page.page_index, self.records_fetched);
        Ok(())
    }

    /// Loads the stored artifact into the merger.
    async fn seed(&self, merger: &mut StreamMerger) -> Result<u64, IngestError> {
        let key = &self.spec.storage_key;
        match self.ctx.store.read(key).await? {
            Some(bytes) => merger.seed(key, &bytes).await,
            None => {
                log::warn!("[{}] {key} disappeared before it could be read", self.spec.id);
                Ok(0)
            }
        }
    }

    async fn store_artifact(
        &mut self,
        artifact: &crate::merger::Artifact,
        stored: Option<&ContentFingerprint>,
    ) -> Result<(), IngestError> {
        let spec = self.spec;
        let key = &spec.storage_key;
        if stored == Some(&artifact.fingerprint) {
            log::info!(
                "[{}] ⏭️ {key} already matches the stored version ({})",
                spec.id,
                artifact.fingerprint
            );
            return Ok(());
        }

        let bytes = artifact.read_bytes().await?;
        self.ctx.store.write(key, &bytes).await?;
        self.artifact_written = true;
        log::info!(
            "[{}] ✅ landed {key} ({} records, {} bytes)",
            spec.id,
            artifact.records,
            artifact.bytes
        );
        Ok(())
    }

    fn failure(outcome: FetchOutcome) -> Finish {
        Finish::Failed {
            kind: failure_kind(&outcome),
            message: outcome
                .failure_message()
                .unwrap_or_else(|| outcome.label().to_string()),
        }
    }
}

const fn failure_kind(outcome: &FetchOutcome) -> FailureKind {
    match outcome {
        FetchOutcome::AuthFailure { .. } => FailureKind::Auth,
        FetchOutcome::Cancelled => FailureKind::Cancelled,
        _ => FailureKind::Page,
    }
}
