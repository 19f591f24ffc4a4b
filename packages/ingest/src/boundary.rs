//! Last-page discovery for datasets with an artifact but no metadata.
//!
//! Two phases:
//!
//! 1. **Exponential probe** of pages 1, 2, 4, 8, … until a page comes back
//!    empty or the `max_pages` ceiling is reached (the ceiling itself is
//!    probed when doubling would overshoot it). This brackets the
//!    boundary between the last non-empty probe `lo` and the first empty
//!    probe `hi`.
//! 2. **Binary search** inside `(lo, hi)` until the two are adjacent.
//!
//! Only [`FetchOutcome::EmptyTerminator`] counts as "no data". Any failed
//! probe aborts the search: the fetcher has already spent its own retry
//! budget, and reading a failure as emptiness would truncate the dataset.

use bronze_fetch::{FetchRequest, PageSource};
use bronze_ingest_models::{DatasetSpec, FetchOutcome};

/// Result of a boundary search.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Boundary {
    /// Highest page with data (0 when page 1 is empty).
    pub last_page: u32,
    /// First page observed empty, if any. `None` when `last_page` is the
    /// `max_pages` ceiling.
    pub first_empty: Option<u32>,
    /// Number of pages fetched by the search.
    pub probes: u32,
}

impl Boundary {
    /// Whether the boundary sits at the `max_pages` ceiling.
    #[must_use]
    pub const fn at_ceiling(&self) -> bool {
        self.first_empty.is_none()
    }
}

/// A probe failed for a reason other than an empty page.
#[derive(Debug, Clone, thiserror::Error)]
#[error("boundary probe of page {page} failed: {message}")]
pub struct BoundaryError {
    /// Page being probed.
    pub page: u32,
    /// The outcome that stopped the search.
    pub outcome: FetchOutcome,
    /// Human-readable cause.
    pub message: String,
}

/// Finds the last non-empty page of one dataset.
pub struct BoundarySearch<'a> {
    source: &'a dyn PageSource,
    spec: &'a DatasetSpec,
    probes: u32,
}

impl<'a> BoundarySearch<'a> {
    /// Creates a search over `spec` fetching through `source`.
    #[must_use]
    pub fn new(source: &'a dyn PageSource, spec: &'a DatasetSpec) -> Self {
        Self {
            source,
            spec,
            probes: 0,
        }
    }

    /// Runs the search.
    ///
    /// # Errors
    ///
    /// Returns [`BoundaryError`] when a probe ends in anything other than
    /// records or an empty page.
    pub async fn run(mut self) -> Result<Boundary, BoundaryError> {
        let spec = self.spec;
        let max_pages = spec.max_pages.max(1);
        let id = &spec.id;

        let mut lo = 0;
        let mut hi = None;
        let mut page = 1;

        loop {
            if self.probe(page).await? {
                lo = page;
                if page >= max_pages {
                    break;
                }
                page = page.saturating_mul(2).min(max_pages);
            } else {
                hi = Some(page);
                break;
            }
        }

        log::debug!(
            "[{id}] exponential probe bracketed boundary in ({lo}, {}] after {} probes",
            hi.map_or_else(|| "ceiling".to_string(), |h| h.to_string()),
            self.probes
        );

        let Some(mut hi) = hi else {
            log::warn!("[{id}] data continues up to the max_pages ceiling ({max_pages})");
            return Ok(Boundary {
                last_page: lo,
                first_empty: None,
                probes: self.probes,
            });
        };

        while lo + 1 < hi {
            let mid = lo + (hi - lo) / 2;
            if self.probe(mid).await? {
                lo = mid;
            } else {
                hi = mid;
            }
        }

        log::info!(
            "[{id}] reconstructed last page {lo} with {} probes",
            self.probes
        );

        Ok(Boundary {
            last_page: lo,
            first_empty: Some(hi),
            probes: self.probes,
        })
    }

    /// Fetches one page. `Ok(true)` if it has records, `Ok(false)` if it
    /// is empty.
    async fn probe(&mut self, page: u32) -> Result<bool, BoundaryError> {
        self.probes += 1;
        let params = self.spec.page_params(page);
        let outcome = self
            .source
            .fetch(&FetchRequest {
                url: &self.spec.url,
                params: &params,
                page_index: page,
                records_path: self.spec.records_path.as_deref(),
                label: &self.spec.id,
            })
            .await;

        match outcome {
            FetchOutcome::Success(_) => Ok(true),
            FetchOutcome::EmptyTerminator => Ok(false),
            other => Err(BoundaryError {
                page,
                message: other
                    .failure_message()
                    .unwrap_or_else(|| other.label().to_string()),
                outcome: other,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_helpers::{ScriptedSource, exhausted, paginated_spec};

    /// Exponential phase plus binary phase, each logarithmic in the
    /// bracket.
    fn probe_budget(boundary: u32, max_pages: u32) -> u32 {
        let log2 = |n: u32| 32 - n.leading_zeros();
        let bracket = (boundary + 1).min(max_pages);
        2 * log2(bracket) + 2
    }

    #[tokio::test]
    async fn converges_to_every_boundary() {
        let max_pages = 100;
        let spec = paginated_spec("sweep", max_pages);

        for boundary in 1..=max_pages {
            let source = ScriptedSource::with_boundary(boundary, 1);
            let result = BoundarySearch::new(&source, &spec).run().await.unwrap();

            assert_eq!(result.last_page, boundary, "boundary {boundary}");
            if boundary < max_pages {
                assert_eq!(result.first_empty, Some(boundary + 1));
            } else {
                assert!(result.at_ceiling());
            }
            assert!(
                result.probes <= probe_budget(boundary, max_pages),
                "boundary {boundary}: {} probes",
                result.probes
            );
            assert_eq!(result.probes as usize, source.fetched().len());
        }
    }

    #[tokio::test]
    async fn empty_dataset_has_boundary_zero() {
        let spec = paginated_spec("empty", 1000);
        let source = ScriptedSource::with_pages(&[]);

        let result = BoundarySearch::new(&source, &spec).run().await.unwrap();

        assert_eq!(result.last_page, 0);
        assert_eq!(result.first_empty, Some(1));
        assert_eq!(source.fetched(), vec![1]);
    }

    #[tokio::test]
    async fn probe_sequence_doubles_then_bisects() {
        let spec = paginated_spec("seq", 1000);
        let source = ScriptedSource::with_boundary(45, 1);

        BoundarySearch::new(&source, &spec).run().await.unwrap();

        assert_eq!(source.fetched(), vec![1, 2, 4, 8, 16, 32, 64, 48, 40, 44, 46, 45]);
    }

    #[tokio::test]
    async fn transient_error_is_not_emptiness() {
        let spec = paginated_spec("flaky", 1000);
        let source = ScriptedSource::with_boundary(45, 1);
        source.fail_once(32, exhausted());

        let err = BoundarySearch::new(&source, &spec).run().await.unwrap_err();

        assert_eq!(err.page, 32);
        assert!(matches!(err.outcome, FetchOutcome::TransientError { .. }));
    }

    #[tokio::test]
    async fn auth_failure_aborts_search() {
        let spec = paginated_spec("auth", 1000);
        let source = ScriptedSource::with_boundary(10, 1);
        source.fail_once(
            1,
            FetchOutcome::AuthFailure {
                status: 401,
                message: String::new(),
            },
        );

        let err = BoundarySearch::new(&source, &spec).run().await.unwrap_err();
        assert!(matches!(err.outcome, FetchOutcome::AuthFailure { .. }));
        assert_eq!(source.fetched(), vec![1]);
    }
}
