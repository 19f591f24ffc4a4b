#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Dataset, resumption, page, and audit types shared by the bronze
//! ingestion engine.
//!
//! Everything here is plain data. The fetcher produces [`FetchOutcome`]s,
//! the controller turns them into [`ResumptionMetadata`] and
//! [`AuditRecord`]s, and storage compares artifacts by
//! [`ContentFingerprint`].

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

// ── Dataset description ──────────────────────────────────────────────────

/// One unit of ingestion work, resolved from the catalog.
///
/// Immutable for the duration of a run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetSpec {
    /// Unique dataset identifier (e.g. `"federal_transfers_2024_03"`).
    pub id: String,
    /// Fully resolved endpoint URL (base URL + endpoint path).
    pub url: String,
    /// Base query parameters sent with every request.
    pub params: BTreeMap<String, String>,
    /// Query parameter carrying the 1-based page index.
    pub page_param: String,
    /// Query parameter carrying the page size, if the API accepts one.
    pub page_size_param: Option<String>,
    /// Records requested per page.
    pub page_size: u32,
    /// Highest page index that will ever be fetched.
    pub max_pages: u32,
    /// Object-store key of the merged artifact.
    pub storage_key: String,
    /// Whether the endpoint is paginated at all.
    pub requires_pagination: bool,
    /// Dot-separated path to the records array in wrapped responses.
    pub records_path: Option<String>,
    /// Non-paginated only: treat an existing artifact as current without
    /// fetching.
    pub fast_skip_if_exists: bool,
}

impl DatasetSpec {
    /// Query parameters for the given page: the base params plus the page
    /// index (and page size when configured).
    #[must_use]
    pub fn page_params(&self, page: u32) -> Vec<(String, String)> {
        let mut params: Vec<(String, String)> = self
            .params
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();

        if self.requires_pagination {
            params.push((self.page_param.clone(), page.to_string()));
            if let Some(size_param) = &self.page_size_param {
                params.push((size_param.clone(), self.page_size.to_string()));
            }
        }

        params
    }
}

// ── Resumption state ─────────────────────────────────────────────────────

/// Per-dataset resumption state, stored as a sidecar next to the artifact.
///
/// `last_page` is the highest page confirmed to contain data. `completed`
/// means the page after `last_page` ended pagination (empty page or the
/// `max_pages` ceiling). `artifact_fingerprint` ties the sidecar to the
/// exact artifact bytes it describes; sidecars written before it existed
/// deserialize with `None`. Always replaced wholesale.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumptionMetadata {
    /// Dataset this metadata describes.
    pub dataset_id: String,
    /// Highest page index confirmed to contain data.
    pub last_page: u32,
    /// Total records in the artifact described by this metadata.
    pub total_records: u64,
    /// When this metadata was computed.
    pub last_updated: DateTime<Utc>,
    /// Whether pagination reached its natural end.
    pub completed: bool,
    /// Fingerprint of the artifact this metadata was written for.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_fingerprint: Option<ContentFingerprint>,
}

impl ResumptionMetadata {
    /// Builds metadata stamped with the current time.
    #[must_use]
    pub fn now(dataset_id: &str, last_page: u32, total_records: u64, completed: bool) -> Self {
        Self {
            dataset_id: dataset_id.to_string(),
            last_page,
            total_records,
            last_updated: Utc::now(),
            completed,
            artifact_fingerprint: None,
        }
    }

    /// Binds the metadata to the artifact with `fingerprint`.
    #[must_use]
    pub fn with_fingerprint(mut self, fingerprint: ContentFingerprint) -> Self {
        self.artifact_fingerprint = Some(fingerprint);
        self
    }

    /// Whether `other` records the same progress, ignoring the timestamp.
    #[must_use]
    pub fn same_progress(&self, other: &Self) -> bool {
        self.dataset_id == other.dataset_id
            && self.last_page == other.last_page
            && self.total_records == other.total_records
            && self.completed == other.completed
            && self.artifact_fingerprint == other.artifact_fingerprint
    }
}

// ── Page fetch results ───────────────────────────────────────────────────

/// Records returned by one successful page fetch. Never persisted on its
/// own.
#[derive(Debug, Clone, PartialEq)]
pub struct PageResult {
    /// 1-based page index this result belongs to.
    pub page_index: u32,
    /// Records in upstream order.
    pub records: Vec<serde_json::Value>,
}

impl PageResult {
    /// Number of records on the page.
    #[must_use]
    pub const fn len(&self) -> usize {
        self.records.len()
    }

    /// Whether the page carried no records.
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Final classification of a page fetch.
#[derive(Debug, Clone, PartialEq)]
pub enum FetchOutcome {
    /// The page returned at least one record.
    Success(PageResult),
    /// HTTP 429. The fetcher absorbs these with its own backoff; one only
    /// escapes a fetch if the caller disabled retries.
    RateLimited {
        /// Server-provided `Retry-After` hint.
        retry_after: Option<Duration>,
    },
    /// HTTP 401/403. Fatal for the whole dataset run.
    AuthFailure {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        message: String,
    },
    /// A network, 5xx, or body-decode failure that survived every retry.
    TransientError {
        /// Description of the last failure.
        cause: String,
        /// How many attempts were made.
        attempts: u32,
    },
    /// A permanent client error (HTTP 400 and other non-auth 4xx).
    Rejected {
        /// HTTP status code.
        status: u16,
        /// Truncated response body.
        message: String,
    },
    /// The page had no records: the native end-of-pagination signal.
    EmptyTerminator,
    /// The run was cancelled while this fetch was pending.
    Cancelled,
}

impl FetchOutcome {
    /// Short label used in log lines.
    #[must_use]
    pub const fn label(&self) -> &'static str {
        match self {
            Self::Success(_) => "success",
            Self::RateLimited { .. } => "rate_limited",
            Self::AuthFailure { .. } => "auth_failure",
            Self::TransientError { .. } => "transient_error",
            Self::Rejected { .. } => "rejected",
            Self::EmptyTerminator => "empty",
            Self::Cancelled => "cancelled",
        }
    }

    /// Human-readable cause for failed outcomes.
    #[must_use]
    pub fn failure_message(&self) -> Option<String> {
        match self {
            Self::AuthFailure { status, message } => {
                Some(format!("authorization failed (HTTP {status}): {message}"))
            }
            Self::TransientError { cause, attempts } => {
                Some(format!("gave up after {attempts} attempt(s): {cause}"))
            }
            Self::Rejected { status, message } => {
                Some(format!("request rejected (HTTP {status}): {message}"))
            }
            Self::RateLimited { .. } => Some("rate limited".to_string()),
            Self::Cancelled => Some("cancelled".to_string()),
            Self::Success(_) | Self::EmptyTerminator => None,
        }
    }
}

// ── Content fingerprints ─────────────────────────────────────────────────

/// MD5 hex digest of an artifact's bytes.
///
/// MD5 is what S3-compatible stores report as the `ETag` of a single-part
/// upload, so a fingerprint computed locally compares directly against a
/// `HeadObject` response.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ContentFingerprint(String);

impl ContentFingerprint {
    /// Fingerprints a byte slice.
    #[must_use]
    pub fn of(bytes: &[u8]) -> Self {
        Self(format!("{:x}", md5::compute(bytes)))
    }

    /// Wraps an already computed MD5 context.
    #[must_use]
    pub fn from_context(context: md5::Context) -> Self {
        Self(format!("{:x}", context.finalize()))
    }

    /// Parses an `ETag` header value (quotes stripped, lower-cased).
    ///
    /// Returns `None` for multipart `ETag`s (`"<md5>-<parts>"`), which are
    /// not content digests.
    #[must_use]
    pub fn from_etag(etag: &str) -> Option<Self> {
        let clean = etag.trim().trim_matches('"');
        if clean.len() == 32 && clean.chars().all(|c| c.is_ascii_hexdigit()) {
            Some(Self(clean.to_ascii_lowercase()))
        } else {
            None
        }
    }

    /// The hex digest.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for ContentFingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

// ── Audit trail ──────────────────────────────────────────────────────────

/// Terminal status of one dataset run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AuditStatus {
    /// New data written, or the dataset was already current.
    Success,
    /// The run ended without reaching a consistent end state.
    Failed,
    /// Excluded by the caller; nothing was attempted.
    Skipped,
}

impl std::fmt::Display for AuditStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(match self {
            Self::Success => "SUCCESS",
            Self::Failed => "FAILED",
            Self::Skipped => "SKIPPED",
        })
    }
}

/// One line of the audit log. Written once, never mutated.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRecord {
    /// Dataset identifier.
    pub dataset_id: String,
    /// When the run started.
    pub started_at: DateTime<Utc>,
    /// When the run reached its terminal state.
    pub finished_at: DateTime<Utc>,
    /// Terminal status.
    pub status: AuditStatus,
    /// Non-empty pages fetched during this run (probes included when
    /// their records were kept).
    pub pages_fetched: u32,
    /// Records fetched during this run.
    pub records_fetched: u64,
    /// Artifact key in the object store.
    pub storage_key: String,
    /// Human-readable failure cause.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    /// Last page known to contain data when the run ended.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_page: Option<u32>,
    /// Outcome detail for successful runs (e.g. `"already current"`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
    /// Condition needing operator attention (e.g. an ambiguous
    /// reconstruction).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    /// Endpoint URL the dataset was fetched from.
    pub source_url: String,
    /// Base query parameters, with secrets already masked.
    #[serde(default)]
    pub params: BTreeMap<String, String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec(requires_pagination: bool) -> DatasetSpec {
        DatasetSpec {
            id: "contracts".to_string(),
            url: "https://api.example.com/contratos".to_string(),
            params: BTreeMap::from([("codigoOrgao".to_string(), "26000".to_string())]),
            page_param: "pagina".to_string(),
            page_size_param: Some("tamanhoPagina".to_string()),
            page_size: 500,
            max_pages: 1000,
            storage_key: "bronze/transparency/contracts.json".to_string(),
            requires_pagination,
            records_path: None,
            fast_skip_if_exists: false,
        }
    }

    #[test]
    fn page_params_append_page_and_size() {
        let params = spec(true).page_params(7);
        assert_eq!(
            params,
            vec![
                ("codigoOrgao".to_string(), "26000".to_string()),
                ("pagina".to_string(), "7".to_string()),
                ("tamanhoPagina".to_string(), "500".to_string()),
            ]
        );
    }

    #[test]
    fn unpaginated_params_omit_page() {
        let params = spec(false).page_params(1);
        assert_eq!(params.len(), 1);
        assert_eq!(params[0].0, "codigoOrgao");
    }

    #[test]
    fn fingerprint_matches_single_part_etag() {
        let fp = ContentFingerprint::of(b"[]");
        let etag = format!("\"{}\"", fp.as_str().to_ascii_uppercase());
        assert_eq!(ContentFingerprint::from_etag(&etag), Some(fp));
    }

    #[test]
    fn multipart_etag_is_not_a_fingerprint() {
        assert_eq!(
            ContentFingerprint::from_etag("\"d41d8cd98f00b204e9800998ecf8427e-3\""),
            None
        );
    }

    #[test]
    fn streamed_fingerprint_equals_one_shot() {
        let mut context = md5::Context::new();
        context.consume(b"[{\"a\":1},");
        context.consume(b"{\"a\":2}]");
        assert_eq!(
            ContentFingerprint::from_context(context),
            ContentFingerprint::of(b"[{\"a\":1},{\"a\":2}]")
        );
    }

    #[test]
    fn audit_status_serializes_upper_case() {
        assert_eq!(
            serde_json::to_string(&AuditStatus::Skipped).unwrap(),
            "\"SKIPPED\""
        );
    }

    #[test]
    fn same_progress_ignores_timestamp() {
        let a = ResumptionMetadata::now("contracts", 3, 342, true);
        let mut b = a.clone();
        b.last_updated = a.last_updated + chrono::Duration::hours(1);
        assert!(a.same_progress(&b));
        b.completed = false;
        assert!(!a.same_progress(&b));

        let c = a.clone().with_fingerprint(ContentFingerprint::of(b"[]"));
        assert!(!a.same_progress(&c));
    }

    #[test]
    fn sidecar_without_fingerprint_still_parses() {
        let json = r#"{"dataset_id":"contracts","last_page":3,"total_records":242,
            "last_updated":"2024-05-01T12:00:00Z","completed":true}"#;

        let meta: ResumptionMetadata = serde_json::from_str(json).unwrap();

        assert_eq!(meta.artifact_fingerprint, None);
        assert!(!serde_json::to_string(&meta).unwrap().contains("artifact_fingerprint"));
    }
}
