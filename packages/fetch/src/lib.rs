#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Rate-limited page fetching with bounded retry.
//!
//! The [`PageSource`] trait is the seam between the pagination controller
//! and the network. [`retry::RetryingFetcher`] is the production
//! implementation: every request waits on a shared [`rate::RateGate`],
//! transient failures are retried with exponential backoff, rate-limit
//! responses get their own longer backoff, and authorization failures are
//! returned immediately.

pub mod policy;
pub mod rate;
pub mod redact;
pub mod retry;

use async_trait::async_trait;
use bronze_ingest_models::FetchOutcome;

pub use policy::FetchPolicy;
pub use rate::RateGate;
pub use redact::{ApiCredential, Redactor};
pub use retry::RetryingFetcher;

/// Errors that can occur while setting up a fetcher.
///
/// Per-request failures are never errors; they are classified into
/// [`FetchOutcome`] variants.
#[derive(Debug, thiserror::Error)]
pub enum FetchError {
    /// The HTTP client could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    Client(#[from] reqwest::Error),

    /// The credential header name or value is not valid HTTP.
    #[error("Invalid credential header '{name}': {message}")]
    InvalidHeader {
        /// Header name from the configuration.
        name: String,
        /// Why the header was rejected.
        message: String,
    },
}

/// A single logical page request.
#[derive(Debug, Clone, Copy)]
pub struct FetchRequest<'a> {
    /// Endpoint URL.
    pub url: &'a str,
    /// Query parameters, including the page index when paginated.
    pub params: &'a [(String, String)],
    /// 1-based page index (for labelling results and logs).
    pub page_index: u32,
    /// Dot-separated path to the records array in wrapped responses.
    pub records_path: Option<&'a str>,
    /// Label prefixed to log lines.
    pub label: &'a str,
}

/// Something that can fetch one page and classify the result.
///
/// Implementations own their retry policy: the outcome returned is final
/// for that page.
#[async_trait]
pub trait PageSource: Send + Sync {
    /// Fetches one page.
    async fn fetch(&self, request: &FetchRequest<'_>) -> FetchOutcome;
}
