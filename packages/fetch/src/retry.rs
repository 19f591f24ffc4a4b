//! HTTP page fetching with rate-limit compliance and bounded retry.
//!
//! Every attempt first waits on the shared [`RateGate`]. Each response is
//! classified into a [`FetchOutcome`]; the retry loop in
//! [`RetryingFetcher::fetch`] then decides what to do with it:
//!
//! | Classification | Action |
//! |---|---|
//! | 401 / 403 | return [`FetchOutcome::AuthFailure`] immediately |
//! | 429 | back off (server hint or exponential) and retry, up to `max_rate_limit_escalations` |
//! | network error, 5xx, unparsable body | back off and retry, up to `max_attempts` |
//! | other 4xx | return [`FetchOutcome::Rejected`] immediately |
//! | empty array / `null` / empty body / 204 | return [`FetchOutcome::EmptyTerminator`] |
//!
//! An unparsable body is never mistaken for an empty page: truncating a
//! dataset because one response came back garbled would be permanent.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bronze_ingest_models::{FetchOutcome, PageResult};
use tokio_util::sync::CancellationToken;

use crate::redact::{ApiCredential, Redactor};
use crate::{FetchError, FetchPolicy, FetchRequest, PageSource, RateGate};

/// Maximum length of the response body preview kept in outcomes and logs.
const BODY_PREVIEW_LEN: usize = 500;

/// The production [`PageSource`].
pub struct RetryingFetcher {
    client: reqwest::Client,
    policy: FetchPolicy,
    gate: Arc<RateGate>,
    credential: Option<ApiCredential>,
    redactor: Redactor,
    cancel: CancellationToken,
}

impl RetryingFetcher {
    /// Builds a fetcher.
    ///
    /// `gate` should be shared by every fetcher hitting the same API.
    /// `cancel` aborts pending sleeps and in-flight requests.
    ///
    /// # Errors
    ///
    /// Returns [`FetchError`] if the HTTP client cannot be built or the
    /// credential is not a valid header.
    pub fn new(
        policy: FetchPolicy,
        gate: Arc<RateGate>,
        credential: Option<ApiCredential>,
        redactor: Redactor,
        cancel: CancellationToken,
    ) -> Result<Self, FetchError> {
        if let Some(credential) = &credential {
            reqwest::header::HeaderName::from_bytes(credential.header.as_bytes()).map_err(|e| {
                FetchError::InvalidHeader {
                    name: credential.header.clone(),
                    message: e.to_string(),
                }
            })?;
            reqwest::header::HeaderValue::from_str(&credential.value).map_err(|e| {
                FetchError::InvalidHeader {
                    name: credential.header.clone(),
                    message: e.to_string(),
                }
            })?;
        }

        let client = reqwest::Client::builder()
            .user_agent(&policy.user_agent)
            .timeout(policy.timeout)
            .build()?;

        Ok(Self {
            client,
            policy,
            gate,
            credential,
            redactor,
            cancel,
        })
    }

    /// The policy this fetcher was built with.
    #[must_use]
    pub const fn policy(&self) -> &FetchPolicy {
        &self.policy
    }

    /// Pre-redacted one-line description of a request, safe to log or
    /// persist.
    #[must_use]
    pub fn describe_request(&self, url: &str, params: &[(String, String)]) -> String {
        let mut headers = vec![
            ("Accept".to_string(), "*/*".to_string()),
            ("User-Agent".to_string(), self.policy.user_agent.clone()),
        ];
        if let Some(credential) = &self.credential {
            headers.push((credential.header.clone(), credential.value.clone()));
        }
        format!(
            "GET {} headers={:?}",
            self.redactor.url(url, params),
            self.redactor.headers(&headers)
        )
    }

    /// Sleeps for `delay` unless cancelled first. Returns `false` on
    /// cancellation.
    async fn pause(&self, delay: Duration) -> bool {
        tokio::select! {
            () = self.cancel.cancelled() => false,
            () = tokio::time::sleep(delay) => true,
        }
    }

    /// One attempt: send, then classify the response.
    async fn attempt(&self, request: &FetchRequest<'_>) -> FetchOutcome {
        let mut builder = self
            .client
            .get(request.url)
            .query(request.params)
            .header(reqwest::header::ACCEPT, "*/*");
        if let Some(credential) = &self.credential {
            builder = builder.header(credential.header.as_str(), credential.value.as_str());
        }

        let response = match builder.send().await {
            Ok(response) => response,
            Err(e) if is_transient(&e) => {
                return FetchOutcome::TransientError {
                    cause: e.to_string(),
                    attempts: 1,
                };
            }
            Err(e) => {
                return FetchOutcome::Rejected {
                    status: 0,
                    message: e.to_string(),
                };
            }
        };

        let status = response.status();

        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN
        {
            let body = response.text().await.unwrap_or_default();
            return FetchOutcome::AuthFailure {
                status: status.as_u16(),
                message: preview(&body),
            };
        }

        if status == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return FetchOutcome::RateLimited {
                retry_after: retry_after(response.headers()),
            };
        }

        if status.is_server_error() {
            return FetchOutcome::TransientError {
                cause: format!("HTTP {status}"),
                attempts: 1,
            };
        }

        if status.is_client_error() {
            let body = response.text().await.unwrap_or_default();
            return FetchOutcome::Rejected {
                status: status.as_u16(),
                message: preview(&body),
            };
        }

        if status == reqwest::StatusCode::NO_CONTENT {
            return FetchOutcome::EmptyTerminator;
        }

        match response.text().await {
            Ok(text) => parse_page(&text, request.page_index, request.records_path),
            Err(e) => FetchOutcome::TransientError {
                cause: format!("response body read failed: {e}"),
                attempts: 1,
            },
        }
    }
}

#[async_trait]
impl PageSource for RetryingFetcher {
    async fn fetch(&self, request: &FetchRequest<'_>) -> FetchOutcome {
        let label = request.label;
        log::debug!(
            "[{label}] {}",
            self.describe_request(request.url, request.params)
        );

        let mut failures: u32 = 0;
        let mut escalations: u32 = 0;

        loop {
            if !self.gate.acquire(&self.cancel).await {
                return FetchOutcome::Cancelled;
            }

            let outcome = tokio::select! {
                () = self.cancel.cancelled() => return FetchOutcome::Cancelled,
                outcome = self.attempt(request) => outcome,
            };

            match outcome {
                FetchOutcome::RateLimited { retry_after } => {
                    escalations += 1;
                    if escalations > self.policy.max_rate_limit_escalations {
                        log::error!(
                            "[{label}] page {}: still rate limited after {} backoffs, giving up",
                            request.page_index,
                            self.policy.max_rate_limit_escalations
                        );
                        return FetchOutcome::TransientError {
                            cause: format!(
                                "HTTP 429 persisted through {} backoffs",
                                self.policy.max_rate_limit_escalations
                            ),
                            attempts: failures + escalations,
                        };
                    }
                    let delay = self.policy.rate_limit_backoff(escalations, retry_after);
                    log::warn!(
                        "[{label}] page {}: HTTP 429 (rate limited), backing off {delay:?} \
                         ({escalations}/{})",
                        request.page_index,
                        self.policy.max_rate_limit_escalations
                    );
                    if !self.pause(delay).await {
                        return FetchOutcome::Cancelled;
                    }
                }
                FetchOutcome::TransientError { cause, .. } => {
                    failures += 1;
                    if failures >= self.policy.max_attempts {
                        log::error!(
                            "[{label}] page {}: all {failures} attempts failed, last error: {cause}",
                            request.page_index
                        );
                        return FetchOutcome::TransientError {
                            cause,
                            attempts: failures + escalations,
                        };
                    }
                    let delay = self.policy.transient_backoff(failures);
                    log::warn!(
                        "[{label}] page {}: attempt {failures}/{} failed ({cause}), \
                         retrying in {delay:?}...",
                        request.page_index,
                        self.policy.max_attempts
                    );
                    if !self.pause(delay).await {
                        return FetchOutcome::Cancelled;
                    }
                }
                FetchOutcome::AuthFailure { status, message } => {
                    log::error!(
                        "[{label}] page {}: authorization failed (HTTP {status}), not retrying",
                        request.page_index
                    );
                    return FetchOutcome::AuthFailure { status, message };
                }
                FetchOutcome::Rejected { status, message } => {
                    log::error!(
                        "[{label}] page {}: request rejected (HTTP {status}): {message}",
                        request.page_index
                    );
                    return FetchOutcome::Rejected { status, message };
                }
                outcome => return outcome,
            }
        }
    }
}

/// Classifies a successful response body.
///
/// Arrays yield their elements; objects yield the array at
/// `records_path` when one is configured, otherwise the object itself as
/// a single record.
#[must_use]
pub fn parse_page(text: &str, page_index: u32, records_path: Option<&str>) -> FetchOutcome {
    if text.trim().is_empty() {
        return FetchOutcome::EmptyTerminator;
    }

    let body: serde_json::Value = match serde_json::from_str(text) {
        Ok(body) => body,
        Err(e) => {
            return FetchOutcome::TransientError {
                cause: format!(
                    "invalid JSON ({e}), received {} bytes: {}",
                    text.len(),
                    preview(text)
                ),
                attempts: 1,
            };
        }
    };

    let records = match (body, records_path) {
        (serde_json::Value::Null, _) => return FetchOutcome::EmptyTerminator,
        (serde_json::Value::Array(records), _) => records,
        (body @ serde_json::Value::Object(_), Some(path)) => {
            match resolve_path(&body, path) {
                Some(serde_json::Value::Array(records)) => records.clone(),
                Some(serde_json::Value::Null) => return FetchOutcome::EmptyTerminator,
                Some(_) => {
                    return FetchOutcome::Rejected {
                        status: 200,
                        message: format!("'{path}' is not an array of records"),
                    };
                }
                None => {
                    return FetchOutcome::Rejected {
                        status: 200,
                        message: format!("response does not contain path '{path}'"),
                    };
                }
            }
        }
        (other, _) => vec![other],
    };

    if records.is_empty() {
        FetchOutcome::EmptyTerminator
    } else {
        FetchOutcome::Success(PageResult {
            page_index,
            records,
        })
    }
}

/// Navigates a dot-separated path into a JSON value.
fn resolve_path<'a>(value: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Parses a `Retry-After` header given in seconds.
fn retry_after(headers: &reqwest::header::HeaderMap) -> Option<Duration> {
    headers
        .get(reqwest::header::RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse::<u64>()
        .ok()
        .map(Duration::from_secs)
}

fn preview(text: &str) -> String {
    if text.len() > BODY_PREVIEW_LEN {
        let mut end = BODY_PREVIEW_LEN;
        while !text.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}...", &text[..end])
    } else {
        text.to_string()
    }
}

/// Returns `true` if the error is likely transient and worth retrying.
fn is_transient(e: &reqwest::Error) -> bool {
    e.is_timeout() || e.is_connect() || e.is_body() || e.is_decode() || e.is_request()
}
