//! TOML dataset catalog.
//!
//! The catalog is read once at startup and resolved into an immutable
//! [`Catalog`]: engine settings plus the fully expanded list of
//! [`DatasetSpec`]s. Nothing in here reads the environment; the catalog
//! only *names* the environment variables that hold credentials.
//!
//! ```toml
//! [api]
//! base_url = "https://api.portaldatransparencia.gov.br/api-de-dados"
//! api_key_header = "chave-api-dados"
//! api_key_env = "TRANSPARENCY_API_KEY"
//!
//! [storage]
//! backend = "local"
//! root = "data"
//! prefix = "bronze/transparency"
//!
//! [[datasets]]
//! name = "federal_transfers_2024"
//! endpoint = "despesas/recursos-recebidos"
//! filename = "federal_transfers_2024.json"
//! requires_pagination = true
//! params = { mesAnoInicio = "01/2024", mesAnoFim = "03/2024" }
//! month_range = { start_param = "mesAnoInicio", end_param = "mesAnoFim" }
//! ```

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use std::time::Duration;

use bronze_fetch::{FetchPolicy, Redactor};
use bronze_ingest_models::DatasetSpec;
use chrono::{Datelike, Months, NaiveDate};
use regex::Regex;
use serde::Deserialize;

/// Trailing `_YYYY` year suffix stripped before month suffixes are added.
static YEAR_SUFFIX: LazyLock<Option<Regex>> = LazyLock::new(|| Regex::new(r"_\d{4}$").ok());

/// Errors that can occur while loading a catalog.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// The catalog file could not be read.
    #[error("Failed to read catalog {}: {source}", path.display())]
    Read {
        /// Catalog path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// The catalog is not valid TOML or does not match the schema.
    #[error("Failed to parse catalog: {0}")]
    Parse(#[from] toml::de::Error),

    /// A dataset entry is inconsistent.
    #[error("Dataset '{dataset}': {message}")]
    InvalidDataset {
        /// Dataset name.
        dataset: String,
        /// What is wrong.
        message: String,
    },

    /// Two datasets (possibly after month expansion) share an id.
    #[error("Duplicate dataset id '{0}'")]
    DuplicateDataset(String),

    /// Two datasets would write the same artifact.
    #[error("Datasets '{first}' and '{second}' both write {key}")]
    DuplicateStorageKey {
        /// Storage key.
        key: String,
        /// First dataset.
        first: String,
        /// Second dataset.
        second: String,
    },

    /// An engine setting is invalid.
    #[error("Invalid setting {field}: {message}")]
    InvalidSetting {
        /// Setting name.
        field: &'static str,
        /// What is wrong.
        message: String,
    },
}

// ── Raw TOML schema ──────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct CatalogFile {
    api: ApiSection,
    #[serde(default)]
    rate_limit: RateLimitSection,
    #[serde(default)]
    retry: RetrySection,
    #[serde(default)]
    pagination: PaginationSection,
    storage: StorageSection,
    #[serde(default)]
    audit: AuditSection,
    #[serde(default)]
    skip_cache: SkipCacheSection,
    #[serde(default)]
    runner: RunnerSection,
    #[serde(default)]
    datasets: Vec<DatasetEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ApiSection {
    base_url: String,
    user_agent: Option<String>,
    timeout_secs: Option<u64>,
    api_key_header: Option<String>,
    api_key_env: Option<String>,
    #[serde(default)]
    secret_params: Vec<String>,
    #[serde(default)]
    log_unsafe_http: bool,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RateLimitSection {
    #[serde(default = "default_delay_ms")]
    delay_between_requests_ms: u64,
}

impl Default for RateLimitSection {
    fn default() -> Self {
        Self {
            delay_between_requests_ms: default_delay_ms(),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct RetrySection {
    max_attempts: Option<u32>,
    backoff_base_secs: Option<u64>,
    backoff_cap_secs: Option<u64>,
    rate_limit_backoff_base_secs: Option<u64>,
    rate_limit_backoff_cap_secs: Option<u64>,
    max_rate_limit_escalations: Option<u32>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PaginationSection {
    #[serde(default = "default_page_param")]
    page_param: String,
    page_size_param: Option<String>,
    #[serde(default = "default_page_size")]
    page_size: u32,
    #[serde(default = "default_max_pages")]
    max_pages: u32,
}

impl Default for PaginationSection {
    fn default() -> Self {
        Self {
            page_param: default_page_param(),
            page_size_param: None,
            page_size: default_page_size(),
            max_pages: default_max_pages(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
enum BackendKind {
    Local,
    S3,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct StorageSection {
    backend: BackendKind,
    #[serde(default = "default_prefix")]
    prefix: String,
    root: Option<PathBuf>,
    bucket: Option<String>,
    region: Option<String>,
    endpoint_url: Option<String>,
    access_key_env: Option<String>,
    secret_key_env: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct AuditSection {
    #[serde(default = "default_audit_path")]
    path: PathBuf,
}

impl Default for AuditSection {
    fn default() -> Self {
        Self {
            path: default_audit_path(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct SkipCacheSection {
    #[serde(default = "default_skip_cache_dir")]
    dir: PathBuf,
    #[serde(default = "default_skip_ttl_secs")]
    ttl_secs: u64,
}

impl Default for SkipCacheSection {
    fn default() -> Self {
        Self {
            dir: default_skip_cache_dir(),
            ttl_secs: default_skip_ttl_secs(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RunnerSection {
    #[serde(default = "default_retry_rounds")]
    retry_rounds: u32,
    #[serde(default = "default_jobs")]
    jobs: usize,
}

impl Default for RunnerSection {
    fn default() -> Self {
        Self {
            retry_rounds: default_retry_rounds(),
            jobs: default_jobs(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct DatasetEntry {
    name: String,
    endpoint: String,
    filename: String,
    #[serde(default)]
    params: BTreeMap<String, toml::Value>,
    #[serde(default)]
    requires_pagination: bool,
    page_size: Option<u32>,
    max_pages: Option<u32>,
    records_path: Option<String>,
    #[serde(default = "default_true")]
    enabled: bool,
    #[serde(default)]
    fast_skip_if_exists: bool,
    month_range: Option<MonthRange>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
struct MonthRange {
    start_param: String,
    end_param: String,
}

fn default_delay_ms() -> u64 {
    u64::try_from(bronze_fetch::policy::DEFAULT_REQUEST_INTERVAL.as_millis()).unwrap_or(3500)
}
fn default_page_param() -> String {
    "pagina".to_string()
}
const fn default_page_size() -> u32 {
    500
}
const fn default_max_pages() -> u32 {
    1000
}
fn default_prefix() -> String {
    "bronze/transparency".to_string()
}
fn default_audit_path() -> PathBuf {
    PathBuf::from("logs/ingestion_audit.jsonl")
}
fn default_skip_cache_dir() -> PathBuf {
    PathBuf::from(".cache/bronze-skip")
}
const fn default_skip_ttl_secs() -> u64 {
    300
}
const fn default_retry_rounds() -> u32 {
    2
}
const fn default_jobs() -> usize {
    1
}
const fn default_true() -> bool {
    true
}

// ── Resolved configuration ───────────────────────────────────────────────

/// Where artifacts and metadata are stored.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StorageConfig {
    /// A local directory.
    Local {
        /// Root directory.
        root: PathBuf,
    },
    /// An S3-compatible bucket. Credentials are read by the binary from
    /// the named environment variables.
    S3 {
        /// Bucket name.
        bucket: String,
        /// Region (`"auto"` for R2).
        region: String,
        /// Custom endpoint for S3-compatible services.
        endpoint_url: Option<String>,
        /// Environment variable holding the access key id.
        access_key_env: String,
        /// Environment variable holding the secret access key.
        secret_key_env: String,
    },
}

/// Engine-wide settings resolved from the catalog.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Retry and pacing policy for every fetcher.
    pub policy: FetchPolicy,
    /// Header carrying the API key, if the API needs one.
    pub api_key_header: Option<String>,
    /// Environment variable the binary reads the API key from.
    pub api_key_env: Option<String>,
    /// Redaction rules for logs and audit records.
    pub redactor: Redactor,
    /// Artifact storage backend.
    pub storage: StorageConfig,
    /// Audit log file.
    pub audit_path: PathBuf,
    /// Skip-marker cache directory.
    pub skip_cache_dir: PathBuf,
    /// Skip-marker TTL; zero disables the cache.
    pub skip_cache_ttl: Duration,
    /// Extra rounds for failed datasets.
    pub retry_rounds: u32,
    /// Datasets processed concurrently.
    pub jobs: usize,
}

/// A resolved dataset and whether it should run by default.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CatalogDataset {
    /// Resolved dataset.
    pub spec: DatasetSpec,
    /// `false` when the catalog disabled it.
    pub enabled: bool,
}

/// A loaded, validated catalog.
#[derive(Debug, Clone)]
pub struct Catalog {
    /// Engine settings.
    pub engine: EngineConfig,
    /// Datasets in catalog order, month ranges expanded.
    pub datasets: Vec<CatalogDataset>,
}

impl Catalog {
    /// Reads and resolves a catalog file.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file cannot be read, parsed, or
    /// validated.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let catalog = Self::from_toml_str(&text)?;
        log::info!(
            "Loaded catalog {} ({} datasets)",
            path.display(),
            catalog.datasets.len()
        );
        Ok(catalog)
    }

    /// Resolves a catalog from TOML text.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the text is not a valid catalog.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let file: CatalogFile = toml::from_str(text)?;
        let engine = resolve_engine(&file)?;

        let mut datasets = Vec::new();
        for entry in &file.datasets {
            datasets.extend(resolve_dataset(entry, &file)?);
        }

        let mut ids = BTreeSet::new();
        let mut keys: BTreeMap<&str, &str> = BTreeMap::new();
        for dataset in &datasets {
            if !ids.insert(dataset.spec.id.as_str()) {
                return Err(ConfigError::DuplicateDataset(dataset.spec.id.clone()));
            }
            if let Some(first) = keys.insert(&dataset.spec.storage_key, &dataset.spec.id) {
                return Err(ConfigError::DuplicateStorageKey {
                    key: dataset.spec.storage_key.clone(),
                    first: first.to_string(),
                    second: dataset.spec.id.clone(),
                });
            }
        }

        Ok(Self { engine, datasets })
    }

    /// Looks up a dataset by id.
    #[must_use]
    pub fn dataset(&self, id: &str) -> Option<&CatalogDataset> {
        self.datasets.iter().find(|d| d.spec.id == id)
    }
}

fn resolve_engine(file: &CatalogFile) -> Result<EngineConfig, ConfigError> {
    let defaults = FetchPolicy::default();
    let retry = &file.retry;
    let secs = Duration::from_secs;

    let policy = FetchPolicy {
        request_interval: Duration::from_millis(file.rate_limit.delay_between_requests_ms),
        max_attempts: retry.max_attempts.unwrap_or(defaults.max_attempts),
        backoff_base: retry.backoff_base_secs.map_or(defaults.backoff_base, secs),
        backoff_cap: retry.backoff_cap_secs.map_or(defaults.backoff_cap, secs),
        rate_limit_backoff_base: retry
            .rate_limit_backoff_base_secs
            .map_or(defaults.rate_limit_backoff_base, secs),
        rate_limit_backoff_cap: retry
            .rate_limit_backoff_cap_secs
            .map_or(defaults.rate_limit_backoff_cap, secs),
        max_rate_limit_escalations: retry
            .max_rate_limit_escalations
            .unwrap_or(defaults.max_rate_limit_escalations),
        timeout: file.api.timeout_secs.map_or(defaults.timeout, secs),
        user_agent: file
            .api
            .user_agent
            .clone()
            .unwrap_or(defaults.user_agent),
    };

    if policy.max_attempts == 0 {
        return Err(ConfigError::InvalidSetting {
            field: "retry.max_attempts",
            message: "must be at least 1".to_string(),
        });
    }
    if file.runner.jobs == 0 {
        return Err(ConfigError::InvalidSetting {
            field: "runner.jobs",
            message: "must be at least 1".to_string(),
        });
    }
    if file.api.api_key_env.is_some() && file.api.api_key_header.is_none() {
        return Err(ConfigError::InvalidSetting {
            field: "api.api_key_header",
            message: "required when api.api_key_env is set".to_string(),
        });
    }
    if file.api.log_unsafe_http {
        log::warn!("api.log_unsafe_http is enabled: credentials will appear in logs");
    }

    Ok(EngineConfig {
        policy,
        api_key_header: file.api.api_key_header.clone(),
        api_key_env: file.api.api_key_env.clone(),
        redactor: Redactor {
            secret_header: file.api.api_key_header.clone(),
            secret_params: file.api.secret_params.clone(),
            unsafe_http: file.api.log_unsafe_http,
        },
        storage: resolve_storage(&file.storage)?,
        audit_path: file.audit.path.clone(),
        skip_cache_dir: file.skip_cache.dir.clone(),
        skip_cache_ttl: Duration::from_secs(file.skip_cache.ttl_secs),
        retry_rounds: file.runner.retry_rounds,
        jobs: file.runner.jobs,
    })
}

fn resolve_storage(section: &StorageSection) -> Result<StorageConfig, ConfigError> {
    let missing = |field: &'static str| ConfigError::InvalidSetting {
        field,
        message: "required for this storage backend".to_string(),
    };

    match section.backend {
        BackendKind::Local => Ok(StorageConfig::Local {
            root: section.root.clone().ok_or_else(|| missing("storage.root"))?,
        }),
        BackendKind::S3 => Ok(StorageConfig::S3 {
            bucket: section.bucket.clone().ok_or_else(|| missing("storage.bucket"))?,
            region: section.region.clone().unwrap_or_else(|| "auto".to_string()),
            endpoint_url: section.endpoint_url.clone(),
            access_key_env: section
                .access_key_env
                .clone()
                .unwrap_or_else(|| "AWS_ACCESS_KEY_ID".to_string()),
            secret_key_env: section
                .secret_key_env
                .clone()
                .unwrap_or_else(|| "AWS_SECRET_ACCESS_KEY".to_string()),
        }),
    }
}

fn resolve_dataset(
    entry: &DatasetEntry,
    file: &CatalogFile,
) -> Result<Vec<CatalogDataset>, ConfigError> {
    let invalid = |message: String| ConfigError::InvalidDataset {
        dataset: entry.name.clone(),
        message,
    };

    if entry.name.trim().is_empty() {
        return Err(invalid("name must not be empty".to_string()));
    }
    if entry.filename.trim().is_empty() || entry.filename.contains("..") {
        return Err(invalid(format!("invalid filename '{}'", entry.filename)));
    }
    if entry.fast_skip_if_exists && entry.requires_pagination {
        return Err(invalid(
            "fast_skip_if_exists only applies to non-paginated datasets".to_string(),
        ));
    }

    let mut params = BTreeMap::new();
    for (key, value) in &entry.params {
        params.insert(key.clone(), param_string(value).map_err(invalid)?);
    }

    let pagination = &file.pagination;
    let max_pages = entry.max_pages.unwrap_or(pagination.max_pages);
    if entry.requires_pagination && max_pages == 0 {
        return Err(invalid("max_pages must be at least 1".to_string()));
    }

    let base = DatasetSpec {
        id: entry.name.clone(),
        url: build_url(&file.api.base_url, &entry.endpoint),
        params,
        page_param: pagination.page_param.clone(),
        page_size_param: pagination.page_size_param.clone(),
        page_size: entry.page_size.unwrap_or(pagination.page_size),
        max_pages,
        storage_key: storage_key(&file.storage.prefix, &entry.filename),
        requires_pagination: entry.requires_pagination,
        records_path: entry.records_path.clone(),
        fast_skip_if_exists: entry.fast_skip_if_exists,
    };

    let Some(range) = &entry.month_range else {
        return Ok(vec![CatalogDataset {
            spec: base,
            enabled: entry.enabled,
        }]);
    };

    let (Some(start), Some(end)) = (
        base.params.get(&range.start_param),
        base.params.get(&range.end_param),
    ) else {
        return Err(invalid(format!(
            "month_range needs both '{}' and '{}' in params",
            range.start_param, range.end_param
        )));
    };

    if start == end {
        return Ok(vec![CatalogDataset {
            spec: base,
            enabled: entry.enabled,
        }]);
    }

    let months = months_inclusive(start, end).map_err(invalid)?;
    let (stem, ext) = split_filename(&entry.filename);
    let base_stem = strip_year_suffix(stem);
    let base_name = strip_year_suffix(&entry.name);

    Ok(months
        .into_iter()
        .map(|month| {
            let mes_ano = format!("{:02}/{}", month.month(), month.year());
            let suffix = format!("{}_{:02}", month.year(), month.month());

            let mut spec = base.clone();
            spec.params.insert(range.start_param.clone(), mes_ano.clone());
            spec.params.insert(range.end_param.clone(), mes_ano);
            spec.id = format!("{base_name}_{suffix}");
            let filename = ext.map_or_else(
                || format!("{base_stem}_{suffix}"),
                |ext| format!("{base_stem}_{suffix}.{ext}"),
            );
            spec.storage_key = storage_key(&file.storage.prefix, &filename);

            CatalogDataset {
                spec,
                enabled: entry.enabled,
            }
        })
        .collect())
}

fn param_string(value: &toml::Value) -> Result<String, String> {
    match value {
        toml::Value::String(s) => Ok(s.clone()),
        toml::Value::Integer(i) => Ok(i.to_string()),
        toml::Value::Float(f) => Ok(f.to_string()),
        toml::Value::Boolean(b) => Ok(b.to_string()),
        other => Err(format!(
            "parameter values must be scalars, got {}",
            other.type_str()
        )),
    }
}

/// Joins the API base URL and an endpoint path. Absolute endpoint URLs
/// are used as-is.
#[must_use]
pub fn build_url(base_url: &str, endpoint: &str) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        return endpoint.to_string();
    }
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        endpoint.trim_start_matches('/')
    )
}

/// Artifact key for a filename under the storage prefix.
#[must_use]
pub fn storage_key(prefix: &str, filename: &str) -> String {
    let prefix = prefix.trim_matches('/');
    if prefix.is_empty() {
        filename.to_string()
    } else {
        format!("{prefix}/{filename}")
    }
}

fn split_filename(filename: &str) -> (&str, Option<&str>) {
    match filename.rsplit_once('.') {
        Some((stem, ext)) if !stem.is_empty() => (stem, Some(ext)),
        _ => (filename, None),
    }
}

fn strip_year_suffix(value: &str) -> String {
    YEAR_SUFFIX.as_ref().map_or_else(
        || value.to_string(),
        |re| re.replace(value, "").into_owned(),
    )
}

/// Parses an `MM/YYYY` value into the first day of that month.
fn parse_mes_ano(value: &str) -> Result<NaiveDate, String> {
    NaiveDate::parse_from_str(&format!("01/{}", value.trim()), "%d/%m/%Y")
        .map_err(|e| format!("invalid month '{value}' (expected MM/YYYY): {e}"))
}

/// Every month from `start` to `end` inclusive.
fn months_inclusive(start: &str, end: &str) -> Result<Vec<NaiveDate>, String> {
    let first = parse_mes_ano(start)?;
    let last = parse_mes_ano(end)?;
    if first > last {
        return Err(format!("month range {start}..{end} is reversed"));
    }

    let mut months = Vec::new();
    let mut current = first;
    while current <= last {
        months.push(current);
        current = current
            .checked_add_months(Months::new(1))
            .ok_or_else(|| format!("month range {start}..{end} overflows"))?;
    }
    Ok(months)
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
        [api]
        base_url = "https://api.example.gov.br/api-de-dados/"
        api_key_header = "chave-api-dados"
        api_key_env = "TRANSPARENCY_API_KEY"

        [storage]
        backend = "local"
        root = "data"
    "#;

    fn catalog(datasets: &str) -> Result<Catalog, ConfigError> {
        Catalog::from_toml_str(&format!("{MINIMAL}\n{datasets}"))
    }

    #[test]
    fn defaults_match_rate_limit_contract() {
        let catalog = catalog("").unwrap();
        let engine = &catalog.engine;

        assert_eq!(engine.policy.request_interval, Duration::from_millis(3500));
        assert_eq!(engine.policy.max_attempts, 5);
        assert_eq!(engine.retry_rounds, 2);
        assert_eq!(engine.jobs, 1);
        assert_eq!(engine.skip_cache_ttl, Duration::from_secs(300));
        assert_eq!(
            engine.storage,
            StorageConfig::Local {
                root: PathBuf::from("data")
            }
        );
        assert_eq!(
            engine.redactor.secret_header.as_deref(),
            Some("chave-api-dados")
        );
    }

    #[test]
    fn dataset_resolves_url_key_and_params() {
        let catalog = catalog(
            r#"
            [[datasets]]
            name = "sanctions"
            endpoint = "/ceis"
            filename = "sanctions.json"
            requires_pagination = true
            params = { codigoOrgao = 26000, ativo = true }
            "#,
        )
        .unwrap();

        let spec = &catalog.datasets[0].spec;
        assert_eq!(spec.url, "https://api.example.gov.br/api-de-dados/ceis");
        assert_eq!(spec.storage_key, "bronze/transparency/sanctions.json");
        assert_eq!(spec.params["codigoOrgao"], "26000");
        assert_eq!(spec.params["ativo"], "true");
        assert_eq!(spec.page_param, "pagina");
        assert_eq!(spec.page_size, 500);
        assert_eq!(spec.max_pages, 1000);
        assert!(catalog.datasets[0].enabled);
    }

    #[test]
    fn month_range_expands_per_month() {
        let catalog = catalog(
            r#"
            [[datasets]]
            name = "federal_transfers_2023"
            endpoint = "despesas/recursos-recebidos"
            filename = "federal_transfers_2023.json"
            requires_pagination = true
            params = { mesAnoInicio = "11/2023", mesAnoFim = "02/2024" }
            month_range = { start_param = "mesAnoInicio", end_param = "mesAnoFim" }
            "#,
        )
        .unwrap();

        let ids: Vec<_> = catalog.datasets.iter().map(|d| d.spec.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "federal_transfers_2023_11",
                "federal_transfers_2023_12",
                "federal_transfers_2024_01",
                "federal_transfers_2024_02",
            ]
        );

        let january = &catalog.datasets[2].spec;
        assert_eq!(january.params["mesAnoInicio"], "01/2024");
        assert_eq!(january.params["mesAnoFim"], "01/2024");
        assert_eq!(
            january.storage_key,
            "bronze/transparency/federal_transfers_2024_01.json"
        );
    }

    #[test]
    fn single_month_range_is_not_expanded() {
        let catalog = catalog(
            r#"
            [[datasets]]
            name = "transfers"
            endpoint = "despesas/recursos-recebidos"
            filename = "transfers.json"
            params = { mesAnoInicio = "05/2024", mesAnoFim = "05/2024" }
            month_range = { start_param = "mesAnoInicio", end_param = "mesAnoFim" }
            "#,
        )
        .unwrap();

        assert_eq!(catalog.datasets.len(), 1);
        assert_eq!(catalog.datasets[0].spec.id, "transfers");
    }

    #[test]
    fn reversed_month_range_is_rejected() {
        let err = catalog(
            r#"
            [[datasets]]
            name = "transfers"
            endpoint = "x"
            filename = "transfers.json"
            params = { mesAnoInicio = "05/2024", mesAnoFim = "01/2024" }
            month_range = { start_param = "mesAnoInicio", end_param = "mesAnoFim" }
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDataset { .. }));
    }

    #[test]
    fn duplicate_ids_are_rejected() {
        let err = catalog(
            r#"
            [[datasets]]
            name = "a"
            endpoint = "x"
            filename = "a.json"

            [[datasets]]
            name = "a"
            endpoint = "y"
            filename = "b.json"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateDataset(id) if id == "a"));
    }

    #[test]
    fn shared_storage_key_is_rejected() {
        let err = catalog(
            r#"
            [[datasets]]
            name = "a"
            endpoint = "x"
            filename = "same.json"

            [[datasets]]
            name = "b"
            endpoint = "y"
            filename = "same.json"
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::DuplicateStorageKey { .. }));
    }

    #[test]
    fn fast_skip_requires_non_paginated() {
        let err = catalog(
            r#"
            [[datasets]]
            name = "a"
            endpoint = "x"
            filename = "a.json"
            requires_pagination = true
            fast_skip_if_exists = true
            "#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::InvalidDataset { .. }));
    }

    #[test]
    fn s3_backend_defaults_credentials_env() {
        let catalog = Catalog::from_toml_str(
            r#"
            [api]
            base_url = "https://servicodados.ibge.gov.br/api/v1"

            [storage]
            backend = "s3"
            bucket = "lake"
            endpoint_url = "https://acct.r2.cloudflarestorage.com"
            prefix = "bronze/ibge"
            "#,
        )
        .unwrap();

        assert_eq!(
            catalog.engine.storage,
            StorageConfig::S3 {
                bucket: "lake".to_string(),
                region: "auto".to_string(),
                endpoint_url: Some("https://acct.r2.cloudflarestorage.com".to_string()),
                access_key_env: "AWS_ACCESS_KEY_ID".to_string(),
                secret_key_env: "AWS_SECRET_ACCESS_KEY".to_string(),
            }
        );
    }

    #[test]
    fn local_backend_requires_root() {
        let err = Catalog::from_toml_str(
            r#"
            [api]
            base_url = "https://x"

            [storage]
            backend = "local"
            "#,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidSetting {
                field: "storage.root",
                ..
            }
        ));
    }

    #[test]
    fn bundled_catalog_loads() {
        let catalog =
            Catalog::from_toml_str(include_str!("../../../catalog/transparency.toml")).unwrap();

        let ids: Vec<_> = catalog.datasets.iter().map(|d| d.spec.id.as_str()).collect();
        assert_eq!(
            ids,
            vec![
                "federal_transfers_2024_01",
                "federal_transfers_2024_02",
                "federal_transfers_2024_03",
                "health_agreements",
                "social_program_beneficiaries",
                "siafi_agencies",
                "sanctioned_companies",
            ]
        );

        let agreements = catalog.dataset("health_agreements").unwrap();
        assert_eq!(agreements.spec.params["codigoOrgao"], "36000");
        assert!(!catalog.dataset("sanctioned_companies").unwrap().enabled);
        assert!(catalog.dataset("siafi_agencies").unwrap().spec.fast_skip_if_exists);
        assert_eq!(catalog.engine.policy.request_interval, Duration::from_millis(3500));
    }

    #[test]
    fn year_suffix_only_stripped_at_end() {
        assert_eq!(strip_year_suffix("federal_transfers_2013"), "federal_transfers");
        assert_eq!(strip_year_suffix("a_2013_b"), "a_2013_b");
        assert_eq!(strip_year_suffix("a_201"), "a_201");
    }

    #[test]
    fn missing_catalog_error_names_the_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("absent.toml");

        let err = Catalog::load(&path).unwrap_err();

        assert!(matches!(err, ConfigError::Read { .. }));
        assert!(err.to_string().contains("absent.toml"));
    }
}
