#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! `bronze`: resumable ingestion of paginated JSON APIs into a bronze
//! storage layer.
//!
//! This is the only place that reads the process environment: the API key
//! and S3 credentials are looked up by the variable names the catalog
//! declares and handed to the engine as explicit values.
//!
//! Uses `indicatif-log-bridge` (via [`bronze_cli_utils::init_logger`])
//! to route `log` output through `indicatif::MultiProgress` so that log
//! lines and progress bars never fight for the terminal.

use std::error::Error;
use std::path::PathBuf;
use std::sync::Arc;

use bronze_cli_utils::IndicatifProgress;
use bronze_fetch::{ApiCredential, PageSource, RateGate, RetryingFetcher};
use bronze_ingest::IngestContext;
use bronze_ingest::audit::AuditLog;
use bronze_ingest::config::{Catalog, CatalogDataset, EngineConfig, StorageConfig};
use bronze_ingest::progress::null_progress;
use bronze_ingest::runner::Runner;
use bronze_ingest::skip_cache::SkipMarkerCache;
use bronze_ingest::verify::{VerifyStatus, verify};
use bronze_storage::{LocalStore, MetadataStore, ObjectStore, S3Settings, S3Store};
use clap::{Args, Parser, Subcommand};
use tokio_util::sync::CancellationToken;

#[derive(Parser)]
#[command(name = "bronze", about = "Resumable bronze-layer ingestion of paginated JSON APIs")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Args)]
struct CatalogArgs {
    /// Path to the dataset catalog (TOML)
    #[arg(long, default_value = "catalog/transparency.toml")]
    catalog: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Ingest every enabled dataset (or the ones listed)
    Run {
        #[command(flatten)]
        catalog: CatalogArgs,
        /// Comma-separated list of dataset ids to run; others are recorded as skipped
        #[arg(long)]
        datasets: Option<String>,
        /// Number of datasets processed concurrently (overrides the catalog)
        #[arg(long)]
        jobs: Option<usize>,
        /// Ignore recent "already current" markers
        #[arg(long)]
        no_skip_cache: bool,
    },
    /// Compare stored metadata with upstream without writing anything
    Verify {
        #[command(flatten)]
        catalog: CatalogArgs,
        /// Comma-separated list of dataset ids to verify
        #[arg(long)]
        datasets: Option<String>,
    },
    /// Print stored resumption metadata for every dataset
    Status {
        #[command(flatten)]
        catalog: CatalogArgs,
    },
    /// List the datasets in the catalog after month expansion
    Datasets {
        #[command(flatten)]
        catalog: CatalogArgs,
    },
}

#[allow(clippy::too_many_lines)]
#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    let multi = bronze_cli_utils::init_logger();
    let cli = Cli::parse();

    match cli.command {
        Commands::Datasets { catalog } => {
            let catalog = Catalog::load(&catalog.catalog)?;
            println!("{:<48} {:<9} {:<8} KEY", "ID", "ENABLED", "PAGED");
            println!("{}", "-".repeat(100));
            for dataset in &catalog.datasets {
                let spec = &dataset.spec;
                println!(
                    "{:<48} {:<9} {:<8} {}",
                    spec.id,
                    if dataset.enabled { "yes" } else { "no" },
                    if spec.requires_pagination { "yes" } else { "no" },
                    spec.storage_key
                );
            }
        }
        Commands::Status { catalog } => {
            let catalog = Catalog::load(&catalog.catalog)?;
            let store = build_store(&catalog.engine.storage)?;
            let metadata = MetadataStore::new(Arc::clone(&store));

            println!(
                "{:<48} {:>9} {:>12} {:<10} UPDATED",
                "ID", "LAST PAGE", "RECORDS", "COMPLETE"
            );
            println!("{}", "-".repeat(100));
            for dataset in &catalog.datasets {
                let spec = &dataset.spec;
                if !spec.requires_pagination {
                    let state = if store.head(&spec.storage_key).await?.is_some() {
                        "stored"
                    } else {
                        "missing"
                    };
                    println!("{:<48} single fetch, artifact {state}", spec.id);
                    continue;
                }
                match metadata.get(&spec.id, &spec.storage_key).await? {
                    Some(meta) => println!(
                        "{:<48} {:>9} {:>12} {:<10} {}",
                        spec.id,
                        meta.last_page,
                        meta.total_records,
                        if meta.completed { "yes" } else { "no" },
                        meta.last_updated.format("%Y-%m-%d %H:%M:%S UTC")
                    ),
                    None => println!("{:<48} no metadata", spec.id),
                }
            }
        }
        Commands::Verify { catalog, datasets } => {
            let catalog = Catalog::load(&catalog.catalog)?;
            let engine = &catalog.engine;
            let cancel = cancel_on_ctrl_c();
            let ctx = IngestContext::new(
                build_source(engine, &cancel)?,
                build_store(&engine.storage)?,
                null_progress(),
                cancel,
            )
            .with_redactor(engine.redactor.clone());

            let filter = datasets.as_deref().map(parse_list);
            let mut attention = 0;
            for dataset in selected(&catalog.datasets, filter.as_deref()) {
                let report = verify(&ctx, &dataset.spec).await?;
                println!("{:<48} {}", report.dataset_id, report.status);
                if matches!(
                    report.status,
                    VerifyStatus::Shrunk { .. } | VerifyStatus::Failed { .. }
                ) {
                    attention += 1;
                }
            }
            if attention > 0 {
                return Err(format!("{attention} dataset(s) need attention").into());
            }
        }
        Commands::Run {
            catalog,
            datasets,
            jobs,
            no_skip_cache,
        } => {
            let catalog = Catalog::load(&catalog.catalog)?;
            let engine = &catalog.engine;
            let cancel = cancel_on_ctrl_c();

            let ctx = IngestContext::new(
                build_source(engine, &cancel)?,
                build_store(&engine.storage)?,
                IndicatifProgress::datasets_bar(&multi, "datasets"),
                cancel,
            )
            .with_redactor(engine.redactor.clone());
            let audit = Arc::new(AuditLog::open(&engine.audit_path).await?);
            let skip_cache = if no_skip_cache {
                None
            } else {
                SkipMarkerCache::new(engine.skip_cache_dir.clone(), engine.skip_cache_ttl)
            };

            let runner = Runner::new(ctx, audit)
                .with_skip_cache(skip_cache)
                .with_retry_rounds(engine.retry_rounds)
                .with_jobs(jobs.unwrap_or(engine.jobs));

            let filter = datasets.as_deref().map(parse_list);
            let summary = runner.run_all(&catalog.datasets, filter.as_deref()).await?;

            if summary.has_failures() {
                return Err(format!(
                    "{} dataset(s) failed: {}",
                    summary.failed.len(),
                    summary.failed.join(", ")
                )
                .into());
            }
        }
    }

    Ok(())
}

/// Builds the fetcher, reading the API key from the environment variable
/// the catalog names.
fn build_source(
    engine: &EngineConfig,
    cancel: &CancellationToken,
) -> Result<Arc<dyn PageSource>, Box<dyn Error>> {
    let credential = match (&engine.api_key_header, &engine.api_key_env) {
        (Some(header), Some(env)) => Some(ApiCredential::new(header, &env_var(env)?)),
        (Some(header), None) => {
            log::warn!("api_key_header '{header}' is set but api_key_env is not, sending no key");
            None
        }
        _ => None,
    };

    let gate = Arc::new(RateGate::new(engine.policy.request_interval));
    let fetcher = RetryingFetcher::new(
        engine.policy.clone(),
        gate,
        credential,
        engine.redactor.clone(),
        cancel.clone(),
    )?;
    Ok(Arc::new(fetcher))
}

fn build_store(storage: &StorageConfig) -> Result<Arc<dyn ObjectStore>, Box<dyn Error>> {
    let store: Arc<dyn ObjectStore> = match storage {
        StorageConfig::Local { root } => Arc::new(LocalStore::new(root.clone())),
        StorageConfig::S3 {
            bucket,
            region,
            endpoint_url,
            access_key_env,
            secret_key_env,
        } => Arc::new(S3Store::new(&S3Settings {
            bucket: bucket.clone(),
            region: region.clone(),
            endpoint_url: endpoint_url.clone(),
            access_key_id: env_var(access_key_env)?,
            secret_access_key: env_var(secret_key_env)?,
        })),
    };
    log::info!("Storage: {}", store.describe());
    Ok(store)
}

fn env_var(name: &str) -> Result<String, String> {
    std::env::var(name).map_err(|_| format!("environment variable {name} is not set"))
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            log::warn!("🛑 interrupt received, cancelling in-flight datasets");
            token.cancel();
        }
    });
    cancel
}

fn parse_list(value: &str) -> Vec<String> {
    value
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

fn selected<'a>(
    datasets: &'a [CatalogDataset],
    filter: Option<&'a [String]>,
) -> impl Iterator<Item = &'a CatalogDataset> {
    datasets.iter().filter(move |d| {
        filter.map_or(d.enabled, |names| names.iter().any(|n| *n == d.spec.id))
    })
}
