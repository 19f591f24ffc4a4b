#![cfg_attr(feature = "fail-on-warnings", deny(warnings))]
#![warn(clippy::all, clippy::pedantic, clippy::nursery, clippy::cargo)]
#![allow(clippy::multiple_crate_versions, clippy::cargo_common_metadata)]

//! Terminal plumbing for the `bronze` binary.
//!
//! Provides `indicatif`-backed progress bars behind the engine's
//! [`RunProgress`] trait, plus [`init_logger`] which sets up
//! `indicatif-log-bridge` so that `log::info!` and friends are suspended
//! while progress bars redraw.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use bronze_ingest::progress::RunProgress;
use bronze_ingest_models::AuditStatus;
use indicatif::{ProgressBar, ProgressStyle};

pub use indicatif::MultiProgress;

/// One overall dataset bar plus a spinner per in-flight dataset.
pub struct IndicatifProgress {
    multi: MultiProgress,
    overall: ProgressBar,
    /// Style to switch to once the number of datasets is known.
    overall_style: ProgressStyle,
    running: Mutex<BTreeMap<String, ProgressBar>>,
}

impl IndicatifProgress {
    /// Creates the reporter behind the engine's progress trait.
    #[must_use]
    pub fn datasets_bar(multi: &MultiProgress, message: &str) -> Arc<dyn RunProgress> {
        Arc::new(Self::new(multi, message))
    }

    /// The overall bar starts as a spinner and becomes a bar on
    /// [`RunProgress::datasets_planned`].
    #[must_use]
    pub fn new(multi: &MultiProgress, message: &str) -> Self {
        let overall = multi.add(ProgressBar::new_spinner());
        overall.enable_steady_tick(Duration::from_millis(100));
        overall.set_style(
            ProgressStyle::with_template("{spinner:.green} {msg}")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        overall.set_message(message.to_string());

        let overall_style = ProgressStyle::with_template(
            "{msg} {wide_bar:.green/dim} {pos}/{len} [{elapsed_precise}]",
        )
        .unwrap_or_else(|_| ProgressStyle::default_bar())
        .progress_chars("##-");

        Self {
            multi: multi.clone(),
            overall,
            overall_style,
            running: Mutex::new(BTreeMap::new()),
        }
    }

    fn dataset_spinner(&self, dataset_id: &str) -> ProgressBar {
        let bar = self.multi.add(ProgressBar::new_spinner());
        bar.enable_steady_tick(Duration::from_millis(100));
        bar.set_style(
            ProgressStyle::with_template("  {spinner:.cyan} {msg} [{elapsed}]")
                .unwrap_or_else(|_| ProgressStyle::default_spinner()),
        );
        bar.set_message(format!("[{dataset_id}] starting"));
        bar
    }
}

impl RunProgress for IndicatifProgress {
    fn datasets_planned(&self, total: u64) {
        self.overall.set_length(total);
        self.overall.set_position(0);
        self.overall.set_style(self.overall_style.clone());
    }

    fn dataset_started(&self, dataset_id: &str) {
        let bar = self.dataset_spinner(dataset_id);
        if let Ok(mut running) = self.running.lock()
            && let Some(previous) = running.insert(dataset_id.to_string(), bar)
        {
            previous.finish_and_clear();
        }
    }

    fn page_fetched(&self, dataset_id: &str, page: u32, total_records: u64) {
        if let Ok(running) = self.running.lock()
            && let Some(bar) = running.get(dataset_id)
        {
            bar.set_message(format!(
                "[{dataset_id}] page {page} · {total_records} records"
            ));
        }
    }

    fn dataset_finished(&self, dataset_id: &str, status: AuditStatus) {
        let bar = self
            .running
            .lock()
            .ok()
            .and_then(|mut running| running.remove(dataset_id));
        if let Some(bar) = bar {
            bar.finish_and_clear();
        }
        if status == AuditStatus::Failed {
            self.overall.set_message(format!("last failure: {dataset_id}"));
        }
        self.overall.inc(1);
    }

    fn run_finished(&self, summary: &str) {
        if let Ok(mut running) = self.running.lock() {
            for (_, bar) in std::mem::take(&mut *running) {
                bar.finish_and_clear();
            }
        }
        self.overall.finish_with_message(summary.to_string());
    }
}

/// Initializes the global logger wrapped in `indicatif-log-bridge` so that
/// `log::info!` and friends are suspended while progress bars redraw.
///
/// Returns the [`MultiProgress`] that all progress bars must be added to.
#[must_use]
pub fn init_logger() -> MultiProgress {
    let multi = MultiProgress::new();

    let logger = pretty_env_logger::formatted_builder()
        .parse_env("RUST_LOG")
        .build();
    let level = logger.filter();

    // Already set in tests.
    indicatif_log_bridge::LogWrapper::new(multi.clone(), logger)
        .try_init()
        .ok();

    log::set_max_level(level);

    multi
}
