//! Append-only JSON-lines audit log.
//!
//! One [`AuditRecord`] per line. Lines are written with a single
//! `write_all` in append mode under a lock. A torn final line, whether
//! left by a killed process or by a failed write in this one, is
//! terminated before the next record is written, so every complete line
//! always parses on its own.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use bronze_ingest_models::AuditRecord;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::Mutex;

/// Errors that can occur while writing or reading the audit log.
#[derive(Debug, thiserror::Error)]
pub enum AuditError {
    /// The log file could not be opened or written.
    #[error("Audit log {}: {source}", path.display())]
    Io {
        /// Log path.
        path: PathBuf,
        /// Underlying I/O error.
        source: std::io::Error,
    },

    /// A record could not be encoded.
    #[error("Failed to encode audit record: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Destination for audit records.
#[async_trait]
pub trait AuditSink: Send + Sync {
    /// Appends one record.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError`] if the record cannot be persisted.
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError>;
}

/// File-backed [`AuditSink`].
#[derive(Debug)]
pub struct AuditLog {
    path: PathBuf,
    file: Mutex<LineWriter<tokio::fs::File>>,
}

/// Writes whole lines, remembering when a write failed partway.
#[derive(Debug)]
struct LineWriter<W> {
    inner: W,
    torn: bool,
}

impl<W: AsyncWrite + Unpin> LineWriter<W> {
    const fn new(inner: W) -> Self {
        Self { inner, torn: false }
    }

    /// Writes `line` (which must end with `\n`), first terminating any
    /// partial line a previous failed write left behind.
    async fn write_line(&mut self, line: &[u8]) -> std::io::Result<()> {
        if self.torn {
            self.inner.write_all(b"\n").await?;
            self.torn = false;
        }

        let result = match self.inner.write_all(line).await {
            Ok(()) => self.inner.flush().await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.torn = true;
        }
        result
    }
}

impl AuditLog {
    /// Opens (or creates) the log at `path`, creating parent directories.
    ///
    /// # Errors
    ///
    /// Returns [`AuditError::Io`] if the file cannot be opened.
    pub async fn open(path: &Path) -> Result<Self, AuditError> {
        let io_err = |source| AuditError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            tokio::fs::create_dir_all(parent).await.map_err(io_err)?;
        }

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .read(true)
            .append(true)
            .open(path)
            .await
            .map_err(io_err)?;

        let len = file.metadata().await.map_err(io_err)?.len();
        if len > 0 {
            file.seek(std::io::SeekFrom::Start(len - 1))
                .await
                .map_err(io_err)?;
            let mut last = [0u8; 1];
            file.read_exact(&mut last).await.map_err(io_err)?;
            if last[0] != b'\n' {
                log::warn!(
                    "audit log {} ends with a partial line, terminating it",
                    path.display()
                );
                file.write_all(b"\n").await.map_err(io_err)?;
                file.flush().await.map_err(io_err)?;
            }
        }

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(LineWriter::new(file)),
        })
    }

    /// Log location.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl AuditSink for AuditLog {
    async fn append(&self, record: &AuditRecord) -> Result<(), AuditError> {
        let mut line = serde_json::to_vec(record)?;
        line.push(b'\n');

        self.file
            .lock()
            .await
            .write_line(&line)
            .await
            .map_err(|source| AuditError::Io {
                path: self.path.clone(),
                source,
            })?;

        log::debug!(
            "[{}] audit: {} ({} pages, {} records)",
            record.dataset_id,
            record.status,
            record.pages_fetched,
            record.records_fetched
        );
        Ok(())
    }
}

/// Reads every parsable record from an audit log. Unparsable lines are
/// skipped with a warning. A missing file yields no records.
///
/// # Errors
///
/// Returns [`AuditError::Io`] if the file exists but cannot be read.
pub async fn read_records(path: &Path) -> Result<Vec<AuditRecord>, AuditError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(source) => {
            return Err(AuditError::Io {
                path: path.to_path_buf(),
                source,
            });
        }
    };

    let mut records = Vec::new();
    for (index, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<AuditRecord>(line) {
            Ok(record) => records.push(record),
            Err(e) => log::warn!(
                "{}:{}: skipping unparsable audit line: {e}",
                path.display(),
                index + 1
            ),
        }
    }
    Ok(records)
}
