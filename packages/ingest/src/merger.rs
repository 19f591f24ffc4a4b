//! Page accumulation on scratch storage.
//!
//! Each appended page is written to its own JSON-lines unit file inside a
//! per-run temporary directory, so memory use is bounded by one page.
//! [`StreamMerger::finalize`] streams every unit into a single compact
//! JSON array and fingerprints it on the way. The scratch directory is a
//! [`tempfile::TempDir`] and is removed when the merger (or the
//! [`Artifact`] it produced) is dropped, whichever way the run ends.

use std::path::{Path, PathBuf};

use bronze_ingest_models::{ContentFingerprint, PageResult};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter};

use crate::IngestError;

/// Unit file holding records carried over from an existing artifact.
const SEED_UNIT: &str = "page-000000.jsonl";

/// Accumulates pages for one dataset run.
#[derive(Debug)]
pub struct StreamMerger {
    scratch: tempfile::TempDir,
    units: Vec<PathBuf>,
    last_page: Option<u32>,
    seeded_records: u64,
    appended_records: u64,
    appended_pages: u32,
}

impl StreamMerger {
    /// Creates a merger with a fresh scratch directory under `parent`, or
    /// under the system temp directory when `parent` is `None`.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Io`] if the scratch directory cannot be
    /// created.
    pub fn new(parent: Option<&Path>) -> Result<Self, IngestError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix("bronze-merge-");
        let scratch = match parent {
            Some(dir) => {
                std::fs::create_dir_all(dir)?;
                builder.tempdir_in(dir)?
            }
            None => builder.tempdir()?,
        };

        Ok(Self {
            scratch,
            units: Vec::new(),
            last_page: None,
            seeded_records: 0,
            appended_records: 0,
            appended_pages: 0,
        })
    }

    /// Scratch directory for this run.
    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Carries the records of an existing artifact into this run. Must be
    /// called before the first [`Self::append`].
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::CorruptArtifact`] if `artifact` is not a JSON
    /// array, or [`IngestError::Io`] on scratch write failures.
    pub async fn seed(&mut self, key: &str, artifact: &[u8]) -> Result<u64, IngestError> {
        if !self.units.is_empty() {
            return Err(IngestError::SeedAfterAppend);
        }

        let records: Vec<serde_json::Value> =
            serde_json::from_slice(artifact).map_err(|source| IngestError::CorruptArtifact {
                key: key.to_string(),
                source,
            })?;

        let path = self.scratch.path().join(SEED_UNIT);
        write_unit(&path, &records).await?;
        self.units.push(path);
        self.seeded_records = records.len() as u64;
        Ok(self.seeded_records)
    }

    /// Persists one page to scratch storage.
    ///
    /// Pages must arrive in strictly increasing index order; the merged
    /// artifact preserves that order.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::OutOfOrder`] for a page index not above the
    /// previous one, or [`IngestError::Io`] on scratch write failures.
    pub async fn append(&mut self, page: &PageResult) -> Result<(), IngestError> {
        if let Some(previous) = self.last_page
            && page.page_index <= previous
        {
            return Err(IngestError::OutOfOrder {
                previous,
                page: page.page_index,
            });
        }

        let path = self
            .scratch
            .path()
            .join(format!("page-{:06}.jsonl", page.page_index));
        write_unit(&path, &page.records).await?;

        self.units.push(path);
        self.last_page = Some(page.page_index);
        self.appended_records += page.len() as u64;
        self.appended_pages += 1;
        Ok(())
    }

    /// Records carried over from the existing artifact.
    #[must_use]
    pub const fn seeded_records(&self) -> u64 {
        self.seeded_records
    }

    /// Records appended during this run.
    #[must_use]
    pub const fn appended_records(&self) -> u64 {
        self.appended_records
    }

    /// Pages appended during this run.
    #[must_use]
    pub const fn appended_pages(&self) -> u32 {
        self.appended_pages
    }

    /// Seeded plus appended records.
    #[must_use]
    pub const fn total_records(&self) -> u64 {
        self.seeded_records + self.appended_records
    }

    /// Merges every unit into one JSON array artifact.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Io`] if a unit cannot be read or the
    /// artifact cannot be written.
    pub async fn finalize(self) -> Result<Artifact, IngestError> {
        let path = self.scratch.path().join("artifact.json");
        let file = tokio::fs::File::create(&path).await?;
        let mut out = BufWriter::new(file);
        let mut context = md5::Context::new();
        let mut bytes: u64 = 0;
        let mut records: u64 = 0;

        out.write_all(b"[").await?;
        context.consume(b"[");
        bytes += 1;

        for unit in &self.units {
            let mut lines = BufReader::new(tokio::fs::File::open(unit).await?).lines();
            while let Some(line) = lines.next_line().await? {
                if line.is_empty() {
                    continue;
                }
                if records > 0 {
                    out.write_all(b",").await?;
                    context.consume(b",");
                    bytes += 1;
                }
                out.write_all(line.as_bytes()).await?;
                context.consume(line.as_bytes());
                bytes += line.len() as u64;
                records += 1;
            }
        }

        out.write_all(b"]").await?;
        context.consume(b"]");
        bytes += 1;
        out.flush().await?;

        for unit in &self.units {
            let _ = tokio::fs::remove_file(unit).await;
        }

        Ok(Artifact {
            scratch: self.scratch,
            path,
            fingerprint: ContentFingerprint::from_context(context),
            records,
            bytes,
        })
    }
}

/// Writes records one per line.
async fn write_unit(path: &Path, records: &[serde_json::Value]) -> Result<(), IngestError> {
    let file = tokio::fs::File::create(path).await?;
    let mut out = BufWriter::new(file);
    for record in records {
        let line = serde_json::to_vec(record)?;
        out.write_all(&line).await?;
        out.write_all(b"\n").await?;
    }
    out.flush().await?;
    Ok(())
}

/// A merged artifact on scratch storage.
///
/// Owns the scratch directory; dropping it removes the file.
#[derive(Debug)]
pub struct Artifact {
    scratch: tempfile::TempDir,
    path: PathBuf,
    /// MD5 of the artifact bytes.
    pub fingerprint: ContentFingerprint,
    /// Records in the artifact.
    pub records: u64,
    /// Artifact size in bytes.
    pub bytes: u64,
}

impl Artifact {
    /// Location of the merged file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Scratch directory that will be removed with this artifact.
    #[must_use]
    pub fn scratch_dir(&self) -> &Path {
        self.scratch.path()
    }

    /// Reads the artifact for upload.
    ///
    /// # Errors
    ///
    /// Returns [`IngestError::Io`] if the file cannot be read.
    pub async fn read_bytes(&self) -> Result<Vec<u8>, IngestError> {
        Ok(tokio::fs::read(&self.path).await?)
    }
}
