//! Short-lived local markers for datasets recently found up to date.
//!
//! A marker is a small JSON file named after the SHA-256 of the artifact
//! key. Within the TTL the runner skips the dataset without touching the
//! network. Markers that are expired, unreadable, or written for another
//! key are ignored.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

#[derive(Debug, Serialize, Deserialize)]
struct Marker {
    key: String,
    status: String,
    marked_at: DateTime<Utc>,
}

const UP_TO_DATE: &str = "skipped_up_to_date";

/// TTL cache of "already current" outcomes.
#[derive(Debug, Clone)]
pub struct SkipMarkerCache {
    dir: PathBuf,
    ttl: Duration,
}

impl SkipMarkerCache {
    /// Creates a cache in `dir`. Returns `None` when `ttl` is zero.
    #[must_use]
    pub fn new(dir: impl Into<PathBuf>, ttl: Duration) -> Option<Self> {
        if ttl.is_zero() {
            return None;
        }
        Some(Self {
            dir: dir.into(),
            ttl,
        })
    }

    /// Marker directory.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn marker_path(&self, key: &str) -> PathBuf {
        let digest = hex::encode(Sha256::digest(key.as_bytes()));
        self.dir.join(format!("{digest}.json"))
    }

    /// Whether `key` was marked up to date within the TTL.
    pub async fn is_fresh(&self, key: &str) -> bool {
        let Ok(bytes) = tokio::fs::read(self.marker_path(key)).await else {
            return false;
        };
        let Ok(marker) = serde_json::from_slice::<Marker>(&bytes) else {
            return false;
        };
        if marker.key != key || marker.status != UP_TO_DATE {
            return false;
        }

        let age = Utc::now().signed_duration_since(marker.marked_at);
        age.to_std().is_ok_and(|age| age < self.ttl)
    }

    /// Marks `key` as up to date now. Failures are logged and ignored.
    pub async fn mark_up_to_date(&self, key: &str) {
        let marker = Marker {
            key: key.to_string(),
            status: UP_TO_DATE.to_string(),
            marked_at: Utc::now(),
        };
        let path = self.marker_path(key);

        let result = async {
            tokio::fs::create_dir_all(&self.dir).await?;
            let bytes = serde_json::to_vec(&marker).map_err(std::io::Error::other)?;
            tokio::fs::write(&path, bytes).await
        }
        .await;

        if let Err(e) = result {
            log::warn!("could not write skip marker {}: {e}", path.display());
        }
    }

    /// Removes the marker for `key`, if any.
    pub async fn clear(&self, key: &str) {
        let _ = tokio::fs::remove_file(self.marker_path(key)).await;
    }
}
