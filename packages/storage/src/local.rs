//! Filesystem-backed object store.

use std::path::{Component, Path, PathBuf};

use async_trait::async_trait;
use bronze_ingest_models::ContentFingerprint;

use crate::{ObjectStore, StorageError};

/// Stores objects as files under a root directory.
///
/// Keys are relative paths (`bronze/transparency/contracts.json`). Writes
/// land in a uniquely named sibling temp file first and are renamed into
/// place, so a crash mid-write leaves the previous object intact.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    /// Creates a store rooted at `root`. The directory is created lazily
    /// on first write.
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// The root directory.
    #[must_use]
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resolves a key to a path under the root, rejecting absolute keys
    /// and `..` components.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError::InvalidKey`] if the key would escape the
    /// root.
    pub fn path_for(&self, key: &str) -> Result<PathBuf, StorageError> {
        let relative = Path::new(key);
        if key.is_empty()
            || relative
                .components()
                .any(|c| !matches!(c, Component::Normal(_)))
        {
            return Err(StorageError::InvalidKey {
                key: key.to_string(),
                reason: "keys must be relative paths without '.' or '..'".to_string(),
            });
        }
        Ok(self.root.join(relative))
    }
}

#[async_trait]
impl ObjectStore for LocalStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let path = self.path_for(key)?;
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(StorageError::Read {
                key: key.to_string(),
                source: Box::new(e),
            }),
        }
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let path = self.path_for(key)?;
        let write_err = |e: std::io::Error| StorageError::Write {
            key: key.to_string(),
            source: Box::new(e),
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(write_err)?;
        }

        let file_name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let temp = path.with_file_name(format!(".{file_name}.{}.tmp", uuid::Uuid::new_v4()));

        if let Err(e) = tokio::fs::write(&temp, bytes).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(write_err(e));
        }
        if let Err(e) = tokio::fs::rename(&temp, &path).await {
            let _ = tokio::fs::remove_file(&temp).await;
            return Err(write_err(e));
        }

        log::debug!("wrote {} ({} bytes)", path.display(), bytes.len());
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ContentFingerprint>, StorageError> {
        let path = self.path_for(key)?;
        if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(None);
        }

        let head_err = |e: std::io::Error| StorageError::Head {
            key: key.to_string(),
            source: Box::new(e),
        };
        let fingerprint = tokio::task::spawn_blocking(move || compute_md5_sync(&path))
            .await
            .map_err(|e| head_err(std::io::Error::other(e)))?;

        match fingerprint {
            Ok(fp) => Ok(Some(fp)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(head_err(e)),
        }
    }

    fn describe(&self) -> String {
        format!("file://{}", self.root.display())
    }
}

/// MD5 of a file, streamed in chunks (runs in a blocking thread).
fn compute_md5_sync(path: &Path) -> Result<ContentFingerprint, std::io::Error> {
    use std::io::Read;

    let mut file = std::fs::File::open(path)?;
    let mut context = md5::Context::new();
    let mut buffer = vec![0u8; 256 * 1024];
    loop {
        let n = file.read(&mut buffer)?;
        if n == 0 {
            break;
        }
        context.consume(&buffer[..n]);
    }
    Ok(ContentFingerprint::from_context(context))
}
