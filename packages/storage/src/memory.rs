//! In-memory object store.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use bronze_ingest_models::ContentFingerprint;

use crate::{ObjectStore, StorageError};

/// Object store kept in a map. Counts writes so callers can assert that a
/// run touched nothing.
#[derive(Debug, Default)]
pub struct MemoryStore {
    objects: Mutex<BTreeMap<String, Vec<u8>>>,
    writes: AtomicUsize,
}

impl MemoryStore {
    /// Creates an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of successful `write` calls so far.
    #[must_use]
    pub fn write_count(&self) -> usize {
        self.writes.load(Ordering::SeqCst)
    }

    /// Keys currently stored, in order.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.objects
            .lock()
            .map(|objects| objects.keys().cloned().collect())
            .unwrap_or_default()
    }

    /// Inserts an object without counting it as a write.
    pub fn seed(&self, key: &str, bytes: &[u8]) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.insert(key.to_string(), bytes.to_vec());
        }
    }

    /// Removes an object without counting it as a write.
    pub fn remove(&self, key: &str) {
        if let Ok(mut objects) = self.objects.lock() {
            objects.remove(key);
        }
    }

    fn poisoned(key: &str) -> Box<dyn std::error::Error + Send + Sync> {
        format!("memory store lock poisoned while accessing {key}").into()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn read(&self, key: &str) -> Result<Option<Vec<u8>>, StorageError> {
        let objects = self.objects.lock().map_err(|_| StorageError::Read {
            key: key.to_string(),
            source: Self::poisoned(key),
        })?;
        Ok(objects.get(key).cloned())
    }

    async fn write(&self, key: &str, bytes: &[u8]) -> Result<(), StorageError> {
        let mut objects = self.objects.lock().map_err(|_| StorageError::Write {
            key: key.to_string(),
            source: Self::poisoned(key),
        })?;
        objects.insert(key.to_string(), bytes.to_vec());
        self.writes.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn head(&self, key: &str) -> Result<Option<ContentFingerprint>, StorageError> {
        let objects = self.objects.lock().map_err(|_| StorageError::Head {
            key: key.to_string(),
            source: Self::poisoned(key),
        })?;
        Ok(objects.get(key).map(|bytes| ContentFingerprint::of(bytes)))
    }

    fn describe(&self) -> String {
        "memory://".to_string()
    }
}
