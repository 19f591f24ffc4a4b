//! Resumption metadata stored as a sidecar of each artifact.
//!
//! For an artifact at `bronze/transparency/contracts.json` the metadata
//! lives at `bronze/transparency/.metadata/contracts.json.meta.json`.

use std::sync::Arc;

use bronze_ingest_models::ResumptionMetadata;

use crate::{ObjectStore, StorageError};

/// Sidecar metadata key for an artifact key.
#[must_use]
pub fn metadata_key(artifact_key: &str) -> String {
    match artifact_key.rsplit_once('/') {
        Some((dir, file)) => format!("{dir}/.metadata/{file}.meta.json"),
        None => format!(".metadata/{artifact_key}.meta.json"),
    }
}

/// Reads and replaces [`ResumptionMetadata`] through an [`ObjectStore`].
///
/// Every `put` replaces the whole object, so a reader sees either the old
/// or the new metadata and never a mix.
#[derive(Clone)]
pub struct MetadataStore {
    store: Arc<dyn ObjectStore>,
}

impl MetadataStore {
    /// Wraps an object store.
    #[must_use]
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self { store }
    }

    /// Loads metadata for the artifact at `artifact_key`.
    ///
    /// Returns `None` when no metadata exists. Metadata recorded for a
    /// different dataset id is treated as absent.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if the read fails or the stored object is
    /// not valid metadata.
    pub async fn get(
        &self,
        dataset_id: &str,
        artifact_key: &str,
    ) -> Result<Option<ResumptionMetadata>, StorageError> {
        let key = metadata_key(artifact_key);
        let Some(bytes) = self.store.read(&key).await? else {
            return Ok(None);
        };

        let metadata: ResumptionMetadata =
            serde_json::from_slice(&bytes).map_err(|source| StorageError::Metadata {
                key: key.clone(),
                source,
            })?;

        if metadata.dataset_id != dataset_id {
            log::warn!(
                "[{dataset_id}] metadata at {key} belongs to '{}', ignoring it",
                metadata.dataset_id
            );
            return Ok(None);
        }

        Ok(Some(metadata))
    }

    /// Replaces the metadata for the artifact at `artifact_key`.
    ///
    /// # Errors
    ///
    /// Returns [`StorageError`] if encoding or the write fails.
    pub async fn put(
        &self,
        artifact_key: &str,
        metadata: &ResumptionMetadata,
    ) -> Result<(), StorageError> {
        let key = metadata_key(artifact_key);
        let bytes =
            serde_json::to_vec_pretty(metadata).map_err(|source| StorageError::Metadata {
                key: key.clone(),
                source,
            })?;
        self.store.write(&key, &bytes).await?;
        log::debug!(
            "[{}] metadata saved: last_page={} total_records={} completed={}",
            metadata.dataset_id,
            metadata.last_page,
            metadata.total_records,
            metadata.completed
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::MemoryStore;

    #[test]
    fn sidecar_key_sits_next_to_artifact() {
        assert_eq!(
            metadata_key("bronze/transparency/contracts.json"),
            "bronze/transparency/.metadata/contracts.json.meta.json"
        );
        assert_eq!(metadata_key("top.json"), ".metadata/top.json.meta.json");
    }

    #[tokio::test]
    async fn absent_metadata_is_none() {
        let store = MetadataStore::new(Arc::new(MemoryStore::new()));
        assert_eq!(store.get("contracts", "b/contracts.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let memory = Arc::new(MemoryStore::new());
        let store = MetadataStore::new(memory.clone());
        let meta = ResumptionMetadata::now("contracts", 45, 22_500, true);

        store.put("b/contracts.json", &meta).await.unwrap();

        assert_eq!(
            store.get("contracts", "b/contracts.json").await.unwrap(),
            Some(meta)
        );
        assert_eq!(memory.keys(), vec!["b/.metadata/contracts.json.meta.json"]);
    }

    #[tokio::test]
    async fn foreign_dataset_metadata_is_ignored() {
        let store = MetadataStore::new(Arc::new(MemoryStore::new()));
        let meta = ResumptionMetadata::now("other", 3, 10, true);
        store.put("b/contracts.json", &meta).await.unwrap();

        assert_eq!(store.get("contracts", "b/contracts.json").await.unwrap(), None);
    }

    #[tokio::test]
    async fn corrupt_metadata_is_an_error() {
        let memory = Arc::new(MemoryStore::new());
        memory.seed("b/.metadata/contracts.json.meta.json", b"{not json");
        let store = MetadataStore::new(memory);

        assert!(matches!(
            store.get("contracts", "b/contracts.json").await,
            Err(StorageError::Metadata { .. })
        ));
    }
}
