//! Read-only tabular datasets and the loader interface.
//!
//! A [`Dataset`] is an immutable columnar table with statistics computed at
//! construction time. Datasets are owned by an external dataset service and
//! reach the pipeline through a [`DatasetLoader`]; callers share them as
//! `Arc<Dataset>` so rule execution can fan out over one view without copies.

mod stats;
mod table;
mod value;

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::RwLock;

pub use stats::{format_number, CategoryCount, ColumnStats, MAX_CATEGORIES};
pub use table::{Column, Dataset, DatasetSummary};
pub use value::{infer_column_type, parse_date, ColumnType, Value};

use crate::error::DatasetError;

/// Identifier of a dataset in the external dataset service.
pub type DatasetId = i64;

/// Source of datasets (`load_dataset(dataset_id) -> tabular view + column stats`).
#[async_trait]
pub trait DatasetLoader: Send + Sync {
    /// Loads the current version of a dataset.
    async fn load_dataset(&self, id: DatasetId) -> Result<Arc<Dataset>, DatasetError>;

    /// Whether the dataset is known to the service.
    async fn exists(&self, id: DatasetId) -> bool {
        self.load_dataset(id).await.is_ok()
    }
}

/// Loader backed by a map of preloaded datasets.
#[derive(Default)]
pub struct InMemoryDatasetLoader {
    datasets: RwLock<HashMap<DatasetId, Arc<Dataset>>>,
}

impl InMemoryDatasetLoader {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers (or replaces) a dataset under its own id.
    pub async fn insert(&self, dataset: Dataset) -> Arc<Dataset> {
        let dataset = Arc::new(dataset);
        self.datasets
            .write()
            .await
            .insert(dataset.id(), Arc::clone(&dataset));
        dataset
    }
}

#[async_trait]
impl DatasetLoader for InMemoryDatasetLoader {
    async fn load_dataset(&self, id: DatasetId) -> Result<Arc<Dataset>, DatasetError> {
        self.datasets
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(DatasetError::NotFound(id))
    }

    async fn exists(&self, id: DatasetId) -> bool {
        self.datasets.read().await.contains_key(&id)
    }
}

/// Loader reading JSON records files registered per dataset id.
///
/// Files are re-read on every load, so edits on disk show up in the next run.
#[derive(Default)]
pub struct JsonFileDatasetLoader {
    paths: RwLock<HashMap<DatasetId, PathBuf>>,
}

impl JsonFileDatasetLoader {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn register(&self, id: DatasetId, path: impl Into<PathBuf>) {
        self.paths.write().await.insert(id, path.into());
    }
}

#[async_trait]
impl DatasetLoader for JsonFileDatasetLoader {
    async fn load_dataset(&self, id: DatasetId) -> Result<Arc<Dataset>, DatasetError> {
        let path = self
            .paths
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(DatasetError::NotFound(id))?;
        let dataset = tokio::task::spawn_blocking(move || Dataset::load_json_file(id, path))
            .await
            .map_err(|e| DatasetError::InvalidPayload(format!("loader task failed: {}", e)))??;
        Ok(Arc::new(dataset))
    }

    async fn exists(&self, id: DatasetId) -> bool {
        match self.paths.read().await.get(&id) {
            Some(path) => path.is_file(),
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_in_memory_loader() {
        let loader = InMemoryDatasetLoader::new();
        let ds = Dataset::from_rows(42, &["a"], vec![vec![Value::Int(1)]]).unwrap();
        loader.insert(ds).await;

        assert!(loader.exists(42).await);
        assert!(!loader.exists(7).await);
        assert_eq!(loader.load_dataset(42).await.unwrap().row_count(), 1);
        assert!(matches!(
            loader.load_dataset(7).await,
            Err(DatasetError::NotFound(7))
        ));
    }

    #[tokio::test]
    async fn test_json_file_loader() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("orders.json");
        std::fs::write(&path, r#"[{"id": 1, "amount": 9.5}, {"id": 2, "amount": null}]"#).unwrap();

        let loader = JsonFileDatasetLoader::new();
        loader.register(3, &path).await;
        loader.register(4, dir.path().join("missing.json")).await;

        assert!(loader.exists(3).await);
        assert!(!loader.exists(4).await);
        assert!(!loader.exists(5).await);

        let ds = loader.load_dataset(3).await.unwrap();
        assert_eq!(ds.row_count(), 2);
        assert_eq!(ds.stats_for("amount").unwrap().null_count, 1);
        assert!(matches!(loader.load_dataset(4).await, Err(DatasetError::Io(_))));
    }
}
