//! In-memory projection of the live datasets.
//!
//! Each dataset is an ordered list of JSON items identified by their `id`
//! field, plus bookkeeping about its last mutation. Nothing here is
//! persisted; durable traffic goes through the session store.

use std::collections::HashMap;
use std::sync::{PoisonError, RwLock};

use chrono::Utc;
use log::{debug, warn};
use serde_json::Value;
use tokio::sync::broadcast;

use crate::error_handling::types::ProjectionError;
use crate::projection::types::{
    DataSlice, DatasetMetadata, DatasetStats, ExportedDataset, ProjectionEvent, ProjectionStats,
    Query, UpdateKind, UpdateResults,
};

const EVENT_CAPACITY: usize = 1024;
pub const DEFAULT_BATCH_SIZE: usize = 1000;

#[derive(Default)]
struct Dataset {
    items: Vec<Value>,
    metadata: DatasetMetadata,
}

impl Dataset {
    fn touch(&mut self, kind: UpdateKind, details: Option<UpdateResults>) {
        self.metadata.last_update = Some(Utc::now());
        self.metadata.update_count += 1;
        self.metadata.total_items = self.items.len();
        self.metadata.last_update_type = Some(kind);
        self.metadata.last_update_details = details;
    }

    fn position(&self, id: Option<&Value>) -> Option<usize> {
        self.items.iter().position(|item| item.get("id") == id)
    }

    fn apply(&mut self, patch: &Value, results: &mut UpdateResults) {
        let id = patch.get("id");
        if patch.get("action").and_then(Value::as_str) == Some("delete") {
            if let Some(index) = self.position(id) {
                self.items.remove(index);
                results.deleted += 1;
            }
            return;
        }
        match self.position(id) {
            Some(index) => {
                match (&mut self.items[index], patch) {
                    (Value::Object(existing), Value::Object(fields)) => {
                        for (key, value) in fields {
                            existing.insert(key.clone(), value.clone());
                        }
                    }
                    (existing, _) => *existing = patch.clone(),
                }
                results.updated += 1;
            }
            None => {
                self.items.push(patch.clone());
                results.inserted += 1;
            }
        }
    }
}

pub struct ProjectionStore {
    datasets: RwLock<HashMap<String, Dataset>>,
    events: broadcast::Sender<ProjectionEvent>,
}

impl ProjectionStore {
    pub fn new<I, S>(data_keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let datasets = data_keys
            .into_iter()
            .map(|key| (key.into(), Dataset::default()))
            .collect();
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            datasets: RwLock::new(datasets),
            events,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<ProjectionEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: ProjectionEvent) {
        if self.events.send(event).is_err() {
            debug!("No subscriber for projection event");
        }
    }

    pub fn has_dataset(&self, data_key: &str) -> bool {
        self.datasets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .contains_key(data_key)
    }

    fn with_dataset<T>(
        &self,
        data_key: &str,
        f: impl FnOnce(&mut Dataset) -> T,
    ) -> Result<T, ProjectionError> {
        let mut datasets = self.datasets.write().unwrap_or_else(PoisonError::into_inner);
        match datasets.get_mut(data_key) {
            Some(dataset) => Ok(f(dataset)),
            None => {
                warn!("Dataset {} does not exist", data_key);
                Err(ProjectionError::UnknownDataset(data_key.to_string()))
            }
        }
    }

    /// Items of a dataset; empty for an unknown key.
    pub fn get_data(&self, data_key: &str) -> Vec<Value> {
        self.datasets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(data_key)
            .map(|d| d.items.clone())
            .unwrap_or_default()
    }

    pub fn get_data_slice(&self, data_key: &str, start: usize, end: usize) -> DataSlice {
        let datasets = self.datasets.read().unwrap_or_else(PoisonError::into_inner);
        let items = datasets.get(data_key).map(|d| d.items.as_slice()).unwrap_or(&[]);
        let total = items.len();
        let clamped_end = end.min(total);
        DataSlice {
            data: items
                .get(start.min(clamped_end)..clamped_end)
                .unwrap_or(&[])
                .to_vec(),
            total,
            start,
            end: clamped_end,
        }
    }

    /// Replaces a dataset wholesale.
    pub fn set_data(&self, data_key: &str, items: Vec<Value>) -> Result<(), ProjectionError> {
        let total = self.with_dataset(data_key, |dataset| {
            dataset.items = items;
            dataset.touch(UpdateKind::Full, None);
            dataset.items.len()
        })?;
        debug!("Dataset {} replaced with {} item(s)", data_key, total);
        self.emit(ProjectionEvent::DataUpdated {
            data_key: data_key.to_string(),
            kind: UpdateKind::Full,
            results: None,
            total,
        });
        Ok(())
    }

    /// Applies a patch list by `id`.
    ///
    /// A patch with `"action": "delete"` removes the first item with its id.
    /// Any other patch is merged field by field onto the item with its id, or
    /// appended when there is none.
    pub fn handle_update(
        &self,
        data_key: &str,
        updates: &[Value],
    ) -> Result<UpdateResults, ProjectionError> {
        let (results, total) = self.with_dataset(data_key, |dataset| {
            let mut results = UpdateResults::default();
            for patch in updates {
                dataset.apply(patch, &mut results);
            }
            dataset.touch(UpdateKind::Incremental, Some(results));
            (results, dataset.items.len())
        })?;
        self.emit(ProjectionEvent::DataUpdated {
            data_key: data_key.to_string(),
            kind: UpdateKind::Incremental,
            results: Some(results),
            total,
        });
        Ok(results)
    }

    /// Applies `updates` in slices of `batch_size`, publishing a progress
    /// event after each slice.
    pub fn batch_update(
        &self,
        data_key: &str,
        updates: &[Value],
        batch_size: usize,
    ) -> Result<UpdateResults, ProjectionError> {
        if batch_size == 0 {
            return Err(ProjectionError::InvalidBatchSize);
        }
        if !self.has_dataset(data_key) {
            warn!("Dataset {} does not exist", data_key);
            return Err(ProjectionError::UnknownDataset(data_key.to_string()));
        }
        let total = updates.len();
        let mut processed = 0;
        let mut overall = UpdateResults::default();
        for chunk in updates.chunks(batch_size) {
            let results = self.handle_update(data_key, chunk)?;
            overall.updated += results.updated;
            overall.inserted += results.inserted;
            overall.deleted += results.deleted;
            processed += chunk.len();
            self.emit(ProjectionEvent::BatchProgress {
                data_key: data_key.to_string(),
                processed,
                total,
                progress: format!("{:.2}", processed as f64 / total as f64 * 100.0),
            });
        }
        Ok(overall)
    }

    pub fn search(&self, data_key: &str, query: Query<'_>) -> Vec<Value> {
        self.datasets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(data_key)
            .map(|d| d.items.iter().filter(|item| query.matches(item)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn find_by_id(&self, data_key: &str, id: &Value) -> Option<Value> {
        self.datasets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(data_key)
            .and_then(|d| d.position(Some(id)).map(|i| d.items[i].clone()))
    }

    pub fn clear_data(&self, data_key: &str) -> Result<(), ProjectionError> {
        self.with_dataset(data_key, |dataset| {
            dataset.items.clear();
            dataset.touch(UpdateKind::Clear, None);
        })?;
        self.emit(ProjectionEvent::DataCleared {
            data_key: data_key.to_string(),
        });
        Ok(())
    }

    pub fn clear_all(&self) {
        {
            let mut datasets = self.datasets.write().unwrap_or_else(PoisonError::into_inner);
            for dataset in datasets.values_mut() {
                dataset.items.clear();
                dataset.touch(UpdateKind::Clear, None);
            }
        }
        self.emit(ProjectionEvent::AllDataCleared);
    }

    pub fn metadata(&self, data_key: &str) -> Option<DatasetMetadata> {
        self.datasets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(data_key)
            .map(|d| d.metadata.clone())
    }

    pub fn all_metadata(&self) -> std::collections::BTreeMap<String, DatasetMetadata> {
        self.datasets
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .map(|(key, d)| (key.clone(), d.metadata.clone()))
            .collect()
    }

    pub fn stats(&self) -> ProjectionStats {
        let datasets = self.datasets.read().unwrap_or_else(PoisonError::into_inner);
        ProjectionStats {
            total_stores: datasets.len(),
            stores: datasets
                .iter()
                .map(|(key, d)| {
                    (
                        key.clone(),
                        DatasetStats {
                            item_count: d.items.len(),
                            last_update: d.metadata.last_update,
                            update_count: d.metadata.update_count,
                        },
                    )
                })
                .collect(),
        }
    }

    pub fn export_data(&self, data_key: &str) -> Result<ExportedDataset, ProjectionError> {
        let datasets = self.datasets.read().unwrap_or_else(PoisonError::into_inner);
        let dataset = datasets
            .get(data_key)
            .ok_or_else(|| ProjectionError::UnknownDataset(data_key.to_string()))?;
        Ok(ExportedDataset {
            data_key: data_key.to_string(),
            data: dataset.items.clone(),
            metadata: dataset.metadata.clone(),
            export_time: Utc::now(),
        })
    }

    /// Replaces a dataset with an exported snapshot of the same key.
    pub fn import_data(
        &self,
        data_key: &str,
        exported: ExportedDataset,
    ) -> Result<(), ProjectionError> {
        if exported.data_key != data_key {
            warn!("Dataset key mismatch in import");
            return Err(ProjectionError::DatasetMismatch {
                expected: data_key.to_string(),
                found: exported.data_key,
            });
        }
        self.set_data(data_key, exported.data)
    }
}
