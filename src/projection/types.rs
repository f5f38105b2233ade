use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Kind of the last mutation applied to a dataset.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UpdateKind {
    Full,
    Incremental,
    Clear,
}

/// Counts produced by applying a patch list.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateResults {
    pub updated: usize,
    pub inserted: usize,
    pub deleted: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetMetadata {
    pub last_update: Option<DateTime<Utc>>,
    pub update_count: u64,
    pub total_items: usize,
    pub last_update_type: Option<UpdateKind>,
    pub last_update_details: Option<UpdateResults>,
}

/// A window `[start, end)` of a dataset; `end` is clamped to `total`.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DataSlice {
    pub data: Vec<Value>,
    pub total: usize,
    pub start: usize,
    pub end: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DatasetStats {
    pub item_count: usize,
    pub last_update: Option<DateTime<Utc>>,
    pub update_count: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProjectionStats {
    pub total_stores: usize,
    pub stores: BTreeMap<String, DatasetStats>,
}

/// Snapshot produced by `export_data` and accepted by `import_data`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExportedDataset {
    pub data_key: String,
    pub data: Vec<Value>,
    pub metadata: DatasetMetadata,
    pub export_time: DateTime<Utc>,
}

/// Selection for `search`.
pub enum Query<'a> {
    Predicate(&'a (dyn Fn(&Value) -> bool + Send + Sync)),
    /// Every listed field must be equal.
    Fields(&'a Map<String, Value>),
}

impl Query<'_> {
    pub fn matches(&self, item: &Value) -> bool {
        match self {
            Query::Predicate(predicate) => predicate(item),
            Query::Fields(fields) => fields
                .iter()
                .all(|(key, expected)| item.get(key) == Some(expected)),
        }
    }
}

/// Change notifications of the projection store.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "camelCase")]
pub enum ProjectionEvent {
    #[serde(rename_all = "camelCase")]
    DataUpdated {
        data_key: String,
        kind: UpdateKind,
        results: Option<UpdateResults>,
        total: usize,
    },
    #[serde(rename_all = "camelCase")]
    DataCleared { data_key: String },
    AllDataCleared,
    #[serde(rename_all = "camelCase")]
    BatchProgress {
        data_key: String,
        processed: usize,
        total: usize,
        /// Percentage with two decimals, e.g. `"33.33"`.
        progress: String,
    },
}
