use std::time::Duration;

use serde::Deserialize;

use crate::network::types::{ConnectionSpec, ReconnectSettings};
use crate::storage::rotation::{RotationKind, RotationPolicy};

/// `[[connections]]` entry: one named feed of the Connection Manager.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
pub struct ConnectionConfig {
    pub name: String,
    pub url: String,
}

impl From<&ConnectionConfig> for ConnectionSpec {
    fn from(config: &ConnectionConfig) -> Self {
        ConnectionSpec {
            name: config.name.clone(),
            url: config.url.clone(),
        }
    }
}

/// `[reconnect]` table.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct ReconnectConfig {
    pub base_interval_ms: u64,
    pub max_delay_ms: u64,
    /// Absent means unlimited.
    pub max_attempts: Option<u32>,
    pub ping_interval_ms: u64,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_interval_ms: 5_000,
            max_delay_ms: 30_000,
            max_attempts: None,
            ping_interval_ms: 30_000,
        }
    }
}

impl ReconnectConfig {
    pub fn settings(&self) -> ReconnectSettings {
        ReconnectSettings {
            base_interval: Duration::from_millis(self.base_interval_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
            ping_interval: Duration::from_millis(self.ping_interval_ms),
        }
    }
}

/// `[rotation]` table. Only the limit matching `kind` is used.
#[derive(Debug, PartialEq, Eq, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct RotationConfig {
    pub kind: RotationKind,
    pub max_records: u64,
    pub max_size: u64,
    pub max_duration_ms: u64,
    pub enabled: bool,
}

impl Default for RotationConfig {
    fn default() -> Self {
        Self {
            kind: RotationKind::CountBased,
            max_records: 10_000,
            max_size: 100 * 1024 * 1024,
            max_duration_ms: 60 * 60 * 1000,
            enabled: true,
        }
    }
}

impl RotationConfig {
    pub fn policy(&self) -> RotationPolicy {
        let policy = match self.kind {
            RotationKind::CountBased => RotationPolicy::count_based(self.max_records),
            RotationKind::SizeBased => RotationPolicy::size_based(self.max_size),
            RotationKind::TimeBased => RotationPolicy::time_based(self.max_duration_ms),
            RotationKind::Manual => RotationPolicy::manual(),
            RotationKind::Disabled => RotationPolicy::disabled(),
        };
        RotationPolicy {
            enabled: policy.enabled && self.enabled,
            ..policy
        }
    }
}

/// `[projection]` table.
#[derive(Debug, PartialEq, Eq, Clone, Deserialize)]
#[serde(default)]
pub struct ProjectionConfig {
    /// Dataset keys; when empty, the connection names are used.
    pub datasets: Vec<String>,
    pub batch_size: usize,
}

impl Default for ProjectionConfig {
    fn default() -> Self {
        Self {
            datasets: Vec::new(),
            batch_size: 1000,
        }
    }
}
