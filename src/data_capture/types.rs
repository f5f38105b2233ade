//! Common data types used across the data_capture subsystem.

use serde::{Deserialize, Serialize};

/// Direction of a recorded frame relative to this process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    /// Received from the remote server.
    Inbound,
    /// Sent by this process.
    Outbound,
    Unknown,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::Inbound => "inbound",
            Direction::Outbound => "outbound",
            Direction::Unknown => "unknown",
        }
    }
}

/// Totals of one routing task, returned when it stops.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RoutingSummary {
    /// Messages handed to the target store.
    pub applied: u64,
    /// Messages the target had no use for (no open session, passthrough
    /// frames, unknown dataset).
    pub skipped: u64,
    /// Messages the target failed to apply.
    pub failed: u64,
    /// Events lost because the task fell behind the channel.
    pub lagged: u64,
}
