//! Table rotation policies and bookkeeping.
//!
//! A rotated family maps a base name such as `websocketData` onto physical
//! tables `websocketData_001`, `websocketData_002`, ... Exactly one of them
//! is current and receives inserts; indices only ever grow.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RotationKind {
    CountBased,
    SizeBased,
    TimeBased,
    Manual,
    Disabled,
}

impl RotationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RotationKind::CountBased => "count_based",
            RotationKind::SizeBased => "size_based",
            RotationKind::TimeBased => "time_based",
            RotationKind::Manual => "manual",
            RotationKind::Disabled => "disabled",
        }
    }
}

/// Rotation parameters for one family.
///
/// `threshold` is a record count, a byte count or a duration in
/// milliseconds depending on `kind`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RotationPolicy {
    pub kind: RotationKind,
    pub threshold: u64,
    pub enabled: bool,
}

impl RotationPolicy {
    pub fn count_based(max_records: u64) -> Self {
        Self {
            kind: RotationKind::CountBased,
            threshold: max_records,
            enabled: true,
        }
    }

    pub fn size_based(max_bytes: u64) -> Self {
        Self {
            kind: RotationKind::SizeBased,
            threshold: max_bytes,
            enabled: true,
        }
    }

    pub fn time_based(max_age_ms: u64) -> Self {
        Self {
            kind: RotationKind::TimeBased,
            threshold: max_age_ms,
            enabled: true,
        }
    }

    pub fn manual() -> Self {
        Self {
            kind: RotationKind::Manual,
            threshold: 0,
            enabled: true,
        }
    }

    pub fn disabled() -> Self {
        Self {
            kind: RotationKind::Disabled,
            threshold: 0,
            enabled: false,
        }
    }

    /// Whether the current table must be closed before the next insert.
    ///
    /// Manual and disabled policies never rotate on their own, and a zero
    /// threshold is treated as "no limit".
    pub fn should_rotate(&self, stats: &TableStats, now: DateTime<Utc>) -> bool {
        if !self.enabled || self.threshold == 0 {
            return false;
        }
        match self.kind {
            RotationKind::CountBased => stats.record_count >= self.threshold,
            RotationKind::SizeBased => stats.data_size >= self.threshold,
            RotationKind::TimeBased => {
                let age = now.signed_duration_since(stats.created_at);
                age >= Duration::milliseconds(self.threshold.min(i64::MAX as u64) as i64)
            }
            RotationKind::Manual | RotationKind::Disabled => false,
        }
    }

    pub fn reason(&self) -> String {
        match self.kind {
            RotationKind::CountBased => format!("record count reached {}", self.threshold),
            RotationKind::SizeBased => format!("data size reached {} bytes", self.threshold),
            RotationKind::TimeBased => format!("table age reached {} ms", self.threshold),
            RotationKind::Manual | RotationKind::Disabled => "manual rotation".to_string(),
        }
    }
}

impl Default for RotationPolicy {
    fn default() -> Self {
        Self::count_based(10_000)
    }
}

/// Accumulated statistics of the current physical table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TableStats {
    pub record_count: u64,
    pub data_size: u64,
    pub created_at: DateTime<Utc>,
}

impl TableStats {
    pub fn empty(created_at: DateTime<Utc>) -> Self {
        Self {
            record_count: 0,
            data_size: 0,
            created_at,
        }
    }
}

/// Physical name of table `index` in family `base`.
pub fn physical_table_name(base: &str, index: u32) -> String {
    format!("{}_{:03}", base, index)
}

/// Parses the index out of a physical name of family `base`.
pub fn parse_table_index(base: &str, table: &str) -> Option<u32> {
    let suffix = table.strip_prefix(base)?.strip_prefix('_')?;
    if suffix.len() < 3 || !suffix.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    suffix.parse().ok().filter(|i| *i > 0)
}

/// Index suffix applied to index names of physical table `index`.
pub fn index_suffix(index: u32) -> String {
    format!("_{:03}", index)
}

/// Describes a rotation performed by an insert or an explicit rotate call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationEvent {
    pub base_name: String,
    pub from_table: String,
    pub to_table: String,
    pub records_in_closed_table: u64,
    pub data_size_in_closed_table: u64,
    pub reason: String,
    pub rotated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhysicalTableStats {
    pub table_name: String,
    pub index: u32,
    pub record_count: u64,
}

/// Report returned by `Database::table_rotation_stats`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotationStats {
    pub base_name: String,
    pub enabled: bool,
    pub kind: RotationKind,
    pub threshold: u64,
    pub current_index: u32,
    pub current_table: String,
    pub tables: Vec<PhysicalTableStats>,
    pub total_tables: usize,
    pub total_records: u64,
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn stats(records: u64, bytes: u64) -> TableStats {
        TableStats {
            record_count: records,
            data_size: bytes,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn count_based_rotates_at_threshold() {
        let policy = RotationPolicy::count_based(10);
        let now = Utc::now();
        assert!(!policy.should_rotate(&stats(9, 0), now));
        assert!(policy.should_rotate(&stats(10, 0), now));
    }

    #[test]
    fn size_based_uses_bytes() {
        let policy = RotationPolicy::size_based(100);
        let now = Utc::now();
        assert!(!policy.should_rotate(&stats(1000, 99), now));
        assert!(policy.should_rotate(&stats(1, 100), now));
    }

    #[test]
    fn time_based_uses_table_age() {
        let policy = RotationPolicy::time_based(60_000);
        let created = Utc::now();
        let s = TableStats::empty(created);
        assert!(!policy.should_rotate(&s, created + Duration::seconds(59)));
        assert!(policy.should_rotate(&s, created + Duration::seconds(60)));
    }

    #[test]
    fn manual_disabled_and_zero_never_rotate() {
        let now = Utc::now();
        let big = stats(u64::MAX, u64::MAX);
        assert!(!RotationPolicy::manual().should_rotate(&big, now));
        assert!(!RotationPolicy::disabled().should_rotate(&big, now));
        assert!(!RotationPolicy::count_based(0).should_rotate(&big, now));
        let mut off = RotationPolicy::count_based(1);
        off.enabled = false;
        assert!(!off.should_rotate(&big, now));
    }

    #[test]
    fn table_names_are_zero_padded() {
        assert_eq!(physical_table_name("websocketData", 1), "websocketData_001");
        assert_eq!(physical_table_name("websocketData", 1234), "websocketData_1234");
        assert_eq!(parse_table_index("websocketData", "websocketData_012"), Some(12));
        assert_eq!(parse_table_index("websocketData", "websocketData_1234"), Some(1234));
        assert_eq!(parse_table_index("websocketData", "websocketData_12"), None);
        assert_eq!(parse_table_index("websocketData", "websocketDataX_001"), None);
        assert_eq!(parse_table_index("websocketData", "websocketData_000"), None);
    }

    proptest! {
        #[test]
        fn count_decision_is_threshold_comparison(threshold in 1u64..1_000_000, records in 0u64..2_000_000) {
            let policy = RotationPolicy::count_based(threshold);
            prop_assert_eq!(policy.should_rotate(&stats(records, 0), Utc::now()), records >= threshold);
        }

        #[test]
        fn names_round_trip(index in 1u32..100_000) {
            let name = physical_table_name("base", index);
            prop_assert_eq!(parse_table_index("base", &name), Some(index));
        }
    }
}
