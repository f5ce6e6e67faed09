//! Table snapshots.
//!
//! A [`Snapshot`] is the immutable state of a table's data after a commit. Snapshots
//! are chained by parent pointers, and each one lists the data files its commit
//! added; the files readable at a snapshot are those added along its ancestry.
use std::collections::HashMap;

use serde::{Serialize, Deserialize};

use crate::datafile::DataFile;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "lowercase")]
/// The type of operations included in the snapshot.
pub enum SnapshotOperation {
    /// Only data files were added and no files were removed.
    Append,
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Default)]
/// Summarises the changes in the snapshot.
pub struct SnapshotSummary {
    /// The type of operation in the snapshot
    operation: Option<SnapshotOperation>,
    /// Other summary data.
    #[serde(flatten)]
    stats: HashMap<String, String>,
}

impl SnapshotSummary {
    pub fn builder() -> SnapshotSummaryBuilder {
        SnapshotSummaryBuilder::new()
    }

    pub fn operation(&self) -> Option<&SnapshotOperation> {
        self.operation.as_ref()
    }

    /// Returns an integer statistic such as `total-records`.
    pub fn stat(&self, name: &str) -> Option<i64> {
        self.stats.get(name).and_then(|value| value.parse().ok())
    }
}

#[derive(Default)]
pub struct SnapshotSummaryBuilder {
    operation: Option<SnapshotOperation>,
    // In the SnapshotSummary, stats are encoded as strings.
    // However, in practice, they are all integers.
    stats: HashMap<String, i64>,
}

impl SnapshotSummaryBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn operation(&mut self, operation: SnapshotOperation) -> &mut Self {
        self.operation = Some(operation);
        self
    }

    /// Carries over the running totals of the parent snapshot's summary.
    pub fn copy_totals(&mut self, summary: &SnapshotSummary) -> &mut Self {
        let keys = ["total-records", "total-files-size", "total-data-files"];
        for k in keys {
            if let Some(value) = summary.stat(k) {
                self.stats.insert(k.to_string(), value);
            }
        }
        self
    }

    fn add_to_stat(&mut self, stat_name: &str, count: i64) {
        self.stats.entry(stat_name.to_string())
            .and_modify(|v| { *v += count })
            .or_insert(count);
    }

    pub fn added_data_file(&mut self, records: i64, size: i64) -> &mut Self {
        self.add_to_stat("added-data-files", 1);
        self.add_to_stat("total-data-files", 1);

        self.add_to_stat("added-records", records);
        self.add_to_stat("total-records", records);

        self.add_to_stat("added-files-size", size);
        self.add_to_stat("total-files-size", size);

        self
    }

    pub fn build(&self) -> SnapshotSummary {
        SnapshotSummary {
            operation: self.operation.clone(),
            stats: self.stats.iter().map(|(k, v)| {
                (k.to_string(), v.to_string())
            }).collect()
        }
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Snapshot {
    /// A unique long ID
    pub snapshot_id: i64,
    /// The snapshot ID of the snapshot's parent.
    /// Omitted for any snapshot with no parent
    #[serde(skip_serializing_if = "Option::is_none")]
    pub parent_snapshot_id: Option<i64>,
    /// A monotonically increasing long that tracks the order of
    /// changes to a table.
    pub sequence_number: i64,
    /// A timestamp when the snapshot was created.
    pub timestamp_ms: i64,
    /// A string map that summarizes the snapshot changes, including operation.
    pub summary: SnapshotSummary,
    /// ID of the schema the snapshot's files were written with.
    pub schema_id: i32,
    /// ID of the partition spec the snapshot's files were written with.
    pub spec_id: i32,
    /// Data files added by this snapshot.
    pub added_files: Vec<DataFile>,
}

impl Snapshot {
    pub fn record_count(&self) -> i64 {
        self.summary.stat("total-records").unwrap_or(0)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
/// A log of when each snapshot became the table's head.
pub struct SnapshotLog {
    /// Id of the snapshot.
    pub snapshot_id: i64,
    /// Last updated timestamp
    pub timestamp_ms: i64,
}

impl SnapshotLog {
    pub fn new(snapshot_id: i64, timestamp_ms: i64) -> Self {
        Self { snapshot_id, timestamp_ms }
    }
}

/// Selects the snapshot a read is pinned to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotRef {
    /// A specific snapshot by id.
    Id(i64),
    /// The table's head at the time of the read.
    Latest,
}

impl From<i64> for SnapshotRef {
    fn from(snapshot_id: i64) -> Self {
        SnapshotRef::Id(snapshot_id)
    }
}
