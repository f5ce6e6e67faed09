//! Table metadata: the single immutable value describing a table version.
//!
//! [`TableMetadata`] holds every schema and partition spec the table ever had,
//! the snapshots, and the monotonic counters that guarantee ids are never reused.
//! A table changes only by replacing its metadata with a new value through the
//! [`MetadataStore`](crate::store::MetadataStore) compare-and-swap.
use std::fmt;
use std::collections::{HashMap, HashSet};

use uuid::Uuid;
use serde::{Serialize, Deserialize};
use serde_repr::{Serialize_repr, Deserialize_repr};

use crate::{TableError, TableResult};
use crate::utils;
use crate::schema::{Schema, SchemaError};
use crate::partition::{PartitionSpecModel, PartitionSpec, PartitionField};
use crate::snapshot::{Snapshot, SnapshotLog};
use crate::datafile::DataFile;
use crate::store::StoreError;

#[derive(Debug, Serialize_repr, Deserialize_repr, PartialEq, Eq, Clone, Copy)]
#[repr(i32)]
pub enum FormatVersion {
    V1 = 1,
    V2 = 2,
}

impl fmt::Display for FormatVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as i32)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct TableMetadata {
    /// An integer version number for the format.
    /// Should always be set to 2.
    pub format_version: FormatVersion,
    /// A UUID that identifies the table
    pub table_uuid: String,
    /// Location of the table's data files.
    pub location: String,
    /// The table's highest assigned sequence number, a monotonically increasing long
    /// that tracks the order of snapshots in a table.
    pub last_sequence_number: i64,
    /// Timestamp in milliseconds from the unix epoch when the table was last updated.
    pub last_updated_ms: i64,
    /// An integer; the highest assigned column ID for the table. This is used to ensure
    /// columns are always assigned an unused ID when evolving schemas.
    pub last_column_id: i32,
    /// A list of schemas, stored as objects with schema-id.
    pub schemas: Vec<Schema>,
    /// ID of the table's current schema.
    pub current_schema_id: i32,
    /// A list of partition specs, stored as full partition spec objects.
    partition_specs: Vec<PartitionSpecModel>,
    /// ID of the "current" spec that writers should use by default.
    pub default_spec_id: i32,
    /// The highest assigned partition field ID across all partition specs
    /// for the table.
    ///
    /// This is used to ensure partition fields are always assigned an
    /// unused ID when evolving specs.
    pub last_partition_id: i32,
    /// A string to string map of table properties. This is used to control settings
    /// that affect reading and writing and is not intended to be used for arbitrary
    /// metadata. For example, commit.retry.num-retries is used to control the number
    /// of commit retries.
    #[serde(default)]
    pub properties: HashMap<String, String>,
    /// long ID of the current table snapshot, `None` before the first commit.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub current_snapshot_id: Option<i64>,
    /// A list of valid snapshots.
    #[serde(default)]
    pub snapshots: Vec<Snapshot>,
    /// Timestamp and snapshot ID pairs that encode changes to the current snapshot
    /// of the table.
    #[serde(default)]
    pub snapshot_log: Vec<SnapshotLog>,
}

impl TableMetadata {
    /// Creates the metadata of a new table.
    ///
    /// The schema's field ids are taken as given, and `last_column_id` starts at the
    /// highest of them. The partition fields must reference fields of `schema`.
    ///
    /// # Errors
    ///
    /// Fails if the schema repeats a field id or a top-level name, or if the
    /// partition fields are invalid for the schema.
    pub fn try_new(
        location: &str,
        schema: Schema,
        partition_fields: Vec<PartitionField>,
        properties: HashMap<String, String>
    ) -> TableResult<Self> {
        let mut ids = HashSet::new();
        if let Some(field) = schema.all_fields().find(|field| !ids.insert(field.id())) {
            return Err(TableError::CustomError {
                message: format!("field id {} of '{}' is not unique", field.id(), field.name())
            });
        }

        let mut names = HashSet::new();
        if let Some(field) = schema.fields().iter().find(|field| !names.insert(field.name())) {
            return Err(SchemaError::DuplicateName { name: field.name().to_string() }.into());
        }

        let schema = schema.with_id(0);
        let partition_spec = PartitionSpec::try_new(
            0,
            partition_fields,
            std::slice::from_ref(&schema)
        )?;

        Ok(Self {
            format_version: FormatVersion::V2,
            table_uuid: Uuid::new_v4().to_string(),
            location: location.to_string(),
            last_sequence_number: 0,
            last_updated_ms: utils::current_time_ms()?,
            last_column_id: schema.max_field_id(),
            current_schema_id: schema.id(),
            schemas: vec![schema],
            partition_specs: vec![partition_spec.model().clone()],
            default_spec_id: partition_spec.spec_id(),
            last_partition_id: partition_spec.last_assigned_field_id(),
            properties: properties,
            current_snapshot_id: None,
            snapshots: Vec::new(),
            snapshot_log: Vec::new(),
        })
    }

    /// Parses metadata from its JSON form and checks that its current schema and
    /// default spec exist.
    pub fn decode(bytes: &[u8]) -> TableResult<Self> {
        let metadata = serde_json::from_slice::<TableMetadata>(bytes)
            .map_err(|e| TableError::InvalidMetadata { source: e })?;

        metadata.current_schema()?;
        metadata.current_partition_spec()?;

        Ok(metadata)
    }

    pub fn encode(&self) -> TableResult<String> {
        serde_json::to_string_pretty(self)
            .map_err(|e| TableError::SerializeMetadataJson { source: e })
    }

    pub fn current_schema(&self) -> TableResult<&Schema> {
        self.schema(self.current_schema_id)
            .ok_or_else(|| TableError::CustomError {
                message: format!(
                    "current schema id {} does not match any schema",
                    self.current_schema_id
                )
            })
    }

    /// Finds a current or historical schema by id.
    pub fn schema(&self, schema_id: i32) -> Option<&Schema> {
        self.schemas.iter().find(|schema| schema.id() == schema_id)
    }

    /// Finds the schema a snapshot was written with.
    pub fn schema_for_snapshot(&self, snapshot: &Snapshot) -> TableResult<&Schema> {
        self.schema(snapshot.schema_id)
            .ok_or_else(|| TableError::CustomError {
                message: format!(
                    "schema id {} of snapshot {} does not match any schema",
                    snapshot.schema_id, snapshot.snapshot_id
                )
            })
    }

    /// Returns the partition spec with the given id, bound to the table's schemas.
    pub fn partition_spec(&self, spec_id: i32) -> TableResult<PartitionSpec> {
        let model = self.partition_specs.iter()
            .find(|spec| spec.spec_id == spec_id)
            .ok_or_else(|| TableError::CustomError {
                message: format!("partition spec id {} does not match any spec", spec_id)
            })?;

        Ok(PartitionSpec::from_model(model.clone(), &self.schemas)?)
    }

    pub fn current_partition_spec(&self) -> TableResult<PartitionSpec> {
        self.partition_spec(self.default_spec_id)
    }

    /// Returns the latest snapshot of the table, or `None` if the table has no
    /// snapshots.
    pub fn current_snapshot(&self) -> Option<&Snapshot> {
        self.current_snapshot_id.and_then(|id| self.snapshot(id).ok())
    }

    /// Finds a snapshot by id.
    pub fn snapshot(&self, snapshot_id: i64) -> Result<&Snapshot, StoreError> {
        self.snapshots.iter()
            .find(|snapshot| snapshot.snapshot_id == snapshot_id)
            .ok_or(StoreError::UnknownSnapshot { snapshot_id })
    }

    /// Returns the snapshot with the given id followed by its ancestors, newest
    /// first, ending with the root snapshot.
    pub fn ancestors(&self, snapshot_id: i64) -> Result<Vec<&Snapshot>, StoreError> {
        let mut chain = vec![self.snapshot(snapshot_id)?];

        // Parents always have lower sequence numbers, and the bound guards
        // against corrupt metadata with a cycle.
        while let Some(parent_id) = chain.last().and_then(|s| s.parent_snapshot_id) {
            if chain.len() > self.snapshots.len() {
                break;
            }
            chain.push(self.snapshot(parent_id)?);
        }

        Ok(chain)
    }

    /// Returns all data files readable at a snapshot, in commit order.
    pub fn files_at(&self, snapshot_id: i64) -> Result<Vec<&DataFile>, StoreError> {
        Ok(self.ancestors(snapshot_id)?
            .into_iter()
            .rev()
            .flat_map(|snapshot| snapshot.added_files.iter())
            .collect())
    }

    /// Returns the partition specs of the table, including retired ones.
    pub fn partition_specs(&self) -> TableResult<Vec<PartitionSpec>> {
        self.partition_specs.iter()
            .map(|model| Ok(PartitionSpec::from_model(model.clone(), &self.schemas)?))
            .collect()
    }

    pub(crate) fn next_schema_id(&self) -> i32 {
        self.schemas.iter().map(|schema| schema.id()).max().unwrap_or(-1) + 1
    }

    pub(crate) fn next_spec_id(&self) -> i32 {
        self.partition_specs.iter().map(|spec| spec.spec_id).max().unwrap_or(-1) + 1
    }

    /// Adds an evolved schema and makes it current.
    pub(crate) fn add_schema(&mut self, schema: Schema, last_column_id: i32) -> TableResult<i32> {
        let schema_id = self.next_schema_id();
        self.schemas.push(schema.with_id(schema_id));
        self.current_schema_id = schema_id;
        self.last_column_id = self.last_column_id.max(last_column_id);
        self.last_updated_ms = utils::next_timestamp_ms(self.last_updated_ms)?;
        Ok(schema_id)
    }

    /// Adds an evolved partition spec and makes it the default.
    pub(crate) fn add_partition_spec(
        &mut self,
        fields: Vec<PartitionField>,
        last_partition_id: i32
    ) -> TableResult<i32> {
        let spec_id = self.next_spec_id();
        let spec = PartitionSpec::try_new(spec_id, fields, &self.schemas)?;
        self.partition_specs.push(spec.model().clone());
        self.default_spec_id = spec_id;
        self.last_partition_id = self.last_partition_id.max(last_partition_id);
        self.last_updated_ms = utils::next_timestamp_ms(self.last_updated_ms)?;
        Ok(spec_id)
    }

    /// Appends a snapshot and makes it the table's head.
    pub(crate) fn add_snapshot(&mut self, snapshot: Snapshot) {
        self.last_sequence_number = snapshot.sequence_number;
        self.last_updated_ms = self.last_updated_ms.max(snapshot.timestamp_ms);
        self.current_snapshot_id = Some(snapshot.snapshot_id);
        self.snapshot_log.push(SnapshotLog::new(snapshot.snapshot_id, snapshot.timestamp_ms));
        self.snapshots.push(snapshot);
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use crate::schema::{Field, PrimitiveType};
    use crate::partition::PartitionTransform;
    use crate::snapshot::SnapshotSummary;

    fn create_schema(schema_id: i32) -> Schema {
        Schema::new(schema_id, vec![
            Field::new_primitive(1, "id", true, PrimitiveType::Long),
            Field::new_primitive(2, "ts", false, PrimitiveType::Timestamp),
            Field::new_primitive(3, "user_id", false, PrimitiveType::Int),
        ])
    }

    fn snapshot(snapshot_id: i64, parent: Option<i64>, sequence_number: i64) -> Snapshot {
        Snapshot {
            snapshot_id: snapshot_id,
            parent_snapshot_id: parent,
            sequence_number: sequence_number,
            timestamp_ms: sequence_number,
            summary: SnapshotSummary::default(),
            schema_id: 0,
            spec_id: 0,
            added_files: vec![
                DataFile::builder(
                    &format!("memory:///t/data/{snapshot_id}.json"),
                    crate::datafile::DataFileFormat::Json,
                    1,
                    10
                ).build()
            ],
        }
    }

    #[test]
    fn new_metadata() {
        let metadata = TableMetadata::try_new(
            "memory:///db/t",
            create_schema(5),
            vec![PartitionField::new(2, 1000, "ts_day", PartitionTransform::Day)],
            HashMap::new()
        ).unwrap();

        assert_eq!(metadata.current_schema().unwrap().id(), 0);
        assert_eq!(metadata.last_column_id, 3);
        assert_eq!(metadata.last_partition_id, 1000);
        assert!(metadata.current_snapshot().is_none());

        let decoded = TableMetadata::decode(metadata.encode().unwrap().as_bytes()).unwrap();
        assert_eq!(decoded, metadata);
    }

    #[test]
    fn invalid_schema() {
        let schema = Schema::new(0, vec![
            Field::new_primitive(1, "id", true, PrimitiveType::Long),
            Field::new_primitive(1, "other", true, PrimitiveType::Long),
        ]);

        let result = TableMetadata::try_new("memory:///db/t", schema, vec![], HashMap::new());
        assert!(matches!(result, Err(TableError::CustomError { .. })));

        let schema = Schema::new(0, vec![
            Field::new_primitive(1, "id", true, PrimitiveType::Long),
            Field::new_primitive(2, "id", true, PrimitiveType::Long),
        ]);
        let result = TableMetadata::try_new("memory:///db/t", schema, vec![], HashMap::new());
        assert!(matches!(result, Err(TableError::Schema(SchemaError::DuplicateName { .. }))));
    }

    #[test]
    fn snapshot_ancestry() {
        let mut metadata = TableMetadata::try_new(
            "memory:///db/t", create_schema(0), vec![], HashMap::new()
        ).unwrap();

        metadata.add_snapshot(snapshot(10, None, 1));
        metadata.add_snapshot(snapshot(20, Some(10), 2));
        metadata.add_snapshot(snapshot(30, Some(20), 3));

        assert_eq!(metadata.current_snapshot().unwrap().snapshot_id, 30);
        assert_eq!(metadata.last_sequence_number, 3);

        let ids = metadata.ancestors(30).unwrap()
            .iter()
            .map(|s| s.snapshot_id)
            .collect::<Vec<_>>();
        assert_eq!(ids, vec![30, 20, 10]);

        assert_eq!(metadata.files_at(20).unwrap().len(), 2);
        assert_eq!(
            metadata.files_at(99).unwrap_err(),
            StoreError::UnknownSnapshot { snapshot_id: 99 }
        );
    }
}
