//! Optimistic transactions on a table.
//!
//! A [`Transaction`] applies [`TableOperation`]s to a copy of the table's metadata
//! and publishes the result with a compare-and-swap on the metadata store. Each
//! operation guards only the part of the table it depends on: appends depend on the
//! head snapshot and the current schema, schema evolution on the current schema and
//! partition evolution on the default spec. When the swap is lost to a commit that
//! leaves those untouched, the operations are re-applied on the newer metadata.
use rand::Rng;
use tracing::{debug, info};

use crate::{Table, TableError, TableResult};
use crate::utils;
use crate::metadata::TableMetadata;
use crate::datafile::DataFile;
use crate::schema::SchemaChange;
use crate::partition::PartitionSpecChange;
use crate::store::StoreError;
use crate::snapshot::{Snapshot, SnapshotSummary, SnapshotOperation};

/// How many times a lost compare-and-swap is rebased before giving up.
const MAX_REBASE_ATTEMPTS: u32 = 10;

pub trait TableOperation: Send + Sync {
    /// A short name of the operation, used in logs.
    fn name(&self) -> &'static str;

    /// Verifies the operation is still valid on `current`.
    ///
    /// # Errors
    ///
    /// [`StoreError::ConcurrentModification`] if a concurrent commit changed the
    /// state this operation was prepared against.
    fn check(&self, table: &str, current: &TableMetadata) -> TableResult<()>;

    /// Applies the operation to a copy of the table's metadata.
    fn apply(&self, metadata: &mut TableMetadata) -> TableResult<()>;
}

fn conflict(table: &str, message: String) -> TableError {
    StoreError::ConcurrentModification { table: table.to_string(), message }.into()
}

/// Used to append files to the table as a new snapshot.
pub struct AppendFilesOperation {
    data_files: Vec<DataFile>,
    base_snapshot_id: Option<i64>,
    schema_id: i32,
    spec_id: i32,
}

impl AppendFilesOperation {
    /// Creates an append whose snapshot extends `base_snapshot_id` and references
    /// the given schema and partition spec.
    pub fn new(base_snapshot_id: Option<i64>, schema_id: i32, spec_id: i32) -> Self {
        Self {
            data_files: Vec::new(),
            base_snapshot_id: base_snapshot_id,
            schema_id: schema_id,
            spec_id: spec_id,
        }
    }

    pub fn append_file(&mut self, file: DataFile) {
        self.data_files.push(file);
    }

    pub fn append_files(&mut self, files: impl IntoIterator<Item=DataFile>) {
        self.data_files.extend(files);
    }

    fn new_snapshot_id(metadata: &TableMetadata) -> i64 {
        let mut rng = rand::thread_rng();
        loop {
            let snapshot_id = rng.gen_range(1..i64::MAX);
            if metadata.snapshot(snapshot_id).is_err() {
                return snapshot_id;
            }
        }
    }
}

impl TableOperation for AppendFilesOperation {
    fn name(&self) -> &'static str {
        "append"
    }

    fn check(&self, table: &str, current: &TableMetadata) -> TableResult<()> {
        if current.current_snapshot_id != self.base_snapshot_id {
            return Err(conflict(table, format!(
                "append expected head snapshot {:?} but the head is {:?}",
                self.base_snapshot_id, current.current_snapshot_id
            )));
        }
        if current.current_schema_id != self.schema_id {
            return Err(conflict(table, format!(
                "append expected schema {} but the current schema is {}",
                self.schema_id, current.current_schema_id
            )));
        }
        current.partition_spec(self.spec_id)?;
        Ok(())
    }

    fn apply(&self, metadata: &mut TableMetadata) -> TableResult<()> {
        let parent = metadata.current_snapshot();

        let mut summary = SnapshotSummary::builder();
        summary.operation(SnapshotOperation::Append);
        if let Some(parent) = parent {
            summary.copy_totals(&parent.summary);
        }
        for file in &self.data_files {
            summary.added_data_file(file.record_count, file.file_size_in_bytes);
        }

        let snapshot = Snapshot {
            snapshot_id: Self::new_snapshot_id(metadata),
            parent_snapshot_id: parent.map(|s| s.snapshot_id),
            // Sequence number increased by 1 for every new snapshot.
            sequence_number: metadata.last_sequence_number + 1,
            timestamp_ms: utils::next_timestamp_ms(metadata.last_updated_ms)?,
            summary: summary.build(),
            schema_id: self.schema_id,
            spec_id: self.spec_id,
            added_files: self.data_files.clone(),
        };

        metadata.add_snapshot(snapshot);
        Ok(())
    }
}

/// Evolves the current schema with a change set.
pub struct EvolveSchemaOperation {
    changes: Vec<SchemaChange>,
    base_schema_id: i32,
}

impl EvolveSchemaOperation {
    pub fn new(base_schema_id: i32, changes: Vec<SchemaChange>) -> Self {
        Self { changes, base_schema_id }
    }
}

impl TableOperation for EvolveSchemaOperation {
    fn name(&self) -> &'static str {
        "evolve-schema"
    }

    fn check(&self, table: &str, current: &TableMetadata) -> TableResult<()> {
        if current.current_schema_id != self.base_schema_id {
            return Err(conflict(table, format!(
                "schema changes were prepared against schema {} but the current schema is {}",
                self.base_schema_id, current.current_schema_id
            )));
        }
        Ok(())
    }

    fn apply(&self, metadata: &mut TableMetadata) -> TableResult<()> {
        let (schema, last_column_id) = SchemaChange::apply_all(
            metadata.current_schema()?,
            metadata.last_column_id,
            &self.changes
        )?;

        metadata.add_schema(schema, last_column_id)?;
        Ok(())
    }
}

/// Evolves the default partition spec with a change set.
pub struct EvolvePartitionSpecOperation {
    changes: Vec<PartitionSpecChange>,
    base_spec_id: i32,
}

impl EvolvePartitionSpecOperation {
    pub fn new(base_spec_id: i32, changes: Vec<PartitionSpecChange>) -> Self {
        Self { changes, base_spec_id }
    }
}

impl TableOperation for EvolvePartitionSpecOperation {
    fn name(&self) -> &'static str {
        "evolve-partition-spec"
    }

    fn check(&self, table: &str, current: &TableMetadata) -> TableResult<()> {
        if current.default_spec_id != self.base_spec_id {
            return Err(conflict(table, format!(
                "partition changes were prepared against spec {} but the default spec is {}",
                self.base_spec_id, current.default_spec_id
            )));
        }
        Ok(())
    }

    fn apply(&self, metadata: &mut TableMetadata) -> TableResult<()> {
        let (fields, last_partition_id) = PartitionSpecChange::apply_all(
            &metadata.current_partition_spec()?,
            &metadata.schemas,
            metadata.current_schema_id,
            metadata.last_partition_id,
            &self.changes
        )?;

        metadata.add_partition_spec(fields, last_partition_id)?;
        Ok(())
    }
}

/// A set of operations committed to a table as a single new metadata version.
pub struct Transaction<'a> {
    table: &'a mut Table,
    operations: Vec<Box<dyn TableOperation>>,
}

impl<'a> Transaction<'a> {
    pub fn new(table: &'a mut Table) -> Self {
        Self {
            table: table,
            operations: Vec::new(),
        }
    }

    /// Adds an operation to be committed by this transaction.
    pub fn add_operation(&mut self, operation: Box<dyn TableOperation>) {
        self.operations.push(operation);
    }

    /// Commits all operations, leaving the table handle at the new version.
    ///
    /// # Errors
    ///
    /// Fails with [`StoreError::ConcurrentModification`] if an operation's check
    /// fails on the latest metadata, or if the swap keeps being lost.
    pub async fn commit(mut self) -> TableResult<()> {
        let table_name = self.table.ident().to_string();
        let mut rebases = 0;

        loop {
            let current = self.table.metadata();
            for operation in &self.operations {
                operation.check(&table_name, current)?;
            }

            let mut new_metadata = current.clone();
            for operation in &self.operations {
                operation.apply(&mut new_metadata)?;
            }

            let expected_version = self.table.version();
            let result = self.table.store()
                .compare_and_swap(self.table.ident(), expected_version, &new_metadata)
                .await;

            match result {
                Ok(version) => {
                    info!(
                        table = %table_name,
                        version = version,
                        operations = ?self.operations.iter().map(|o| o.name()).collect::<Vec<_>>(),
                        "committed table metadata"
                    );
                    self.table.set_state(version, new_metadata);
                    return Ok(());
                },
                Err(TableError::Store(StoreError::ConcurrentModification { .. }))
                    if rebases < MAX_REBASE_ATTEMPTS =>
                {
                    rebases += 1;
                    debug!(
                        table = %table_name,
                        expected_version = expected_version,
                        rebase = rebases,
                        "metadata swap lost, rebasing on the latest version"
                    );
                    self.table.refresh().await?;
                },
                Err(e) => return Err(e),
            }
        }
    }
}
