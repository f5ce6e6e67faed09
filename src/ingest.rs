//! The write path: reconcile a batch, write its files, commit a snapshot.
//!
//! An [`IngestionCoordinator`] runs each ingestion through the states of
//! [`IngestionState`]. Reconciliation may propose schema changes, which are applied
//! only when the [`EvolutionPolicy`] permits it. The commit is optimistic: when
//! another writer moved the table in the meantime, the coordinator backs off,
//! re-reads the table, re-validates the projection the files were written with and
//! tries again, a bounded number of times.
use std::sync::Arc;
use std::time::Duration;
use std::collections::HashMap;

use tracing::{debug, info, warn};

use crate::{Table, TableIdent, TableError, TableResult};
use crate::value::Value;
use crate::schema::{Schema, SchemaChange};
use crate::partition::{PartitionSpec, PartitionValues};
use crate::datafile::DataFile;
use crate::store::{MetadataStore, StoreError};
use crate::reconcile::{
    reconcile,
    Batch,
    Projection,
    Reconciliation,
    ReconcileOptions,
    NewColumnType
};
use crate::writer::{FileWriter, WriteTask};

/// An error aborting an ingestion.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum IngestionError {
    /// A required table column has no counterpart in the batch.
    #[error("required column '{name}' is missing from the batch")]
    MissingRequiredColumn { name: String },

    /// A batch column's type does not widen to the type of its table column.
    #[error("batch column '{name}' of type {from} can't be stored as {to}: only widening is allowed")]
    IncompatibleTypeChange { name: String, from: String, to: String },

    /// The commit kept conflicting with concurrent commits.
    #[error("ingestion into {table} gave up after {attempts} conflicting commit attempts")]
    ConcurrentModification { table: String, attempts: u32 },

    /// A concurrent schema change invalidated the files written for the batch.
    #[error("reconciliation with {table} is stale: {reason}")]
    StaleReconciliation { table: String, reason: String },

    /// The batch has new columns but the policy forbids schema evolution.
    #[error("batch columns {} are not in the schema of {table} and evolution is not allowed", .columns.join(", "))]
    SchemaEvolutionRequired { table: String, columns: Vec<String> },

    /// A name matches several batch columns, or a batch column matches several
    /// table fields.
    #[error("column '{name}' is ambiguous between columns {}", .columns.join(", "))]
    AmbiguousColumn { name: String, columns: Vec<String> },

    #[error("null value in required column '{name}' at row {row}")]
    NullInRequiredColumn { name: String, row: usize },

    /// A cell does not match the declared type of its batch column.
    #[error("invalid value in column '{name}' at row {row}: {reason}")]
    InvalidValue { name: String, row: usize, reason: String },
}

/// The states of an ingestion.
///
/// `Planning → Reconciling → Writing → Committing → Done`, with a return from
/// `Reconciling` to `Planning` after a schema evolution and `Aborted` reachable
/// from every state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IngestionState {
    Planning,
    Reconciling,
    Writing,
    Committing,
    Done,
    Aborted,
}

/// Decides what happens to batch columns the table does not have.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EvolutionPolicy {
    /// Fail with [`IngestionError::SchemaEvolutionRequired`].
    #[default]
    Strict,
    /// Add them to the table as optional columns before writing.
    AddColumns,
}

pub const COMMIT_NUM_RETRIES: &str = "commit.retry.num-retries";
pub const COMMIT_MIN_WAIT_MS: &str = "commit.retry.min-wait-ms";
pub const COMMIT_MAX_WAIT_MS: &str = "commit.retry.max-wait-ms";
pub const INGEST_CASE_SENSITIVE: &str = "ingest.case-sensitive";
pub const INGEST_NEW_COLUMN_TYPE: &str = "ingest.new-column-type";

/// Configuration for ingestion.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestConfig {
    /// Maximum number of commit attempts, including the first one.
    pub max_attempts: u32,
    /// Base delay for exponential backoff (milliseconds)
    pub base_delay_ms: u64,
    /// Maximum delay for exponential backoff (milliseconds)
    pub max_delay_ms: u64,
    /// Whether batch columns match table columns case sensitively.
    pub case_sensitive: bool,
    /// Type of the columns proposed for new batch columns.
    pub new_column_type: NewColumnType,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 100,
            max_delay_ms: 5000,
            case_sensitive: true,
            new_column_type: NewColumnType::Inferred,
        }
    }
}

fn parse_property<T: std::str::FromStr>(key: &str, value: &str) -> TableResult<T> {
    value.trim().parse::<T>().map_err(|_| TableError::CustomError {
        message: format!("invalid value '{}' for table property {}", value, key)
    })
}

impl IngestConfig {
    /// Reads the configuration from table properties, using defaults for absent
    /// keys.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use std::collections::HashMap;
    /// use evolake::ingest::IngestConfig;
    ///
    /// let properties = HashMap::from([
    ///     ("commit.retry.num-retries".to_string(), "5".to_string()),
    ///     ("ingest.case-sensitive".to_string(), "false".to_string()),
    /// ]);
    /// let config = IngestConfig::from_properties(&properties).unwrap();
    /// assert_eq!(config.max_attempts, 6);
    /// assert!(!config.case_sensitive);
    /// ```
    pub fn from_properties(properties: &HashMap<String, String>) -> TableResult<Self> {
        let mut config = Self::default();

        if let Some(value) = properties.get(COMMIT_NUM_RETRIES) {
            config.max_attempts = parse_property::<u32>(COMMIT_NUM_RETRIES, value)?
                .saturating_add(1);
        }
        if let Some(value) = properties.get(COMMIT_MIN_WAIT_MS) {
            config.base_delay_ms = parse_property(COMMIT_MIN_WAIT_MS, value)?;
        }
        if let Some(value) = properties.get(COMMIT_MAX_WAIT_MS) {
            config.max_delay_ms = parse_property(COMMIT_MAX_WAIT_MS, value)?;
        }
        if let Some(value) = properties.get(INGEST_CASE_SENSITIVE) {
            config.case_sensitive = parse_property(INGEST_CASE_SENSITIVE, value)?;
        }
        if let Some(value) = properties.get(INGEST_NEW_COLUMN_TYPE) {
            config.new_column_type = match value.trim().to_ascii_lowercase().as_str() {
                "string" => NewColumnType::String,
                "inferred" => NewColumnType::Inferred,
                _ => return Err(TableError::CustomError {
                    message: format!(
                        "invalid value '{}' for table property {}", value, INGEST_NEW_COLUMN_TYPE
                    )
                }),
            };
        }

        Ok(config)
    }

    pub fn reconcile_options(&self) -> ReconcileOptions {
        ReconcileOptions {
            case_sensitive: self.case_sensitive,
            new_column_type: self.new_column_type,
        }
    }

    /// Calculate backoff delay for retry.
    fn backoff(&self, retry: u32) -> Duration {
        let factor = 2_u64.saturating_pow(retry.saturating_sub(1));
        let delay_ms = self.base_delay_ms.saturating_mul(factor);
        Duration::from_millis(delay_ms.min(self.max_delay_ms))
    }
}

/// The outcome of a successful ingestion.
#[derive(Debug, Clone, PartialEq)]
pub struct IngestReport {
    /// The snapshot committed for the batch.
    pub snapshot_id: i64,
    /// Number of commit attempts.
    pub attempts: u32,
    /// Schema changes applied for the batch.
    pub schema_changes: Vec<SchemaChange>,
    pub data_files: Vec<DataFile>,
}

impl IngestReport {
    pub fn record_count(&self) -> i64 {
        self.data_files.iter().map(|file| file.record_count).sum()
    }
}

/// Tracks a single ingestion.
struct IngestRun {
    table: String,
    state: IngestionState,
    // Files written but not committed yet.
    written: Vec<DataFile>,
}

impl IngestRun {
    fn transition(&mut self, next: IngestionState) {
        debug!(table = %self.table, from = ?self.state, to = ?next, "ingestion state");
        self.state = next;
    }
}

/// Drives batches into tables.
pub struct IngestionCoordinator {
    store: Arc<dyn MetadataStore>,
    writer: Arc<dyn FileWriter>,
    // When unset, the configuration is read from the table properties.
    config: Option<IngestConfig>,
}

impl IngestionCoordinator {
    pub fn new(store: Arc<dyn MetadataStore>, writer: Arc<dyn FileWriter>) -> Self {
        Self { store, writer, config: None }
    }

    /// Uses `config` instead of the configuration in the table properties.
    pub fn with_config(mut self, config: IngestConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Ingests a batch into a table as a new snapshot.
    ///
    /// On failure nothing is committed and the files written for the batch are
    /// deleted.
    ///
    /// # Errors
    ///
    /// [`IngestionError`]s for batches that can't be reconciled or written, and
    /// [`IngestionError::ConcurrentModification`] or
    /// [`IngestionError::StaleReconciliation`] when concurrent commits prevail.
    /// Schema and store errors propagate unchanged.
    pub async fn ingest(
        &self,
        ident: &TableIdent,
        batch: &Batch,
        policy: EvolutionPolicy
    ) -> TableResult<IngestReport> {
        info!(
            table = %ident,
            rows = batch.len(),
            columns = batch.schema().fields().len(),
            policy = ?policy,
            "starting ingestion"
        );

        let mut run = IngestRun {
            table: ident.to_string(),
            state: IngestionState::Planning,
            written: Vec::new(),
        };

        match self.run(&mut run, ident, batch, policy).await {
            Ok(report) => Ok(report),
            Err(e) => {
                self.abort(&mut run, &e).await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        run: &mut IngestRun,
        ident: &TableIdent,
        batch: &Batch,
        policy: EvolutionPolicy
    ) -> TableResult<IngestReport> {
        let mut table = Table::load(ident, self.store.clone()).await?;
        let config = match &self.config {
            Some(config) => config.clone(),
            None => IngestConfig::from_properties(&table.metadata().properties)?,
        };
        let options = config.reconcile_options();

        let mut schema_changes = Vec::new();
        let mut projection = self.plan(
            run, &mut table, batch, policy, &config, &mut schema_changes
        ).await?;

        run.transition(IngestionState::Writing);
        let schema = table.current_schema()?.clone();
        let spec = table.current_partition_spec()?;

        let rows = batch.rows()
            .iter()
            .enumerate()
            .map(|(index, row)| projection.project_row(index, row))
            .collect::<Result<Vec<_>, IngestionError>>()?;

        for (partition, rows) in group_by_partition(&spec, &schema, rows)? {
            let file = self.writer.write(WriteTask {
                table_location: table.location(),
                schema: &schema,
                spec: &spec,
                partition: &partition,
                rows: &rows,
            }).await?;
            run.written.push(file);
        }

        run.transition(IngestionState::Committing);
        let mut attempts = 0;
        loop {
            attempts += 1;
            let base_snapshot_id = table.current_head().map(|s| s.snapshot_id);

            let result = table.commit_snapshot(
                run.written.clone(),
                base_snapshot_id,
                projection.schema_id(),
                spec.spec_id()
            ).await;

            match result {
                Ok(snapshot) => {
                    run.transition(IngestionState::Done);
                    info!(
                        table = %ident,
                        snapshot_id = snapshot.snapshot_id,
                        sequence_number = snapshot.sequence_number,
                        files = run.written.len(),
                        attempts = attempts,
                        "ingestion committed"
                    );

                    return Ok(IngestReport {
                        snapshot_id: snapshot.snapshot_id,
                        attempts: attempts,
                        schema_changes: schema_changes,
                        data_files: std::mem::take(&mut run.written),
                    });
                },
                Err(TableError::Store(StoreError::ConcurrentModification { message, .. })) => {
                    if attempts >= config.max_attempts {
                        warn!(
                            table = %ident,
                            attempts = attempts,
                            "commit conflict: max attempts exceeded"
                        );
                        return Err(IngestionError::ConcurrentModification {
                            table: ident.to_string(),
                            attempts: attempts,
                        }.into());
                    }

                    let delay = config.backoff(attempts);
                    debug!(
                        table = %ident,
                        conflict = %message,
                        retry = attempts,
                        delay_ms = delay.as_millis(),
                        "commit conflict, retrying"
                    );
                    tokio::time::sleep(delay).await;

                    table.refresh().await?;
                    if table.metadata().current_schema_id != projection.schema_id() {
                        projection = revalidate(&table, batch, &options, &projection)?;
                    }
                },
                Err(e) => return Err(e),
            }
        }
    }

    /// Reconciles the batch, evolving the schema while the policy permits.
    async fn plan(
        &self,
        run: &mut IngestRun,
        table: &mut Table,
        batch: &Batch,
        policy: EvolutionPolicy,
        config: &IngestConfig,
        schema_changes: &mut Vec<SchemaChange>
    ) -> TableResult<Projection> {
        let options = config.reconcile_options();
        let mut evolutions = 0;

        loop {
            run.transition(IngestionState::Reconciling);

            let changes = match reconcile(table.current_schema()?, batch.schema(), &options)? {
                Reconciliation::Ready(projection) => return Ok(projection),
                Reconciliation::NeedsEvolution(changes) => changes,
            };

            if policy == EvolutionPolicy::Strict {
                return Err(IngestionError::SchemaEvolutionRequired {
                    table: run.table.clone(),
                    columns: changes.iter().map(|c| c.column_name().to_string()).collect(),
                }.into());
            }

            if evolutions >= config.max_attempts {
                return Err(IngestionError::ConcurrentModification {
                    table: run.table.clone(),
                    attempts: evolutions,
                }.into());
            }
            evolutions += 1;

            check_rows(table, batch, &options, &changes)?;
            info!(table = %run.table, changes = ?changes, "evolving schema for batch columns");
            match table.evolve_schema(changes.clone()).await {
                Ok(schema_id) => {
                    debug!(table = %run.table, schema_id = schema_id, "schema evolved");
                    schema_changes.extend(changes);
                },
                Err(TableError::Store(StoreError::ConcurrentModification { message, .. })) => {
                    // Another writer changed the schema first, reconcile again.
                    debug!(table = %run.table, conflict = %message, "schema evolution conflict");
                    table.refresh().await?;
                },
                Err(e) => return Err(e),
            }

            run.transition(IngestionState::Planning);
        }
    }

    async fn abort(&self, run: &mut IngestRun, error: &TableError) {
        run.transition(IngestionState::Aborted);
        warn!(table = %run.table, error = %error, "ingestion aborted");

        for file in run.written.drain(..) {
            if let Err(e) = self.writer.delete(&file).await {
                warn!(path = %file.file_path, error = %e, "failed to delete uncommitted data file");
            }
        }
    }
}

/// Projects every row of the batch through the schema `changes` would produce,
/// so a batch with invalid rows fails before the schema is evolved for it.
fn check_rows(
    table: &Table,
    batch: &Batch,
    options: &ReconcileOptions,
    changes: &[SchemaChange]
) -> TableResult<()> {
    let (evolved, _) = SchemaChange::apply_all(
        table.current_schema()?,
        table.metadata().last_column_id,
        changes
    )?;

    if let Reconciliation::Ready(projection) = reconcile(&evolved, batch.schema(), options)? {
        for (index, row) in batch.rows().iter().enumerate() {
            projection.project_row(index, row)?;
        }
    }
    Ok(())
}

/// Reconciles the batch again after the schema changed under a pending commit.
///
/// The written files stay valid as long as every table field is still fed from
/// the same batch column.
fn revalidate(
    table: &Table,
    batch: &Batch,
    options: &ReconcileOptions,
    projection: &Projection
) -> TableResult<Projection> {
    let schema = table.current_schema()?;
    let stale = |reason: String| -> TableError {
        IngestionError::StaleReconciliation {
            table: table.ident().to_string(),
            reason: reason,
        }.into()
    };

    match reconcile(schema, batch.schema(), options) {
        Ok(Reconciliation::Ready(revalidated)) if revalidated.has_same_sources(projection) => {
            debug!(
                table = %table.ident(),
                from_schema = projection.schema_id(),
                to_schema = revalidated.schema_id(),
                "projection still valid"
            );
            Ok(revalidated)
        },
        Ok(Reconciliation::Ready(_)) => Err(stale(format!(
            "schema {} maps batch columns to different fields than schema {}",
            schema.id(), projection.schema_id()
        ))),
        Ok(Reconciliation::NeedsEvolution(changes)) => Err(stale(format!(
            "schema {} no longer has batch columns {}",
            schema.id(),
            changes.iter().map(|c| c.column_name()).collect::<Vec<_>>().join(", ")
        ))),
        Err(e) => Err(stale(format!("schema {} rejects the batch: {}", schema.id(), e))),
    }
}

/// Splits projected rows by their partition values, in order of first appearance.
fn group_by_partition(
    spec: &PartitionSpec,
    schema: &Schema,
    rows: Vec<Vec<Option<Value>>>
) -> TableResult<Vec<(PartitionValues, Vec<Vec<Option<Value>>>)>> {
    let mut groups: Vec<(PartitionValues, Vec<Vec<Option<Value>>>)> = Vec::new();
    let mut index_by_path: HashMap<String, usize> = HashMap::new();

    for row in rows {
        let partition = spec.partition_values(schema, &row)?;
        let index = *index_by_path.entry(partition.path()).or_insert_with(|| {
            groups.push((partition, Vec::new()));
            groups.len() - 1
        });
        groups[index].1.push(row);
    }

    Ok(groups)
}
