//! A warehouse of tables sharing one storage location.
//!
//! [`Warehouse`] is the entry point for applications: it creates and loads tables,
//! ingests batches, evolves schemas and partition specs, and pins reads to
//! snapshots.
use std::sync::Arc;
use std::collections::HashMap;

use crate::{Table, TableIdent, TableLoader, TableResult};
use crate::value::Value;
use crate::schema::{Schema, SchemaChange};
use crate::partition::{PartitionSpec, PartitionField, PartitionSpecChange};
use crate::snapshot::{Snapshot, SnapshotRef};
use crate::datafile::DataFile;
use crate::storage::TableStorage;
use crate::store::{MetadataStore, MemoryMetadataStore, ObjectStoreMetadataStore};
use crate::writer::{FileWriter, JsonFileWriter};
use crate::reconcile::Batch;
use crate::ingest::{IngestionCoordinator, IngestConfig, IngestReport, EvolutionPolicy};

/// The state of a table as of one snapshot.
#[derive(Debug, Clone)]
pub struct TableScan {
    schema: Schema,
    partition_spec: PartitionSpec,
    snapshot: Option<Snapshot>,
    files: Vec<DataFile>,
}

impl TableScan {
    /// The schema the snapshot was committed with.
    pub fn schema(&self) -> &Schema {
        &self.schema
    }

    pub fn partition_spec(&self) -> &PartitionSpec {
        &self.partition_spec
    }

    /// The snapshot read, `None` when reading the head of an empty table.
    pub fn snapshot(&self) -> Option<&Snapshot> {
        self.snapshot.as_ref()
    }

    /// All data files readable at the snapshot, in commit order.
    pub fn files(&self) -> &[DataFile] {
        &self.files
    }

    pub fn record_count(&self) -> i64 {
        self.files.iter().map(|file| file.record_count).sum()
    }
}

/// Manages tables stored under a single location.
///
/// # Examples
///
/// ```rust
/// use evolake::{Warehouse, TableIdent, TableResult};
/// use evolake::schema::{Schema, Field, PrimitiveType, SchemaChange};
///
/// #[tokio::main]
/// async fn main() -> TableResult<()> {
///     let warehouse = Warehouse::in_memory();
///     let ident = TableIdent::parse("db.users")?;
///     warehouse.create_table(&ident, Schema::new(0, vec![
///         Field::new_primitive(1, "id", true, PrimitiveType::Long),
///         Field::new_primitive(2, "name", false, PrimitiveType::String),
///     ]), Vec::new()).await?;
///
///     let schema_id = warehouse.evolve_schema(&ident, vec![
///         SchemaChange::rename_column("name", "full_name"),
///     ]).await?;
///     assert_eq!(schema_id, 1);
///     Ok(())
/// }
/// ```
pub struct Warehouse {
    storage: Arc<TableStorage>,
    store: Arc<dyn MetadataStore>,
    coordinator: IngestionCoordinator,
    writer: Arc<dyn FileWriter>,
}

impl Warehouse {
    /// Assembles a warehouse from its parts.
    pub fn new(
        storage: Arc<TableStorage>,
        store: Arc<dyn MetadataStore>,
        writer: Arc<dyn FileWriter>,
        config: Option<IngestConfig>
    ) -> Self {
        let mut coordinator = IngestionCoordinator::new(store.clone(), writer.clone());
        if let Some(config) = config {
            coordinator = coordinator.with_config(config);
        }

        Self { storage, store, coordinator, writer }
    }

    /// Creates a warehouse that keeps metadata and data in process memory.
    pub fn in_memory() -> Self {
        let storage = Arc::new(TableStorage::in_memory());
        let writer = Arc::new(JsonFileWriter::new(storage.clone()));
        Self::new(storage, Arc::new(MemoryMetadataStore::new()), writer, None)
    }

    /// Starts building a warehouse stored at the given URL.
    ///
    /// The URL determines the type of the backing object store. For example,
    /// `s3://bucket/warehouse/` stores tables on S3, `file:///path/to/warehouse`
    /// on the local filesystem and `memory:///` in memory.
    pub fn from_url(url: &str) -> WarehouseBuilder {
        WarehouseBuilder {
            url: url.to_string(),
            storage_options: HashMap::new(),
            config: None,
        }
    }

    pub fn location(&self) -> &str {
        self.storage.location()
    }

    /// Returns the location of a table's files.
    pub fn table_location(&self, ident: &TableIdent) -> String {
        self.storage.to_uri(&ident.storage_path())
    }

    /// Returns a loader for a table of this warehouse, e.g. to create a table
    /// with properties.
    pub fn table_loader(&self, ident: &TableIdent) -> TableLoader {
        TableLoader::new(self.store.clone(), ident)
            .with_location(&self.table_location(ident))
    }

    /// Creates a table with an initial schema and partition fields.
    pub async fn create_table(
        &self,
        ident: &TableIdent,
        schema: Schema,
        partition_fields: Vec<PartitionField>
    ) -> TableResult<Table> {
        self.table_loader(ident).create(schema, partition_fields).await
    }

    pub async fn load_table(&self, ident: &TableIdent) -> TableResult<Table> {
        Table::load(ident, self.store.clone()).await
    }

    /// Ingests a batch into a table and returns the report of the commit.
    pub async fn ingest(
        &self,
        ident: &TableIdent,
        batch: Batch,
        policy: EvolutionPolicy
    ) -> TableResult<IngestReport> {
        self.coordinator.ingest(ident, &batch, policy).await
    }

    /// Evolves a table's schema and returns the new schema id.
    pub async fn evolve_schema(
        &self,
        ident: &TableIdent,
        changes: Vec<SchemaChange>
    ) -> TableResult<i32> {
        self.load_table(ident).await?.evolve_schema(changes).await
    }

    /// Evolves a table's partition spec and returns the new spec id.
    pub async fn evolve_partition_spec(
        &self,
        ident: &TableIdent,
        changes: Vec<PartitionSpecChange>
    ) -> TableResult<i32> {
        self.load_table(ident).await?.evolve_partition_spec(changes).await
    }

    /// Resolves the schema, partition spec and files of a table at a snapshot.
    ///
    /// Reading [`SnapshotRef::Latest`] of a table without commits yields its current
    /// schema and spec and no files.
    pub async fn read_as_of(
        &self,
        ident: &TableIdent,
        snapshot_ref: SnapshotRef
    ) -> TableResult<TableScan> {
        let table = self.load_table(ident).await?;
        let metadata = table.metadata();

        match table.resolve_ref(snapshot_ref)? {
            Some(snapshot) => {
                Ok(TableScan {
                    schema: metadata.schema_for_snapshot(snapshot)?.clone(),
                    partition_spec: metadata.partition_spec(snapshot.spec_id)?,
                    files: metadata.files_at(snapshot.snapshot_id)?
                        .into_iter()
                        .cloned()
                        .collect(),
                    snapshot: Some(snapshot.clone()),
                })
            },
            None => {
                Ok(TableScan {
                    schema: table.current_schema()?.clone(),
                    partition_spec: table.current_partition_spec()?,
                    snapshot: None,
                    files: Vec::new(),
                })
            }
        }
    }

    /// Reads all rows of a scan as rows of its schema.
    pub async fn read_rows(&self, scan: &TableScan) -> TableResult<Vec<Vec<Option<Value>>>> {
        let mut rows = Vec::new();
        for file in scan.files() {
            rows.extend(self.writer.read(file, scan.schema()).await?);
        }
        Ok(rows)
    }

    /// Returns the snapshots of a table from the head back to the root.
    pub async fn history(&self, ident: &TableIdent) -> TableResult<Vec<Snapshot>> {
        let table = self.load_table(ident).await?;
        let history = table.history()?.into_iter().cloned().collect();
        Ok(history)
    }
}

/// Builds a [`Warehouse`] backed by object storage.
pub struct WarehouseBuilder {
    url: String,
    storage_options: HashMap<String, String>,
    config: Option<IngestConfig>,
}

impl WarehouseBuilder {
    /// Sets options for the storage, e.g. access credentials. The valid options depend
    /// on the type of storage as determined by the url. For a list of valid
    /// options see [`TableStorage::from_url`].
    pub fn with_storage_options(
        mut self,
        storage_options: HashMap<String, String>
    ) -> Self {
        self.storage_options.extend(storage_options);
        self
    }

    /// Attempts to read storage options from environment variables.
    /// Currently supported environment variables:
    /// * AWS - `AWS_ACCESS_KEY_ID`, `AWS_DEFAULT_REGION`, `AWS_SECRET_ACCESS_KEY`,
    ///   `AWS_ENDPOINT_URL`
    pub fn with_env_options(mut self) -> Self {
        let vars = [
            ("AWS_DEFAULT_REGION", "aws_region"),
            ("AWS_ACCESS_KEY_ID", "aws_access_key_id"),
            ("AWS_SECRET_ACCESS_KEY", "aws_secret_access_key"),
            ("AWS_ENDPOINT_URL", "aws_endpoint"),
        ];
        for (var, key) in vars {
            if let Ok(value) = std::env::var(var) {
                self.storage_options.insert(key.to_string(), value);
            }
        }

        self
    }

    /// Overrides the ingestion configuration of all tables.
    pub fn with_ingest_config(mut self, config: IngestConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Builds the warehouse. Table metadata is stored as JSON files next to the
    /// data of each table.
    pub fn build(self) -> TableResult<Warehouse> {
        let storage = Arc::new(TableStorage::from_url(&self.url, self.storage_options)?);
        let store = Arc::new(ObjectStoreMetadataStore::new(storage.clone()));
        let writer = Arc::new(JsonFileWriter::new(storage.clone()));

        Ok(Warehouse::new(storage, store, writer, self.config))
    }
}
