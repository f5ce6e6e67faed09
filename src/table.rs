//! Table handles and identifiers.
use std::fmt;
use std::sync::Arc;
use std::collections::HashMap;

use regex::Regex;
use lazy_static::lazy_static;
use tracing::info;

use crate::{TableError, TableResult};
use crate::metadata::TableMetadata;
use crate::schema::{Schema, SchemaChange};
use crate::partition::{PartitionSpec, PartitionField, PartitionSpecChange};
use crate::snapshot::{Snapshot, SnapshotRef};
use crate::datafile::DataFile;
use crate::storage::StoragePath;
use crate::store::{MetadataStore, StoreError};
use crate::transaction::{
    Transaction,
    AppendFilesOperation,
    EvolveSchemaOperation,
    EvolvePartitionSpecOperation
};

lazy_static! {
    static ref IDENT_PART_RE: Regex = Regex::new(r"^[A-Za-z0-9_\-]+$").unwrap();
}

/// Identifies a table by its namespace and name, e.g. `db.individual`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TableIdent {
    namespace: Vec<String>,
    name: String,
}

impl TableIdent {
    pub fn new(namespace: &[&str], name: &str) -> TableResult<Self> {
        for part in namespace.iter().chain(std::iter::once(&name)) {
            if !IDENT_PART_RE.is_match(part) {
                return Err(TableError::InvalidIdentifier(format!(
                    "'{}' is not a valid namespace or table name", part
                )));
            }
        }

        Ok(Self {
            namespace: namespace.iter().map(|s| s.to_string()).collect(),
            name: name.to_string(),
        })
    }

    /// Parses a dot-separated identifier. The last part is the table name.
    pub fn parse(ident: &str) -> TableResult<Self> {
        let parts = ident.split('.').collect::<Vec<_>>();
        match parts.split_last() {
            Some((name, namespace)) => Self::new(namespace, name),
            None => Err(TableError::InvalidIdentifier(ident.to_string())),
        }
    }

    pub fn namespace(&self) -> &[String] {
        &self.namespace
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Returns the path of the table relative to the root of its warehouse.
    pub fn storage_path(&self) -> StoragePath {
        StoragePath::from_iter(
            self.namespace.iter().map(String::as_str).chain(std::iter::once(self.name.as_str()))
        )
    }
}

impl fmt::Display for TableIdent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for part in &self.namespace {
            write!(f, "{}.", part)?;
        }
        write!(f, "{}", self.name)
    }
}

/// A handle to a table, caching the metadata version it last read.
///
/// Reads are served from the cached metadata. Commits go through the metadata store
/// and move the handle to the version they publish; call [`Table::refresh`] to
/// observe commits made by others.
pub struct Table {
    ident: TableIdent,
    store: Arc<dyn MetadataStore>,
    version: u64,
    metadata: TableMetadata,
}

impl Table {
    /// Loads the latest version of a table.
    ///
    /// # Errors
    ///
    /// [`StoreError::TableNotFound`] if the table does not exist.
    pub async fn load(ident: &TableIdent, store: Arc<dyn MetadataStore>) -> TableResult<Self> {
        let (version, metadata) = store.load_current(ident).await?
            .ok_or_else(|| StoreError::TableNotFound { table: ident.to_string() })?;

        Ok(Self {
            ident: ident.clone(),
            store: store,
            version: version,
            metadata: metadata,
        })
    }

    /// Registers a new table with the given initial metadata.
    pub async fn create(
        ident: &TableIdent,
        store: Arc<dyn MetadataStore>,
        metadata: TableMetadata
    ) -> TableResult<Self> {
        let version = store.create(ident, &metadata).await?;
        info!(table = %ident, location = %metadata.location, "created table");

        Ok(Self {
            ident: ident.clone(),
            store: store,
            version: version,
            metadata: metadata,
        })
    }

    pub fn ident(&self) -> &TableIdent {
        &self.ident
    }

    pub fn location(&self) -> &str {
        &self.metadata.location
    }

    /// Returns the metadata version this handle is at.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn metadata(&self) -> &TableMetadata {
        &self.metadata
    }

    pub(crate) fn store(&self) -> &Arc<dyn MetadataStore> {
        &self.store
    }

    pub(crate) fn set_state(&mut self, version: u64, metadata: TableMetadata) {
        self.version = version;
        self.metadata = metadata;
    }

    /// Reloads the latest metadata of the table.
    pub async fn refresh(&mut self) -> TableResult<()> {
        let (version, metadata) = self.store.load_current(&self.ident).await?
            .ok_or_else(|| StoreError::TableNotFound { table: self.ident.to_string() })?;
        self.set_state(version, metadata);
        Ok(())
    }

    pub fn current_schema(&self) -> TableResult<&Schema> {
        self.metadata.current_schema()
    }

    pub fn current_partition_spec(&self) -> TableResult<PartitionSpec> {
        self.metadata.current_partition_spec()
    }

    /// Returns the head snapshot, or `None` for a table without commits.
    pub fn current_head(&self) -> Option<&Snapshot> {
        self.metadata.current_snapshot()
    }

    /// Finds a snapshot by id.
    pub fn resolve(&self, snapshot_id: i64) -> TableResult<&Snapshot> {
        Ok(self.metadata.snapshot(snapshot_id)?)
    }

    /// Resolves a snapshot reference, `None` for the head of an empty table.
    pub fn resolve_ref(&self, snapshot_ref: SnapshotRef) -> TableResult<Option<&Snapshot>> {
        match snapshot_ref {
            SnapshotRef::Id(snapshot_id) => self.resolve(snapshot_id).map(Some),
            SnapshotRef::Latest => Ok(self.current_head()),
        }
    }

    /// Returns the snapshots from the head back to the root, newest first.
    pub fn history(&self) -> TableResult<Vec<&Snapshot>> {
        match self.metadata.current_snapshot_id {
            Some(head) => Ok(self.metadata.ancestors(head)?),
            None => Ok(Vec::new()),
        }
    }

    /// Initiates a new transaction on this table.
    pub fn new_transaction(&mut self) -> Transaction {
        Transaction::new(self)
    }

    /// Commits `files` as a new snapshot extending `base_snapshot_id`.
    ///
    /// # Errors
    ///
    /// [`StoreError::ConcurrentModification`] if the head is no longer
    /// `base_snapshot_id`, or the current schema is no longer `schema_id`.
    pub async fn commit_snapshot(
        &mut self,
        files: Vec<DataFile>,
        base_snapshot_id: Option<i64>,
        schema_id: i32,
        spec_id: i32
    ) -> TableResult<Snapshot> {
        let mut operation = AppendFilesOperation::new(base_snapshot_id, schema_id, spec_id);
        operation.append_files(files);

        let mut transaction = self.new_transaction();
        transaction.add_operation(Box::new(operation));
        transaction.commit().await?;

        self.current_head()
            .cloned()
            .ok_or_else(|| TableError::CustomError {
                message: format!("table {} has no head after an append", self.ident)
            })
    }

    /// Evolves the current schema and returns the new schema id.
    ///
    /// An empty change set leaves the table unchanged.
    pub async fn evolve_schema(&mut self, changes: Vec<SchemaChange>) -> TableResult<i32> {
        if changes.is_empty() {
            return Ok(self.metadata.current_schema_id);
        }

        let operation = EvolveSchemaOperation::new(self.metadata.current_schema_id, changes);
        let mut transaction = self.new_transaction();
        transaction.add_operation(Box::new(operation));
        transaction.commit().await?;

        Ok(self.metadata.current_schema_id)
    }

    /// Evolves the default partition spec and returns the new spec id.
    ///
    /// An empty change set leaves the table unchanged.
    pub async fn evolve_partition_spec(
        &mut self,
        changes: Vec<PartitionSpecChange>
    ) -> TableResult<i32> {
        if changes.is_empty() {
            return Ok(self.metadata.default_spec_id);
        }

        let operation = EvolvePartitionSpecOperation::new(self.metadata.default_spec_id, changes);
        let mut transaction = self.new_transaction();
        transaction.add_operation(Box::new(operation));
        transaction.commit().await?;

        Ok(self.metadata.default_spec_id)
    }
}

/// Creates or loads tables in a metadata store.
///
/// # Examples
///
/// ```rust
/// use std::sync::Arc;
/// use evolake::{TableLoader, TableIdent, TableResult};
/// use evolake::store::MemoryMetadataStore;
/// use evolake::schema::{Schema, Field, PrimitiveType};
///
/// #[tokio::main]
/// async fn main() -> TableResult<()> {
///     let store = Arc::new(MemoryMetadataStore::new());
///     let ident = TableIdent::parse("db.users")?;
///     let schema = Schema::new(0, vec![
///         Field::new_primitive(1, "id", true, PrimitiveType::Long),
///     ]);
///
///     let table = TableLoader::new(store, &ident)
///         .with_location("memory:///db/users")
///         .load_or_create(schema, Vec::new())
///         .await?;
///     assert!(table.current_head().is_none());
///     Ok(())
/// }
/// ```
pub struct TableLoader {
    ident: TableIdent,
    store: Arc<dyn MetadataStore>,
    location: Option<String>,
    properties: HashMap<String, String>,
}

impl TableLoader {
    pub fn new(store: Arc<dyn MetadataStore>, ident: &TableIdent) -> Self {
        Self {
            ident: ident.clone(),
            store: store,
            location: None,
            properties: HashMap::new(),
        }
    }

    /// Sets the location of the table's files, needed when creating a table.
    pub fn with_location(mut self, location: &str) -> Self {
        self.location = Some(location.to_string());
        self
    }

    /// Sets table properties such as `commit.retry.num-retries`, used when
    /// creating a table.
    pub fn with_properties(mut self, properties: HashMap<String, String>) -> Self {
        self.properties.extend(properties);
        self
    }

    /// Loads the latest version of the table.
    pub async fn load(self) -> TableResult<Table> {
        Table::load(&self.ident, self.store).await
    }

    /// Creates the table with an initial schema and partition fields.
    ///
    /// # Errors
    ///
    /// [`StoreError::TableAlreadyExists`] if the table exists, and
    /// [`TableError::InvalidTableLocation`] if no location was set.
    pub async fn create(
        self,
        schema: Schema,
        partition_fields: Vec<PartitionField>
    ) -> TableResult<Table> {
        let location = self.location.ok_or_else(|| {
            TableError::InvalidTableLocation(format!("no location set for table {}", self.ident))
        })?;

        let metadata = TableMetadata::try_new(
            &location,
            schema,
            partition_fields,
            self.properties
        )?;

        Table::create(&self.ident, self.store, metadata).await
    }

    /// Loads the table, or creates it if it does not exist.
    pub async fn load_or_create(
        self,
        schema: Schema,
        partition_fields: Vec<PartitionField>
    ) -> TableResult<Table> {
        match self.store.load_current(&self.ident).await? {
            Some((version, metadata)) => {
                Ok(Table {
                    ident: self.ident,
                    store: self.store,
                    version: version,
                    metadata: metadata,
                })
            },
            None => self.create(schema, partition_fields).await
        }
    }
}
