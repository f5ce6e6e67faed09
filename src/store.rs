//! Durable, versioned storage of table metadata.
//!
//! A [`MetadataStore`] keeps every version of a table's [`TableMetadata`] and
//! moves a table forward only through [`compare_and_swap`](MetadataStore::compare_and_swap),
//! the single point of synchronization between concurrent writers.
use std::sync::Arc;
use std::collections::HashMap;

use bytes::Bytes;
use regex::Regex;
use lazy_static::lazy_static;
use parking_lot::Mutex;
use async_trait::async_trait;
use tracing::debug;

use crate::{TableError, TableResult};
use crate::metadata::TableMetadata;
use crate::storage::{TableStorage, StoragePath};
use crate::table::TableIdent;

/// An error reading from or committing to the metadata store.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum StoreError {
    /// No snapshot with this id exists in the table.
    #[error("snapshot {snapshot_id} does not exist")]
    UnknownSnapshot { snapshot_id: i64 },

    /// The table changed since it was read, in a way that invalidates the commit.
    #[error("concurrent modification of table {table}: {message}")]
    ConcurrentModification { table: String, message: String },

    #[error("table {table} does not exist")]
    TableNotFound { table: String },

    #[error("table {table} already exists")]
    TableAlreadyExists { table: String },
}

/// Stores the metadata versions of tables.
///
/// Versions of a table are numbered from 1 and contiguous. Implementations must
/// make [`compare_and_swap`](MetadataStore::compare_and_swap) atomic: of several
/// callers expecting the same version, exactly one succeeds.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    /// Returns the latest version of a table and its metadata, or `None` if the
    /// table does not exist.
    async fn load_current(
        &self,
        ident: &TableIdent
    ) -> TableResult<Option<(u64, TableMetadata)>>;

    /// Returns a specific version of a table's metadata.
    async fn load_version(
        &self,
        ident: &TableIdent,
        version: u64
    ) -> TableResult<TableMetadata>;

    /// Registers a new table with `metadata` as its first version.
    ///
    /// # Errors
    ///
    /// [`StoreError::TableAlreadyExists`] if the table was created before.
    async fn create(&self, ident: &TableIdent, metadata: &TableMetadata) -> TableResult<u64>;

    /// Publishes `metadata` as the version after `expected_version`.
    ///
    /// # Errors
    ///
    /// [`StoreError::ConcurrentModification`] if `expected_version` is no longer
    /// the latest version of the table.
    async fn compare_and_swap(
        &self,
        ident: &TableIdent,
        expected_version: u64,
        metadata: &TableMetadata
    ) -> TableResult<u64>;
}

fn version_conflict(ident: &TableIdent, expected: u64) -> TableError {
    StoreError::ConcurrentModification {
        table: ident.to_string(),
        message: format!("metadata version {} is no longer current", expected),
    }.into()
}

/// Keeps table metadata in process memory.
#[derive(Default)]
pub struct MemoryMetadataStore {
    tables: Mutex<HashMap<TableIdent, Vec<TableMetadata>>>,
}

impl MemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl MetadataStore for MemoryMetadataStore {
    async fn load_current(
        &self,
        ident: &TableIdent
    ) -> TableResult<Option<(u64, TableMetadata)>> {
        let tables = self.tables.lock();
        Ok(tables.get(ident).and_then(|versions| {
            versions.last().map(|metadata| (versions.len() as u64, metadata.clone()))
        }))
    }

    async fn load_version(
        &self,
        ident: &TableIdent,
        version: u64
    ) -> TableResult<TableMetadata> {
        let tables = self.tables.lock();
        let versions = tables.get(ident)
            .ok_or_else(|| StoreError::TableNotFound { table: ident.to_string() })?;

        usize::try_from(version).ok()
            .and_then(|v| v.checked_sub(1))
            .and_then(|index| versions.get(index))
            .cloned()
            .ok_or_else(|| TableError::CustomError {
                message: format!("version {} of table {} does not exist", version, ident)
            })
    }

    async fn create(&self, ident: &TableIdent, metadata: &TableMetadata) -> TableResult<u64> {
        let mut tables = self.tables.lock();
        if tables.contains_key(ident) {
            return Err(StoreError::TableAlreadyExists { table: ident.to_string() }.into());
        }
        tables.insert(ident.clone(), vec![metadata.clone()]);
        Ok(1)
    }

    async fn compare_and_swap(
        &self,
        ident: &TableIdent,
        expected_version: u64,
        metadata: &TableMetadata
    ) -> TableResult<u64> {
        let mut tables = self.tables.lock();
        let versions = tables.get_mut(ident)
            .ok_or_else(|| StoreError::TableNotFound { table: ident.to_string() })?;

        if versions.len() as u64 != expected_version {
            return Err(version_conflict(ident, expected_version));
        }

        versions.push(metadata.clone());
        Ok(versions.len() as u64)
    }
}

lazy_static! {
    static ref METADATA_FILE_RE: Regex = Regex::new(r"^v(\d{10})\.metadata\.json$").unwrap();
}

/// Stores table metadata as JSON files in object storage.
///
/// Each version is written to `<namespace>/<name>/metadata/v<version>.metadata.json`
/// with the version zero-padded to ten digits. A version is published by creating
/// its file only if it does not exist yet, which makes the commit atomic on stores
/// with conditional puts.
pub struct ObjectStoreMetadataStore {
    storage: Arc<TableStorage>,
}

impl ObjectStoreMetadataStore {
    pub fn new(storage: Arc<TableStorage>) -> Self {
        Self { storage }
    }

    fn metadata_dir(ident: &TableIdent) -> StoragePath {
        ident.storage_path().child("metadata")
    }

    fn metadata_path(ident: &TableIdent, version: u64) -> StoragePath {
        Self::metadata_dir(ident).child(&format!("v{:010}.metadata.json", version))
    }

    /// Finds the highest metadata version present in storage.
    async fn latest_version(&self, ident: &TableIdent) -> TableResult<Option<u64>> {
        let objects = self.storage.list(Some(&Self::metadata_dir(ident))).await?;

        Ok(objects.iter()
            .filter_map(|object| {
                let captures = METADATA_FILE_RE.captures(object.location.filename()?)?;
                captures.get(1)?.as_str().parse::<u64>().ok()
            })
            .max())
    }

    async fn write_version(
        &self,
        ident: &TableIdent,
        version: u64,
        metadata: &TableMetadata
    ) -> TableResult<bool> {
        let path = Self::metadata_path(ident, version);
        let json = metadata.encode()?;
        debug!(table = %ident, version = version, path = %path, "writing metadata file");
        self.storage.put_if_absent(&path, Bytes::from(json)).await
    }
}

#[async_trait]
impl MetadataStore for ObjectStoreMetadataStore {
    async fn load_current(
        &self,
        ident: &TableIdent
    ) -> TableResult<Option<(u64, TableMetadata)>> {
        match self.latest_version(ident).await? {
            Some(version) => {
                let metadata = self.load_version(ident, version).await?;
                Ok(Some((version, metadata)))
            },
            None => Ok(None)
        }
    }

    async fn load_version(
        &self,
        ident: &TableIdent,
        version: u64
    ) -> TableResult<TableMetadata> {
        let bytes = self.storage.get(&Self::metadata_path(ident, version)).await
            .map_err(|e| match e {
                TableError::ObjectStore { source: object_store::Error::NotFound { .. } } => {
                    TableError::CustomError {
                        message: format!("version {} of table {} does not exist", version, ident)
                    }
                },
                e => e
            })?;

        TableMetadata::decode(&bytes)
    }

    async fn create(&self, ident: &TableIdent, metadata: &TableMetadata) -> TableResult<u64> {
        let exists = || StoreError::TableAlreadyExists { table: ident.to_string() };

        if self.latest_version(ident).await?.is_some() {
            return Err(exists().into());
        }
        if !self.write_version(ident, 1, metadata).await? {
            return Err(exists().into());
        }
        Ok(1)
    }

    async fn compare_and_swap(
        &self,
        ident: &TableIdent,
        expected_version: u64,
        metadata: &TableMetadata
    ) -> TableResult<u64> {
        let version = expected_version + 1;

        // Versions are contiguous, so the next file exists exactly when the
        // expected version is stale.
        if self.write_version(ident, version, metadata).await? {
            Ok(version)
        } else {
            Err(version_conflict(ident, expected_version))
        }
    }
}
