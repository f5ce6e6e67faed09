//! Versioned tables with schema and partition evolution.
//!
//! `evolake` stores append-only batches of tabular data in tables laid out after
//! [Apache Iceberg](https://iceberg.apache.org/): every column carries a permanent
//! integer id, schemas and partition specs are versioned independently, and every
//! write produces an immutable snapshot that stays readable regardless of later
//! commits.
//!
//! Batches arriving from evolving flat files rarely match the table exactly. The
//! [`reconcile`] module aligns a batch's ad-hoc schema with the table's schema,
//! and the [`ingest`] module drives the full write path: reconcile, write files
//! through a [`writer::FileWriter`], then commit a snapshot with optimistic
//! concurrency.
//!
//! ## Ingesting a batch
//!
//! ```rust
//! use evolake::{Warehouse, TableIdent, TableResult};
//! use evolake::schema::{Schema, Field, PrimitiveType};
//! use evolake::reconcile::{Batch, BatchField};
//! use evolake::ingest::EvolutionPolicy;
//! use evolake::snapshot::SnapshotRef;
//! use evolake::value::Value;
//!
//! #[tokio::main]
//! async fn main() -> TableResult<()> {
//!     let warehouse = Warehouse::in_memory();
//!     let ident = TableIdent::parse("db.individual")?;
//!
//!     warehouse.create_table(&ident, Schema::new(0, vec![
//!         Field::new_primitive(1, "name", true, PrimitiveType::String),
//!         Field::new_primitive(2, "age", false, PrimitiveType::Int),
//!     ]), Vec::new()).await?;
//!
//!     let batch = Batch::new(
//!         vec![BatchField::primitive("age", PrimitiveType::Int),
//!              BatchField::primitive("name", PrimitiveType::String)],
//!         vec![vec![Some(Value::Int(30)), Some(Value::String("Alice".into()))]],
//!     );
//!     let report = warehouse.ingest(&ident, batch, EvolutionPolicy::Strict).await?;
//!
//!     let scan = warehouse.read_as_of(&ident, SnapshotRef::Latest).await?;
//!     assert_eq!(scan.record_count(), 1);
//!     println!("committed snapshot {}", report.snapshot_id);
//!     Ok(())
//! }
//! ```
use thiserror;
use object_store;
use serde_json;

mod utils;

pub mod schema;
pub mod value;
pub mod partition;
pub mod snapshot;
pub mod datafile;
pub mod metadata;
pub mod storage;
pub mod store;
pub mod transaction;
pub mod table;
pub mod reconcile;
pub mod writer;
pub mod ingest;
pub mod warehouse;

pub use crate::metadata::{TableMetadata, FormatVersion};
pub use crate::table::{Table, TableIdent, TableLoader};
pub use crate::warehouse::{Warehouse, TableScan};

use crate::schema::SchemaError;
use crate::partition::PartitionError;
use crate::store::StoreError;
use crate::ingest::IngestionError;

/// A result type returned by functions in this crate.
pub type TableResult<T> = Result<T, TableError>;

/// A table error.
#[derive(thiserror::Error, Debug)]
pub enum TableError {
    #[error("table error: {message}")]
    CustomError { message: String },

    /// A schema evolution was rejected.
    #[error(transparent)]
    Schema(#[from] SchemaError),

    /// A partition spec evolution was rejected.
    #[error(transparent)]
    Partition(#[from] PartitionError),

    /// The snapshot store rejected a read or a commit.
    #[error(transparent)]
    Store(#[from] StoreError),

    /// An ingestion attempt was aborted.
    #[error(transparent)]
    Ingestion(#[from] IngestionError),

    /// The table identifier could not be parsed or mapped to a location.
    #[error("invalid table identifier: {0}")]
    InvalidIdentifier(String),

    /// The URL location specified for the warehouse is invalid: it might have an
    /// invalid URL scheme, or point to a local path that is not a directory.
    #[error("invalid table location: {0}")]
    InvalidTableLocation(String),

    /// Failed serializing the table's metadata to json.
    #[error("error serializing table metadata to json: {source}")]
    SerializeMetadataJson { source: serde_json::Error },

    /// Attempted to parse an invalid metadata file.
    #[error("error deserializing table metadata from json: {source}")]
    InvalidMetadata { source: serde_json::Error },

    /// Failed encoding or decoding rows of a data file.
    #[error("error encoding data file {path}: {source}")]
    DataFileEncoding { path: String, source: serde_json::Error },

    /// A path to an object that is not in the warehouse location was encountered.
    #[error("invalid object store path: {source}")]
    InvalidPath {#[from] source: object_store::path::Error},

    /// An error from the underlying object storage.
    #[error("object storage error: {source}")]
    ObjectStore {#[from] source: object_store::Error},

    /// A system I/O error
    #[error("I/O error: {source}")]
    IoError {#[from] source: std::io::Error},
}
