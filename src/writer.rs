//! Writing table rows to data files.
//!
//! The file format is a collaborator of the table: the ingestion path hands a
//! [`FileWriter`] the rows of one partition and registers the [`DataFile`] it gets
//! back. [`JsonFileWriter`] stores rows as newline-delimited JSON keyed by field
//! id, so files stay readable under any later schema.
use std::sync::Arc;
use std::collections::BTreeMap;

use bytes::Bytes;
use rand::Rng;
use uuid::Uuid;
use murmur3::murmur3_32;
use async_trait::async_trait;
use tracing::debug;

use crate::{TableError, TableResult};
use crate::value::Value;
use crate::schema::Schema;
use crate::partition::{PartitionSpec, PartitionValues};
use crate::datafile::{DataFile, DataFileFormat};
use crate::storage::{TableStorage, StoragePath};

/// Rows of one partition to be written to a single data file.
pub struct WriteTask<'a> {
    /// Location of the table the file belongs to.
    pub table_location: &'a str,
    /// Schema of the rows, which hold the top-level fields in order.
    pub schema: &'a Schema,
    /// Partition spec the partition values were computed with.
    pub spec: &'a PartitionSpec,
    pub partition: &'a PartitionValues,
    pub rows: &'a [Vec<Option<Value>>],
}

/// Writes and reads back data files.
#[async_trait]
pub trait FileWriter: Send + Sync {
    /// Writes the rows of a task to a new file and describes it.
    async fn write(&self, task: WriteTask<'_>) -> TableResult<DataFile>;

    /// Reads the rows of a file as rows of `schema`.
    ///
    /// Values are matched to fields by id: fields unknown to the file read as null,
    /// and values of fields missing from `schema` are skipped.
    async fn read(&self, file: &DataFile, schema: &Schema) -> TableResult<Vec<Vec<Option<Value>>>>;

    /// Deletes a file that was written but never committed.
    async fn delete(&self, file: &DataFile) -> TableResult<()>;
}

/// Writes newline-delimited JSON files to a [`TableStorage`].
pub struct JsonFileWriter {
    storage: Arc<TableStorage>,
    // Unique writer id to be used in file names.
    // Helps identify files created by the same writer.
    writer_id: String,
}

impl JsonFileWriter {
    pub fn new(storage: Arc<TableStorage>) -> Self {
        let writer_id = rand::thread_rng()
            .sample_iter(&rand::distributions::Alphanumeric)
            .take(8)
            .map(char::from)
            .collect();

        Self { storage, writer_id }
    }

    /// Assigns the path of a new data file.
    ///
    /// Files are placed under `data/<hash>/<partition path>/` where the hash of the
    /// file name spreads files across object store prefixes.
    fn new_data_path(
        &self,
        table_location: &str,
        partition: &PartitionValues
    ) -> TableResult<StoragePath> {
        let now = chrono::Utc::now().format("%Y%m%d_%H%M%S");
        let filename = format!(
            "{}_{}-{}.{}",
            now, self.writer_id, Uuid::new_v4(), DataFileFormat::Json.extension()
        );

        let hash = murmur3_32(&mut std::io::Cursor::new(&filename), 0)?;
        let hash: [u8; 4] = hash.to_be_bytes();

        let mut path = self.storage.create_path_from_url(table_location)?
            .child("data")
            .child(&format!("{:02x}{:02x}{:02x}{:02x}", hash[0], hash[1], hash[2], hash[3]));

        if !partition.is_empty() {
            for part in partition.path().split('/') {
                path = path.child(part);
            }
        }

        Ok(path.child(&filename))
    }

    fn encode_rows(
        path: &str,
        schema: &Schema,
        rows: &[Vec<Option<Value>>]
    ) -> TableResult<(Vec<u8>, BTreeMap<i32, i64>, BTreeMap<i32, i64>)> {
        let mut buffer = Vec::new();
        let mut value_counts = BTreeMap::new();
        let mut null_counts = BTreeMap::new();

        for row in rows {
            let mut object = serde_json::Map::new();
            for (field, value) in schema.fields().iter().zip(row.iter()) {
                *value_counts.entry(field.id()).or_insert(0) += 1;
                match value {
                    Some(value) => {
                        let json = serde_json::to_value(value)
                            .map_err(|e| TableError::DataFileEncoding {
                                path: path.to_string(),
                                source: e
                            })?;
                        object.insert(field.id().to_string(), json);
                    },
                    None => {
                        *null_counts.entry(field.id()).or_insert(0) += 1;
                    }
                }
            }

            serde_json::to_writer(&mut buffer, &object)
                .map_err(|e| TableError::DataFileEncoding { path: path.to_string(), source: e })?;
            buffer.push(b'\n');
        }

        Ok((buffer, value_counts, null_counts))
    }
}

#[async_trait]
impl FileWriter for JsonFileWriter {
    async fn write(&self, task: WriteTask<'_>) -> TableResult<DataFile> {
        let path = self.new_data_path(task.table_location, task.partition)?;
        let uri = self.storage.to_uri(&path);

        let (bytes, value_counts, null_counts) = Self::encode_rows(&uri, task.schema, task.rows)?;

        let record_count = i64::try_from(task.rows.len()).map_err(|_| {
            TableError::CustomError { message: "too many rows for a data file".to_string() }
        })?;
        let file_size = i64::try_from(bytes.len()).map_err(|_| {
            TableError::CustomError {
                message: "Failed to create data file: too large".to_string()
            }
        })?;

        self.storage.put(&path, Bytes::from(bytes)).await?;
        debug!(path = %uri, records = record_count, bytes = file_size, "wrote data file");

        Ok(DataFile::builder(&uri, DataFileFormat::Json, record_count, file_size)
            .with_schema_id(task.schema.id())
            .with_partition_values(task.spec.spec_id(), task.partition)?
            .with_column_counts(value_counts, null_counts)
            .build())
    }

    async fn read(&self, file: &DataFile, schema: &Schema) -> TableResult<Vec<Vec<Option<Value>>>> {
        if file.file_format != DataFileFormat::Json {
            return Err(TableError::CustomError {
                message: format!(
                    "can't read {:?} file {}", file.file_format, file.file_path
                )
            });
        }

        let path = self.storage.create_path_from_url(&file.file_path)?;
        let bytes = self.storage.get(&path).await?;
        let invalid = |e| TableError::DataFileEncoding { path: file.file_path.clone(), source: e };

        bytes.split(|b| *b == b'\n')
            .filter(|line| !line.is_empty())
            .map(|line| {
                let object: serde_json::Map<String, serde_json::Value> =
                    serde_json::from_slice(line).map_err(invalid)?;

                schema.fields().iter()
                    .map(|field| {
                        match object.get(&field.id().to_string()) {
                            None | Some(serde_json::Value::Null) => Ok(None),
                            Some(json) => Value::from_json(json, field.schema_type())
                                .map(Some)
                                .map_err(invalid),
                        }
                    })
                    .collect()
            })
            .collect()
    }

    async fn delete(&self, file: &DataFile) -> TableResult<()> {
        let path = self.storage.create_path_from_url(&file.file_path)?;
        self.storage.delete(&path).await
    }
}
