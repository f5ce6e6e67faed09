//! Descriptors of the data files registered in snapshots.
use std::collections::BTreeMap;

use serde::{Serialize, Deserialize};

use crate::TableResult;
use crate::partition::{PartitionSpec, PartitionValues};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Copy)]
#[serde(rename_all = "lowercase")]
pub enum DataFileFormat {
    /// Newline-delimited JSON rows keyed by field id.
    Json,
    Avro,
    Orc,
    Parquet,
}

impl DataFileFormat {
    pub fn extension(&self) -> &'static str {
        match self {
            DataFileFormat::Json => "json",
            DataFileFormat::Avro => "avro",
            DataFileFormat::Orc => "orc",
            DataFileFormat::Parquet => "parquet",
        }
    }
}

/// Points to a file containing table data, and stores partition values and statistics
/// for the data.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct DataFile {
    /// Full URI for the file with FS scheme.
    pub file_path: String,
    /// File format name.
    pub file_format: DataFileFormat,
    /// Id of the partition spec the file was written with.
    pub spec_id: i32,
    /// Id of the schema the file was written with.
    pub schema_id: i32,
    /// Partition data tuple, positional in the order of the spec's fields.
    pub partition: Vec<serde_json::Value>,
    /// Number of records in this file.
    pub record_count: i64,
    /// Total file size in bytes.
    pub file_size_in_bytes: i64,
    /// Map from column id to number of values in the column (including null
    /// values).
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub value_counts: Option<BTreeMap<i32, i64>>,
    /// Map from column id to number of null values in the column.
    #[serde(skip_serializing_if = "Option::is_none", default)]
    pub null_value_counts: Option<BTreeMap<i32, i64>>,
}

impl DataFile {
    pub fn builder(
        file_path: &str,
        file_format: DataFileFormat,
        record_count: i64,
        file_size_in_bytes: i64,
    ) -> DataFileBuilder {
        DataFileBuilder::new(
            file_path,
            file_format,
            record_count,
            file_size_in_bytes
        )
    }

    /// Decodes the partition tuple of this file with the spec it was written with.
    pub fn partition_values(&self, spec: &PartitionSpec) -> TableResult<PartitionValues> {
        spec.decode_partition(&self.partition)
            .map_err(|e| crate::TableError::DataFileEncoding {
                path: self.file_path.clone(),
                source: e
            })
    }
}

pub struct DataFileBuilder {
    data_file: DataFile
}

impl DataFileBuilder {
    pub fn new(
        file_path: &str,
        file_format: DataFileFormat,
        record_count: i64,
        file_size_in_bytes: i64,
    ) -> Self {
        Self {
            data_file: DataFile {
                file_path: String::from(file_path),
                file_format: file_format,
                spec_id: 0,
                schema_id: 0,
                partition: Vec::new(),
                record_count: record_count,
                file_size_in_bytes: file_size_in_bytes,
                value_counts: None,
                null_value_counts: None,
            }
        }
    }

    /// Add partition values to the `DataFile`, as written under spec `spec_id`.
    ///
    /// All records in the file pointed by the `DataFile` must have these
    /// partition values.
    pub fn with_partition_values(
        mut self,
        spec_id: i32,
        partition_values: &PartitionValues
    ) -> TableResult<Self> {
        self.data_file.spec_id = spec_id;
        self.data_file.partition = partition_values.to_json()
            .map_err(|e| crate::TableError::DataFileEncoding {
                path: self.data_file.file_path.clone(),
                source: e
            })?;
        Ok(self)
    }

    pub fn with_schema_id(mut self, schema_id: i32) -> Self {
        self.data_file.schema_id = schema_id;
        self
    }

    /// Adds per-column value and null counts.
    pub fn with_column_counts(
        mut self,
        value_counts: BTreeMap<i32, i64>,
        null_value_counts: BTreeMap<i32, i64>
    ) -> Self {
        self.data_file.value_counts = Some(value_counts);
        self.data_file.null_value_counts = Some(null_value_counts);
        self
    }

    pub fn build(self) -> DataFile {
        self.data_file
    }
}
