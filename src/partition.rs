//! Table partitioning and its evolution.
//!
//! A [`PartitionSpec`] derives partition values from the columns of a row by
//! applying a [`PartitionTransform`] to each source column. Specs are versioned
//! like schemas: a [`PartitionSpecChange`] set produces a new spec with a new
//! `spec_id`, and data files keep the id of the spec they were written with.
use std::collections::{HashMap, HashSet};

use chrono::Datelike;
use lazy_static::lazy_static;
use murmur3::murmur3_32;
use regex::Regex;
use serde::{
    de::{self, IntoDeserializer},
    Deserialize, Deserializer, Serialize,
};

use crate::schema::{
    Schema, SchemaType, Field, StructType, PrimitiveType
};
use crate::value::Value;

/// An error rejecting a partition spec or a partition spec change set.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum PartitionError {
    /// The partition field to remove is not in the current spec.
    #[error("partition field '{name}' does not exist in the partition spec")]
    UnknownPartitionField { name: String },

    /// The source column is in neither the current nor any historical schema.
    #[error("partition source column '{name}' not found in current or historical schemas")]
    UnresolvableSourceField { name: String },

    /// The transform can't be applied to values of the source column type.
    #[error("transform {transform} can't be applied to column '{name}' of type {source_type}")]
    InvalidTransform { name: String, transform: String, source_type: String },

    /// The partition spec already has a field with this name or for this term.
    #[error("partition field '{name}' already exists in the partition spec")]
    DuplicatePartitionField { name: String },
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Hash)]
#[serde(rename_all = "lowercase", remote = "Self")]
/// A Transformation applied to a source column to produce a partition value.
pub enum PartitionTransform {
    /// Source value, unmodified
    Identity,
    /// Extract a date or timestamp year as years from 1970
    Year,
    /// Extract a date or timestamp month as months from 1970-01-01
    Month,
    /// Extract a date or timestamp day as days from 1970-01-01
    Day,
    /// Extract a timestamp hour as hours from 1970-01-01 00:00:00
    Hour,
    /// Hash of value, mod N
    Bucket(u32),
    /// Value truncated to width
    Truncate(u32),
}

const MICROS_PER_HOUR: i64 = 3_600_000_000;
const MICROS_PER_DAY: i64 = 24 * MICROS_PER_HOUR;

impl PartitionTransform {
    /// Returns the field type resulting from applying this transform to the input
    /// type, or `None` if the transform can't be applied to it.
    ///
    /// For example, a `Year` transform can only be applied to date or timestamp
    /// types.
    pub fn result_type(&self, field_type: &SchemaType) -> Option<SchemaType> {
        let int = SchemaType::Primitive(PrimitiveType::Int);
        let primitive = field_type.as_primitive()?;

        match self {
            PartitionTransform::Identity => {
                Some(field_type.clone())
            },
            PartitionTransform::Year
            | PartitionTransform::Month
            | PartitionTransform::Day => {
                match primitive {
                    PrimitiveType::Date
                    | PrimitiveType::Timestamp
                    | PrimitiveType::Timestamptz => Some(int),
                    _ => None
                }
            },
            PartitionTransform::Hour => {
                match primitive {
                    PrimitiveType::Timestamp
                    | PrimitiveType::Timestamptz => Some(int),
                    _ => None
                }
            },
            PartitionTransform::Bucket(0) | PartitionTransform::Truncate(0) => None,
            // Bucket numbers are non-negative ints.
            PartitionTransform::Bucket(n) if *n > i32::MAX as u32 => None,
            PartitionTransform::Bucket(_) => {
                match primitive {
                    PrimitiveType::Int
                    | PrimitiveType::Long
                    | PrimitiveType::Decimal{..}
                    | PrimitiveType::Date
                    | PrimitiveType::Time
                    | PrimitiveType::Timestamp
                    | PrimitiveType::Timestamptz
                    | PrimitiveType::String
                    | PrimitiveType::Uuid
                    | PrimitiveType::Fixed(_)
                    | PrimitiveType::Binary => Some(int),
                    _ => None
                }
            },
            PartitionTransform::Truncate(_) => {
                match primitive {
                    PrimitiveType::Int
                    | PrimitiveType::Long
                    | PrimitiveType::Decimal{..}
                    | PrimitiveType::String
                    | PrimitiveType::Binary => Some(field_type.clone()),
                    _ => None
                }
            }
        }
    }

    /// Applies this transform to the input value.
    ///
    /// An input of `None` represents a null value. All transforms return `None`
    /// in this case, representing a null output. Returns `Err` with a description
    /// of the problem if the transform can't be applied to the value.
    pub fn apply(&self, value: Option<&Value>) -> Result<Option<Value>, String> {
        let Some(value) = value else {
            return Ok(None);
        };

        let unsupported = || format!("transform {self} can't be applied to value {value}");
        let to_int = |n: i64| i32::try_from(n).map(Value::Int).map_err(|_| unsupported());

        let result = match self {
            PartitionTransform::Identity => value.clone(),
            PartitionTransform::Year | PartitionTransform::Month => {
                let date = match value {
                    Value::Date(date) => *date,
                    Value::Timestamp(ts) => ts.date(),
                    Value::Timestamptz(ts) => ts.naive_utc().date(),
                    _ => return Err(unsupported()),
                };
                let years = i64::from(date.year()) - 1970;
                if *self == PartitionTransform::Year {
                    to_int(years)?
                } else {
                    to_int(years * 12 + i64::from(date.month0()))?
                }
            },
            PartitionTransform::Day => {
                match value {
                    Value::Date(date) => to_int(Value::days_from_epoch(date))?,
                    Value::Timestamp(_) | Value::Timestamptz(_) => {
                        let micros = value.micros().ok_or_else(unsupported)?;
                        to_int(micros.div_euclid(MICROS_PER_DAY))?
                    },
                    _ => return Err(unsupported()),
                }
            },
            PartitionTransform::Hour => {
                match value {
                    Value::Timestamp(_) | Value::Timestamptz(_) => {
                        let micros = value.micros().ok_or_else(unsupported)?;
                        to_int(micros.div_euclid(MICROS_PER_HOUR))?
                    },
                    _ => return Err(unsupported()),
                }
            },
            PartitionTransform::Bucket(n) => {
                let bytes = value.hash_bytes().ok_or_else(unsupported)?;
                let hash = murmur3_32(&mut std::io::Cursor::new(bytes), 0)
                    .map_err(|e| e.to_string())?;
                let buckets = i32::try_from(*n).map_err(|_| unsupported())?;
                Value::Int((hash as i32 & i32::MAX) % buckets)
            },
            PartitionTransform::Truncate(w) => {
                let width = i64::from(*w);
                match value {
                    Value::Int(v) => {
                        let v = i64::from(*v);
                        to_int(v - v.rem_euclid(width))?
                    },
                    Value::Long(v) => {
                        let truncated = v.checked_sub(v.rem_euclid(width));
                        Value::Long(truncated.ok_or_else(unsupported)?)
                    },
                    Value::Decimal(v) => {
                        let truncated = v.checked_sub(v.rem_euclid(i128::from(width)));
                        Value::Decimal(truncated.ok_or_else(unsupported)?)
                    },
                    Value::String(s) => {
                        Value::String(s.chars().take(*w as usize).collect())
                    },
                    Value::Binary(b) => {
                        Value::Binary(b.iter().take(*w as usize).copied().collect())
                    },
                    _ => return Err(unsupported()),
                }
            }
        };

        Ok(Some(result))
    }

    /// The default partition field name for this transform on `source`.
    pub fn default_name(&self, source: &str) -> String {
        match self {
            PartitionTransform::Identity => source.to_string(),
            PartitionTransform::Bucket(_) => format!("{source}_bucket"),
            PartitionTransform::Truncate(_) => format!("{source}_trunc"),
            PartitionTransform::Year => format!("{source}_year"),
            PartitionTransform::Month => format!("{source}_month"),
            PartitionTransform::Day => format!("{source}_day"),
            PartitionTransform::Hour => format!("{source}_hour"),
        }
    }
}

impl std::fmt::Display for PartitionTransform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PartitionTransform::Identity => write!(f, "identity"),
            PartitionTransform::Year => write!(f, "year"),
            PartitionTransform::Month => write!(f, "month"),
            PartitionTransform::Day => write!(f, "day"),
            PartitionTransform::Hour => write!(f, "hour"),
            PartitionTransform::Bucket(n) => write!(f, "bucket[{n}]"),
            PartitionTransform::Truncate(w) => write!(f, "truncate[{w}]"),
        }
    }
}

impl<'de> Deserialize<'de> for PartitionTransform {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.starts_with("bucket") {
            deserialize_bucket(s.into_deserializer())
        } else if s.starts_with("truncate") {
            deserialize_truncate(s.into_deserializer())
        } else {
            PartitionTransform::deserialize(s.into_deserializer())
        }
    }
}

impl Serialize for PartitionTransform {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        use PartitionTransform::*;
        match self {
            Bucket(mod_n) => serializer.serialize_str(&format!("bucket[{mod_n}]")),
            Truncate(width) => serializer.serialize_str(&format!("truncate[{width}]")),
            _ => PartitionTransform::serialize(self, serializer),
        }
    }
}

lazy_static! {
    static ref BUCKET_REGEX: Regex = Regex::new(r#"^bucket\[(?P<n>\d+)\]$"#).unwrap();
    static ref TRUNCATE_REGEX: Regex = Regex::new(r#"^truncate\[(?P<w>\d+)\]$"#).unwrap();
}

fn deserialize_bucket<'de, D>(deserializer: D) -> Result<PartitionTransform, D::Error>
where
    D: Deserializer<'de>,
{
    let this = String::deserialize(deserializer)?;
    let err_msg = format!("invalid bucket format {}", this);

    let caps = BUCKET_REGEX
        .captures(&this)
        .ok_or_else(|| de::Error::custom(&err_msg))?;
    let bucket: u32 = caps
        .name("n")
        .ok_or_else(|| de::Error::custom(&err_msg))
        .and_then(|p| {
            p.as_str()
                .parse()
                .map_err(|_| de::Error::custom("bucket not u32"))
        })?;
    Ok(PartitionTransform::Bucket(bucket))
}

fn deserialize_truncate<'de, D>(deserializer: D) -> Result<PartitionTransform, D::Error>
where
    D: Deserializer<'de>,
{
    let this = String::deserialize(deserializer)?;
    let err_msg = format!("invalid truncate format {}", this);

    let caps = TRUNCATE_REGEX
        .captures(&this)
        .ok_or_else(|| de::Error::custom(&err_msg))?;
    let width: u32 = caps
        .name("w")
        .ok_or_else(|| de::Error::custom(&err_msg))
        .and_then(|p| {
            p.as_str()
                .parse()
                .map_err(|_| de::Error::custom("width not u32"))
        })?;
    Ok(PartitionTransform::Truncate(width))
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
/// Specification of a single partition field within a `PartitionSpec`.
pub struct PartitionField {
    /// A source column id from the table's schema, current or historical.
    pub source_id: i32,
    /// A partition field id that is used to identify a partition field and is unique
    /// within the table's partition specs.
    pub field_id: i32,
    /// A partition name.
    pub name: String,
    /// A transform that is applied to the source column to produce a partition value.
    pub transform: PartitionTransform,
}

impl PartitionField {
    pub fn new(
        source_id: i32,
        field_id: i32,
        name: &str,
        transform: PartitionTransform
    ) -> Self {
        Self {
            source_id: source_id,
            field_id: field_id,
            name: name.to_string(),
            transform: transform
        }
    }
}

/// Partition spec struct that can be directly serialized or deserialized
/// but may contain integrity errors.
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
pub(crate) struct PartitionSpecModel {
    /// Unique identifier for this partition spec within a table.
    pub spec_id: i32,
    /// The partitioning fields.
    pub fields: Vec<PartitionField>,
}

/// Specification of table-level partitioning.
///
/// This struct defines how partition values are derived from the data fields of the
/// table. It is bound to the table's schemas, so each partition field knows the
/// name and type of its source column even after that column was dropped.
#[derive(Debug, Clone, PartialEq)]
pub struct PartitionSpec {
    model: PartitionSpecModel,
    /// Lookup for source fields by their id.
    field_by_id: HashMap<i32, Field>,
}

pub const UNPARTITIONED_LAST_ASSIGNED_FIELD_ID: i32 = 999;

impl PartitionSpec {
    /// Creates a new partition spec bound to a table's schemas.
    ///
    /// Source ids are resolved against the schemas with the highest schema id
    /// first, so a source column takes its latest type.
    ///
    /// # Errors
    ///
    /// [`PartitionError`] is returned if the list of fields is invalid, or if it's
    /// not applicable for the given schemas, for example:
    /// * If there are duplicate partition field ids or names.
    /// * If one of the partition fields references a field that does not exist in
    ///   any of the schemas as a primitive type.
    /// * If a transform can't be applied to its source type.
    pub fn try_new(
        spec_id: i32,
        fields: Vec<PartitionField>,
        schemas: &[Schema]
    ) -> Result<Self, PartitionError> {
        let mut uniq_id: HashSet<i32> = HashSet::new();
        let mut uniq_name: HashSet<&str> = HashSet::new();

        for field in &fields {
            if field.name.is_empty()
                || !uniq_id.insert(field.field_id)
                || !uniq_name.insert(&field.name) {
                return Err(PartitionError::DuplicatePartitionField {
                    name: field.name.clone()
                });
            }
        }

        let field_by_id = Self::field_by_id(schemas);

        for field in &fields {
            match field_by_id.get(&field.source_id) {
                Some(source_field) => {
                    field.transform.result_type(source_field.schema_type())
                        .ok_or_else(|| PartitionError::InvalidTransform {
                            name: source_field.name().to_string(),
                            transform: field.transform.to_string(),
                            source_type: source_field.schema_type().to_string(),
                        })?;
                },
                None => {
                    return Err(PartitionError::UnresolvableSourceField {
                        name: format!("<id {}>", field.source_id)
                    });
                }
            }
        }

        Ok(Self {
            model: PartitionSpecModel {
                spec_id: spec_id,
                fields: fields
            },
            field_by_id: field_by_id
        })
    }

    pub(crate) fn from_model(
        model: PartitionSpecModel,
        schemas: &[Schema]
    ) -> Result<Self, PartitionError> {
        Self::try_new(model.spec_id, model.fields, schemas)
    }

    pub fn spec_id(&self) -> i32 {
        self.model.spec_id
    }

    pub fn fields(&self) -> &[PartitionField] {
        &self.model.fields
    }

    pub fn is_unpartitioned(&self) -> bool {
        self.model.fields.is_empty()
    }

    pub(crate) fn model(&self) -> &PartitionSpecModel {
        &self.model
    }

    /// Builds a lookup map from the schemas' primitive fields, preferring the most
    /// recent schema for every id.
    fn field_by_id(schemas: &[Schema]) -> HashMap<i32, Field> {
        let mut ordered: Vec<&Schema> = schemas.iter().collect();
        ordered.sort_by_key(|schema| std::cmp::Reverse(schema.id()));

        let mut lookup: HashMap<i32, Field> = HashMap::new();

        for schema in ordered {
            // Temporary queue of fields to be processed.
            let mut queue: Vec<&Field> = schema.fields().iter().collect();

            while let Some(source_field) = queue.pop() {
                match source_field.schema_type() {
                    SchemaType::Primitive(_) => {
                        lookup.entry(source_field.id())
                            .or_insert_with(|| source_field.clone());
                    },
                    SchemaType::Struct(struct_type) => {
                        queue.extend(struct_type.fields().iter());
                    },
                    // Fields nested in lists and maps are not allowed.
                    SchemaType::List(_) | SchemaType::Map(_) => {}
                };
            }
        }

        lookup
    }

    /// Creates an empty PartitionSpec for unpartitioned tables.
    pub fn unpartitioned() -> Self {
        Self {
            model: PartitionSpecModel {
                spec_id: 0,
                fields: Vec::new()
            },
            field_by_id: HashMap::new()
        }
    }

    /// Obtains the highest assigned `field_id` of the fields in the partition.
    ///
    /// If this `PartitionSpec` has no fields (unpartitioned), then the constant
    /// [`UNPARTITIONED_LAST_ASSIGNED_FIELD_ID`] is returned.
    pub fn last_assigned_field_id(&self) -> i32 {
        self.fields().iter().map(|field| field.field_id).max()
            .unwrap_or(UNPARTITIONED_LAST_ASSIGNED_FIELD_ID)
    }

    /// Returns the source column of a partition field.
    pub fn source_field(&self, field: &PartitionField) -> Option<&Field> {
        self.field_by_id.get(&field.source_id)
    }

    /// Returns the partition fields of this spec as a `StructType` with
    /// transformations applied to the source fields.
    ///
    /// Each PartitionField is converted to an optional [`Field`] with its name
    /// preserved, its `field_id` becoming the `Field`'s id and its type converted
    /// according to its transform.
    pub fn as_struct_type(&self) -> StructType {
        let struct_fields = self.fields()
            .iter()
            .filter_map(|field| {
                // Fields are validated in the constructor.
                let source_field = self.field_by_id.get(&field.source_id)?;
                let result_type = field.transform.result_type(source_field.schema_type())?;

                Some(Field::new(
                    field.field_id,
                    &field.name,
                    false,
                    result_type
                ))
            }).collect();

        StructType::new(struct_fields)
    }

    /// Computes the partition values of a row.
    ///
    /// `row` holds the values of the top-level fields of `schema`, in order. A
    /// source column that is not part of `schema`, because it was dropped,
    /// produces a null partition value.
    pub fn partition_values(
        &self,
        schema: &Schema,
        row: &[Option<Value>]
    ) -> Result<PartitionValues, PartitionError> {
        let values = self.fields()
            .iter()
            .map(|field| {
                let source = source_value(schema.fields(), row, field.source_id);
                let value = field.transform.apply(source.as_ref())
                    .map_err(|_| PartitionError::InvalidTransform {
                        name: field.name.clone(),
                        transform: field.transform.to_string(),
                        source_type: self.field_by_id.get(&field.source_id)
                            .map(|f| f.schema_type().to_string())
                            .unwrap_or_default(),
                    })?;
                Ok((field.name.clone(), value))
            })
            .collect::<Result<Vec<_>, PartitionError>>()?;

        Ok(PartitionValues { values })
    }

    /// Decodes partition values stored as a positional JSON tuple.
    pub fn decode_partition(
        &self,
        tuple: &[serde_json::Value]
    ) -> Result<PartitionValues, serde_json::Error> {
        let partition_type = self.as_struct_type();
        let values = partition_type.fields()
            .iter()
            .zip(tuple.iter())
            .map(|(field, json)| {
                let value = match json {
                    serde_json::Value::Null => None,
                    json => Some(Value::from_json(json, field.schema_type())?),
                };
                Ok((field.name().to_string(), value))
            })
            .collect::<Result<Vec<_>, serde_json::Error>>()?;

        Ok(PartitionValues { values })
    }
}

/// Looks up the value of the field with id `source_id` in a row of `fields`,
/// descending into structs.
fn source_value(fields: &[Field], row: &[Option<Value>], source_id: i32) -> Option<Value> {
    fields.iter().zip(row.iter()).find_map(|(field, value)| {
        if field.id() == source_id {
            return value.clone();
        }
        match (field.schema_type(), value) {
            (SchemaType::Struct(s), Some(Value::Struct(members))) => {
                let nested = s.fields()
                    .iter()
                    .map(|f| members.get(f.name()).cloned())
                    .collect::<Vec<_>>();
                source_value(s.fields(), &nested, source_id)
            },
            _ => None
        }
    })
}

/// The partition values of one row or data file, in partition spec order.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PartitionValues {
    values: Vec<(String, Option<Value>)>,
}

impl PartitionValues {
    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &(String, Option<Value>)> {
        self.values.iter()
    }

    /// Returns the value of the named partition field, `Some(None)` for a null.
    pub fn get(&self, name: &str) -> Option<&Option<Value>> {
        self.values.iter()
            .find(|(field, _)| field == name)
            .map(|(_, value)| value)
    }

    /// Renders the values as a Hive-style relative path, e.g.
    /// `level=INFO/event_time_hour=12`.
    pub fn path(&self) -> String {
        self.values.iter()
            .map(|(name, value)| {
                let value = match value {
                    Some(value) => url::form_urlencoded::byte_serialize(
                        value.to_string().as_bytes()
                    ).collect::<String>(),
                    None => "null".to_string(),
                };
                format!("{name}={value}")
            })
            .collect::<Vec<_>>()
            .join("/")
    }

    /// Encodes the values as a positional JSON tuple.
    pub fn to_json(&self) -> Result<Vec<serde_json::Value>, serde_json::Error> {
        self.values.iter()
            .map(|(_, value)| serde_json::to_value(value))
            .collect()
    }
}

/// A single change to a table's partition spec.
///
/// Source columns are referred to by name and resolved against the current
/// schema first, then against historical schemas.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum PartitionSpecChange {
    /// Adds a partition field. Without a name, the default name for the
    /// transform is used.
    AddField {
        source: String,
        transform: PartitionTransform,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
    },
    /// Removes the partition field of a (source, transform) term.
    RemoveField {
        source: String,
        transform: PartitionTransform,
    },
    /// Removes a partition field by its name.
    RemoveFieldByName { name: String },
}

impl PartitionSpecChange {
    pub fn add_field(source: &str, transform: PartitionTransform) -> Self {
        Self::AddField { source: source.to_string(), transform: transform, name: None }
    }

    pub fn add_named_field(source: &str, transform: PartitionTransform, name: &str) -> Self {
        Self::AddField {
            source: source.to_string(),
            transform: transform,
            name: Some(name.to_string()),
        }
    }

    pub fn remove_field(source: &str, transform: PartitionTransform) -> Self {
        Self::RemoveField { source: source.to_string(), transform: transform }
    }

    pub fn remove_field_by_name(name: &str) -> Self {
        Self::RemoveFieldByName { name: name.to_string() }
    }

    /// Applies a change set to the fields of `base` as a single evolution step.
    ///
    /// `schemas` are all schemas of the table and `current_schema_id` selects the
    /// current one. New partition fields take ids after `last_partition_id`.
    /// Returns the new partition fields and the new value of the counter.
    pub fn apply_all(
        base: &PartitionSpec,
        schemas: &[Schema],
        current_schema_id: i32,
        last_partition_id: i32,
        changes: &[PartitionSpecChange]
    ) -> Result<(Vec<PartitionField>, i32), PartitionError> {
        let mut fields: Vec<PartitionField> = base.fields().to_vec();
        let mut last_partition_id = last_partition_id.max(UNPARTITIONED_LAST_ASSIGNED_FIELD_ID);

        for change in changes {
            match change {
                PartitionSpecChange::AddField { source, transform, name } => {
                    let source_field = resolve_source(schemas, current_schema_id, source)?;
                    if transform.result_type(source_field.schema_type()).is_none() {
                        return Err(PartitionError::InvalidTransform {
                            name: source.clone(),
                            transform: transform.to_string(),
                            source_type: source_field.schema_type().to_string(),
                        });
                    }

                    let name = name.clone().unwrap_or_else(|| transform.default_name(source));
                    let duplicate = fields.iter().any(|field| {
                        field.name == name || (
                            field.source_id == source_field.id()
                                && field.transform == *transform
                        )
                    });
                    if duplicate {
                        return Err(PartitionError::DuplicatePartitionField { name });
                    }

                    last_partition_id += 1;
                    fields.push(PartitionField::new(
                        source_field.id(), last_partition_id, &name, transform.clone()
                    ));
                },
                PartitionSpecChange::RemoveField { source, transform } => {
                    let unknown = || PartitionError::UnknownPartitionField {
                        name: format!("{transform}({source})")
                    };
                    let source_id = resolve_source(schemas, current_schema_id, source)
                        .map_err(|_| unknown())?
                        .id();
                    let index = fields.iter()
                        .position(|f| f.source_id == source_id && f.transform == *transform)
                        .ok_or_else(unknown)?;
                    fields.remove(index);
                },
                PartitionSpecChange::RemoveFieldByName { name } => {
                    let index = fields.iter()
                        .position(|f| f.name == *name)
                        .ok_or_else(|| PartitionError::UnknownPartitionField {
                            name: name.clone()
                        })?;
                    fields.remove(index);
                }
            }
        }

        Ok((fields, last_partition_id))
    }
}

/// Finds a column by name, or by a dotted path into nested structs, in the
/// current schema and then in historical schemas from newest to oldest.
fn resolve_source<'a>(
    schemas: &'a [Schema],
    current_schema_id: i32,
    name: &str
) -> Result<&'a Field, PartitionError> {
    let mut ordered: Vec<&Schema> = schemas.iter().collect();
    ordered.sort_by_key(|schema| (schema.id() != current_schema_id, std::cmp::Reverse(schema.id())));

    ordered.into_iter()
        .find_map(|schema| find_by_path(schema.fields(), name))
        .ok_or_else(|| PartitionError::UnresolvableSourceField { name: name.to_string() })
}

fn find_by_path<'a>(fields: &'a [Field], path: &str) -> Option<&'a Field> {
    if let Some(field) = fields.iter().find(|field| field.name() == path) {
        return Some(field);
    }
    let (head, rest) = path.split_once('.')?;
    match fields.iter().find(|field| field.name() == head)?.schema_type() {
        SchemaType::Struct(s) => find_by_path(s.fields(), rest),
        _ => None
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveDateTime};

    use crate::schema::{
        Schema, Field, SchemaType, StructType, PrimitiveType
    };
    use crate::value::Value;
    use crate::partition::*;

    fn create_partition_fields() -> Vec<PartitionField> {
        vec![
            PartitionField::new(
                1, 1000, "user_id", PartitionTransform::Identity
            ),
            PartitionField::new(
                2, 1001, "ts_year", PartitionTransform::Year
            ),
            PartitionField::new(
                2, 1002, "ts_month", PartitionTransform::Month
            ),
            PartitionField::new(
                2, 1003, "ts_day", PartitionTransform::Day
            )
        ]
    }

    fn create_schema() -> Schema {
        Schema::new(0, vec![
            Field::new_primitive(0, "id", true, PrimitiveType::Long),
            Field::new_primitive(1, "user_id", true, PrimitiveType::String),
            Field::new_primitive(2, "ts", false, PrimitiveType::Timestamp),
        ])
    }

    fn create_partition_spec() -> PartitionSpec {
        PartitionSpec::try_new(
            0,
            create_partition_fields(),
            &[create_schema()]
        ).unwrap()
    }

    fn timestamp(s: &str) -> Value {
        Value::Timestamp(s.parse::<NaiveDateTime>().unwrap())
    }

    #[test]
    fn valid_partition_spec() {
        let spec = create_partition_spec();

        assert_eq!(spec.spec_id(), 0);
        assert_eq!(spec.fields().len(), 4);
        assert_eq!(spec.last_assigned_field_id(), 1003);
        assert_eq!(PartitionSpec::unpartitioned().last_assigned_field_id(), 999);
    }

    #[test]
    fn invalid_partition_spec() {
        // Duplicate field_id
        let result = PartitionSpec::try_new(0, vec![
            PartitionField::new(2, 1001, "year", PartitionTransform::Year),
            PartitionField::new(2, 1002, "month", PartitionTransform::Month),
            PartitionField::new(2, 1002, "day", PartitionTransform::Day)],
            &[create_schema()]
        );
        assert!(matches!(result, Err(PartitionError::DuplicatePartitionField{..})));

        // Hour of a string
        let result = PartitionSpec::try_new(0, vec![
            PartitionField::new(1, 1000, "user_hour", PartitionTransform::Hour)],
            &[create_schema()]
        );
        assert!(matches!(result, Err(PartitionError::InvalidTransform{..})));
    }

    #[test]
    fn invalid_partition_spec_for_schema() {
        // Schema is missing the source field with id '1'
        let schema = Schema::new(0, vec![
            Field::new_primitive(0, "id", true, PrimitiveType::Long)
        ]);

        let result = PartitionSpec::try_new(0, create_partition_fields(), &[schema]);
        assert!(matches!(result, Err(PartitionError::UnresolvableSourceField{..})));
    }

    #[test]
    fn historical_source_binds() {
        let current = Schema::new(1, vec![
            Field::new_primitive(0, "id", true, PrimitiveType::Long),
        ]);
        let spec = PartitionSpec::try_new(
            1, create_partition_fields(), &[create_schema(), current.clone()]
        ).unwrap();

        // The dropped source produces nulls.
        let values = spec.partition_values(&current, &[Some(Value::Long(1))]).unwrap();
        assert_eq!(values.get("user_id"), Some(&None));
        assert_eq!(values.get("ts_day"), Some(&None));
    }

    #[test]
    fn as_struct() {
        let spec = create_partition_spec();

        assert_eq!(
            spec.as_struct_type(),
            StructType::new(vec![
                Field::new(1000, "user_id", false, SchemaType::Primitive(PrimitiveType::String)),
                Field::new(1001, "ts_year", false, SchemaType::Primitive(PrimitiveType::Int)),
                Field::new(1002, "ts_month", false, SchemaType::Primitive(PrimitiveType::Int)),
                Field::new(1003, "ts_day", false, SchemaType::Primitive(PrimitiveType::Int)),
            ])
        );
    }

    #[test]
    fn time_transforms() {
        let ts = timestamp("2017-11-16T22:31:08");

        assert_eq!(PartitionTransform::Year.apply(Some(&ts)).unwrap(), Some(Value::Int(47)));
        assert_eq!(
            PartitionTransform::Month.apply(Some(&ts)).unwrap(),
            Some(Value::Int(47 * 12 + 10))
        );
        assert_eq!(PartitionTransform::Day.apply(Some(&ts)).unwrap(), Some(Value::Int(17486)));
        assert_eq!(
            PartitionTransform::Hour.apply(Some(&ts)).unwrap(),
            Some(Value::Int(17486 * 24 + 22))
        );

        let date = Value::Date(NaiveDate::from_ymd_opt(1969, 12, 31).unwrap());
        assert_eq!(PartitionTransform::Day.apply(Some(&date)).unwrap(), Some(Value::Int(-1)));
        assert!(PartitionTransform::Hour.apply(Some(&date)).is_err());
        assert_eq!(PartitionTransform::Year.apply(None).unwrap(), None);
    }

    #[test]
    fn bucket_transform() {
        // Reference values from the Iceberg table spec.
        let bucket = |v: Value| PartitionTransform::Bucket(i32::MAX as u32).apply(Some(&v)).unwrap();

        assert_eq!(bucket(Value::Int(34)), Some(Value::Int(2017239379)));
        assert_eq!(bucket(Value::Long(34)), Some(Value::Int(2017239379)));
        assert_eq!(bucket(Value::String("iceberg".into())), Some(Value::Int(1210000089)));

        let small = PartitionTransform::Bucket(16).apply(Some(&Value::Int(34))).unwrap();
        assert_eq!(small, Some(Value::Int(2017239379 % 16)));
    }

    #[test]
    fn bucket_count_limit() {
        let long = SchemaType::Primitive(PrimitiveType::Long);
        let max = PartitionTransform::Bucket(i32::MAX as u32);
        assert!(max.result_type(&long).is_some());

        let too_many = PartitionTransform::Bucket(i32::MAX as u32 + 1);
        assert!(too_many.result_type(&long).is_none());
        assert!(PartitionTransform::Bucket(u32::MAX).result_type(&long).is_none());
        assert!(too_many.apply(Some(&Value::Int(0))).is_err());

        let schema = Schema::new(0, vec![
            Field::new_primitive(1, "id", true, PrimitiveType::Long),
        ]);
        let result = PartitionSpec::try_new(0, vec![
            PartitionField::new(1, 1000, "id_bucket", PartitionTransform::Bucket(3_000_000_000))],
            &[schema.clone()]
        );
        assert!(matches!(result, Err(PartitionError::InvalidTransform{..})));

        let result = PartitionSpecChange::apply_all(
            &PartitionSpec::unpartitioned(), &[schema], 0, 999,
            &[PartitionSpecChange::add_field("id", PartitionTransform::Bucket(u32::MAX))]
        );
        assert!(matches!(result, Err(PartitionError::InvalidTransform{..})));
    }

    #[test]
    fn truncate_transform() {
        let t = PartitionTransform::Truncate(10);

        assert_eq!(t.apply(Some(&Value::Int(1))).unwrap(), Some(Value::Int(0)));
        assert_eq!(t.apply(Some(&Value::Int(-1))).unwrap(), Some(Value::Int(-10)));
        assert_eq!(t.apply(Some(&Value::Long(25))).unwrap(), Some(Value::Long(20)));
        assert_eq!(t.apply(Some(&Value::Decimal(1065))).unwrap(), Some(Value::Decimal(1060)));

        let t = PartitionTransform::Truncate(3);
        assert_eq!(
            t.apply(Some(&Value::String("iceberg".into()))).unwrap(),
            Some(Value::String("ice".into()))
        );
    }

    #[test]
    fn truncate_at_lower_bound() {
        let t = PartitionTransform::Truncate(3);

        assert!(t.apply(Some(&Value::Long(i64::MIN))).is_err());
        assert!(t.apply(Some(&Value::Decimal(i128::MIN))).is_err());
        assert!(t.apply(Some(&Value::Int(i32::MIN))).is_err());
        // i64::MIN + 2 is a multiple of 3.
        assert_eq!(
            t.apply(Some(&Value::Long(i64::MIN + 2))).unwrap(),
            Some(Value::Long(i64::MIN + 2))
        );

        let schema = Schema::new(0, vec![
            Field::new_primitive(1, "id", true, PrimitiveType::Long),
        ]);
        let spec = PartitionSpec::try_new(0, vec![
            PartitionField::new(1, 1000, "id_trunc", PartitionTransform::Truncate(3))],
            &[schema.clone()]
        ).unwrap();
        assert!(matches!(
            spec.partition_values(&schema, &[Some(Value::Long(i64::MIN))]),
            Err(PartitionError::InvalidTransform{..})
        ));
    }

    #[test]
    fn transform_json() {
        let transforms: Vec<PartitionTransform> = serde_json::from_str(
            r#"["identity", "bucket[16]", "truncate[4]", "hour"]"#
        ).unwrap();

        assert_eq!(transforms, vec![
            PartitionTransform::Identity,
            PartitionTransform::Bucket(16),
            PartitionTransform::Truncate(4),
            PartitionTransform::Hour,
        ]);
        assert_eq!(
            serde_json::to_string(&transforms).unwrap(),
            r#"["identity","bucket[16]","truncate[4]","hour"]"#
        );
    }

    #[test]
    fn evolve_spec() {
        let schema = create_schema();
        let base = PartitionSpec::unpartitioned();

        let (fields, last) = PartitionSpecChange::apply_all(&base, &[schema.clone()], 0, 999, &[
            PartitionSpecChange::add_field("ts", PartitionTransform::Hour),
            PartitionSpecChange::add_field("user_id", PartitionTransform::Bucket(8)),
        ]).unwrap();

        assert_eq!(last, 1001);
        assert_eq!(fields, vec![
            PartitionField::new(2, 1000, "ts_hour", PartitionTransform::Hour),
            PartitionField::new(1, 1001, "user_id_bucket", PartitionTransform::Bucket(8)),
        ]);

        let spec = PartitionSpec::try_new(1, fields, &[schema.clone()]).unwrap();
        let (fields, last) = PartitionSpecChange::apply_all(&spec, &[schema.clone()], 0, last, &[
            PartitionSpecChange::remove_field("ts", PartitionTransform::Hour),
            PartitionSpecChange::add_field("ts", PartitionTransform::Day),
        ]).unwrap();

        assert_eq!(last, 1002);
        assert_eq!(fields[1], PartitionField::new(2, 1002, "ts_day", PartitionTransform::Day));
    }

    #[test]
    fn rejected_spec_changes() {
        let schema = create_schema();
        let spec = create_partition_spec();
        let apply = |change: PartitionSpecChange| {
            PartitionSpecChange::apply_all(&spec, &[schema.clone()], 0, 1003, &[change])
        };

        assert!(matches!(
            apply(PartitionSpecChange::add_field("level", PartitionTransform::Identity)),
            Err(PartitionError::UnresolvableSourceField { name }) if name == "level"
        ));
        assert!(matches!(
            apply(PartitionSpecChange::add_field("user_id", PartitionTransform::Day)),
            Err(PartitionError::InvalidTransform { .. })
        ));
        assert!(matches!(
            apply(PartitionSpecChange::add_field("ts", PartitionTransform::Year)),
            Err(PartitionError::DuplicatePartitionField { .. })
        ));
        assert!(matches!(
            apply(PartitionSpecChange::remove_field_by_name("ts_hour")),
            Err(PartitionError::UnknownPartitionField { name }) if name == "ts_hour"
        ));
    }

    #[test]
    fn partition_path() {
        let schema = Schema::new(0, vec![
            Field::new_primitive(1, "level", false, PrimitiveType::String),
            Field::new_primitive(2, "event_time", false, PrimitiveType::Timestamp),
        ]);
        let spec = PartitionSpec::try_new(1, vec![
            PartitionField::new(1, 1000, "level", PartitionTransform::Identity),
            PartitionField::new(2, 1001, "event_time_day", PartitionTransform::Day),
        ], &[schema.clone()]).unwrap();

        let values = spec.partition_values(&schema, &[
            Some(Value::String("WARN & ERROR".into())),
            Some(timestamp("1970-01-02T03:00:00")),
        ]).unwrap();

        assert_eq!(values.path(), "level=WARN+%26+ERROR/event_time_day=1");

        let decoded = spec.decode_partition(&values.to_json().unwrap()).unwrap();
        assert_eq!(decoded, values);
    }
}
