//! Data types of table columns and the widening relation between them.

use std::borrow::Cow;

use lazy_static::lazy_static;
use regex::Regex;
use serde::{
    de::{self, IntoDeserializer},
    Serialize, Serializer, Deserialize, Deserializer
};

use crate::schema::Field;

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone, Hash)]
#[serde(rename_all = "lowercase")]
#[serde(remote = "Self")]
/// An enum of possible primitive field types.
pub enum PrimitiveType {
    /// True or False
    Boolean,
    /// 32-bit signed integer
    Int,
    /// 64-bit signed integer
    Long,
    /// 32-bit IEEE 754 floating point.
    Float,
    /// 64-bit IEEE 754 floating point.
    Double,
    /// Fixed point decimal
    Decimal {
        /// The number of digits in the number.
        precision: u8,
        /// The number of digits to the right of the decimal point.
        scale: u8,
    },
    /// Calendar date without timezone or time.
    Date,
    /// Time of day without date or timezone.
    Time,
    /// Timestamp without timezone
    Timestamp,
    /// Timestamp with timezone
    Timestamptz,
    /// Arbitrary-length character sequences
    String,
    /// Universally Unique Identifiers
    Uuid,
    /// Fixed length byte array
    Fixed(u64),
    /// Arbitrary-length byte array.
    Binary,
}

impl PrimitiveType {
    /// Returns true if a column of this type can evolve to `target` without
    /// losing information: int to long, float to double, and decimals to a
    /// higher precision with the same scale. Every type widens to itself.
    pub fn widens_to(&self, target: &PrimitiveType) -> bool {
        match self {
            PrimitiveType::Int => {
                matches!(target, PrimitiveType::Int | PrimitiveType::Long)
            },
            PrimitiveType::Float => {
                matches!(target, PrimitiveType::Float | PrimitiveType::Double)
            },
            PrimitiveType::Decimal{precision: pb, scale: sb} => {
                match target {
                    PrimitiveType::Decimal{precision: pt, scale: st} => {
                        sb == st && pt >= pb
                    },
                    _ => false
                }
            },
            _ => {
                self == target
            }
        }
    }
}

impl std::fmt::Display for PrimitiveType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PrimitiveType::Boolean => write!(f, "boolean"),
            PrimitiveType::Int => write!(f, "int"),
            PrimitiveType::Long => write!(f, "long"),
            PrimitiveType::Float => write!(f, "float"),
            PrimitiveType::Double => write!(f, "double"),
            PrimitiveType::Decimal { precision: p, scale: s } =>
                write!(f, "decimal({},{})", p, s),
            PrimitiveType::Date => write!(f, "date"),
            PrimitiveType::Time => write!(f, "time"),
            PrimitiveType::Timestamp => write!(f, "timestamp"),
            PrimitiveType::Timestamptz => write!(f, "timestamptz"),
            PrimitiveType::String => write!(f, "string"),
            PrimitiveType::Uuid => write!(f, "uuid"),
            PrimitiveType::Fixed(size) => write!(f, "fixed[{}]", size),
            PrimitiveType::Binary => write!(f, "binary"),
        }
    }
}

/// Serialize for PrimitiveType with special handling for
/// Decimal and Fixed types.
impl Serialize for PrimitiveType {
    fn serialize<S>(&self, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        use PrimitiveType::*;
        match self {
            Decimal {
                precision: p,
                scale: s,
            } => serializer.serialize_str(&format!("decimal({p},{s})")),
            Fixed(l) => serializer.serialize_str(&format!("fixed[{l}]")),
            _ => PrimitiveType::serialize(self, serializer),
        }
    }
}

/// Deserialize for PrimitiveType with special handling for
/// Decimal and Fixed types.
impl<'de> Deserialize<'de> for PrimitiveType {
    fn deserialize<D>(deserializer: D) -> Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        if s.starts_with("decimal") {
            deserialize_decimal(s.into_deserializer())
        } else if s.starts_with("fixed") {
            deserialize_fixed(s.into_deserializer())
        } else {
            PrimitiveType::deserialize(s.into_deserializer())
        }
    }
}

lazy_static! {
    static ref DECIMAL_REGEX: Regex =
        Regex::new(r#"^decimal\((?P<p>\d+),\s*(?P<s>\d+)\)$"#).unwrap();
    static ref FIXED_REGEX: Regex =
        Regex::new(r#"^fixed\[(?P<l>\d+)\]$"#).unwrap();
}

/// Parsing for the Decimal PrimitiveType
fn deserialize_decimal<'de, D>(deserializer: D) -> Result<PrimitiveType, D::Error>
where
    D: Deserializer<'de>,
{
    let this = String::deserialize(deserializer)?;
    let err_msg = format!("invalid decimal format {}", this);

    let caps = DECIMAL_REGEX
        .captures(&this)
        .ok_or_else(|| de::Error::custom(&err_msg))?;
    let precision: u8 = caps
        .name("p")
        .ok_or_else(|| de::Error::custom(&err_msg))
        .and_then(|p| {
            p.as_str()
                .parse()
                .map_err(|_| de::Error::custom("precision not u8"))
        })?;
    let scale: u8 = caps
        .name("s")
        .ok_or_else(|| de::Error::custom(&err_msg))
        .and_then(|p| {
            p.as_str()
                .parse()
                .map_err(|_| de::Error::custom("scale not u8"))
        })?;
    Ok(PrimitiveType::Decimal { precision, scale })
}

/// Deserialize for the Fixed PrimitiveType
fn deserialize_fixed<'de, D>(deserializer: D) -> Result<PrimitiveType, D::Error>
where
    D: Deserializer<'de>,
{
    let this = String::deserialize(deserializer)?;
    let err_msg = format!("invalid fixed format {}", this);

    let caps = FIXED_REGEX
        .captures(&this)
        .ok_or_else(|| de::Error::custom(&err_msg))?;
    let length: u64 = caps
        .name("l")
        .ok_or_else(|| de::Error::custom(&err_msg))
        .and_then(|p| {
            p.as_str()
                .parse()
                .map_err(|_| de::Error::custom("length not u64"))
        })?;
    Ok(PrimitiveType::Fixed(length))
}

static STRUCT_TAG: &str = "struct";
static LIST_TAG: &str = "list";
static MAP_TAG: &str = "map";

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
/// A complex field type that contains a tuple of nested fields.
///
/// Each nested field in the struct is named and has an integer id that is unique in the
/// table schema. Each field can be either optional or required, meaning that values
/// can (or cannot) be null. Nested fields may be any type, including a [StructType].
pub struct StructType {
    /// Always set to "struct".
    pub r#type: Cow<'static, str>,
    /// The fields of the struct.
    pub fields: Vec<Field>,
}

impl StructType {
    pub fn new(fields: Vec<Field>) -> Self {
        let tag = Cow::Borrowed(STRUCT_TAG);
        Self { r#type: tag, fields: fields }
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    /// Finds the nested field that corresponds to `field`.
    ///
    /// Fields correspond by id. Fields with an unassigned id (zero), as found in
    /// types inferred from raw files, correspond by name instead.
    fn counterpart(&self, field: &Field) -> Option<&Field> {
        self.fields.iter().find(|candidate| {
            if candidate.id() > 0 && field.id() > 0 {
                candidate.id() == field.id()
            } else {
                candidate.name() == field.name()
            }
        })
    }

    fn widens_to(&self, target: &StructType) -> bool {
        // Every source field must survive, otherwise values would be dropped.
        let all_kept = self.fields.iter().all(|field| {
            match target.counterpart(field) {
                Some(target_field) => {
                    (field.required() || !target_field.required())
                        && widens_to(field.schema_type(), target_field.schema_type())
                },
                None => false
            }
        });

        // New target fields can only be filled with nulls.
        let new_fields_optional = target.fields.iter().all(|target_field| {
            self.counterpart(target_field).is_some() || !target_field.required()
        });

        all_kept && new_fields_optional
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(from = "ListTypeModel", into = "ListTypeModel")]
/// A field type that represents a list of identical elements.
pub struct ListType {
    field: Box<Field>
}

impl ListType {
    pub fn new(element_id: i32, element_required: bool, element: SchemaType) -> Self {
        Self {
            field: Box::new(Field::new(
                element_id,
                "element",
                element_required,
                element
            ))
        }
    }

    /// Returns a reference to the nested field element
    pub fn field(&self) -> &Field {
        &self.field
    }
}

/// Serializable `ListType`
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
struct ListTypeModel {
    /// Always set to "list".
    r#type: Cow<'static, str>,
    /// Unique identifier for the element
    element_id: i32,
    /// If the element is mandatory.
    element_required: bool,
    /// The type of the element.
    element: SchemaType,
}

impl From<ListType> for ListTypeModel {
    fn from(l: ListType) -> Self {
        Self {
            r#type: Cow::Borrowed(LIST_TAG),
            element_id: l.field.id,
            element_required: l.field.required,
            element: l.field.r#type
        }
    }
}

impl From<ListTypeModel> for ListType {
    fn from(l: ListTypeModel) -> Self {
        Self::new(
            l.element_id,
            l.element_required,
            l.element
        )
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(from = "MapTypeModel", into = "MapTypeModel")]
/// A complex field type that contains key-value pairs.
///
/// Both the key field and value field each have an integer id that is unique
/// in the table schema. Map keys are required and map values can be either
/// optional or required.
pub struct MapType {
    key: Box<Field>,
    value: Box<Field>,
}

impl MapType {
    pub fn new(
        key_id: i32,
        key_type: SchemaType,
        value_id: i32,
        value_required: bool,
        value_type: SchemaType
    ) -> Self {
        Self {
            key: Box::new(Field::new(
                key_id,
                "key",
                true,
                key_type
            )),
            value: Box::new(Field::new(
                value_id,
                "value",
                value_required,
                value_type
            ))
        }
    }

    pub fn key(&self) -> &Field {
        &self.key
    }

    pub fn value(&self) -> &Field {
        &self.value
    }
}

/// Serializable `MapType`
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
struct MapTypeModel {
    /// Always set to "map".
    r#type: Cow<'static, str>,
    key_id: i32,
    key: SchemaType,
    value_id: i32,
    value_required: bool,
    value: SchemaType,
}

impl From<MapType> for MapTypeModel {
    fn from(m: MapType) -> Self {
        Self {
            r#type: Cow::Borrowed(MAP_TAG),
            key_id: m.key.id,
            key: m.key.r#type,
            value_id: m.value.id,
            value_required: m.value.required,
            value: m.value.r#type
        }
    }
}

impl From<MapTypeModel> for MapType {
    fn from(m: MapTypeModel) -> Self {
        Self::new(m.key_id, m.key, m.value_id, m.value_required, m.value)
    }
}

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(untagged)]
/// Represents the type of a field in a table schema.
pub enum SchemaType {
    /// A primitive field type.
    Primitive(PrimitiveType),
    /// A struct field type.
    Struct(StructType),
    /// A list field type.
    List(ListType),
    /// A map field type.
    Map(MapType),
}

impl SchemaType {
    pub fn as_primitive(&self) -> Option<&PrimitiveType> {
        match self {
            SchemaType::Primitive(p) => Some(p),
            _ => None
        }
    }

    /// Assigns new ids from the `next_id` function to all recursively nested
    /// fields.
    ///
    /// Do not use directly. Use `Field::with_fresh_ids()` instead.
    pub(crate) fn with_fresh_ids<F>(self, next_id: &mut F) -> Self
    where
        F: FnMut() -> i32
    {
        match self {
            SchemaType::Primitive(p) => {
                SchemaType::Primitive(p)
            },
            SchemaType::Struct(s) => {
                SchemaType::Struct(StructType::new(
                    s.fields
                        .into_iter()
                        .map(|field| field.with_fresh_ids(next_id))
                        .collect()
                ))
            },
            SchemaType::List(l) => {
                SchemaType::List(ListType::new(
                    next_id(),
                    l.field.required,
                    l.field.r#type.with_fresh_ids(next_id)
                ))
            },
            SchemaType::Map(m) => {
                SchemaType::Map(MapType::new(
                    next_id(),
                    m.key.r#type.with_fresh_ids(next_id),
                    next_id(),
                    m.value.required,
                    m.value.r#type.with_fresh_ids(next_id)
                ))
            },
        }
    }

    /// Keeps the ids of nested fields that correspond to a field of `base`, and
    /// assigns fresh ids from `next_id` to nested fields that are new.
    pub(crate) fn with_ids_from<F>(self, base: &SchemaType, next_id: &mut F) -> Self
    where
        F: FnMut() -> i32
    {
        match (self, base) {
            (SchemaType::Struct(s), SchemaType::Struct(b)) => {
                SchemaType::Struct(StructType::new(
                    s.fields
                        .into_iter()
                        .map(|field| match b.counterpart(&field) {
                            Some(base_field) => {
                                let r#type = field.r#type.with_ids_from(
                                    &base_field.r#type, next_id
                                );
                                Field { id: base_field.id, r#type: r#type, ..field }
                            },
                            None => field.with_fresh_ids(next_id),
                        })
                        .collect()
                ))
            },
            (SchemaType::List(l), SchemaType::List(b)) => {
                SchemaType::List(ListType::new(
                    b.field.id,
                    l.field.required,
                    l.field.r#type.with_ids_from(&b.field.r#type, next_id)
                ))
            },
            (SchemaType::Map(m), SchemaType::Map(b)) => {
                SchemaType::Map(MapType::new(
                    b.key.id,
                    m.key.r#type.with_ids_from(&b.key.r#type, next_id),
                    b.value.id,
                    m.value.required,
                    m.value.r#type.with_ids_from(&b.value.r#type, next_id)
                ))
            },
            (other, _) => other.with_fresh_ids(next_id),
        }
    }
}

impl std::fmt::Display for SchemaType {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        match self {
            SchemaType::Primitive(p) => write!(f, "{p}"),
            SchemaType::Struct(s) => {
                write!(f, "struct<")?;
                for (i, field) in s.fields().iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}: {}", field.name(), field.schema_type())?;
                }
                write!(f, ">")
            },
            SchemaType::List(l) => write!(f, "list<{}>", l.field().schema_type()),
            SchemaType::Map(m) => write!(
                f, "map<{}, {}>", m.key().schema_type(), m.value().schema_type()
            ),
        }
    }
}

/// Returns true if values of type `from` can be stored in a column of type `to`
/// without losing information.
///
/// The relation is reflexive. Primitives follow [`PrimitiveType::widens_to`].
/// Nested types widen element-wise: a list or map value may never go from
/// required to optional in reverse, and a struct may gain new optional fields but
/// never lose one or gain a required one.
pub fn widens_to(from: &SchemaType, to: &SchemaType) -> bool {
    match (from, to) {
        (SchemaType::Primitive(f), SchemaType::Primitive(t)) => f.widens_to(t),
        (SchemaType::Struct(f), SchemaType::Struct(t)) => f.widens_to(t),
        (SchemaType::List(f), SchemaType::List(t)) => {
            (f.field().required() || !t.field().required())
                && widens_to(f.field().schema_type(), t.field().schema_type())
        },
        (SchemaType::Map(f), SchemaType::Map(t)) => {
            widens_to(f.key().schema_type(), t.key().schema_type())
                && (f.value().required() || !t.value().required())
                && widens_to(f.value().schema_type(), t.value().schema_type())
        },
        _ => false
    }
}
