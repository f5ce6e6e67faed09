//! Interface for working with column values.
//!
//! This module provides [`Value`] which represents a single non-null value of a
//! column. Nulls are represented by `None` wherever a row holds an
//! `Option<Value>`.
use std::collections::HashMap;

use uuid::Uuid;
use chrono::{NaiveDate, NaiveTime, NaiveDateTime, DateTime, Utc};
use serde::{Serialize, de::Error as _};

use crate::schema::{SchemaType, PrimitiveType};

const TIME_FORMAT: &str = "%H:%M:%S%.6f";
const TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";
const TIMESTAMPTZ_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f%:z";

/// Represents any valid column value.
///
/// The value serializes to JSON following the
/// [Iceberg single-value serialization](https://iceberg.apache.org/spec/#json-single-value-serialization).
/// Since the JSON form is ambiguous without a type, decoding goes through
/// [`Value::from_json`].
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Value {
    Boolean(bool),
    Int(i32),
    Long(i64),
    Float(f32),
    Double(f64),
    /// Unscaled decimal value, the scale comes from the column type.
    #[serde(serialize_with = "serialize_decimal")]
    Decimal(i128),
    Date(NaiveDate),
    #[serde(serialize_with = "serialize_time")]
    Time(NaiveTime),
    #[serde(serialize_with = "serialize_timestamp")]
    Timestamp(NaiveDateTime),
    #[serde(serialize_with = "serialize_timestamptz")]
    Timestamptz(DateTime<Utc>),
    String(String),
    Uuid(Uuid),
    #[serde(serialize_with = "serialize_binary")]
    Fixed(Vec<u8>),
    #[serde(serialize_with = "serialize_binary")]
    Binary(Vec<u8>),
    /// Struct members by name. Absent members are null.
    Struct(HashMap<String, Value>),
    List(Vec<Value>),
    #[serde(serialize_with = "serialize_map")]
    Map(Vec<(Value, Value)>),
}

impl Value {
    /// Returns true if this value can be stored in a column of type `r#type`
    /// without conversion.
    ///
    /// # Examples
    ///
    /// ```rust
    /// use evolake::value::Value;
    /// use evolake::schema::{SchemaType, PrimitiveType};
    ///
    /// assert!(Value::Int(0).matches_type(&SchemaType::Primitive(PrimitiveType::Int)));
    /// assert!(!Value::Int(0).matches_type(&SchemaType::Primitive(PrimitiveType::Long)));
    /// ```
    pub fn matches_type(&self, r#type: &SchemaType) -> bool {
        match (self, r#type) {
            (Value::Struct(members), SchemaType::Struct(s)) => {
                let known = members.keys().all(|name| {
                    s.fields().iter().any(|field| field.name() == name)
                });
                known && s.fields().iter().all(|field| {
                    match members.get(field.name()) {
                        Some(member) => member.matches_type(field.schema_type()),
                        None => !field.required(),
                    }
                })
            },
            (Value::List(items), SchemaType::List(l)) => {
                items.iter().all(|item| item.matches_type(l.field().schema_type()))
            },
            (Value::Map(entries), SchemaType::Map(m)) => {
                entries.iter().all(|(k, v)| {
                    k.matches_type(m.key().schema_type())
                        && v.matches_type(m.value().schema_type())
                })
            },
            (value, SchemaType::Primitive(p)) => {
                match (value, p) {
                    (Value::Boolean(_), PrimitiveType::Boolean) |
                    (Value::Int(_), PrimitiveType::Int) |
                    (Value::Long(_), PrimitiveType::Long) |
                    (Value::Float(_), PrimitiveType::Float) |
                    (Value::Double(_), PrimitiveType::Double) |
                    (Value::Date(_), PrimitiveType::Date) |
                    (Value::Time(_), PrimitiveType::Time) |
                    (Value::Timestamp(_), PrimitiveType::Timestamp) |
                    (Value::Timestamptz(_), PrimitiveType::Timestamptz) |
                    (Value::String(_), PrimitiveType::String) |
                    (Value::Uuid(_), PrimitiveType::Uuid) |
                    (Value::Binary(_), PrimitiveType::Binary) => true,
                    (Value::Fixed(bytes), PrimitiveType::Fixed(len)) => {
                        bytes.len() as u64 == *len
                    },
                    (Value::Decimal(unscaled), PrimitiveType::Decimal { precision, .. }) => {
                        unscaled.unsigned_abs().to_string().len() <= *precision as usize
                    },
                    _ => false
                }
            },
            _ => false
        }
    }

    /// Converts a value of some type into a value of the wider type `target`.
    ///
    /// Returns `None` if the value does not match a type that widens to `target`.
    pub fn cast_to(&self, target: &SchemaType) -> Option<Value> {
        match (self, target) {
            (Value::Int(i), SchemaType::Primitive(PrimitiveType::Long)) => {
                Some(Value::Long(i64::from(*i)))
            },
            (Value::Float(f), SchemaType::Primitive(PrimitiveType::Double)) => {
                Some(Value::Double(f64::from(*f)))
            },
            (Value::Struct(members), SchemaType::Struct(s)) => {
                if members.keys().any(|name| {
                    !s.fields().iter().any(|field| field.name() == name)
                }) {
                    return None;
                }
                let mut cast = HashMap::with_capacity(members.len());
                for field in s.fields() {
                    match members.get(field.name()) {
                        Some(member) => {
                            cast.insert(
                                field.name().to_string(),
                                member.cast_to(field.schema_type())?
                            );
                        },
                        None if field.required() => return None,
                        None => {},
                    }
                }
                Some(Value::Struct(cast))
            },
            (Value::List(items), SchemaType::List(l)) => {
                items.iter()
                    .map(|item| item.cast_to(l.field().schema_type()))
                    .collect::<Option<Vec<_>>>()
                    .map(Value::List)
            },
            (Value::Map(entries), SchemaType::Map(m)) => {
                entries.iter()
                    .map(|(k, v)| Some((
                        k.cast_to(m.key().schema_type())?,
                        v.cast_to(m.value().schema_type())?
                    )))
                    .collect::<Option<Vec<_>>>()
                    .map(Value::Map)
            },
            (value, target) if value.matches_type(target) => Some(value.clone()),
            _ => None
        }
    }

    /// Decodes a value of type `r#type` from its JSON single-value form.
    ///
    /// # Errors
    ///
    /// Returns a [`serde_json::Error`] if `json` is not a valid encoding of a value
    /// of the given type.
    pub fn from_json(
        json: &serde_json::Value,
        r#type: &SchemaType
    ) -> Result<Value, serde_json::Error> {
        let invalid = || serde_json::Error::custom(format!(
            "invalid json value {} for type {}", json, r#type
        ));

        match r#type {
            SchemaType::Primitive(p) => {
                match p {
                    PrimitiveType::Boolean => {
                        json.as_bool().map(Value::Boolean).ok_or_else(invalid)
                    },
                    PrimitiveType::Int => {
                        json.as_i64()
                            .and_then(|i| i32::try_from(i).ok())
                            .map(Value::Int)
                            .ok_or_else(invalid)
                    },
                    PrimitiveType::Long => {
                        json.as_i64().map(Value::Long).ok_or_else(invalid)
                    },
                    PrimitiveType::Float => {
                        json.as_f64().map(|f| Value::Float(f as f32)).ok_or_else(invalid)
                    },
                    PrimitiveType::Double => {
                        json.as_f64().map(Value::Double).ok_or_else(invalid)
                    },
                    PrimitiveType::Decimal { .. } => {
                        json.as_str()
                            .and_then(|s| s.parse::<i128>().ok())
                            .map(Value::Decimal)
                            .ok_or_else(invalid)
                    },
                    PrimitiveType::Date => {
                        let s = json.as_str().ok_or_else(invalid)?;
                        NaiveDate::parse_from_str(s, "%Y-%m-%d")
                            .map(Value::Date)
                            .map_err(serde_json::Error::custom)
                    },
                    PrimitiveType::Time => {
                        let s = json.as_str().ok_or_else(invalid)?;
                        NaiveTime::parse_from_str(s, TIME_FORMAT)
                            .map(Value::Time)
                            .map_err(serde_json::Error::custom)
                    },
                    PrimitiveType::Timestamp => {
                        let s = json.as_str().ok_or_else(invalid)?;
                        NaiveDateTime::parse_from_str(s, TIMESTAMP_FORMAT)
                            .map(Value::Timestamp)
                            .map_err(serde_json::Error::custom)
                    },
                    PrimitiveType::Timestamptz => {
                        let s = json.as_str().ok_or_else(invalid)?;
                        DateTime::parse_from_str(s, TIMESTAMPTZ_FORMAT)
                            .map(|dt| Value::Timestamptz(dt.with_timezone(&Utc)))
                            .map_err(serde_json::Error::custom)
                    },
                    PrimitiveType::String => {
                        json.as_str()
                            .map(|s| Value::String(s.to_string()))
                            .ok_or_else(invalid)
                    },
                    PrimitiveType::Uuid => {
                        let s = json.as_str().ok_or_else(invalid)?;
                        Uuid::parse_str(s)
                            .map(Value::Uuid)
                            .map_err(serde_json::Error::custom)
                    },
                    PrimitiveType::Fixed(_) => {
                        decode_hex(json.as_str().ok_or_else(invalid)?).map(Value::Fixed)
                    },
                    PrimitiveType::Binary => {
                        decode_hex(json.as_str().ok_or_else(invalid)?).map(Value::Binary)
                    },
                }
            },
            SchemaType::Struct(s) => {
                let object = json.as_object().ok_or_else(invalid)?;
                let mut members = HashMap::new();
                for field in s.fields() {
                    match object.get(field.name()) {
                        None | Some(serde_json::Value::Null) => {},
                        Some(member) => {
                            members.insert(
                                field.name().to_string(),
                                Value::from_json(member, field.schema_type())?
                            );
                        }
                    }
                }
                Ok(Value::Struct(members))
            },
            SchemaType::List(l) => {
                json.as_array()
                    .ok_or_else(invalid)?
                    .iter()
                    .map(|item| Value::from_json(item, l.field().schema_type()))
                    .collect::<Result<Vec<_>, _>>()
                    .map(Value::List)
            },
            SchemaType::Map(m) => {
                let keys = json.get("keys").and_then(|k| k.as_array()).ok_or_else(invalid)?;
                let values = json.get("values").and_then(|v| v.as_array()).ok_or_else(invalid)?;
                if keys.len() != values.len() {
                    return Err(invalid());
                }
                keys.iter()
                    .zip(values.iter())
                    .map(|(k, v)| Ok((
                        Value::from_json(k, m.key().schema_type())?,
                        Value::from_json(v, m.value().schema_type())?
                    )))
                    .collect::<Result<Vec<_>, serde_json::Error>>()
                    .map(Value::Map)
            }
        }
    }

    /// Days since 1970-01-01, for date values.
    pub(crate) fn days_from_epoch(date: &NaiveDate) -> i64 {
        (*date - NaiveDate::default()).num_days()
    }

    /// Microseconds since 1970-01-01T00:00:00, for time-based values.
    ///
    /// Returns `None` for non-temporal values and for timestamps too far from the
    /// epoch to count in microseconds.
    pub(crate) fn micros(&self) -> Option<i64> {
        match self {
            Value::Time(time) => (*time - NaiveTime::default()).num_microseconds(),
            Value::Timestamp(ts) => (*ts - NaiveDateTime::default()).num_microseconds(),
            Value::Timestamptz(ts) => {
                (ts.naive_utc() - NaiveDateTime::default()).num_microseconds()
            },
            _ => None
        }
    }

    /// Returns the bytes this value hashes as for bucketing.
    ///
    /// Integers and dates hash as 8-byte little-endian longs, times and timestamps
    /// as their microseconds, strings as UTF-8, uuids as 16 big-endian bytes and
    /// decimals as the minimal big-endian two's complement of the unscaled value.
    /// Booleans, floating point values and nested values can't be bucketed.
    pub(crate) fn hash_bytes(&self) -> Option<Vec<u8>> {
        match self {
            Value::Int(i) => Some(Vec::from(i64::from(*i).to_le_bytes())),
            Value::Long(l) => Some(Vec::from(l.to_le_bytes())),
            Value::Date(date) => {
                Some(Vec::from(Value::days_from_epoch(date).to_le_bytes()))
            },
            Value::Time(_) | Value::Timestamp(_) | Value::Timestamptz(_) => {
                self.micros().map(|micros| Vec::from(micros.to_le_bytes()))
            },
            Value::String(s) => Some(s.as_bytes().to_vec()),
            Value::Uuid(uuid) => Some(uuid.as_bytes().to_vec()),
            Value::Fixed(bytes) | Value::Binary(bytes) => Some(bytes.clone()),
            Value::Decimal(unscaled) => {
                let bytes = unscaled.to_be_bytes();
                // Strip redundant sign-extension bytes.
                let mut start = 0;
                while start < bytes.len() - 1 {
                    let (b, next) = (bytes[start], bytes[start + 1]);
                    if (b == 0x00 && next & 0x80 == 0) || (b == 0xff && next & 0x80 != 0) {
                        start += 1;
                    } else {
                        break;
                    }
                }
                Some(bytes[start..].to_vec())
            },
            _ => None
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Boolean(b) => write!(f, "{b}"),
            Value::Int(i) => write!(f, "{i}"),
            Value::Long(l) => write!(f, "{l}"),
            Value::Float(x) => write!(f, "{x}"),
            Value::Double(x) => write!(f, "{x}"),
            Value::Decimal(unscaled) => write!(f, "{unscaled}"),
            Value::Date(date) => write!(f, "{}", date.format("%Y-%m-%d")),
            Value::Time(time) => write!(f, "{}", time.format(TIME_FORMAT)),
            Value::Timestamp(ts) => write!(f, "{}", ts.format(TIMESTAMP_FORMAT)),
            Value::Timestamptz(ts) => write!(f, "{}", ts.format(TIMESTAMPTZ_FORMAT)),
            Value::String(s) => write!(f, "{s}"),
            Value::Uuid(uuid) => write!(f, "{uuid}"),
            Value::Fixed(bytes) | Value::Binary(bytes) => write!(f, "{}", encode_hex(bytes)),
            nested => {
                let json = serde_json::to_string(nested).map_err(|_| std::fmt::Error)?;
                write!(f, "{json}")
            }
        }
    }
}

fn encode_hex(bytes: &[u8]) -> String {
    bytes.iter().map(|x| format!("{:02x}", x)).collect::<String>()
}

fn decode_hex(s: &str) -> Result<Vec<u8>, serde_json::Error> {
    if s.len() % 2 != 0 || !s.is_ascii() {
        Err(serde_json::Error::custom("invalid hex string"))
    } else {
        (0..s.len())
            .step_by(2)
            .map(|i| {
                u8::from_str_radix(&s[i..i + 2], 16).map_err(serde_json::Error::custom)
            })
            .collect()
    }
}

fn serialize_decimal<S: serde::Serializer>(
    unscaled: &i128,
    serializer: S
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&unscaled.to_string())
}

/// Times serialize with microsecond precision instead of the default nanosecond.
fn serialize_time<S: serde::Serializer>(
    time: &NaiveTime,
    serializer: S
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&time.format(TIME_FORMAT).to_string())
}

fn serialize_timestamp<S: serde::Serializer>(
    datetime: &NaiveDateTime,
    serializer: S
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&datetime.format(TIMESTAMP_FORMAT).to_string())
}

fn serialize_timestamptz<S: serde::Serializer>(
    datetime: &DateTime<Utc>,
    serializer: S
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&datetime.format(TIMESTAMPTZ_FORMAT).to_string())
}

#[allow(clippy::ptr_arg)]
fn serialize_binary<S: serde::Serializer>(
    binary: &Vec<u8>,
    serializer: S
) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&encode_hex(binary))
}

#[allow(clippy::ptr_arg)]
fn serialize_map<S: serde::Serializer>(
    entries: &Vec<(Value, Value)>,
    serializer: S
) -> Result<S::Ok, S::Error> {
    use serde::ser::SerializeStruct;

    let keys = entries.iter().map(|(k, _)| k).collect::<Vec<_>>();
    let values = entries.iter().map(|(_, v)| v).collect::<Vec<_>>();

    let mut state = serializer.serialize_struct("Map", 2)?;
    state.serialize_field("keys", &keys)?;
    state.serialize_field("values", &values)?;
    state.end()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use serde_json;
    use uuid::Uuid;
    use chrono::{NaiveDate, NaiveTime, NaiveDateTime, DateTime, Utc};

    use crate::value::Value;
    use crate::schema::{SchemaType, PrimitiveType, StructType, ListType, Field};

    fn primitive(p: PrimitiveType) -> SchemaType {
        SchemaType::Primitive(p)
    }

    /// Serializing to json matches the Iceberg single-value JSON serialization.
    #[test]
    fn json_serialization() {
        let value = Value::Int(42);
        assert_eq!(serde_json::to_string(&value).unwrap(), "42");

        let value = Value::Date(NaiveDate::from_ymd_opt(2023, 1, 1).unwrap());
        assert_eq!(serde_json::to_string(&value).unwrap(), "\"2023-01-01\"");

        // Time values encode only microsecond precision.
        let value = Value::Time(
            "22:31:08.123456789".parse::<NaiveTime>().unwrap()
        );
        assert_eq!(serde_json::to_string(&value).unwrap(), "\"22:31:08.123456\"");

        let value = Value::Timestamp(
            "2017-11-16T22:31:08.123456789".parse::<NaiveDateTime>().unwrap()
        );
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            "\"2017-11-16T22:31:08.123456\""
        );

        let value = Value::Timestamptz(
            "2017-11-16T22:31:08.123456789+00:00".parse::<DateTime<Utc>>().unwrap()
        );
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            "\"2017-11-16T22:31:08.123456+00:00\""
        );

        let value = Value::Uuid(
            Uuid::parse_str("f79c3e09-677c-4bbd-a479-3f349cb785e7").unwrap()
        );
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            "\"f79c3e09-677c-4bbd-a479-3f349cb785e7\""
        );

        let value = Value::Binary(vec![0x00, 0x01, 0x02, 0xff]);
        assert_eq!(serde_json::to_string(&value).unwrap(), "\"000102ff\"");

        let value = Value::List(vec![Value::Int(1), Value::Int(2), Value::Int(3)]);
        assert_eq!(serde_json::to_string(&value).unwrap(), "[1,2,3]");

        let value = Value::Map(vec![(Value::String("a".into()), Value::Long(1))]);
        assert_eq!(
            serde_json::to_string(&value).unwrap(),
            r#"{"keys":["a"],"values":[1]}"#
        );
    }

    #[test]
    fn json_decoding() {
        let ts = primitive(PrimitiveType::Timestamp);
        let decoded = Value::from_json(
            &serde_json::json!("2017-11-16T22:31:08.123456"), &ts
        ).unwrap();
        assert_eq!(
            decoded,
            Value::Timestamp("2017-11-16T22:31:08.123456".parse().unwrap())
        );

        let point = SchemaType::Struct(StructType::new(vec![
            Field::new_primitive(1, "x", true, PrimitiveType::Long),
            Field::new_primitive(2, "label", false, PrimitiveType::String),
        ]));
        let decoded = Value::from_json(&serde_json::json!({"x": 3}), &point).unwrap();
        assert_eq!(decoded, Value::Struct(HashMap::from([
            ("x".to_string(), Value::Long(3))
        ])));

        assert!(Value::from_json(&serde_json::json!("3"), &primitive(PrimitiveType::Int)).is_err());
        assert!(Value::from_json(
            &serde_json::json!(i64::MAX), &primitive(PrimitiveType::Int)
        ).is_err());
    }

    #[test]
    fn widening_casts() {
        assert_eq!(
            Value::Int(7).cast_to(&primitive(PrimitiveType::Long)),
            Some(Value::Long(7))
        );
        assert_eq!(
            Value::Float(1.5).cast_to(&primitive(PrimitiveType::Double)),
            Some(Value::Double(1.5))
        );
        assert_eq!(Value::Long(7).cast_to(&primitive(PrimitiveType::Int)), None);

        let longs = SchemaType::List(ListType::new(3, true, primitive(PrimitiveType::Long)));
        assert_eq!(
            Value::List(vec![Value::Int(1), Value::Int(2)]).cast_to(&longs),
            Some(Value::List(vec![Value::Long(1), Value::Long(2)]))
        );
    }

    #[test]
    fn decimal_precision() {
        let d = primitive(PrimitiveType::Decimal { precision: 4, scale: 2 });
        assert!(Value::Decimal(1234).matches_type(&d));
        assert!(Value::Decimal(-1234).matches_type(&d));
        assert!(!Value::Decimal(12345).matches_type(&d));
    }

    #[test]
    fn decimal_hash_bytes_are_minimal() {
        assert_eq!(Value::Decimal(1420).hash_bytes().unwrap(), vec![0x05, 0x8c]);
        assert_eq!(Value::Decimal(-1).hash_bytes().unwrap(), vec![0xff]);
        assert_eq!(Value::Decimal(127).hash_bytes().unwrap(), vec![0x7f]);
        assert_eq!(Value::Decimal(128).hash_bytes().unwrap(), vec![0x00, 0x80]);
    }
}
