//! Table schemas and their fields.

use serde::{Serialize, Deserialize};

use crate::{TableResult, TableError};
use crate::schema::{SchemaType, PrimitiveType, StructType, ListType, MapType};

#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
/// A schema field.
pub struct Field {
    /// Unique Id, never reused within a table.
    pub id: i32,
    /// Field Name
    pub name: String,
    /// Optional or required, meaning that values can (or can not be null)
    pub required: bool,
    /// Field can have any type
    pub r#type: SchemaType,
    /// Fields can have any optional comment or doc string.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub doc: Option<String>,
}

impl Field {
    pub fn new(
        id: i32,
        name: &str,
        required: bool,
        r#type: SchemaType
    ) -> Self {
        Self {
            id: id,
            name: name.to_string(),
            required: required,
            r#type: r#type,
            doc: None,
        }
    }

    /// Creates a new `Field` with type [`SchemaType::Primitive`]
    pub fn new_primitive(
        id: i32,
        name: &str,
        required: bool,
        primitive: PrimitiveType
    ) -> Self {
        Self::new(
            id, name, required, SchemaType::Primitive(primitive)
        )
    }

    /// Creates a new `Field` with type [`SchemaType::Struct`]
    pub fn new_struct(
        id: i32,
        name: &str,
        required: bool,
        fields: impl IntoIterator<Item = Field>
    ) -> Self {
        Self::new(
            id, name, required,
            SchemaType::Struct(StructType::new(Vec::from_iter(fields)))
        )
    }

    /// Creates a new `Field` with type [`SchemaType::List`]
    pub fn new_list(
        id: i32,
        name: &str,
        required: bool,
        element: Field,
    ) -> Self {
        Self::new(
            id, name, required,
            SchemaType::List(ListType::new(
                element.id,
                element.required,
                element.r#type
            ))
        )
    }

    /// Creates a new `Field` with type [`SchemaType::Map`]
    pub fn new_map(
        id: i32,
        name: &str,
        required: bool,
        key: Field,
        value: Field,
    ) -> Self {
        Self::new(
            id, name, required,
            SchemaType::Map(MapType::new(
                key.id,
                key.r#type,
                value.id,
                value.required,
                value.r#type
            ))
        )
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn required(&self) -> bool {
        self.required
    }

    pub fn doc(&self) -> Option<&str> {
        self.doc.as_deref()
    }

    pub fn schema_type(&self) -> &SchemaType {
        &self.r#type
    }

    pub fn with_doc(mut self, doc: impl Into<String>) -> Self {
        self.doc = Some(doc.into());
        self
    }

    /// Assigns new ids from the `next_id` function to this field and all
    /// recursively nested fields.
    pub fn with_fresh_ids<F>(mut self, next_id: &mut F) -> Self
    where
        F: FnMut() -> i32
    {
        self.id = next_id();
        self.r#type = self.r#type.with_fresh_ids(next_id);
        self
    }

    /// Returns an iterator on all recursively nested fields inside this field,
    /// including `self`.
    pub fn all_fields(&self) -> Box<dyn Iterator<Item = &Self> + '_> {
        let iterator = std::iter::once(self);

        match self.schema_type() {
            SchemaType::Primitive(_) => {
                Box::new(iterator)
            },
            SchemaType::Struct(s) => {
                Box::new(iterator.chain(
                    s.fields()
                        .iter()
                        .flat_map(|field| field.all_fields())
                ))
            },
            SchemaType::List(l) => {
                Box::new(iterator.chain(
                    l.field().all_fields()
                ))
            },
            SchemaType::Map(m) => {
                Box::new(iterator.chain(
                    m.key().all_fields()
                ).chain(
                    m.value().all_fields()
                ))
            }
        }
    }
}

/// A table schema: an ordered list of top-level fields and a version number.
///
/// Schemas are immutable values. Evolving a table produces a new `Schema` with a
/// higher `schema_id`, see [`SchemaChange`](crate::schema::SchemaChange).
#[derive(Debug, Serialize, Deserialize, PartialEq, Eq, Clone)]
#[serde(rename_all = "kebab-case")]
pub struct Schema {
    /// Unique schema identifier, increasing with every evolution.
    schema_id: i32,
    /// Optionally track the set of primitive fields that identify rows in a table.
    #[serde(skip_serializing_if = "Option::is_none")]
    identifier_field_ids: Option<Vec<i32>>,
    /// Actual fields, embedded as a struct object.
    #[serde(flatten)]
    schema: StructType,
}

impl Schema {
    pub fn new(
        schema_id: i32,
        fields: Vec<Field>
    ) -> Self {
        Self {
            schema_id: schema_id,
            identifier_field_ids: None,
            schema: StructType::new(fields),
        }
    }

    pub fn id(&self) -> i32 { self.schema_id }

    /// Returns the highest field id used in the schema, including nested fields,
    /// or zero for an empty schema.
    pub fn max_field_id(&self) -> i32 {
        self.all_fields().map(|f| f.id()).max().unwrap_or(0)
    }

    /// Returns a shared slice of the top-level fields in the schema.
    pub fn fields(&self) -> &[Field] {
        &self.schema.fields
    }

    /// Returns an iterator on all recursively nested fields in the schema in a
    /// depth-first order.
    ///
    /// A reference is returned for each primitive field,
    /// list element, nested struct field and map key value element.
    pub fn all_fields(&self) -> impl Iterator<Item = &Field> {
        self.schema.fields.iter()
            .flat_map(|field| field.all_fields())
    }

    /// Finds a top-level schema field by its name.
    pub fn get_field_by_name(&self, name: &str) -> Option<&Field> {
        self.fields().iter()
            .find(|field| field.name == name)
    }

    /// Finds a top-level schema field by its id.
    pub fn get_field_by_id(&self, id: i32) -> Option<&Field> {
        self.fields().iter()
            .find(|field| field.id == id)
    }

    /// Finds a field at any nesting level by its id.
    pub fn find_field_by_id(&self, id: i32) -> Option<&Field> {
        self.all_fields().find(|field| field.id == id)
    }

    /// Returns the position of the top-level field with the given id.
    pub fn position_of(&self, id: i32) -> Option<usize> {
        self.fields().iter().position(|field| field.id == id)
    }

    pub fn encode(&self) -> TableResult<String> {
        serde_json::to_string(self).map_err(|e| TableError::SerializeMetadataJson {
            source: e
        })
    }

    pub(crate) fn with_id(mut self, schema_id: i32) -> Self {
        self.schema_id = schema_id;
        self
    }
}
