//! Table schemas, their types and their evolution.
//!
//! This module provides [`Schema`] which represents the schema of a table. Each
//! schema has a `schema_id` and a vector of fields represented by [`Field`].
//!
//! Each field has an associated type, represented in this module by
//! [`SchemaType`]. The schema can be highly complex with nested fields such as
//! [`SchemaType::Struct`].
//!
//! Each top-level and nested field has an associated id. Ids are assigned once from
//! a table-wide counter and never reused, so a column keeps its identity across
//! renames and a dropped column can never be confused with a new column of the same
//! name. Evolution is expressed with [`SchemaChange`].
//!
//! ## Creating a simple schema
//!
//! ```rust
//! use evolake::schema::{Schema, Field, PrimitiveType};
//!
//! let schema = Schema::new(0, vec![
//!     Field::new_primitive(1, "id", true, PrimitiveType::Long),
//!     Field::new_primitive(2, "ts", false, PrimitiveType::Timestamp),
//! ]);
//! assert_eq!(schema.max_field_id(), 2);
//! ```
//!
//! ## Evolving a schema
//!
//! ```rust
//! use evolake::schema::{Schema, Field, PrimitiveType, SchemaType, SchemaChange};
//!
//! let base = Schema::new(0, vec![
//!     Field::new_primitive(1, "id", true, PrimitiveType::Int),
//! ]);
//! let (evolved, last_column_id) = SchemaChange::apply_all(&base, 1, &[
//!     SchemaChange::update_column_type("id", SchemaType::Primitive(PrimitiveType::Long)),
//!     SchemaChange::add_column("level", SchemaType::Primitive(PrimitiveType::String)),
//! ]).unwrap();
//!
//! assert_eq!(evolved.id(), 1);
//! assert_eq!(last_column_id, 2);
//! ```
mod types;
#[allow(clippy::module_inception)]
mod schema;
mod update;

pub use self::types::{
    SchemaType, PrimitiveType, StructType, ListType, MapType, widens_to
};

pub use self::schema::{
    Schema, Field
};

pub use self::update::{
    SchemaChange, SchemaError
};
