//! Reconciliation of incoming batches with a table's schema.
//!
//! Batches come from flat sources whose columns are identified only by name and
//! whose order and column set change from file to file. [`reconcile`] maps each
//! batch column to a table field id, and either produces a [`Projection`] that
//! turns batch rows into rows of the table schema, or proposes the schema changes
//! the batch would need. Proposed changes are never applied here.
use std::collections::HashMap;

use crate::schema::{Schema, SchemaType, PrimitiveType, SchemaChange, widens_to};
use crate::value::Value;
use crate::ingest::IngestionError;

/// A column of an incoming batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchField {
    pub name: String,
    pub field_type: SchemaType,
}

impl BatchField {
    pub fn new(name: &str, field_type: SchemaType) -> Self {
        Self { name: name.to_string(), field_type }
    }

    pub fn primitive(name: &str, field_type: PrimitiveType) -> Self {
        Self::new(name, SchemaType::Primitive(field_type))
    }
}

/// The ad-hoc schema of a batch: ordered, named and typed columns without ids.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BatchSchema {
    fields: Vec<BatchField>,
}

impl BatchSchema {
    pub fn new(fields: Vec<BatchField>) -> Self {
        Self { fields }
    }

    pub fn fields(&self) -> &[BatchField] {
        &self.fields
    }
}

/// Rows of values laid out by a [`BatchSchema`]. `None` cells are nulls.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    schema: BatchSchema,
    rows: Vec<Vec<Option<Value>>>,
}

impl Batch {
    pub fn new(fields: Vec<BatchField>, rows: Vec<Vec<Option<Value>>>) -> Self {
        Self { schema: BatchSchema::new(fields), rows }
    }

    pub fn schema(&self) -> &BatchSchema {
        &self.schema
    }

    pub fn rows(&self) -> &[Vec<Option<Value>>] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// The type given to columns proposed for batch columns unknown to the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum NewColumnType {
    /// Always `string`, for untyped sources. Batch columns of other types are
    /// rejected rather than coerced.
    String,
    /// The type of the batch column.
    #[default]
    Inferred,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconcileOptions {
    pub case_sensitive: bool,
    pub new_column_type: NewColumnType,
}

impl Default for ReconcileOptions {
    fn default() -> Self {
        Self {
            case_sensitive: true,
            new_column_type: NewColumnType::default(),
        }
    }
}

/// Where the value of a table column comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnSource {
    /// The batch column at this position, stored as is.
    Copy(usize),
    /// The batch column at this position, widened to the table type.
    Cast(usize),
    /// No batch column; the optional table column is null.
    FillNull,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectedColumn {
    pub field_id: i32,
    pub name: String,
    pub required: bool,
    pub field_type: SchemaType,
    pub source: ColumnSource,
}

impl ProjectedColumn {
    fn source_index(&self) -> Option<usize> {
        match self.source {
            ColumnSource::Copy(index) | ColumnSource::Cast(index) => Some(index),
            ColumnSource::FillNull => None,
        }
    }
}

/// Maps batch rows to rows of a specific table schema, in table field order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Projection {
    schema_id: i32,
    columns: Vec<ProjectedColumn>,
    batch_types: Vec<SchemaType>,
}

impl Projection {
    /// Id of the table schema the projected rows conform to.
    pub fn schema_id(&self) -> i32 {
        self.schema_id
    }

    pub fn columns(&self) -> &[ProjectedColumn] {
        &self.columns
    }

    /// Projects a batch row to a table row.
    ///
    /// `row_index` is only used in errors.
    ///
    /// # Errors
    ///
    /// [`IngestionError::InvalidValue`] if a cell does not match the declared type
    /// of its batch column, or the row is shorter than the batch schema, and
    /// [`IngestionError::NullInRequiredColumn`] for a null in a required column.
    pub fn project_row(
        &self,
        row_index: usize,
        row: &[Option<Value>]
    ) -> Result<Vec<Option<Value>>, IngestionError> {
        if row.len() != self.batch_types.len() {
            return Err(IngestionError::InvalidValue {
                name: "*".to_string(),
                row: row_index,
                reason: format!(
                    "row has {} cells but the batch has {} columns",
                    row.len(), self.batch_types.len()
                ),
            });
        }

        self.columns.iter()
            .map(|column| {
                let value = match column.source_index() {
                    Some(index) => row[index].as_ref(),
                    None => None,
                };

                let value = match (value, &column.source) {
                    (None, _) => None,
                    (Some(value), source) => {
                        let batch_type = column.source_index()
                            .map(|index| &self.batch_types[index])
                            .unwrap_or(&column.field_type);
                        if !value.matches_type(batch_type) {
                            return Err(IngestionError::InvalidValue {
                                name: column.name.clone(),
                                row: row_index,
                                reason: format!("value {} is not a {}", value, batch_type),
                            });
                        }
                        match source {
                            ColumnSource::Cast(_) => Some(
                                value.cast_to(&column.field_type).ok_or_else(|| {
                                    IngestionError::InvalidValue {
                                        name: column.name.clone(),
                                        row: row_index,
                                        reason: format!(
                                            "value {} can't be widened to {}",
                                            value, column.field_type
                                        ),
                                    }
                                })?
                            ),
                            _ => Some(value.clone()),
                        }
                    }
                };

                if value.is_none() && column.required {
                    return Err(IngestionError::NullInRequiredColumn {
                        name: column.name.clone(),
                        row: row_index,
                    });
                }
                Ok(value)
            })
            .collect()
    }

    /// Returns true if both projections take every table field from the same batch
    /// column, so rows projected by one are valid rows for the other.
    pub fn has_same_sources(&self, other: &Projection) -> bool {
        let sources = |p: &Projection| {
            p.columns.iter()
                .filter_map(|c| c.source_index().map(|index| (c.field_id, index)))
                .collect::<HashMap<i32, usize>>()
        };
        sources(self) == sources(other)
    }
}

/// The outcome of reconciling a batch with a table schema.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reconciliation {
    /// The batch can be written as is through the projection.
    Ready(Projection),
    /// The batch has columns unknown to the table. Applying the proposed changes
    /// and reconciling again yields a projection.
    NeedsEvolution(Vec<SchemaChange>),
}

/// Reconciles the schema of a batch with a table schema.
///
/// Batch columns are matched to top-level table fields by name. The result is
/// deterministic and depends only on the two schemas and the options.
///
/// # Errors
///
/// * [`IngestionError::AmbiguousColumn`] if two batch columns match one name, or
///   one batch column matches two table fields.
/// * [`IngestionError::MissingRequiredColumn`] if a required table field has no
///   batch column.
/// * [`IngestionError::IncompatibleTypeChange`] if a batch column's type does not
///   widen to its table field's type, or a new column can't be given the type the
///   options demand.
pub fn reconcile(
    table: &Schema,
    batch: &BatchSchema,
    options: &ReconcileOptions
) -> Result<Reconciliation, IngestionError> {
    let key = |name: &str| -> String {
        if options.case_sensitive {
            name.to_string()
        } else {
            name.to_lowercase()
        }
    };

    // Batch column positions by matching key, in batch order.
    let mut by_key: HashMap<String, Vec<usize>> = HashMap::new();
    for (index, field) in batch.fields().iter().enumerate() {
        by_key.entry(key(&field.name)).or_default().push(index);
    }

    let mut columns = Vec::with_capacity(table.fields().len());
    // The table field each batch column was matched to.
    let mut matched: Vec<Option<&str>> = vec![None; batch.fields().len()];

    for field in table.fields() {
        let positions = by_key.get(&key(field.name())).map(Vec::as_slice).unwrap_or(&[]);

        let source = match positions {
            [] => {
                if field.required() {
                    return Err(IngestionError::MissingRequiredColumn {
                        name: field.name().to_string()
                    });
                }
                ColumnSource::FillNull
            },
            [index] => {
                if let Some(claimed) = matched[*index] {
                    return Err(IngestionError::AmbiguousColumn {
                        name: batch.fields()[*index].name.clone(),
                        columns: vec![claimed.to_string(), field.name().to_string()],
                    });
                }
                matched[*index] = Some(field.name());
                let batch_type = &batch.fields()[*index].field_type;
                if batch_type == field.schema_type() {
                    ColumnSource::Copy(*index)
                } else if widens_to(batch_type, field.schema_type()) {
                    ColumnSource::Cast(*index)
                } else {
                    return Err(IngestionError::IncompatibleTypeChange {
                        name: field.name().to_string(),
                        from: batch_type.to_string(),
                        to: field.schema_type().to_string(),
                    });
                }
            },
            _ => {
                return Err(IngestionError::AmbiguousColumn {
                    name: field.name().to_string(),
                    columns: positions.iter()
                        .map(|index| batch.fields()[*index].name.clone())
                        .collect(),
                });
            }
        };

        columns.push(ProjectedColumn {
            field_id: field.id(),
            name: field.name().to_string(),
            required: field.required(),
            field_type: field.schema_type().clone(),
            source: source,
        });
    }

    let mut proposed = Vec::new();
    for (index, field) in batch.fields().iter().enumerate() {
        if matched[index].is_some() {
            continue;
        }

        let positions = &by_key[&key(&field.name)];
        if positions.len() > 1 {
            return Err(IngestionError::AmbiguousColumn {
                name: field.name.clone(),
                columns: positions.iter()
                    .map(|index| batch.fields()[*index].name.clone())
                    .collect(),
            });
        }

        let field_type = match options.new_column_type {
            NewColumnType::Inferred => field.field_type.clone(),
            NewColumnType::String => {
                let string = SchemaType::Primitive(PrimitiveType::String);
                if field.field_type != string {
                    return Err(IngestionError::IncompatibleTypeChange {
                        name: field.name.clone(),
                        from: field.field_type.to_string(),
                        to: string.to_string(),
                    });
                }
                string
            }
        };
        proposed.push(SchemaChange::add_column(&field.name, field_type));
    }

    if !proposed.is_empty() {
        return Ok(Reconciliation::NeedsEvolution(proposed));
    }

    Ok(Reconciliation::Ready(Projection {
        schema_id: table.id(),
        columns: columns,
        batch_types: batch.fields().iter().map(|f| f.field_type.clone()).collect(),
    }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::Field;

    fn table_schema() -> Schema {
        Schema::new(3, vec![
            Field::new_primitive(1, "name", true, PrimitiveType::String),
            Field::new_primitive(2, "age", false, PrimitiveType::Long),
            Field::new_primitive(3, "city", false, PrimitiveType::String),
        ])
    }

    fn ready(reconciliation: Reconciliation) -> Projection {
        match reconciliation {
            Reconciliation::Ready(projection) => projection,
            other => panic!("expected a projection, got {:?}", other),
        }
    }

    #[test]
    fn projects_in_table_order() {
        let batch = BatchSchema::new(vec![
            BatchField::primitive("age", PrimitiveType::Int),
            BatchField::primitive("name", PrimitiveType::String),
        ]);

        let projection = ready(reconcile(&table_schema(), &batch, &Default::default()).unwrap());
        assert_eq!(projection.schema_id(), 3);

        let sources = projection.columns().iter().map(|c| c.source.clone()).collect::<Vec<_>>();
        assert_eq!(sources, vec![
            ColumnSource::Copy(1),
            ColumnSource::Cast(0),
            ColumnSource::FillNull,
        ]);

        let row = projection.project_row(0, &[
            Some(Value::Int(30)), Some(Value::String("Alice".into()))
        ]).unwrap();
        assert_eq!(row, vec![
            Some(Value::String("Alice".into())),
            Some(Value::Long(30)),
            None,
        ]);
    }

    #[test]
    fn reconciliation_is_deterministic() {
        let batch = BatchSchema::new(vec![
            BatchField::primitive("zip", PrimitiveType::String),
            BatchField::primitive("name", PrimitiveType::String),
            BatchField::primitive("score", PrimitiveType::Double),
        ]);

        let first = reconcile(&table_schema(), &batch, &Default::default()).unwrap();
        let second = reconcile(&table_schema(), &batch, &Default::default()).unwrap();
        assert_eq!(first, second);
        assert_eq!(first, Reconciliation::NeedsEvolution(vec![
            SchemaChange::add_column("zip", SchemaType::Primitive(PrimitiveType::String)),
            SchemaChange::add_column("score", SchemaType::Primitive(PrimitiveType::Double)),
        ]));
    }

    #[test]
    fn missing_required_column() {
        let batch = BatchSchema::new(vec![BatchField::primitive("age", PrimitiveType::Long)]);

        let result = reconcile(&table_schema(), &batch, &Default::default());
        assert_eq!(result, Err(IngestionError::MissingRequiredColumn { name: "name".into() }));
    }

    #[test]
    fn narrowing_is_rejected() {
        let schema = Schema::new(0, vec![
            Field::new_primitive(1, "n", false, PrimitiveType::Int),
        ]);
        let batch = BatchSchema::new(vec![BatchField::primitive("n", PrimitiveType::Long)]);

        let result = reconcile(&schema, &batch, &Default::default());
        assert_eq!(result, Err(IngestionError::IncompatibleTypeChange {
            name: "n".into(),
            from: "long".into(),
            to: "int".into(),
        }));
    }

    #[test]
    fn case_insensitive_matching() {
        let batch = BatchSchema::new(vec![BatchField::primitive("NAME", PrimitiveType::String)]);
        let options = ReconcileOptions { case_sensitive: false, ..Default::default() };

        let projection = ready(reconcile(&table_schema(), &batch, &options).unwrap());
        assert_eq!(projection.columns()[0].source, ColumnSource::Copy(0));

        // Case sensitive matching sees a new column and a missing one.
        let result = reconcile(&table_schema(), &batch, &Default::default());
        assert!(matches!(result, Err(IngestionError::MissingRequiredColumn { .. })));

        let batch = BatchSchema::new(vec![
            BatchField::primitive("name", PrimitiveType::String),
            BatchField::primitive("Name", PrimitiveType::String),
        ]);
        let result = reconcile(&table_schema(), &batch, &options);
        assert!(matches!(result, Err(IngestionError::AmbiguousColumn { .. })));
    }

    #[test]
    fn one_column_for_two_fields() {
        let table = Schema::new(0, vec![
            Field::new_primitive(1, "name", false, PrimitiveType::String),
            Field::new_primitive(2, "NAME", false, PrimitiveType::String),
        ]);
        let batch = BatchSchema::new(vec![BatchField::primitive("Name", PrimitiveType::String)]);
        let options = ReconcileOptions { case_sensitive: false, ..Default::default() };

        assert_eq!(
            reconcile(&table, &batch, &options),
            Err(IngestionError::AmbiguousColumn {
                name: "Name".to_string(),
                columns: vec!["name".to_string(), "NAME".to_string()],
            })
        );

        // Case sensitive matching proposes a new column instead.
        let result = reconcile(&table, &batch, &Default::default()).unwrap();
        assert!(matches!(result, Reconciliation::NeedsEvolution(_)));
    }

    #[test]
    fn string_policy_rejects_typed_columns() {
        let batch = BatchSchema::new(vec![
            BatchField::primitive("name", PrimitiveType::String),
            BatchField::primitive("score", PrimitiveType::Double),
        ]);
        let options = ReconcileOptions {
            new_column_type: NewColumnType::String,
            ..Default::default()
        };

        let result = reconcile(&table_schema(), &batch, &options);
        assert!(matches!(result, Err(IngestionError::IncompatibleTypeChange { .. })));
    }

    #[test]
    fn invalid_rows() {
        let batch = BatchSchema::new(vec![
            BatchField::primitive("name", PrimitiveType::String),
            BatchField::primitive("age", PrimitiveType::Int),
        ]);
        let projection = ready(reconcile(&table_schema(), &batch, &Default::default()).unwrap());

        let result = projection.project_row(4, &[None, Some(Value::Int(1))]);
        assert_eq!(result, Err(IngestionError::NullInRequiredColumn { name: "name".into(), row: 4 }));

        let result = projection.project_row(5, &[
            Some(Value::String("Bob".into())), Some(Value::String("old".into()))
        ]);
        assert!(matches!(result, Err(IngestionError::InvalidValue { row: 5, .. })));

        let result = projection.project_row(6, &[Some(Value::String("Bob".into()))]);
        assert!(matches!(result, Err(IngestionError::InvalidValue { row: 6, .. })));
    }

    #[test]
    fn same_sources() {
        let batch = BatchSchema::new(vec![
            BatchField::primitive("name", PrimitiveType::String),
        ]);
        let before = ready(reconcile(&table_schema(), &batch, &Default::default()).unwrap());

        let evolved = Schema::new(4, vec![
            Field::new_primitive(1, "name", true, PrimitiveType::String),
            Field::new_primitive(3, "city", false, PrimitiveType::String),
            Field::new_primitive(4, "zip", false, PrimitiveType::String),
        ]);
        let after = ready(reconcile(&evolved, &batch, &Default::default()).unwrap());
        assert!(before.has_same_sources(&after));

        let renamed = Schema::new(5, vec![
            Field::new_primitive(1, "full_name", false, PrimitiveType::String),
            Field::new_primitive(6, "name", false, PrimitiveType::String),
        ]);
        let after = ready(reconcile(&renamed, &batch, &Default::default()).unwrap());
        assert!(!before.has_same_sources(&after));
    }
}
