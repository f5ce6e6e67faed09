//! Identity-preserving schema evolution.

use std::collections::{HashMap, HashSet};

use serde::{Serialize, Deserialize};

use crate::schema::{Schema, SchemaType, Field, widens_to};

/// An error rejecting a schema change set. No change of a rejected set is applied.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum SchemaError {
    /// A column with this name is already present in the schema.
    #[error("column '{name}' already exists in the schema")]
    DuplicateName { name: String },

    /// The change refers to a column that is not in the base schema.
    #[error("column '{name}' does not exist in the schema")]
    UnknownColumn { name: String },

    /// The new type of a column is not a widening of its current type.
    #[error("column '{name}' can't evolve from {from} to {to}: only widening is allowed")]
    IncompatibleTypeChange { name: String, from: String, to: String },

    /// Two changes of one change set touch the same column in conflicting ways.
    #[error("conflicting changes to column '{name}' in a single change set")]
    SchemaConflict { name: String },
}

/// A single change to the top-level columns of a schema.
///
/// Columns are referred to by name. Names are resolved against the base schema of
/// the change set, so a change set that renames `a` to `b` and updates the type of
/// `a` updates the renamed column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "kebab-case")]
pub enum SchemaChange {
    /// Appends a new optional column with fresh field ids.
    AddColumn {
        name: String,
        #[serde(rename = "type")]
        field_type: SchemaType,
        #[serde(skip_serializing_if = "Option::is_none")]
        doc: Option<String>,
    },
    /// Removes a column. Its id is retired and never assigned again.
    DropColumn { name: String },
    /// Renames a column, keeping its id.
    RenameColumn {
        name: String,
        #[serde(rename = "new-name")]
        new_name: String,
    },
    /// Widens the type of a column.
    UpdateColumnType {
        name: String,
        #[serde(rename = "type")]
        field_type: SchemaType,
    },
    /// Sets or clears the doc string of a column.
    UpdateColumnDoc { name: String, doc: Option<String> },
    /// Turns a required column into an optional one.
    MakeOptional { name: String },
}

#[derive(PartialEq, Eq, Hash, Clone, Copy)]
enum ChangeKind {
    Drop,
    Rename,
    Type,
    Doc,
    Optional,
}

fn describe(required: bool, r#type: &SchemaType) -> String {
    if required {
        format!("required {}", r#type)
    } else {
        format!("optional {}", r#type)
    }
}

impl SchemaChange {
    pub fn add_column(name: &str, field_type: SchemaType) -> Self {
        Self::AddColumn { name: name.to_string(), field_type: field_type, doc: None }
    }

    pub fn drop_column(name: &str) -> Self {
        Self::DropColumn { name: name.to_string() }
    }

    pub fn rename_column(name: &str, new_name: &str) -> Self {
        Self::RenameColumn { name: name.to_string(), new_name: new_name.to_string() }
    }

    pub fn update_column_type(name: &str, field_type: SchemaType) -> Self {
        Self::UpdateColumnType { name: name.to_string(), field_type: field_type }
    }

    pub fn update_column_doc(name: &str, doc: Option<&str>) -> Self {
        Self::UpdateColumnDoc { name: name.to_string(), doc: doc.map(String::from) }
    }

    pub fn make_optional(name: &str) -> Self {
        Self::MakeOptional { name: name.to_string() }
    }

    /// Returns the name of the column this change refers to.
    pub fn column_name(&self) -> &str {
        match self {
            Self::AddColumn { name, .. } |
            Self::DropColumn { name } |
            Self::RenameColumn { name, .. } |
            Self::UpdateColumnType { name, .. } |
            Self::UpdateColumnDoc { name, .. } |
            Self::MakeOptional { name } => name
        }
    }

    fn kind(&self) -> Option<ChangeKind> {
        match self {
            Self::AddColumn { .. } => None,
            Self::DropColumn { .. } => Some(ChangeKind::Drop),
            Self::RenameColumn { .. } => Some(ChangeKind::Rename),
            Self::UpdateColumnType { .. } => Some(ChangeKind::Type),
            Self::UpdateColumnDoc { .. } => Some(ChangeKind::Doc),
            Self::MakeOptional { .. } => Some(ChangeKind::Optional),
        }
    }

    /// Applies a change set to `base` as a single evolution step.
    ///
    /// New field ids are allocated after `last_column_id`, the table-wide counter of
    /// assigned ids. Returns the evolved schema, with a schema id one higher than
    /// `base`, and the new value of the counter.
    ///
    /// # Errors
    ///
    /// Fails without applying anything if any change in the set is invalid against
    /// `base`, or if two changes conflict.
    pub fn apply_all(
        base: &Schema,
        last_column_id: i32,
        changes: &[SchemaChange]
    ) -> Result<(Schema, i32), SchemaError> {
        // Resolve every name against the base schema once.
        let mut resolved: Vec<Option<i32>> = Vec::with_capacity(changes.len());
        for change in changes {
            match change {
                SchemaChange::AddColumn { .. } => resolved.push(None),
                other => {
                    let field = base.get_field_by_name(other.column_name())
                        .ok_or_else(|| SchemaError::UnknownColumn {
                            name: other.column_name().to_string()
                        })?;
                    resolved.push(Some(field.id()));
                }
            }
        }

        let mut seen: HashSet<(i32, ChangeKind)> = HashSet::new();
        let mut dropped: HashSet<i32> = HashSet::new();
        let mut modified: HashSet<i32> = HashSet::new();
        let mut renamed: HashSet<i32> = HashSet::new();
        let mut claimed_names: HashSet<&str> = HashSet::new();

        for (change, id) in changes.iter().zip(resolved.iter()) {
            let conflict = || SchemaError::SchemaConflict {
                name: change.column_name().to_string()
            };

            if let (Some(id), Some(kind)) = (id, change.kind()) {
                if !seen.insert((*id, kind)) {
                    return Err(conflict());
                }
                match kind {
                    ChangeKind::Drop => { dropped.insert(*id); },
                    ChangeKind::Rename => { renamed.insert(*id); modified.insert(*id); },
                    _ => { modified.insert(*id); },
                }
                if dropped.contains(id) && modified.contains(id) {
                    return Err(conflict());
                }
            }

            let claimed = match change {
                SchemaChange::AddColumn { name, .. } => Some(name.as_str()),
                SchemaChange::RenameColumn { new_name, .. } => Some(new_name.as_str()),
                _ => None,
            };
            if let Some(claimed) = claimed {
                if !claimed_names.insert(claimed) {
                    return Err(SchemaError::SchemaConflict { name: claimed.to_string() });
                }
            }
        }

        // A claimed name is free only if its current owner leaves it in this set.
        for name in claimed_names.iter() {
            if let Some(owner) = base.get_field_by_name(name) {
                if !dropped.contains(&owner.id()) && !renamed.contains(&owner.id()) {
                    return Err(SchemaError::DuplicateName { name: name.to_string() });
                }
            }
        }

        let mut last_column_id = last_column_id;
        let mut next_id = || {
            last_column_id += 1;
            last_column_id
        };

        let mut fields: Vec<Field> = base.fields().to_vec();
        let position = |fields: &Vec<Field>, id: i32| {
            fields.iter().position(|field| field.id() == id)
        };

        for (change, id) in changes.iter().zip(resolved.into_iter()) {
            // Ids were resolved against `base` and drops never mix with other
            // changes of the same id, so the lookup always succeeds.
            let index = id.and_then(|id| position(&fields, id));

            match (change, index) {
                (SchemaChange::AddColumn { name, field_type, doc }, _) => {
                    let field = Field {
                        id: 0,
                        name: name.clone(),
                        required: false,
                        r#type: field_type.clone(),
                        doc: doc.clone(),
                    };
                    fields.push(field.with_fresh_ids(&mut next_id));
                },
                (SchemaChange::DropColumn { .. }, Some(index)) => {
                    fields.remove(index);
                },
                (SchemaChange::RenameColumn { new_name, .. }, Some(index)) => {
                    fields[index].name = new_name.clone();
                },
                (SchemaChange::UpdateColumnType { name, field_type }, Some(index)) => {
                    let current = &fields[index];
                    if !widens_to(current.schema_type(), field_type) {
                        return Err(SchemaError::IncompatibleTypeChange {
                            name: name.clone(),
                            from: describe(current.required(), current.schema_type()),
                            to: describe(current.required(), field_type),
                        });
                    }
                    let r#type = field_type.clone()
                        .with_ids_from(current.schema_type(), &mut next_id);
                    fields[index].r#type = r#type;
                },
                (SchemaChange::UpdateColumnDoc { doc, .. }, Some(index)) => {
                    fields[index].doc = doc.clone();
                },
                (SchemaChange::MakeOptional { .. }, Some(index)) => {
                    fields[index].required = false;
                },
                (other, None) => {
                    return Err(SchemaError::UnknownColumn {
                        name: other.column_name().to_string()
                    });
                },
            }
        }

        Ok((Schema::new(base.id() + 1, fields), last_column_id))
    }

    /// Computes the change set that evolves `base` into `target`.
    ///
    /// Columns are matched by field id. Changes are listed in a canonical order:
    /// for each base column in order, its drop, rename, type update, doc update and
    /// relaxation to optional, followed by the added columns in target order.
    ///
    /// This can also be used to check whether `base` can legally evolve to `target`.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaError::IncompatibleTypeChange`] if a column narrows its type,
    /// becomes required, or is added as required.
    pub fn diff(base: &Schema, target: &Schema) -> Result<Vec<SchemaChange>, SchemaError> {
        let target_fields: HashMap<i32, &Field> = target.fields()
            .iter()
            .map(|field| (field.id(), field))
            .collect();

        let mut changes = Vec::new();

        for base_field in base.fields() {
            let Some(target_field) = target_fields.get(&base_field.id()) else {
                changes.push(SchemaChange::drop_column(base_field.name()));
                continue;
            };

            if base_field.name() != target_field.name() {
                changes.push(SchemaChange::rename_column(
                    base_field.name(), target_field.name()
                ));
            }

            if !base_field.required() && target_field.required() {
                return Err(SchemaError::IncompatibleTypeChange {
                    name: base_field.name().to_string(),
                    from: describe(false, base_field.schema_type()),
                    to: describe(true, target_field.schema_type()),
                });
            }

            if base_field.schema_type() != target_field.schema_type() {
                if !widens_to(base_field.schema_type(), target_field.schema_type()) {
                    return Err(SchemaError::IncompatibleTypeChange {
                        name: base_field.name().to_string(),
                        from: describe(base_field.required(), base_field.schema_type()),
                        to: describe(target_field.required(), target_field.schema_type()),
                    });
                }
                changes.push(SchemaChange::update_column_type(
                    base_field.name(), target_field.schema_type().clone()
                ));
            }

            if base_field.doc() != target_field.doc() {
                changes.push(SchemaChange::update_column_doc(
                    base_field.name(), target_field.doc()
                ));
            }

            if base_field.required() && !target_field.required() {
                changes.push(SchemaChange::make_optional(base_field.name()));
            }
        }

        for target_field in target.fields() {
            if base.get_field_by_id(target_field.id()).is_some() {
                continue;
            }
            if target_field.required() {
                return Err(SchemaError::IncompatibleTypeChange {
                    name: target_field.name().to_string(),
                    from: "nothing".to_string(),
                    to: describe(true, target_field.schema_type()),
                });
            }
            changes.push(SchemaChange::AddColumn {
                name: target_field.name().to_string(),
                field_type: target_field.schema_type().clone(),
                doc: target_field.doc.clone(),
            });
        }

        Ok(changes)
    }
}
