// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Lowers a declarative table description into the physical model the
//! Driver is asked to create: `fieldId` columns and cascading foreign keys
//! for object references, association tables for array references.

use errors::ResolverError;
use schema::{
    association_table_name, object_id_column, DeclaredField, DeclaredTable, ForeignKey, IndexDecl, IndexKind,
    PhysicalIndex, PhysicalTable, ReferentialAction, SchemaModel, TableName, FIELD_ID, OWNER_TABLE_ID,
    RESERVED_FIELD_NAMES,
};
use std::collections::BTreeMap;
use types::{parse_shorthand, ColumnDesc, ColumnType};

/// A column as the caller writes it down: either the `"type/length"`
/// shorthand or a fully spelled out descriptor.
#[derive(Debug, Clone)]
pub enum ColumnSpec {
    Shorthand(String),
    Full {
        col_type: ColumnType,
        length: Option<u64>,
        unsigned: bool,
        not_null: bool,
        default: Option<serde_json::Value>,
        auto_increment: bool,
    },
}

#[derive(Debug, Clone)]
pub enum RawField {
    Column(ColumnSpec),
    Object(String),
    Array(String),
}

/// A table exactly as declared by the caller, prior to any lowering.
#[derive(Debug, Clone, Default)]
pub struct RawTable {
    pub fields: BTreeMap<String, RawField>,
    /// `"col/unique/8"`-style index shorthands.
    pub indexes: Vec<String>,
    /// Field names the table-level `notNull` declaration key marks required.
    pub not_null: Vec<String>,
}

pub fn prepare(tables: BTreeMap<String, RawTable>) -> Result<SchemaModel, ResolverError> {
    let table_names: Vec<TableName> = tables.keys().map(TableName::from).collect();

    let mut declared = BTreeMap::new();
    for (name, raw) in &tables {
        declared.insert(name.clone(), declare_table(name, raw, &table_names)?);
    }

    let mut physical = BTreeMap::new();
    for table in declared.values() {
        materialize_columns(table, &mut physical)?;
    }
    for table in declared.values() {
        link_foreign_keys(table, &declared, &mut physical)?;
    }

    Ok(SchemaModel { declared, physical })
}

fn declare_table(name: &str, raw: &RawTable, table_names: &[TableName]) -> Result<DeclaredTable, ResolverError> {
    let mut fields = BTreeMap::new();
    for (field_name, raw_field) in &raw.fields {
        if RESERVED_FIELD_NAMES.contains(&field_name.as_str()) {
            return Err(ResolverError::bad_request(format!(
                "'{}' is a reserved instruction key and cannot be used as a field name on '{}'",
                field_name, name
            )));
        }
        if table_names.iter().any(|t| t.as_str() == field_name) {
            return Err(ResolverError::bad_request(format!(
                "field '{}' on '{}' collides with a declared table name",
                field_name, name
            )));
        }
        let field = match raw_field {
            RawField::Object(target) => DeclaredField::Object(TableName::from(target.clone())),
            RawField::Array(target) => DeclaredField::Array(TableName::from(target.clone())),
            RawField::Column(spec) => {
                let mut column = expand_column(field_name, spec)?;
                if raw.not_null.iter().any(|n| n == field_name) {
                    column.not_null = true;
                }
                if column.not_null && matches!(&column.default, Some(serde_json::Value::Null)) {
                    return Err(ResolverError::bad_request(format!(
                        "column '{}' on '{}' is notNull but defaults to null",
                        field_name, name
                    )));
                }
                DeclaredField::Column(column)
            }
        };
        fields.insert(field_name.clone(), field);
    }
    fields.insert("reservedId".to_owned(), DeclaredField::Column(ColumnDesc::reserved_id()));

    let indexes = raw
        .indexes
        .iter()
        .map(|shorthand| normalize_index(name, shorthand, &fields))
        .collect::<Result<Vec<_>, _>>()?;

    Ok(DeclaredTable {
        table_name: TableName::from(name),
        fields,
        indexes,
    })
}

fn expand_column(field_name: &str, spec: &ColumnSpec) -> Result<ColumnDesc, ResolverError> {
    match spec {
        ColumnSpec::Shorthand(shorthand) => {
            parse_shorthand(field_name, shorthand).map_err(|e| ResolverError::bad_request(e.to_string()))
        }
        ColumnSpec::Full {
            col_type,
            length,
            unsigned,
            not_null,
            default,
            auto_increment,
        } => Ok(ColumnDesc {
            name: field_name.to_owned(),
            col_type: *col_type,
            length: *length,
            unsigned: *unsigned,
            not_null: *not_null,
            default: default.clone(),
            auto_increment: *auto_increment,
        }),
    }
}

/// Disambiguates `"col/unique/8"`-style index shorthand by token kind: a
/// numeric token is a length, one of `unique|fulltext|spatial` is the index
/// type, anything else must name a primitive column of this table.
fn normalize_index(
    table: &str,
    shorthand: &str,
    fields: &BTreeMap<String, DeclaredField>,
) -> Result<IndexDecl, ResolverError> {
    let mut column: Option<String> = None;
    let mut kind: Option<IndexKind> = None;
    let mut length: Option<u64> = None;

    for token in shorthand.split('/') {
        if let Ok(parsed) = token.parse::<u64>() {
            if length.replace(parsed).is_some() {
                return Err(ResolverError::bad_request(format!(
                    "index '{}' on '{}' specifies length twice",
                    shorthand, table
                )));
            }
            continue;
        }
        if let Some(parsed) = match token {
            "unique" => Some(IndexKind::Unique),
            "fulltext" => Some(IndexKind::FullText),
            "spatial" => Some(IndexKind::Spatial),
            _ => None,
        } {
            if kind.replace(parsed).is_some() {
                return Err(ResolverError::bad_request(format!(
                    "index '{}' on '{}' specifies a type twice",
                    shorthand, table
                )));
            }
            continue;
        }
        match fields.get(token) {
            Some(DeclaredField::Column(_)) => {
                if column.replace(token.to_owned()).is_some() {
                    return Err(ResolverError::bad_request(format!(
                        "index '{}' on '{}' specifies a column twice",
                        shorthand, table
                    )));
                }
            }
            Some(DeclaredField::Object(_)) | Some(DeclaredField::Array(_)) => {
                return Err(ResolverError::bad_request(format!(
                    "index '{}' on '{}' targets reference field '{}', only primitive columns may be indexed",
                    shorthand, table, token
                )));
            }
            None => {
                return Err(ResolverError::bad_request(format!(
                    "index '{}' on '{}' mentions unknown column '{}'",
                    shorthand, table, token
                )));
            }
        }
    }

    let column = column.ok_or_else(|| {
        ResolverError::bad_request(format!("index '{}' on '{}' does not name a column", shorthand, table))
    })?;

    if let (Some(requested), Some(DeclaredField::Column(col))) = (length, fields.get(&column)) {
        if let Some(max_len) = col.length {
            if requested > max_len {
                return Err(ResolverError::bad_request(format!(
                    "index length {} on '{}'.'{}' exceeds column length {}",
                    requested, table, column, max_len
                )));
            }
        }
    }

    Ok(IndexDecl {
        column,
        kind: kind.unwrap_or(IndexKind::Plain),
        length,
    })
}

fn materialize_columns(table: &DeclaredTable, physical: &mut BTreeMap<String, PhysicalTable>) -> Result<(), ResolverError> {
    let mut columns = Vec::new();
    for (name, field) in &table.fields {
        match field {
            DeclaredField::Column(column) => columns.push(column.clone()),
            DeclaredField::Object(_) => columns.push(ColumnDesc::unsigned_integer(object_id_column(name))),
            DeclaredField::Array(_) => { /* association table handled below */ }
        }
    }

    physical.insert(
        table.table_name.as_str().to_owned(),
        PhysicalTable {
            name: table.table_name.clone(),
            columns,
            foreign_keys: Vec::new(),
            indexes: table
                .indexes
                .iter()
                .map(|index| PhysicalIndex {
                    name: format!("{}_{}_idx", table.table_name.as_str(), index.column),
                    columns: vec![index.column.clone()],
                    unique: index.kind == IndexKind::Unique,
                })
                .collect(),
            is_association: false,
        },
    );

    for (name, field) in &table.fields {
        if let DeclaredField::Array(_) = field {
            let assoc_name = association_table_name(name, &table.table_name);
            physical.insert(
                assoc_name.as_str().to_owned(),
                PhysicalTable {
                    name: assoc_name.clone(),
                    columns: vec![
                        ColumnDesc::reserved_id(),
                        ColumnDesc::unsigned_integer(OWNER_TABLE_ID),
                        ColumnDesc::unsigned_integer(FIELD_ID),
                    ],
                    foreign_keys: Vec::new(),
                    indexes: vec![PhysicalIndex {
                        name: format!("{}_unique_idx", assoc_name.as_str()),
                        columns: vec![FIELD_ID.to_owned(), OWNER_TABLE_ID.to_owned()],
                        unique: true,
                    }],
                    is_association: true,
                },
            );
        }
    }

    Ok(())
}

fn link_foreign_keys(
    table: &DeclaredTable,
    declared: &BTreeMap<String, DeclaredTable>,
    physical: &mut BTreeMap<String, PhysicalTable>,
) -> Result<(), ResolverError> {
    for (name, field) in &table.fields {
        match field {
            DeclaredField::Object(target) => {
                if !declared.contains_key(target.as_str()) {
                    return Err(ResolverError::bad_request(format!(
                        "'{}'.'{}' references unknown table '{}'",
                        table.table_name, name, target
                    )));
                }
                let fk = ForeignKey {
                    column: object_id_column(name),
                    references_table: target.clone(),
                    references_column: "reservedId".to_owned(),
                    on_delete: ReferentialAction::Cascade,
                };
                physical
                    .get_mut(table.table_name.as_str())
                    .expect("materialized in first pass")
                    .foreign_keys
                    .push(fk);
            }
            DeclaredField::Array(target) => {
                if !declared.contains_key(target.as_str()) {
                    return Err(ResolverError::bad_request(format!(
                        "'{}'.'{}' references unknown table '{}'",
                        table.table_name, name, target
                    )));
                }
                let assoc_name = association_table_name(name, &table.table_name);
                let assoc = physical.get_mut(assoc_name.as_str()).expect("materialized in first pass");
                assoc.foreign_keys.push(ForeignKey {
                    column: OWNER_TABLE_ID.to_owned(),
                    references_table: table.table_name.clone(),
                    references_column: "reservedId".to_owned(),
                    on_delete: ReferentialAction::Cascade,
                });
                assoc.foreign_keys.push(ForeignKey {
                    column: FIELD_ID.to_owned(),
                    references_table: target.clone(),
                    references_column: "reservedId".to_owned(),
                    on_delete: ReferentialAction::Cascade,
                });
            }
            DeclaredField::Column(_) => {}
        }
    }
    Ok(())
}
