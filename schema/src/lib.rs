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

//! Declared and physical table models. The declared model is what a caller
//! writes down; the physical model is what the [Schema Preparer][1] lowers
//! it to and what the Driver sees.
//!
//! [1]: ../schema_preparer/index.html

use std::collections::BTreeMap;
use std::fmt::{self, Display, Formatter};
use types::ColumnDesc;

pub const RESERVED_ID: &str = "reservedId";
pub const OWNER_TABLE_ID: &str = "ownerTableId";
pub const FIELD_ID: &str = "fieldId";

/// Reserved instruction keys that may never name a declared field.
pub const RESERVED_FIELD_NAMES: &[&str] = &[
    "reservedId",
    "set",
    "get",
    "create",
    "delete",
    "add",
    "remove",
    "not",
    "like",
    "or",
    "limit",
    "offset",
    "order",
    "tableName",
    "foreignKeys",
    "parent",
    "required",
    "created",
    "deleted",
    "edited",
    "type",
    "reserved",
];

/// Reserved declaration keys, distinct from the instruction keys above.
pub const RESERVED_DECLARATION_KEYS: &[&str] = &["index", "notNull", "tableName"];

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TableName(String);

impl TableName {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl<S: Into<String>> From<S> for TableName {
    fn from(name: S) -> TableName {
        TableName(name.into())
    }
}

impl Display for TableName {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// The physical column name a `field+OwnerTable` association table is given.
pub fn association_table_name(field: &str, owner_table: &TableName) -> TableName {
    TableName(format!("{}{}", field, owner_table.as_str()))
}

/// The physical column an object reference `field: T` lowers to.
pub fn object_id_column(field: &str) -> String {
    format!("{}Id", field)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexKind {
    Plain,
    Unique,
    FullText,
    Spatial,
}

#[derive(Debug, Clone, PartialEq)]
pub struct IndexDecl {
    pub column: String,
    pub kind: IndexKind,
    pub length: Option<u64>,
}

/// A field of a declared table, before lowering to physical columns.
#[derive(Debug, Clone, PartialEq)]
pub enum DeclaredField {
    Column(ColumnDesc),
    Object(TableName),
    Array(TableName),
}

/// A table as the caller wrote it down, after shorthand expansion.
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredTable {
    pub table_name: TableName,
    pub fields: BTreeMap<String, DeclaredField>,
    pub indexes: Vec<IndexDecl>,
}

impl DeclaredTable {
    pub fn column(&self, name: &str) -> Option<&ColumnDesc> {
        match self.fields.get(name) {
            Some(DeclaredField::Column(column)) => Some(column),
            _ => None,
        }
    }

    pub fn is_object(&self, name: &str) -> bool {
        matches!(self.fields.get(name), Some(DeclaredField::Object(_)))
    }

    pub fn is_array(&self, name: &str) -> bool {
        matches!(self.fields.get(name), Some(DeclaredField::Array(_)))
    }

    pub fn object_target(&self, name: &str) -> Option<&TableName> {
        match self.fields.get(name) {
            Some(DeclaredField::Object(target)) => Some(target),
            _ => None,
        }
    }

    pub fn array_target(&self, name: &str) -> Option<&TableName> {
        match self.fields.get(name) {
            Some(DeclaredField::Array(target)) => Some(target),
            _ => None,
        }
    }

    pub fn primitive_names(&self) -> Vec<String> {
        self.fields
            .iter()
            .filter_map(|(name, field)| match field {
                DeclaredField::Column(_) => Some(name.clone()),
                _ => None,
            })
            .collect()
    }
}

/// What happens to a dependent row when the row it references is removed.
/// Every foreign key this system emits is `Cascade` (§3's invariant that
/// both object- and array-reference foreign keys cascade on delete); the
/// variants below exist so the cascade walk has something to match on
/// rather than assuming cascade everywhere by convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReferentialAction {
    Cascade,
    SetNull,
    Restrict,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ForeignKey {
    pub column: String,
    pub references_table: TableName,
    pub references_column: String,
    pub on_delete: ReferentialAction,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalIndex {
    pub name: String,
    pub columns: Vec<String>,
    pub unique: bool,
}

/// The physical shape the Driver is asked to create: primitives, `fieldId`
/// columns for object references, and association tables for arrays all
/// become `PhysicalTable`s with the same column vocabulary.
#[derive(Debug, Clone, PartialEq)]
pub struct PhysicalTable {
    pub name: TableName,
    pub columns: Vec<ColumnDesc>,
    pub foreign_keys: Vec<ForeignKey>,
    pub indexes: Vec<PhysicalIndex>,
    pub is_association: bool,
}

impl PhysicalTable {
    pub fn has_column(&self, name: &str) -> bool {
        self.columns.iter().any(|column| column.name == name)
    }
}

/// The output of the Schema Preparer: the post-processed declared tables
/// plus the physical model derived from them, both keyed by table name.
#[derive(Debug, Clone, Default)]
pub struct SchemaModel {
    pub declared: BTreeMap<String, DeclaredTable>,
    pub physical: BTreeMap<String, PhysicalTable>,
}

impl SchemaModel {
    pub fn declared_table(&self, name: &str) -> Option<&DeclaredTable> {
        self.declared.get(name)
    }

    pub fn physical_table(&self, name: &str) -> Option<&PhysicalTable> {
        self.physical.get(name)
    }
}
