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

//! Splits a per-table request object into the buckets the Table Resolver
//! pipeline walks: primitive constraints, object/array sub-requests, the
//! projection list, and the small closed set of instruction keys.

use errors::ResolverError;
use schema::DeclaredTable;
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub mod keys {
    pub const GET: &str = "get";
    pub const SET: &str = "set";
    pub const CREATE: &str = "create";
    pub const DELETE: &str = "delete";
    pub const ADD: &str = "add";
    pub const REMOVE: &str = "remove";
    pub const LIMIT: &str = "limit";
    pub const OFFSET: &str = "offset";
    pub const ORDER: &str = "order";
    pub const REQUIRED: &str = "required";
    pub const PARENT: &str = "parent";

    pub const ALL: &[&str] = &[
        GET, SET, CREATE, DELETE, ADD, REMOVE, LIMIT, OFFSET, ORDER, REQUIRED, PARENT,
    ];

    pub fn is_instruction(key: &str) -> bool {
        ALL.contains(&key)
    }
}

/// Operator keys accepted inside a primitive constraint object, e.g.
/// `{ age: { gt: 18 } }`. Multiple operators in one object are AND-ed.
pub const OPERATORS: &[&str] = &["not", "like", "gt", "ge", "lt", "le", "<", ">", "<=", ">=", "~", "!"];

#[derive(Debug, Clone, PartialEq)]
pub struct OrderKey {
    pub column: String,
    pub descending: bool,
}

fn parse_order(value: &Value) -> Result<Vec<OrderKey>, ResolverError> {
    let items = value
        .as_array()
        .ok_or_else(|| ResolverError::bad_request("'order' must be an array of column names"))?;
    items
        .iter()
        .map(|item| {
            let raw = item
                .as_str()
                .ok_or_else(|| ResolverError::bad_request("'order' entries must be strings"))?;
            Ok(match raw.strip_prefix('-') {
                Some(column) => OrderKey {
                    column: column.to_owned(),
                    descending: true,
                },
                None => OrderKey {
                    column: raw.to_owned(),
                    descending: false,
                },
            })
        })
        .collect()
}

/// The closed instruction set a sub-request may carry, separated from its
/// field constraints.
#[derive(Debug, Clone, Default)]
pub struct Instructions {
    pub create: bool,
    pub delete: bool,
    pub set: Option<Map<String, Value>>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
    pub order: Vec<OrderKey>,
    pub required: bool,
}

/// The classified shape of one table-scoped (sub-)request.
#[derive(Debug, Clone, Default)]
pub struct ClassifiedRequest {
    pub primitives: BTreeMap<String, Value>,
    pub objects: BTreeMap<String, Value>,
    pub arrays: BTreeMap<String, Value>,
    pub search: Vec<String>,
    pub instructions: Instructions,
}

/// Is this request value "empty" in the sense the classifier cares about?
/// Only `null`/absent count — not falsy values like `0` or `false`
/// (resolved towards the evident `&&` intent rather than a literal reading).
pub fn is_present(value: Option<&Value>) -> bool {
    matches!(value, Some(v) if !v.is_null())
}

pub fn classify(table: &DeclaredTable, request: &Map<String, Value>) -> Result<ClassifiedRequest, ResolverError> {
    let mut classified = ClassifiedRequest::default();

    classified.instructions.create = matches!(request.get(keys::CREATE), Some(Value::Bool(true)));
    classified.instructions.delete = matches!(request.get(keys::DELETE), Some(Value::Bool(true)));
    classified.instructions.required = matches!(request.get(keys::REQUIRED), Some(Value::Bool(true)));
    if classified.instructions.create && classified.instructions.delete {
        return Err(ResolverError::bad_request("'create' and 'delete' cannot both be set"));
    }

    if let Some(set_value) = request.get(keys::SET) {
        if is_present(Some(set_value)) {
            let set_obj = set_value
                .as_object()
                .ok_or_else(|| ResolverError::bad_request("'set' must be an object"))?;
            classified.instructions.set = Some(set_obj.clone());
        }
    }

    if let Some(limit) = request.get(keys::LIMIT) {
        classified.instructions.limit =
            Some(limit.as_i64().ok_or_else(|| ResolverError::bad_request("'limit' must be an integer"))?);
    }
    if let Some(offset) = request.get(keys::OFFSET) {
        classified.instructions.offset =
            Some(offset.as_i64().ok_or_else(|| ResolverError::bad_request("'offset' must be an integer"))?);
    }
    if let Some(order) = request.get(keys::ORDER) {
        classified.instructions.order = parse_order(order)?;
    }

    for (field, value) in request.iter() {
        if keys::is_instruction(field) {
            continue;
        }
        if table.is_object(field) {
            classified.objects.insert(field.clone(), value.clone());
        } else if table.is_array(field) {
            classified.arrays.insert(field.clone(), value.clone());
        } else if table.column(field).is_some() {
            classified.primitives.insert(field.clone(), value.clone());
        } else {
            return Err(ResolverError::bad_request(format!(
                "'{}' is not a field of '{}'",
                field, table.table_name
            )));
        }
    }

    classified.search = expand_search(table, request, &mut classified.objects, &mut classified.arrays)?;

    // A `get: "*"` wildcard (including the one `resolve_table` forces onto a
    // `delete`) just means "every column" — it was never a collision with an
    // explicit constraint on any one of them. Only an explicitly enumerated
    // `get` array double-specifying a field is rejected.
    let wildcard_get = matches!(request.get(keys::GET), Some(Value::String(star)) if star == "*");
    if !wildcard_get {
        for column in &classified.search {
            if classified.primitives.contains_key(column) {
                return Err(ResolverError::bad_request(format!(
                    "'{}' cannot appear in both 'get' and as a constraint",
                    column
                )));
            }
        }
    }

    Ok(classified)
}

fn expand_search(
    table: &DeclaredTable,
    request: &Map<String, Value>,
    objects: &mut BTreeMap<String, Value>,
    arrays: &mut BTreeMap<String, Value>,
) -> Result<Vec<String>, ResolverError> {
    let get = match request.get(keys::GET) {
        Some(value) => value,
        None => return Ok(Vec::new()),
    };

    let mentioned: Vec<String> = match get {
        Value::String(star) if star == "*" => table.primitive_names(),
        Value::Array(items) => items
            .iter()
            .map(|item| {
                item.as_str()
                    .map(str::to_owned)
                    .ok_or_else(|| ResolverError::bad_request("'get' entries must be strings"))
            })
            .collect::<Result<_, _>>()?,
        _ => return Err(ResolverError::bad_request("'get' must be '*' or an array of field names")),
    };

    let mut search = Vec::new();
    for field in mentioned {
        if table.is_object(&field) {
            if request.contains_key(&field) {
                return Err(ResolverError::bad_request(format!(
                    "'{}' cannot appear in both 'get' and as a constraint",
                    field
                )));
            }
            objects.entry(field).or_insert_with(|| serde_json::json!({"get": "*"}));
        } else if table.is_array(&field) {
            if request.contains_key(&field) {
                return Err(ResolverError::bad_request(format!(
                    "'{}' cannot appear in both 'get' and as a constraint",
                    field
                )));
            }
            arrays.entry(field).or_insert_with(|| serde_json::json!({"get": "*"}));
        } else if table.column(&field).is_some() {
            search.push(field);
        } else {
            return Err(ResolverError::bad_request(format!(
                "'get' mentions unknown field '{}' on '{}'",
                field, table.table_name
            )));
        }
    }
    Ok(search)
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::{DeclaredField, TableName};
    use serde_json::json;
    use std::collections::BTreeMap;
    use types::ColumnDesc;

    fn user_table() -> DeclaredTable {
        let mut fields = BTreeMap::new();
        fields.insert("email".to_owned(), DeclaredField::Column(ColumnDesc::new("email", types::ColumnType::Varchar)));
        fields.insert("reservedId".to_owned(), DeclaredField::Column(ColumnDesc::reserved_id()));
        fields.insert("contacts".to_owned(), DeclaredField::Array(TableName::from("User")));
        fields.insert("bestFriend".to_owned(), DeclaredField::Object(TableName::from("User")));
        DeclaredTable {
            table_name: TableName::from("User"),
            fields,
            indexes: vec![],
        }
    }

    #[test]
    fn splits_primitives_objects_and_arrays() {
        let table = user_table();
        let request: Map<String, Value> = json!({
            "email": "u1@x",
            "bestFriend": {"email": "u2@x"},
            "contacts": {"get": "*"}
        })
        .as_object()
        .unwrap()
        .clone();
        let classified = classify(&table, &request).unwrap();
        assert!(classified.primitives.contains_key("email"));
        assert!(classified.objects.contains_key("bestFriend"));
        assert!(classified.arrays.contains_key("contacts"));
    }

    #[test]
    fn star_get_expands_to_primitive_columns() {
        let table = user_table();
        let request: Map<String, Value> = json!({"get": "*"}).as_object().unwrap().clone();
        let classified = classify(&table, &request).unwrap();
        assert!(classified.search.contains(&"email".to_owned()));
        assert!(classified.search.contains(&"reservedId".to_owned()));
    }

    #[test]
    fn get_mentioning_a_reference_field_promotes_it_to_a_sub_request() {
        let table = user_table();
        let request: Map<String, Value> = json!({"get": ["email", "contacts"]}).as_object().unwrap().clone();
        let classified = classify(&table, &request).unwrap();
        assert!(classified.search.contains(&"email".to_owned()));
        assert!(classified.arrays.contains_key("contacts"));
    }

    #[test]
    fn rejects_column_in_both_get_and_constraint() {
        let table = user_table();
        let request: Map<String, Value> = json!({"get": ["email"], "email": "u1@x"}).as_object().unwrap().clone();
        assert!(classify(&table, &request).is_err());
    }

    #[test]
    fn rejects_a_reference_field_in_both_get_and_as_a_constraint() {
        let table = user_table();
        let request: Map<String, Value> = json!({"get": ["contacts"], "contacts": {"get": "*"}}).as_object().unwrap().clone();
        assert!(classify(&table, &request).is_err());

        let request: Map<String, Value> = json!({"get": ["bestFriend"], "bestFriend": {"email": "u2@x"}}).as_object().unwrap().clone();
        assert!(classify(&table, &request).is_err());
    }

    #[test]
    fn wildcard_get_does_not_collide_with_a_primitive_constraint() {
        let table = user_table();
        let request: Map<String, Value> = json!({"get": "*", "reservedId": 1}).as_object().unwrap().clone();
        let classified = classify(&table, &request).unwrap();
        assert!(classified.search.contains(&"reservedId".to_owned()));
        assert_eq!(classified.primitives.get("reservedId"), Some(&json!(1)));
    }

    #[test]
    fn rejects_create_and_delete_together() {
        let table = user_table();
        let request: Map<String, Value> = json!({"create": true, "delete": true}).as_object().unwrap().clone();
        assert!(classify(&table, &request).is_err());
    }
}
