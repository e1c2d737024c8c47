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

//! Structural checks a sub-request must pass before any of its instructions
//! are acted on. Skipped entirely for the admin caller.

use errors::ResolverError;
use request_value::keys;
use schema::DeclaredTable;
use serde_json::{Map, Value};

pub fn validate(table: &DeclaredTable, request: &Map<String, Value>) -> Result<(), ResolverError> {
    if matches!(request.get(keys::CREATE), Some(Value::Bool(true))) && matches!(request.get(keys::DELETE), Some(Value::Bool(true))) {
        return Err(ResolverError::bad_request("'create' and 'delete' cannot both be set"));
    }

    let is_create = matches!(request.get(keys::CREATE), Some(Value::Bool(true)));
    let is_delete = matches!(request.get(keys::DELETE), Some(Value::Bool(true)));

    for (field, value) in request.iter() {
        if keys::is_instruction(field) {
            continue;
        }
        if let Some(column) = table.column(field) {
            validate_primitive_constraint(field, value, &|v| column.col_type.accepts(v))?;
            if is_create && !value.is_null() {
                if value.is_array() {
                    return Err(ResolverError::bad_request(format!(
                        "'{}' cannot be an array while 'create' is set (multi-create is not allowed in a single sub-request)",
                        field
                    )));
                }
                if !column.col_type.accepts(value) {
                    return Err(ResolverError::bad_request(format!("'{}' does not match column type", field)));
                }
            }
        } else if table.is_object(field) || table.is_array(field) {
            if !value.is_null() && !value.is_object() {
                return Err(ResolverError::bad_request(format!(
                    "'{}' must be an object or null, not a primitive",
                    field
                )));
            }
            if let Some(nested) = value.as_object() {
                if table.is_object(field) && (nested.contains_key(keys::ADD) || nested.contains_key(keys::REMOVE)) {
                    return Err(ResolverError::bad_request(format!(
                        "'add'/'remove' are not valid inside object-reference field '{}'",
                        field
                    )));
                }
                if table.is_array(field) && (is_create || is_delete) && (nested.contains_key(keys::ADD) || nested.contains_key(keys::REMOVE)) {
                    return Err(ResolverError::bad_request(format!(
                        "'add'/'remove' cannot appear on array field '{}' while 'create' or 'delete' is set",
                        field
                    )));
                }
            }
        }
    }

    if let Some(set_value) = request.get(keys::SET) {
        if !set_value.is_null() {
            let set_obj = set_value.as_object().ok_or_else(|| ResolverError::bad_request("'set' must be an object"))?;
            for (field, value) in set_obj {
                if let Some(column) = table.column(field) {
                    if !value.is_null() && !column.col_type.accepts(value) {
                        return Err(ResolverError::bad_request(format!("'set.{}' does not match column type", field)));
                    }
                } else if !table.is_object(field) && !table.is_array(field) {
                    return Err(ResolverError::bad_request(format!("'set.{}' is not a field of '{}'", field, table.table_name)));
                }
            }
        }
    }

    Ok(())
}

/// A primitive constraint is `null`, a scalar, an array of scalars (OR), or
/// an object whose keys are operators with scalar leaves (AND).
fn validate_primitive_constraint(field: &str, value: &Value, accepts: &dyn Fn(&Value) -> bool) -> Result<(), ResolverError> {
    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            for item in items {
                if !accepts(item) {
                    return Err(ResolverError::bad_request(format!("'{}' has a value of the wrong type", field)));
                }
            }
            Ok(())
        }
        Value::Object(operators) => {
            for (operator, operand) in operators {
                if !request_value::OPERATORS.contains(&operator.as_str()) {
                    return Err(ResolverError::bad_request(format!("'{}' uses unknown operator '{}'", field, operator)));
                }
                if !accepts(operand) {
                    return Err(ResolverError::bad_request(format!("'{}.{}' has a value of the wrong type", field, operator)));
                }
            }
            Ok(())
        }
        scalar => {
            if accepts(scalar) {
                Ok(())
            } else {
                Err(ResolverError::bad_request(format!("'{}' has a value of the wrong type", field)))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use schema::{DeclaredField, TableName};
    use serde_json::json;
    use std::collections::BTreeMap;
    use types::{ColumnDesc, ColumnType};

    fn user_table() -> DeclaredTable {
        let mut fields = BTreeMap::new();
        fields.insert("age".to_owned(), DeclaredField::Column(ColumnDesc::new("age", ColumnType::Integer)));
        fields.insert("reservedId".to_owned(), DeclaredField::Column(ColumnDesc::reserved_id()));
        DeclaredTable {
            table_name: TableName::from("User"),
            fields,
            indexes: vec![],
        }
    }

    #[test]
    fn accepts_operator_object_with_matching_leaves() {
        let table = user_table();
        let request = json!({"age": {"gt": 18, "lt": 65}}).as_object().unwrap().clone();
        assert!(validate(&table, &request).is_ok());
    }

    #[test]
    fn rejects_unknown_operator() {
        let table = user_table();
        let request = json!({"age": {"bogus": 1}}).as_object().unwrap().clone();
        assert!(validate(&table, &request).is_err());
    }

    #[test]
    fn rejects_wrong_scalar_type() {
        let table = user_table();
        let request = json!({"age": "not a number"}).as_object().unwrap().clone();
        assert!(validate(&table, &request).is_err());
    }

    #[test]
    fn rejects_array_primitive_during_create() {
        let table = user_table();
        let request = json!({"create": true, "age": [1, 2]}).as_object().unwrap().clone();
        assert!(validate(&table, &request).is_err());
    }
}
