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

//! The per-table pipeline: format, validate, resolve foreign objects,
//! get/create, resolve join children, delete, update, update associations,
//! access control. [`resolve_table`] is the single recursive entry point a
//! nested object/array sub-request re-enters through.

mod validate;

use async_mutex::Mutex as AsyncMutex;
use driver::{CreateQuery, DeleteQuery, Driver, GetQuery, Operator, OrderBy, OrderDirection, Row, UpdateQuery, Where};
use errors::ResolverError;
use plugin::{PluginContext, PluginDispatcher};
use request_cache::RequestCache;
use rule_engine::{evaluate, EvalContext, Scope, TableRules};
use schema::{
    association_table_name, object_id_column, DeclaredTable, IndexKind, ReferentialAction, SchemaModel, FIELD_ID,
    OWNER_TABLE_ID, RESERVED_ID,
};
use serde_json::{Map, Value};
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// Everything shared and immutable across a whole request: the prepared
/// schema, the per-table access rules, the leased driver connection, and
/// the plugin dispatcher.
pub struct TableEnv {
    pub schema: Arc<SchemaModel>,
    pub rules: Arc<BTreeMap<String, TableRules>>,
    pub driver: Arc<dyn Driver>,
    pub plugins: Arc<PluginDispatcher>,
}

impl TableEnv {
    fn rules_for(&self, table: &str) -> TableRules {
        self.rules.get(table).cloned().unwrap_or_else(TableRules::open)
    }
}

/// Who is asking, and under what mode.
#[derive(Debug, Clone)]
pub struct RequestAuth {
    pub auth_id: Value,
    pub is_admin: bool,
    pub read_only: bool,
}

fn reserved_id_of(row: &Value) -> Option<i64> {
    row.get(RESERVED_ID).and_then(Value::as_i64)
}

fn ids_as_json(ids: &[i64]) -> Vec<Value> {
    ids.iter().map(|id| Value::from(*id)).collect()
}

fn push_operator(filter: &mut Where, column: impl Into<String>, operator: Operator) {
    filter.conditions.entry(column.into()).or_default().push(operator);
}

fn apply_constraint(filter: &mut Where, column: &str, value: &Value) {
    match value {
        Value::Null => {}
        Value::Array(items) => push_operator(filter, column, Operator::OneOf(items.clone())),
        Value::Object(operators) => {
            for (operator, operand) in operators {
                let op = match operator.as_str() {
                    "not" | "!" => Operator::Not(operand.clone()),
                    "like" | "~" => Operator::Like(operand.as_str().unwrap_or_default().to_owned()),
                    "gt" | ">" => Operator::Gt(operand.clone()),
                    "ge" | ">=" => Operator::Ge(operand.clone()),
                    "lt" | "<" => Operator::Lt(operand.clone()),
                    "le" | "<=" => Operator::Le(operand.clone()),
                    _ => continue,
                };
                push_operator(filter, column, op);
            }
        }
        scalar => push_operator(filter, column, Operator::Equal(scalar.clone())),
    }
}

/// `delete` forces a full projection so the caller sees what was removed.
fn format_request(request: &mut Value) {
    if matches!(request.get(request_value::keys::DELETE), Some(Value::Bool(true))) {
        if let Some(obj) = request.as_object_mut() {
            obj.insert(request_value::keys::GET.to_owned(), Value::String("*".to_owned()));
        }
    }
}

/// Is this array/object sub-request purely a projection (`{get: ...}`),
/// with no constraint that could make the join fail?
fn is_projection_only(value: &Value) -> bool {
    match value.as_object() {
        Some(obj) => obj.keys().all(|k| k == request_value::keys::GET || k == request_value::keys::REQUIRED),
        None => value.is_null(),
    }
}

/// Does this array sub-request carry only `add`/`remove`, with no query of
/// its own? If so the join itself never needs to run.
fn should_skip_array_query(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Object(obj) => !obj.is_empty() && obj.keys().all(|k| k == request_value::keys::ADD || k == request_value::keys::REMOVE),
        _ => false,
    }
}

fn sub_request_required(value: &Value) -> bool {
    matches!(value.get(request_value::keys::REQUIRED), Some(Value::Bool(true)))
}

fn scope_for(row: &Value, request: &Value, parent: &Option<Scope>) -> Scope {
    match parent {
        Some(p) => p.child(Arc::new(row.clone()), Arc::new(request.clone())),
        None => Scope::root(Arc::new(row.clone()), Arc::new(request.clone())),
    }
}

fn eval_ctx(auth: &RequestAuth, scope: Scope) -> EvalContext {
    EvalContext {
        auth_id: auth.auth_id.clone(),
        is_admin: auth.is_admin,
        scope,
        request_flag: false,
    }
}

/// Recursively resolves one table-scoped sub-request through the full
/// pipeline, returning the (possibly empty) list of resulting row objects.
pub fn resolve_table<'a>(
    env: &'a TableEnv,
    auth: &'a RequestAuth,
    cache: &'a AsyncMutex<RequestCache>,
    plugin_ctx: &'a PluginContext,
    table_name: &'a str,
    mut request: Value,
    parent_scope: Option<Scope>,
) -> BoxFuture<'a, Result<Vec<Value>, ResolverError>> {
    Box::pin(async move {
        let table = env
            .schema
            .declared_table(table_name)
            .ok_or_else(|| ResolverError::bad_request(format!("unknown table '{}'", table_name)))?;
        let rules = env.rules_for(table_name);

        format_request(&mut request);
        env.plugins.on_request(table_name, &mut request, plugin_ctx).await?;

        let request_map = request
            .as_object()
            .cloned()
            .ok_or_else(|| ResolverError::bad_request("a sub-request must be an object"))?;

        if !auth.is_admin {
            validate::validate(table, &request_map)?;
        }

        let classified = request_value::classify(table, &request_map)?;
        let required = classified.instructions.required;

        if auth.read_only && (classified.instructions.create || classified.instructions.delete) {
            return Err(ResolverError::forbidden("create/delete are not allowed on a read-only connection"));
        }

        let body = resolve_body(env, auth, cache, plugin_ctx, table, &rules, &request, &classified, &parent_scope).await;

        match body {
            Err(e) if e.is_not_found() && !required => Ok(Vec::new()),
            Err(e) if e.code() == "WRONG_VALUE" => Err(e.into_access_denied()),
            other => other,
        }
    })
}

async fn resolve_body<'a>(
    env: &'a TableEnv,
    auth: &'a RequestAuth,
    cache: &'a AsyncMutex<RequestCache>,
    plugin_ctx: &'a PluginContext,
    table: &'a DeclaredTable,
    rules: &TableRules,
    request: &Value,
    classified: &request_value::ClassifiedRequest,
    parent_scope: &Option<Scope>,
) -> Result<Vec<Value>, ResolverError> {
    let own_scope = scope_for(request, request, parent_scope);

    // Resolve object references before the row is known.
    let mut resolved_objects: BTreeMap<String, Value> = BTreeMap::new();
    for (field, sub_request) in &classified.objects {
        let target = table.object_target(field).expect("classified as object").as_str();
        let matches = resolve_table(env, auth, cache, plugin_ctx, target, sub_request.clone(), Some(own_scope.clone())).await?;
        match matches.len() {
            0 => {
                if !is_projection_only(sub_request) {
                    return Err(ResolverError::not_found(target));
                }
            }
            1 => {
                resolved_objects.insert(field.clone(), matches.into_iter().next().expect("length checked"));
            }
            _ => return Err(ResolverError::not_unique(target)),
        }
    }

    let mut results: Vec<Value> = if classified.instructions.create {
        vec![create_row(env, auth, cache, plugin_ctx, table, rules, classified, &resolved_objects, &own_scope).await?]
    } else {
        get_rows(env, cache, table, classified, &resolved_objects).await?
    };

    // Resolve array join children now that the row(s) exist.
    resolve_array_children(env, auth, cache, plugin_ctx, table, classified, &mut results, request, parent_scope).await?;

    let mut processing_value = Value::Array(results.clone());
    env.plugins.on_processing(table.table_name.as_str(), &mut processing_value, plugin_ctx).await?;
    if let Some(items) = processing_value.as_array() {
        results = items.clone();
    }

    // Delete path; access control runs before the mutation.
    if classified.instructions.delete {
        if !auth.is_admin {
            for row in &results {
                let scope = scope_for(row, request, parent_scope);
                evaluate(&rules.delete, &eval_ctx(auth, scope)).map_err(|_| ResolverError::unauthorized("delete denied"))?;
            }
        }
        let ids: Vec<i64> = results.iter().filter_map(reserved_id_of).collect();
        if !ids.is_empty() {
            env.driver
                .delete(DeleteQuery {
                    table: table.table_name.clone(),
                    filter: Where::new().one_of(RESERVED_ID, ids_as_json(&ids)),
                })
                .await?;
            let mut visited = BTreeMap::new();
            cascade_delete(env, table.table_name.as_str().to_owned(), ids.clone(), &mut visited).await?;
        }
        for row in &mut results {
            if let Some(obj) = row.as_object_mut() {
                obj.insert("deleted".to_owned(), Value::Bool(true));
            }
        }
        for id in &ids {
            cache.lock().await.uncache(&table.table_name, *id);
        }
        env.plugins.on_deletion(table.table_name.as_str(), &Value::Array(results.clone()), plugin_ctx).await?;
        return Ok(results);
    }

    // Apply 'set'.
    if let Some(set_obj) = &classified.instructions.set {
        apply_set(env, auth, cache, plugin_ctx, table, rules, set_obj, &mut results, &own_scope, request, parent_scope).await?;
    }

    // Apply association add/remove.
    apply_array_instructions(env, auth, cache, plugin_ctx, table, rules, classified, &mut results, &own_scope, request, parent_scope).await?;

    let mut result_value = Value::Array(results.clone());
    env.plugins.on_result(table.table_name.as_str(), &mut result_value, plugin_ctx).await?;
    if let Some(items) = result_value.as_array() {
        results = items.clone();
    }

    // Access control on the way out (non-delete paths).
    apply_read_access_control(auth, rules, request, parent_scope, &classified.instructions, &mut results)?;

    Ok(results)
}

async fn check_unique_constraints(env: &TableEnv, table: &DeclaredTable, row: &Row) -> Result<(), ResolverError> {
    for index in &table.indexes {
        if index.kind != IndexKind::Unique {
            continue;
        }
        let value = match row.get(&index.column) {
            Some(value) if !value.is_null() => value.clone(),
            _ => continue,
        };
        let existing = env
            .driver
            .get(GetQuery {
                table: table.table_name.clone(),
                search: vec![RESERVED_ID.to_owned()],
                filter: Where::new().equal(index.column.as_str(), value),
                offset: None,
                limit: Some(1),
                order: vec![],
            })
            .await?;
        if !existing.is_empty() {
            return Err(ResolverError::conflict(format!("'{}' must be unique on '{}'", index.column, table.table_name)));
        }
    }
    Ok(())
}

async fn create_row<'a>(
    env: &'a TableEnv,
    auth: &'a RequestAuth,
    cache: &'a AsyncMutex<RequestCache>,
    plugin_ctx: &'a PluginContext,
    table: &'a DeclaredTable,
    rules: &TableRules,
    classified: &request_value::ClassifiedRequest,
    resolved_objects: &BTreeMap<String, Value>,
    own_scope: &Scope,
) -> Result<Value, ResolverError> {
    // Array targets are resolved before the create rule runs so that
    // `member`/`count` rules over an array field see the real rows instead
    // of the raw sub-request.
    let mut resolved_arrays: BTreeMap<String, Vec<Value>> = BTreeMap::new();
    for (field, sub_request) in &classified.arrays {
        if should_skip_array_query(sub_request) {
            continue;
        }
        let target = table.array_target(field).expect("classified as array").as_str();
        let children = resolve_table(env, auth, cache, plugin_ctx, target, sub_request.clone(), Some(own_scope.clone())).await?;
        resolved_arrays.insert(field.clone(), children);
    }

    let create_access_scope = {
        let mut preview = own_scope.object.as_ref().clone();
        if let Some(obj) = preview.as_object_mut() {
            for (field, resolved) in resolved_objects {
                obj.insert(field.clone(), resolved.clone());
            }
            for (field, children) in &resolved_arrays {
                obj.insert(field.clone(), Value::Array(children.clone()));
            }
        }
        Scope {
            object: Arc::new(preview),
            request: own_scope.request.clone(),
            parent: own_scope.parent.clone(),
        }
    };

    if !auth.is_admin {
        evaluate(&rules.create, &eval_ctx(auth, create_access_scope.clone())).map_err(|_| ResolverError::unauthorized("create denied"))?;
    }

    let mut row: Row = Map::new();
    for (column, value) in &classified.primitives {
        if !auth.is_admin {
            if let Some(field_rule) = rules.field_write(column) {
                evaluate(field_rule, &eval_ctx(auth, create_access_scope.clone())).map_err(|_| ResolverError::not_settable(column.clone()))?;
            }
        }
        if !value.is_null() {
            row.insert(column.clone(), value.clone());
        }
    }
    for (field, resolved) in resolved_objects {
        row.insert(object_id_column(field), resolved.get(RESERVED_ID).cloned().unwrap_or(Value::Null));
    }

    check_unique_constraints(env, table, &row).await?;

    let ids = env
        .driver
        .create(CreateQuery {
            table: table.table_name.clone(),
            elements: vec![row.clone()],
        })
        .await?;
    let new_id = *ids.first().ok_or_else(|| ResolverError::database_error("create returned no id"))?;
    row.insert(RESERVED_ID.to_owned(), Value::from(new_id));

    for (field, children) in &resolved_arrays {
        insert_associations(env, field, table, new_id, children).await?;
    }

    row.insert("created".to_owned(), Value::Bool(true));
    cache.lock().await.add_cache(&table.table_name, new_id, &row);
    let created_value = Value::Object(row);
    env.plugins.on_creation(table.table_name.as_str(), &created_value, plugin_ctx).await?;
    Ok(created_value)
}

/// A request resolves to a known, singular row when `reservedId` is the
/// only primitive constraint given as a bare scalar — anything else (a
/// list of ids, another column, an operator object) means the driver still
/// has to do the matching.
fn known_single_id(classified: &request_value::ClassifiedRequest) -> Option<i64> {
    if classified.primitives.len() != 1 {
        return None;
    }
    classified.primitives.get(RESERVED_ID).and_then(Value::as_i64)
}

async fn get_rows(
    env: &TableEnv,
    cache: &AsyncMutex<RequestCache>,
    table: &DeclaredTable,
    classified: &request_value::ClassifiedRequest,
    resolved_objects: &BTreeMap<String, Value>,
) -> Result<Vec<Value>, ResolverError> {
    let mut search = classified.search.clone();
    search.push(RESERVED_ID.to_owned());
    for field in classified.objects.keys() {
        search.push(object_id_column(field));
    }
    if let Some(set_obj) = &classified.instructions.set {
        search.extend(set_obj.keys().filter(|k| table.column(k).is_some()).cloned());
    }
    search.sort();
    search.dedup();

    if resolved_objects.is_empty() {
        if let Some(id) = known_single_id(classified) {
            if let Some(cached) = cache.lock().await.read_cache(&table.table_name, id, &search) {
                return Ok(vec![Value::Object(cached)]);
            }
        }
    }

    let mut filter = Where::new();
    for (column, value) in &classified.primitives {
        if let Value::Array(items) = value {
            if items.is_empty() {
                return Ok(Vec::new());
            }
        }
        apply_constraint(&mut filter, column, value);
    }
    for (field, resolved) in resolved_objects {
        push_operator(
            &mut filter,
            object_id_column(field),
            Operator::Equal(resolved.get(RESERVED_ID).cloned().unwrap_or(Value::Null)),
        );
    }

    let order = classified
        .instructions
        .order
        .iter()
        .map(|o| OrderBy {
            column: o.column.clone(),
            direction: if o.descending { OrderDirection::Descending } else { OrderDirection::Ascending },
        })
        .collect();

    let rows = env
        .driver
        .get(GetQuery {
            table: table.table_name.clone(),
            search,
            filter,
            offset: classified.instructions.offset,
            limit: classified.instructions.limit,
            order,
        })
        .await?;

    let mut results = Vec::with_capacity(rows.len());
    for row in rows {
        if let Some(id) = row.get(RESERVED_ID).and_then(Value::as_i64) {
            cache.lock().await.add_cache(&table.table_name, id, &row);
        }
        let mut value = Value::Object(row);
        for (field, resolved) in resolved_objects {
            if classified.objects.get(field).is_some() {
                value[field.as_str()] = resolved.clone();
            }
        }
        results.push(value);
    }
    Ok(results)
}

async fn resolve_array_children<'a>(
    env: &'a TableEnv,
    auth: &'a RequestAuth,
    cache: &'a AsyncMutex<RequestCache>,
    plugin_ctx: &'a PluginContext,
    table: &'a DeclaredTable,
    classified: &request_value::ClassifiedRequest,
    results: &mut Vec<Value>,
    request: &Value,
    parent_scope: &Option<Scope>,
) -> Result<(), ResolverError> {
    for (field, sub_request) in &classified.arrays {
        if should_skip_array_query(sub_request) || results.is_empty() {
            continue;
        }
        let target = table.array_target(field).expect("classified as array").as_str();
        let owner_ids: Vec<i64> = results.iter().filter_map(reserved_id_of).collect();
        let by_owner = association_children(env, field, table, &owner_ids).await?;

        let mut drop_indices = Vec::new();
        for (index, row) in results.iter_mut().enumerate() {
            let owner_id = match reserved_id_of(row) {
                Some(id) => id,
                None => continue,
            };
            let child_ids = by_owner.get(&owner_id).cloned().unwrap_or_default();
            let mut nested = sub_request.clone();
            if let Some(obj) = nested.as_object_mut() {
                obj.insert(RESERVED_ID.to_owned(), Value::Array(ids_as_json(&child_ids)));
            }
            let scope = scope_for(row, request, parent_scope);
            let children = resolve_table(env, auth, cache, plugin_ctx, target, nested, Some(scope)).await?;
            if children.is_empty() && sub_request_required(sub_request) {
                drop_indices.push(index);
            }
            row[field.as_str()] = Value::Array(children);
        }
        for index in drop_indices.into_iter().rev() {
            results.remove(index);
        }
    }
    Ok(())
}

async fn association_children(
    env: &TableEnv,
    field: &str,
    table: &DeclaredTable,
    owner_ids: &[i64],
) -> Result<BTreeMap<i64, Vec<i64>>, ResolverError> {
    let mut by_owner: BTreeMap<i64, Vec<i64>> = BTreeMap::new();
    if owner_ids.is_empty() {
        return Ok(by_owner);
    }
    let assoc_name = association_table_name(field, &table.table_name);
    let rows = env
        .driver
        .get(GetQuery {
            table: assoc_name,
            search: vec![OWNER_TABLE_ID.to_owned(), FIELD_ID.to_owned()],
            filter: Where::new().one_of(OWNER_TABLE_ID, ids_as_json(owner_ids)),
            offset: None,
            limit: None,
            order: vec![],
        })
        .await?;
    for row in rows {
        if let (Some(owner), Some(child)) = (
            row.get(OWNER_TABLE_ID).and_then(Value::as_i64),
            row.get(FIELD_ID).and_then(Value::as_i64),
        ) {
            by_owner.entry(owner).or_default().push(child);
        }
    }
    Ok(by_owner)
}

async fn insert_associations(env: &TableEnv, field: &str, table: &DeclaredTable, owner_id: i64, children: &[Value]) -> Result<(), ResolverError> {
    let child_ids: Vec<i64> = children.iter().filter_map(reserved_id_of).collect();
    if child_ids.is_empty() {
        return Ok(());
    }
    let assoc_name = association_table_name(field, &table.table_name);
    let elements = child_ids
        .iter()
        .map(|child_id| {
            let mut row = Map::new();
            row.insert(OWNER_TABLE_ID.to_owned(), Value::from(owner_id));
            row.insert(FIELD_ID.to_owned(), Value::from(*child_id));
            row
        })
        .collect();
    env.driver.create(CreateQuery { table: assoc_name, elements }).await?;
    Ok(())
}

/// Walks every foreign key in the schema's physical model that targets
/// `table_name` and removes what it cascades to: association-table rows
/// for array fields, and whole dependent rows for object references, each
/// of those recursed into in turn. `visited` guards against revisiting the
/// same (table, id) twice, which a self-referencing schema would otherwise
/// send into a loop.
fn cascade_delete<'a>(
    env: &'a TableEnv,
    table_name: String,
    ids: Vec<i64>,
    visited: &'a mut BTreeMap<String, BTreeSet<i64>>,
) -> BoxFuture<'a, Result<(), ResolverError>> {
    Box::pin(async move {
        if ids.is_empty() {
            return Ok(());
        }
        let fresh: Vec<i64> = {
            let seen = visited.entry(table_name.clone()).or_default();
            ids.into_iter().filter(|id| seen.insert(*id)).collect()
        };
        if fresh.is_empty() {
            return Ok(());
        }

        let dependents: Vec<_> = env
            .schema
            .physical
            .values()
            .filter(|physical| {
                physical
                    .foreign_keys
                    .iter()
                    .any(|fk| fk.references_table.as_str() == table_name && fk.on_delete == ReferentialAction::Cascade)
            })
            .cloned()
            .collect();

        for physical in dependents {
            for fk in physical.foreign_keys.iter().filter(|fk| fk.references_table.as_str() == table_name && fk.on_delete == ReferentialAction::Cascade) {
                if physical.is_association {
                    env.driver
                        .delete(DeleteQuery {
                            table: physical.name.clone(),
                            filter: Where::new().one_of(fk.column.as_str(), ids_as_json(&fresh)),
                        })
                        .await?;
                    continue;
                }

                let rows = env
                    .driver
                    .get(GetQuery {
                        table: physical.name.clone(),
                        search: vec![RESERVED_ID.to_owned()],
                        filter: Where::new().one_of(fk.column.as_str(), ids_as_json(&fresh)),
                        offset: None,
                        limit: None,
                        order: vec![],
                    })
                    .await?;
                let dependent_ids: Vec<i64> = rows.iter().filter_map(|row| row.get(RESERVED_ID).and_then(Value::as_i64)).collect();
                if dependent_ids.is_empty() {
                    continue;
                }
                env.driver
                    .delete(DeleteQuery {
                        table: physical.name.clone(),
                        filter: Where::new().one_of(RESERVED_ID, ids_as_json(&dependent_ids)),
                    })
                    .await?;
                cascade_delete(env, physical.name.as_str().to_owned(), dependent_ids, visited).await?;
            }
        }
        Ok(())
    })
}

async fn apply_set<'a>(
    env: &'a TableEnv,
    auth: &'a RequestAuth,
    cache: &'a AsyncMutex<RequestCache>,
    plugin_ctx: &'a PluginContext,
    table: &'a DeclaredTable,
    rules: &TableRules,
    set_obj: &Map<String, Value>,
    results: &mut Vec<Value>,
    own_scope: &Scope,
    request: &Value,
    parent_scope: &Option<Scope>,
) -> Result<(), ResolverError> {
    if !auth.is_admin {
        for row in results.iter() {
            let scope = scope_for(row, request, parent_scope);
            evaluate(&rules.write, &eval_ctx(auth, scope)).map_err(|_| ResolverError::unauthorized("write denied"))?;
        }
    }

    let mut update_values: Row = Map::new();
    for (field, value) in set_obj {
        if table.column(field).is_some() {
            if !auth.is_admin {
                if let Some(field_rule) = rules.field_write(field) {
                    for row in results.iter() {
                        let scope = scope_for(row, request, parent_scope);
                        evaluate(field_rule, &eval_ctx(auth, scope)).map_err(|_| ResolverError::not_settable(field.clone()))?;
                    }
                }
            }
            update_values.insert(field.clone(), value.clone());
        } else if table.is_object(field) {
            let target = table.object_target(field).expect("classified as object").as_str();
            let matches = resolve_table(env, auth, cache, plugin_ctx, target, value.clone(), Some(own_scope.clone())).await?;
            match matches.len() {
                0 => return Err(ResolverError::not_settable(field.clone())),
                1 => {
                    let resolved = matches.into_iter().next().expect("length checked");
                    update_values.insert(object_id_column(field), resolved.get(RESERVED_ID).cloned().unwrap_or(Value::Null));
                }
                _ => return Err(ResolverError::not_unique(target)),
            }
        }
    }

    if !update_values.is_empty() && !results.is_empty() {
        let ids: Vec<i64> = results.iter().filter_map(reserved_id_of).collect();
        env.driver
            .update(UpdateQuery {
                table: table.table_name.clone(),
                values: update_values.clone(),
                filter: Where::new().one_of(RESERVED_ID, ids_as_json(&ids)),
            })
            .await?;

        let mut old_values = Vec::with_capacity(results.len());
        for row in results.iter_mut() {
            let mut old = Map::new();
            if let Some(obj) = row.as_object() {
                for key in update_values.keys() {
                    old.insert(key.clone(), obj.get(key).cloned().unwrap_or(Value::Null));
                }
            }
            old_values.push(Value::Object(old));
            if let Some(obj) = row.as_object_mut() {
                for (key, value) in &update_values {
                    obj.insert(key.clone(), value.clone());
                }
                obj.insert("edited".to_owned(), Value::Bool(true));
            }
            if let Some(id) = reserved_id_of(row) {
                cache.lock().await.add_cache(&table.table_name, id, row.as_object().expect("row is an object"));
            }
        }

        let change = serde_json::json!({
            "objects": results,
            "oldValues": old_values,
            "newValues": update_values,
        });
        env.plugins.on_update(table.table_name.as_str(), &change, plugin_ctx).await?;
    }

    for (field, value) in set_obj {
        if !table.is_array(field) {
            continue;
        }
        let target = table.array_target(field).expect("classified as array").as_str();
        let assoc_name = association_table_name(field, &table.table_name);
        let owners: Vec<i64> = results.iter().filter_map(reserved_id_of).collect();
        if owners.is_empty() {
            continue;
        }
        env.driver
            .delete(DeleteQuery {
                table: assoc_name.clone(),
                filter: Where::new().one_of(OWNER_TABLE_ID, ids_as_json(&owners)),
            })
            .await?;
        let children = resolve_table(env, auth, cache, plugin_ctx, target, value.clone(), Some(own_scope.clone())).await?;
        let child_ids: Vec<i64> = children.iter().filter_map(reserved_id_of).collect();
        if !child_ids.is_empty() {
            let mut elements = Vec::new();
            for owner in &owners {
                for child_id in &child_ids {
                    let mut row = Map::new();
                    row.insert(OWNER_TABLE_ID.to_owned(), Value::from(*owner));
                    row.insert(FIELD_ID.to_owned(), Value::from(*child_id));
                    elements.push(row);
                }
            }
            env.driver.create(CreateQuery { table: assoc_name, elements }).await?;
        }
        for row in results.iter_mut() {
            row[field.as_str()] = Value::Array(children.clone());
        }
    }

    Ok(())
}

async fn apply_array_instructions<'a>(
    env: &'a TableEnv,
    auth: &'a RequestAuth,
    cache: &'a AsyncMutex<RequestCache>,
    plugin_ctx: &'a PluginContext,
    table: &'a DeclaredTable,
    rules: &TableRules,
    classified: &request_value::ClassifiedRequest,
    results: &mut Vec<Value>,
    own_scope: &Scope,
    request: &Value,
    parent_scope: &Option<Scope>,
) -> Result<(), ResolverError> {
    if results.is_empty() {
        return Ok(());
    }
    let owners: Vec<i64> = results.iter().filter_map(reserved_id_of).collect();
    if owners.is_empty() {
        return Ok(());
    }

    for (field, sub_request) in &classified.arrays {
        let target = table.array_target(field).expect("classified as array").as_str();
        let assoc_name = association_table_name(field, &table.table_name);

        if let Some(add_value) = sub_request.get(request_value::keys::ADD) {
            if !auth.is_admin {
                if let Some(rule) = rules.array_add(field) {
                    for row in results.iter() {
                        let scope = scope_for(row, request, parent_scope);
                        evaluate(rule, &eval_ctx(auth, scope)).map_err(|_| ResolverError::unauthorized(format!("add denied on '{}'", field)))?;
                    }
                }
            }
            let targets = resolve_table(env, auth, cache, plugin_ctx, target, add_value.clone(), Some(own_scope.clone())).await?;
            let target_ids: Vec<i64> = targets.iter().filter_map(reserved_id_of).collect();
            if !target_ids.is_empty() {
                let mut elements = Vec::new();
                for owner in &owners {
                    for target_id in &target_ids {
                        let mut row = Map::new();
                        row.insert(OWNER_TABLE_ID.to_owned(), Value::from(*owner));
                        row.insert(FIELD_ID.to_owned(), Value::from(*target_id));
                        elements.push(row);
                    }
                }
                env.driver.create(CreateQuery { table: assoc_name.clone(), elements }).await?;
                let change = serde_json::json!({"owners": owners, "added": target_ids});
                env.plugins.on_list_update(table.table_name.as_str(), field, &change, plugin_ctx).await?;
            }
        }

        if let Some(remove_value) = sub_request.get(request_value::keys::REMOVE) {
            if !auth.is_admin {
                if let Some(rule) = rules.array_remove(field) {
                    for row in results.iter() {
                        let scope = scope_for(row, request, parent_scope);
                        evaluate(rule, &eval_ctx(auth, scope)).map_err(|_| ResolverError::unauthorized(format!("remove denied on '{}'", field)))?;
                    }
                }
            }
            let targets = resolve_table(env, auth, cache, plugin_ctx, target, remove_value.clone(), Some(own_scope.clone())).await?;
            let target_ids: Vec<i64> = targets.iter().filter_map(reserved_id_of).collect();
            if !target_ids.is_empty() {
                let mut filter = Where::new().one_of(OWNER_TABLE_ID, ids_as_json(&owners));
                push_operator(&mut filter, FIELD_ID, Operator::OneOf(ids_as_json(&target_ids)));
                env.driver.delete(DeleteQuery { table: assoc_name.clone(), filter }).await?;
                let change = serde_json::json!({"owners": owners, "removed": target_ids});
                env.plugins.on_list_update(table.table_name.as_str(), field, &change, plugin_ctx).await?;
            }
        }
    }
    Ok(())
}

fn apply_read_access_control(
    auth: &RequestAuth,
    rules: &TableRules,
    request: &Value,
    parent_scope: &Option<Scope>,
    instructions: &request_value::Instructions,
    results: &mut Vec<Value>,
) -> Result<(), ResolverError> {
    if instructions.create || auth.is_admin {
        return Ok(());
    }
    let mut kept = Vec::with_capacity(results.len());
    for row in results.drain(..) {
        let scope = scope_for(&row, request, parent_scope);
        let ctx = eval_ctx(auth, scope);
        if evaluate(&rules.read, &ctx).is_err() {
            continue;
        }
        let mut visible = row;
        if let Some(obj) = visible.as_object_mut() {
            let field_names: Vec<String> = obj.keys().cloned().collect();
            for field in field_names {
                if let Some(field_rule) = rules.field_read(&field) {
                    if evaluate(field_rule, &ctx).is_err() {
                        obj.remove(&field);
                    }
                }
            }
        }
        kept.push(visible);
    }
    *results = kept;
    Ok(())
}
