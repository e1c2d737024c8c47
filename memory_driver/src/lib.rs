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

//! An in-process, in-memory [`Driver`] so the resolver is runnable and
//! testable without an external database. Not the SQL driver of the wider
//! system — purely a reference fixture. Each physical table is a
//! `DashMap<u64, Row>` behind a monotonic id counter; `createTable` and
//! `createForeignKeys` only register the physical shape, there is no
//! on-disk enforcement of foreign keys or uniqueness here.

use async_trait::async_trait;
use dashmap::DashMap;
use driver::{CreateQuery, DeleteQuery, Driver, GetQuery, Operator, OrderDirection, Row, UpdateQuery, Where};
use errors::ResolverError;
use schema::PhysicalTable;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

#[derive(Default)]
struct Table {
    rows: DashMap<u64, Row>,
    next_id: AtomicU64,
}

impl Table {
    fn insert(&self, mut row: Row) -> u64 {
        let id = self.next_id.fetch_add(1, Ordering::SeqCst) + 1;
        row.insert("reservedId".to_owned(), Value::from(id));
        self.rows.insert(id, row);
        id
    }
}

/// The reference in-memory driver. Mutations land immediately rather than
/// being buffered; `rollback` instead replays an undo log recorded as each
/// write happens, in reverse, to restore the pre-transaction state.
#[derive(Default)]
pub struct InMemoryDriver {
    tables: DashMap<String, Table>,
    in_transaction: AtomicBool,
    rollback_log: Mutex<Vec<UndoOp>>,
}

enum UndoOp {
    Remove(String, u64),
    Restore(String, u64, Row),
}

impl InMemoryDriver {
    pub fn new() -> InMemoryDriver {
        InMemoryDriver::default()
    }

    fn table(&self, name: &str) -> dashmap::mapref::one::Ref<'_, String, Table> {
        self.tables.entry(name.to_owned()).or_default();
        self.tables.get(name).expect("just inserted")
    }

    fn record_undo(&self, op: UndoOp) {
        if self.in_transaction.load(Ordering::SeqCst) {
            self.rollback_log.lock().expect("rollback log poisoned").push(op);
        }
    }
}

fn row_matches(row: &Row, filter: &Where) -> bool {
    filter.conditions.iter().all(|(column, operators)| {
        let actual = row.get(column).cloned().unwrap_or(Value::Null);
        operators.iter().all(|operator| operator_matches(operator, &actual))
    })
}

fn operator_matches(operator: &Operator, actual: &Value) -> bool {
    match operator {
        Operator::Equal(expected) => actual == expected,
        Operator::OneOf(expected) => expected.iter().any(|v| v == actual),
        Operator::Not(expected) => actual != expected,
        Operator::Like(pattern) => actual.as_str().map_or(false, |s| s.contains(pattern.trim_matches('%'))),
        Operator::Gt(expected) => compare(actual, expected).map_or(false, |o| o == std::cmp::Ordering::Greater),
        Operator::Ge(expected) => compare(actual, expected).map_or(false, |o| o != std::cmp::Ordering::Less),
        Operator::Lt(expected) => compare(actual, expected).map_or(false, |o| o == std::cmp::Ordering::Less),
        Operator::Le(expected) => compare(actual, expected).map_or(false, |o| o != std::cmp::Ordering::Greater),
    }
}

fn compare(left: &Value, right: &Value) -> Option<std::cmp::Ordering> {
    match (left.as_f64(), right.as_f64()) {
        (Some(l), Some(r)) => l.partial_cmp(&r),
        _ => left.as_str().zip(right.as_str()).map(|(l, r)| l.cmp(r)),
    }
}

fn project(row: &Row, search: &[String]) -> Row {
    if search.is_empty() {
        return row.clone();
    }
    let mut projected = Map::new();
    for column in search {
        if let Some(value) = row.get(column) {
            projected.insert(column.clone(), value.clone());
        }
    }
    projected
}

#[async_trait]
impl Driver for InMemoryDriver {
    async fn start_transaction(&self) -> Result<(), ResolverError> {
        self.in_transaction.store(true, Ordering::SeqCst);
        self.rollback_log.lock().expect("rollback log poisoned").clear();
        Ok(())
    }

    async fn commit(&self) -> Result<(), ResolverError> {
        self.in_transaction.store(false, Ordering::SeqCst);
        self.rollback_log.lock().expect("rollback log poisoned").clear();
        Ok(())
    }

    async fn rollback(&self) -> Result<(), ResolverError> {
        self.in_transaction.store(false, Ordering::SeqCst);
        let mut log = self.rollback_log.lock().expect("rollback log poisoned");
        while let Some(op) = log.pop() {
            match op {
                UndoOp::Remove(table, id) => {
                    if let Some(table) = self.tables.get(&table) {
                        table.rows.remove(&id);
                    }
                }
                UndoOp::Restore(table, id, row) => {
                    if let Some(table) = self.tables.get(&table) {
                        table.rows.insert(id, row);
                    }
                }
            }
        }
        Ok(())
    }

    async fn get(&self, query: GetQuery) -> Result<Vec<Row>, ResolverError> {
        let table = self.table(query.table.as_str());
        let mut rows: Vec<Row> = table
            .rows
            .iter()
            .map(|entry| entry.value().clone())
            .filter(|row| row_matches(row, &query.filter))
            .collect();

        for order in query.order.iter().rev() {
            rows.sort_by(|a, b| {
                let ordering = compare(
                    a.get(&order.column).unwrap_or(&Value::Null),
                    b.get(&order.column).unwrap_or(&Value::Null),
                )
                .unwrap_or(std::cmp::Ordering::Equal);
                match order.direction {
                    OrderDirection::Ascending => ordering,
                    OrderDirection::Descending => ordering.reverse(),
                }
            });
        }

        if let Some(offset) = query.offset {
            rows = rows.into_iter().skip(offset.max(0) as usize).collect();
        }
        if let Some(limit) = query.limit {
            rows.truncate(limit.max(0) as usize);
        }

        Ok(rows.into_iter().map(|row| project(&row, &query.search)).collect())
    }

    async fn create(&self, query: CreateQuery) -> Result<Vec<i64>, ResolverError> {
        let table = self.table(query.table.as_str());
        let mut ids = Vec::with_capacity(query.elements.len());
        for element in query.elements {
            let id = table.insert(element);
            self.record_undo(UndoOp::Remove(query.table.as_str().to_owned(), id));
            ids.push(id as i64);
        }
        Ok(ids)
    }

    async fn update(&self, query: UpdateQuery) -> Result<(), ResolverError> {
        let table = self.table(query.table.as_str());
        let matching: Vec<u64> = table
            .rows
            .iter()
            .filter(|entry| row_matches(entry.value(), &query.filter))
            .map(|entry| *entry.key())
            .collect();
        for id in matching {
            if let Some(mut row) = table.rows.get_mut(&id) {
                self.record_undo(UndoOp::Restore(query.table.as_str().to_owned(), id, row.clone()));
                for (column, value) in &query.values {
                    row.insert(column.clone(), value.clone());
                }
            }
        }
        Ok(())
    }

    async fn delete(&self, query: DeleteQuery) -> Result<(), ResolverError> {
        let table = self.table(query.table.as_str());
        let matching: Vec<u64> = table
            .rows
            .iter()
            .filter(|entry| row_matches(entry.value(), &query.filter))
            .map(|entry| *entry.key())
            .collect();
        for id in matching {
            if let Some((_, row)) = table.rows.remove(&id) {
                self.record_undo(UndoOp::Restore(query.table.as_str().to_owned(), id, row));
            }
        }
        Ok(())
    }

    async fn create_table(&self, table: &PhysicalTable) -> Result<(), ResolverError> {
        self.tables.entry(table.name.as_str().to_owned()).or_default();
        log::debug!("registered physical table '{}'", table.name);
        Ok(())
    }

    async fn process_table(&self, table: &PhysicalTable) -> Result<(), ResolverError> {
        self.create_table(table).await
    }

    async fn create_foreign_keys(&self, tables: &BTreeMap<String, PhysicalTable>) -> Result<(), ResolverError> {
        for table in tables.values() {
            self.tables.entry(table.name.as_str().to_owned()).or_default();
        }
        Ok(())
    }

    async fn destroy(&self) -> Result<(), ResolverError> {
        self.tables.clear();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use driver::{CreateQuery, GetQuery};
    use schema::TableName;
    use serde_json::json;

    fn run<F: std::future::Future>(future: F) -> F::Output {
        futures_lite::future::block_on(future)
    }

    #[test]
    fn create_then_get_round_trips_the_row() {
        let driver = InMemoryDriver::new();
        let table = TableName::from("User");
        let row = json!({"email": "u1@x"}).as_object().unwrap().clone();

        let ids = run(async {
            driver.start_transaction().await.unwrap();
            let ids = driver
                .create(CreateQuery {
                    table: table.clone(),
                    elements: vec![row.clone()],
                })
                .await
                .unwrap();
            driver.commit().await.unwrap();
            ids
        });

        let rows = run(driver.get(GetQuery {
            table,
            search: vec![],
            filter: Default::default(),
            offset: None,
            limit: None,
            order: vec![],
        }))
        .unwrap();

        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].get("email"), Some(&json!("u1@x")));
        assert_eq!(rows[0].get("reservedId"), Some(&json!(ids[0])));
    }

    #[test]
    fn rollback_undoes_a_create() {
        let driver = InMemoryDriver::new();
        let table = TableName::from("User");
        run(async {
            driver.start_transaction().await.unwrap();
            driver
                .create(CreateQuery {
                    table: table.clone(),
                    elements: vec![json!({"email": "u1@x"}).as_object().unwrap().clone()],
                })
                .await
                .unwrap();
            driver.rollback().await.unwrap();
        });

        let rows = run(driver.get(GetQuery {
            table,
            search: vec![],
            filter: Default::default(),
            offset: None,
            limit: None,
            order: vec![],
        }))
        .unwrap();
        assert!(rows.is_empty());
    }
}
