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

//! The abstract transactional CRUD + DDL surface the Table/Request Resolver
//! consumes. Concrete drivers (SQL, external API adapters) implement
//! [`Driver`]; [`memory_driver`](../memory_driver/index.html) is the
//! reference implementation used by this crate's own tests.

use async_trait::async_trait;
use errors::ResolverError;
use schema::{PhysicalTable, TableName};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

pub type Row = Map<String, Value>;

/// A single operator applied to one column, e.g. `{gt: 18}`. Multiple
/// entries under the same column in a [`Where`] are AND-ed; values given as
/// a JSON array are OR-ed equality checks.
#[derive(Debug, Clone, PartialEq)]
pub enum Operator {
    Equal(Value),
    OneOf(Vec<Value>),
    Not(Value),
    Like(String),
    Gt(Value),
    Ge(Value),
    Lt(Value),
    Le(Value),
}

/// A conjunction of per-column operators, the shape the driver filters
/// `get`/`update`/`delete` against.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Where {
    pub conditions: BTreeMap<String, Vec<Operator>>,
}

impl Where {
    pub fn new() -> Where {
        Where::default()
    }

    pub fn equal(mut self, column: impl Into<String>, value: Value) -> Where {
        self.conditions.entry(column.into()).or_default().push(Operator::Equal(value));
        self
    }

    pub fn one_of(mut self, column: impl Into<String>, values: Vec<Value>) -> Where {
        self.conditions.entry(column.into()).or_default().push(Operator::OneOf(values));
        self
    }

    pub fn is_empty(&self) -> bool {
        self.conditions.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OrderDirection {
    Ascending,
    Descending,
}

#[derive(Debug, Clone, PartialEq)]
pub struct OrderBy {
    pub column: String,
    pub direction: OrderDirection,
}

#[derive(Debug, Clone, Default)]
pub struct GetQuery {
    pub table: TableName,
    pub search: Vec<String>,
    pub filter: Where,
    pub offset: Option<i64>,
    pub limit: Option<i64>,
    pub order: Vec<OrderBy>,
}

#[derive(Debug, Clone)]
pub struct CreateQuery {
    pub table: TableName,
    pub elements: Vec<Row>,
}

#[derive(Debug, Clone)]
pub struct UpdateQuery {
    pub table: TableName,
    pub values: Row,
    pub filter: Where,
}

#[derive(Debug, Clone)]
pub struct DeleteQuery {
    pub table: TableName,
    pub filter: Where,
}

/// Abstract transactional CRUD + DDL surface. One [`Driver`] handle is
/// leased per request and released on commit/rollback; `start_transaction`
/// through `rollback` bracket the whole pipeline run.
#[async_trait]
pub trait Driver: Send + Sync {
    async fn start_transaction(&self) -> Result<(), ResolverError>;
    async fn commit(&self) -> Result<(), ResolverError>;
    async fn rollback(&self) -> Result<(), ResolverError>;

    async fn get(&self, query: GetQuery) -> Result<Vec<Row>, ResolverError>;
    async fn create(&self, query: CreateQuery) -> Result<Vec<i64>, ResolverError>;
    async fn update(&self, query: UpdateQuery) -> Result<(), ResolverError>;
    async fn delete(&self, query: DeleteQuery) -> Result<(), ResolverError>;

    async fn create_table(&self, table: &PhysicalTable) -> Result<(), ResolverError>;
    async fn process_table(&self, table: &PhysicalTable) -> Result<(), ResolverError>;
    async fn create_foreign_keys(&self, tables: &BTreeMap<String, PhysicalTable>) -> Result<(), ResolverError>;

    async fn destroy(&self) -> Result<(), ResolverError>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn where_builder_accumulates_conditions_per_column() {
        let filter = Where::new().equal("email", json!("u1@x")).one_of("status", vec![json!("a"), json!("b")]);
        assert_eq!(filter.conditions.len(), 2);
        assert!(!filter.is_empty());
    }

    #[test]
    fn empty_where_has_no_conditions() {
        assert!(Where::new().is_empty());
    }
}
