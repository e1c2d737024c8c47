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

//! Per-transaction memo of the latest known column values for a row, keyed
//! by `(tableName, reservedId)`. Reading back a projection only succeeds
//! when every requested property is already known; a single missing
//! property invalidates the whole lookup rather than returning a partial
//! row, since a partial row is indistinguishable from a column that is
//! genuinely null.

use schema::TableName;
use serde_json::{Map, Value};
use std::collections::HashMap;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct CacheKey {
    table: String,
    reserved_id: i64,
}

#[derive(Debug, Default)]
pub struct RequestCache {
    rows: HashMap<CacheKey, Map<String, Value>>,
}

impl RequestCache {
    pub fn new() -> RequestCache {
        RequestCache::default()
    }

    fn key(table: &TableName, reserved_id: i64) -> CacheKey {
        CacheKey {
            table: table.as_str().to_owned(),
            reserved_id,
        }
    }

    /// Merges `row` into whatever is already known about this id, columns
    /// in `row` winning on conflict.
    pub fn add_cache(&mut self, table: &TableName, reserved_id: i64, row: &Map<String, Value>) {
        let entry = self.rows.entry(Self::key(table, reserved_id)).or_default();
        for (column, value) in row {
            entry.insert(column.clone(), value.clone());
        }
    }

    pub fn uncache(&mut self, table: &TableName, reserved_id: i64) {
        self.rows.remove(&Self::key(table, reserved_id));
    }

    /// Returns a row built only from `properties` if every one of them is
    /// already cached; `None` otherwise, so the caller falls through to the
    /// driver rather than risk serving a stale partial view.
    pub fn read_cache(&self, table: &TableName, reserved_id: i64, properties: &[String]) -> Option<Map<String, Value>> {
        let cached = self.rows.get(&Self::key(table, reserved_id))?;
        let mut projection = Map::new();
        for property in properties {
            let value = cached.get(property)?;
            projection.insert(property.clone(), value.clone());
        }
        Some(projection)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn user() -> TableName {
        TableName::from("User")
    }

    #[test]
    fn reads_back_a_fully_known_projection() {
        let mut cache = RequestCache::new();
        let row = json!({"reservedId": 1, "email": "u1@x"}).as_object().unwrap().clone();
        cache.add_cache(&user(), 1, &row);
        let projection = cache.read_cache(&user(), 1, &["email".to_owned()]);
        assert_eq!(projection, Some(json!({"email": "u1@x"}).as_object().unwrap().clone()));
    }

    #[test]
    fn missing_property_invalidates_the_whole_lookup() {
        let mut cache = RequestCache::new();
        let row = json!({"reservedId": 1, "email": "u1@x"}).as_object().unwrap().clone();
        cache.add_cache(&user(), 1, &row);
        assert!(cache.read_cache(&user(), 1, &["email".to_owned(), "pseudo".to_owned()]).is_none());
    }

    #[test]
    fn uncache_removes_the_row() {
        let mut cache = RequestCache::new();
        let row = json!({"reservedId": 1, "email": "u1@x"}).as_object().unwrap().clone();
        cache.add_cache(&user(), 1, &row);
        cache.uncache(&user(), 1);
        assert!(cache.read_cache(&user(), 1, &["email".to_owned()]).is_none());
    }

    #[test]
    fn different_tables_do_not_collide_on_the_same_id() {
        let mut cache = RequestCache::new();
        cache.add_cache(&user(), 1, json!({"email": "u1@x"}).as_object().unwrap());
        cache.add_cache(&TableName::from("Post"), 1, json!({"title": "hello"}).as_object().unwrap());
        assert!(cache.read_cache(&user(), 1, &["title".to_owned()]).is_none());
    }
}
