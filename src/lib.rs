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

//! Public facade over the engine's member crates. An embedder declares a
//! schema with [`schema_preparer`], attaches [`rule_engine`] rules and
//! [`plugin`] hooks, picks a [`driver::Driver`], and drives the whole thing
//! through a [`RequestResolver`].

pub use driver::Driver;
pub use errors::ResolverError;
pub use memory_driver::InMemoryDriver;
pub use plugin::{Plugin, PluginContext, PluginDispatcher};
pub use request_resolver::{EngineConfig, QueryOptions, RequestResolver};
pub use rule_engine::{Rule, TableRules};
pub use schema::SchemaModel;
pub use schema_preparer::{prepare, ColumnSpec, RawField, RawTable};

use std::collections::BTreeMap;
use std::sync::Arc;

/// Ties a prepared schema, its rules, a driver and a plugin dispatcher
/// together into a ready-to-use [`RequestResolver`]. A thin convenience
/// over [`RequestResolver::new`] for the common case of building all four
/// at once at startup.
pub fn build_engine(
    schema: SchemaModel,
    rules: BTreeMap<String, TableRules>,
    driver: Arc<dyn Driver>,
    plugins: PluginDispatcher,
    config: EngineConfig,
) -> RequestResolver {
    RequestResolver::new(Arc::new(schema), Arc::new(rules), driver, Arc::new(plugins), config)
}
