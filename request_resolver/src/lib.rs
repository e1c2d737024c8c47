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

//! Top-level entry point: opens a transaction, walks the top-level keys of
//! a request to the Table Resolver in order, and runs the commit/rollback
//! plugin hooks around the whole thing. A process-wide FIFO queue
//! serializes calls against one driver connection; a latch rejects
//! re-entrant top-level calls so a rule or plugin that needs a nested
//! query goes through [`RequestResolver::query`] instead, which runs
//! in-band inside the already-open transaction.

use async_mutex::Mutex as AsyncMutex;
use driver::Driver;
use errors::ResolverError;
use plugin::{PluginContext, PluginDispatcher};
use request_cache::RequestCache;
use rule_engine::TableRules;
use schema::SchemaModel;
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use table_resolver::{resolve_table, RequestAuth, TableEnv};

/// Assembled once by the embedder and handed to the resolver at startup;
/// this crate never reads it from the environment or a file.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// The `authId` value that stands in for admin access.
    pub private_key: Value,
    /// Soft per-call timeout; enforcement is the embedder's driver's job,
    /// this is just the value handed down to it.
    pub query_timeout: Duration,
    /// Depth of the per-database FIFO queue before callers start waiting.
    pub queue_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> EngineConfig {
        EngineConfig {
            private_key: Value::Null,
            query_timeout: Duration::from_secs(5),
            queue_depth: 64,
        }
    }
}

/// Options for an in-band sub-call made from a rule or a plugin.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Substitutes the private key for `authId` for this call only.
    pub admin: bool,
    /// Forbids `create`/`delete` for this call only.
    pub read_only: bool,
}

/// Owns the transaction latch and the per-database serialization queue for
/// one driver connection. Schema, rules and plugins are shared and
/// immutable after startup.
pub struct RequestResolver {
    env: TableEnv,
    config: Arc<EngineConfig>,
    in_transaction: AtomicBool,
    queue: AsyncMutex<()>,
}

impl RequestResolver {
    pub fn new(
        schema: Arc<SchemaModel>,
        rules: Arc<BTreeMap<String, TableRules>>,
        driver: Arc<dyn Driver>,
        plugins: Arc<PluginDispatcher>,
        config: EngineConfig,
    ) -> RequestResolver {
        RequestResolver {
            env: TableEnv { schema, rules, driver, plugins },
            config: Arc::new(config),
            in_transaction: AtomicBool::new(false),
            queue: AsyncMutex::new(()),
        }
    }

    /// Entry point for a fresh top-level request. Rejects re-entrant calls
    /// before ever touching the queue, since a recursive call made from
    /// within the same task while the queue permit is held would otherwise
    /// deadlock rather than fail cleanly.
    pub async fn resolve(&self, request: Value, auth_id: Value, local: Value) -> Result<Value, ResolverError> {
        if self.in_transaction.load(Ordering::SeqCst) {
            return Err(ResolverError::forbidden("a request is already in progress on this connection"));
        }
        let _permit = self.queue.lock().await;
        self.in_transaction.store(true, Ordering::SeqCst);

        let is_admin = auth_id == self.config.private_key;
        let auth = RequestAuth { auth_id, is_admin, read_only: false };
        let ctx = PluginContext { request: request.clone(), query: request.clone(), local, is_admin };

        let result = match self.env.driver.start_transaction().await {
            Ok(()) => self.run_and_settle(&request, &auth, &ctx).await,
            Err(e) => Err(e),
        };

        self.in_transaction.store(false, Ordering::SeqCst);
        result
    }

    /// The in-band helper exposed to rules and plugins: runs inside the
    /// caller's already-open transaction, so it never touches the latch
    /// or the queue.
    pub async fn query(&self, request: Value, auth_id: Value, local: Value, options: QueryOptions) -> Result<Value, ResolverError> {
        let is_admin = options.admin || auth_id == self.config.private_key;
        let auth = RequestAuth { auth_id, is_admin, read_only: options.read_only };
        let ctx = PluginContext { request: request.clone(), query: request.clone(), local, is_admin };
        self.dispatch(&request, &auth, &ctx).await
    }

    async fn run_and_settle(&self, request: &Value, auth: &RequestAuth, ctx: &PluginContext) -> Result<Value, ResolverError> {
        match self.dispatch(request, auth, ctx).await {
            Ok(response) => {
                self.env.plugins.on_success(&response, ctx).await;
                match self.env.driver.commit().await {
                    Ok(()) => Ok(response),
                    Err(e) => {
                        log::error!("commit failed after a successful resolution: {}", e);
                        Err(e)
                    }
                }
            }
            Err(e) => {
                if let Err(rollback_err) = self.env.driver.rollback().await {
                    log::warn!("rollback failed, original error preserved: {}", rollback_err);
                }
                self.env.plugins.on_error(&e, ctx).await;
                Err(e)
            }
        }
    }

    async fn dispatch(&self, request: &Value, auth: &RequestAuth, ctx: &PluginContext) -> Result<Value, ResolverError> {
        let top = request.as_object().ok_or_else(|| ResolverError::bad_request("request must be a JSON object"))?;
        let cache = AsyncMutex::new(RequestCache::new());
        let mut response = Map::new();
        for (table_name, value) in top.iter() {
            if self.env.schema.declared_table(table_name).is_none() {
                return Err(ResolverError::bad_request(format!("'{}' is not a declared table", table_name)));
            }
            let rows = self.resolve_key(table_name, value, auth, &cache, ctx).await?;
            response.insert(table_name.clone(), Value::Array(rows));
        }
        Ok(Value::Object(response))
    }

    /// A table key's value is either one sub-request or a list of them; a
    /// list is processed in order and the results concatenated.
    async fn resolve_key(
        &self,
        table_name: &str,
        value: &Value,
        auth: &RequestAuth,
        cache: &AsyncMutex<RequestCache>,
        ctx: &PluginContext,
    ) -> Result<Vec<Value>, ResolverError> {
        match value {
            Value::Array(items) => {
                let mut all = Vec::with_capacity(items.len());
                for item in items {
                    let rows = resolve_table(&self.env, auth, cache, ctx, table_name, item.clone(), None).await?;
                    all.extend(rows);
                }
                Ok(all)
            }
            _ => resolve_table(&self.env, auth, cache, ctx, table_name, value.clone(), None).await,
        }
    }
}
