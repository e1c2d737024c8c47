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

//! Ordered async callbacks invoked at the fixed points the Table/Request
//! Resolver pipeline exposes. A [`Plugin`] implements only the hooks it
//! cares about; every method defaults to a no-op so a plugin interested in
//! a single table and a single event stays a few lines long.

use async_trait::async_trait;
use errors::ResolverError;
use serde_json::Value;
use std::sync::Arc;

/// The ambient facts every callback may need: the raw top-level request,
/// the original query before any table resolution mutated it, caller-local
/// state (`{readOnly, ...}`), and whether the caller authenticated as admin.
#[derive(Debug, Clone)]
pub struct PluginContext {
    pub request: Value,
    pub query: Value,
    pub local: Value,
    pub is_admin: bool,
}

/// A single table-scoped lifecycle hook. `table` names which table the
/// callback fired for, `request` is the mutable sub-request a plugin may
/// rewrite (the intended extension point), `ctx` carries the ambient facts.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Startup check: does this plugin's declared table set exist in the
    /// prepared schema? Returning an error aborts engine startup.
    async fn pre_requisite(&self, _tables: &[String]) -> Result<(), ResolverError> {
        Ok(())
    }

    async fn on_request(&self, _table: &str, _request: &mut Value, _ctx: &PluginContext) -> Result<(), ResolverError> {
        Ok(())
    }

    async fn on_processing(&self, _table: &str, _request: &mut Value, _ctx: &PluginContext) -> Result<(), ResolverError> {
        Ok(())
    }

    async fn on_result(&self, _table: &str, _results: &mut Value, _ctx: &PluginContext) -> Result<(), ResolverError> {
        Ok(())
    }

    async fn on_creation(&self, _table: &str, _created: &Value, _ctx: &PluginContext) -> Result<(), ResolverError> {
        Ok(())
    }

    async fn on_deletion(&self, _table: &str, _deleted: &Value, _ctx: &PluginContext) -> Result<(), ResolverError> {
        Ok(())
    }

    /// `change` is `{objects, oldValues, newValues}`, built by the Table
    /// Resolver's update step.
    async fn on_update(&self, _table: &str, _change: &Value, _ctx: &PluginContext) -> Result<(), ResolverError> {
        Ok(())
    }

    async fn on_list_update(&self, _table: &str, _field: &str, _change: &Value, _ctx: &PluginContext) -> Result<(), ResolverError> {
        Ok(())
    }

    /// Fires once per request, after the Driver has committed.
    async fn on_success(&self, _results: &Value, _ctx: &PluginContext) {}

    /// Fires once per request, after the Driver has rolled back. Failures
    /// here are logged and never replace the original error.
    async fn on_error(&self, _error: &ResolverError, _ctx: &PluginContext) {}
}

/// Runs every registered plugin's hook for a pipeline point, in
/// registration order, stopping at the first error.
#[derive(Clone, Default)]
pub struct PluginDispatcher {
    plugins: Vec<Arc<dyn Plugin>>,
}

impl PluginDispatcher {
    pub fn new() -> PluginDispatcher {
        PluginDispatcher::default()
    }

    pub fn register(&mut self, plugin: Arc<dyn Plugin>) {
        self.plugins.push(plugin);
    }

    pub async fn pre_requisite(&self, tables: &[String]) -> Result<(), ResolverError> {
        for plugin in &self.plugins {
            plugin.pre_requisite(tables).await?;
        }
        Ok(())
    }

    pub async fn on_request(&self, table: &str, request: &mut Value, ctx: &PluginContext) -> Result<(), ResolverError> {
        for plugin in &self.plugins {
            plugin.on_request(table, request, ctx).await?;
        }
        Ok(())
    }

    pub async fn on_processing(&self, table: &str, request: &mut Value, ctx: &PluginContext) -> Result<(), ResolverError> {
        for plugin in &self.plugins {
            plugin.on_processing(table, request, ctx).await?;
        }
        Ok(())
    }

    pub async fn on_result(&self, table: &str, results: &mut Value, ctx: &PluginContext) -> Result<(), ResolverError> {
        for plugin in &self.plugins {
            plugin.on_result(table, results, ctx).await?;
        }
        Ok(())
    }

    pub async fn on_creation(&self, table: &str, created: &Value, ctx: &PluginContext) -> Result<(), ResolverError> {
        for plugin in &self.plugins {
            plugin.on_creation(table, created, ctx).await?;
        }
        Ok(())
    }

    pub async fn on_deletion(&self, table: &str, deleted: &Value, ctx: &PluginContext) -> Result<(), ResolverError> {
        for plugin in &self.plugins {
            plugin.on_deletion(table, deleted, ctx).await?;
        }
        Ok(())
    }

    pub async fn on_update(&self, table: &str, change: &Value, ctx: &PluginContext) -> Result<(), ResolverError> {
        for plugin in &self.plugins {
            plugin.on_update(table, change, ctx).await?;
        }
        Ok(())
    }

    pub async fn on_list_update(&self, table: &str, field: &str, change: &Value, ctx: &PluginContext) -> Result<(), ResolverError> {
        for plugin in &self.plugins {
            plugin.on_list_update(table, field, change, ctx).await?;
        }
        Ok(())
    }

    pub async fn on_success(&self, results: &Value, ctx: &PluginContext) {
        for plugin in &self.plugins {
            plugin.on_success(results, ctx).await;
        }
    }

    pub async fn on_error(&self, error: &ResolverError, ctx: &PluginContext) {
        for plugin in &self.plugins {
            plugin.on_error(error, ctx).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct CountingPlugin {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl Plugin for CountingPlugin {
        async fn on_request(&self, _table: &str, _request: &mut Value, _ctx: &PluginContext) -> Result<(), ResolverError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RejectingPlugin;

    #[async_trait]
    impl Plugin for RejectingPlugin {
        async fn on_request(&self, _table: &str, _request: &mut Value, _ctx: &PluginContext) -> Result<(), ResolverError> {
            Err(ResolverError::forbidden("no"))
        }
    }

    fn ctx() -> PluginContext {
        PluginContext {
            request: json!({}),
            query: json!({}),
            local: json!({}),
            is_admin: false,
        }
    }

    #[test]
    fn dispatches_to_every_registered_plugin() {
        let counting = Arc::new(CountingPlugin { calls: AtomicUsize::new(0) });
        let mut dispatcher = PluginDispatcher::new();
        dispatcher.register(counting.clone());
        dispatcher.register(counting.clone());

        let mut request = json!({});
        futures_lite::future::block_on(dispatcher.on_request("User", &mut request, &ctx())).unwrap();
        assert_eq!(counting.calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn stops_at_the_first_error() {
        let counting = Arc::new(CountingPlugin { calls: AtomicUsize::new(0) });
        let mut dispatcher = PluginDispatcher::new();
        dispatcher.register(Arc::new(RejectingPlugin));
        dispatcher.register(counting.clone());

        let mut request = json!({});
        let result = futures_lite::future::block_on(dispatcher.on_request("User", &mut request, &ctx()));
        assert!(result.is_err());
        assert_eq!(counting.calls.load(Ordering::SeqCst), 0);
    }
}
