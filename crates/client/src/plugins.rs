//! Lifecycle hooks for extending the client.

use std::sync::{Arc, PoisonError, RwLock};

use protocol::{Request, Response, Update};

use crate::state::ShutdownReason;

/// The points at which plugins are called.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HookPoint {
    OnServerConnected,
    BeforeSendRequest,
    AfterSendRequest,
    OnResponse,
    OnUpdate,
    BeforeShutdown,
}

/// A client extension. Every hook defaults to doing nothing.
pub trait ClientPlugin: Send + Sync {
    fn name(&self) -> &str;

    /// Plugins run in ascending priority order.
    fn priority(&self) -> i32 {
        0
    }

    fn on_server_connected(&self) {}

    /// Called before the request is written; the plugin may rewrite it.
    fn before_send_request(&self, _request: &mut Request) {}

    fn after_send_request(&self, _request: &Request) {}

    fn on_response(&self, _response: &Response) {}

    /// Called before the client acts on the update.
    fn on_update(&self, _update: &Update) {}

    fn before_shutdown(&self, _reason: ShutdownReason) {}
}

#[derive(Default)]
pub struct PluginManager {
    plugins: RwLock<Vec<Arc<dyn ClientPlugin>>>,
}

impl std::fmt::Debug for PluginManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let names: Vec<String> = self
            .snapshot()
            .iter()
            .map(|p| p.name().to_string())
            .collect();
        f.debug_struct("PluginManager")
            .field("plugins", &names)
            .finish()
    }
}

impl PluginManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, plugin: Arc<dyn ClientPlugin>) {
        tracing::debug!(name = plugin.name(), priority = plugin.priority(), "registering plugin");
        let mut plugins = self.plugins.write().unwrap_or_else(PoisonError::into_inner);
        plugins.push(plugin);
        // stable, so equal priorities keep registration order
        plugins.sort_by_key(|p| p.priority());
    }

    pub fn len(&self) -> usize {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn snapshot(&self) -> Vec<Arc<dyn ClientPlugin>> {
        self.plugins
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Call `f` on every plugin in priority order.
    pub fn dispatch<F>(&self, point: HookPoint, mut f: F)
    where
        F: FnMut(&dyn ClientPlugin),
    {
        let plugins = self.snapshot();
        if plugins.is_empty() {
            return;
        }
        tracing::trace!(?point, count = plugins.len(), "dispatching plugin hook");
        for plugin in &plugins {
            f(plugin.as_ref());
        }
    }
}
