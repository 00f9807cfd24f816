//! bus-plugin: the plugin boundary (§4.7).
//!
//! A pure interface with no lifecycle of its own. The broker and peer cores
//! call into implementations exclusively through these `on_*` hooks; they
//! never reach back into plugin internals. Hooks are invoked synchronously
//! on the dispatch task — long work must be offloaded by the implementation
//! (e.g. by `tokio::spawn`ing inside a hook).

use async_trait::async_trait;
use bus_protocol::{PluginId, ServerId};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PluginError {
    #[error("plugin hook failed: {0}")]
    HookFailed(String),
}

#[async_trait]
pub trait PluginHandler: Send + Sync {
    async fn on_login_set(&self, _servers: Vec<ServerId>) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_logout_set(&self, _servers: Vec<ServerId>) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_connected(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_disconnected(&self) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_data(
        &self,
        _plugin_id: &PluginId,
        _from_id: &ServerId,
        _payload: serde_json::Value,
    ) -> Result<(), PluginError> {
        Ok(())
    }

    async fn on_file(
        &self,
        _plugin_id: &PluginId,
        _from_id: &ServerId,
        _path: &Path,
    ) -> Result<(), PluginError> {
        Ok(())
    }
}

/// The "explicit registration interface with a list of named endpoints"
/// replacing the original's dynamic zip-archive plugin loading (§9).
#[derive(Clone, Default)]
pub struct PluginRegistry {
    handlers: Vec<(PluginId, Arc<dyn PluginHandler>)>,
}

impl PluginRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, plugin_id: impl Into<PluginId>, handler: Arc<dyn PluginHandler>) {
        self.handlers.push((plugin_id.into(), handler));
    }

    pub fn plugin_ids(&self) -> Vec<PluginId> {
        self.handlers.iter().map(|(id, _)| id.clone()).collect()
    }

    /// Hand a data payload to every handler registered for `plugin_id`
    /// (broker-originated `"system"` traffic fans out to every handler). A
    /// hook error is logged and dispatch continues with the next subscriber
    /// (§7 "Hook exception" policy).
    pub async fn dispatch_data(
        &self,
        plugin_id: &PluginId,
        from_id: &ServerId,
        payload: serde_json::Value,
    ) {
        for (id, handler) in &self.handlers {
            if id == plugin_id || plugin_id.is_system() {
                if let Err(e) = handler.on_data(id, from_id, payload.clone()).await {
                    tracing::error!(plugin = %id, error = %e, "on_data hook failed");
                }
            }
        }
    }

    pub async fn dispatch_file(&self, plugin_id: &PluginId, from_id: &ServerId, path: &Path) {
        for (id, handler) in &self.handlers {
            if id == plugin_id || plugin_id.is_system() {
                if let Err(e) = handler.on_file(id, from_id, path).await {
                    tracing::error!(plugin = %id, error = %e, "on_file hook failed");
                }
            }
        }
    }

    pub async fn dispatch_login_set(&self, servers: Vec<ServerId>) {
        for (id, handler) in &self.handlers {
            if let Err(e) = handler.on_login_set(servers.clone()).await {
                tracing::error!(plugin = %id, error = %e, "on_login_set hook failed");
            }
        }
    }

    pub async fn dispatch_logout_set(&self, servers: Vec<ServerId>) {
        for (id, handler) in &self.handlers {
            if let Err(e) = handler.on_logout_set(servers.clone()).await {
                tracing::error!(plugin = %id, error = %e, "on_logout_set hook failed");
            }
        }
    }

    pub async fn dispatch_connected(&self) {
        for (id, handler) in &self.handlers {
            if let Err(e) = handler.on_connected().await {
                tracing::error!(plugin = %id, error = %e, "on_connected hook failed");
            }
        }
    }

    pub async fn dispatch_disconnected(&self) {
        for (id, handler) in &self.handlers {
            if let Err(e) = handler.on_disconnected().await {
                tracing::error!(plugin = %id, error = %e, "on_disconnected hook failed");
            }
        }
    }
}
