use crate::accounts::AccountStore;
use crate::bootstrap_key::BootstrapKeyRotator;
use crate::file_relay::FileSink;
use axum::extract::ws::Message;
use bus_plugin::PluginRegistry;
use bus_protocol::{HistoryStore, Packet, ServerId};
use bus_ui_log::UiLogger;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};

/// A live connection's outbound half plus the `ServerInfo` it advertised at
/// login (§3 "ConnectionTable").
pub struct ConnectionHandle {
    pub outbound: mpsc::Sender<Message>,
    pub server_info: serde_json::Value,
}

/// All state shared across connection-handler tasks (§5 "Shared-resource
/// policy"). Each field is independently lockable so no handler ever holds
/// two locks at once across an `.await`.
pub struct BrokerState {
    pub connections: RwLock<HashMap<ServerId, ConnectionHandle>>,
    /// Broker -> peer history, keyed by peer. Replayed on `ping` for resume.
    pub history: RwLock<HistoryStore>,
    /// Peer -> broker history, keyed by peer. Only consulted for the
    /// duplicate-login `truncate_recv` cleanup (§4.5, §9); never replayed.
    pub recv_history: RwLock<HistoryStore>,
    pub last_sent: RwLock<HashMap<ServerId, Packet>>,
    pub file_assembly: Mutex<HashMap<ServerId, FileSink>>,
    pub accounts: AccountStore,
    pub bootstrap_key: BootstrapKeyRotator,
    pub plugins: PluginRegistry,
    pub logger: Arc<UiLogger<String>>,
}

impl BrokerState {
    pub fn new(accounts: AccountStore, plugins: PluginRegistry) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(1024);
        let logger = Arc::new(UiLogger::with_buffer(tx, |entry| entry, 500));
        BrokerState {
            connections: RwLock::new(HashMap::new()),
            history: RwLock::new(HistoryStore::new()),
            recv_history: RwLock::new(HistoryStore::new()),
            last_sent: RwLock::new(HashMap::new()),
            file_assembly: Mutex::new(HashMap::new()),
            accounts,
            bootstrap_key: BootstrapKeyRotator::spawn(),
            plugins,
            logger,
        }
    }

    pub async fn known_peers(&self) -> Vec<ServerId> {
        self.connections.read().await.keys().cloned().collect()
    }

    pub async fn is_connected(&self, id: &ServerId) -> bool {
        self.connections.read().await.contains_key(id)
    }

    /// Send `message` on `to`'s connection, if it has one. Returns `false`
    /// (logged by the caller) if `to` is not currently connected — matching
    /// "Send to absent peer: locally logged, no packet emitted".
    pub async fn send_to(&self, to: &ServerId, message: Message) -> bool {
        let connections = self.connections.read().await;
        match connections.get(to) {
            Some(handle) => handle.outbound.send(message).await.is_ok(),
            None => false,
        }
    }

    pub async fn shutdown(&self) {
        self.bootstrap_key.shutdown();
        let mut connections = self.connections.write().await;
        for (_, handle) in connections.drain() {
            drop(handle.outbound);
        }
    }
}
