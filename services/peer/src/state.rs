//! All state owned by the peer's connection loop (§3 "HistoryStore",
//! "LastSent", "FileAssembly" — peer-side shapes), plus the account the
//! peer currently believes it holds.
//!
//! Unlike the broker (one entry per connected peer), the peer only ever
//! talks to one counterpart — the broker — so every map in §3 collapses to
//! a single slot here, keyed internally on [`bus_protocol::BROKER_ID`] where
//! the spec still calls for a map.

use crate::file_assembly::FileSink;
use bus_codec::Key;
use bus_plugin::PluginRegistry;
use bus_protocol::{Endpoint, HistoryStore, Packet, PluginId, ServerId};
use bus_ui_log::UiLogger;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio_tungstenite::tungstenite::protocol::Message;

/// A data-send waiting for its turn because a prior send is still un-acked
/// (§4.6 "Outbound ordering": at most one un-acked `data-send` at a time).
#[derive(Debug, Clone)]
pub struct QueuedSend {
    pub to: Endpoint,
    pub from_plugin: PluginId,
    pub payload: serde_json::Value,
}

pub struct PeerState {
    /// The peer's own send history, keyed on `"-----"` — there is only ever
    /// one directed channel on this side (§3 "on the peer, one list keyed
    /// `"-----"` for the broker").
    pub history: Mutex<HistoryStore>,
    pub last_sent: Mutex<Option<Packet>>,
    pub send_queue: Mutex<VecDeque<QueuedSend>>,
    pub file_assembly: Mutex<Option<FileSink>>,
    account: RwLock<Option<(ServerId, Key)>>,
    last_received_sid: AtomicI64,
    outbound: RwLock<Option<mpsc::Sender<Message>>>,
    pub plugins: PluginRegistry,
    pub config: Arc<dyn bus_config::ConfigProvider>,
    pub logger: Arc<UiLogger<String>>,
}

impl PeerState {
    pub fn new(config: Arc<dyn bus_config::ConfigProvider>, plugins: PluginRegistry) -> Self {
        let (tx, _rx) = tokio::sync::broadcast::channel(1024);
        let logger = Arc::new(UiLogger::with_buffer(tx, |entry| entry, 500));
        PeerState {
            history: Mutex::new(HistoryStore::new()),
            last_sent: Mutex::new(None),
            send_queue: Mutex::new(VecDeque::new()),
            file_assembly: Mutex::new(None),
            account: RwLock::new(None),
            last_received_sid: AtomicI64::new(0),
            outbound: RwLock::new(None),
            plugins,
            config,
            logger,
        }
    }

    pub async fn account(&self) -> Option<(ServerId, Key)> {
        self.account.read().await.clone()
    }

    pub async fn set_account(&self, id: ServerId, key: Key) {
        *self.account.write().await = Some((id, key));
    }

    pub fn last_received_sid(&self) -> i64 {
        self.last_received_sid.load(Ordering::SeqCst)
    }

    /// Bump the replay cursor used by `ping(since_sid=...)` (§4.6
    /// "Keepalive"). Only called for packets the broker actually assigned a
    /// fresh channel sid to — acks/errors echo the *sender's* original sid
    /// for correlation and must not move the cursor.
    pub fn observe_channel_sid(&self, sid: i64) {
        self.last_received_sid.fetch_max(sid, Ordering::SeqCst);
    }

    pub async fn is_ready(&self) -> bool {
        self.outbound.read().await.is_some()
    }

    pub async fn set_outbound(&self, tx: mpsc::Sender<Message>) {
        *self.outbound.write().await = Some(tx);
    }

    pub async fn clear_outbound(&self) {
        *self.outbound.write().await = None;
    }

    /// Push `message` onto the live connection's outbound queue, if any.
    /// Returns `false` (not an error — matching "send to absent peer:
    /// locally logged, no packet emitted") when there is no live
    /// connection.
    pub async fn send_frame(&self, message: Message) -> bool {
        let Some(tx) = self.outbound.read().await.clone() else {
            return false;
        };
        tx.send(message).await.is_ok()
    }
}
