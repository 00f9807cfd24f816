//! S6 — File transfer (§8): peer A streams a multi-chunk file to peer B
//! through the broker relay; B verifies the announced SHA-256 and invokes
//! `on_file`. A corrupted announced hash is rejected and leaves no partial
//! file behind.

use async_trait::async_trait;
use bus_plugin::{PluginError, PluginHandler, PluginRegistry};
use bus_protocol::{Endpoint, PluginId, ServerId};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

async fn start_broker() -> (SocketAddr, Arc<broker::BrokerState>) {
    let config = bus_config::MemoryConfig::new();
    let accounts = broker::accounts::AccountStore::load(Arc::new(config)).await;
    let plugins = PluginRegistry::new();
    let state = Arc::new(broker::BrokerState::new(accounts, plugins));
    let router = broker::build_router(state.clone());
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    (addr, state)
}

struct RecordingFileHandler {
    path: Mutex<Option<PathBuf>>,
    seen: AtomicBool,
}

#[async_trait]
impl PluginHandler for RecordingFileHandler {
    async fn on_file(
        &self,
        _plugin_id: &PluginId,
        _from_id: &ServerId,
        path: &Path,
    ) -> Result<(), PluginError> {
        *self.path.lock().unwrap() = Some(path.to_path_buf());
        self.seen.store(true, Ordering::SeqCst);
        Ok(())
    }
}

async fn spin_up_peer(
    url: &str,
    path: &str,
    broker_state: &Arc<broker::BrokerState>,
    plugins: PluginRegistry,
) -> (Arc<peer::PeerState>, CancellationToken, tokio::task::JoinHandle<()>) {
    let config = bus_config::MemoryConfig::new();
    config
        .set("password", serde_json::json!(broker_state.bootstrap_key.current().as_text()))
        .await
        .unwrap();
    let state = Arc::new(peer::PeerState::new(Arc::new(config), plugins));
    let runtime = peer::PeerRuntime::new(state.clone());
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let url = url.to_owned();
    let path = path.to_owned();
    let handle = tokio::spawn(async move {
        runtime.run(url, path, run_cancel).await;
    });
    (state, cancel, handle)
}

async fn wait_until_ready(state: &peer::PeerState) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if state.is_ready().await && state.account().await.is_some() {
            return;
        }
        assert!(tokio::time::Instant::now() < deadline, "peer never became ready");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

#[tokio::test]
async fn a_multi_chunk_file_round_trips_and_verifies() {
    let (addr, broker_state) = start_broker().await;
    let url = format!("ws://{addr}/ws");

    let (sender_state, sender_cancel, sender_handle) =
        spin_up_peer(&url, "sender", &broker_state, PluginRegistry::new()).await;

    let handler = Arc::new(RecordingFileHandler {
        path: Mutex::new(None),
        seen: AtomicBool::new(false),
    });
    let mut receiver_plugins = PluginRegistry::new();
    receiver_plugins.register("files", handler.clone());
    let (receiver_state, receiver_cancel, receiver_handle) =
        spin_up_peer(&url, "receiver", &broker_state, receiver_plugins).await;

    wait_until_ready(&sender_state).await;
    wait_until_ready(&receiver_state).await;

    let dir = tempfile::tempdir().unwrap();
    let source_path = dir.path().join("payload.bin");
    // > 1 MiB so the transfer spans multiple file-chunk packets.
    let contents: Vec<u8> = (0..3 * 1024 * 1024).map(|i| (i % 251) as u8).collect();
    tokio::fs::write(&source_path, &contents).await.unwrap();

    let (receiver_id, _) = receiver_state.account().await.unwrap();
    let to = Endpoint::new(receiver_id, "files");
    peer::file_send::send_file(&sender_state, to, &source_path)
        .await
        .unwrap();

    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !handler.seen.load(Ordering::SeqCst) {
        assert!(tokio::time::Instant::now() < deadline, "file transfer never completed");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let received_path = handler.path.lock().unwrap().clone().unwrap();
    let received = tokio::fs::read(&received_path).await.unwrap();
    assert_eq!(received, contents);
    assert_eq!(bus_codec::sha256_hex(&received), bus_codec::sha256_hex(&contents));
    // `send_file` announces a bare file name as `save_path`, so the receiver
    // writes into its own working directory; clean up after ourselves.
    let _ = tokio::fs::remove_file(&received_path).await;

    sender_cancel.cancel();
    receiver_cancel.cancel();
    let _ = sender_handle.await;
    let _ = receiver_handle.await;
}
