//! S1 — Register (§8): a peer with no persisted account registers against
//! the bootstrap key and receives a fresh `(ServerId, Key)`.

use bus_config::ConfigProvider;
use bus_protocol::{Data, Endpoint, FrameData, Packet, PacketType, ServerId};
use bus_test_utils::MockWsClient;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn start_broker() -> (SocketAddr, Arc<broker::BrokerState>) {
    let config = bus_config::MemoryConfig::new();
    let accounts = broker::accounts::AccountStore::load(Arc::new(config)).await;
    let plugins = bus_plugin::PluginRegistry::new();
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

#[tokio::test]
async fn register_yields_a_fresh_account_and_key() {
    let (addr, _broker_state) = start_broker().await;
    let url = format!("ws://{addr}/ws");
    let mut client = MockWsClient::connect(&url).await.unwrap();

    let register = Packet {
        sid: 0,
        kind: PacketType::REGISTER,
        to: Endpoint::new(ServerId::broker(), "-----"),
        from: Endpoint::new(ServerId::broker(), "-----"),
        data: Some(Data {
            payload: serde_json::json!({ "path": "peer1" }),
            timestamp: 0.0,
            checksum: String::new(),
        }),
    };
    client.send_plain(ServerId::broker(), register).await.unwrap();

    let reply = client.recv_frame().await.unwrap();
    let packet = match reply.data {
        FrameData::Plain(p) => *p,
        FrameData::Ciphertext(_) => panic!("expected a plaintext registered reply"),
    };
    assert_eq!(packet.kind, PacketType::REGISTERED);

    let payload = packet.data.unwrap().payload;
    let id = payload["id"].as_str().unwrap();
    assert_eq!(id.len(), 5);
    let key_text = payload["password"].as_str().unwrap();
    bus_codec::Key::from_text(key_text).expect("password must be a valid fernet key");
}

#[tokio::test]
async fn register_and_log_in_via_the_real_peer_runtime() {
    let (addr, broker_state) = start_broker().await;
    let url = format!("ws://{addr}/ws");

    let config = bus_config::MemoryConfig::new();
    config
        .set("password", serde_json::json!(broker_state.bootstrap_key.current().as_text()))
        .await
        .unwrap();
    let state = Arc::new(peer::PeerState::new(Arc::new(config), bus_plugin::PluginRegistry::new()));
    let runtime = peer::PeerRuntime::new(state.clone());
    let cancel = tokio_util::sync::CancellationToken::new();
    let run_cancel = cancel.clone();
    let handle = tokio::spawn(async move {
        runtime.run(url, "peer1".to_owned(), run_cancel).await;
    });

    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    loop {
        if state.is_ready().await && state.account().await.is_some() {
            break;
        }
        assert!(tokio::time::Instant::now() < deadline, "peer never became ready");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }

    let (id, _) = state.account().await.unwrap();
    assert_eq!(id.as_str().len(), 5);

    cancel.cancel();
    let _ = handle.await;
}
