//! S3 — Checksum error (§8): a `data-send` whose payload doesn't match its
//! declared checksum is rejected with `data-error`, not acknowledged, and
//! the connection stays open (checksum failure never closes the socket).

use bus_protocol::{Data, Endpoint, Packet, PacketType, ServerId};
use bus_test_utils::MockWsClient;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

async fn start_broker() -> SocketAddr {
    let config = bus_config::MemoryConfig::new();
    let accounts = broker::accounts::AccountStore::load(Arc::new(config)).await;
    let plugins = bus_plugin::PluginRegistry::new();
    let state = Arc::new(broker::BrokerState::new(accounts, plugins));
    let router = broker::build_router(state);
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    tokio::time::sleep(Duration::from_millis(20)).await;
    addr
}

/// Register then log in over `client`, returning the freshly issued account.
async fn register_and_log_in(client: &mut MockWsClient) -> (ServerId, bus_codec::Key) {
    let register = Packet {
        sid: 0,
        kind: PacketType::REGISTER,
        to: Endpoint::new(ServerId::broker(), "-----"),
        from: Endpoint::new(ServerId::broker(), "-----"),
        data: None,
    };
    client.send_plain(ServerId::broker(), register).await.unwrap();
    let registered = client.recv_frame().await.unwrap();
    let (id, key) = match registered.data {
        bus_protocol::FrameData::Plain(packet) => {
            let payload = &packet.data.as_ref().unwrap().payload;
            let id = ServerId::from(payload["id"].as_str().unwrap());
            let key = bus_codec::Key::from_text(payload["password"].as_str().unwrap()).unwrap();
            (id, key)
        }
        bus_protocol::FrameData::Ciphertext(_) => panic!("expected plaintext registered reply"),
    };

    let login = Packet {
        sid: 0,
        kind: PacketType::LOGIN,
        to: Endpoint::new(ServerId::broker(), "system"),
        from: Endpoint::new(id.clone(), "system"),
        data: Some(Data {
            payload: serde_json::json!({ "id": id.as_str() }),
            timestamp: 0.0,
            checksum: String::new(),
        }),
    };
    client.send_encrypted(id.clone(), &key, &login).await.unwrap();
    let logged_in = client.recv_decrypted(&key).await.unwrap();
    assert_eq!(logged_in.kind, PacketType::LOGGED_IN);
    (id, key)
}

#[tokio::test]
async fn a_tampered_checksum_gets_data_error_not_data_sendok() {
    let addr = start_broker().await;
    let url = format!("ws://{addr}/ws");
    let mut client = MockWsClient::connect(&url).await.unwrap();
    let (id, key) = register_and_log_in(&mut client).await;

    let corrupted = Packet {
        sid: 1,
        kind: PacketType::DATA_SEND,
        to: Endpoint::new(ServerId::broker(), "system"),
        from: Endpoint::new(id.clone(), "chat"),
        data: Some(Data {
            payload: serde_json::json!({ "msg": "hi" }),
            timestamp: 0.0,
            checksum: "not-the-right-checksum".to_owned(),
        }),
    };
    client.send_encrypted(id.clone(), &key, &corrupted).await.unwrap();

    let reply = client.recv_decrypted(&key).await.unwrap();
    assert_eq!(reply.kind, PacketType::DATA_ERROR);
    assert_eq!(reply.sid, 1);

    // the connection is still open: a well-formed send afterwards still works.
    let payload = serde_json::json!({ "msg": "hi again" });
    let good = Packet {
        sid: 2,
        kind: PacketType::DATA_SEND,
        to: Endpoint::new(ServerId::broker(), "system"),
        from: Endpoint::new(id.clone(), "chat"),
        data: Some(Data {
            checksum: bus_codec::md5_hex(&payload),
            payload,
            timestamp: 0.0,
        }),
    };
    client.send_encrypted(id, &key, &good).await.unwrap();
    let reply2 = client.recv_decrypted(&key).await.unwrap();
    assert_eq!(reply2.kind, PacketType::DATA_SENDOK);
    assert_eq!(reply2.sid, 2);
}
