//! S5 — Duplicate login (§8): a second connection logging in as an already
//! online `ServerId` is rejected with `login-error`/`1008 reason="401"`
//! while the original session is left completely unaffected and no
//! `del-login` is broadcast for the rejected attempt.

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

async fn register(client: &mut MockWsClient) -> (ServerId, bus_codec::Key) {
    let register = Packet {
        sid: 0,
        kind: PacketType::REGISTER,
        to: Endpoint::new(ServerId::broker(), "-----"),
        from: Endpoint::new(ServerId::broker(), "-----"),
        data: None,
    };
    client.send_plain(ServerId::broker(), register).await.unwrap();
    let registered = client.recv_frame().await.unwrap();
    match registered.data {
        bus_protocol::FrameData::Plain(packet) => {
            let payload = &packet.data.as_ref().unwrap().payload;
            let id = ServerId::from(payload["id"].as_str().unwrap());
            let key = bus_codec::Key::from_text(payload["password"].as_str().unwrap()).unwrap();
            (id, key)
        }
        bus_protocol::FrameData::Ciphertext(_) => panic!("expected plaintext registered reply"),
    }
}

fn login_packet(id: &ServerId) -> Packet {
    Packet {
        sid: 0,
        kind: PacketType::LOGIN,
        to: Endpoint::new(ServerId::broker(), "system"),
        from: Endpoint::new(id.clone(), "system"),
        data: Some(Data {
            payload: serde_json::json!({ "id": id.as_str() }),
            timestamp: 0.0,
            checksum: String::new(),
        }),
    }
}

#[tokio::test]
async fn second_login_as_the_same_account_is_rejected_and_first_session_survives() {
    let addr = start_broker().await;
    let url = format!("ws://{addr}/ws");

    let mut original = MockWsClient::connect(&url).await.unwrap();
    let (id, key) = register(&mut original).await;
    original.send_encrypted(id.clone(), &key, &login_packet(&id)).await.unwrap();
    let logged_in = original.recv_decrypted(&key).await.unwrap();
    assert_eq!(logged_in.kind, PacketType::LOGGED_IN);

    // A second socket attempts to log in as the very same account.
    let mut impostor = MockWsClient::connect(&url).await.unwrap();
    impostor.send_encrypted(id.clone(), &key, &login_packet(&id)).await.unwrap();
    let error = impostor.recv_decrypted(&key).await.unwrap();
    assert_eq!(error.kind, PacketType::LOGIN_ERROR);
    let body: bus_protocol::payloads::LoginError =
        serde_json::from_value(error.data.unwrap().payload).unwrap();
    assert_eq!(body.error, "401");

    let close = impostor.recv_frame().await;
    assert!(close.is_err(), "broker must close the impostor connection");

    // The original session is unaffected: a plain data-send still round-trips.
    let payload = serde_json::json!({ "msg": "still here" });
    let send = Packet {
        sid: 1,
        kind: PacketType::DATA_SEND,
        to: Endpoint::new(ServerId::broker(), "system"),
        from: Endpoint::new(id.clone(), "chat"),
        data: Some(Data {
            checksum: bus_codec::md5_hex(&payload),
            payload,
            timestamp: 0.0,
        }),
    };
    original.send_encrypted(id, &key, &send).await.unwrap();
    let ack = original.recv_decrypted(&key).await.unwrap();
    assert_eq!(ack.kind, PacketType::DATA_SENDOK);
    assert_eq!(ack.sid, 1);
}
