//! A minimal mock broker for exercising `services/peer` in isolation: it
//! speaks just enough of the handshake + data-ack protocol (§4.5) for peer
//! integration tests, without importing `services/broker` itself.

use bus_codec::Key;
use bus_protocol::{Endpoint, Frame, FrameData, Packet, PacketType, ServerId};
use futures_util::{SinkExt, StreamExt};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::protocol::Message;

/// A mock broker for integration testing, bound to a random port.
pub struct MockBrokerServer {
    addr: SocketAddr,
    bootstrap_key: Key,
    _task: tokio::task::JoinHandle<()>,
}

impl MockBrokerServer {
    /// Start the mock broker. `account_key` is handed out to every
    /// registering peer and also accepted for every subsequent login,
    /// which is enough fidelity for single-peer handshake/keepalive tests.
    pub async fn start() -> Result<Self, Box<dyn std::error::Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;
        let bootstrap_key = Key::generate();
        let account_key = Key::generate();
        let known_accounts: Arc<Mutex<Vec<ServerId>>> = Arc::new(Mutex::new(Vec::new()));

        let task_key = account_key.clone();
        let task = tokio::spawn(async move {
            Self::accept_loop(listener, task_key, known_accounts).await;
        });

        Ok(Self {
            addr,
            bootstrap_key,
            _task: task,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn bootstrap_key(&self) -> &Key {
        &self.bootstrap_key
    }

    async fn accept_loop(listener: TcpListener, account_key: Key, known: Arc<Mutex<Vec<ServerId>>>) {
        loop {
            match listener.accept().await {
                Ok((stream, _peer)) => {
                    let key = account_key.clone();
                    let known = known.clone();
                    tokio::spawn(async move {
                        let _ = Self::handle_connection(stream, key, known).await;
                    });
                }
                Err(_) => break,
            }
        }
    }

    async fn handle_connection(
        stream: tokio::net::TcpStream,
        account_key: Key,
        known: Arc<Mutex<Vec<ServerId>>>,
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let ws_stream = tokio_tungstenite::accept_async(stream).await?;
        let (mut write, mut read) = ws_stream.split();
        let mut assigned_id: Option<ServerId> = None;
        let mut last_sid: i64 = 0;

        while let Some(msg_result) = read.next().await {
            let msg = msg_result?;
            let text = match msg {
                Message::Text(t) => t,
                Message::Close(_) => break,
                Message::Ping(data) => {
                    write.send(Message::Pong(data)).await?;
                    continue;
                }
                _ => continue,
            };

            let frame: Frame = serde_json::from_str(&text)?;
            let packet = match frame.data {
                FrameData::Plain(packet) => *packet,
                FrameData::Ciphertext(ciphertext) => {
                    let plaintext = account_key.decrypt(&ciphertext)?;
                    serde_json::from_slice(&plaintext)?
                }
            };

            match packet.kind {
                PacketType::REGISTER => {
                    let id = ServerId::from("A1b2C");
                    known.lock().await.push(id.clone());
                    let reply = Packet {
                        sid: 0,
                        kind: PacketType::REGISTERED,
                        to: Endpoint::new(id.clone(), "system"),
                        from: Endpoint::new(ServerId::broker(), "system"),
                        data: Some(bus_protocol::Data {
                            payload: serde_json::json!({
                                "id": id.as_str(),
                                "password": account_key.as_text(),
                            }),
                            timestamp: 0.0,
                            checksum: String::new(),
                        }),
                    };
                    let json = serde_json::to_string(&Frame::plain(ServerId::broker(), reply))?;
                    write.send(Message::Text(json.into())).await?;
                }
                PacketType::LOGIN => {
                    assigned_id = Some(frame.account.clone());
                    last_sid = 0;
                    let reply = Packet {
                        sid: 0,
                        kind: PacketType::LOGGED_IN,
                        to: Endpoint::new(frame.account.clone(), "system"),
                        from: Endpoint::new(ServerId::broker(), "system"),
                        data: None,
                    };
                    let ciphertext = account_key.encrypt(&serde_json::to_vec(&reply)?);
                    let json =
                        serde_json::to_string(&Frame::ciphertext(ServerId::broker(), ciphertext))?;
                    write.send(Message::Text(json.into())).await?;
                }
                PacketType::DATA_SEND => {
                    last_sid += 1;
                    let reply = Packet {
                        sid: last_sid,
                        kind: PacketType::DATA_SENDOK,
                        to: packet.from.clone(),
                        from: Endpoint::new(ServerId::broker(), "system"),
                        data: None,
                    };
                    let ciphertext = account_key.encrypt(&serde_json::to_vec(&reply)?);
                    let json =
                        serde_json::to_string(&Frame::ciphertext(ServerId::broker(), ciphertext))?;
                    write.send(Message::Text(json.into())).await?;
                }
                PacketType::PING => {
                    let reply = Packet {
                        sid: -1,
                        kind: PacketType::PONG,
                        to: packet.from.clone(),
                        from: Endpoint::new(ServerId::broker(), "system"),
                        data: None,
                    };
                    let ciphertext = account_key.encrypt(&serde_json::to_vec(&reply)?);
                    let json =
                        serde_json::to_string(&Frame::ciphertext(ServerId::broker(), ciphertext))?;
                    write.send(Message::Text(json.into())).await?;
                }
                _ => {}
            }
            let _ = &assigned_id;
        }

        Ok(())
    }
}
