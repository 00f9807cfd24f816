//! Peer-side handshake state machine (§4.6 "Handshake"):
//!
//! ```text
//! no account persisted  -> register under the bootstrap key -> Registered
//! account persisted     -> login under the account key      -> LoggedIn
//! ```

use crate::error::PeerError;
use crate::transport::WsStream;
use bus_codec::Key;
use bus_protocol::{allocate, payloads, Endpoint, Frame, FrameData, Packet, PacketType, ServerId};
use futures_util::{SinkExt, StreamExt};
use tokio_tungstenite::tungstenite::protocol::Message;

pub enum HandshakeOutcome {
    Registered { id: ServerId, key: Key },
    LoggedIn { id: ServerId, key: Key },
}

/// Run whichever half of the handshake applies, given whatever account this
/// peer currently persists. `path` is the advisory `ServerInfo`/register
/// payload field the original calls `path` (§8 S1).
pub async fn perform(
    socket: &mut WsStream,
    account: Option<(ServerId, Key)>,
    bootstrap_key: Option<&Key>,
    path: &str,
) -> Result<HandshakeOutcome, PeerError> {
    match account {
        Some((id, key)) => login(socket, id, key).await,
        None => {
            let bootstrap_key = bootstrap_key.ok_or_else(|| {
                PeerError::Connect("no account persisted and no bootstrap key available to register".to_owned())
            })?;
            register(socket, bootstrap_key, path).await
        }
    }
}

async fn register(
    socket: &mut WsStream,
    bootstrap_key: &Key,
    path: &str,
) -> Result<HandshakeOutcome, PeerError> {
    let to = Endpoint::new(ServerId::broker(), "-----");
    let packet = allocate(
        PacketType::REGISTER,
        to.clone(),
        to,
        Some(serde_json::to_value(payloads::RegisterRequest { path: path.to_owned() }).expect("struct always serializes")),
        &[ServerId::broker()],
        |_| 0,
    )
    .remove(0)
    .1;

    send_encrypted(socket, ServerId::broker(), bootstrap_key, &packet).await?;

    let frame = recv_frame(socket).await?;
    let reply = extract_packet(frame, Some(bootstrap_key))?;
    match reply.kind {
        PacketType::REGISTERED => {
            let data = reply
                .data
                .ok_or_else(|| PeerError::MalformedFrame("registered packet carried no data".to_owned()))?;
            let body: payloads::RegisteredReply = serde_json::from_value(data.payload)
                .map_err(|e| PeerError::MalformedFrame(e.to_string()))?;
            let key = Key::from_text(&body.password)
                .map_err(|e| PeerError::MalformedFrame(e.to_string()))?;
            Ok(HandshakeOutcome::Registered {
                id: ServerId::from(body.id),
                key,
            })
        }
        PacketType::REGISTER_ERROR => {
            let reason = reply
                .data
                .and_then(|d| d.payload.get("error").and_then(|v| v.as_str()).map(str::to_owned))
                .unwrap_or_default();
            Err(PeerError::RegisterRejected(reason))
        }
        other => Err(PeerError::MalformedFrame(format!(
            "unexpected packet type during register: {other:?}"
        ))),
    }
}

async fn login(socket: &mut WsStream, id: ServerId, key: Key) -> Result<HandshakeOutcome, PeerError> {
    let to = Endpoint::new(ServerId::broker(), "system");
    let from = Endpoint::new(id.clone(), "system");
    let payload = payloads::LoginRequest {
        id: id.as_str().to_owned(),
        info: serde_json::json!({}),
    };
    let packet = allocate(
        PacketType::LOGIN,
        to,
        from,
        Some(serde_json::to_value(payload).expect("struct always serializes")),
        &[ServerId::broker()],
        |_| 0,
    )
    .remove(0)
    .1;

    send_encrypted(socket, id.clone(), &key, &packet).await?;

    let frame = recv_frame(socket).await?;
    let reply = extract_packet(frame, Some(&key))?;
    match reply.kind {
        PacketType::LOGGED_IN => Ok(HandshakeOutcome::LoggedIn { id, key }),
        PacketType::LOGIN_ERROR => Err(PeerError::LoginRejected),
        other => Err(PeerError::MalformedFrame(format!(
            "unexpected packet type during login: {other:?}"
        ))),
    }
}

pub async fn send_encrypted(
    socket: &mut WsStream,
    account: ServerId,
    key: &Key,
    packet: &Packet,
) -> Result<(), PeerError> {
    let bytes = serde_json::to_vec(packet).map_err(|e| PeerError::MalformedFrame(e.to_string()))?;
    let ciphertext = key.encrypt(&bytes);
    let frame = Frame::ciphertext(account, ciphertext);
    let json = serde_json::to_string(&frame).map_err(|e| PeerError::MalformedFrame(e.to_string()))?;
    socket.send(Message::Text(json.into())).await.map_err(PeerError::Ws)
}

async fn recv_frame(socket: &mut WsStream) -> Result<Frame, PeerError> {
    loop {
        match socket.next().await {
            Some(Ok(Message::Text(text))) => {
                return serde_json::from_str(&text)
                    .map_err(|e| PeerError::MalformedFrame(e.to_string()))
            }
            Some(Ok(Message::Ping(data))) => {
                let _ = socket.send(Message::Pong(data)).await;
            }
            Some(Ok(Message::Close(frame))) => {
                return Err(PeerError::ClosedByBroker(
                    frame.map(|f| f.reason.into_owned()).unwrap_or_default(),
                ))
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(PeerError::Ws(e)),
            None => return Err(PeerError::Disconnected),
        }
    }
}

/// The register handshake accepts either a plaintext `Packet` (what the
/// broker actually sends for `registered`) or ciphertext under `key`
/// (§4.4 "the receiver must accept both forms during the registration
/// handshake"). Post-login, `key` is always `Some` and ciphertext is
/// required in practice, but a plaintext reply is still decoded rather
/// than rejected — matching the broker's own leniency.
fn extract_packet(frame: Frame, key: Option<&Key>) -> Result<Packet, PeerError> {
    match frame.data {
        FrameData::Plain(packet) => Ok(*packet),
        FrameData::Ciphertext(ciphertext) => {
            let key = key.ok_or(PeerError::Decrypt)?;
            let plaintext = key.decrypt(&ciphertext).map_err(|_| PeerError::Decrypt)?;
            serde_json::from_slice(&plaintext).map_err(|e| PeerError::MalformedFrame(e.to_string()))
        }
    }
}
