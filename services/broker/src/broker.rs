//! The broker's connection handler (§4.5 "Routing", §5, §7).
//!
//! One task per connection, modeled on the sub-server forwarder's
//! accept-loop-plus-select idiom: a soft read timeout stands in for a
//! heartbeat deadline, and an `mpsc::Receiver<Message>` lets other tasks
//! (peer-to-peer forwarding, the resend timer) push frames onto this
//! connection without touching its socket directly.

use crate::error::BrokerError;
use crate::state::{BrokerState, ConnectionHandle};
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use bus_codec::Key;
use bus_protocol::{
    allocate, resolve_destinations, Endpoint, Frame, FrameData, Packet, PacketType, ServerId,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

const SOFT_READ_TIMEOUT: Duration = Duration::from_secs(4);

pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<BrokerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_connection(socket, state))
}

/// Per-connection identity established once `login` succeeds; absent before
/// then (the socket may also only ever do a `register` and disconnect).
struct Session {
    id: ServerId,
    key: Key,
}

async fn handle_connection(mut socket: WebSocket, state: Arc<BrokerState>) {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(64);
    let mut session: Option<Session> = None;

    loop {
        tokio::select! {
            incoming = tokio::time::timeout(SOFT_READ_TIMEOUT, socket.recv()) => {
                match incoming {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if let Err(close) = handle_frame(&state, &mut socket, &outbound_tx, &mut session, &text).await {
                            if let Some(reason) = close.close_reason() {
                                send_close(&mut socket, reason).await;
                            }
                            if !matches!(close, BrokerError::ChecksumMismatch | BrokerError::FileHashMismatch | BrokerError::UnknownTarget) {
                                break;
                            }
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Ok(Some(Ok(Message::Close(_)))) | Ok(None) => break,
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        tracing::warn!(error = %e, "websocket error");
                        break;
                    }
                    Err(_elapsed) => {}
                }
            }
            Some(msg) = outbound_rx.recv() => {
                if socket.send(msg).await.is_err() {
                    break;
                }
            }
        }
    }

    if let Some(session) = session {
        cleanup_session(&state, &session.id).await;
    }
}

async fn send_close(socket: &mut WebSocket, reason: &str) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: 1008,
            reason: reason.into(),
        })))
        .await;
}

async fn cleanup_session(state: &Arc<BrokerState>, id: &ServerId) {
    state.connections.write().await.remove(id);
    tracing::info!(peer = %id, "peer disconnected");

    let remaining = state.known_peers().await;
    let destinations = resolve_destinations(&ServerId::all(), &remaining, &[]);
    let payload = json!({ "id": id.as_str(), "servers": remaining.iter().map(ServerId::as_str).collect::<Vec<_>>() });
    for dest in destinations {
        let sid = state.history.write().await.next_sid(&dest);
        let packet = single_dest_packet(PacketType::DEL_LOGIN, &dest, "system", ServerId::broker(), "system", sid, Some(payload.clone()));
        state.history.write().await.append(&dest, packet.clone());
        deliver(state, &dest, packet).await;
    }

    state.plugins.dispatch_logout_set(remaining).await;
    state.plugins.dispatch_disconnected().await;
}

fn single_dest_packet(
    kind: PacketType,
    dest: &ServerId,
    to_plugin: impl Into<bus_protocol::PluginId>,
    from_id: impl Into<ServerId>,
    from_plugin: impl Into<bus_protocol::PluginId>,
    sid: i64,
    payload: Option<serde_json::Value>,
) -> Packet {
    let to = Endpoint::new(dest.clone(), to_plugin);
    let from = Endpoint::new(from_id, from_plugin);
    allocate(kind, to, from, payload, &[dest.clone()], |_| sid)
        .remove(0)
        .1
}

/// Encrypt `packet` under `key` and push it onto `dest`'s connection, if any.
/// Returns whether it was delivered (absent peers are logged, not an error,
/// per "send to absent peer: locally logged, no packet emitted").
async fn deliver(state: &Arc<BrokerState>, dest: &ServerId, packet: Packet) -> bool {
    let Some(key) = state.accounts.key_for(dest).await else {
        tracing::debug!(peer = %dest, "no account key, cannot deliver");
        return false;
    };
    let ciphertext = match serde_json::to_vec(&packet) {
        Ok(bytes) => key.encrypt(&bytes),
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize outbound packet");
            return false;
        }
    };
    let frame = Frame::ciphertext(dest.clone(), ciphertext);
    let json = match serde_json::to_string(&frame) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize outbound frame");
            return false;
        }
    };
    let delivered = state.send_to(dest, Message::Text(json.into())).await;
    if !delivered {
        tracing::info!(peer = %dest, kind = ?packet.kind, "peer not connected, packet held in history only");
    }
    delivered
}

async fn handle_frame(
    state: &Arc<BrokerState>,
    socket: &mut WebSocket,
    outbound_tx: &mpsc::Sender<Message>,
    session: &mut Option<Session>,
    text: &str,
) -> Result<(), BrokerError> {
    let frame: Frame =
        serde_json::from_str(text).map_err(|e| BrokerError::MalformedFrame(e.to_string()))?;

    let packet = if frame.account.is_broker() {
        match frame.data {
            FrameData::Plain(packet) => *packet,
            FrameData::Ciphertext(ct) => {
                let key = state.bootstrap_key.current();
                let plaintext = key.decrypt(&ct).map_err(|_| BrokerError::Decrypt)?;
                serde_json::from_slice(&plaintext)
                    .map_err(|e| BrokerError::MalformedFrame(e.to_string()))?
            }
        }
    } else {
        let account_key = state
            .accounts
            .key_for(&frame.account)
            .await
            .ok_or(BrokerError::UnknownAccount)?;
        let FrameData::Ciphertext(ct) = frame.data else {
            return Err(BrokerError::MalformedFrame(
                "plaintext frame outside the register handshake".to_owned(),
            ));
        };
        let plaintext = account_key.decrypt(&ct).map_err(|_| BrokerError::Decrypt)?;
        serde_json::from_slice(&plaintext).map_err(|e| BrokerError::MalformedFrame(e.to_string()))?
    };

    match packet.kind {
        PacketType::REGISTER => handle_register(state, socket).await,
        PacketType::LOGIN => {
            handle_login(state, socket, outbound_tx, session, frame.account, packet).await
        }
        _ if session.is_some() => {
            let session = session.as_ref().expect("checked is_some");
            handle_authenticated(state, session, packet).await
        }
        _ => Err(BrokerError::MalformedFrame(
            "packet received before login".to_owned(),
        )),
    }
}

async fn handle_register(
    state: &Arc<BrokerState>,
    socket: &mut WebSocket,
) -> Result<(), BrokerError> {
    match state.accounts.register_new().await {
        Ok((id, key)) => {
            tracing::info!(peer = %id, "registered new account");
            let payload = json!({ "id": id.as_str(), "password": key.as_text() });
            let packet = single_dest_packet(
                PacketType::REGISTERED,
                &id,
                "system",
                ServerId::broker(),
                "system",
                0,
                Some(payload),
            );
            let frame = Frame::plain(ServerId::broker(), packet);
            let json = serde_json::to_string(&frame)
                .map_err(|e| BrokerError::Internal(e.to_string()))?;
            let _ = socket.send(Message::Text(json.into())).await;
            Ok(())
        }
        Err(e) => {
            tracing::error!(error = %e, "register failed to persist");
            Err(BrokerError::Internal(e.to_string()))
        }
    }
}

async fn handle_login(
    state: &Arc<BrokerState>,
    socket: &mut WebSocket,
    outbound_tx: &mpsc::Sender<Message>,
    session: &mut Option<Session>,
    account_id: ServerId,
    packet: Packet,
) -> Result<(), BrokerError> {
    let key = state
        .accounts
        .key_for(&account_id)
        .await
        .ok_or(BrokerError::UnknownAccount)?;

    state.recv_history.write().await.record_recv(&account_id, packet);

    if state.is_connected(&account_id).await {
        tracing::warn!(peer = %account_id, "rejecting duplicate login");
        let error_packet = single_dest_packet(
            PacketType::LOGIN_ERROR,
            &account_id,
            "system",
            ServerId::broker(),
            "system",
            -1,
            Some(json!({ "error": "401" })),
        );
        let ciphertext = key.encrypt(
            &serde_json::to_vec(&error_packet).map_err(|e| BrokerError::Internal(e.to_string()))?,
        );
        let frame = Frame::ciphertext(account_id.clone(), ciphertext);
        if let Ok(json) = serde_json::to_string(&frame) {
            let _ = socket.send(Message::Text(json.into())).await;
        }
        state.recv_history.write().await.truncate_recv(&account_id, 2);
        return Err(BrokerError::DuplicateLogin);
    }

    let server_info = packet
        .data
        .as_ref()
        .map(|d| d.payload.get("info").cloned().unwrap_or(serde_json::Value::Null))
        .unwrap_or(serde_json::Value::Null);

    state.connections.write().await.insert(
        account_id.clone(),
        ConnectionHandle {
            outbound: outbound_tx.clone(),
            server_info,
        },
    );

    let logged_in = single_dest_packet(
        PacketType::LOGGED_IN,
        &account_id,
        "system",
        ServerId::broker(),
        "system",
        -1,
        None,
    );
    let ciphertext = key.encrypt(
        &serde_json::to_vec(&logged_in).map_err(|e| BrokerError::Internal(e.to_string()))?,
    );
    let frame = Frame::ciphertext(account_id.clone(), ciphertext);
    if let Ok(json) = serde_json::to_string(&frame) {
        let _ = socket.send(Message::Text(json.into())).await;
    }

    tracing::info!(peer = %account_id, "logged in");
    *session = Some(Session { id: account_id.clone(), key });

    let known = state.known_peers().await;
    let destinations = resolve_destinations(&ServerId::all(), &known, &[account_id.clone()]);
    let payload = json!({ "id": account_id.as_str(), "servers": known.iter().map(ServerId::as_str).collect::<Vec<_>>() });
    for dest in destinations {
        let sid = state.history.write().await.next_sid(&dest);
        let notice = single_dest_packet(PacketType::NEW_LOGIN, &dest, "system", ServerId::broker(), "system", sid, Some(payload.clone()));
        state.history.write().await.append(&dest, notice.clone());
        deliver(state, &dest, notice).await;
    }

    state.plugins.dispatch_login_set(known).await;
    state.plugins.dispatch_connected().await;
    Ok(())
}

async fn handle_authenticated(
    state: &Arc<BrokerState>,
    session: &Session,
    packet: Packet,
) -> Result<(), BrokerError> {
    state.recv_history.write().await.record_recv(&session.id, packet.clone());

    match packet.kind {
        PacketType::PING => handle_ping(state, session, packet).await,
        PacketType::DATA_SEND => handle_data_send(state, session, packet).await,
        PacketType::DATA_SENDOK => {
            handle_ack(state, &session.id, packet.sid).await;
            Ok(())
        }
        PacketType::DATA_ERROR => {
            handle_retransmit(state, &session.id, packet.sid).await;
            Ok(())
        }
        PacketType::FILE_BEGIN | PacketType::FILE_CHUNK | PacketType::FILE_END | PacketType::FILE_ERROR => {
            handle_file_relay(state, session, packet).await
        }
        PacketType::CONTROL_STOP
        | PacketType::CONTROL_RELOAD
        | PacketType::CONTROL_MAINTENANCE
        | PacketType::CONTROL_RESUME => handle_forward(state, session, packet).await,
        PacketType::TEST_CONNECT => {
            tracing::debug!(peer = %session.id, "probe received");
            Ok(())
        }
        other => {
            tracing::warn!(peer = %session.id, kind = ?other, "unhandled packet type, dropping");
            Ok(())
        }
    }
}

async fn handle_ping(state: &Arc<BrokerState>, session: &Session, packet: Packet) -> Result<(), BrokerError> {
    let since_sid = packet.sid;
    let replay = state.history.read().await.history_from(&session.id, since_sid);
    for queued in replay {
        deliver(state, &session.id, queued).await;
    }
    let pong = single_dest_packet(PacketType::PONG, &session.id, "system", ServerId::broker(), "system", -1, None);
    deliver(state, &session.id, pong).await;
    Ok(())
}

async fn handle_ack(state: &Arc<BrokerState>, peer: &ServerId, acked_sid: i64) {
    let mut last_sent = state.last_sent.write().await;
    if last_sent.get(peer).is_some_and(|p| p.sid == acked_sid) {
        last_sent.remove(peer);
    }
}

async fn handle_retransmit(state: &Arc<BrokerState>, peer: &ServerId, reported_sid: i64) {
    let held = state.last_sent.read().await.get(peer).cloned();
    if let Some(packet) = held {
        if packet.sid == reported_sid {
            deliver(state, peer, packet).await;
        }
    }
}

async fn handle_data_send(state: &Arc<BrokerState>, session: &Session, packet: Packet) -> Result<(), BrokerError> {
    if let Some(data) = &packet.data {
        if !bus_codec::verify_md5(&data.payload, &data.checksum) {
            let error_packet = single_dest_packet(
                PacketType::DATA_ERROR,
                &session.id,
                packet.from.plugin_id().clone(),
                ServerId::broker(),
                "system",
                packet.sid,
                Some(json!({ "error": "checksum mismatch" })),
            );
            deliver(state, &session.id, error_packet).await;
            return Err(BrokerError::ChecksumMismatch);
        }
    }

    let ack = single_dest_packet(
        PacketType::DATA_SENDOK,
        &session.id,
        packet.from.plugin_id().clone(),
        ServerId::broker(),
        "system",
        packet.sid,
        None,
    );
    deliver(state, &session.id, ack).await;

    let payload = packet.data.as_ref().map(|d| d.payload.clone());
    if packet.to.server_id().is_broker() || packet.to.server_id().is_all() {
        state
            .plugins
            .dispatch_data(packet.to.plugin_id(), &session.id, payload.clone().unwrap_or(serde_json::Value::Null))
            .await;
    }

    let known = state.known_peers().await;
    let destinations = resolve_destinations(packet.to.server_id(), &known, &[session.id.clone()]);
    for dest in destinations {
        if dest.is_broker() {
            continue;
        }
        let sid = state.history.write().await.next_sid(&dest);
        let forwarded = Endpoint::new(dest.clone(), packet.to.plugin_id().clone());
        let built = allocate(PacketType::DATA_SEND, forwarded, packet.from.clone(), payload.clone(), &[dest.clone()], |_| sid)
            .remove(0)
            .1;
        state.history.write().await.append(&dest, built.clone());
        state.last_sent.write().await.insert(dest.clone(), built.clone());
        deliver(state, &dest, built).await;
    }
    Ok(())
}

async fn handle_forward(state: &Arc<BrokerState>, session: &Session, packet: Packet) -> Result<(), BrokerError> {
    let known = state.known_peers().await;
    let destinations = resolve_destinations(packet.to.server_id(), &known, &[session.id.clone()]);
    let payload = packet.data.as_ref().map(|d| d.payload.clone());
    for dest in destinations {
        if dest.is_broker() {
            continue;
        }
        let sid = state.history.write().await.next_sid(&dest);
        let forwarded = Endpoint::new(dest.clone(), packet.to.plugin_id().clone());
        let built = allocate(packet.kind, forwarded, packet.from.clone(), payload.clone(), &[dest.clone()], |_| sid)
            .remove(0)
            .1;
        state.history.write().await.append(&dest, built.clone());
        deliver(state, &dest, built).await;
    }
    Ok(())
}

async fn handle_file_relay(state: &Arc<BrokerState>, session: &Session, packet: Packet) -> Result<(), BrokerError> {
    let known = state.known_peers().await;
    let destinations = resolve_destinations(packet.to.server_id(), &known, &[session.id.clone()]);
    let payload = packet.data.as_ref().map(|d| d.payload.clone());

    for dest in destinations {
        if dest.is_broker() {
            if let Err(e) = relay_into_local_sink(state, &session.id, packet.kind, &packet).await {
                tracing::warn!(peer = %session.id, error = %e, "local file sink error");
                let error_packet = single_dest_packet(
                    PacketType::FILE_ERROR,
                    &session.id,
                    packet.to.plugin_id().clone(),
                    ServerId::broker(),
                    "system",
                    packet.sid,
                    Some(json!({ "error": e.to_string() })),
                );
                deliver(state, &session.id, error_packet).await;
                return Err(BrokerError::FileHashMismatch);
            }
            continue;
        }
        let sid = state.history.write().await.next_sid(&dest);
        let forwarded = Endpoint::new(dest.clone(), packet.to.plugin_id().clone());
        let built = allocate(packet.kind, forwarded, packet.from.clone(), payload.clone(), &[dest.clone()], |_| sid)
            .remove(0)
            .1;
        state.history.write().await.append(&dest, built.clone());
        deliver(state, &dest, built).await;
    }
    Ok(())
}

async fn relay_into_local_sink(
    state: &Arc<BrokerState>,
    sender: &ServerId,
    kind: PacketType,
    packet: &Packet,
) -> Result<(), crate::file_relay::FileSinkError> {
    use crate::file_relay::FileSink;
    let Some(data) = &packet.data else {
        return Ok(());
    };

    match kind {
        PacketType::FILE_BEGIN => {
            let begin: bus_protocol::payloads::FileBegin =
                serde_json::from_value(data.payload.clone()).unwrap_or(bus_protocol::payloads::FileBegin {
                    file_name: "unnamed".to_owned(),
                    save_path: "received.bin".to_owned(),
                    hash: String::new(),
                });
            let sink = FileSink::open(begin.save_path.clone().into(), begin.hash).await?;
            state.file_assembly.lock().await.insert(sender.clone(), sink);
        }
        PacketType::FILE_CHUNK => {
            let chunk: bus_protocol::payloads::FileChunk = match serde_json::from_value(data.payload.clone()) {
                Ok(c) => c,
                Err(_) => return Ok(()),
            };
            let mut assembly = state.file_assembly.lock().await;
            if let Some(sink) = assembly.get_mut(sender) {
                sink.write_chunk(chunk.index, &chunk.hex_bytes).await?;
            }
        }
        PacketType::FILE_END => {
            let sink = state.file_assembly.lock().await.remove(sender);
            if let Some(sink) = sink {
                let path = sink.save_path.clone();
                sink.finish().await?;
                state
                    .plugins
                    .dispatch_file(packet.to.plugin_id(), sender, &path)
                    .await;
            }
        }
        PacketType::FILE_ERROR => {
            state.file_assembly.lock().await.remove(sender);
        }
        _ => {}
    }
    Ok(())
}
