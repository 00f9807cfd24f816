//! The peer's connection runtime (§4.6): dial/reconnect, keepalive, outbound
//! ordering, inbound dispatch. One [`connection_loop`] runs per live socket;
//! [`PeerRuntime::run`] is the outer dial loop that restarts it.

use crate::close_reason;
use crate::error::PeerError;
use crate::handshake::{self, HandshakeOutcome};
use crate::state::{PeerState, QueuedSend};
use crate::transport::{self, WsStream};
use bus_codec::Key;
use bus_protocol::{allocate, payloads, Endpoint, Frame, FrameData, Packet, PacketType, PluginId, ServerId};
use futures_util::{SinkExt, StreamExt};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

const SOFT_READ_TIMEOUT: Duration = Duration::from_secs(4);
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(30);

pub struct PeerRuntime {
    state: Arc<PeerState>,
}

enum ConnectionOutcome {
    Reconnect,
    Stop,
}

impl PeerRuntime {
    pub fn new(state: Arc<PeerState>) -> Self {
        PeerRuntime { state }
    }

    /// The outer dial loop (§4.6 "Peer-side dial"): dial, handshake, then
    /// either restart (after a fresh register) or run the connection until
    /// it drops, redialing unless the drop was a permanent duplicate-login
    /// close.
    pub async fn run(&self, url: String, path: String, cancel: CancellationToken) {
        loop {
            if cancel.is_cancelled() {
                break;
            }

            let Some(mut socket) = transport::dial_with_retry(&url, &cancel).await else {
                break;
            };

            let (account, bootstrap_key) = load_credentials(&self.state).await;
            match handshake::perform(&mut socket, account, bootstrap_key.as_ref(), &path).await {
                Ok(HandshakeOutcome::Registered { id, key }) => {
                    if let Err(e) = persist_account(&self.state, &id, &key).await {
                        tracing::error!(error = %e, "failed to persist newly registered account");
                    }
                    tracing::info!(peer = %id, "registered, reconnecting to log in");
                    let _ = socket.close(None).await;
                }
                Ok(HandshakeOutcome::LoggedIn { id, key }) => {
                    tracing::info!(peer = %id, "logged in");
                    self.state.set_account(id.clone(), key.clone()).await;
                    match connection_loop(socket, self.state.clone(), id, key, cancel.clone()).await {
                        ConnectionOutcome::Stop => break,
                        ConnectionOutcome::Reconnect => {}
                    }
                }
                Err(PeerError::LoginRejected) => {
                    tracing::error!("broker rejected login as already logged in, stopping permanently");
                    break;
                }
                Err(PeerError::ClosedByBroker(reason)) if reason.contains("401") => {
                    tracing::error!(reason = %reason, "broker closed the handshake as already logged in, stopping permanently");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "handshake failed, will redial");
                }
            }
        }
    }
}

async fn load_credentials(state: &PeerState) -> (Option<(ServerId, Key)>, Option<Key>) {
    if let Some((id, key)) = state.account().await {
        return (Some((id, key)), None);
    }
    let account = state.config.get("account").await.and_then(|v| v.as_str().map(str::to_owned));
    let password = state.config.get("password").await.and_then(|v| v.as_str().map(str::to_owned));
    match (account, password) {
        (Some(id), Some(pw)) => match Key::from_text(&pw) {
            Ok(key) => (Some((ServerId::from(id), key)), None),
            Err(_) => (None, None),
        },
        (None, Some(pw)) => (None, Key::from_text(&pw).ok()),
        _ => (None, None),
    }
}

async fn persist_account(state: &PeerState, id: &ServerId, key: &Key) -> Result<(), PeerError> {
    state.config.set("account", json!(id.as_str())).await?;
    state.config.set("password", json!(key.as_text())).await?;
    Ok(())
}

/// Run one live connection to completion (§4.6 "Keepalive", "Inbound
/// dispatch"). Returns whether the outer loop should redial.
async fn connection_loop(
    mut socket: WsStream,
    state: Arc<PeerState>,
    id: ServerId,
    key: Key,
    cancel: CancellationToken,
) -> ConnectionOutcome {
    let (outbound_tx, mut outbound_rx) = mpsc::channel::<Message>(64);
    state.set_outbound(outbound_tx).await;
    state.plugins.dispatch_connected().await;

    let mut keepalive = tokio::time::interval(KEEPALIVE_INTERVAL);
    keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    keepalive.tick().await;

    let outcome = loop {
        tokio::select! {
            () = cancel.cancelled() => break ConnectionOutcome::Stop,
            _ = keepalive.tick() => {
                run_keepalive(&state, &id, &key).await;
            }
            Some(msg) = outbound_rx.recv() => {
                if socket.send(msg).await.is_err() {
                    break ConnectionOutcome::Reconnect;
                }
            }
            incoming = tokio::time::timeout(SOFT_READ_TIMEOUT, socket.next()) => {
                match incoming {
                    Ok(Some(Ok(Message::Text(text)))) => {
                        if let Err(reason) = handle_incoming_text(&state, &key, &text).await {
                            let _ = socket.send(Message::Close(Some(CloseFrame {
                                code: CloseCode::Policy,
                                reason: reason.into(),
                            }))).await;
                            break ConnectionOutcome::Reconnect;
                        }
                    }
                    Ok(Some(Ok(Message::Ping(data)))) => {
                        let _ = socket.send(Message::Pong(data)).await;
                    }
                    Ok(Some(Ok(Message::Close(frame)))) => {
                        break if close_reason::is_duplicate_login_close(frame.as_ref()) {
                            ConnectionOutcome::Stop
                        } else {
                            ConnectionOutcome::Reconnect
                        };
                    }
                    Ok(Some(Ok(_))) => {}
                    Ok(Some(Err(e))) => {
                        tracing::warn!(error = %e, "websocket error");
                        break ConnectionOutcome::Reconnect;
                    }
                    Ok(None) => break ConnectionOutcome::Reconnect,
                    Err(_elapsed) => {}
                }
            }
        }
    };

    state.clear_outbound().await;
    state.plugins.dispatch_disconnected().await;
    outcome
}

async fn run_keepalive(state: &PeerState, id: &ServerId, key: &Key) {
    let held = state.last_sent.lock().await.clone();
    if let Some(packet) = held {
        send_packet(state, key, &packet).await;
    }
    let to = Endpoint::new(ServerId::broker(), "system");
    let from = Endpoint::new(id.clone(), "system");
    let since = state.last_received_sid();
    let ping = allocate(PacketType::PING, to, from, None, &[ServerId::broker()], |_| since)
        .remove(0)
        .1;
    send_packet(state, key, &ping).await;
}

async fn handle_incoming_text(state: &PeerState, key: &Key, text: &str) -> Result<(), &'static str> {
    let frame: Frame = serde_json::from_str(text).map_err(|_| "400")?;
    let FrameData::Ciphertext(ciphertext) = frame.data else {
        return Err("400");
    };
    let plaintext = key.decrypt(&ciphertext).map_err(|_| "400")?;
    let packet: Packet = serde_json::from_slice(&plaintext).map_err(|_| "400")?;

    if is_channel_advancing(packet.kind) {
        state.observe_channel_sid(packet.sid);
    }

    dispatch_packet(state, key, packet).await;
    Ok(())
}

/// Only genuinely forwarded/broadcast packets get a freshly allocated
/// channel sid on the broker side; acks and errors (`data-sendok`,
/// `data-error`, `file-error`) echo the original sender's sid purely for
/// correlation and must not move the replay cursor (§4.2 "Tie-breaks").
fn is_channel_advancing(kind: PacketType) -> bool {
    kind.is_sequenced()
        && !matches!(
            kind,
            PacketType::DATA_SENDOK | PacketType::DATA_ERROR | PacketType::FILE_ERROR
        )
}

async fn dispatch_packet(state: &PeerState, key: &Key, packet: Packet) {
    let Some((my_id, _)) = state.account().await else {
        return;
    };

    match packet.kind {
        PacketType::NEW_LOGIN => {
            if let Some(servers) = membership(&packet) {
                state.plugins.dispatch_login_set(servers).await;
            }
        }
        PacketType::DEL_LOGIN => {
            if let Some(servers) = membership(&packet) {
                state.plugins.dispatch_logout_set(servers).await;
            }
        }
        PacketType::DATA_SEND => handle_data_send(state, key, &my_id, packet).await,
        PacketType::DATA_SENDOK => handle_data_sendok(state, key, &my_id, packet.sid).await,
        PacketType::DATA_ERROR => handle_data_error(state, key, packet.sid).await,
        PacketType::FILE_BEGIN | PacketType::FILE_CHUNK | PacketType::FILE_END | PacketType::FILE_ERROR => {
            crate::file_assembly::dispatch(state, packet).await;
        }
        PacketType::CONTROL_STOP
        | PacketType::CONTROL_RELOAD
        | PacketType::CONTROL_MAINTENANCE
        | PacketType::CONTROL_RESUME => {
            let label = control_label(packet.kind);
            let payload = packet
                .data
                .as_ref()
                .map(|d| d.payload.clone())
                .unwrap_or_else(|| json!({ "control": label }));
            state
                .plugins
                .dispatch_data(&PluginId::system(), packet.from.server_id(), payload)
                .await;
        }
        PacketType::PONG | PacketType::TEST_CONNECT => {
            tracing::debug!(kind = ?packet.kind, "keepalive/probe acknowledged");
        }
        other => {
            tracing::warn!(kind = ?other, "unhandled packet type, dropping");
        }
    }
}

fn membership(packet: &Packet) -> Option<Vec<ServerId>> {
    let data = packet.data.as_ref()?;
    let change: payloads::MembershipChange = serde_json::from_value(data.payload.clone()).ok()?;
    Some(change.servers.into_iter().map(ServerId::from).collect())
}

fn control_label(kind: PacketType) -> &'static str {
    match kind {
        PacketType::CONTROL_STOP => "stop",
        PacketType::CONTROL_RELOAD => "reload",
        PacketType::CONTROL_MAINTENANCE => "maintenance",
        PacketType::CONTROL_RESUME => "resume",
        _ => "unknown",
    }
}

async fn handle_data_send(state: &PeerState, key: &Key, my_id: &ServerId, packet: Packet) {
    if let Some(data) = &packet.data {
        if !bus_codec::verify_md5(&data.payload, &data.checksum) {
            let error_packet = ack_packet(
                PacketType::DATA_ERROR,
                packet.sid,
                my_id,
                Some(json!({ "error": "checksum mismatch" })),
            );
            send_packet(state, key, &error_packet).await;
            return;
        }
    }

    let ack = ack_packet(PacketType::DATA_SENDOK, packet.sid, my_id, None);
    send_packet(state, key, &ack).await;

    let payload = packet.data.as_ref().map(|d| d.payload.clone()).unwrap_or(Value::Null);
    state
        .plugins
        .dispatch_data(packet.to.plugin_id(), packet.from.server_id(), payload)
        .await;
}

async fn handle_data_sendok(state: &PeerState, key: &Key, my_id: &ServerId, acked_sid: i64) {
    let mut last_sent = state.last_sent.lock().await;
    let matches_inflight = last_sent.as_ref().is_some_and(|p| p.sid == acked_sid);
    if !matches_inflight {
        return;
    }
    *last_sent = None;
    drop(last_sent);
    advance_send_queue(state, key, my_id).await;
}

async fn handle_data_error(state: &PeerState, key: &Key, reported_sid: i64) {
    let held = state.last_sent.lock().await.clone();
    if let Some(packet) = held {
        if packet.sid == reported_sid {
            send_packet(state, key, &packet).await;
        }
    }
}

async fn advance_send_queue(state: &PeerState, key: &Key, my_id: &ServerId) {
    let next = state.send_queue.lock().await.pop_front();
    if let Some(queued) = next {
        dispatch_send(state, key, my_id, queued).await;
    }
}

fn ack_packet(kind: PacketType, sid: i64, my_id: &ServerId, payload: Option<Value>) -> Packet {
    let to = Endpoint::new(ServerId::broker(), "system");
    let from = Endpoint::new(my_id.clone(), "system");
    allocate(kind, to, from, payload, &[ServerId::broker()], |_| sid)
        .remove(0)
        .1
}

/// Build, store, and transmit one `data-send` packet (§4.6 "Outbound
/// ordering"). Channel sid bookkeeping is always keyed on the broker (the
/// peer's one directed channel); the packet's `to` still addresses whatever
/// peer `queued.to` names, resolved by the broker on arrival.
async fn dispatch_send(state: &PeerState, key: &Key, my_id: &ServerId, queued: QueuedSend) {
    let from = Endpoint::new(my_id.clone(), queued.from_plugin);
    let target = queued.to.server_id().clone();
    let sid = state.history.lock().await.next_sid(&ServerId::broker());
    let packet = allocate(PacketType::DATA_SEND, queued.to, from, Some(queued.payload), &[target], |_| sid)
        .remove(0)
        .1;
    state.history.lock().await.append(&ServerId::broker(), packet.clone());
    *state.last_sent.lock().await = Some(packet.clone());
    send_packet(state, key, &packet).await;
}

/// Public entry point for plugins to originate a `data-send` (§4.6
/// "Outbound ordering": at most one un-acked send at a time, later calls
/// enqueue).
pub async fn send_data(state: &PeerState, to: Endpoint, from_plugin: PluginId, payload: Value) {
    let Some((id, key)) = state.account().await else {
        tracing::warn!("send_data called before the peer has logged in, dropping");
        return;
    };

    let queued = QueuedSend { to, from_plugin, payload };
    let in_flight = state.last_sent.lock().await.is_some();
    if in_flight {
        state.send_queue.lock().await.push_back(queued);
        return;
    }
    dispatch_send(state, &key, &id, queued).await;
}

/// Encrypt `packet` under `key` and push it onto the live connection's
/// outbound queue, if any (§4.4 "send to absent peer: locally logged, no
/// packet emitted" applies symmetrically here).
pub(crate) async fn send_packet(state: &PeerState, key: &Key, packet: &Packet) -> bool {
    let Some((id, _)) = state.account().await else {
        return false;
    };
    let bytes = match serde_json::to_vec(packet) {
        Ok(b) => b,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize outbound packet");
            return false;
        }
    };
    let ciphertext = key.encrypt(&bytes);
    let frame = Frame::ciphertext(id, ciphertext);
    let json = match serde_json::to_string(&frame) {
        Ok(j) => j,
        Err(e) => {
            tracing::error!(error = %e, "failed to serialize outbound frame");
            return false;
        }
    };
    let delivered = state.send_frame(Message::Text(json.into())).await;
    if !delivered {
        tracing::debug!(kind = ?packet.kind, "not connected, packet held in history only");
    }
    delivered
}
