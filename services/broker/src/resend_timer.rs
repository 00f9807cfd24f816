//! The 30-second unacknowledged-send resend loop (§4.5 "LastSent"): any
//! packet still sitting in `last_sent` past one tick gets re-encrypted and
//! pushed again, relying on the peer's own ack to eventually clear it.

use crate::state::BrokerState;
use axum::extract::ws::Message;
use bus_codec::Key;
use bus_protocol::{Frame, ServerId};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

const RESEND_EVERY: Duration = Duration::from_secs(30);

pub fn spawn(state: Arc<BrokerState>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RESEND_EVERY);
        interval.tick().await;
        loop {
            interval.tick().await;
            resend_pending(&state).await;
        }
    })
}

async fn resend_pending(state: &Arc<BrokerState>) {
    let pending: Vec<(ServerId, bus_protocol::Packet)> = state
        .last_sent
        .read()
        .await
        .iter()
        .map(|(id, packet)| (id.clone(), packet.clone()))
        .collect();

    for (peer, packet) in pending {
        let Some(key) = state.accounts.key_for(&peer).await else {
            continue;
        };
        if let Some(message) = encrypt_for_resend(&peer, &key, &packet) {
            tracing::debug!(peer = %peer, sid = packet.sid, "resending unacknowledged packet");
            state.send_to(&peer, message).await;
        }
    }
}

fn encrypt_for_resend(peer: &ServerId, key: &Key, packet: &bus_protocol::Packet) -> Option<Message> {
    let bytes = serde_json::to_vec(packet).ok()?;
    let ciphertext = key.encrypt(&bytes);
    let frame = Frame::ciphertext(peer.clone(), ciphertext);
    let json = serde_json::to_string(&frame).ok()?;
    Some(Message::Text(json.into()))
}
