//! Outbound chunked file transport (§4.5/§4.6 "file transfer", §8 S6).
//!
//! Chunks are nominal 1 MiB before hex-encoding, matching the wire contract
//! in `bus_protocol::payloads::FileChunk`.

use crate::error::PeerError;
use crate::peer::send_packet;
use crate::state::PeerState;
use bus_protocol::{allocate, payloads, Endpoint, PacketType, ServerId};
use std::path::Path;

const CHUNK_SIZE: usize = 1024 * 1024;

/// Send `path` to `to`, as `file-begin` / N * `file-chunk` / `file-end`.
pub async fn send_file(state: &PeerState, to: Endpoint, path: &Path) -> Result<(), PeerError> {
    let Some((my_id, key)) = state.account().await else {
        return Err(PeerError::Disconnected);
    };

    let bytes = tokio::fs::read(path).await?;
    let hash = bus_codec::sha256_hex(&bytes);
    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "unnamed".to_owned());

    let begin = payloads::FileBegin {
        file_name: file_name.clone(),
        save_path: file_name,
        hash,
    };
    send_file_packet(
        state,
        &key,
        &my_id,
        to.clone(),
        PacketType::FILE_BEGIN,
        serde_json::to_value(begin).expect("struct always serializes"),
    )
    .await;

    for (index, chunk) in bytes.chunks(CHUNK_SIZE).enumerate() {
        let chunk_payload = payloads::FileChunk {
            index: index as u64,
            hex_bytes: hex::encode(chunk),
        };
        send_file_packet(
            state,
            &key,
            &my_id,
            to.clone(),
            PacketType::FILE_CHUNK,
            serde_json::to_value(chunk_payload).expect("struct always serializes"),
        )
        .await;
    }

    send_file_packet(
        state,
        &key,
        &my_id,
        to,
        PacketType::FILE_END,
        serde_json::to_value(payloads::FileEnd::default()).expect("struct always serializes"),
    )
    .await;

    Ok(())
}

async fn send_file_packet(
    state: &PeerState,
    key: &bus_codec::Key,
    my_id: &ServerId,
    to: Endpoint,
    kind: PacketType,
    payload: serde_json::Value,
) {
    let target = to.server_id().clone();
    let from = Endpoint::new(my_id.clone(), to.plugin_id().clone());
    let sid = state.history.lock().await.next_sid(&ServerId::broker());
    let packet = allocate(kind, to, from, Some(payload), &[target], |_| sid)
        .remove(0)
        .1;
    state.history.lock().await.append(&ServerId::broker(), packet.clone());
    send_packet(state, key, &packet).await;
}
