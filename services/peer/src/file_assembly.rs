//! Inbound file assembly (§4.6 "Inbound dispatch", §3 "FileAssembly").
//!
//! A single slot, unlike the broker's per-sender map, since the peer only
//! ever receives a file transfer from one counterpart (the broker) at a
//! time. Mirrors `services/broker::file_relay::FileSink` exactly; kept as
//! its own small module here rather than shared because the two binaries
//! don't otherwise depend on each other.

use crate::state::PeerState;
use bus_protocol::{payloads, Packet, PacketType};
use sha2::{Digest, Sha256};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncWriteExt;

pub struct FileSink {
    pub save_path: PathBuf,
    pub expected_hash: String,
    file: File,
    hasher: Sha256,
    next_index: u64,
}

#[derive(Debug, thiserror::Error)]
pub enum FileSinkError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("chunk arrived out of order: expected {expected}, got {got}")]
    OutOfOrder { expected: u64, got: u64 },
    #[error("chunk payload is not valid hex: {0}")]
    InvalidHex(#[from] hex::FromHexError),
    #[error("hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },
}

impl FileSink {
    pub async fn open(save_path: PathBuf, expected_hash: String) -> Result<Self, FileSinkError> {
        let file = File::create(&save_path).await?;
        Ok(FileSink {
            save_path,
            expected_hash,
            file,
            hasher: Sha256::new(),
            next_index: 0,
        })
    }

    pub async fn write_chunk(&mut self, index: u64, hex_bytes: &str) -> Result<(), FileSinkError> {
        if index != self.next_index {
            return Err(FileSinkError::OutOfOrder {
                expected: self.next_index,
                got: index,
            });
        }
        let bytes = hex::decode(hex_bytes)?;
        self.file.write_all(&bytes).await?;
        self.hasher.update(&bytes);
        self.next_index += 1;
        Ok(())
    }

    pub async fn finish(mut self) -> Result<(), FileSinkError> {
        self.file.flush().await?;
        let actual = hex::encode(self.hasher.finalize());
        if actual != self.expected_hash {
            let _ = tokio::fs::remove_file(&self.save_path).await;
            return Err(FileSinkError::HashMismatch {
                expected: self.expected_hash,
                actual,
            });
        }
        Ok(())
    }
}

/// Drive the single inbound file-transfer slot from one relayed packet
/// (§4.6 "Inbound dispatch", mirroring `services/broker::broker::relay_into_local_sink`).
pub async fn dispatch(state: &PeerState, packet: Packet) {
    let Some(data) = &packet.data else {
        return;
    };

    match packet.kind {
        PacketType::FILE_BEGIN => {
            let begin: payloads::FileBegin = match serde_json::from_value(data.payload.clone()) {
                Ok(b) => b,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed file-begin payload, dropping");
                    return;
                }
            };
            match FileSink::open(begin.save_path.clone().into(), begin.hash).await {
                Ok(sink) => *state.file_assembly.lock().await = Some(sink),
                Err(e) => tracing::warn!(error = %e, path = %begin.save_path, "failed to open file sink"),
            }
        }
        PacketType::FILE_CHUNK => {
            let chunk: payloads::FileChunk = match serde_json::from_value(data.payload.clone()) {
                Ok(c) => c,
                Err(e) => {
                    tracing::warn!(error = %e, "malformed file-chunk payload, dropping");
                    return;
                }
            };
            let mut assembly = state.file_assembly.lock().await;
            if let Some(sink) = assembly.as_mut() {
                if let Err(e) = sink.write_chunk(chunk.index, &chunk.hex_bytes).await {
                    tracing::warn!(error = %e, "file chunk rejected, abandoning transfer");
                    *assembly = None;
                }
            }
        }
        PacketType::FILE_END => {
            let sink = state.file_assembly.lock().await.take();
            if let Some(sink) = sink {
                let path = sink.save_path.clone();
                match sink.finish().await {
                    Ok(()) => {
                        state
                            .plugins
                            .dispatch_file(packet.to.plugin_id(), packet.from.server_id(), &path)
                            .await;
                    }
                    Err(e) => tracing::warn!(error = %e, "file transfer hash mismatch"),
                }
            }
        }
        PacketType::FILE_ERROR => {
            *state.file_assembly.lock().await = None;
            tracing::warn!(peer = %packet.from.server_id(), "broker reported a file transfer error");
        }
        _ => {}
    }
}
