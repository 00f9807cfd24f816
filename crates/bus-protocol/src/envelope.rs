use crate::ids::ServerId;
use crate::packet::Packet;
use serde::{Deserialize, Serialize};

/// The one WebSocket message shape, per §6: `{"account": ..., "data": ...}`.
///
/// `data` is ciphertext (base64 text) once a key is in play, or a plaintext
/// `Packet` object only during the initial register exchange. The receiver
/// accepts both forms there and requires ciphertext thereafter.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Frame {
    pub account: ServerId,
    pub data: FrameData,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FrameData {
    Ciphertext(String),
    Plain(Box<Packet>),
}

impl Frame {
    pub fn ciphertext(account: ServerId, ciphertext: String) -> Self {
        Frame {
            account,
            data: FrameData::Ciphertext(ciphertext),
        }
    }

    pub fn plain(account: ServerId, packet: Packet) -> Self {
        Frame {
            account,
            data: FrameData::Plain(Box::new(packet)),
        }
    }
}
