//! Structured payload bodies carried inside `Data::payload` for the packet
//! types that need more than a bare JSON blob to interpret.
//!
//! These are convenience (de)serialization targets; the wire payload is
//! still plain `serde_json::Value` on `Packet`, so a plugin that doesn't
//! know about a given shape can still forward it untouched.

use serde::{Deserialize, Serialize};

/// Payload of a `register` packet: advisory info about the connecting peer.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterRequest {
    pub path: String,
}

/// Payload of a `registered` reply: the freshly allocated account.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisteredReply {
    pub id: String,
    pub password: String,
}

/// Payload of a `register-error` reply.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegisterError {
    pub error: String,
}

/// Payload of a `login` packet: the peer's own `ServerId` plus whatever
/// advisory `ServerInfo` it wants the broker to hold (e.g. `{path: "..."}`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginRequest {
    pub id: String,
    #[serde(default)]
    pub info: serde_json::Value,
}

/// Payload of a `login-error` reply. Reason is always `"401"` for duplicate
/// login per §4.5.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoginError {
    pub error: String,
}

/// Payload of `new-login`/`del-login` broadcasts: the membership delta.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MembershipChange {
    pub id: String,
    pub servers: Vec<String>,
}

/// Payload of a `data-error` reply, referencing the original target so the
/// sender may retransmit.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DataError {
    pub error: String,
}

/// Payload of `file-begin` (§4.5/§4.6/§8 S6).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileBegin {
    pub file_name: String,
    pub save_path: String,
    pub hash: String,
}

/// Payload of `file-chunk`: hex-encoded bytes, nominal 1 MiB before encoding.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileChunk {
    pub index: u64,
    pub hex_bytes: String,
}

/// Payload of `file-end`: no additional fields beyond the envelope itself,
/// but kept as a named type for symmetry and future extension.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct FileEnd {}

/// Payload of `file-error`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FileError {
    pub error: String,
}

/// The bootstrap identity blob (§6): base64-encoded JSON handed to a human
/// to paste into a new sub-server's first-run configuration (out of scope
/// core: the UI for that is external).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapBlob {
    pub ip: BootstrapIp,
    pub port: u16,
    pub password: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BootstrapIp {
    pub config: String,
    pub inside: Vec<String>,
    pub outside: Option<String>,
}
