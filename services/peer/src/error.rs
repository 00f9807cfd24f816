use thiserror::Error;

/// Mirrors the broker's error styling (`services/broker::error::BrokerError`):
/// terse variants, `#[from]` where a lower layer's error converts cleanly.
#[derive(Debug, Error)]
pub enum PeerError {
    #[error("failed to connect to broker: {0}")]
    Connect(String),
    #[error("websocket error: {0}")]
    Ws(#[from] tokio_tungstenite::tungstenite::Error),
    #[error("decrypt failed")]
    Decrypt,
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("broker closed the connection: {0}")]
    ClosedByBroker(String),
    #[error("broker sent login-error, account may be stale")]
    LoginRejected,
    #[error("broker sent register-error: {0}")]
    RegisterRejected(String),
    #[error("config error: {0}")]
    Config(#[from] bus_config::ConfigError),
    #[error("disconnected")]
    Disconnected,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("file hash mismatch: {0}")]
    FileHashMismatch(String),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
