use thiserror::Error;

/// The close-code/error-kind policy from the error handling design, collapsed
/// onto one enum per handler mapping (see `handle_connection`).
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("decrypt failed")]
    Decrypt,
    #[error("unknown account")]
    UnknownAccount,
    #[error("duplicate login")]
    DuplicateLogin,
    #[error("checksum mismatch")]
    ChecksumMismatch,
    #[error("file hash mismatch")]
    FileHashMismatch,
    #[error("unknown target")]
    UnknownTarget,
    #[error("malformed frame: {0}")]
    MalformedFrame(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl BrokerError {
    /// The WebSocket close reason this error maps to, per the policy table.
    /// `None` means "do not close the connection".
    pub fn close_reason(&self) -> Option<&'static str> {
        match self {
            BrokerError::Decrypt | BrokerError::UnknownAccount | BrokerError::MalformedFrame(_) => {
                Some("400")
            }
            BrokerError::DuplicateLogin => Some("401"),
            BrokerError::Internal(_) => Some("500"),
            BrokerError::ChecksumMismatch
            | BrokerError::FileHashMismatch
            | BrokerError::UnknownTarget => None,
        }
    }
}
