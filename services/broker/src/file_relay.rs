//! File-transfer relay (§4.5 "File transfer"): a `file-begin`/`file-chunk`*/
//! `file-end` sequence opens a sink at `save_path`, appends each hex-decoded
//! chunk, and on `file-end` verifies SHA-256 against the announced hash.

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

    /// Finalize the sink, verifying the accumulated hash. On mismatch the
    /// partial file is removed and the caller's `file-error` reply is left to
    /// them — this only reports the mismatch.
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
