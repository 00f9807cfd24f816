//! Peer-side transport: dial and reconnect (§4.4 "Peer-side dial").
//!
//! Retries indefinitely on any connect error with a 1-second backoff,
//! matching the original's `while True: try connect except ...: sleep(1)`
//! loop rather than special-casing `ConnectionRefused` — DNS failures and
//! resets get the same treatment in practice.

use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::{connect_async, MaybeTlsStream};
use tokio_util::sync::CancellationToken;

pub type WsStream = tokio_tungstenite::WebSocketStream<MaybeTlsStream<TcpStream>>;

const RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Dial `url`, retrying forever until it succeeds or `cancel` fires.
/// Returns `None` only when cancelled before a connection could be made.
pub async fn dial_with_retry(url: &str, cancel: &CancellationToken) -> Option<WsStream> {
    loop {
        if cancel.is_cancelled() {
            return None;
        }
        match connect_async(url).await {
            Ok((stream, _response)) => return Some(stream),
            Err(e) => {
                tracing::warn!(error = %e, url, "dial failed, retrying in 1s");
                tokio::select! {
                    () = tokio::time::sleep(RETRY_BACKOFF) => {}
                    () = cancel.cancelled() => return None,
                }
            }
        }
    }
}
