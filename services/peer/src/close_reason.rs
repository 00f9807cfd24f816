//! Classifies a WebSocket close frame against §4.6's one special case:
//! "on any close other than the explicit already-login (`1008 reason`
//! containing `"401"`) case, log and re-enter the dial loop. On `"401"`
//! stop permanently."

use tokio_tungstenite::tungstenite::protocol::CloseFrame;

pub fn is_duplicate_login_close(frame: Option<&CloseFrame<'_>>) -> bool {
    frame.is_some_and(|f| f.reason.contains("401"))
}
