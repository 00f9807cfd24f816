pub mod close_reason;
pub mod error;
pub mod file_assembly;
pub mod file_send;
pub mod handshake;
pub mod peer;
pub mod state;
pub mod transport;

pub use error::PeerError;
pub use peer::PeerRuntime;
pub use state::PeerState;
