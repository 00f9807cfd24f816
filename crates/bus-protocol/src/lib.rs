//! bus-protocol: wire types for the hub-and-spoke message bus.
//!
//! Every WebSocket message is the single envelope shape in [`envelope::Frame`];
//! once decrypted, its `data` is a [`packet::Packet`] from the closed
//! [`packet_type::PacketType`] enumeration.

pub mod envelope;
pub mod history;
pub mod ids;
pub mod packet;
pub mod packet_type;
pub mod payloads;

pub use envelope::{Frame, FrameData};
pub use history::HistoryStore;
pub use ids::{PluginId, ServerId, ALL_ID, BROKER_ID, SYSTEM_PLUGIN};
pub use packet::{allocate, default_to_from, resolve_destinations, Data, Endpoint, Packet};
pub use packet_type::PacketType;
