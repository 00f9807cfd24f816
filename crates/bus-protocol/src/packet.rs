use crate::ids::{PluginId, ServerId, ALL_ID, BROKER_ID};
use crate::packet_type::PacketType;
use serde::{Deserialize, Serialize};

/// The payload carried by a non-keepalive packet.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Data {
    pub payload: serde_json::Value,
    pub timestamp: f64,
    pub checksum: String,
}

/// `(ServerId, PluginId)` endpoint address, encoded as a two-element JSON array.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Endpoint(pub ServerId, pub PluginId);

impl Endpoint {
    pub fn new(server_id: impl Into<ServerId>, plugin_id: impl Into<PluginId>) -> Self {
        Endpoint(server_id.into(), plugin_id.into())
    }

    pub fn server_id(&self) -> &ServerId {
        &self.0
    }

    pub fn plugin_id(&self) -> &PluginId {
        &self.1
    }
}

/// The canonical envelope: `{sid, type, to, from, data}`.
///
/// `data` is omitted (serialized as `{}`) for unsequenced / no-payload types
/// (ping, pong, ack, probe), matching §6's "absent or empty-object" rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Packet {
    pub sid: i64,
    #[serde(rename = "type")]
    pub kind: PacketType,
    pub to: Endpoint,
    pub from: Endpoint,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Data>,
}

impl Packet {
    pub fn is_unsequenced(&self) -> bool {
        !self.kind.is_sequenced()
    }
}

/// Compute the set of destination `ServerId`s a logical `to` resolves to.
///
/// - `to = "all"` (broker only): one destination per entry in `known_peers`
///   not present in `excluding`.
/// - `to = "-----"`: the single handshake destination, sid fixed per the
///   caller (broker replies with sid 0 to an unregistered client; a peer
///   addressing the broker gets its own next sid — callers pass that in via
///   `next_sid`).
/// - otherwise: the single named peer.
pub fn resolve_destinations<'a>(
    to: &'a ServerId,
    known_peers: &'a [ServerId],
    excluding: &'a [ServerId],
) -> Vec<ServerId> {
    if to.as_str() == ALL_ID {
        known_peers
            .iter()
            .filter(|id| !excluding.contains(id))
            .cloned()
            .collect()
    } else {
        vec![to.clone()]
    }
}

/// Build the packet(s) for a send, one per resolved destination, each with
/// its own channel-relative sid supplied by `next_sid`.
///
/// `next_sid(dest) -> i64` is expected to return:
/// - `0` for handshake packets to/from `"-----"` before an account exists,
/// - `-1` for unsequenced types (never stored in history),
/// - the channel's next monotonic sid otherwise (first stored packet is `1`).
///
/// The function is pure: it does not mutate any history store. Callers
/// append each returned packet to `HistoryStore[destination]` themselves,
/// and only when `kind.is_sequenced()`.
pub fn allocate<F>(
    kind: PacketType,
    to: Endpoint,
    from: Endpoint,
    payload: Option<serde_json::Value>,
    destinations: &[ServerId],
    mut next_sid: F,
) -> Vec<(ServerId, Packet)>
where
    F: FnMut(&ServerId) -> i64,
{
    let data = payload.map(|payload| Data {
        checksum: bus_codec::md5_hex(&payload),
        timestamp: unix_timestamp(),
        payload,
    });

    destinations
        .iter()
        .map(|dest| {
            let sid = next_sid(dest);
            let packet = Packet {
                sid,
                kind,
                to: Endpoint(dest.clone(), to.plugin_id().clone()),
                from: from.clone(),
                data: data.clone(),
            };
            (dest.clone(), packet)
        })
        .collect()
}

fn unix_timestamp() -> f64 {
    use std::time::{SystemTime, UNIX_EPOCH};
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

pub fn default_to_from() -> (Endpoint, Endpoint) {
    let handshake = Endpoint::new(BROKER_ID, "-----");
    (handshake.clone(), handshake)
}
