use crate::ids::ServerId;
use crate::packet::Packet;
use std::collections::HashMap;

/// `map[ServerId] -> ordered list[Packet]`, one list per directed channel.
///
/// Category-0/-1 packets are excluded (§3 "Category 0 packets ... are not
/// stored in history"). Shared shape for both the broker's per-peer history
/// and the peer's single `"-----"`-keyed history of the broker.
#[derive(Debug, Default)]
pub struct HistoryStore {
    channels: HashMap<ServerId, Vec<Packet>>,
}

impl HistoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// The next sid that would be assigned to a stored packet on this
    /// channel (the first stored packet has sid 1).
    pub fn next_sid(&self, server_id: &ServerId) -> i64 {
        self.channels
            .get(server_id)
            .map(|packets| packets.len() as i64 + 1)
            .unwrap_or(1)
    }

    /// Append a packet iff its type is sequenced. Returns whether it was
    /// stored (unsequenced packets are accepted but not recorded).
    pub fn append(&mut self, server_id: &ServerId, packet: Packet) -> bool {
        if !packet.kind.is_sequenced() {
            return false;
        }
        self.channels
            .entry(server_id.clone())
            .or_default()
            .push(packet);
        true
    }

    /// Record a received packet for later replay, subject to the same
    /// category rule as `append`.
    pub fn record_recv(&mut self, server_id: &ServerId, packet: Packet) -> bool {
        self.append(server_id, packet)
    }

    /// Packets strictly after `since_sid`, in insertion order.
    pub fn history_from(&self, server_id: &ServerId, since_sid: i64) -> Vec<Packet> {
        self.channels
            .get(server_id)
            .map(|packets| {
                packets
                    .iter()
                    .filter(|p| p.sid > since_sid)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Drop a whole channel's history (on peer removal).
    pub fn remove_channel(&mut self, server_id: &ServerId) {
        self.channels.remove(server_id);
    }

    /// Delete the most recent `n` entries from a channel's recv history.
    /// Used by the duplicate-login handler to preserve sid monotonicity for
    /// the legitimate session (§4.5, §9).
    pub fn truncate_recv(&mut self, server_id: &ServerId, n: usize) {
        if let Some(packets) = self.channels.get_mut(server_id) {
            let keep = packets.len().saturating_sub(n);
            packets.truncate(keep);
        }
    }

    pub fn last_sid(&self, server_id: &ServerId) -> i64 {
        self.channels
            .get(server_id)
            .and_then(|packets| packets.last())
            .map(|p| p.sid)
            .unwrap_or(0)
    }
}
