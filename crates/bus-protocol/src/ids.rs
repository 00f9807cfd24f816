use serde::{Deserialize, Serialize};
use std::fmt;

/// The broker's own reserved identity. Never allocated to a peer.
pub const BROKER_ID: &str = "-----";
/// Reserved broadcast target; resolved by the broker to "every connected peer".
pub const ALL_ID: &str = "all";
/// Reserved plugin id for broker-originated traffic.
pub const SYSTEM_PLUGIN: &str = "system";

/// A short opaque string identifying a peer (or the broker / broadcast sentinels).
///
/// Newly registered peers get a fresh 5-character alphanumeric id, unique
/// across currently-known peers (see `services/broker::accounts`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub String);

impl ServerId {
    pub fn broker() -> Self {
        ServerId(BROKER_ID.to_owned())
    }

    pub fn all() -> Self {
        ServerId(ALL_ID.to_owned())
    }

    pub fn is_broker(&self) -> bool {
        self.0 == BROKER_ID
    }

    pub fn is_all(&self) -> bool {
        self.0 == ALL_ID
    }

    pub fn is_reserved(&self) -> bool {
        self.is_broker() || self.is_all()
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        ServerId(s.to_owned())
    }
}

impl From<String> for ServerId {
    fn from(s: String) -> Self {
        ServerId(s)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A free-form string identifying a logical endpoint within a peer.
///
/// `"system"` is reserved for broker-originated traffic.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PluginId(pub String);

impl PluginId {
    pub fn system() -> Self {
        PluginId(SYSTEM_PLUGIN.to_owned())
    }

    pub fn is_system(&self) -> bool {
        self.0 == SYSTEM_PLUGIN
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for PluginId {
    fn from(s: &str) -> Self {
        PluginId(s.to_owned())
    }
}

impl From<String> for PluginId {
    fn from(s: String) -> Self {
        PluginId(s)
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
