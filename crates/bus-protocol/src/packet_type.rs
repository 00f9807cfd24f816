use serde::{Deserialize, Serialize};

/// A `(category, subcode)` pair from the closed enumeration in the data
/// model. Unknown types deserialize fine (the tuple is structural) but are
/// logged and dropped by dispatch rather than causing a crash, per the
/// "per-revision drift in the packet dict" re-architecture note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PacketType(pub (i8, u8));

impl PacketType {
    pub const TEST_CONNECT: PacketType = PacketType((-1, 0));

    pub const PING: PacketType = PacketType((0, 1));
    pub const PONG: PacketType = PacketType((0, 2));

    pub const CONTROL_STOP: PacketType = PacketType((1, 0));
    pub const CONTROL_RELOAD: PacketType = PacketType((1, 1));
    pub const CONTROL_MAINTENANCE: PacketType = PacketType((1, 2));
    pub const CONTROL_RESUME: PacketType = PacketType((1, 3));

    pub const REGISTER: PacketType = PacketType((2, 0));
    pub const REGISTERED: PacketType = PacketType((2, 1));
    pub const REGISTER_ERROR: PacketType = PacketType((2, 2));

    pub const LOGIN: PacketType = PacketType((3, 0));
    pub const LOGGED_IN: PacketType = PacketType((3, 1));
    pub const NEW_LOGIN: PacketType = PacketType((3, 2));
    pub const DEL_LOGIN: PacketType = PacketType((3, 3));
    pub const LOGIN_ERROR: PacketType = PacketType((3, 4));

    pub const DATA_SEND: PacketType = PacketType((4, 0));
    pub const DATA_SENDOK: PacketType = PacketType((4, 1));
    pub const DATA_ERROR: PacketType = PacketType((4, 2));

    pub const FILE_BEGIN: PacketType = PacketType((5, 0));
    pub const FILE_CHUNK: PacketType = PacketType((5, 1));
    pub const FILE_END: PacketType = PacketType((5, 2));
    pub const FILE_ERROR: PacketType = PacketType((5, 3));

    pub fn category(&self) -> i8 {
        self.0 .0
    }

    pub fn subcode(&self) -> u8 {
        self.0 .1
    }

    /// Category `0` (keepalive) and `-1` (probe) are transport-level and
    /// never stored in history.
    pub fn is_sequenced(&self) -> bool {
        !matches!(self.category(), 0 | -1)
    }

    pub fn is_probe(&self) -> bool {
        self.category() == -1
    }
}
