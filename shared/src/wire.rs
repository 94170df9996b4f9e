//! Wire protocol: tagged binary messages exchanged over the framed
//! transport. Every message is a `(type, payload)` pair; the enum
//! discriminant is the type tag.

use crate::entity::{EntityDelta, EntityId, EntityRecord};
use crate::math::Vec2;
use serde::{Deserialize, Serialize};
use std::error::Error;
use std::fmt::{Display, Formatter, Result as FormatResult};

/// Messages the client sends to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ClientPacket {
    /// Must be the first message on a new connection. The token comes from
    /// the matchmaker collaborator and is validated server-side.
    Auth { token: String },
    /// Requests an avatar entity bound to this connection.
    Join { name: String },
    /// Desired movement/aim/action for the connection's avatar.
    Intent {
        sequence: u32,
        move_dir: Vec2,
        aim: f32,
        fire: bool,
    },
    Leave,
}

/// Messages the server sends to the client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum ServerPacket {
    /// Sent once after a successful auth.
    Init {
        tick_interval_ms: u64,
        /// Opaque per-game bootstrap blob for the host process.
        bootstrap: Vec<u8>,
    },
    /// Sent after a `Join` is honored; tells the client which entity it owns.
    Joined { player_id: EntityId },
    /// Per-tick entity lifecycle delta.
    Update(UpdatePacket),
}

/// The four lifecycle lists for one tick. Processed strictly in declaration
/// order so no entry ever references an id before its `appeared`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdatePacket {
    pub tick: u64,
    pub appeared: Vec<EntityRecord>,
    pub updated: Vec<EntityDelta>,
    pub disappeared: Vec<EntityId>,
    pub destroyed: Vec<EntityId>,
}

impl UpdatePacket {
    pub fn empty(tick: u64) -> Self {
        Self {
            tick,
            appeared: Vec::new(),
            updated: Vec::new(),
            disappeared: Vec::new(),
            destroyed: Vec::new(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.appeared.is_empty()
            && self.updated.is_empty()
            && self.disappeared.is_empty()
            && self.destroyed.is_empty()
    }
}

/// Errors from encoding or decoding a single message.
#[derive(Debug)]
pub enum WireError {
    Encode(String),
    Decode(String),
}

impl Display for WireError {
    fn fmt(&self, f: &mut Formatter) -> FormatResult {
        match self {
            WireError::Encode(msg) => write!(f, "encode error: {}", msg),
            WireError::Decode(msg) => write!(f, "decode error: {}", msg),
        }
    }
}

impl Error for WireError {}

pub fn encode_client(packet: &ClientPacket) -> Result<Vec<u8>, WireError> {
    bincode::serialize(packet).map_err(|e| WireError::Encode(e.to_string()))
}

pub fn decode_client(bytes: &[u8]) -> Result<ClientPacket, WireError> {
    bincode::deserialize(bytes).map_err(|e| WireError::Decode(e.to_string()))
}

pub fn encode_server(packet: &ServerPacket) -> Result<Vec<u8>, WireError> {
    bincode::serialize(packet).map_err(|e| WireError::Encode(e.to_string()))
}

pub fn decode_server(bytes: &[u8]) -> Result<ServerPacket, WireError> {
    bincode::deserialize(bytes).map_err(|e| WireError::Decode(e.to_string()))
}
