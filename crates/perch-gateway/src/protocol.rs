//! Gateway wire protocol
//!
//! The JSON envelope and the typed payloads this client sends. Inbound
//! dispatch payloads stay as raw JSON; decoding them belongs to the event
//! handlers, not the transport.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Gateway operation codes, serialized as their numeric value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum Opcode {
    Dispatch,
    Heartbeat,
    Identify,
    PresenceUpdate,
    Resume,
    Reconnect,
    InvalidSession,
    Hello,
    HeartbeatAck,
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> Self {
        match op {
            Opcode::Dispatch => 0,
            Opcode::Heartbeat => 1,
            Opcode::Identify => 2,
            Opcode::PresenceUpdate => 3,
            Opcode::Resume => 6,
            Opcode::Reconnect => 7,
            Opcode::InvalidSession => 9,
            Opcode::Hello => 10,
            Opcode::HeartbeatAck => 11,
        }
    }
}

impl TryFrom<u8> for Opcode {
    type Error = String;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Opcode::Dispatch),
            1 => Ok(Opcode::Heartbeat),
            2 => Ok(Opcode::Identify),
            3 => Ok(Opcode::PresenceUpdate),
            6 => Ok(Opcode::Resume),
            7 => Ok(Opcode::Reconnect),
            9 => Ok(Opcode::InvalidSession),
            10 => Ok(Opcode::Hello),
            11 => Ok(Opcode::HeartbeatAck),
            other => Err(format!("unknown opcode {}", other)),
        }
    }
}

/// Inbound envelope `{op, d, s, t}`.
///
/// The opcode stays numeric here so unknown codes can be skipped instead of
/// failing the whole frame.
#[derive(Debug, Clone, Deserialize)]
pub struct InboundFrame {
    pub op: u8,
    #[serde(default)]
    pub d: Option<Value>,
    #[serde(default)]
    pub s: Option<u64>,
    #[serde(default)]
    pub t: Option<String>,
}

/// Outbound envelope `{op, d}`.
#[derive(Debug, Clone, Serialize)]
pub struct OutboundFrame {
    pub op: Opcode,
    pub d: Value,
}

impl OutboundFrame {
    pub fn new(op: Opcode, d: Value) -> Self {
        Self { op, d }
    }

    /// A heartbeat carrying the last known sequence, or null before any
    /// dispatch arrived.
    pub fn heartbeat(sequence: Option<u64>) -> Self {
        Self::new(
            Opcode::Heartbeat,
            sequence.map_or(Value::Null, |s| Value::from(s)),
        )
    }
}

/// Hello control payload.
#[derive(Debug, Clone, Deserialize)]
pub struct Hello {
    /// Heartbeat cadence in milliseconds.
    pub heartbeat_interval: u64,
}

/// Identify command payload.
#[derive(Debug, Clone, Serialize)]
pub struct Identify {
    pub token: String,
    pub properties: crate::config::ConnectionProperties,
    pub intents: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compress: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub large_threshold: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub shard: Option<[u32; 2]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub presence: Option<PresenceUpdate>,
}

/// Resume command payload; replays from a known sequence instead of a fresh
/// handshake.
#[derive(Debug, Clone, Serialize)]
pub struct Resume {
    pub token: String,
    pub session_id: String,
    pub seq: u64,
}

/// Presence sent with Identify or a presence-update command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PresenceUpdate {
    pub since: Option<i64>,
    pub activities: Vec<Value>,
    pub status: PresenceStatus,
    pub afk: bool,
}

impl Default for PresenceUpdate {
    fn default() -> Self {
        Self {
            since: None,
            activities: Vec::new(),
            status: PresenceStatus::Online,
            afk: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PresenceStatus {
    Online,
    Dnd,
    Idle,
    Invisible,
    Offline,
}
