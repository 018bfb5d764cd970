//! Perch gateway - persistent event-stream session
//!
//! One duplex connection per session: handshake, heartbeat liveness,
//! sequence tracking, resume-vs-identify reconnection, and a sliding-window
//! limiter on outbound commands.

mod config;
mod error;
mod protocol;
mod quota;
mod session;

pub use config::{ConnectionProperties, GatewayOptions, IdentifyOverlay};
pub use error::{GatewayError, Result};
pub use protocol::{
    Hello, Identify, InboundFrame, Opcode, OutboundFrame, PresenceStatus, PresenceUpdate, Resume,
};
pub use quota::SendQuota;
pub use session::{ConnectionPhase, GatewaySession, SessionState};
