//! Session configuration

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::protocol::PresenceUpdate;

/// Configuration for a [`GatewaySession`](crate::GatewaySession).
#[derive(Debug, Clone)]
pub struct GatewayOptions {
    /// Gateway URL, without query parameters.
    pub url: String,
    /// Protocol version negotiated in the connection URL.
    pub version: u8,
    /// Event intents requested at identify.
    pub intents: u64,
    /// Connection properties sent with Identify.
    pub properties: ConnectionProperties,
    /// Initial presence, if any.
    pub presence: Option<PresenceUpdate>,
    /// Outbound command ceiling per window.
    pub send_limit: u32,
    /// Window for the outbound ceiling.
    pub send_window: Duration,
    /// Delay before re-identifying after an Invalid-Session control message.
    pub invalid_session_delay: Duration,
    /// Delay before redialing after a failed connection attempt.
    pub reconnect_delay: Duration,
}

impl Default for GatewayOptions {
    fn default() -> Self {
        Self {
            url: "wss://gateway.discord.gg".to_string(),
            version: perch_core::routes::BASE_API_VERSION,
            intents: 0,
            properties: ConnectionProperties::default(),
            presence: None,
            send_limit: 120,
            send_window: Duration::from_secs(60),
            invalid_session_delay: Duration::from_secs(5),
            reconnect_delay: Duration::from_secs(5),
        }
    }
}

impl GatewayOptions {
    pub fn with_url(mut self, url: impl Into<String>) -> Self {
        self.url = url.into();
        self
    }

    pub fn with_intents(mut self, intents: u64) -> Self {
        self.intents = intents;
        self
    }

    pub fn with_presence(mut self, presence: PresenceUpdate) -> Self {
        self.presence = Some(presence);
        self
    }
}

/// Identify connection properties.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionProperties {
    #[serde(rename = "$os")]
    pub os: String,
    #[serde(rename = "$browser")]
    pub browser: String,
    #[serde(rename = "$device")]
    pub device: String,
}

impl Default for ConnectionProperties {
    fn default() -> Self {
        Self {
            os: std::env::consts::OS.to_string(),
            browser: "perch".to_string(),
            device: "perch".to_string(),
        }
    }
}

/// Caller-provided overlay applied on top of the base Identify payload.
#[derive(Debug, Clone, Default)]
pub struct IdentifyOverlay {
    pub compress: Option<bool>,
    pub large_threshold: Option<u8>,
    pub shard: Option<[u32; 2]>,
    pub presence: Option<PresenceUpdate>,
}
