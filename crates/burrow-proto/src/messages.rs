//! Control-channel message types
//!
//! Messages travel as JSON text frames over the persistent publisher-broker
//! WebSocket, tagged by a `type` field. Unknown tags decode to
//! [`ControlMessage::Unknown`] so a newer peer never kills an older one.

use crate::service::{ServiceInfo, SocketKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Control protocol errors
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Failed to encode control message: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode control message: {0}")]
    Decode(#[source] serde_json::Error),
}

/// Main control protocol message enum
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all_fields = "camelCase")]
pub enum ControlMessage {
    /// Publisher introduces itself and declares its services
    Handshake {
        identity: String,
        services: Vec<ServiceInfo>,
    },
    /// Publisher replaces its declared service set
    Services { services: Vec<ServiceInfo> },

    /// Broker asks the publisher to dial back for a waiting public client
    NewTunnel {
        service_id: String,
        tunnel_id: String,
        hidden_port: u16,
        public_port: u16,
        socket_type: SocketKind,
    },
    /// Publisher could not establish the requested tunnel
    NewTunnelFailed {
        service_id: String,
        tunnel_id: String,
        hidden_port: u16,
        public_port: u16,
        reason: String,
        socket_type: SocketKind,
    },
    /// Publisher bound its ephemeral UDP relay socket
    UdpRelayBound {
        service_id: String,
        tunnel_id: String,
        hidden_port: u16,
        public_port: u16,
        socket_type: SocketKind,
        relay_port: u16,
    },

    /// Fallback for message types this build does not know about.
    /// Logged and ignored by both sides, never fatal.
    #[serde(other)]
    Unknown,
}

impl ControlMessage {
    /// Encode for a WebSocket text frame
    pub fn encode(&self) -> Result<String, ProtocolError> {
        serde_json::to_string(self).map_err(ProtocolError::Encode)
    }

    /// Decode from a WebSocket text frame
    pub fn decode(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(ProtocolError::Decode)
    }
}
