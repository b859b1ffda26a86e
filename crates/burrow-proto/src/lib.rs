//! Burrow protocol definitions
//!
//! This crate defines the control-channel messages, service descriptors,
//! tunnel tokens and address-matching primitives shared by the broker and
//! publisher sides of the tunnel system.

pub mod addr;
pub mod id;
pub mod messages;
pub mod service;
pub mod token;

pub use addr::{parse_host, same_host};
pub use id::new_id;
pub use messages::{ControlMessage, ProtocolError};
pub use service::{ServiceInfo, SocketKind};
pub use token::TunnelToken;

/// Path the publisher's control WebSocket is served under
pub const CONTROL_WS_PATH: &str = "/api/ws/publisher";

/// Maximum number of bytes peeked from a freshly accepted data socket
pub const PEEK_LIMIT: usize = 4096;
