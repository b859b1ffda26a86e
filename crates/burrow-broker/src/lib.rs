//! Broker side of the tunnel system
//!
//! Holds the public ports. Publishers connect over a WebSocket control
//! channel, declare their services, and dial back with a first-bytes token
//! whenever a public client shows up; the broker splices the two sockets.

pub mod acceptor;
pub mod publisher;
pub mod server;
pub mod session;
pub mod udp;

pub use acceptor::{AcceptorError, AcceptorHandle, AcceptorPool};
pub use publisher::Publisher;
pub use server::{Broker, BrokerConfig, BrokerError};
pub use session::PublishedService;
pub use udp::UdpPublicService;
