//! Publisher side of the tunnel system
//!
//! Runs behind NAT next to the hidden services. Dials out to the broker's
//! control WebSocket, declares the services to expose, and dials back into
//! the broker's public ports whenever a client shows up.

pub mod authority;
pub mod backoff;
pub mod config;
pub mod publisher;
pub mod session;
pub mod udp;

pub use authority::{AuthorityClient, AuthorityError};
pub use backoff::RetryContext;
pub use config::{AuthorityConfig, ConfigError, PublisherConfig};
pub use publisher::{ClientError, PublisherClient};
pub use session::{SessionError, TcpTunnel};
pub use udp::{relay_target, RelayError, UdpRelay};
