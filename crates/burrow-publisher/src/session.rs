//! Publisher-side TCP tunnel
//!
//! One tunnel per NewTunnel request: dial the broker's public port, write the
//! session token as the very first bytes, and only once the token is on the
//! wire dial the hidden local service and pipe the two sockets together.

use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::debug;

/// How long a hidden-service dial may take before the tunnel is failed
pub const LOCAL_CONNECT_TIMEOUT: Duration = Duration::from_secs(3);

/// Linger applied after either side of a spliced pair closes
pub const SESSION_GRACE: Duration = Duration::from_millis(500);

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Failed to connect to broker at {addr}: {source}")]
    BrokerConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Failed to send tunnel token: {0}")]
    TokenWrite(#[source] std::io::Error),

    #[error("Timed out connecting to local service at {addr}")]
    LocalTimeout { addr: String },

    #[error("Failed to connect to local service at {addr}: {source}")]
    LocalConnect {
        addr: String,
        #[source]
        source: std::io::Error,
    },
}

pub struct TcpTunnel {
    pub broker_host: String,
    pub public_port: u16,
    pub hidden_host: String,
    pub hidden_port: u16,
}

impl TcpTunnel {
    /// Dial both ends in the required order.
    ///
    /// The token must be flushed to the broker before the local dial starts:
    /// the broker cannot classify the connection until the token arrives, and
    /// a slow local service must not delay that. A local dial failure drops
    /// the broker socket, which tears the half-open session down on the
    /// other side once the caller reports NewTunnelFailed.
    pub async fn establish(&self, token: &[u8]) -> Result<(TcpStream, TcpStream), SessionError> {
        let broker_addr = format!("{}:{}", self.broker_host, self.public_port);
        let mut remote =
            TcpStream::connect(&broker_addr)
                .await
                .map_err(|source| SessionError::BrokerConnect {
                    addr: broker_addr,
                    source,
                })?;
        remote
            .write_all(token)
            .await
            .map_err(SessionError::TokenWrite)?;
        remote.flush().await.map_err(SessionError::TokenWrite)?;

        let local_addr = format!("{}:{}", self.hidden_host, self.hidden_port);
        let local = match timeout(LOCAL_CONNECT_TIMEOUT, TcpStream::connect(&local_addr)).await {
            Ok(Ok(local)) => local,
            Ok(Err(source)) => {
                return Err(SessionError::LocalConnect {
                    addr: local_addr,
                    source,
                })
            }
            Err(_) => return Err(SessionError::LocalTimeout { addr: local_addr }),
        };

        Ok((remote, local))
    }

    /// Establish and pipe until either end closes
    pub async fn run(&self, token: &[u8]) -> Result<(), SessionError> {
        let (mut remote, mut local) = self.establish(token).await?;

        match tokio::io::copy_bidirectional(&mut remote, &mut local).await {
            Ok((to_local, to_remote)) => {
                debug!(
                    "Tunnel to {}:{} closed: {} bytes in, {} bytes out",
                    self.hidden_host, self.hidden_port, to_local, to_remote
                );
            }
            Err(e) => {
                debug!(
                    "Tunnel to {}:{} ended with error: {}",
                    self.hidden_host, self.hidden_port, e
                );
            }
        }

        // Let in-flight writes drain before the sockets drop.
        tokio::time::sleep(SESSION_GRACE).await;
        Ok(())
    }
}
