//! Publisher-side UDP relay
//!
//! One ephemeral socket per UDP tunnel. Every received datagram is routed by
//! its source: datagrams from the broker host carry public-client traffic and
//! go to the hidden local service; datagrams from anywhere else (in practice
//! the local service replying) go back out to the broker's public port.

use burrow_proto::{same_host, SocketKind};
use std::net::{IpAddr, SocketAddr};
use thiserror::Error;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

const DATAGRAM_BUF: usize = 65536;

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Failed to bind relay socket: {0}")]
    Bind(#[source] std::io::Error),

    #[error("Relay socket failed: {0}")]
    Socket(#[source] std::io::Error),
}

/// Decide where a received datagram goes.
///
/// Pure routing: a datagram whose source is the broker host is forwarded to
/// the hidden service on the loopback matching the socket kind; any other
/// source means the hidden service is answering, so the datagram returns to
/// the broker's public port.
pub fn relay_target(
    kind: SocketKind,
    src: IpAddr,
    broker_host: IpAddr,
    hidden_port: u16,
    public_port: u16,
) -> SocketAddr {
    if same_host(src, broker_host) {
        let loopback: IpAddr = match kind {
            SocketKind::Udp6 => IpAddr::V6(std::net::Ipv6Addr::LOCALHOST),
            _ => IpAddr::V4(std::net::Ipv4Addr::LOCALHOST),
        };
        SocketAddr::new(loopback, hidden_port)
    } else {
        SocketAddr::new(broker_host, public_port)
    }
}

pub struct UdpRelay {
    socket: UdpSocket,
    kind: SocketKind,
    broker_host: IpAddr,
    hidden_port: u16,
    public_port: u16,
}

impl UdpRelay {
    /// Bind an ephemeral relay socket of the right address family
    pub async fn bind(
        kind: SocketKind,
        broker_host: IpAddr,
        hidden_port: u16,
        public_port: u16,
    ) -> Result<Self, RelayError> {
        let bind_addr = match kind {
            SocketKind::Udp6 => "[::]:0",
            _ => "0.0.0.0:0",
        };
        let socket = UdpSocket::bind(bind_addr).await.map_err(RelayError::Bind)?;
        Ok(Self {
            socket,
            kind,
            broker_host,
            hidden_port,
            public_port,
        })
    }

    /// Port to report via UdpRelayBound
    pub fn local_port(&self) -> Result<u16, RelayError> {
        Ok(self
            .socket
            .local_addr()
            .map_err(RelayError::Socket)?
            .port())
    }

    /// Shovel datagrams until the socket fails or the task is dropped.
    ///
    /// Any socket error abandons the whole session; datagrams are not worth
    /// retrying.
    pub async fn run(self) -> Result<(), RelayError> {
        let mut buf = vec![0u8; DATAGRAM_BUF];
        loop {
            let (len, src) = self
                .socket
                .recv_from(&mut buf)
                .await
                .map_err(RelayError::Socket)?;
            let target = relay_target(
                self.kind,
                src.ip(),
                self.broker_host,
                self.hidden_port,
                self.public_port,
            );
            if let Err(e) = self.socket.send_to(&buf[..len], target).await {
                warn!("Relay send to {} failed: {}", target, e);
                return Err(RelayError::Socket(e));
            }
            debug!("Relayed {} bytes from {} to {}", len, src, target);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_broker_sourced_datagram_goes_to_hidden_service() {
        let broker: IpAddr = "203.0.113.5".parse().unwrap();
        let target = relay_target(SocketKind::Udp4, broker, broker, 5353, 5454);
        assert_eq!(target, "127.0.0.1:5353".parse().unwrap());
    }

    #[test]
    fn test_other_sourced_datagram_goes_to_public_port() {
        let broker: IpAddr = "203.0.113.5".parse().unwrap();
        let local: IpAddr = "127.0.0.1".parse().unwrap();
        let target = relay_target(SocketKind::Udp4, local, broker, 5353, 5454);
        assert_eq!(target, "203.0.113.5:5454".parse().unwrap());
    }

    #[test]
    fn test_ipv4_mapped_broker_source_still_matches() {
        let broker: IpAddr = "203.0.113.5".parse().unwrap();
        let mapped: IpAddr = "::ffff:203.0.113.5".parse().unwrap();
        let target = relay_target(SocketKind::Udp4, mapped, broker, 5353, 5454);
        assert_eq!(target, "127.0.0.1:5353".parse().unwrap());
    }

    #[test]
    fn test_udp6_uses_ipv6_loopback() {
        let broker: IpAddr = "2001:db8::1".parse().unwrap();
        let target = relay_target(SocketKind::Udp6, broker, broker, 5353, 5454);
        assert_eq!(target, "[::1]:5353".parse().unwrap());
    }

    #[tokio::test]
    async fn test_relay_pipes_between_fake_broker_and_service() {
        // Both peers on loopback; the "broker" is whichever socket matches
        // the configured broker host, here 127.0.0.1, so the hidden service
        // must listen where broker-sourced datagrams are forwarded.
        let hidden = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let hidden_port = hidden.local_addr().unwrap().port();
        let broker = UdpSocket::bind("127.0.0.1:0").await.unwrap();

        let broker_host: IpAddr = "127.0.0.1".parse().unwrap();
        let relay = UdpRelay::bind(SocketKind::Udp4, broker_host, hidden_port, 0)
            .await
            .unwrap();
        let relay_port = relay.local_port().unwrap();
        tokio::spawn(relay.run());

        broker
            .send_to(b"query", ("127.0.0.1", relay_port))
            .await
            .unwrap();

        let mut buf = [0u8; 16];
        let (len, _) = tokio::time::timeout(
            std::time::Duration::from_secs(2),
            hidden.recv_from(&mut buf),
        )
        .await
        .unwrap()
        .unwrap();
        assert_eq!(&buf[..len], b"query");
    }
}
