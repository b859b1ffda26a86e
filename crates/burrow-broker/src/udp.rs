//! Public-facing UDP relay for one published service
//!
//! UDP has no accept step, so sessions are keyed by datagram source address.
//! A datagram from an unknown client opens a session: the datagram is buffered
//! and the publisher is asked to bind an ephemeral relay socket. Once the
//! publisher reports its relay port, buffered and subsequent client datagrams
//! are forwarded there, and datagrams arriving *from* the publisher host are
//! routed back to whichever client the source port belongs to.

use burrow_proto::{new_id, same_host, ControlMessage, ServiceInfo};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex};
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

const DATAGRAM_BUF: usize = 65536;

/// Most datagrams held per client while its relay port is still unknown.
/// A client spamming a session whose publisher never answers must not grow
/// the buffer without limit; overflow datagrams are dropped.
const PENDING_DATAGRAMS: usize = 16;

struct UdpTunnel {
    tunnel_id: String,
    /// Publisher relay port, once reported via UdpRelayBound
    relay_port: Option<u16>,
    /// Client datagrams received before the relay port was known
    pending: Vec<Vec<u8>>,
}

#[derive(Default)]
struct UdpState {
    by_client: HashMap<SocketAddr, UdpTunnel>,
    by_relay_port: HashMap<u16, SocketAddr>,
    by_tunnel: HashMap<String, SocketAddr>,
}

/// One public UDP socket and the datagram sessions multiplexed through it
pub struct UdpPublicService {
    service_id: String,
    info: ServiceInfo,
    socket: Arc<UdpSocket>,
    publisher_addr: IpAddr,
    control_tx: mpsc::Sender<ControlMessage>,
    state: Mutex<UdpState>,
}

impl UdpPublicService {
    /// Bind the public socket for a UDP service.
    ///
    /// Binds `0.0.0.0` or `[::]` depending on the declared socket kind.
    pub async fn bind(
        service_id: String,
        info: ServiceInfo,
        publisher_addr: IpAddr,
        control_tx: mpsc::Sender<ControlMessage>,
    ) -> std::io::Result<Arc<Self>> {
        let bind_addr = if info.socket_type == burrow_proto::SocketKind::Udp6 {
            SocketAddr::new(IpAddr::V6(std::net::Ipv6Addr::UNSPECIFIED), info.public_port)
        } else {
            SocketAddr::new(IpAddr::V4(std::net::Ipv4Addr::UNSPECIFIED), info.public_port)
        };
        let socket = Arc::new(UdpSocket::bind(bind_addr).await?);
        info!(
            "UDP service {} listening on port {}",
            service_id,
            socket.local_addr()?.port()
        );

        Ok(Arc::new(Self {
            service_id,
            info,
            socket,
            publisher_addr,
            control_tx,
            state: Mutex::new(UdpState::default()),
        }))
    }

    pub fn local_port(&self) -> u16 {
        self.socket.local_addr().map(|a| a.port()).unwrap_or(0)
    }

    /// Drive the public socket until it fails or the task is aborted
    pub async fn run(self: Arc<Self>) {
        let mut buf = vec![0u8; DATAGRAM_BUF];
        loop {
            let (len, src) = match self.socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    warn!(
                        "UDP socket for service {} failed: {}, dropping all sessions",
                        self.service_id, e
                    );
                    let mut state = self.state.lock().unwrap();
                    state.by_client.clear();
                    state.by_relay_port.clear();
                    state.by_tunnel.clear();
                    return;
                }
            };
            let datagram = &buf[..len];

            if same_host(src.ip(), self.publisher_addr) {
                self.relay_to_client(src.port(), datagram).await;
            } else {
                self.relay_from_client(src, datagram).await;
            }
        }
    }

    /// Datagram from the publisher host: route back to the client recorded
    /// for its source port
    async fn relay_to_client(&self, relay_port: u16, datagram: &[u8]) {
        let client = self
            .state
            .lock()
            .unwrap()
            .by_relay_port
            .get(&relay_port)
            .copied();
        match client {
            Some(client) => {
                if let Err(e) = self.socket.send_to(datagram, client).await {
                    debug!("Failed to forward datagram to client {}: {}", client, e);
                }
            }
            None => debug!(
                "Datagram from unknown relay port {} on service {}, dropping",
                relay_port, self.service_id
            ),
        }
    }

    /// Datagram from a public client: forward to its relay, or open a session
    async fn relay_from_client(&self, src: SocketAddr, datagram: &[u8]) {
        let action = {
            let mut state = self.state.lock().unwrap();
            match state.by_client.get_mut(&src) {
                Some(tunnel) => match tunnel.relay_port {
                    Some(port) => ClientAction::Forward(port),
                    None => {
                        if tunnel.pending.len() < PENDING_DATAGRAMS {
                            tunnel.pending.push(datagram.to_vec());
                        } else {
                            debug!(
                                "Pending buffer full for tunnel {}, dropping datagram",
                                tunnel.tunnel_id
                            );
                        }
                        ClientAction::Buffered
                    }
                },
                None => {
                    let tunnel_id = new_id();
                    state.by_client.insert(
                        src,
                        UdpTunnel {
                            tunnel_id: tunnel_id.clone(),
                            relay_port: None,
                            pending: vec![datagram.to_vec()],
                        },
                    );
                    state.by_tunnel.insert(tunnel_id.clone(), src);
                    ClientAction::Open(tunnel_id)
                }
            }
        };

        match action {
            ClientAction::Forward(port) => {
                let target = SocketAddr::new(self.publisher_addr, port);
                if let Err(e) = self.socket.send_to(datagram, target).await {
                    debug!("Failed to forward datagram to relay {}: {}", target, e);
                }
            }
            ClientAction::Buffered => {}
            ClientAction::Open(tunnel_id) => {
                info!(
                    "New UDP session {} from {} on service {}",
                    tunnel_id, src, self.service_id
                );
                let msg = ControlMessage::NewTunnel {
                    service_id: self.service_id.clone(),
                    tunnel_id: tunnel_id.clone(),
                    hidden_port: self.info.hidden_port,
                    public_port: self.info.public_port,
                    socket_type: self.info.socket_type,
                };
                if self.control_tx.send(msg).await.is_err() {
                    debug!("Control channel gone, dropping UDP session {}", tunnel_id);
                    self.free_tunnel(&tunnel_id);
                }
            }
        }
    }

    /// Publisher reported its relay port: record the mapping and flush
    /// datagrams buffered while the session was opening
    pub async fn bind_relay(&self, tunnel_id: &str, relay_port: u16) {
        let pending = {
            let mut state = self.state.lock().unwrap();
            let Some(client) = state.by_tunnel.get(tunnel_id).copied() else {
                debug!("UdpRelayBound for unknown tunnel {}, ignoring", tunnel_id);
                return;
            };
            state.by_relay_port.insert(relay_port, client);
            match state.by_client.get_mut(&client) {
                Some(tunnel) => {
                    tunnel.relay_port = Some(relay_port);
                    std::mem::take(&mut tunnel.pending)
                }
                None => return,
            }
        };

        let target = SocketAddr::new(self.publisher_addr, relay_port);
        for datagram in pending {
            if let Err(e) = self.socket.send_to(&datagram, target).await {
                debug!("Failed to flush buffered datagram to {}: {}", target, e);
                return;
            }
        }
    }

    /// Drop one datagram session and its port mapping
    pub fn free_tunnel(&self, tunnel_id: &str) {
        let mut state = self.state.lock().unwrap();
        if let Some(client) = state.by_tunnel.remove(tunnel_id) {
            if let Some(tunnel) = state.by_client.remove(&client) {
                if let Some(port) = tunnel.relay_port {
                    state.by_relay_port.remove(&port);
                }
                debug!("Freed UDP session {} for client {}", tunnel.tunnel_id, client);
            }
        }
    }

    pub fn session_count(&self) -> usize {
        self.state.lock().unwrap().by_client.len()
    }
}

enum ClientAction {
    Forward(u16),
    Buffered,
    Open(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use burrow_proto::SocketKind;
    use std::time::Duration;

    fn udp_service_info(public_port: u16) -> ServiceInfo {
        ServiceInfo {
            name: None,
            socket_type: SocketKind::Udp4,
            hidden_port: 5353,
            public_port,
            hidden_host: None,
        }
    }

    #[tokio::test]
    async fn test_first_datagram_opens_session_and_notifies() {
        let (tx, mut rx) = mpsc::channel(4);
        let publisher_addr: IpAddr = "203.0.113.5".parse().unwrap();
        let service = UdpPublicService::bind(
            "svc-udp".to_string(),
            udp_service_info(0),
            publisher_addr,
            tx,
        )
        .await
        .unwrap();
        let port = service.local_port();
        tokio::spawn(service.clone().run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", ("127.0.0.1", port)).await.unwrap();

        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        match msg {
            ControlMessage::NewTunnel {
                service_id,
                socket_type,
                hidden_port,
                ..
            } => {
                assert_eq!(service_id, "svc-udp");
                assert_eq!(socket_type, SocketKind::Udp4);
                assert_eq!(hidden_port, 5353);
            }
            other => panic!("expected NewTunnel, got {:?}", other),
        }
        assert_eq!(service.session_count(), 1);
    }

    #[tokio::test]
    async fn test_second_datagram_from_same_client_is_buffered_not_renotified() {
        let (tx, mut rx) = mpsc::channel(4);
        let publisher_addr: IpAddr = "203.0.113.5".parse().unwrap();
        let service = UdpPublicService::bind(
            "svc-udp".to_string(),
            udp_service_info(0),
            publisher_addr,
            tx,
        )
        .await
        .unwrap();
        let port = service.local_port();
        tokio::spawn(service.clone().run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"one", ("127.0.0.1", port)).await.unwrap();
        client.send_to(b"two", ("127.0.0.1", port)).await.unwrap();

        // Exactly one NewTunnel for the pair
        let first = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(matches!(first, Some(ControlMessage::NewTunnel { .. })));
        let second = tokio::time::timeout(Duration::from_millis(200), rx.recv()).await;
        assert!(second.is_err());
        assert_eq!(service.session_count(), 1);
    }

    #[tokio::test]
    async fn test_relay_bound_flushes_buffer_and_routes_replies() {
        // The publisher host is loopback here, so the client has to come
        // from a second loopback address to land on the client path.
        let (tx, mut rx) = mpsc::channel(4);
        let publisher_addr: IpAddr = "127.0.0.1".parse().unwrap();
        let service = UdpPublicService::bind(
            "svc-udp".to_string(),
            udp_service_info(0),
            publisher_addr,
            tx,
        )
        .await
        .unwrap();
        let port = service.local_port();
        tokio::spawn(service.clone().run());

        let client = UdpSocket::bind("127.0.0.2:0").await.unwrap();
        client.send_to(b"first", ("127.0.0.1", port)).await.unwrap();
        client.send_to(b"second", ("127.0.0.1", port)).await.unwrap();

        let tunnel_id = match tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ControlMessage::NewTunnel { tunnel_id, .. } => tunnel_id,
            other => panic!("expected NewTunnel, got {:?}", other),
        };
        tokio::time::sleep(Duration::from_millis(100)).await;

        // Publisher reports its relay port: both buffered datagrams flush
        // to it in order
        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_port = relay.local_addr().unwrap().port();
        service.bind_relay(&tunnel_id, relay_port).await;

        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), relay.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"first");
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), relay.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"second");

        // A datagram sourced from the publisher's relay port routes back
        // to the recorded client
        relay
            .send_to(b"reply", ("127.0.0.1", port))
            .await
            .unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"reply");

        // Once the relay port is known, client datagrams forward directly
        client.send_to(b"third", ("127.0.0.1", port)).await.unwrap();
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), relay.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"third");
    }

    #[tokio::test]
    async fn test_pending_buffer_is_bounded() {
        let (tx, mut rx) = mpsc::channel(4);
        let publisher_addr: IpAddr = "127.0.0.1".parse().unwrap();
        let service = UdpPublicService::bind(
            "svc-udp".to_string(),
            udp_service_info(0),
            publisher_addr,
            tx,
        )
        .await
        .unwrap();
        let port = service.local_port();
        tokio::spawn(service.clone().run());

        let client = UdpSocket::bind("127.0.0.2:0").await.unwrap();
        for i in 0..PENDING_DATAGRAMS + 4 {
            let payload = format!("d{}", i);
            client
                .send_to(payload.as_bytes(), ("127.0.0.1", port))
                .await
                .unwrap();
        }
        let tunnel_id = match tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap()
        {
            ControlMessage::NewTunnel { tunnel_id, .. } => tunnel_id,
            other => panic!("expected NewTunnel, got {:?}", other),
        };
        tokio::time::sleep(Duration::from_millis(200)).await;

        let relay = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let relay_port = relay.local_addr().unwrap().port();
        service.bind_relay(&tunnel_id, relay_port).await;

        // Exactly the buffered cap arrives; overflow datagrams were dropped
        let mut buf = [0u8; 64];
        let mut received = 0;
        while tokio::time::timeout(Duration::from_millis(300), relay.recv_from(&mut buf))
            .await
            .is_ok()
        {
            received += 1;
        }
        assert_eq!(received, PENDING_DATAGRAMS);
    }

    #[tokio::test]
    async fn test_free_tunnel_removes_session() {
        let (tx, mut rx) = mpsc::channel(4);
        let publisher_addr: IpAddr = "203.0.113.5".parse().unwrap();
        let service = UdpPublicService::bind(
            "svc-udp".to_string(),
            udp_service_info(0),
            publisher_addr,
            tx,
        )
        .await
        .unwrap();
        let port = service.local_port();
        tokio::spawn(service.clone().run());

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", ("127.0.0.1", port)).await.unwrap();
        let msg = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap()
            .unwrap();
        let tunnel_id = match msg {
            ControlMessage::NewTunnel { tunnel_id, .. } => tunnel_id,
            other => panic!("expected NewTunnel, got {:?}", other),
        };

        service.free_tunnel(&tunnel_id);
        assert_eq!(service.session_count(), 0);

        // A fresh datagram from the same client opens a new session
        client.send_to(b"again", ("127.0.0.1", port)).await.unwrap();
        let reopened = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert!(matches!(reopened, Some(ControlMessage::NewTunnel { .. })));
    }
}
