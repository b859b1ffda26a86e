//! Broker-side state for one connected publisher
//!
//! A `Publisher` owns everything derived from a single control connection:
//! the declared service set, the acceptor pool backing the public ports, and
//! every live session. Dropping the control connection frees all of it.

use crate::acceptor::{AcceptCallback, AcceptorPool};
use crate::session::PublishedService;
use crate::udp::UdpPublicService;
use burrow_proto::{
    new_id, same_host, ControlMessage, ServiceInfo, TunnelToken, PEEK_LIMIT,
};
use std::collections::HashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

pub struct Publisher {
    pub identity: String,
    /// Address the control connection came from; the trust boundary for
    /// classifying dial-back sockets
    pub peer_addr: IpAddr,
    control_tx: mpsc::Sender<ControlMessage>,
    pool: AcceptorPool,
    services: Mutex<HashMap<String, Arc<PublishedService>>>,
    grace: Duration,
}

impl Publisher {
    pub fn new(
        identity: String,
        peer_addr: IpAddr,
        control_tx: mpsc::Sender<ControlMessage>,
        acceptor_limit: usize,
        grace: Duration,
    ) -> Arc<Self> {
        Arc::new(Self {
            identity,
            peer_addr,
            control_tx,
            pool: AcceptorPool::new(acceptor_limit),
            services: Mutex::new(HashMap::new()),
            grace,
        })
    }

    /// Dispatch one decoded control message
    pub async fn handle_message(self: &Arc<Self>, msg: ControlMessage) {
        match msg {
            ControlMessage::Handshake { services, .. }
            | ControlMessage::Services { services } => {
                self.set_services(services).await;
            }
            ControlMessage::NewTunnelFailed {
                service_id,
                tunnel_id,
                reason,
                ..
            } => {
                warn!(
                    "Publisher {} failed tunnel {}: {}",
                    self.identity, tunnel_id, reason
                );
                match self.service(&service_id) {
                    Some(service) => service.free_session(&tunnel_id),
                    None => debug!("NewTunnelFailed for unknown service {}", service_id),
                }
            }
            ControlMessage::UdpRelayBound {
                service_id,
                tunnel_id,
                relay_port,
                ..
            } => match self.service(&service_id) {
                Some(service) => match &service.udp {
                    Some(udp) => udp.bind_relay(&tunnel_id, relay_port).await,
                    None => debug!("UdpRelayBound for non-UDP service {}", service_id),
                },
                None => debug!("UdpRelayBound for unknown service {}", service_id),
            },
            ControlMessage::NewTunnel { tunnel_id, .. } => {
                debug!(
                    "Publisher {} sent broker-direction NewTunnel {}, ignoring",
                    self.identity, tunnel_id
                );
            }
            ControlMessage::Unknown => {
                debug!("Unknown control message from publisher {}, ignoring", self.identity);
            }
        }
    }

    /// Replace the declared service set.
    ///
    /// Tears down every existing acceptor and session first, then binds one
    /// public socket per declared service. A service whose port cannot be
    /// bound, or that does not fit in the pool, is skipped with a warning;
    /// its siblings still come up.
    pub async fn set_services(self: &Arc<Self>, services: Vec<ServiceInfo>) {
        self.clear_services();

        for info in services {
            let service_id = new_id();
            let result = if info.socket_type.is_udp() {
                self.publish_udp(service_id.clone(), info.clone()).await
            } else {
                self.publish_tcp(service_id.clone(), info.clone()).await
            };
            match result {
                Ok(service) => {
                    info!(
                        "Published service {} ({}) on public port {}",
                        service.display_name(),
                        info.socket_type.as_str(),
                        info.public_port
                    );
                    self.services.lock().unwrap().insert(service_id, service);
                }
                Err(e) => {
                    warn!(
                        "Skipping service on public port {} for publisher {}: {}",
                        info.public_port, self.identity, e
                    );
                }
            }
        }
    }

    async fn publish_tcp(
        self: &Arc<Self>,
        service_id: String,
        info: ServiceInfo,
    ) -> Result<Arc<PublishedService>, crate::acceptor::AcceptorError> {
        let weak: Weak<Publisher> = Arc::downgrade(self);
        let callback_service_id = service_id.clone();
        let on_accept: AcceptCallback = Arc::new(move |socket, peer| {
            let Some(publisher) = weak.upgrade() else {
                return;
            };
            let service_id = callback_service_id.clone();
            tokio::spawn(async move {
                publisher.handle_public_connection(service_id, socket, peer).await;
            });
        });

        let acceptor = self.pool.create(info.public_port, on_accept).await?;
        Ok(Arc::new(PublishedService::new(
            service_id, info, acceptor, None, self.grace,
        )))
    }

    async fn publish_udp(
        self: &Arc<Self>,
        service_id: String,
        info: ServiceInfo,
    ) -> Result<Arc<PublishedService>, crate::acceptor::AcceptorError> {
        let udp = UdpPublicService::bind(
            service_id.clone(),
            info.clone(),
            self.peer_addr,
            self.control_tx.clone(),
        )
        .await
        .map_err(|source| crate::acceptor::AcceptorError::Bind {
            port: info.public_port,
            source,
        })?;

        let local_port = udp.local_port();
        let task = tokio::spawn(udp.clone().run());
        let acceptor = self.pool.adopt(local_port, task)?;

        Ok(Arc::new(PublishedService::new(
            service_id,
            info,
            acceptor,
            Some(udp),
            self.grace,
        )))
    }

    /// Classify and route one accepted public-port TCP connection.
    ///
    /// The first chunk read is the peek: a parseable tunnel token from the
    /// publisher's own address is a dial-back and splices the named session;
    /// anything else, including JSON lookalikes from other addresses, is
    /// client payload and opens a session with those bytes preserved.
    async fn handle_public_connection(
        self: Arc<Self>,
        service_id: String,
        mut socket: TcpStream,
        peer: SocketAddr,
    ) {
        let Some(service) = self.service(&service_id) else {
            debug!("Connection for unpublished service {}, closing", service_id);
            return;
        };

        let mut buf = vec![0u8; PEEK_LIMIT];
        let len = match socket.read(&mut buf).await {
            Ok(0) => {
                debug!("Peer {} closed before sending anything", peer);
                return;
            }
            Ok(len) => len,
            Err(e) => {
                debug!("Failed first read from {}: {}", peer, e);
                return;
            }
        };
        buf.truncate(len);

        if let Some(token) = TunnelToken::parse(&buf) {
            if same_host(peer.ip(), self.peer_addr) {
                let target = match self.service(&token.service_id) {
                    Some(target) => target,
                    None => {
                        debug!(
                            "Dial-back token names unknown service {}, dropping",
                            token.service_id
                        );
                        return;
                    }
                };
                target.splice(&token.tunnel_id, socket);
                return;
            }
            debug!(
                "Token-shaped payload from non-publisher address {}, treating as client data",
                peer
            );
        }

        self.open_client_session(service, socket, buf).await;
    }

    /// Register a half-open session for a public client and ask the
    /// publisher to dial back.
    ///
    /// The session enters the map before NewTunnel is sent, so the dial-back
    /// can never race ahead of registration.
    async fn open_client_session(
        &self,
        service: Arc<PublishedService>,
        socket: TcpStream,
        buffered: Vec<u8>,
    ) {
        let tunnel_id = new_id();
        info!(
            "New session {} for service {}",
            tunnel_id,
            service.display_name()
        );
        service.register_awaiting(tunnel_id.clone(), socket, buffered);

        let msg = ControlMessage::NewTunnel {
            service_id: service.service_id.clone(),
            tunnel_id: tunnel_id.clone(),
            hidden_port: service.info.hidden_port,
            public_port: service.info.public_port,
            socket_type: service.info.socket_type,
        };
        if self.control_tx.send(msg).await.is_err() {
            debug!("Control channel gone, freeing session {}", tunnel_id);
            service.free_session(&tunnel_id);
        }
    }

    /// Tear down every service, acceptor and session
    pub fn clear_services(&self) {
        let services: Vec<Arc<PublishedService>> =
            self.services.lock().unwrap().drain().map(|(_, s)| s).collect();
        for service in services {
            service.free_all();
            self.pool.free(&service.acceptor);
        }
    }

    /// Free everything owned by this publisher
    pub fn shutdown(&self) {
        info!("Shutting down publisher {}", self.identity);
        self.clear_services();
        self.pool.free_all();
    }

    fn service(&self, service_id: &str) -> Option<Arc<PublishedService>> {
        self.services.lock().unwrap().get(service_id).cloned()
    }

    /// Snapshot of the published services
    pub fn services(&self) -> Vec<Arc<PublishedService>> {
        self.services.lock().unwrap().values().cloned().collect()
    }

    /// Port a published service actually listens on
    pub fn public_port(&self, service: &PublishedService) -> Option<u16> {
        match &service.udp {
            Some(udp) => Some(udp.local_port()),
            None => self.pool.local_port(&service.acceptor),
        }
    }

    pub fn live_acceptors(&self) -> usize {
        self.pool.live_count()
    }
}

impl Drop for Publisher {
    fn drop(&mut self) {
        self.pool.free_all();
    }
}
