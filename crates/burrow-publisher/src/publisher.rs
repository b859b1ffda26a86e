//! Control-channel client loop
//!
//! Keeps one WebSocket to the broker alive for the process lifetime,
//! reconnecting with exponential backoff. Every NewTunnel received spawns a
//! dial-back task; the loop itself only dispatches.

use crate::authority::{AuthorityClient, AuthorityError};
use crate::backoff::RetryContext;
use crate::config::PublisherConfig;
use crate::session::TcpTunnel;
use crate::udp::UdpRelay;
use burrow_proto::{
    new_id, parse_host, ControlMessage, ServiceInfo, SocketKind, CONTROL_WS_PATH,
};
use futures_util::{SinkExt, StreamExt};
use serde_json::json;
use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::header::AUTHORIZATION;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum ClientError {
    #[error("Control connection failed: {0}")]
    Connect(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Broker host {0} did not resolve to an address")]
    Resolve(String),

    #[error("Authority token is not usable as a header value")]
    BadToken,

    #[error(transparent)]
    Authority(#[from] AuthorityError),
}

pub struct PublisherClient {
    config: PublisherConfig,
    identity: String,
    authority: Option<AuthorityClient>,
    bearer: Mutex<Option<String>>,
    cancel: CancellationToken,
    tunnels: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl PublisherClient {
    pub fn new(config: PublisherConfig) -> Result<Arc<Self>, AuthorityError> {
        let identity = config.identity.clone().unwrap_or_else(new_id);
        let authority = match &config.authority {
            Some(auth) => Some(AuthorityClient::new(auth.url.clone(), auth.secret.clone())?),
            None => None,
        };
        Ok(Arc::new(Self {
            config,
            identity,
            authority,
            bearer: Mutex::new(None),
            cancel: CancellationToken::new(),
            tunnels: Mutex::new(HashMap::new()),
        }))
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    /// Run until [`stop`] is called.
    ///
    /// An authority refusal at startup is fatal; everything after that is
    /// retried with backoff.
    ///
    /// [`stop`]: PublisherClient::stop
    pub async fn run(self: Arc<Self>) -> Result<(), ClientError> {
        if let Some(authority) = &self.authority {
            let token = authority.fetch_token(&self.identity).await?;
            *self.bearer.lock().unwrap() = Some(token);
            info!("Authority token obtained for {}", self.identity);
        }

        let mut retry = RetryContext::new();
        loop {
            if self.cancel.is_cancelled() {
                break;
            }

            match self.run_connection(&mut retry).await {
                Ok(()) => debug!("Control connection closed"),
                Err(e) => warn!("Control connection failed: {}", e),
            }

            if self.cancel.is_cancelled() {
                break;
            }
            let delay = retry.next_delay();
            info!("Reconnecting to broker in {:?}", delay);
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }

        self.free_tunnels();
        Ok(())
    }

    /// Cancel the loop, the backoff timer and every live tunnel
    pub fn stop(&self) {
        info!("Stopping publisher {}", self.identity);
        self.cancel.cancel();
        self.free_tunnels();
    }

    async fn run_connection(
        self: &Arc<Self>,
        retry: &mut RetryContext,
    ) -> Result<(), ClientError> {
        let broker_ip = self.resolve_broker().await?;

        let url = format!(
            "ws://{}:{}{}",
            self.config.host, self.config.port, CONTROL_WS_PATH
        );
        let mut request = url.clone().into_client_request()?;
        if let Some(bearer) = self.bearer.lock().unwrap().as_deref() {
            let value = HeaderValue::from_str(&format!("Bearer {}", bearer))
                .map_err(|_| ClientError::BadToken)?;
            request.headers_mut().insert(AUTHORIZATION, value);
        }

        let (ws, _) = connect_async(request).await?;
        info!("Connected to broker at {}", url);
        retry.reset();

        let (mut sink, mut stream) = ws.split();
        let (out_tx, mut out_rx) = mpsc::channel::<ControlMessage>(64);

        let writer = tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let text = match msg.encode() {
                    Ok(text) => text,
                    Err(e) => {
                        warn!("Failed to encode control message: {}", e);
                        continue;
                    }
                };
                if sink.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        });

        let handshake = ControlMessage::Handshake {
            identity: self.identity.clone(),
            services: self.config.services.clone(),
        };
        let _ = out_tx.send(handshake).await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => break,
                frame = stream.next() => match frame {
                    Some(Ok(Message::Text(text))) => match ControlMessage::decode(&text) {
                        Ok(msg) => self.dispatch(msg, broker_ip, &out_tx),
                        Err(e) => warn!("Undecodable broker message: {}", e),
                    },
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        debug!("Control socket error: {}", e);
                        break;
                    }
                },
            }
        }

        writer.abort();
        self.free_tunnels();
        Ok(())
    }

    async fn resolve_broker(&self) -> Result<IpAddr, ClientError> {
        if let Some(ip) = parse_host(&self.config.host) {
            return Ok(ip);
        }
        tokio::net::lookup_host((self.config.host.as_str(), self.config.port))
            .await
            .ok()
            .and_then(|mut addrs| addrs.next())
            .map(|addr| addr.ip())
            .ok_or_else(|| ClientError::Resolve(self.config.host.clone()))
    }

    fn dispatch(
        self: &Arc<Self>,
        msg: ControlMessage,
        broker_ip: IpAddr,
        out_tx: &mpsc::Sender<ControlMessage>,
    ) {
        match msg {
            ControlMessage::NewTunnel {
                service_id,
                tunnel_id,
                hidden_port,
                public_port,
                socket_type,
            } => {
                let Some(service) = self.find_service(hidden_port, public_port, socket_type)
                else {
                    warn!(
                        "NewTunnel for unknown service mapping {}:{}, refusing",
                        hidden_port, public_port
                    );
                    let refusal = ControlMessage::NewTunnelFailed {
                        service_id,
                        tunnel_id,
                        hidden_port,
                        public_port,
                        reason: "no such service".to_string(),
                        socket_type,
                    };
                    let _ = out_tx.try_send(refusal);
                    return;
                };

                if socket_type.is_udp() {
                    self.spawn_udp_relay(
                        service_id,
                        tunnel_id,
                        hidden_port,
                        public_port,
                        socket_type,
                        broker_ip,
                        out_tx.clone(),
                    );
                } else {
                    self.spawn_tcp_tunnel(
                        service_id,
                        tunnel_id,
                        hidden_port,
                        public_port,
                        service.hidden_host().to_string(),
                        out_tx.clone(),
                    );
                }
            }
            ControlMessage::Unknown => debug!("Unknown broker message, ignoring"),
            other => debug!("Unexpected broker message {:?}, ignoring", other),
        }
    }

    fn find_service(
        &self,
        hidden_port: u16,
        public_port: u16,
        socket_type: SocketKind,
    ) -> Option<&ServiceInfo> {
        self.config.services.iter().find(|s| {
            s.hidden_port == hidden_port
                && s.public_port == public_port
                && s.socket_type == socket_type
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_tcp_tunnel(
        self: &Arc<Self>,
        service_id: String,
        tunnel_id: String,
        hidden_port: u16,
        public_port: u16,
        hidden_host: String,
        out_tx: mpsc::Sender<ControlMessage>,
    ) {
        info!("Dialing back for tunnel {}", tunnel_id);
        let client = self.clone();
        let task_tunnel_id = tunnel_id.clone();
        // Held across the spawn: the task removes itself under the same
        // lock, so it cannot run ahead of its own registration.
        let mut tunnels = self.tunnels.lock().unwrap();
        let task = tokio::spawn(async move {
            let tunnel_id = task_tunnel_id;
            let token = match client.session_token(&tunnel_id, &service_id).await {
                Ok(token) => token,
                Err(e) => {
                    warn!("Failed to sign token for tunnel {}: {}", tunnel_id, e);
                    let failed = ControlMessage::NewTunnelFailed {
                        service_id,
                        tunnel_id: tunnel_id.clone(),
                        hidden_port,
                        public_port,
                        reason: e.to_string(),
                        socket_type: SocketKind::Tcp,
                    };
                    let _ = out_tx.send(failed).await;
                    client.remove_tunnel(&tunnel_id);
                    return;
                }
            };

            let tunnel = TcpTunnel {
                broker_host: client.config.host.clone(),
                public_port,
                hidden_host,
                hidden_port,
            };
            if let Err(e) = tunnel.run(&token).await {
                warn!("Tunnel {} failed: {}", tunnel_id, e);
                let failed = ControlMessage::NewTunnelFailed {
                    service_id,
                    tunnel_id: tunnel_id.clone(),
                    hidden_port,
                    public_port,
                    reason: e.to_string(),
                    socket_type: SocketKind::Tcp,
                };
                let _ = out_tx.send(failed).await;
            }
            client.remove_tunnel(&tunnel_id);
        });
        tunnels.insert(tunnel_id, task);
    }

    #[allow(clippy::too_many_arguments)]
    fn spawn_udp_relay(
        self: &Arc<Self>,
        service_id: String,
        tunnel_id: String,
        hidden_port: u16,
        public_port: u16,
        socket_type: SocketKind,
        broker_ip: IpAddr,
        out_tx: mpsc::Sender<ControlMessage>,
    ) {
        info!("Binding UDP relay for tunnel {}", tunnel_id);
        let client = self.clone();
        let task_tunnel_id = tunnel_id.clone();
        // Same locking as the TCP path: register before the task can exit.
        let mut tunnels = self.tunnels.lock().unwrap();
        let task = tokio::spawn(async move {
            let tunnel_id = task_tunnel_id;
            let bound = async {
                let relay = UdpRelay::bind(socket_type, broker_ip, hidden_port, public_port).await?;
                let relay_port = relay.local_port()?;
                Ok::<_, crate::udp::RelayError>((relay, relay_port))
            }
            .await;

            let (relay, relay_port) = match bound {
                Ok(bound) => bound,
                Err(e) => {
                    warn!("Failed to bind relay for tunnel {}: {}", tunnel_id, e);
                    let failed = ControlMessage::NewTunnelFailed {
                        service_id,
                        tunnel_id: tunnel_id.clone(),
                        hidden_port,
                        public_port,
                        reason: e.to_string(),
                        socket_type,
                    };
                    let _ = out_tx.send(failed).await;
                    client.remove_tunnel(&tunnel_id);
                    return;
                }
            };

            let bound_msg = ControlMessage::UdpRelayBound {
                service_id,
                tunnel_id: tunnel_id.clone(),
                hidden_port,
                public_port,
                socket_type,
                relay_port,
            };
            let _ = out_tx.send(bound_msg).await;

            if let Err(e) = relay.run().await {
                debug!("UDP relay for tunnel {} ended: {}", tunnel_id, e);
            }
            client.remove_tunnel(&tunnel_id);
        });
        tunnels.insert(tunnel_id, task);
    }

    /// Token written as the first bytes of a dial-back, authority-signed
    /// when an authority is configured
    async fn session_token(
        &self,
        tunnel_id: &str,
        service_id: &str,
    ) -> Result<Vec<u8>, AuthorityError> {
        let token = json!({ "tunnelId": tunnel_id, "serviceId": service_id });
        let bearer = self.bearer.lock().unwrap().clone();
        match (&self.authority, bearer) {
            (Some(authority), Some(bearer)) => {
                let signed = authority.sign(&bearer, token).await?;
                Ok(signed.to_string().into_bytes())
            }
            _ => Ok(token.to_string().into_bytes()),
        }
    }

    fn remove_tunnel(&self, tunnel_id: &str) {
        self.tunnels.lock().unwrap().remove(tunnel_id);
    }

    fn free_tunnels(&self) {
        for (tunnel_id, task) in self.tunnels.lock().unwrap().drain() {
            debug!("Freeing tunnel {}", tunnel_id);
            task.abort();
        }
    }

    pub fn tunnel_count(&self) -> usize {
        self.tunnels.lock().unwrap().len()
    }
}
