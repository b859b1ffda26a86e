//! Session state machine for one published service
//!
//! A session pairs an inbound public-side socket with the publisher-side
//! socket that answers it. It is `AwaitingPublisher` from the moment the
//! public client's first bytes are buffered until the publisher dials back
//! with a matching token, `Spliced` while the two sockets pipe into each
//! other, and gone from the map once either side closes.

use crate::acceptor::AcceptorHandle;
use crate::udp::UdpPublicService;
use burrow_proto::ServiceInfo;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

enum TunnelSession {
    /// Public-side socket accepted, publisher notified, initial bytes buffered
    AwaitingPublisher {
        client: TcpStream,
        buffered: Vec<u8>,
    },
    /// Publisher-side socket matched, bidirectional piping active
    Spliced { pipe: Option<JoinHandle<()>> },
}

/// Broker-side object for one declared service: the listening-socket handle
/// and every session multiplexed through it
pub struct PublishedService {
    pub service_id: String,
    pub info: ServiceInfo,
    pub acceptor: AcceptorHandle,
    /// Set for UDP-typed services only
    pub udp: Option<Arc<UdpPublicService>>,
    sessions: Mutex<HashMap<String, TunnelSession>>,
    grace: Duration,
}

impl PublishedService {
    pub fn new(
        service_id: String,
        info: ServiceInfo,
        acceptor: AcceptorHandle,
        udp: Option<Arc<UdpPublicService>>,
        grace: Duration,
    ) -> Self {
        Self {
            service_id,
            info,
            acceptor,
            udp,
            sessions: Mutex::new(HashMap::new()),
            grace,
        }
    }

    pub fn display_name(&self) -> &str {
        self.info.name.as_deref().unwrap_or(&self.service_id)
    }

    /// Register a half-open session for a public client whose first bytes
    /// have been read off the wire.
    ///
    /// Must complete before the publisher is told about the session, so a
    /// fast dial-back always finds the session registered.
    pub fn register_awaiting(&self, tunnel_id: String, client: TcpStream, buffered: Vec<u8>) {
        self.sessions.lock().unwrap().insert(
            tunnel_id,
            TunnelSession::AwaitingPublisher { client, buffered },
        );
    }

    /// Transition a session to `Spliced` with the publisher-side socket.
    ///
    /// Replays the buffered client bytes to the publisher socket first (bytes
    /// already read off the wire cannot be un-read), then pipes both
    /// directions until either end closes. A tunnel id that is unknown or
    /// already spliced is a no-op: the late socket is dropped and the
    /// existing splice is never replaced.
    pub fn splice(self: &Arc<Self>, tunnel_id: &str, publisher_socket: TcpStream) {
        let (client, buffered) = {
            let mut sessions = self.sessions.lock().unwrap();
            match sessions.remove(tunnel_id) {
                Some(TunnelSession::AwaitingPublisher { client, buffered }) => {
                    // Reserve the slot so a duplicate dial-back arriving
                    // mid-splice is rejected.
                    sessions.insert(tunnel_id.to_string(), TunnelSession::Spliced { pipe: None });
                    (client, buffered)
                }
                Some(spliced @ TunnelSession::Spliced { .. }) => {
                    sessions.insert(tunnel_id.to_string(), spliced);
                    debug!(
                        "Duplicate dial-back for already-spliced tunnel {}, ignoring",
                        tunnel_id
                    );
                    return;
                }
                None => {
                    debug!("Dial-back for unknown tunnel {}, ignoring", tunnel_id);
                    return;
                }
            }
        };

        info!(
            "Splicing tunnel {} for service {}",
            tunnel_id,
            self.display_name()
        );

        let service = self.clone();
        let tunnel_id_owned = tunnel_id.to_string();
        let grace = self.grace;
        let pipe = tokio::spawn(async move {
            Self::pipe_sessions(client, publisher_socket, &buffered, grace).await;
            service.end_session(&tunnel_id_owned);
        });

        let mut sessions = self.sessions.lock().unwrap();
        if let Some(TunnelSession::Spliced { pipe: slot }) = sessions.get_mut(tunnel_id) {
            *slot = Some(pipe);
        }
        // If the entry is already gone the pipe finished before we got here;
        // nothing left to track.
    }

    async fn pipe_sessions(
        mut client: TcpStream,
        mut publisher: TcpStream,
        buffered: &[u8],
        grace: Duration,
    ) {
        if !buffered.is_empty() {
            if let Err(e) = publisher.write_all(buffered).await {
                warn!("Failed to replay buffered client bytes: {}", e);
                return;
            }
        }

        match tokio::io::copy_bidirectional(&mut client, &mut publisher).await {
            Ok((to_publisher, to_client)) => {
                debug!(
                    "Tunnel closed: {} bytes to publisher, {} bytes to client",
                    to_publisher, to_client
                );
            }
            Err(e) => {
                debug!("Tunnel pipe ended with error: {}", e);
            }
        }

        // Let in-flight writes flush before hard-destroying the sockets.
        tokio::time::sleep(grace).await;
    }

    /// Pipe task completed: drop the session without aborting ourselves
    fn end_session(&self, tunnel_id: &str) {
        if self.sessions.lock().unwrap().remove(tunnel_id).is_some() {
            debug!("Session {} ended", tunnel_id);
        }
    }

    /// Tear down one session from outside (publisher failure, service
    /// replacement, publisher disconnect)
    pub fn free_session(&self, tunnel_id: &str) {
        let session = self.sessions.lock().unwrap().remove(tunnel_id);
        match session {
            Some(TunnelSession::Spliced { pipe }) => {
                if let Some(pipe) = pipe {
                    pipe.abort();
                }
                debug!("Freed spliced session {}", tunnel_id);
            }
            Some(TunnelSession::AwaitingPublisher { .. }) => {
                debug!("Freed half-open session {}", tunnel_id);
            }
            None => {}
        }
        if let Some(udp) = &self.udp {
            udp.free_tunnel(tunnel_id);
        }
    }

    /// Tear down every session of this service
    pub fn free_all(&self) {
        let sessions: Vec<String> = self.sessions.lock().unwrap().keys().cloned().collect();
        for tunnel_id in sessions {
            self.free_session(&tunnel_id);
        }
    }

    /// Whether the named session exists and is still waiting for its
    /// publisher-side socket
    pub fn is_awaiting(&self, tunnel_id: &str) -> bool {
        matches!(
            self.sessions.lock().unwrap().get(tunnel_id),
            Some(TunnelSession::AwaitingPublisher { .. })
        )
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }
}

impl Drop for PublishedService {
    fn drop(&mut self) {
        for (_, session) in self.sessions.lock().unwrap().drain() {
            if let TunnelSession::Spliced { pipe: Some(pipe) } = session {
                pipe.abort();
            }
        }
    }
}
