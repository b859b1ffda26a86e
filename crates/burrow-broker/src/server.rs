//! Control-plane WebSocket server
//!
//! Publishers connect here, introduce themselves with a Handshake, and keep
//! the connection open for the lifetime of their published services. The
//! connection closing, for any reason, frees everything the publisher owned.

use crate::publisher::Publisher;
use burrow_proto::ControlMessage;
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Failed to bind control listener on {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Address the control WebSocket listener binds
    pub control_addr: SocketAddr,
    /// Maximum public ports per publisher
    pub acceptor_limit: usize,
    /// Linger applied to spliced sockets after either end closes
    pub grace: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            control_addr: "0.0.0.0:11805".parse().unwrap(),
            acceptor_limit: 64,
            grace: Duration::from_millis(500),
        }
    }
}

pub struct Broker {
    config: BrokerConfig,
    publishers: Mutex<HashMap<String, Arc<Publisher>>>,
    listen_task: Mutex<Option<JoinHandle<()>>>,
}

impl Broker {
    pub fn new(config: BrokerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            publishers: Mutex::new(HashMap::new()),
            listen_task: Mutex::new(None),
        })
    }

    /// Bind the control listener and start accepting publishers.
    ///
    /// Returns the bound address; the accept loop runs until [`shutdown`].
    ///
    /// [`shutdown`]: Broker::shutdown
    pub async fn listen(self: &Arc<Self>) -> Result<SocketAddr, BrokerError> {
        let listener = TcpListener::bind(self.config.control_addr)
            .await
            .map_err(|source| BrokerError::Bind {
                addr: self.config.control_addr,
                source,
            })?;
        let addr = listener.local_addr().map_err(|source| BrokerError::Bind {
            addr: self.config.control_addr,
            source,
        })?;
        info!("Control listener bound on {}", addr);

        let broker = self.clone();
        let task = tokio::spawn(async move {
            loop {
                match listener.accept().await {
                    Ok((stream, peer)) => {
                        debug!("Control connection from {}", peer);
                        tokio::spawn(broker.clone().handle_control_connection(stream, peer));
                    }
                    Err(e) => warn!("Failed to accept control connection: {}", e),
                }
            }
        });
        *self.listen_task.lock().unwrap() = Some(task);

        Ok(addr)
    }

    async fn handle_control_connection(self: Arc<Self>, stream: TcpStream, peer: SocketAddr) {
        let ws = match tokio_tungstenite::accept_async(stream).await {
            Ok(ws) => ws,
            Err(e) => {
                warn!("WebSocket handshake with {} failed: {}", peer, e);
                return;
            }
        };
        let (mut sink, mut stream) = ws.split();

        // The first frame must introduce the publisher
        let (identity, services) = loop {
            match stream.next().await {
                Some(Ok(Message::Text(text))) => match ControlMessage::decode(&text) {
                    Ok(ControlMessage::Handshake { identity, services }) => {
                        break (identity, services)
                    }
                    Ok(other) => {
                        warn!("First message from {} is {:?}, not Handshake, closing", peer, other);
                        return;
                    }
                    Err(e) => {
                        warn!("Undecodable first message from {}: {}, closing", peer, e);
                        return;
                    }
                },
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Ok(_)) | Some(Err(_)) | None => {
                    debug!("Control connection from {} closed before Handshake", peer);
                    return;
                }
            }
        };

        let (control_tx, mut control_rx) = mpsc::channel::<ControlMessage>(64);
        let publisher = Publisher::new(
            identity.clone(),
            peer.ip(),
            control_tx,
            self.config.acceptor_limit,
            self.config.grace,
        );
        info!("Publisher {} connected from {}", identity, peer);

        // A reconnecting publisher replaces its previous incarnation
        if let Some(old) = self
            .publishers
            .lock()
            .unwrap()
            .insert(identity.clone(), publisher.clone())
        {
            info!("Replacing previous connection for publisher {}", identity);
            old.shutdown();
        }

        publisher.set_services(services).await;

        let writer = tokio::spawn(async move {
            while let Some(msg) = control_rx.recv().await {
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

        while let Some(frame) = stream.next().await {
            match frame {
                Ok(Message::Text(text)) => match ControlMessage::decode(&text) {
                    Ok(msg) => publisher.handle_message(msg).await,
                    Err(e) => warn!("Undecodable message from {}: {}", identity, e),
                },
                Ok(Message::Close(_)) => break,
                Ok(_) => {}
                Err(e) => {
                    debug!("Control connection for {} errored: {}", identity, e);
                    break;
                }
            }
        }

        info!("Publisher {} disconnected", identity);
        writer.abort();
        publisher.shutdown();

        let mut publishers = self.publishers.lock().unwrap();
        let still_current = publishers
            .get(&identity)
            .map(|current| Arc::ptr_eq(current, &publisher))
            .unwrap_or(false);
        if still_current {
            publishers.remove(&identity);
        }
    }

    /// Stop accepting control connections and free every publisher
    pub fn shutdown(&self) {
        if let Some(task) = self.listen_task.lock().unwrap().take() {
            task.abort();
        }
        for (_, publisher) in self.publishers.lock().unwrap().drain() {
            publisher.shutdown();
        }
    }

    pub fn publisher(&self, identity: &str) -> Option<Arc<Publisher>> {
        self.publishers.lock().unwrap().get(identity).cloned()
    }

    pub fn publisher_count(&self) -> usize {
        self.publishers.lock().unwrap().len()
    }
}

impl Drop for Broker {
    fn drop(&mut self) {
        self.shutdown();
    }
}
