//! Bounded pool of public-facing listening sockets
//!
//! Each connected publisher owns one pool; the pool enforces the per-publisher
//! limit on how many public ports it may hold open. A bind failure tears the
//! acceptor down and is reported to the owner instead of being fatal; one bad
//! port in a service list must not take down the other services.

use burrow_proto::new_id;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use thiserror::Error;
use tokio::net::{TcpListener, TcpStream};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Per-connection callback invoked by an acceptor's accept loop
pub type AcceptCallback = Arc<dyn Fn(TcpStream, SocketAddr) + Send + Sync>;

/// Acceptor pool errors
#[derive(Debug, Error)]
pub enum AcceptorError {
    #[error("Acceptor pool is full (limit {limit})")]
    PoolFull { limit: usize },

    #[error("Failed to bind port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },
}

/// Opaque handle to one live acceptor
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AcceptorHandle {
    id: String,
}

struct AcceptorEntry {
    local_port: u16,
    task: JoinHandle<()>,
}

/// Bounded set of listening sockets keyed by opaque handles
pub struct AcceptorPool {
    limit: usize,
    acceptors: Mutex<HashMap<String, AcceptorEntry>>,
}

impl AcceptorPool {
    pub fn new(limit: usize) -> Self {
        Self {
            limit,
            acceptors: Mutex::new(HashMap::new()),
        }
    }

    /// Bind a listening TCP socket on `port` and run `on_accept` for every
    /// connection it accepts.
    ///
    /// Fails with [`AcceptorError::PoolFull`] when the pool already holds the
    /// configured number of live acceptors, and with [`AcceptorError::Bind`]
    /// when the port cannot be bound.
    pub async fn create(
        &self,
        port: u16,
        on_accept: AcceptCallback,
    ) -> Result<AcceptorHandle, AcceptorError> {
        if self.acceptors.lock().unwrap().len() >= self.limit {
            return Err(AcceptorError::PoolFull { limit: self.limit });
        }

        let listener = TcpListener::bind(("0.0.0.0", port))
            .await
            .map_err(|source| AcceptorError::Bind { port, source })?;
        let local_port = listener
            .local_addr()
            .map_err(|source| AcceptorError::Bind { port, source })?
            .port();

        let task = tokio::spawn(Self::accept_loop(listener, on_accept));

        let mut acceptors = self.acceptors.lock().unwrap();
        if acceptors.len() >= self.limit {
            // A concurrent create won the last slot while we were binding.
            task.abort();
            return Err(AcceptorError::PoolFull { limit: self.limit });
        }

        let id = new_id();
        acceptors.insert(id.clone(), AcceptorEntry { local_port, task });
        debug!("Acceptor {} bound on port {}", id, local_port);

        Ok(AcceptorHandle { id })
    }

    /// Account a pre-bound socket's task against the pool limit.
    ///
    /// Used for UDP public sockets, which are bound and driven by their
    /// owning service but still count toward the per-publisher port limit.
    pub fn adopt(
        &self,
        local_port: u16,
        task: JoinHandle<()>,
    ) -> Result<AcceptorHandle, AcceptorError> {
        let mut acceptors = self.acceptors.lock().unwrap();
        if acceptors.len() >= self.limit {
            task.abort();
            return Err(AcceptorError::PoolFull { limit: self.limit });
        }

        let id = new_id();
        acceptors.insert(id.clone(), AcceptorEntry { local_port, task });
        Ok(AcceptorHandle { id })
    }

    async fn accept_loop(listener: TcpListener, on_accept: AcceptCallback) {
        loop {
            match listener.accept().await {
                Ok((socket, peer_addr)) => {
                    debug!("Accepted public connection from {}", peer_addr);
                    on_accept(socket, peer_addr);
                }
                Err(e) => {
                    warn!("Failed to accept public connection: {}", e);
                }
            }
        }
    }

    /// Port an acceptor is actually bound on (useful when created with port 0)
    pub fn local_port(&self, handle: &AcceptorHandle) -> Option<u16> {
        self.acceptors
            .lock()
            .unwrap()
            .get(&handle.id)
            .map(|entry| entry.local_port)
    }

    /// Close and unregister one acceptor
    pub fn free(&self, handle: &AcceptorHandle) {
        match self.acceptors.lock().unwrap().remove(&handle.id) {
            Some(entry) => entry.task.abort(),
            None => debug!("Acceptor for handle {} does not exist", handle.id),
        }
    }

    /// Close and unregister every live acceptor
    pub fn free_all(&self) {
        for (_, entry) in self.acceptors.lock().unwrap().drain() {
            entry.task.abort();
        }
    }

    /// Number of live acceptors
    pub fn live_count(&self) -> usize {
        self.acceptors.lock().unwrap().len()
    }
}

impl Drop for AcceptorPool {
    fn drop(&mut self) {
        self.free_all();
    }
}
