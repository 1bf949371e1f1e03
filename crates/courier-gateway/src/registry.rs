//! Registry of live client connections.
//!
//! Maps a connection ID to the handle of the task that owns the socket.
//! An entry lives exactly as long as its connection: added on accept,
//! released on close. Lookups hand out cloned handles so no lock is held
//! while a caller writes to a connection.

use crate::metrics::CONNECTED_CLIENTS;
use courier_core::{CourierError, CourierResult};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;
use tokio::sync::{mpsc, oneshot, RwLock};
use tracing::{debug, info};

/// Work sent from other tasks to the task owning a connection.
#[derive(Debug)]
pub enum Outbound {
    /// Write `payload` to the client and report the result on `ack`.
    Push {
        payload: Vec<u8>,
        ack: oneshot::Sender<CourierResult<()>>,
    },
    /// Close the connection.
    Close,
}

/// Cloneable handle to a live connection.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    /// Process-unique serial, distinguishes reconnects under the same ID.
    serial: u64,
    remote_addr: SocketAddr,
    connected_at: Instant,
    tx: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    pub fn new(serial: u64, remote_addr: SocketAddr, tx: mpsc::Sender<Outbound>) -> Self {
        Self {
            serial,
            remote_addr,
            connected_at: Instant::now(),
            tx,
        }
    }

    #[cfg(test)]
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn remote_addr(&self) -> SocketAddr {
        self.remote_addr
    }

    pub fn connected_secs(&self) -> u64 {
        self.connected_at.elapsed().as_secs()
    }

    /// Write a raw payload to the client through its connection task.
    ///
    /// Resolves once the socket write finished, with the write's result.
    pub async fn push(&self, payload: Vec<u8>) -> CourierResult<()> {
        let (ack_tx, ack_rx) = oneshot::channel();
        self.tx
            .send(Outbound::Push {
                payload,
                ack: ack_tx,
            })
            .await
            .map_err(|_| CourierError::Transport("connection closed".into()))?;
        ack_rx
            .await
            .map_err(|_| CourierError::Transport("connection closed before write".into()))?
    }

    /// Ask the owning task to close the socket. Returns false when the
    /// connection is already gone.
    pub async fn close(&self) -> bool {
        self.tx.send(Outbound::Close).await.is_ok()
    }
}

/// Directory of live connections, shared by connection tasks and the
/// control plane.
pub struct ConnectionRegistry {
    connections: RwLock<HashMap<String, ConnectionHandle>>,
    next_serial: AtomicU64,
}

impl ConnectionRegistry {
    /// Create a new empty registry.
    pub fn new() -> Self {
        Self {
            connections: RwLock::new(HashMap::new()),
            next_serial: AtomicU64::new(1),
        }
    }

    /// Allocate a serial for a new [`ConnectionHandle`].
    pub fn next_serial(&self) -> u64 {
        self.next_serial.fetch_add(1, Ordering::Relaxed)
    }

    /// Insert or replace the entry for `id`.
    pub async fn add(&self, id: &str, handle: ConnectionHandle) {
        let mut connections = self.connections.write().await;
        let replaced = connections.insert(id.to_string(), handle).is_some();
        let total = connections.len();
        drop(connections);

        metrics::gauge!(CONNECTED_CLIENTS).set(total as f64);
        info!(connection_id = %id, replaced, total, "connection added");
    }

    /// Remove the entry for `id`, returning it. Absent IDs are ignored.
    pub async fn remove(&self, id: &str) -> Option<ConnectionHandle> {
        let mut connections = self.connections.write().await;
        let removed = connections.remove(id);
        let total = connections.len();
        drop(connections);

        metrics::gauge!(CONNECTED_CLIENTS).set(total as f64);
        if removed.is_some() {
            info!(connection_id = %id, total, "connection removed");
        }
        removed
    }

    /// Remove the entry for `id` only if it still belongs to the connection
    /// with `serial`. Returns whether an entry was removed.
    pub async fn release(&self, id: &str, serial: u64) -> bool {
        let mut connections = self.connections.write().await;
        let released = match connections.get(id) {
            Some(handle) if handle.serial == serial => connections.remove(id),
            _ => None,
        };
        let total = connections.len();
        drop(connections);

        metrics::gauge!(CONNECTED_CLIENTS).set(total as f64);
        match &released {
            Some(handle) => info!(
                connection_id = %id,
                remote = %handle.remote_addr(),
                connected_secs = handle.connected_secs(),
                total,
                "connection released"
            ),
            None => debug!(connection_id = %id, serial, "entry already replaced, nothing to release"),
        }
        released.is_some()
    }

    pub async fn exists(&self, id: &str) -> bool {
        self.connections.read().await.contains_key(id)
    }

    pub async fn get(&self, id: &str) -> Option<ConnectionHandle> {
        self.connections.read().await.get(id).cloned()
    }

    /// Independent copy of every entry.
    pub async fn snapshot(&self) -> HashMap<String, ConnectionHandle> {
        self.connections.read().await.clone()
    }

    /// Number of live connections.
    pub async fn count(&self) -> usize {
        self.connections.read().await.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
