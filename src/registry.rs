//! Thread-safe set of connected TCP clients.
//!
//! The registry owns the write half of every client socket. All mutation and
//! every broadcast happen under a single async mutex, so a broadcast never
//! races with a client being added or torn down.

use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::io::AsyncWriteExt;
use tokio::net::tcp::OwnedWriteHalf;
use tokio::sync::Mutex;

/// Identity of one accepted connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// An open client socket as seen by the broadcast side.
pub struct Connection {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    writer: OwnedWriteHalf,
}

impl Connection {
    pub fn new(id: ConnectionId, peer: SocketAddr, writer: OwnedWriteHalf) -> Self {
        Self { id, peer, writer }
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("peer", &self.peer)
            .finish()
    }
}

/// A client whose send failed during a broadcast. It has already been closed
/// and removed from the registry.
#[derive(Debug)]
pub struct SendFailure {
    pub id: ConnectionId,
    pub peer: SocketAddr,
    pub error: io::Error,
}

/// Outcome of sending one payload to every registered client.
#[derive(Debug, Default)]
pub struct BroadcastReport {
    pub delivered: usize,
    pub failed: Vec<SendFailure>,
}

impl BroadcastReport {
    pub fn is_complete(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Shared registry of connected clients.
#[derive(Clone, Default)]
pub struct ClientRegistry {
    connections: Arc<Mutex<HashMap<ConnectionId, Connection>>>,
    next_id: Arc<AtomicU64>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate a fresh connection id.
    pub fn next_id(&self) -> ConnectionId {
        ConnectionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Insert a connection. Returns `false` (and drops `conn`) if a connection
    /// with the same id is already registered.
    pub async fn add(&self, conn: Connection) -> bool {
        let mut connections = self.connections.lock().await;
        if connections.contains_key(&conn.id) {
            return false;
        }
        connections.insert(conn.id, conn);
        true
    }

    /// Remove a connection, shutting down its write side while the lock is
    /// held. Removing an absent id is a no-op and returns `None`.
    ///
    /// The caller must have stopped reading from the connection before
    /// calling this.
    pub async fn remove(&self, id: ConnectionId) -> Option<SocketAddr> {
        let mut connections = self.connections.lock().await;
        let mut conn = connections.remove(&id)?;
        let _ = conn.writer.shutdown().await;
        Some(conn.peer)
    }

    /// Apply `f` to every current member under the lock.
    pub async fn for_each<F>(&self, mut f: F)
    where
        F: FnMut(&Connection),
    {
        let connections = self.connections.lock().await;
        for conn in connections.values() {
            f(conn);
        }
    }

    /// Write `payload` in full to every current member.
    ///
    /// The lock is held for the whole broadcast, so every client sees
    /// payloads in the same order and no member can be added or removed
    /// half-way through. A client whose write fails is closed and removed;
    /// the remaining clients still receive the payload.
    pub async fn send_all(&self, payload: &[u8]) -> BroadcastReport {
        let mut connections = self.connections.lock().await;
        let mut report = BroadcastReport::default();

        for conn in connections.values_mut() {
            let result = async {
                conn.writer.write_all(payload).await?;
                conn.writer.flush().await
            }
            .await;
            match result {
                Ok(()) => report.delivered += 1,
                Err(error) => report.failed.push(SendFailure {
                    id: conn.id,
                    peer: conn.peer,
                    error,
                }),
            }
        }

        for failure in &report.failed {
            if let Some(mut conn) = connections.remove(&failure.id) {
                let _ = conn.writer.shutdown().await;
            }
        }

        report
    }

    pub async fn len(&self) -> usize {
        self.connections.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.connections.lock().await.is_empty()
    }

    pub async fn contains(&self, id: ConnectionId) -> bool {
        self.connections.lock().await.contains_key(&id)
    }

    /// Peer addresses of all current members, ordered by connection id.
    pub async fn peers(&self) -> Vec<SocketAddr> {
        let mut members = Vec::new();
        self.for_each(|conn| members.push((conn.id, conn.peer))).await;
        members.sort_by_key(|(id, _)| *id);
        members.into_iter().map(|(_, peer)| peer).collect()
    }

    /// Close and remove every member.
    pub async fn clear(&self) -> usize {
        let mut connections = self.connections.lock().await;
        let count = connections.len();
        for (_, mut conn) in connections.drain() {
            let _ = conn.writer.shutdown().await;
        }
        count
    }
}
