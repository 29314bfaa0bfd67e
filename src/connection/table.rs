//! Connection Table
//!
//! All per-connection state (identity, activity timestamp, receive buffer)
//! lives behind one mutex. The lock is never held across an await point;
//! socket writes go through the per-connection writer lock instead.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use bytes::Bytes;
use tokio::io::AsyncWrite;
use tokio::sync::{broadcast, Mutex as AsyncMutex};
use tokio::time::Instant;

use crate::protocol::LineFramer;

/// Write half of a connection, shared between senders and eviction
pub type SharedWriter = Arc<AsyncMutex<Box<dyn AsyncWrite + Send + Unpin>>>;

/// One accepted socket
pub struct Connection {
    pub id: String,
    /// Accept sequence number; distinguishes reconnects from the same `ip:port`
    pub seq: u64,
    pub peer: SocketAddr,
    device_id: Option<String>,
    last_activity: Instant,
    framer: LineFramer,
    writer: SharedWriter,
    close_tx: broadcast::Sender<()>,
}

impl Connection {
    /// Create a connection; the receiver fires when the broker closes it
    pub fn new(
        id: String,
        seq: u64,
        peer: SocketAddr,
        device_id: Option<String>,
        writer: Box<dyn AsyncWrite + Send + Unpin>,
        now: Instant,
    ) -> (Self, broadcast::Receiver<()>) {
        let (close_tx, close_rx) = broadcast::channel(1);
        let connection = Self {
            id,
            seq,
            peer,
            device_id,
            last_activity: now,
            framer: LineFramer::new(),
            writer: Arc::new(AsyncMutex::new(writer)),
            close_tx,
        };
        (connection, close_rx)
    }

    pub fn device_id(&self) -> Option<&str> {
        self.device_id.as_deref()
    }

    pub fn writer(&self) -> SharedWriter {
        Arc::clone(&self.writer)
    }

    /// Signal the read loop and discard the receive buffer
    pub fn close(mut self) -> ClosedConnection {
        let _ = self.close_tx.send(());
        self.framer.clear();
        ClosedConnection {
            id: self.id,
            seq: self.seq,
            device_id: self.device_id,
            writer: self.writer,
        }
    }
}

/// What remains after a connection leaves the table
pub struct ClosedConnection {
    pub id: String,
    pub seq: u64,
    pub device_id: Option<String>,
    pub writer: SharedWriter,
}

/// Connection chosen as the destination of a send
pub struct SendTarget {
    pub id: String,
    pub seq: u64,
    pub writer: SharedWriter,
    /// Fires when the connection is evicted or the broker stops
    pub closed: broadcast::Receiver<()>,
}

/// Snapshot of a connection for diagnostics
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionInfo {
    pub id: String,
    pub peer: SocketAddr,
    pub device_id: Option<String>,
    pub idle: Duration,
}

/// Outcome of resolving a connection's identity from a message tag
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityUpdate {
    /// Identity was unset and is now the tag
    Registered(String),
    /// Identity was already set and is kept
    Unchanged(String),
    /// Connection is gone
    Missing,
}

/// Guarded map of open connections keyed by `ip:port`
#[derive(Default)]
pub struct ConnectionTable {
    inner: Mutex<HashMap<String, Connection>>,
}

impl ConnectionTable {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, Connection>> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Insert a connection, returning any previous one with the same id
    pub fn insert(&self, connection: Connection) -> Option<Connection> {
        self.lock().insert(connection.id.clone(), connection)
    }

    /// Remove a connection by id
    pub fn remove(&self, id: &str) -> Option<Connection> {
        self.lock().remove(id)
    }

    /// Remove a connection only if it is still the one accepted as `seq`
    pub fn remove_accepted(&self, id: &str, seq: u64) -> Option<Connection> {
        let mut connections = self.lock();
        match connections.get(id) {
            Some(connection) if connection.seq == seq => connections.remove(id),
            _ => None,
        }
    }

    /// Remove every connection
    pub fn drain(&self) -> Vec<Connection> {
        self.lock().drain().map(|(_, connection)| connection).collect()
    }

    /// Append a received chunk to the connection's buffer and extract the
    /// complete lines. Also refreshes the activity timestamp.
    pub fn append_and_frame(&self, id: &str, chunk: &[u8], now: Instant) -> Option<Vec<Bytes>> {
        let mut connections = self.lock();
        let connection = connections.get_mut(id)?;
        connection.last_activity = now;
        Some(connection.framer.push(chunk))
    }

    /// Set the identity to `tag` unless one is already set
    pub fn resolve_identity(&self, id: &str, tag: char) -> IdentityUpdate {
        let mut connections = self.lock();
        let Some(connection) = connections.get_mut(id) else {
            return IdentityUpdate::Missing;
        };

        match &connection.device_id {
            Some(existing) => IdentityUpdate::Unchanged(existing.clone()),
            None => {
                let device_id = tag.to_string();
                connection.device_id = Some(device_id.clone());
                IdentityUpdate::Registered(device_id)
            }
        }
    }

    pub fn touch(&self, id: &str, now: Instant) {
        if let Some(connection) = self.lock().get_mut(id) {
            connection.last_activity = now;
        }
    }

    /// Earliest accepted connection whose resolved identity equals `device_id`
    pub fn find_by_device(&self, device_id: &str) -> Option<SendTarget> {
        self.lock()
            .values()
            .filter(|connection| connection.device_id() == Some(device_id))
            .min_by_key(|connection| connection.seq)
            .map(|connection| SendTarget {
                id: connection.id.clone(),
                seq: connection.seq,
                writer: connection.writer(),
                closed: connection.close_tx.subscribe(),
            })
    }

    /// Id of the earliest accepted connection bound to `device_id`
    pub fn id_for_device(&self, device_id: &str) -> Option<String> {
        self.lock()
            .values()
            .filter(|connection| connection.device_id() == Some(device_id))
            .min_by_key(|connection| connection.seq)
            .map(|connection| connection.id.clone())
    }

    /// Resolved identities of all connections
    pub fn device_ids(&self) -> Vec<String> {
        self.lock()
            .values()
            .filter_map(|connection| connection.device_id.clone())
            .collect()
    }

    /// Connections idle for longer than `timeout` at `now`
    pub fn idle_connections(&self, now: Instant, timeout: Duration) -> Vec<String> {
        self.lock()
            .values()
            .filter(|connection| now.saturating_duration_since(connection.last_activity) > timeout)
            .map(|connection| connection.id.clone())
            .collect()
    }

    /// Diagnostic snapshot, sorted by connection id
    pub fn snapshot(&self, now: Instant) -> Vec<ConnectionInfo> {
        let mut infos: Vec<_> = self
            .lock()
            .values()
            .map(|connection| ConnectionInfo {
                id: connection.id.clone(),
                peer: connection.peer,
                device_id: connection.device_id.clone(),
                idle: now.saturating_duration_since(connection.last_activity),
            })
            .collect();
        infos.sort_by(|a, b| a.id.cmp(&b.id));
        infos
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }
}
