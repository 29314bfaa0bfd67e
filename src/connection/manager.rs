//! Connection Manager Implementation

use std::collections::HashMap;
use std::io::ErrorKind;
use std::net::{IpAddr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};

use super::sweeper::LivenessSweeper;
use super::table::{
    ClosedConnection, Connection, ConnectionInfo, ConnectionTable, IdentityUpdate, SendTarget,
};
use crate::config::Config;
use crate::dispatch::{DeviceMessage, Dispatcher, HandlerTable};
use crate::protocol::{parse_line, trace};
use crate::registry::DeviceRegistry;
use crate::Result;

struct Shared {
    config: Arc<Config>,
    registry: DeviceRegistry,
    address_mapping: HashMap<IpAddr, String>,
    connections: ConnectionTable,
    next_seq: AtomicU64,
    dispatcher: Dispatcher,
    running: AtomicBool,
    shutdown_tx: broadcast::Sender<()>,
    local_addr: Mutex<Option<SocketAddr>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

/// Accepts controller connections, routes their messages to handlers and
/// sends commands back by device id. Cheap to clone; clones share state.
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    /// Create a new ConnectionManager
    pub fn new(config: Arc<Config>) -> Self {
        let registry = DeviceRegistry::from_config(&config.devices);

        let mut address_mapping = HashMap::new();
        for (ip, device_id) in &config.devices.address_mapping {
            match ip.parse::<IpAddr>() {
                Ok(addr) => {
                    address_mapping.insert(addr, device_id.clone());
                }
                Err(e) => warn!("Ignoring address mapping {} -> {}: {}", ip, device_id, e),
            }
        }

        let dispatcher = Dispatcher::new(
            Arc::new(HandlerTable::new()),
            config.logging.verbose_dispatch,
        );
        let (shutdown_tx, _) = broadcast::channel(1);

        Self {
            shared: Arc::new(Shared {
                config,
                registry,
                address_mapping,
                connections: ConnectionTable::new(),
                next_seq: AtomicU64::new(0),
                dispatcher,
                running: AtomicBool::new(false),
                shutdown_tx,
                local_addr: Mutex::new(None),
                tasks: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Bind the listener and spawn the accept loop and liveness sweeper.
    ///
    /// Returns `Ok(false)` without doing anything if already running.
    pub async fn start(&self) -> Result<bool> {
        if self
            .shared
            .running
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("TCP server is already running");
            return Ok(false);
        }

        let bind_addr = self.shared.config.server.bind_addr;
        info!("Binding TCP listener to {}", bind_addr);
        let listener = match TcpListener::bind(bind_addr).await {
            Ok(listener) => listener,
            Err(e) => {
                self.shared.running.store(false, Ordering::SeqCst);
                return Err(anyhow::Error::new(e)
                    .context(format!("Failed to bind TCP listener to {}", bind_addr)));
            }
        };

        let local_addr = listener.local_addr().ok();
        *self.shared.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = local_addr;
        info!("TCP server started on {}", local_addr.unwrap_or(bind_addr));

        let accept_task = tokio::spawn(Self::accept_connections(
            self.clone(),
            listener,
            self.shared.shutdown_tx.subscribe(),
        ));

        let sweeper = LivenessSweeper::from_config(&self.shared.config.liveness);
        let sweeper_task = tokio::spawn(sweeper.run(self.clone(), self.shared.shutdown_tx.subscribe()));

        let mut tasks = self.shared.tasks.lock().unwrap_or_else(PoisonError::into_inner);
        tasks.push(accept_task);
        tasks.push(sweeper_task);

        Ok(true)
    }

    /// Stop background tasks, close every connection and the listener
    pub async fn stop(&self) {
        if !self.shared.running.swap(false, Ordering::SeqCst) {
            debug!("Stop requested while TCP server is not running");
        }

        let _ = self.shared.shutdown_tx.send(());

        for connection in self.shared.connections.drain() {
            Self::close_connection(connection.close()).await;
        }

        let tasks: Vec<_> = self
            .shared
            .tasks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .drain(..)
            .collect();
        for task in tasks {
            if let Err(e) = task.await {
                if !e.is_cancelled() {
                    error!("Background task failed during shutdown: {}", e);
                }
            }
        }

        *self.shared.local_addr.lock().unwrap_or_else(PoisonError::into_inner) = None;
        info!("TCP server stopped");
    }

    /// Main connection acceptance loop
    async fn accept_connections(
        self,
        listener: TcpListener,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        info!("Waiting for client connections");
        let backoff = self.shared.config.server.accept_backoff;

        loop {
            tokio::select! {
                accept_result = listener.accept() => {
                    match accept_result {
                        Ok((stream, peer)) => {
                            if !self.is_running() {
                                break;
                            }
                            self.admit(stream, peer);
                        }
                        Err(e) => {
                            if !self.is_running() {
                                break;
                            }
                            error!("Failed to accept client connection: {}", e);
                            tokio::select! {
                                _ = tokio::time::sleep(backoff) => {}
                                _ = shutdown_rx.recv() => break,
                            }
                        }
                    }
                }
                _ = shutdown_rx.recv() => {
                    debug!("Accept loop received shutdown signal");
                    break;
                }
            }
        }

        drop(listener);
        info!("Connection acceptance loop stopped");
    }

    fn admit(&self, stream: TcpStream, peer: SocketAddr) {
        let (reader, writer) = stream.into_split();
        self.attach_stream(peer, reader, writer);
    }

    /// Register an established byte stream as a connection from `peer` and
    /// spawn its read loop. Returns the connection id (`ip:port`).
    pub fn attach_stream<R, W>(&self, peer: SocketAddr, reader: R, writer: W) -> String
    where
        R: AsyncRead + Unpin + Send + 'static,
        W: AsyncWrite + Unpin + Send + 'static,
    {
        let connection_id = format!("{}:{}", peer.ip(), peer.port());
        info!("New client connection: {}", connection_id);

        let device_id = self.shared.address_mapping.get(&peer.ip()).cloned();
        if let Some(device_id) = &device_id {
            info!("Pre-registered device {} (client: {})", device_id, connection_id);
        }

        let seq = self.shared.next_seq.fetch_add(1, Ordering::Relaxed);
        let (connection, close_rx) = Connection::new(
            connection_id.clone(),
            seq,
            peer,
            device_id,
            Box::new(writer),
            Instant::now(),
        );

        if let Some(previous) = self.shared.connections.insert(connection) {
            warn!("Replacing stale connection entry {}", previous.id);
            let closed = previous.close();
            tokio::spawn(Self::close_connection(closed));
        }

        tokio::spawn(Self::read_loop(
            self.clone(),
            connection_id.clone(),
            seq,
            reader,
            close_rx,
        ));

        connection_id
    }

    /// Per-connection receive loop; messages are dispatched in arrival order
    #[instrument(skip(self, reader, close_rx), fields(connection_id = %connection_id))]
    async fn read_loop<R>(
        self,
        connection_id: String,
        seq: u64,
        mut reader: R,
        mut close_rx: broadcast::Receiver<()>,
    ) where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let mut buf = vec![0u8; self.shared.config.server.read_buffer_size];

        loop {
            tokio::select! {
                _ = close_rx.recv() => {
                    debug!("Connection closed by server");
                    return;
                }
                read_result = reader.read(&mut buf) => {
                    match read_result {
                        Ok(0) => {
                            debug!("Client closed the connection");
                            break;
                        }
                        Ok(n) => {
                            trace::log_chunk(&connection_id, &buf[..n]);
                            self.process_chunk(&connection_id, &buf[..n]);
                        }
                        Err(e) if e.kind() == ErrorKind::ConnectionReset => {
                            info!("Client connection reset");
                            break;
                        }
                        Err(e) => {
                            error!("Error receiving data: {}", e);
                            break;
                        }
                    }
                }
            }
        }

        self.evict_accepted(&connection_id, seq).await;
    }

    fn process_chunk(&self, connection_id: &str, chunk: &[u8]) {
        let Some(lines) = self
            .shared
            .connections
            .append_and_frame(connection_id, chunk, Instant::now())
        else {
            return;
        };

        for line in lines {
            let message = match parse_line(&line) {
                Ok(message) => message,
                Err(e) => {
                    warn!(connection_id = %connection_id, "Dropping malformed message: {}", e);
                    continue;
                }
            };

            let canonical_id = self.shared.registry.canonical_id(message.tag);
            if let IdentityUpdate::Registered(device_id) =
                self.shared.connections.resolve_identity(connection_id, message.tag)
            {
                info!("Device registered: {} (client: {})", device_id, connection_id);
            }

            self.shared.dispatcher.dispatch(&canonical_id, &message);
        }
    }

    /// Install or overwrite the handler for (device id, kind).
    ///
    /// `device_id` may be a canonical id or a raw tag; `kind` may be a kind
    /// character or a legacy alias (`evt`, `res`, `err`).
    pub fn register_device_handler<F>(&self, device_id: &str, kind: &str, handler: F)
    where
        F: Fn(DeviceMessage) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        self.shared
            .dispatcher
            .handlers()
            .register(device_id, kind, Arc::new(handler));
    }

    /// Send a command line to the connection bound to `device_id`.
    ///
    /// A trailing newline is appended if missing. Returns `false` when no
    /// connection is bound to the device, the write fails, or the connection
    /// is closed while the write is pending.
    pub async fn send_message(&self, device_id: &str, command: &str) -> bool {
        let Some(SendTarget {
            id: connection_id,
            seq,
            writer,
            mut closed,
        }) = self.shared.connections.find_by_device(device_id)
        else {
            error!("No connection for device {}: message not sent", device_id);
            self.log_connection_state(device_id);
            return false;
        };

        let mut payload = command.to_string();
        if !payload.ends_with('\n') {
            payload.push('\n');
        }

        let write_result = tokio::select! {
            result = async {
                let mut writer = writer.lock().await;
                writer.write_all(payload.as_bytes()).await?;
                writer.flush().await
            } => result,
            _ = closed.recv() => {
                warn!("Connection {} closed before message to {} was sent", connection_id, device_id);
                return false;
            }
        };

        match write_result {
            Ok(()) => {
                self.shared.connections.touch(&connection_id, Instant::now());
                info!("Message sent ({}): {}", device_id, payload.trim_end());
                true
            }
            Err(e) => {
                error!("Failed to send message to {} ({}): {}", device_id, connection_id, e);
                self.evict_accepted(&connection_id, seq).await;
                false
            }
        }
    }

    fn log_connection_state(&self, device_id: &str) {
        let connections = self.connections();
        if connections.is_empty() {
            warn!("No clients connected");
        } else {
            let listing: Vec<String> = connections
                .iter()
                .map(|c| {
                    format!(
                        "{} (device: {}, addr: {})",
                        c.id,
                        c.device_id.as_deref().unwrap_or("None"),
                        c.peer
                    )
                })
                .collect();
            info!("Currently connected clients: {}", listing.join(", "));
        }

        if let Some(tag) = self.shared.registry.raw_tag(device_id) {
            info!("Device {} maps to raw device tag {}", device_id, tag);
        }
    }

    /// Close and forget a connection. Evicting an unknown id does nothing.
    pub async fn evict(&self, connection_id: &str) -> bool {
        let Some(connection) = self.shared.connections.remove(connection_id) else {
            return false;
        };
        Self::close_connection(connection.close()).await;
        true
    }

    /// Like [`evict`](Self::evict), but leaves a newer connection that
    /// reused the same id alone
    async fn evict_accepted(&self, connection_id: &str, seq: u64) -> bool {
        let Some(connection) = self.shared.connections.remove_accepted(connection_id, seq) else {
            return false;
        };
        Self::close_connection(connection.close()).await;
        true
    }

    /// Pending sends observe the close signal and release the writer
    async fn close_connection(closed: ClosedConnection) {
        let mut writer = closed.writer.lock().await;
        if let Err(e) = writer.shutdown().await {
            debug!("Error closing connection {}: {}", closed.id, e);
        }
        drop(writer);

        match closed.device_id {
            Some(device_id) => info!("Device {} disconnected (client: {})", device_id, closed.id),
            None => info!("Client {} disconnected", closed.id),
        }
    }

    /// Evict the connection bound to `device_id`
    pub async fn disconnect_device(&self, device_id: &str) -> bool {
        match self.shared.connections.id_for_device(device_id) {
            Some(connection_id) => self.evict(&connection_id).await,
            None => false,
        }
    }

    /// Resolved identities of all open connections
    pub fn get_connected_devices(&self) -> Vec<String> {
        self.shared.connections.device_ids()
    }

    pub fn is_device_connected(&self, device_id: &str) -> bool {
        self.shared.connections.id_for_device(device_id).is_some()
    }

    /// Snapshot of all open connections
    pub fn connections(&self) -> Vec<ConnectionInfo> {
        self.shared.connections.snapshot(Instant::now())
    }

    /// Ids of connections idle for longer than `timeout`
    pub fn idle_connections(&self, timeout: Duration) -> Vec<String> {
        self.shared.connections.idle_connections(Instant::now(), timeout)
    }

    /// Registered handler keys, sorted
    pub fn registered_handlers(&self) -> Vec<(String, String)> {
        self.shared.dispatcher.handlers().keys()
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.shared.registry
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::SeqCst)
    }

    /// Bound listener address while running
    pub fn local_addr(&self) -> Option<SocketAddr> {
        *self.shared.local_addr.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
