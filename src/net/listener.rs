//! Listener contract and the TCP listener.
//!
//! # Responsibilities
//! - Bind one (protocol, address-family) endpoint
//! - Accept incoming connections and hand them to the owning server
//! - Close every tracked connection on stop
//!
//! # Design Decisions
//! - Accept loop stops on the lifecycle shutdown broadcast
//! - Listeners never own sessions; they only emit [`Accepted`] events

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::connection::{pump_stream, Connection, ConnectionId};
use super::factory;
use super::packet::{LengthPrefixed, PacketCodec};
use super::stats::Statistics;
use super::uri::{NetType, NetUri};
use crate::lifecycle::Shutdown;

/// Depth of each connection's inbound packet queue.
pub(crate) const INBOUND_QUEUE: usize = 256;

/// Error type for listener operations.
#[derive(Debug, thiserror::Error)]
pub enum ListenerError {
    #[error("failed to bind {address}: {source}")]
    Bind {
        address: SocketAddr,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to accept: {0}")]
    Accept(std::io::Error),
    #[error("failed to receive: {0}")]
    Receive(std::io::Error),
}

/// A freshly accepted connection plus its ordered inbound packet stream.
pub struct Accepted {
    pub connection: Arc<Connection>,
    pub inbound: mpsc::Receiver<Vec<u8>>,
}

pub type NewSessionHandler = Arc<dyn Fn(Accepted) + Send + Sync>;
pub type ErrorHandler = Arc<dyn Fn(&ListenerError) + Send + Sync>;

/// Settings the owning server pushes onto each listener.
#[derive(Debug, Clone)]
pub struct ListenerOptions {
    /// Idle timeout after which a connection is closed.
    pub session_timeout: Option<Duration>,
    pub codec: Arc<dyn PacketCodec>,
}

impl Default for ListenerOptions {
    fn default() -> Self {
        Self {
            session_timeout: None,
            codec: Arc::new(LengthPrefixed::default()),
        }
    }
}

/// Per-listener counters; re-parented under the owning server's.
#[derive(Debug, Default)]
pub struct ListenerStats {
    pub session: Arc<Statistics>,
    pub send: Arc<Statistics>,
    pub receive: Arc<Statistics>,
}

impl ListenerStats {
    pub fn attach_to(&self, parent: &ListenerStats) {
        self.session.set_parent(Some(parent.session.clone()));
        self.send.set_parent(Some(parent.send.clone()));
        self.receive.set_parent(Some(parent.receive.clone()));
    }
}

/// One bound transport endpoint owned by a [`NetServer`](super::NetServer).
pub trait SocketServer: Send + Sync {
    fn name(&self) -> String;
    fn set_name(&self, name: &str);

    /// Bind endpoint; the port reflects the bound port once started.
    fn local(&self) -> NetUri;

    fn port(&self) -> u16 {
        self.local().port
    }

    fn set_port(&self, port: u16);

    fn is_active(&self) -> bool;

    fn configure(&self, options: ListenerOptions);

    /// Bound on concurrent receive loops. Only datagram listeners use it.
    fn set_max_async(&self, _max: usize) {}

    fn on_new_session(&self, handler: NewSessionHandler);

    fn on_error(&self, handler: ErrorHandler);

    fn stats(&self) -> &ListenerStats;

    fn start(&self) -> Result<(), ListenerError>;

    /// Stop listening and close every live connection.
    fn stop(&self, reason: &str);
}

/// Mutable listener settings shared by the TCP and UDP listeners.
pub(crate) struct ListenerState {
    pub name: String,
    pub local: NetUri,
    pub options: ListenerOptions,
    pub on_new_session: Option<NewSessionHandler>,
    pub on_error: Option<ErrorHandler>,
    pub shutdown: Option<Shutdown>,
    pub tasks: Vec<JoinHandle<()>>,
}

impl ListenerState {
    pub fn new(local: NetUri) -> Self {
        Self {
            name: local.protocol.token().to_uppercase(),
            local,
            options: ListenerOptions::default(),
            on_new_session: None,
            on_error: None,
            shutdown: None,
            tasks: Vec::new(),
        }
    }

    /// Signal and abort background tasks.
    pub fn halt(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            shutdown.trigger();
        }
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

/// A TCP listener.
pub struct TcpServer {
    shared: Arc<TcpShared>,
}

struct TcpShared {
    state: Mutex<ListenerState>,
    stats: ListenerStats,
    active: AtomicBool,
    connections: DashMap<ConnectionId, Weak<Connection>>,
}

impl TcpServer {
    pub fn new(local: NetUri) -> Self {
        Self {
            shared: Arc::new(TcpShared {
                state: Mutex::new(ListenerState::new(local.with_protocol(NetType::Tcp))),
                stats: ListenerStats::default(),
                active: AtomicBool::new(false),
                connections: DashMap::new(),
            }),
        }
    }

    /// Number of connections currently tracked.
    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }
}

impl TcpShared {
    fn state(&self) -> std::sync::MutexGuard<'_, ListenerState> {
        self.state.lock().expect("listener state mutex poisoned")
    }

    fn report(&self, error: ListenerError) {
        let handler = self.state().on_error.clone();
        tracing::warn!(error = %error, "TCP listener error");
        if let Some(handler) = handler {
            handler(&error);
        }
    }

    fn accept(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) {
        let (local, options, handler) = {
            let state = self.state();
            (state.local.clone(), state.options.clone(), state.on_new_session.clone())
        };

        let _ = stream.set_nodelay(true);
        let (reader, writer) = stream.into_split();
        let connection = Connection::tcp(
            local,
            remote,
            writer,
            options.codec.clone(),
            self.stats.send.clone(),
        );
        let id = connection.id();
        self.connections.insert(id, Arc::downgrade(&connection));
        self.stats.session.increment(0);

        tracing::debug!(connection_id = %id, peer_addr = %remote, "Connection accepted");

        let (tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let shared = Arc::downgrade(self);
        let pump = pump_stream(
            reader,
            connection.clone(),
            tx,
            options.session_timeout,
            self.stats.receive.clone(),
        );
        tokio::spawn(async move {
            pump.await;
            if let Some(shared) = shared.upgrade() {
                shared.connections.remove(&id);
            }
        });

        match handler {
            Some(handler) => handler(Accepted { connection, inbound }),
            None => connection.close("no session handler"),
        }
    }
}

async fn accept_loop(
    shared: Arc<TcpShared>,
    listener: TcpListener,
    mut shutdown: broadcast::Receiver<()>,
) {
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            result = listener.accept() => match result {
                Ok((stream, remote)) => shared.accept(stream, remote),
                Err(e) => {
                    shared.report(ListenerError::Accept(e));
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
}

impl SocketServer for TcpServer {
    fn name(&self) -> String {
        self.shared.state().name.clone()
    }

    fn set_name(&self, name: &str) {
        self.shared.state().name = name.to_string();
    }

    fn local(&self) -> NetUri {
        self.shared.state().local.clone()
    }

    fn set_port(&self, port: u16) {
        self.shared.state().local.port = port;
    }

    fn is_active(&self) -> bool {
        self.shared.active.load(Ordering::SeqCst)
    }

    fn configure(&self, options: ListenerOptions) {
        self.shared.state().options = options;
    }

    fn on_new_session(&self, handler: NewSessionHandler) {
        self.shared.state().on_new_session = Some(handler);
    }

    fn on_error(&self, handler: ErrorHandler) {
        self.shared.state().on_error = Some(handler);
    }

    fn stats(&self) -> &ListenerStats {
        &self.shared.stats
    }

    fn start(&self) -> Result<(), ListenerError> {
        if self.is_active() {
            return Ok(());
        }

        let mut state = self.shared.state();
        let address = state.local.socket_addr();
        let listener = factory::bind_tcp(address)
            .map_err(|source| ListenerError::Bind { address, source })?;
        let bound = listener
            .local_addr()
            .map_err(|source| ListenerError::Bind { address, source })?;
        state.local.port = bound.port();

        let shutdown = Shutdown::new();
        let task = tokio::spawn(accept_loop(self.shared.clone(), listener, shutdown.subscribe()));
        state.shutdown = Some(shutdown);
        state.tasks.push(task);
        self.shared.active.store(true, Ordering::SeqCst);

        tracing::info!(name = %state.name, address = %bound, "TCP listener started");
        Ok(())
    }

    fn stop(&self, reason: &str) {
        if !self.shared.active.swap(false, Ordering::SeqCst) {
            return;
        }

        let name = {
            let mut state = self.shared.state();
            state.halt();
            state.name.clone()
        };

        let mut closed = 0usize;
        for entry in self.shared.connections.iter() {
            if let Some(connection) = entry.value().upgrade() {
                connection.close(reason);
                closed += 1;
            }
        }
        self.shared.connections.clear();

        tracing::info!(name = %name, reason, closed, "TCP listener stopped");
    }
}

impl Drop for TcpServer {
    fn drop(&mut self) {
        if self.shared.active.swap(false, Ordering::SeqCst) {
            if let Ok(mut state) = self.shared.state.lock() {
                state.halt();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};
    use tokio::io::AsyncWriteExt;

    fn loopback() -> NetUri {
        NetUri::new(NetType::Tcp, IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn accepts_and_frames_packets() {
        let server = TcpServer::new(loopback());
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.on_new_session(Arc::new(move |accepted: Accepted| {
            let _ = tx.send(accepted);
        }));
        server.start().unwrap();
        assert!(server.is_active());
        assert_ne!(server.port(), 0);

        let mut client = TcpStream::connect(server.local().socket_addr()).await.unwrap();
        let codec = LengthPrefixed::default();
        let mut bytes = codec.frame(b"one");
        bytes.extend(codec.frame(b"two"));
        client.write_all(&bytes).await.unwrap();

        let mut accepted = rx.recv().await.unwrap();
        assert_eq!(accepted.inbound.recv().await.unwrap(), b"one".to_vec());
        assert_eq!(accepted.inbound.recv().await.unwrap(), b"two".to_vec());
        assert_eq!(server.stats().session.total(), 1);
        assert_eq!(server.stats().receive.value(), 6);
        assert_eq!(server.connection_count(), 1);

        server.stop("test");
        server.stop("again");
        assert!(!server.is_active());
        assert!(accepted.connection.is_closed());
        assert_eq!(server.connection_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn idle_connection_is_closed() {
        let server = TcpServer::new(loopback());
        server.configure(ListenerOptions {
            session_timeout: Some(Duration::from_millis(100)),
            ..ListenerOptions::default()
        });
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.on_new_session(Arc::new(move |accepted: Accepted| {
            let _ = tx.send(accepted);
        }));
        server.start().unwrap();

        let _client = TcpStream::connect(server.local().socket_addr()).await.unwrap();
        let accepted = rx.recv().await.unwrap();
        tokio::time::timeout(Duration::from_secs(5), accepted.connection.closed())
            .await
            .unwrap();

        server.stop("test");
    }
}
