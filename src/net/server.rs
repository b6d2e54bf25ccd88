//! Multi-listener session server.
//!
//! # Responsibilities
//! - Own any number of listeners under one logical endpoint
//! - Turn every accepted connection into a registered session
//! - Start/stop listeners as a group, sharing one effective port
//! - Broadcast to all registered sessions
//!
//! # Design Decisions
//! - One coarse lock around the session table; ids and counters are atomics
//! - Listeners hold the server weakly, so dropping the last handle frees it
//! - Disposal is driven by the session's own receive task, never by polling

use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::atomic::{AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, RwLock, Weak};
use std::time::Duration;

use futures_util::future::join_all;
use tokio::sync::mpsc;

use super::connection::NetError;
use super::factory;
use super::listener::{Accepted, ListenerError, ListenerOptions, ListenerStats, SocketServer};
use super::packet::{LengthPrefixed, PacketCodec};
use super::session::{NetSession, PlainSession, SessionCore, SessionFactory};
use super::uri::{AddressFamily, NetType, NetUri};
use crate::observability::metrics;

/// Default multiplier applied to available parallelism for UDP receive loops.
pub const DEFAULT_UDP_CONCURRENCY_RATIO: f64 = 1.6;

/// Settings pushed onto every attached listener.
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub session_timeout: Option<Duration>,
    pub codec: Arc<dyn PacketCodec>,
    /// Keep a session table. Broadcast and lookups need it.
    pub use_session: bool,
    pub udp_concurrency_ratio: f64,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            session_timeout: None,
            codec: Arc::new(LengthPrefixed::default()),
            use_session: true,
            udp_concurrency_ratio: DEFAULT_UDP_CONCURRENCY_RATIO,
        }
    }
}

/// Number of concurrent UDP receive loops for a given ratio.
pub fn udp_concurrency(ratio: f64) -> usize {
    let cores = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    ((cores as f64 * ratio) as usize).max(1)
}

type SessionHook = Arc<dyn Fn(&Arc<dyn NetSession>) + Send + Sync>;
type ReceivedHook = Arc<dyn Fn(&Arc<dyn NetSession>, &[u8]) + Send + Sync>;
type ErrorHook = Arc<dyn Fn(&ListenerError) + Send + Sync>;

#[derive(Default)]
struct Hooks {
    new_session: RwLock<Vec<SessionHook>>,
    received: RwLock<Vec<ReceivedHook>>,
    error: RwLock<Vec<ErrorHook>>,
}

fn snapshot<T: Clone>(lock: &RwLock<Vec<T>>) -> Vec<T> {
    lock.read().expect("hook list lock poisoned").clone()
}

pub(crate) struct ServerInner {
    name: String,
    local: Mutex<NetUri>,
    family: Mutex<AddressFamily>,
    servers: Mutex<Vec<Arc<dyn SocketServer>>>,
    sessions: Mutex<HashMap<u32, Arc<dyn NetSession>>>,
    session_count: AtomicUsize,
    max_session_count: AtomicUsize,
    session_seq: AtomicU32,
    options: RwLock<ServerOptions>,
    factory: RwLock<SessionFactory>,
    hooks: Hooks,
    stats: ListenerStats,
}

/// A logical server spanning one or more listeners.
///
/// Cheap to clone; every clone refers to the same server.
#[derive(Clone)]
pub struct NetServer {
    inner: Arc<ServerInner>,
}

fn same_listener(a: &Arc<dyn SocketServer>, b: &Arc<dyn SocketServer>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

fn same_session(a: &Arc<dyn NetSession>, b: &Arc<dyn NetSession>) -> bool {
    std::ptr::addr_eq(Arc::as_ptr(a), Arc::as_ptr(b))
}

impl NetServer {
    pub fn new(name: impl Into<String>, local: NetUri) -> Self {
        Self {
            inner: Arc::new(ServerInner {
                name: name.into(),
                local: Mutex::new(local),
                family: Mutex::new(AddressFamily::Unspecified),
                servers: Mutex::new(Vec::new()),
                sessions: Mutex::new(HashMap::new()),
                session_count: AtomicUsize::new(0),
                max_session_count: AtomicUsize::new(0),
                session_seq: AtomicU32::new(0),
                options: RwLock::new(ServerOptions::default()),
                factory: RwLock::new(PlainSession::factory()),
                hooks: Hooks::default(),
                stats: ListenerStats::default(),
            }),
        }
    }

    pub(crate) fn from_inner(inner: Arc<ServerInner>) -> Self {
        Self { inner }
    }

    fn downgrade(&self) -> Weak<ServerInner> {
        Arc::downgrade(&self.inner)
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn local(&self) -> NetUri {
        self.inner.local.lock().expect("server endpoint mutex poisoned").clone()
    }

    pub fn port(&self) -> u16 {
        self.local().port
    }

    pub fn set_port(&self, port: u16) {
        self.inner.local.lock().expect("server endpoint mutex poisoned").port = port;
    }

    pub fn family(&self) -> AddressFamily {
        *self.inner.family.lock().expect("server family mutex poisoned")
    }

    pub fn set_family(&self, family: AddressFamily) {
        *self.inner.family.lock().expect("server family mutex poisoned") = family;
    }

    pub fn options(&self) -> ServerOptions {
        self.inner.options.read().expect("server options lock poisoned").clone()
    }

    /// Replace the options. Applies to listeners attached afterwards.
    pub fn set_options(&self, options: ServerOptions) {
        *self.inner.options.write().expect("server options lock poisoned") = options;
    }

    pub fn use_session(&self) -> bool {
        self.inner.options.read().expect("server options lock poisoned").use_session
    }

    pub fn set_session_factory<F>(&self, factory: F)
    where
        F: Fn(SessionCore) -> Arc<dyn NetSession> + Send + Sync + 'static,
    {
        *self.inner.factory.write().expect("session factory lock poisoned") = Arc::new(factory);
    }

    /// Called once per new session, before any packet of it is received.
    pub fn subscribe_new_session<F>(&self, hook: F)
    where
        F: Fn(&Arc<dyn NetSession>) + Send + Sync + 'static,
    {
        self.inner.hooks.new_session.write().expect("hook list lock poisoned").push(Arc::new(hook));
    }

    pub fn subscribe_received<F>(&self, hook: F)
    where
        F: Fn(&Arc<dyn NetSession>, &[u8]) + Send + Sync + 'static,
    {
        self.inner.hooks.received.write().expect("hook list lock poisoned").push(Arc::new(hook));
    }

    pub fn subscribe_error<F>(&self, hook: F)
    where
        F: Fn(&ListenerError) + Send + Sync + 'static,
    {
        self.inner.hooks.error.write().expect("hook list lock poisoned").push(Arc::new(hook));
    }

    /// Attached listeners in insertion order.
    pub fn servers(&self) -> Vec<Arc<dyn SocketServer>> {
        self.inner.servers.lock().expect("server list mutex poisoned").clone()
    }

    /// Attach a listener. Returns false when it is already attached.
    pub fn attach_server(&self, server: Arc<dyn SocketServer>) -> bool {
        let mut servers = self.inner.servers.lock().expect("server list mutex poisoned");
        if servers.iter().any(|s| same_listener(s, &server)) {
            return false;
        }

        let local = server.local();
        let transport = if local.protocol.is_udp() { "Udp" } else { "Tcp" };
        let suffix = if local.family() == AddressFamily::InterNetworkV6 { "6" } else { "" };
        server.set_name(&format!("{}{}{}", self.inner.name, transport, suffix));

        let options = self.options();
        server.configure(ListenerOptions {
            session_timeout: options.session_timeout,
            codec: options.codec.clone(),
        });
        if local.protocol.is_udp() {
            server.set_max_async(udp_concurrency(options.udp_concurrency_ratio));
        }
        server.stats().attach_to(&self.inner.stats);

        let weak = self.downgrade();
        server.on_new_session(Arc::new(move |accepted| {
            if let Some(inner) = weak.upgrade() {
                NetServer::from_inner(inner).on_new_session(accepted);
            } else {
                accepted.connection.close("server dropped");
            }
        }));
        let weak = self.downgrade();
        server.on_error(Arc::new(move |error| {
            if let Some(inner) = weak.upgrade() {
                for hook in snapshot(&inner.hooks.error) {
                    hook(error);
                }
            }
        }));

        servers.push(server);
        true
    }

    /// Create listeners for an endpoint and attach them. Returns how many were attached.
    pub fn add_server(
        &self,
        address: IpAddr,
        port: u16,
        protocol: NetType,
        family: AddressFamily,
    ) -> usize {
        factory::create_servers(address, port, protocol, family)
            .into_iter()
            .filter(|server| self.attach_server(server.clone()))
            .count()
    }

    /// Create the default listeners when none were attached.
    pub fn ensure_create_server(&self) {
        if !self.servers().is_empty() {
            return;
        }
        let local = self.local();
        let count = self.add_server(local.address, local.port, local.protocol, self.family());
        if count == 0 {
            tracing::warn!(server = %self.inner.name, endpoint = %local, "No listener could be created");
        }
    }

    /// True while at least one listener is active.
    pub fn is_active(&self) -> bool {
        self.servers().iter().any(|s| s.is_active())
    }

    /// Start every listener. Returns whether the server is active afterwards.
    ///
    /// When the configured port is 0 the first bound port is written back and
    /// shared with every sibling still at 0.
    pub fn start(&self) -> bool {
        if self.is_active() {
            return true;
        }

        self.ensure_create_server();
        let servers = self.servers();
        let mut port = self.port();

        for server in &servers {
            if port != 0 && server.port() == 0 {
                server.set_port(port);
            }
            match server.start() {
                Ok(()) => {
                    if port == 0 {
                        port = server.port();
                        self.set_port(port);
                        for sibling in &servers {
                            if sibling.port() == 0 {
                                sibling.set_port(port);
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::error!(server = %self.inner.name, listener = %server.name(), error = %e, "Listener failed to start");
                    for hook in snapshot(&self.inner.hooks.error) {
                        hook(&e);
                    }
                }
            }
        }

        let active = self.is_active();
        if active {
            tracing::info!(server = %self.inner.name, port, listeners = servers.len(), "Server started");
        } else {
            tracing::warn!(server = %self.inner.name, "Server has no active listener");
        }
        active
    }

    /// Stop every active listener. An empty reason is replaced by a generated tag.
    pub fn stop(&self, reason: &str) {
        let reason = if reason.is_empty() {
            let tag = uuid::Uuid::new_v4().simple().to_string();
            format!("{}Stop-{}", self.inner.name, &tag[..8])
        } else {
            reason.to_string()
        };

        let mut stopped = 0usize;
        for server in self.servers() {
            if server.is_active() {
                server.stop(&reason);
                stopped += 1;
            }
        }
        if stopped > 0 {
            tracing::info!(server = %self.inner.name, reason = %reason, stopped, "Server stopped");
        }
    }

    fn next_session_id(&self) -> u32 {
        loop {
            let id = self
                .inner
                .session_seq
                .fetch_add(1, Ordering::Relaxed)
                .wrapping_add(1);
            if id != 0 {
                return id;
            }
        }
    }

    /// Create, register and start a session for an accepted connection.
    pub fn on_new_session(&self, accepted: Accepted) -> Arc<dyn NetSession> {
        let Accepted { connection, inbound } = accepted;

        let count = self.inner.session_count.fetch_add(1, Ordering::SeqCst) + 1;
        self.inner.max_session_count.fetch_max(count, Ordering::SeqCst);

        let id = self.next_session_id();
        let core = SessionCore::new(id, self.inner.name.clone(), connection, self.downgrade());
        let factory = self.inner.factory.read().expect("session factory lock poisoned").clone();
        let session = factory(core);

        if self.use_session() {
            self.add_session(session.clone());
        }
        metrics::record_session_opened(&self.inner.name, count);

        for hook in snapshot(&self.inner.hooks.new_session) {
            hook(&session);
        }

        tokio::spawn(run_session(self.downgrade(), session.clone(), inbound));
        session
    }

    /// Register a session. Refuses disposed sessions and ids already present.
    pub fn add_session(&self, session: Arc<dyn NetSession>) -> bool {
        if session.core().is_disposed() {
            return false;
        }
        let mut sessions = self.inner.sessions.lock().expect("session table mutex poisoned");
        if sessions.contains_key(&session.id()) {
            return false;
        }
        sessions.insert(session.id(), session);
        true
    }

    pub fn get_session(&self, id: u32) -> Option<Arc<dyn NetSession>> {
        if id == 0 {
            return None;
        }
        self.inner
            .sessions
            .lock()
            .expect("session table mutex poisoned")
            .get(&id)
            .cloned()
    }

    /// Typed lookup for servers running a custom session factory.
    pub fn get_session_as<S: NetSession>(&self, id: u32) -> Option<Arc<S>> {
        self.get_session(id)?.into_any().downcast::<S>().ok()
    }

    /// Snapshot of the registered sessions.
    pub fn sessions(&self) -> Vec<Arc<dyn NetSession>> {
        self.inner
            .sessions
            .lock()
            .expect("session table mutex poisoned")
            .values()
            .cloned()
            .collect()
    }

    pub fn session_count(&self) -> usize {
        self.inner.session_count.load(Ordering::SeqCst)
    }

    pub fn max_session_count(&self) -> usize {
        self.inner.max_session_count.load(Ordering::SeqCst)
    }

    pub fn stats(&self) -> &ListenerStats {
        &self.inner.stats
    }

    /// Send `buffer` to every session registered right now, concurrently.
    ///
    /// Resolves once every send finished and returns how many sessions were
    /// addressed.
    pub async fn send_all(&self, buffer: &[u8]) -> Result<usize, NetError> {
        if !self.use_session() {
            return Err(NetError::SessionTrackingDisabled);
        }

        let targets = self.sessions();
        let payload: Arc<[u8]> = Arc::from(buffer);
        let sends = targets.iter().map(|session| {
            let connection = session.core().connection().clone();
            let payload = payload.clone();
            tokio::spawn(async move { connection.send(&payload).await })
        });

        for result in join_all(sends).await {
            match result {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => tracing::debug!(server = %self.inner.name, error = %e, "Broadcast send failed"),
                Err(e) => tracing::warn!(server = %self.inner.name, error = %e, "Broadcast task failed"),
            }
        }
        Ok(targets.len())
    }

    /// Human-readable counters.
    pub fn get_stat(&self) -> String {
        format!(
            "Online: {}/{} Sessions: {} Send: {} Receive: {}",
            self.session_count(),
            self.max_session_count(),
            self.inner.stats.session,
            self.inner.stats.send,
            self.inner.stats.receive,
        )
    }

    /// Stop, then close every session, then release every listener.
    pub fn dispose(&self) {
        let sessions: Vec<Arc<dyn NetSession>> = self
            .inner
            .sessions
            .lock()
            .expect("session table mutex poisoned")
            .drain()
            .map(|(_, session)| session)
            .collect();
        let servers = self.servers();
        tracing::info!(
            server = %self.inner.name,
            sessions = sessions.len(),
            listeners = servers.len(),
            "Disposing server"
        );

        self.stop("Dispose");
        for session in &sessions {
            session.core().close("Dispose");
        }
        for server in &servers {
            server.stop("Dispose");
        }
        self.inner.servers.lock().expect("server list mutex poisoned").clear();
    }
}

/// Receive task of one session. Runs callbacks in arrival order and disposes
/// the session once the connection is gone.
async fn run_session(
    server: Weak<ServerInner>,
    session: Arc<dyn NetSession>,
    mut inbound: mpsc::Receiver<Vec<u8>>,
) {
    let connection = session.core().connection().clone();
    let closed = connection.closed();
    tokio::pin!(closed);

    session.on_start();
    loop {
        let packet = tokio::select! {
            biased;
            packet = inbound.recv() => match packet {
                Some(packet) => packet,
                None => break,
            },
            _ = &mut closed => break,
        };

        if let Some(inner) = server.upgrade() {
            for hook in snapshot(&inner.hooks.received) {
                hook(&session, &packet);
            }
        }

        if let Some(reply) = session.on_receive(&packet) {
            if let Err(e) = connection.send(&reply).await {
                tracing::debug!(session_id = session.id(), error = %e, "Reply not delivered");
                break;
            }
        }
    }

    connection.shutdown().await;
    dispose_session(&server, &session);
}

fn dispose_session(server: &Weak<ServerInner>, session: &Arc<dyn NetSession>) {
    if !session.core().mark_disposed() {
        return;
    }
    if let Some(inner) = server.upgrade() {
        let mut sessions = inner.sessions.lock().expect("session table mutex poisoned");
        if sessions
            .get(&session.id())
            .is_some_and(|existing| same_session(existing, session))
        {
            sessions.remove(&session.id());
        }
        drop(sessions);
        let active = inner.session_count.fetch_sub(1, Ordering::SeqCst).saturating_sub(1);
        metrics::record_session_closed(&inner.name, active);
    }
    session.on_dispose();
}

impl fmt::Display for NetServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let servers = self.servers();
        if servers.is_empty() {
            return write!(f, "{} {}", self.inner.name, self.local());
        }
        let endpoints: Vec<String> = servers.iter().map(|s| s.local().to_string()).collect();
        write!(f, "{} [{}]", self.inner.name, endpoints.join(", "))
    }
}

impl fmt::Debug for NetServer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NetServer")
            .field("name", &self.inner.name)
            .field("local", &self.local())
            .field("sessions", &self.session_count())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::connection::Connection;
    use std::net::{Ipv4Addr, SocketAddr};

    fn accepted() -> (Accepted, mpsc::Sender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>) {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let remote = SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 40000);
        let connection = Connection::channel(NetUri::default(), remote, out_tx);
        let (in_tx, inbound) = mpsc::channel(8);
        (Accepted { connection, inbound }, in_tx, out_rx)
    }

    #[test]
    fn concurrency_is_never_zero() {
        assert_eq!(udp_concurrency(0.0), 1);
        assert!(udp_concurrency(DEFAULT_UDP_CONCURRENCY_RATIO) >= 1);
    }

    #[tokio::test]
    async fn ids_skip_zero_on_wrap() {
        let server = NetServer::new("Wrap", NetUri::default());
        server.inner.session_seq.store(u32::MAX - 1, Ordering::SeqCst);
        assert_eq!(server.next_session_id(), u32::MAX);
        assert_eq!(server.next_session_id(), 1);
    }

    #[tokio::test]
    async fn disposed_session_is_removed_and_not_reinserted() {
        let server = NetServer::new("Test", NetUri::default());
        let (accepted, in_tx, _out) = accepted();
        let session = server.on_new_session(accepted);
        let id = session.id();
        assert!(server.get_session(id).is_some());
        assert!(server.get_session(0).is_none());

        drop(in_tx);
        for _ in 0..100 {
            if session.core().is_disposed() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(session.core().is_disposed());
        assert!(server.get_session(id).is_none());
        assert_eq!(server.session_count(), 0);
        assert_eq!(server.max_session_count(), 1);
        assert!(!server.add_session(session));
    }

    #[tokio::test]
    async fn broadcast_requires_session_table() {
        let server = NetServer::new("NoTable", NetUri::default());
        server.set_options(ServerOptions {
            use_session: false,
            ..ServerOptions::default()
        });
        assert!(matches!(
            server.send_all(b"x").await,
            Err(NetError::SessionTrackingDisabled)
        ));
    }
}
