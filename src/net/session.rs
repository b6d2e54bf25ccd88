//! Session capability interface.
//!
//! A session is the server-side object for one logical peer. Applications
//! plug their own session type into a [`NetServer`](super::NetServer) with a
//! [`SessionFactory`]; the registry only ever stores `Arc<dyn NetSession>`.

use std::any::Any;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use super::connection::{Connection, NetError};
use super::server::{NetServer, ServerInner};

/// Behaviour of a session owned by a [`NetServer`].
///
/// Callbacks run on the session's own receive task: `on_start` once before
/// any packet, `on_receive` once per packet in arrival order, `on_dispose`
/// exactly once after the last `on_receive` returned.
pub trait NetSession: Send + Sync + 'static {
    fn core(&self) -> &SessionCore;

    fn id(&self) -> u32 {
        self.core().id()
    }

    fn on_start(&self) {}

    /// Handle one inbound packet. A returned buffer is sent back to the peer.
    fn on_receive(&self, _packet: &[u8]) -> Option<Vec<u8>> {
        None
    }

    fn on_dispose(&self) {}

    /// Upcast for typed lookups (`NetServer::get_session_as`).
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

/// Builds the session for a new connection.
pub type SessionFactory = Arc<dyn Fn(SessionCore) -> Arc<dyn NetSession> + Send + Sync>;

/// State every session carries: id, connection, and a weak back-reference
/// to the owning server.
pub struct SessionCore {
    id: u32,
    server_name: String,
    connection: Arc<Connection>,
    server: Weak<ServerInner>,
    disposed: AtomicBool,
}

impl SessionCore {
    pub(crate) fn new(
        id: u32,
        server_name: String,
        connection: Arc<Connection>,
        server: Weak<ServerInner>,
    ) -> Self {
        Self {
            id,
            server_name,
            connection,
            server,
            disposed: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    pub fn connection(&self) -> &Arc<Connection> {
        &self.connection
    }

    pub fn remote(&self) -> SocketAddr {
        self.connection.remote()
    }

    /// Owning server, while it is still alive.
    pub fn server(&self) -> Option<NetServer> {
        self.server.upgrade().map(NetServer::from_inner)
    }

    pub async fn send(&self, payload: &[u8]) -> Result<usize, NetError> {
        self.connection.send(payload).await
    }

    /// Close the connection; disposal follows once the receive task drains.
    pub fn close(&self, reason: &str) {
        self.connection.close(reason);
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::SeqCst)
    }

    /// Returns true for the one caller that performs disposal.
    pub(crate) fn mark_disposed(&self) -> bool {
        !self.disposed.swap(true, Ordering::SeqCst)
    }
}

impl std::fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCore")
            .field("id", &self.id)
            .field("server", &self.server_name)
            .field("remote", &self.remote())
            .field("disposed", &self.is_disposed())
            .finish()
    }
}

/// Session that just holds its connection.
#[derive(Debug)]
pub struct PlainSession {
    core: SessionCore,
}

impl PlainSession {
    pub fn new(core: SessionCore) -> Self {
        Self { core }
    }

    pub fn factory() -> SessionFactory {
        Arc::new(|core| Arc::new(PlainSession::new(core)) as Arc<dyn NetSession>)
    }
}

impl NetSession for PlainSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}
