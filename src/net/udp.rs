//! UDP listener.
//!
//! A datagram socket has no accept step: the first datagram from an unseen
//! remote address creates a peer [`Connection`] and fires the new-session
//! handler. Later datagrams from that remote are queued onto the same peer.
//!
//! # Design Decisions
//! - Several receive loops share one socket (see [`SocketServer::set_max_async`])
//! - With more than one loop, two datagrams from the same peer may be queued
//!   out of order, and a peer's first two datagrams may race to create it.
//!   A single loop keeps per-peer arrival order; pick the ratio accordingly.
//! - A full peer queue drops the datagram instead of stalling the socket
//! - A sweep task closes peers idle past the session timeout

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::{broadcast, mpsc};

use super::connection::Connection;
use super::factory;
use super::listener::{
    Accepted, ErrorHandler, ListenerError, ListenerOptions, ListenerState, ListenerStats,
    NewSessionHandler, SocketServer, INBOUND_QUEUE,
};
use super::uri::{NetType, NetUri};
use crate::lifecycle::Shutdown;
use crate::observability::metrics;

const MAX_DATAGRAM: usize = 64 * 1024;
const MIN_SWEEP: Duration = Duration::from_millis(50);

struct UdpPeer {
    tx: mpsc::Sender<Vec<u8>>,
    connection: Arc<Connection>,
    last_active: AtomicU64,
}

/// A UDP listener.
pub struct UdpServer {
    shared: Arc<UdpShared>,
}

struct UdpShared {
    state: Mutex<ListenerState>,
    stats: ListenerStats,
    active: AtomicBool,
    max_async: AtomicUsize,
    peers: DashMap<SocketAddr, UdpPeer>,
    epoch: Instant,
}

impl UdpServer {
    pub fn new(local: NetUri) -> Self {
        Self {
            shared: Arc::new(UdpShared {
                state: Mutex::new(ListenerState::new(local.with_protocol(NetType::Udp))),
                stats: ListenerStats::default(),
                active: AtomicBool::new(false),
                max_async: AtomicUsize::new(1),
                peers: DashMap::new(),
                epoch: Instant::now(),
            }),
        }
    }

    /// Number of remote peers currently tracked.
    pub fn peer_count(&self) -> usize {
        self.shared.peers.len()
    }

    pub fn max_async(&self) -> usize {
        self.shared.max_async.load(Ordering::Relaxed)
    }
}

impl UdpShared {
    fn state(&self) -> std::sync::MutexGuard<'_, ListenerState> {
        self.state.lock().expect("listener state mutex poisoned")
    }

    fn now_millis(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    fn report(&self, error: ListenerError) {
        let handler = self.state().on_error.clone();
        tracing::warn!(error = %error, "UDP listener error");
        if let Some(handler) = handler {
            handler(&error);
        }
    }

    fn dispatch(self: &Arc<Self>, socket: &Arc<UdpSocket>, remote: SocketAddr, packet: Vec<u8>) {
        self.stats.receive.increment(packet.len() as u64);
        metrics::record_bytes("received", packet.len());
        let now = self.now_millis();

        let accepted = match self.peers.entry(remote) {
            Entry::Occupied(mut entry) => {
                let peer = entry.get();
                peer.last_active.store(now, Ordering::Relaxed);
                match peer.tx.try_send(packet) {
                    Ok(()) => return,
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::debug!(peer_addr = %remote, "Peer queue full, datagram dropped");
                        return;
                    }
                    Err(mpsc::error::TrySendError::Closed(packet)) => {
                        // Session went away but the peer entry is still here.
                        peer.connection.close("session gone");
                        let (peer, accepted) = self.new_peer(socket, remote, packet, now);
                        entry.insert(peer);
                        accepted
                    }
                }
            }
            Entry::Vacant(entry) => {
                let (peer, accepted) = self.new_peer(socket, remote, packet, now);
                entry.insert(peer);
                accepted
            }
        };

        let handler = self.state().on_new_session.clone();
        match handler {
            Some(handler) => handler(accepted),
            None => accepted.connection.close("no session handler"),
        }
    }

    fn new_peer(
        self: &Arc<Self>,
        socket: &Arc<UdpSocket>,
        remote: SocketAddr,
        packet: Vec<u8>,
        now: u64,
    ) -> (UdpPeer, Accepted) {
        let local = self.state().local.clone();
        let connection = Connection::udp(local, remote, socket.clone(), self.stats.send.clone());
        let (tx, inbound) = mpsc::channel(INBOUND_QUEUE);
        let _ = tx.try_send(packet);
        self.stats.session.increment(0);

        let id = connection.id();
        let closed = connection.closed();
        let shared: Weak<UdpShared> = Arc::downgrade(self);
        tokio::spawn(async move {
            closed.await;
            if let Some(shared) = shared.upgrade() {
                shared.peers.remove_if(&remote, |_, peer| peer.connection.id() == id);
            }
        });

        tracing::debug!(connection_id = %id, peer_addr = %remote, "UDP peer created");

        let peer = UdpPeer {
            tx,
            connection: connection.clone(),
            last_active: AtomicU64::new(now),
        };
        (peer, Accepted { connection, inbound })
    }

    fn sweep(&self, timeout: Duration) {
        let limit = timeout.as_millis() as u64;
        let now = self.now_millis();
        let idle: Vec<Arc<Connection>> = self
            .peers
            .iter()
            .filter(|peer| now.saturating_sub(peer.last_active.load(Ordering::Relaxed)) > limit)
            .map(|peer| peer.connection.clone())
            .collect();
        for connection in idle {
            connection.close("idle timeout");
        }
    }
}

async fn receive_loop(
    shared: Arc<UdpShared>,
    socket: Arc<UdpSocket>,
    mut shutdown: broadcast::Receiver<()>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            result = socket.recv_from(&mut buf) => match result {
                Ok((n, remote)) => shared.dispatch(&socket, remote, buf[..n].to_vec()),
                Err(e) => {
                    shared.report(ListenerError::Receive(e));
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
            },
        }
    }
}

async fn sweep_loop(shared: Weak<UdpShared>, timeout: Duration, mut shutdown: broadcast::Receiver<()>) {
    let mut ticker = tokio::time::interval((timeout / 2).max(MIN_SWEEP));
    loop {
        tokio::select! {
            _ = shutdown.recv() => break,
            _ = ticker.tick() => match shared.upgrade() {
                Some(shared) => shared.sweep(timeout),
                None => break,
            },
        }
    }
}

impl SocketServer for UdpServer {
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

    fn set_max_async(&self, max: usize) {
        self.shared.max_async.store(max.max(1), Ordering::Relaxed);
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
        let socket = factory::bind_udp(address)
            .map_err(|source| ListenerError::Bind { address, source })?;
        let bound = socket
            .local_addr()
            .map_err(|source| ListenerError::Bind { address, source })?;
        state.local.port = bound.port();

        let socket = Arc::new(socket);
        let shutdown = Shutdown::new();
        let loops = self.max_async();
        for _ in 0..loops {
            state.tasks.push(tokio::spawn(receive_loop(
                self.shared.clone(),
                socket.clone(),
                shutdown.subscribe(),
            )));
        }
        if let Some(timeout) = state.options.session_timeout {
            state.tasks.push(tokio::spawn(sweep_loop(
                Arc::downgrade(&self.shared),
                timeout,
                shutdown.subscribe(),
            )));
        }
        state.shutdown = Some(shutdown);
        self.shared.active.store(true, Ordering::SeqCst);

        tracing::info!(name = %state.name, address = %bound, receivers = loops, "UDP listener started");
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

        let peers: Vec<Arc<Connection>> = self
            .shared
            .peers
            .iter()
            .map(|peer| peer.connection.clone())
            .collect();
        self.shared.peers.clear();
        for connection in &peers {
            connection.close(reason);
        }

        tracing::info!(name = %name, reason, closed = peers.len(), "UDP listener stopped");
    }
}

impl Drop for UdpServer {
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

    fn loopback() -> NetUri {
        NetUri::new(NetType::Udp, IpAddr::V4(Ipv4Addr::LOCALHOST), 0)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn first_datagram_creates_one_peer() {
        let server = UdpServer::new(loopback());
        server.set_max_async(3);
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.on_new_session(Arc::new(move |accepted: Accepted| {
            let _ = tx.send(accepted);
        }));
        server.start().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = server.local().socket_addr();
        client.send_to(b"a", target).await.unwrap();

        let mut accepted = rx.recv().await.unwrap();
        assert_eq!(accepted.inbound.recv().await.unwrap(), b"a".to_vec());

        client.send_to(b"b", target).await.unwrap();
        assert_eq!(accepted.inbound.recv().await.unwrap(), b"b".to_vec());
        assert_eq!(server.peer_count(), 1);
        assert!(rx.try_recv().is_err());

        accepted.connection.send(b"pong").await.unwrap();
        let mut buf = [0u8; 16];
        let (n, _) = client.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"pong");

        server.stop("test");
        assert!(accepted.connection.is_closed());
        assert_eq!(server.peer_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn single_receiver_keeps_peer_order() {
        let server = UdpServer::new(loopback());
        server.set_max_async(1);
        let (tx, mut rx) = mpsc::unbounded_channel();
        server.on_new_session(Arc::new(move |accepted: Accepted| {
            let _ = tx.send(accepted);
        }));
        server.start().unwrap();

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let target = server.local().socket_addr();
        for i in 0u8..64 {
            client.send_to(&[i], target).await.unwrap();
        }

        let mut accepted = rx.recv().await.unwrap();
        for i in 0u8..64 {
            let packet = tokio::time::timeout(Duration::from_secs(2), accepted.inbound.recv())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(packet, vec![i]);
        }
        assert!(rx.try_recv().is_err());

        server.stop("test");
    }
}
