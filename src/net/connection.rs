//! Raw connection handle and lifecycle tracking.
//!
//! # Responsibilities
//! - Generate unique connection IDs for tracing
//! - Track connection state (Active → Closed) on a watch channel
//! - Write outbound packets through the transport-specific link
//! - Pump stream bytes into framed inbound packets

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::UdpSocket;
use tokio::sync::{mpsc, watch, Mutex};

use super::packet::{PacketCodec, RawCodec};
use super::stats::Statistics;
use super::uri::NetUri;
use crate::observability::metrics;

/// Global atomic counter for connection IDs.
/// Relaxed ordering is enough since only uniqueness matters.
static CONNECTION_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

const READ_CHUNK: usize = 8 * 1024;

/// Errors raised while moving bytes over a connection.
#[derive(Debug, thiserror::Error)]
pub enum NetError {
    #[error("connection is closed")]
    Closed,
    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),
    #[error("frame of {len} bytes exceeds the {max} byte limit")]
    FrameTooLarge { len: usize, max: usize },
    #[error("session tracking is disabled")]
    SessionTrackingDisabled,
}

/// Unique identifier for a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(u64);

impl ConnectionId {
    /// Generate a new unique connection ID.
    pub fn new() -> Self {
        Self(CONNECTION_ID_COUNTER.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Connection state for lifecycle tracking.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Active,
    Closed,
}

enum Link {
    Tcp(Mutex<OwnedWriteHalf>),
    Udp(Arc<UdpSocket>),
    Channel(mpsc::UnboundedSender<Vec<u8>>),
}

impl Link {
    fn kind(&self) -> &'static str {
        match self {
            Link::Tcp(_) => "tcp",
            Link::Udp(_) => "udp",
            Link::Channel(_) => "channel",
        }
    }
}

/// One accepted connection (a TCP stream, a UDP peer, or an in-memory pipe).
pub struct Connection {
    id: ConnectionId,
    local: NetUri,
    remote: SocketAddr,
    link: Link,
    codec: Arc<dyn PacketCodec>,
    send_stats: Arc<Statistics>,
    state: watch::Sender<ConnectionState>,
}

impl Connection {
    fn new(
        local: NetUri,
        remote: SocketAddr,
        link: Link,
        codec: Arc<dyn PacketCodec>,
        send_stats: Arc<Statistics>,
    ) -> Arc<Self> {
        let (state, _) = watch::channel(ConnectionState::Active);
        Arc::new(Self {
            id: ConnectionId::new(),
            local,
            remote,
            link,
            codec,
            send_stats,
            state,
        })
    }

    pub fn tcp(
        local: NetUri,
        remote: SocketAddr,
        writer: OwnedWriteHalf,
        codec: Arc<dyn PacketCodec>,
        send_stats: Arc<Statistics>,
    ) -> Arc<Self> {
        Self::new(local, remote, Link::Tcp(Mutex::new(writer)), codec, send_stats)
    }

    /// A UDP peer. Datagrams are never framed.
    pub fn udp(
        local: NetUri,
        remote: SocketAddr,
        socket: Arc<UdpSocket>,
        send_stats: Arc<Statistics>,
    ) -> Arc<Self> {
        Self::new(local, remote, Link::Udp(socket), Arc::new(RawCodec), send_stats)
    }

    /// An in-memory connection whose outbound packets land on `tx`.
    pub fn channel(
        local: NetUri,
        remote: SocketAddr,
        tx: mpsc::UnboundedSender<Vec<u8>>,
    ) -> Arc<Self> {
        Self::new(
            local,
            remote,
            Link::Channel(tx),
            Arc::new(RawCodec),
            Arc::new(Statistics::new()),
        )
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local(&self) -> &NetUri {
        &self.local
    }

    pub fn remote(&self) -> SocketAddr {
        self.remote
    }

    pub fn codec(&self) -> &Arc<dyn PacketCodec> {
        &self.codec
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.borrow()
    }

    pub fn is_closed(&self) -> bool {
        self.state() == ConnectionState::Closed
    }

    /// Write one packet. Returns the payload length on success.
    pub async fn send(&self, payload: &[u8]) -> Result<usize, NetError> {
        if self.is_closed() {
            return Err(NetError::Closed);
        }

        let result = match &self.link {
            Link::Tcp(writer) => {
                let frame = self.codec.frame(payload);
                let mut writer = writer.lock().await;
                writer.write_all(&frame).await.map_err(NetError::from)
            }
            Link::Udp(socket) => socket
                .send_to(payload, self.remote)
                .await
                .map(|_| ())
                .map_err(NetError::from),
            Link::Channel(tx) => tx.send(payload.to_vec()).map_err(|_| NetError::Closed),
        };

        match result {
            Ok(()) => {
                self.send_stats.increment(payload.len() as u64);
                metrics::record_bytes("sent", payload.len());
                Ok(payload.len())
            }
            Err(e) => {
                self.close("send failed");
                Err(e)
            }
        }
    }

    /// Mark the connection closed. Only the first call has any effect.
    pub fn close(&self, reason: &str) {
        let changed = self.state.send_if_modified(|state| {
            if *state == ConnectionState::Closed {
                false
            } else {
                *state = ConnectionState::Closed;
                true
            }
        });
        if changed {
            tracing::debug!(
                connection_id = %self.id,
                remote = %self.remote,
                link = self.link.kind(),
                reason,
                "Connection closed"
            );
        }
    }

    /// Resolves once the connection is closed.
    pub fn closed(&self) -> impl std::future::Future<Output = ()> + Send + 'static {
        let mut rx = self.state.subscribe();
        async move {
            let _ = rx.wait_for(|state| *state == ConnectionState::Closed).await;
        }
    }

    /// Close and release the write side.
    pub async fn shutdown(&self) {
        self.close("shutdown");
        if let Link::Tcp(writer) = &self.link {
            let _ = writer.lock().await.shutdown().await;
        }
    }
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("local", &self.local)
            .field("remote", &self.remote)
            .field("link", &self.link.kind())
            .field("state", &self.state())
            .finish()
    }
}

/// Read loop for stream transports.
///
/// Splits bytes into packets with the connection's codec and forwards them in
/// arrival order. Closes the connection on EOF, read error, oversize frame, or
/// when nothing arrives within `idle`.
pub(crate) async fn pump_stream(
    mut reader: OwnedReadHalf,
    connection: Arc<Connection>,
    tx: mpsc::Sender<Vec<u8>>,
    idle: Option<Duration>,
    receive: Arc<Statistics>,
) {
    let closed = connection.closed();
    tokio::pin!(closed);

    let mut buf = Vec::with_capacity(READ_CHUNK);
    let mut chunk = vec![0u8; READ_CHUNK];

    loop {
        let read = async {
            match idle {
                Some(limit) => tokio::time::timeout(limit, reader.read(&mut chunk)).await.ok(),
                None => Some(reader.read(&mut chunk).await),
            }
        };

        let n = tokio::select! {
            _ = &mut closed => return,
            result = read => match result {
                None => {
                    connection.close("idle timeout");
                    return;
                }
                Some(Ok(0)) => {
                    connection.close("remote closed");
                    return;
                }
                Some(Ok(n)) => n,
                Some(Err(e)) => {
                    tracing::debug!(connection_id = %connection.id(), error = %e, "Read failed");
                    connection.close("read error");
                    return;
                }
            },
        };

        buf.extend_from_slice(&chunk[..n]);
        let packets = match connection.codec().split(&mut buf) {
            Ok(packets) => packets,
            Err(e) => {
                tracing::warn!(connection_id = %connection.id(), error = %e, "Dropping connection");
                connection.close("bad frame");
                return;
            }
        };

        for packet in packets {
            receive.increment(packet.len() as u64);
            metrics::record_bytes("received", packet.len());
            if tx.send(packet).await.is_err() {
                connection.close("session gone");
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn loopback() -> SocketAddr {
        SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), 9)
    }

    #[test]
    fn connection_id_unique() {
        let id1 = ConnectionId::new();
        let id2 = ConnectionId::new();
        assert_ne!(id1, id2);
        assert!(id2.as_u64() > id1.as_u64());
        assert_eq!(id1.to_string(), format!("conn-{}", id1.as_u64()));
    }

    #[tokio::test]
    async fn channel_send_and_close() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let conn = Connection::channel(NetUri::default(), loopback(), tx);

        assert_eq!(conn.send(b"ping").await.unwrap(), 4);
        assert_eq!(rx.recv().await.unwrap(), b"ping".to_vec());

        let closed = conn.closed();
        conn.close("test");
        conn.close("again");
        closed.await;

        assert!(conn.is_closed());
        assert!(matches!(conn.send(b"late").await, Err(NetError::Closed)));
    }
}
