//! Integration tests for the session server over real loopback sockets.

use std::any::Any;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::{TcpStream, UdpSocket};
use tokio::sync::mpsc;

use netrpc::net::factory::ipv6_supported;
use netrpc::net::{
    Accepted, AddressFamily, Connection, NetServer, NetSession, NetType, NetUri, SessionCore,
    SocketServer, TcpServer,
};

mod common;

struct EchoSession {
    core: SessionCore,
    disposed: Arc<AtomicUsize>,
}

impl NetSession for EchoSession {
    fn core(&self) -> &SessionCore {
        &self.core
    }

    fn on_receive(&self, packet: &[u8]) -> Option<Vec<u8>> {
        Some(packet.to_vec())
    }

    fn on_dispose(&self) {
        self.disposed.fetch_add(1, Ordering::SeqCst);
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn echo_server(name: &str, protocol: NetType) -> (NetServer, Arc<AtomicUsize>) {
    let server = NetServer::new(name, common::loopback(protocol));
    let disposed = Arc::new(AtomicUsize::new(0));
    let counter = disposed.clone();
    server.set_session_factory(move |core| {
        Arc::new(EchoSession {
            core,
            disposed: counter.clone(),
        }) as Arc<dyn NetSession>
    });
    (server, disposed)
}

#[tokio::test(flavor = "multi_thread")]
async fn tcp_echo_and_disposal() {
    let (server, disposed) = echo_server("Echo", NetType::Tcp);
    let opened = Arc::new(AtomicUsize::new(0));
    let hook = opened.clone();
    server.subscribe_new_session(move |_| {
        hook.fetch_add(1, Ordering::SeqCst);
    });

    assert!(server.start());
    let port = server.port();
    assert_ne!(port, 0);
    assert_eq!(server.servers().len(), 1);
    assert_eq!(server.servers()[0].name(), "EchoTcp");

    let mut client = TcpStream::connect(common::addr(port)).await.unwrap();
    common::write_frame(&mut client, b"hello").await;
    assert_eq!(common::read_frame(&mut client).await, b"hello");

    assert_eq!(opened.load(Ordering::SeqCst), 1);
    assert_eq!(server.session_count(), 1);
    let id = server.sessions()[0].id();
    assert_ne!(id, 0);
    assert!(server.get_session_as::<EchoSession>(id).is_some());
    assert!(server.get_session(0).is_none());

    drop(client);
    assert!(common::wait_until(|| server.session_count() == 0).await);
    assert!(server.get_session(id).is_none());
    assert_eq!(disposed.load(Ordering::SeqCst), 1);
    assert_eq!(server.max_session_count(), 1);

    server.stop("test");
}

#[tokio::test(flavor = "multi_thread")]
async fn session_ids_are_unique() {
    let (server, _) = echo_server("Ids", NetType::Tcp);
    assert!(server.start());

    let mut clients = Vec::new();
    for _ in 0..5 {
        let mut client = TcpStream::connect(common::addr(server.port())).await.unwrap();
        common::write_frame(&mut client, b"x").await;
        common::read_frame(&mut client).await;
        clients.push(client);
    }

    let mut ids: Vec<u32> = server.sessions().iter().map(|s| s.id()).collect();
    ids.sort_unstable();
    ids.dedup();
    assert_eq!(ids.len(), 5);
    assert!(!ids.contains(&0));

    server.dispose();
    assert!(!server.is_active());
}

#[tokio::test(flavor = "multi_thread")]
async fn send_all_reaches_every_session() {
    let (server, _) = echo_server("Broadcast", NetType::Tcp);
    assert!(server.start());

    let mut first = TcpStream::connect(common::addr(server.port())).await.unwrap();
    let mut second = TcpStream::connect(common::addr(server.port())).await.unwrap();
    assert!(common::wait_until(|| server.session_count() == 2).await);

    assert_eq!(server.send_all(b"news").await.unwrap(), 2);
    assert_eq!(common::read_frame(&mut first).await, b"news");
    assert_eq!(common::read_frame(&mut second).await, b"news");

    server.stop("");
}

/// Register an in-memory session. Keep the returned sender alive or the
/// session ends as soon as its inbound queue closes.
fn channel_session(
    server: &NetServer,
) -> (Arc<dyn NetSession>, mpsc::Sender<Vec<u8>>, mpsc::UnboundedReceiver<Vec<u8>>) {
    let (out_tx, out_rx) = mpsc::unbounded_channel();
    let (in_tx, inbound) = mpsc::channel(8);
    let remote = SocketAddr::from(([127, 0, 0, 1], 9));
    let connection = Connection::channel(server.local(), remote, out_tx);
    let session = server.on_new_session(Accepted { connection, inbound });
    (session, in_tx, out_rx)
}

#[tokio::test(flavor = "multi_thread")]
async fn send_all_snapshots_sessions_and_waits_for_slow_peers() {
    let (server, _) = echo_server("Snapshot", NetType::Tcp);
    assert!(server.start());

    // This peer never reads, so a large broadcast stalls on its socket.
    let mut slow = TcpStream::connect(common::addr(server.port())).await.unwrap();
    assert!(common::wait_until(|| server.session_count() == 1).await);
    let (_fast, _fast_in, mut fast_out) = channel_session(&server);

    let (gone, _gone_in, _) = channel_session(&server);
    gone.core().close("test");
    assert!(common::wait_until(|| server.session_count() == 2).await);
    assert!(server.get_session(gone.id()).is_none());

    let payload = vec![7u8; 32 * 1024 * 1024];
    let broadcaster = server.clone();
    let body = payload.clone();
    let broadcast = tokio::spawn(async move { broadcaster.send_all(&body).await });

    assert_eq!(fast_out.recv().await.unwrap().len(), payload.len());
    let (_late, _late_in, mut late_out) = channel_session(&server);
    assert_eq!(server.session_count(), 3);
    assert!(!broadcast.is_finished());

    let mut header = [0u8; 4];
    slow.read_exact(&mut header).await.unwrap();
    assert_eq!(u32::from_be_bytes(header) as usize, payload.len());
    let mut body = vec![0u8; payload.len()];
    slow.read_exact(&mut body).await.unwrap();

    assert_eq!(broadcast.await.unwrap().unwrap(), 2);
    assert!(late_out.try_recv().is_err());

    server.stop("test");
}

#[tokio::test(flavor = "multi_thread")]
async fn attach_is_deduplicated_and_ordered() {
    let server = NetServer::new("Attach", common::loopback(NetType::Tcp));
    let a: Arc<dyn SocketServer> = Arc::new(TcpServer::new(common::loopback(NetType::Tcp)));
    let b: Arc<dyn SocketServer> = Arc::new(TcpServer::new(common::loopback(NetType::Tcp)));

    assert!(server.attach_server(a.clone()));
    assert!(!server.attach_server(a.clone()));
    assert!(server.attach_server(b.clone()));

    let servers = server.servers();
    assert_eq!(servers.len(), 2);
    assert!(Arc::ptr_eq(&servers[0], &a));
    assert!(Arc::ptr_eq(&servers[1], &b));
}

#[tokio::test(flavor = "multi_thread")]
async fn unknown_protocol_shares_one_port() {
    let server = NetServer::new("Dual", common::loopback(NetType::Unknown));
    let created = server.add_server(
        "127.0.0.1".parse::<IpAddr>().unwrap(),
        0,
        NetType::Unknown,
        AddressFamily::Unspecified,
    );
    assert_eq!(created, 2);

    assert!(server.start());
    let port = server.port();
    assert_ne!(port, 0);
    let listeners = server.servers();
    assert!(listeners[0].local().protocol.is_tcp());
    assert!(listeners[1].local().protocol.is_udp());
    assert!(listeners.iter().all(|s| s.port() == port));
    assert!(listeners.iter().all(|s| s.is_active()));

    server.stop("test");
}

#[tokio::test(flavor = "multi_thread")]
async fn any_address_gets_four_listeners_on_one_port() {
    let any = NetUri::new(NetType::Unknown, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0);
    let server = NetServer::new("Any", any);
    assert!(server.start());

    let port = server.port();
    assert_ne!(port, 0);
    let listeners = server.servers();
    let mut names: Vec<String> = listeners.iter().map(|s| s.name()).collect();
    names.sort();
    if ipv6_supported() {
        assert_eq!(names, ["AnyTcp", "AnyTcp6", "AnyUdp", "AnyUdp6"]);
    } else {
        assert_eq!(names, ["AnyTcp", "AnyUdp"]);
    }
    assert!(listeners.iter().all(|s| s.is_active()));
    assert!(listeners.iter().all(|s| s.port() == port));

    server.stop("test");
    assert!(listeners.iter().all(|s| !s.is_active()));
}

#[tokio::test(flavor = "multi_thread")]
async fn stop_is_idempotent_and_restart_reuses_port() {
    let (server, _) = echo_server("Restart", NetType::Tcp);
    assert!(server.start());
    let port = server.port();

    server.stop("first");
    server.stop("second");
    assert!(!server.is_active());

    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(server.start());
    assert_eq!(server.port(), port);

    let mut client = TcpStream::connect(common::addr(port)).await.unwrap();
    common::write_frame(&mut client, b"again").await;
    assert_eq!(common::read_frame(&mut client).await, b"again");
    server.stop("done");
}

#[tokio::test(flavor = "multi_thread")]
async fn udp_peer_keeps_one_session() {
    let (server, _) = echo_server("Datagram", NetType::Udp);
    assert!(server.start());
    let target = common::addr(server.port());

    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut buf = [0u8; 64];
    for payload in [&b"one"[..], &b"two"[..]] {
        socket.send_to(payload, target).await.unwrap();
        let (n, _) = tokio::time::timeout(Duration::from_secs(2), socket.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..n], payload);
    }

    assert_eq!(server.session_count(), 1);
    assert_eq!(server.stats().receive.total(), 2);
    server.stop("test");
}
