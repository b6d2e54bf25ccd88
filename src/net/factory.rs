//! Socket binding helpers and the listener factory.

use std::io;
use std::net::{IpAddr, Ipv6Addr, SocketAddr};
use std::sync::{Arc, OnceLock};

use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::{TcpListener, UdpSocket};

use super::listener::{SocketServer, TcpServer};
use super::udp::UdpServer;
use super::uri::{AddressFamily, NetType, NetUri};

const BACKLOG: i32 = 1024;

fn new_socket(address: SocketAddr, ty: Type, protocol: Protocol) -> io::Result<Socket> {
    let socket = Socket::new(Domain::for_address(address), ty, Some(protocol))?;
    if address.is_ipv6() {
        // Lets an IPv4 and an IPv6 listener share one port.
        socket.set_only_v6(true)?;
    }
    socket.set_nonblocking(true)?;
    Ok(socket)
}

/// Bind a listening TCP socket. Must be called inside a Tokio runtime.
pub fn bind_tcp(address: SocketAddr) -> io::Result<TcpListener> {
    let socket = new_socket(address, Type::STREAM, Protocol::TCP)?;
    #[cfg(not(windows))]
    socket.set_reuse_address(true)?;
    socket.bind(&address.into())?;
    socket.listen(BACKLOG)?;
    TcpListener::from_std(socket.into())
}

/// Bind a UDP socket. Must be called inside a Tokio runtime.
pub fn bind_udp(address: SocketAddr) -> io::Result<UdpSocket> {
    let socket = new_socket(address, Type::DGRAM, Protocol::UDP)?;
    socket.bind(&address.into())?;
    UdpSocket::from_std(socket.into())
}

/// Whether this host can open IPv6 sockets. Probed once.
pub fn ipv6_supported() -> bool {
    static SUPPORTED: OnceLock<bool> = OnceLock::new();
    *SUPPORTED.get_or_init(|| {
        let probe = SocketAddr::new(IpAddr::V6(Ipv6Addr::LOCALHOST), 0);
        Socket::new(Domain::IPV6, Type::STREAM, Some(Protocol::TCP))
            .and_then(|socket| socket.bind(&probe.into()))
            .is_ok()
    })
}

/// Whether `(protocol, address)` is already bound on this host.
///
/// Port 0 is never in use. Any protocol other than UDP is probed as TCP.
pub fn is_port_in_use(protocol: NetType, address: SocketAddr) -> bool {
    if address.port() == 0 {
        return false;
    }
    let (ty, proto) = if protocol.is_udp() {
        (Type::DGRAM, Protocol::UDP)
    } else {
        (Type::STREAM, Protocol::TCP)
    };
    let probe = match Socket::new(Domain::for_address(address), ty, Some(proto)) {
        Ok(socket) => socket,
        Err(_) => return false,
    };
    if address.is_ipv6() {
        let _ = probe.set_only_v6(true);
    }
    if !protocol.is_udp() {
        #[cfg(not(windows))]
        let _ = probe.set_reuse_address(true);
    }
    match probe.bind(&address.into()) {
        Ok(()) => false,
        Err(e) => e.kind() == io::ErrorKind::AddrInUse,
    }
}

/// Build listeners for every (transport, family) combination requested.
///
/// The unknown protocol yields TCP and UDP, the unspecified family yields
/// IPv4 and, when supported, IPv6. Endpoints already bound on this host are
/// skipped.
pub fn create_servers(
    address: IpAddr,
    port: u16,
    protocol: NetType,
    family: AddressFamily,
) -> Vec<Arc<dyn SocketServer>> {
    let transports: &[NetType] = match protocol {
        NetType::Unknown => &[NetType::Tcp, NetType::Udp],
        NetType::Udp => &[NetType::Udp],
        _ => &[NetType::Tcp],
    };

    let families: Vec<AddressFamily> = match family {
        AddressFamily::Unspecified => {
            let mut families = vec![AddressFamily::InterNetwork];
            if ipv6_supported() {
                families.push(AddressFamily::InterNetworkV6);
            }
            // A specific address only has one family.
            if !address.is_unspecified() {
                families.retain(|f| *f == AddressFamily::of(&address));
            }
            families
        }
        other => vec![other],
    };

    let mut servers: Vec<Arc<dyn SocketServer>> = Vec::new();
    for transport in transports {
        for family in &families {
            let Some(bind) = family.select(address) else {
                continue;
            };
            let local = NetUri::new(*transport, bind, port);
            if is_port_in_use(*transport, local.socket_addr()) {
                tracing::warn!(endpoint = %local, "Endpoint already in use, skipped");
                continue;
            }
            match transport {
                NetType::Udp => servers.push(Arc::new(UdpServer::new(local))),
                _ => servers.push(Arc::new(TcpServer::new(local))),
            }
        }
    }
    servers
}
