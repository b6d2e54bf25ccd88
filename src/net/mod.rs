//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Incoming TCP connection / first UDP datagram
//!     → listener.rs / udp.rs (accept or peer table)
//!     → connection.rs (raw handle, framed inbound stream via packet.rs)
//!     → server.rs (session creation + registry)
//!     → session.rs (application session callbacks)
//!
//! Connection States:
//!     Active → Closed
//! ```
//!
//! # Design Decisions
//! - One logical server owns up to four listeners (TCP/UDP × IPv4/IPv6)
//! - IPv6 sockets are v6-only so both families can share a port
//! - Counters are hierarchical: listener stats feed the server's

pub mod connection;
pub mod factory;
pub mod listener;
pub mod packet;
pub mod server;
pub mod session;
pub mod stats;
pub mod udp;
pub mod uri;

pub use connection::{Connection, ConnectionId, ConnectionState, NetError};
pub use listener::{Accepted, ListenerError, ListenerOptions, ListenerStats, SocketServer, TcpServer};
pub use packet::{Framing, LengthPrefixed, PacketCodec, RawCodec};
pub use server::{NetServer, ServerOptions};
pub use session::{NetSession, PlainSession, SessionCore, SessionFactory};
pub use stats::Statistics;
pub use udp::UdpServer;
pub use uri::{AddressFamily, NetType, NetUri, UriError};
