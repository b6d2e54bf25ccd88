//! Network endpoint descriptors.
//!
//! A [`NetUri`] names one logical endpoint: protocol, address and port.
//! Connection strings look like `tcp://0.0.0.0:5500`, `ws://[::]:8080/ws`
//! or a bare `host:port` for the unknown protocol (TCP and UDP together).

use std::fmt;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, ToSocketAddrs};

use serde::{Deserialize, Serialize};
use url::{Host, Url};

/// Transport or wire protocol of an endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NetType {
    /// Unspecified; socket servers listen on both TCP and UDP.
    #[default]
    Unknown,
    Tcp,
    Udp,
    Http,
    #[serde(rename = "ws")]
    WebSocket,
}

impl NetType {
    /// Token used in connection strings.
    pub fn token(&self) -> &'static str {
        match self {
            NetType::Unknown => "",
            NetType::Tcp => "tcp",
            NetType::Udp => "udp",
            NetType::Http => "http",
            NetType::WebSocket => "ws",
        }
    }

    /// Parse a connection-string token, case-insensitively.
    pub fn from_token(token: &str) -> Option<Self> {
        match token.to_ascii_lowercase().as_str() {
            "" | "unknown" => Some(NetType::Unknown),
            "tcp" => Some(NetType::Tcp),
            "udp" => Some(NetType::Udp),
            "http" => Some(NetType::Http),
            "ws" => Some(NetType::WebSocket),
            _ => None,
        }
    }

    pub fn is_tcp(&self) -> bool {
        matches!(self, NetType::Tcp | NetType::Http | NetType::WebSocket)
    }

    pub fn is_udp(&self) -> bool {
        matches!(self, NetType::Udp)
    }
}

impl fmt::Display for NetType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetType::Unknown => f.write_str("unknown"),
            other => f.write_str(other.token()),
        }
    }
}

/// Address family selector.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AddressFamily {
    /// Both IPv4 and IPv6 (when the host supports it).
    #[default]
    Unspecified,
    #[serde(rename = "ipv4")]
    InterNetwork,
    #[serde(rename = "ipv6")]
    InterNetworkV6,
}

impl AddressFamily {
    pub fn of(address: &IpAddr) -> Self {
        match address {
            IpAddr::V4(_) => AddressFamily::InterNetwork,
            IpAddr::V6(_) => AddressFamily::InterNetworkV6,
        }
    }

    /// Resolve `address` for this family.
    ///
    /// An address already in the family is returned unchanged, an unspecified
    /// address becomes the family's any-address, anything else has no
    /// representation in the family.
    pub fn select(&self, address: IpAddr) -> Option<IpAddr> {
        match (self, address) {
            (AddressFamily::Unspecified, addr) => Some(addr),
            (AddressFamily::InterNetwork, addr @ IpAddr::V4(_)) => Some(addr),
            (AddressFamily::InterNetworkV6, addr @ IpAddr::V6(_)) => Some(addr),
            (AddressFamily::InterNetwork, addr) if addr.is_unspecified() => {
                Some(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
            }
            (AddressFamily::InterNetworkV6, addr) if addr.is_unspecified() => {
                Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
            }
            _ => None,
        }
    }
}

/// Error returned when a connection string cannot be parsed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum UriError {
    #[error("unknown protocol `{0}`")]
    UnknownProtocol(String),
    #[error("invalid endpoint `{0}`")]
    Invalid(String),
    #[error("cannot resolve host `{0}`")]
    Unresolved(String),
}

/// A logical network endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct NetUri {
    pub protocol: NetType,
    pub address: IpAddr,
    pub port: u16,
    /// Request path, only meaningful for HTTP and WebSocket endpoints.
    pub path: String,
}

impl NetUri {
    pub fn new(protocol: NetType, address: IpAddr, port: u16) -> Self {
        Self {
            protocol,
            address,
            port,
            path: String::new(),
        }
    }

    /// Parse a `protocol://host:port[/path]` string or a bare `host:port`.
    pub fn parse(input: &str) -> Result<Self, UriError> {
        let input = input.trim();
        let Some((scheme, rest)) = input.split_once("://") else {
            return Self::parse_bare(NetType::Unknown, input);
        };

        let protocol = NetType::from_token(scheme)
            .ok_or_else(|| UriError::UnknownProtocol(scheme.to_string()))?;
        if protocol == NetType::Unknown {
            return Self::parse_bare(protocol, rest);
        }

        let url = Url::parse(input).map_err(|_| UriError::Invalid(input.to_string()))?;
        let port = url.port_or_known_default().unwrap_or(0);
        let address = match url.host() {
            Some(Host::Ipv4(v4)) => IpAddr::V4(v4),
            Some(Host::Ipv6(v6)) => IpAddr::V6(v6),
            Some(Host::Domain(domain)) => resolve(domain, port)?,
            None => IpAddr::V4(Ipv4Addr::UNSPECIFIED),
        };
        let path = match url.path() {
            "" | "/" => String::new(),
            other => other.to_string(),
        };

        Ok(Self {
            protocol,
            address,
            port,
            path,
        })
    }

    fn parse_bare(protocol: NetType, input: &str) -> Result<Self, UriError> {
        let input = input.trim_end_matches('/');
        if let Ok(addr) = input.parse::<SocketAddr>() {
            return Ok(Self::new(protocol, addr.ip(), addr.port()));
        }
        if let Ok(port) = input.trim_start_matches(':').parse::<u16>() {
            return Ok(Self::new(protocol, IpAddr::V4(Ipv4Addr::UNSPECIFIED), port));
        }
        let (host, port) = input
            .rsplit_once(':')
            .ok_or_else(|| UriError::Invalid(input.to_string()))?;
        let port: u16 = port.parse().map_err(|_| UriError::Invalid(input.to_string()))?;
        let address = if host.is_empty() || host == "*" {
            IpAddr::V4(Ipv4Addr::UNSPECIFIED)
        } else {
            resolve(host, port)?
        };
        Ok(Self::new(protocol, address, port))
    }

    pub fn socket_addr(&self) -> SocketAddr {
        SocketAddr::new(self.address, self.port)
    }

    pub fn family(&self) -> AddressFamily {
        AddressFamily::of(&self.address)
    }

    pub fn with_protocol(mut self, protocol: NetType) -> Self {
        self.protocol = protocol;
        self
    }
}

impl Default for NetUri {
    fn default() -> Self {
        Self::new(NetType::Unknown, IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0)
    }
}

impl fmt::Display for NetUri {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.protocol {
            NetType::Unknown => write!(f, "{}", self.socket_addr()),
            other => write!(f, "{}://{}{}", other.token(), self.socket_addr(), self.path),
        }
    }
}

fn resolve(host: &str, port: u16) -> Result<IpAddr, UriError> {
    if let Ok(address) = host.parse::<IpAddr>() {
        return Ok(address);
    }
    if host.eq_ignore_ascii_case("localhost") {
        return Ok(IpAddr::V4(Ipv4Addr::LOCALHOST));
    }
    (host, port)
        .to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.next())
        .map(|addr| addr.ip())
        .ok_or_else(|| UriError::Unresolved(host.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_tcp_uri() {
        let uri = NetUri::parse("tcp://127.0.0.1:5500").unwrap();
        assert_eq!(uri.protocol, NetType::Tcp);
        assert_eq!(uri.address, IpAddr::V4(Ipv4Addr::LOCALHOST));
        assert_eq!(uri.port, 5500);
        assert_eq!(uri.to_string(), "tcp://127.0.0.1:5500");
    }

    #[test]
    fn parses_ipv6_and_path() {
        let uri = NetUri::parse("WS://[::]:8080/ws").unwrap();
        assert_eq!(uri.protocol, NetType::WebSocket);
        assert_eq!(uri.address, IpAddr::V6(Ipv6Addr::UNSPECIFIED));
        assert_eq!(uri.path, "/ws");
    }

    #[test]
    fn bare_endpoint_is_unknown_protocol() {
        let uri = NetUri::parse("0.0.0.0:5000").unwrap();
        assert_eq!(uri.protocol, NetType::Unknown);
        assert_eq!(uri.port, 5000);

        let uri = NetUri::parse(":7000").unwrap();
        assert!(uri.address.is_unspecified());
        assert_eq!(uri.port, 7000);
    }

    #[test]
    fn rejects_unknown_protocol() {
        assert_eq!(
            NetUri::parse("ftp://1.2.3.4:21"),
            Err(UriError::UnknownProtocol("ftp".to_string()))
        );
    }

    #[test]
    fn family_selection() {
        let any = IpAddr::V4(Ipv4Addr::UNSPECIFIED);
        assert_eq!(
            AddressFamily::InterNetworkV6.select(any),
            Some(IpAddr::V6(Ipv6Addr::UNSPECIFIED))
        );
        let local = IpAddr::V4(Ipv4Addr::LOCALHOST);
        assert_eq!(AddressFamily::InterNetwork.select(local), Some(local));
        assert_eq!(AddressFamily::InterNetworkV6.select(local), None);
    }
}
