//! Per-connection descriptor passed from inbound listeners through rule
//! evaluation to the outbound adapters.
//!
//! ```text
//!  inbound           dispatcher                      outbound
//!    |                   |                               |
//!    |---- Metadata ---->|                               |
//!    |                   | pre_handle (host <-> ip)      |
//!    |                   | match rules (resolve, proc)   |
//!    |                   |------ Metadata::pure() ------>|
//!    |                   |                               |
//! ```
//!
use std::fmt;
use std::net::ToSocketAddrs;
pub use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::str::FromStr;

use derive_more::Display;
use serde::*;

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Network {
    #[display(fmt = "tcp")]
    Tcp,
    #[display(fmt = "udp")]
    Udp,
}

/// The front-end a connection was accepted by
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Display, Serialize)]
pub enum InboundType {
    #[display(fmt = "HTTP")]
    Http,
    #[display(fmt = "HTTP Connect")]
    HttpConnect,
    #[display(fmt = "Socks4")]
    Socks4,
    #[display(fmt = "Socks5")]
    Socks5,
    #[display(fmt = "Redir")]
    Redir,
    #[display(fmt = "TProxy")]
    TProxy,
    #[display(fmt = "Tunnel")]
    Tunnel,
}

/// How the destination host/ip pair of a flow was derived
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Display, Serialize)]
pub enum DnsMode {
    #[default]
    #[display(fmt = "normal")]
    Normal,
    #[display(fmt = "mapping")]
    Mapping,
    #[display(fmt = "fake-ip")]
    FakeIp,
}

/// ip address and port
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Address {
    IpAddr(IpAddr, u16),
    Domain(String, u16),
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use Address::*;
        match self {
            IpAddr(addr, port) => write!(f, "{}", SocketAddr::new(*addr, *port)),
            Domain(host, port) => write!(f, "{}:{}", host, port),
        }
    }
}

impl Address {
    pub fn port(&self) -> u16 {
        match self {
            Address::IpAddr(_, port) => *port,
            Address::Domain(_, port) => *port,
        }
    }
}

impl From<SocketAddr> for Address {
    fn from(addr: SocketAddr) -> Self {
        Address::IpAddr(addr.ip(), addr.port())
    }
}

impl FromStr for Address {
    type Err = std::net::AddrParseError;
    /// Accepts `ip:port`, `[v6]:port` and `host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.parse::<SocketAddr>() {
            Ok(addr) => Ok(addr.into()),
            Err(err) => {
                let (host, port) = s.rsplit_once(':').ok_or(err.clone())?;
                let port = port.parse().map_err(|_| err.clone())?;
                if host.is_empty() {
                    return Err(err);
                }
                Ok(Address::Domain(host.to_owned(), port))
            }
        }
    }
}

impl ToSocketAddrs for Address {
    type Iter = std::vec::IntoIter<SocketAddr>;

    fn to_socket_addrs(&self) -> std::io::Result<Self::Iter> {
        use Address::*;
        match self {
            IpAddr(ipaddr, port) => Ok(vec![SocketAddr::new(*ipaddr, *port)].into_iter()),
            Domain(domain, port) => Ok((domain.as_str(), *port).to_socket_addrs()?),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Metadata {
    pub network: Network,
    #[serde(rename = "type")]
    pub inbound: InboundType,
    #[serde(rename = "sourceIP")]
    pub src_ip: Option<IpAddr>,
    pub src_port: u16,
    #[serde(rename = "destinationIP")]
    pub dst_ip: Option<IpAddr>,
    #[serde(rename = "destinationPort")]
    pub dst_port: u16,
    pub host: String,
    pub dns_mode: DnsMode,
    pub process_path: String,
    pub special_proxy: String,
    /// the address the client originally connected to (before any redirect)
    #[serde(skip)]
    pub origin_dst: Option<SocketAddr>,
}

impl Metadata {
    pub fn new(network: Network, inbound: InboundType) -> Self {
        Self {
            network,
            inbound,
            src_ip: None,
            src_port: 0,
            dst_ip: None,
            dst_port: 0,
            host: String::new(),
            dns_mode: DnsMode::Normal,
            process_path: String::new(),
            special_proxy: String::new(),
            origin_dst: None,
        }
    }

    /// Fill the destination from `addr`
    pub fn with_destination(mut self, addr: &Address) -> Self {
        match addr {
            Address::IpAddr(ip, port) => {
                self.dst_ip = Some(*ip);
                self.dst_port = *port;
            }
            Address::Domain(host, port) => {
                self.host = host.clone();
                self.dst_port = *port;
            }
        }
        self
    }

    pub fn with_source(mut self, addr: SocketAddr) -> Self {
        self.src_ip = Some(addr.ip());
        self.src_port = addr.port();
        self
    }

    pub fn valid(&self) -> bool {
        !self.host.is_empty() || self.dst_ip.is_some()
    }

    pub fn resolved(&self) -> bool {
        self.dst_ip.is_some()
    }

    /// Copy used for dialing.
    ///
    /// In DNS mapping mode the host is dropped so that adapters connect to
    /// the mapped address instead of resolving the name again.
    pub fn pure(&self) -> Metadata {
        let mut copy = self.clone();
        if self.dns_mode == DnsMode::Mapping && self.dst_ip.is_some() {
            copy.host.clear();
        }
        copy
    }

    /// Destination to dial, preferring the host name
    pub fn destination(&self) -> Option<Address> {
        if !self.host.is_empty() {
            Some(Address::Domain(self.host.clone(), self.dst_port))
        } else {
            self.dst_ip.map(|ip| Address::IpAddr(ip, self.dst_port))
        }
    }

    pub fn udp_addr(&self) -> Option<SocketAddr> {
        match (self.network, self.dst_ip) {
            (Network::Udp, Some(ip)) => Some(SocketAddr::new(ip, self.dst_port)),
            _ => None,
        }
    }

    /// host name normalized for domain rules
    pub fn rule_host(&self) -> String {
        self.host.trim_end_matches('.').to_ascii_lowercase()
    }

    pub fn source_address(&self) -> String {
        join_host_port(
            &self
                .src_ip
                .map(|ip| ip.to_string())
                .unwrap_or_else(|| "<nil>".to_owned()),
            self.src_port,
        )
    }

    pub fn remote_address(&self) -> String {
        join_host_port(&self.to_string(), self.dst_port)
    }
}

impl fmt::Display for Metadata {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        if !self.host.is_empty() {
            write!(f, "{}", self.host)
        } else if let Some(ip) = self.dst_ip {
            write!(f, "{}", ip)
        } else {
            write!(f, "<nil>")
        }
    }
}

fn join_host_port(host: &str, port: u16) -> String {
    if host.contains(':') {
        format!("[{}]:{}", host, port)
    } else {
        format!("{}:{}", host, port)
    }
}
