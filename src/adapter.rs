//! Outbound adapters.
//!
//! A [`Proxy`] opens the outbound side of a flow: a byte stream for TCP or
//! a packet connection for UDP. Groups such as [`Selector`] forward to one
//! of their members and record themselves in the returned [`Chain`].
use std::fmt;
use std::io;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs, UdpSocket};
use std::sync::{Arc, RwLock};
use std::time::Duration;

use derive_more::Display;
use log::*;
use serde::*;

use crate::byte_stream::{BoxedStream, ByteStream, ReadHalf, WriteHalf};
use crate::model::{Error, Metadata};
use crate::pkt_stream::{PacketConn, UdpPacketConn};

pub const DIRECT: &str = "DIRECT";
pub const REJECT: &str = "REJECT";
pub const GLOBAL: &str = "GLOBAL";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, Serialize)]
pub enum AdapterType {
    Direct,
    Reject,
    Selector,
}

/// Names of the adapters a flow passed through, innermost first
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct Chain(Vec<String>);

impl Chain {
    pub fn new(name: &str) -> Self {
        Chain(vec![name.to_owned()])
    }

    pub fn push(&mut self, name: &str) {
        self.0.push(name.to_owned());
    }

    pub fn names(&self) -> &[String] {
        &self.0
    }
}

impl fmt::Display for Chain {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self.0.as_slice() {
            [] => Ok(()),
            [only] => write!(f, "{}", only),
            [first, .., last] => write!(f, "{}[{}]", last, first),
        }
    }
}

pub trait Proxy: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn adapter_type(&self) -> AdapterType;
    fn support_udp(&self) -> bool;
    /// Connect to the destination of `metadata` within `timeout`
    fn dial(&self, metadata: &Metadata, timeout: Duration) -> Result<(BoxedStream, Chain), Error>;
    fn listen_packet(
        &self,
        metadata: &Metadata,
        timeout: Duration,
    ) -> Result<(Box<dyn PacketConn>, Chain), Error>;
}

pub type ProxyRef = Arc<dyn Proxy>;

/// Source of proxies managed outside the static configuration
pub trait ProxyProvider: fmt::Debug + Send + Sync {
    fn name(&self) -> &str;
    fn proxies(&self) -> Vec<ProxyRef>;
}

#[derive(Debug, Clone)]
pub struct StaticProvider {
    name: String,
    proxies: Vec<ProxyRef>,
}

impl StaticProvider {
    pub fn new(name: &str, proxies: Vec<ProxyRef>) -> Self {
        Self {
            name: name.to_owned(),
            proxies,
        }
    }
}

impl ProxyProvider for StaticProvider {
    fn name(&self) -> &str {
        &self.name
    }

    fn proxies(&self) -> Vec<ProxyRef> {
        self.proxies.clone()
    }
}

/// Connects to the destination itself
#[derive(Debug, Clone, Copy, Default)]
pub struct Direct;

impl Proxy for Direct {
    fn name(&self) -> &str {
        DIRECT
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Direct
    }

    fn support_udp(&self) -> bool {
        true
    }

    fn dial(&self, metadata: &Metadata, timeout: Duration) -> Result<(BoxedStream, Chain), Error> {
        let addr = metadata.destination().ok_or_else(|| Error::InvalidMetadata {
            metadata: format!("{:?}", metadata),
        })?;
        let addrs = addr
            .to_socket_addrs()
            .map_err(|err| Error::dial(DIRECT, &addr, err))?;
        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "no address resolved");
        for sock_addr in addrs {
            match TcpStream::connect_timeout(&sock_addr, timeout) {
                Ok(strm) => {
                    strm.set_nodelay(true)?;
                    debug!("[{}] connected {} ({})", DIRECT, addr, sock_addr);
                    return Ok((Box::new(strm), Chain::new(DIRECT)));
                }
                Err(err) => {
                    trace!("[{}] connect {}: {}", DIRECT, sock_addr, err);
                    last_err = err;
                }
            }
        }
        Err(Error::dial(DIRECT, addr, last_err))
    }

    fn listen_packet(
        &self,
        metadata: &Metadata,
        _timeout: Duration,
    ) -> Result<(Box<dyn PacketConn>, Chain), Error> {
        let bind: SocketAddr = match metadata.dst_ip {
            Some(ip) if ip.is_ipv6() => "[::]:0".parse().map_err(|_| Error::payload("[::]:0"))?,
            _ => "0.0.0.0:0".parse().map_err(|_| Error::payload("0.0.0.0:0"))?,
        };
        let socket = UdpSocket::bind(bind).map_err(|err| Error::dial(DIRECT, bind, err))?;
        Ok((Box::new(UdpPacketConn::new(socket)), Chain::new(DIRECT)))
    }
}

/// Closes every flow at once
#[derive(Debug, Clone, Copy, Default)]
pub struct Reject;

impl Proxy for Reject {
    fn name(&self) -> &str {
        REJECT
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Reject
    }

    fn support_udp(&self) -> bool {
        false
    }

    fn dial(&self, _metadata: &Metadata, _timeout: Duration) -> Result<(BoxedStream, Chain), Error> {
        Ok((Box::new(NopStream), Chain::new(REJECT)))
    }

    fn listen_packet(
        &self,
        _metadata: &Metadata,
        _timeout: Duration,
    ) -> Result<(Box<dyn PacketConn>, Chain), Error> {
        Ok((Box::new(NopPacketConn), Chain::new(REJECT)))
    }
}

/// Stream at EOF that discards writes
#[derive(Debug, Clone, Copy)]
pub struct NopStream;

impl io::Read for NopStream {
    fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
        Ok(0)
    }
}

impl io::Write for NopStream {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl WriteHalf for NopStream {}

impl ByteStream for NopStream {
    fn split(&self) -> Result<(ReadHalf, Box<dyn WriteHalf>), Error> {
        Ok((Box::new(NopStream), Box::new(NopStream)))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct NopPacketConn;

impl PacketConn for NopPacketConn {
    fn read_from(&self, _buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        Err(io::Error::from(io::ErrorKind::UnexpectedEof).into())
    }

    fn write_to(&self, pkt: &[u8], _addr: SocketAddr) -> Result<usize, Error> {
        Ok(pkt.len())
    }

    fn set_read_timeout(&self, _dur: Option<Duration>) -> Result<(), Error> {
        Ok(())
    }

    fn close(&self) -> Result<(), Error> {
        Ok(())
    }
}

/// Group forwarding to the member picked by [`Selector::select`]
#[derive(Debug)]
pub struct Selector {
    name: String,
    members: Vec<ProxyRef>,
    selected: RwLock<usize>,
}

impl Selector {
    pub fn new(name: &str, members: Vec<ProxyRef>) -> Result<Self, Error> {
        if members.is_empty() {
            return Err(Error::proxy_not_found(format!("{}: empty group", name)));
        }
        Ok(Self {
            name: name.to_owned(),
            members,
            selected: RwLock::new(0),
        })
    }

    pub fn from_providers(name: &str, providers: &[Arc<dyn ProxyProvider>]) -> Result<Self, Error> {
        let members = providers.iter().flat_map(|p| p.proxies()).collect();
        Self::new(name, members)
    }

    pub fn select(&self, name: &str) -> Result<(), Error> {
        let idx = self
            .members
            .iter()
            .position(|p| p.name() == name)
            .ok_or_else(|| Error::proxy_not_found(name))?;
        *self.selected.write()? = idx;
        info!("[{}] selected {}", self.name, name);
        Ok(())
    }

    pub fn now(&self) -> Result<ProxyRef, Error> {
        let idx = *self.selected.read()?;
        Ok(self.members[idx].clone())
    }

    pub fn members(&self) -> &[ProxyRef] {
        &self.members
    }
}

impl Proxy for Selector {
    fn name(&self) -> &str {
        &self.name
    }

    fn adapter_type(&self) -> AdapterType {
        AdapterType::Selector
    }

    fn support_udp(&self) -> bool {
        self.now().map(|p| p.support_udp()).unwrap_or(false)
    }

    fn dial(&self, metadata: &Metadata, timeout: Duration) -> Result<(BoxedStream, Chain), Error> {
        let (strm, mut chain) = self.now()?.dial(metadata, timeout)?;
        chain.push(&self.name);
        Ok((strm, chain))
    }

    fn listen_packet(
        &self,
        metadata: &Metadata,
        timeout: Duration,
    ) -> Result<(Box<dyn PacketConn>, Chain), Error> {
        let (pc, mut chain) = self.now()?.listen_packet(metadata, timeout)?;
        chain.push(&self.name);
        Ok((pc, chain))
    }
}
