use std::fmt;
use std::io;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::model::Error;

/// Outbound packet connection shared by all packets of one UDP flow
pub trait PacketConn: fmt::Debug + Send + Sync {
    fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error>;
    fn write_to(&self, pkt: &[u8], addr: SocketAddr) -> Result<usize, Error>;
    fn set_read_timeout(&self, dur: Option<Duration>) -> Result<(), Error>;
    fn close(&self) -> Result<(), Error>;
}

impl<P: PacketConn + ?Sized> PacketConn for Arc<P> {
    fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        (**self).read_from(buf)
    }
    fn write_to(&self, pkt: &[u8], addr: SocketAddr) -> Result<usize, Error> {
        (**self).write_to(pkt, addr)
    }
    fn set_read_timeout(&self, dur: Option<Duration>) -> Result<(), Error> {
        (**self).set_read_timeout(dur)
    }
    fn close(&self) -> Result<(), Error> {
        (**self).close()
    }
}

impl<P: PacketConn + ?Sized> PacketConn for Box<P> {
    fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        (**self).read_from(buf)
    }
    fn write_to(&self, pkt: &[u8], addr: SocketAddr) -> Result<usize, Error> {
        (**self).write_to(pkt, addr)
    }
    fn set_read_timeout(&self, dur: Option<Duration>) -> Result<(), Error> {
        (**self).set_read_timeout(dur)
    }
    fn close(&self) -> Result<(), Error> {
        (**self).close()
    }
}

/// Handle back to the client socket a packet came from
pub trait PacketReply: fmt::Debug + Send + Sync {
    /// Send `data` to the client as if it came from `from`.
    ///
    /// Front-ends whose wire format carries no source address (a plain
    /// UDP tunnel) may ignore `from`; the client then sees the listener
    /// address and the fake-IP source rewrite has no visible effect.
    fn write_back(&self, data: &[u8], from: SocketAddr) -> Result<usize, Error>;
    /// Address of the client; identifies the flow
    fn local_addr(&self) -> SocketAddr;
}

#[derive(Debug)]
pub struct UdpPacketConn {
    socket: UdpSocket,
    closed: AtomicBool,
}

impl UdpPacketConn {
    pub fn new(socket: UdpSocket) -> Self {
        Self {
            socket,
            closed: AtomicBool::new(false),
        }
    }
}

impl PacketConn for UdpPacketConn {
    fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        }
        Ok(self.socket.recv_from(buf)?)
    }

    fn write_to(&self, pkt: &[u8], addr: SocketAddr) -> Result<usize, Error> {
        if self.closed.load(Ordering::Acquire) {
            return Err(io::Error::from(io::ErrorKind::NotConnected).into());
        }
        let size = self.socket.send_to(pkt, addr)?;
        if size != pkt.len() {
            return Err(io::Error::new(
                io::ErrorKind::Other,
                format!("UdpPacketConn::write_to: {} != {}", size, pkt.len()),
            )
            .into());
        }
        Ok(size)
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> Result<(), Error> {
        self.socket.set_read_timeout(dur).map_err(Into::into)
    }

    fn close(&self) -> Result<(), Error> {
        self.closed.store(true, Ordering::Release);
        Ok(())
    }
}

/// Replies to a client through the listener socket it sent to.
///
/// Replies always carry the listener address as their source.
#[derive(Debug)]
pub struct UdpReply {
    socket: Arc<UdpSocket>,
    client: SocketAddr,
}

impl UdpReply {
    pub fn new(socket: Arc<UdpSocket>, client: SocketAddr) -> Self {
        Self { socket, client }
    }
}

impl PacketReply for UdpReply {
    fn write_back(&self, data: &[u8], _from: SocketAddr) -> Result<usize, Error> {
        // a plain udp tunnel cannot carry the source address back
        Ok(self.socket.send_to(data, self.client)?)
    }

    fn local_addr(&self) -> SocketAddr {
        self.client
    }
}
