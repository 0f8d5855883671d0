use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::sync::mpsc::{self, Receiver};
use std::time::Duration;

use log::*;

use crate::byte_stream::ByteStream;
use crate::model::Error;
use crate::tcp_listener_ext::*;

pub struct TcpAcceptor {
    listener: TcpListener,
    rw_timeout: Option<Duration>,
    /// receive termination message
    rx: Receiver<()>,
    /// timeout for accept
    accept_timeout: Option<Duration>,
}

impl TcpAcceptor {
    fn new(
        listener: TcpListener,
        rw_timeout: Option<Duration>,
        rx: Receiver<()>,
        accept_timeout: Option<Duration>,
    ) -> Self {
        Self {
            listener,
            rw_timeout,
            rx,
            accept_timeout,
        }
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    fn accept_timeout(&self) -> io::Result<(TcpStream, SocketAddr)> {
        self.listener
            .accept_timeout(self.accept_timeout)
            .and_then(|(tcp, addr)| {
                tcp.set_read_timeout(self.rw_timeout)?;
                tcp.set_write_timeout(self.rw_timeout)?;
                Ok((tcp, addr))
            })
    }
}

pub(crate) fn check_message(rx: &Receiver<()>) -> Result<bool, Error> {
    use mpsc::TryRecvError;
    match rx.try_recv() {
        Ok(()) => Ok(true),
        Err(TryRecvError::Empty) => Ok(false),
        Err(TryRecvError::Disconnected) => Err(Error::disconnected("acceptor")),
    }
}

macro_rules! check_done {
    ($rx:expr) => {
        match check_message($rx) {
            Ok(true) => return None,
            Ok(false) => {}
            Err(_) => return None,
        }
    };
}

impl Iterator for TcpAcceptor {
    type Item = (TcpStream, SocketAddr);
    fn next(&mut self) -> Option<Self::Item> {
        loop {
            check_done!(&self.rx);
            match self.accept_timeout() {
                Ok(x) => return Some(x),
                Err(err) if err.kind() == io::ErrorKind::TimedOut => {}
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => {
                    error!("accept error: {}", err);
                    trace!("accept error: {:?}", err);
                    return None;
                }
            }
        }
    }
}

pub trait Binder {
    type Stream: ByteStream + 'static;
    type Iter: Iterator<Item = (Self::Stream, SocketAddr)> + Send + 'static;
    /// Listen on `addr`; the iterator ends once `rx_done` receives a message
    fn bind(&self, addr: SocketAddr, rx_done: Receiver<()>) -> Result<Self::Iter, Error>;
}

#[derive(Debug, Clone)]
pub struct TcpBinder {
    rw_timeout: Option<Duration>,
    accept_timeout: Option<Duration>,
}

impl TcpBinder {
    pub fn new(rw_timeout: Option<Duration>, accept_timeout: Option<Duration>) -> Self {
        Self {
            rw_timeout,
            accept_timeout,
        }
    }
}

impl Binder for TcpBinder {
    type Stream = TcpStream;
    type Iter = TcpAcceptor;
    fn bind(&self, addr: SocketAddr, rx_done: Receiver<()>) -> Result<Self::Iter, Error> {
        let tcp = socket2::Socket::new(
            socket2::Domain::for_address(addr),
            socket2::Type::STREAM,
            Some(socket2::Protocol::TCP),
        )?;
        tcp.set_reuse_address(true)
            .map_err(|err| addr_error(err, addr))?;
        tcp.bind(&addr.into())
            .map_err(|err| addr_error(err, addr))?;

        // `backlog` is passed to listen(2) as is; keep it close to `net.core.somaxconn`
        // or clients may fail to connect(2) under load.
        tcp.listen(256)?;

        Ok(TcpAcceptor::new(
            tcp.into(),
            self.rw_timeout,
            rx_done,
            self.accept_timeout,
        ))
    }
}

/// Bind a UDP socket with address reuse
pub fn bind_udp(addr: SocketAddr) -> Result<UdpSocket, Error> {
    let udp = socket2::Socket::new(
        socket2::Domain::for_address(addr),
        socket2::Type::DGRAM,
        Some(socket2::Protocol::UDP),
    )?;
    udp.set_reuse_address(true)
        .map_err(|err| addr_error(err, addr))?;
    udp.bind(&addr.into())
        .map_err(|err| addr_error(err, addr))?;
    Ok(udp.into())
}

fn addr_error(io_err: io::Error, addr: SocketAddr) -> Error {
    match io_err.kind() {
        io::ErrorKind::AddrInUse => Error::AddressAlreadyInUse { addr },
        io::ErrorKind::AddrNotAvailable => Error::AddressNotAvailable { addr },
        _ => Error::Io(io_err),
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::thread;

    #[test]
    fn acceptor_stops_on_done() {
        let (tx, rx) = mpsc::sync_channel(1);
        let binder = TcpBinder::new(None, Some(Duration::from_millis(50)));
        let mut acceptor = binder.bind("127.0.0.1:0".parse().unwrap(), rx).unwrap();
        let addr = acceptor.local_addr().unwrap();

        let client = TcpStream::connect(addr).unwrap();
        let (_strm, from) = acceptor.next().unwrap();
        assert_eq!(from, client.local_addr().unwrap());

        let th = thread::spawn(move || acceptor.count());
        tx.send(()).unwrap();
        assert_eq!(th.join().unwrap(), 0);
    }

    #[test]
    fn acceptor_stops_when_sender_dropped() {
        let (tx, rx) = mpsc::sync_channel::<()>(1);
        let binder = TcpBinder::new(None, Some(Duration::from_millis(50)));
        let mut acceptor = binder.bind("127.0.0.1:0".parse().unwrap(), rx).unwrap();
        drop(tx);
        assert!(acceptor.next().is_none());
    }

    #[test]
    fn address_in_use() {
        let (_tx, rx) = mpsc::sync_channel(1);
        let taken = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = taken.local_addr().unwrap();
        let binder = TcpBinder::new(None, None);
        match binder.bind(addr, rx) {
            Err(Error::AddressAlreadyInUse { addr: a }) => assert_eq!(a, addr),
            other => panic!("unexpected: {:?}", other.map(|_| ())),
        }
    }

    #[test]
    fn address_not_available() {
        // TEST-NET-3 is never assigned to a local interface
        let addr = "203.0.113.1:0".parse().unwrap();
        assert!(matches!(
            bind_udp(addr),
            Err(Error::AddressNotAvailable { .. })
        ));
    }
}
