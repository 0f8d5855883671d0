use std::convert::TryInto;
use std::io;
use std::net::{SocketAddr, TcpListener, TcpStream, UdpSocket};
use std::os::unix::io::{AsRawFd, RawFd};
use std::time::Duration;

use nix::poll::{poll, PollFd, PollFlags};

pub trait TcpListenerExt {
    fn accept_timeout(&self, timeout: Option<Duration>) -> io::Result<(TcpStream, SocketAddr)>;
}

impl TcpListenerExt for TcpListener {
    /// accept(2) with timeout
    ///
    /// * `timeout`
    ///   Timeout for _accept_. If the value is `None`, wait connection indefinitely.
    fn accept_timeout(&self, timeout: Option<Duration>) -> io::Result<(TcpStream, SocketAddr)> {
        wait_readable(self.as_raw_fd(), timeout, "poll accept")?;
        self.accept()
    }
}

pub trait UdpSocketExt {
    fn recv_from_timeout(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<(usize, SocketAddr)>;
}

impl UdpSocketExt for UdpSocket {
    /// recvfrom(2) giving up with `TimedOut` after `timeout`
    fn recv_from_timeout(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> io::Result<(usize, SocketAddr)> {
        wait_readable(self.as_raw_fd(), timeout, "poll recv")?;
        self.recv_from(buf)
    }
}

fn wait_readable(fd: RawFd, timeout: Option<Duration>, what: &str) -> io::Result<()> {
    let timeout = timeout.map(dur_to_millis).transpose()?.unwrap_or(-1);
    let mut fds = [PollFd::new(fd, PollFlags::POLLIN)];
    let r = poll(&mut fds, timeout).map_err(io::Error::from)?;
    if r == 0 {
        return Err(io::Error::new(io::ErrorKind::TimedOut, what.to_owned()));
    }
    Ok(())
}

/// Convert Duration to poll(2) timeout in milliseconds
fn dur_to_millis(dur: Duration) -> io::Result<i32> {
    dur.as_millis().try_into().map_err(|_| {
        io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("timeout convert error: {:?}", dur),
        )
    })
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn accept_times_out() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let err = listener
            .accept_timeout(Some(Duration::from_millis(50)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
    }

    #[test]
    fn accept_pending_connection() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (_strm, addr) = listener
            .accept_timeout(Some(Duration::from_secs(3)))
            .unwrap();
        assert_eq!(addr, client.local_addr().unwrap());
    }

    #[test]
    fn recv_times_out() {
        let sock = UdpSocket::bind("127.0.0.1:0").unwrap();
        let mut buf = [0u8; 16];
        let err = sock
            .recv_from_timeout(&mut buf, Some(Duration::from_millis(50)))
            .unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);

        let peer = UdpSocket::bind("127.0.0.1:0").unwrap();
        peer.send_to(b"ping", sock.local_addr().unwrap()).unwrap();
        let (size, from) = sock
            .recv_from_timeout(&mut buf, Some(Duration::from_secs(3)))
            .unwrap();
        assert_eq!(&buf[..size], b"ping");
        assert_eq!(from, peer.local_addr().unwrap());
    }

    #[test]
    fn huge_timeout_rejected() {
        let err = dur_to_millis(Duration::from_secs(u64::MAX)).unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidInput);
    }
}
