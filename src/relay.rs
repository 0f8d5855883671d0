use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use log::*;

use crate::byte_stream::{BoxedStream, ByteStream, WriteHalf};
use crate::model::Error;
use crate::thread::spawn_thread;

#[derive(Debug)]
pub struct RelayHandle {
    /// handle to relay: client -> remote
    outbound_th: JoinHandle<Result<(), Error>>,
    /// handle to relay: client <- remote
    incoming_th: JoinHandle<Result<(), Error>>,
    /// kept open until both directions are done
    streams: (BoxedStream, BoxedStream),
}

impl RelayHandle {
    pub fn join(self) -> thread::Result<Result<(), Error>> {
        let outbound = self.outbound_th.join();
        let incoming = self.incoming_th.join();
        drop(self.streams);
        match (outbound, incoming) {
            (Ok(Err(err)), _) | (_, Ok(Err(err))) => Ok(Err(err)),
            (outbound, incoming) => outbound.and(incoming),
        }
    }
}

/// Spawn relay threads copying bytes between `client` and `remote`
///
/// When one direction reaches EOF or fails, the write half of the other
/// stream is closed so that the opposite direction finishes as well.
pub fn spawn_relay(
    client_addr: String,
    remote_addr: String,
    client: BoxedStream,
    remote: BoxedStream,
) -> Result<RelayHandle, Error> {
    let (read_client, write_client) = client.split()?;
    let (read_remote, write_remote) = remote.split()?;
    let thread_shutdown = Arc::new(AtomicBool::new(false));

    let outbound_th = {
        let thread_shutdown = thread_shutdown.clone();
        let client_addr = client_addr.clone();
        let remote_addr = remote_addr.clone();
        spawn_thread("outbound", move || {
            relay_half(
                thread_shutdown,
                &client_addr,
                &remote_addr,
                read_client,
                write_remote,
            )
        })?
    };
    let incoming_th = spawn_thread("incoming", move || {
        relay_half(
            thread_shutdown,
            &remote_addr,
            &client_addr,
            read_remote,
            write_client,
        )
    })?;
    Ok(RelayHandle {
        outbound_th,
        incoming_th,
        streams: (client, remote),
    })
}

/// Relay until both directions finish
pub fn relay(
    client_addr: String,
    remote_addr: String,
    client: BoxedStream,
    remote: BoxedStream,
) -> Result<(), Error> {
    spawn_relay(client_addr, remote_addr, client, remote)?
        .join()
        .map_err(|_| Error::disconnected("relay"))?
}

fn relay_half(
    thread_shutdown: Arc<AtomicBool>,
    src_addr: &str,
    dst_addr: &str,
    mut src: impl io::Read,
    mut dst: Box<dyn WriteHalf>,
) -> Result<(), Error> {
    let result = copy_until_eof(&thread_shutdown, src_addr, dst_addr, &mut src, &mut dst);
    thread_shutdown.store(true, Ordering::Relaxed);
    if let Err(err) = dst.close() {
        debug!("relay close {}: {}", dst_addr, err);
    }
    result
}

fn copy_until_eof(
    thread_shutdown: &AtomicBool,
    src_addr: &str,
    dst_addr: &str,
    src: &mut impl io::Read,
    dst: &mut Box<dyn WriteHalf>,
) -> Result<(), Error> {
    let name = thread::current().name().unwrap_or("<anonymous>").to_owned();
    trace!("spawned relay: {}: {} ==> {}", name, src_addr, dst_addr);
    loop {
        use io::ErrorKind as K;
        match io::copy(src, dst) {
            Ok(0) => {
                trace!("relay finished: {}: {} ==> {}", name, src_addr, dst_addr);
                return Ok(());
            }
            Ok(size) => trace!("{}: {} ==> {}: {} bytes", name, src_addr, dst_addr, size),
            Err(err) if err.kind() == K::WouldBlock || err.kind() == K::TimedOut => {
                if thread_shutdown.load(Ordering::Relaxed) {
                    // the other direction is already done
                    return Ok(());
                }
            }
            Err(err) => {
                return Err(err.into());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::byte_stream::test::{BufferStream, IterBuffer};
    use crate::byte_stream::ReadHalf;
    use std::io::{Read, Write};
    use std::net::{TcpListener, TcpStream};
    use std::sync::Mutex;

    #[derive(Debug, Clone)]
    struct ErrorStream;

    impl Read for ErrorStream {
        fn read(&mut self, _buf: &mut [u8]) -> io::Result<usize> {
            Err(io::ErrorKind::ConnectionReset.into())
        }
    }

    impl Write for ErrorStream {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl WriteHalf for ErrorStream {}

    impl ByteStream for ErrorStream {
        fn split(&self) -> Result<(ReadHalf, Box<dyn WriteHalf>), Error> {
            Ok((Box::new(self.clone()), Box::new(self.clone())))
        }
    }

    #[test]
    fn relay_ends_on_connection_reset() {
        let client = Box::new(IterBuffer {
            iter: vec![b"hello".to_vec(), b" ".to_vec(), b"client".to_vec()].into_iter(),
            wr_buff: Arc::new(Mutex::new(io::Cursor::new(vec![]))),
        });
        let result = relay(
            "192.168.1.1:45678".to_owned(),
            "192.168.1.2:80".to_owned(),
            client,
            Box::new(ErrorStream),
        );
        assert!(matches!(result, Err(Error::Io(_))));
    }

    #[test]
    fn relay_both_directions() {
        let client_writer = Arc::new(Mutex::new(io::Cursor::new(vec![])));
        let client = Box::new(IterBuffer {
            iter: vec![b"hello".to_vec(), b" ".to_vec(), b"client".to_vec()].into_iter(),
            wr_buff: client_writer.clone(),
        });
        let remote = BufferStream::with_buffer(b"hello server".to_vec().into(), vec![].into());

        relay(
            "192.168.1.1:45678".to_owned(),
            "192.168.1.2:80".to_owned(),
            client,
            Box::new(remote.clone()),
        )
        .unwrap();

        assert_eq!(
            client_writer.lock().unwrap().get_ref().as_slice(),
            &b"hello server"[..]
        );
        assert_eq!(remote.written(), b"hello client");
    }

    #[test]
    fn relay_over_tcp_closes_peer() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let echo_addr = listener.local_addr().unwrap();
        let echo = std::thread::spawn(move || {
            let (mut strm, _) = listener.accept().unwrap();
            let mut buf = vec![];
            strm.read_to_end(&mut buf).unwrap();
            buf
        });

        let remote = TcpStream::connect(echo_addr).unwrap();
        let client = BufferStream::with_buffer(b"payload".to_vec().into(), vec![].into());
        relay(
            "127.0.0.1:1".to_owned(),
            echo_addr.to_string(),
            Box::new(client),
            Box::new(remote),
        )
        .unwrap();
        assert_eq!(echo.join().unwrap(), b"payload");
    }
}
