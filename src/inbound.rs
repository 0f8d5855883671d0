//! Tunnel front-end.
//!
//! Every connection or datagram arriving at a tunnel address is forwarded
//! to one fixed target, optionally through a named proxy.
use std::net::{SocketAddr, UdpSocket};
use std::sync::mpsc::{self, SyncSender, TrySendError};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use log::*;

use crate::acceptor::{bind_udp, check_message, Binder};
use crate::context::{ConnContext, PacketAdapter};
use crate::model::{Address, Error, InboundType, Metadata, Network};
use crate::pkt_stream::UdpReply;
use crate::pool::BufferPool;
use crate::tcp_listener_ext::UdpSocketExt;
use crate::thread::spawn_thread;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TunnelConfig {
    pub network: Vec<Network>,
    /// listen address
    pub address: SocketAddr,
    pub target: Address,
    /// adapter serving the tunnel regardless of rules
    pub proxy: Option<String>,
}

impl TunnelConfig {
    /// Metadata of a flow from `src` accepted on `local`
    pub fn metadata(&self, network: Network, src: SocketAddr, local: SocketAddr) -> Metadata {
        let mut md = Metadata::new(network, InboundType::Tunnel)
            .with_destination(&self.target)
            .with_source(src);
        md.origin_dst = Some(local);
        md.special_proxy = self.proxy.clone().unwrap_or_default();
        md
    }
}

/// Running listener thread
#[derive(Debug)]
pub struct ListenerHandle {
    network: Network,
    addr: SocketAddr,
    tx_done: SyncSender<()>,
    th: JoinHandle<()>,
}

impl ListenerHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    pub fn network(&self) -> Network {
        self.network
    }

    /// Ask the listener to stop; it notices within its poll timeout
    pub fn stop(&self) {
        self.tx_done.try_send(()).ok();
    }

    pub fn join(self) -> thread::Result<()> {
        self.th.join()
    }
}

/// Accept TCP connections for `tunnel` and push them into `tx`.
///
/// `send` blocks while the queue is full, which stalls accepting.
pub fn spawn_tcp_tunnel<B: Binder>(
    binder: &B,
    tunnel: &TunnelConfig,
    tx: SyncSender<ConnContext>,
) -> Result<ListenerHandle, Error> {
    let (tx_done, rx_done) = mpsc::sync_channel(1);
    let acceptor = binder.bind(tunnel.address, rx_done)?;
    let local = tunnel.address;
    let config = tunnel.clone();
    let th = spawn_thread(&format!("tunnel-tcp-{}", local), move || {
        for (strm, src) in acceptor {
            let metadata = config.metadata(Network::Tcp, src, local);
            debug!("[Inbound] tcp {} --> {}", src, config.target);
            if tx.send(ConnContext::new(metadata, Box::new(strm))).is_err() {
                info!("tcp queue disconnected, stop listening on {}", local);
                break;
            }
        }
    })?;
    info!("tunnel(tcp) {} --> {}", local, tunnel.target);
    Ok(ListenerHandle {
        network: Network::Tcp,
        addr: local,
        tx_done,
        th,
    })
}

/// Receive datagrams for `tunnel` and offer them to `tx`.
///
/// A datagram is dropped when the queue is full.
pub fn spawn_udp_tunnel(
    tunnel: &TunnelConfig,
    tx: SyncSender<PacketAdapter>,
    pool: BufferPool,
    poll_timeout: Option<Duration>,
) -> Result<ListenerHandle, Error> {
    let socket = Arc::new(bind_udp(tunnel.address)?);
    let local = socket.local_addr()?;
    let (tx_done, rx_done) = mpsc::sync_channel(1);
    let config = tunnel.clone();
    let th = spawn_thread(&format!("tunnel-udp-{}", local), move || loop {
        match check_message(&rx_done) {
            Ok(false) => {}
            _ => break,
        }
        match recv_packet(&socket, &pool, poll_timeout) {
            Ok(Some((buf, src))) => {
                let metadata = config.metadata(Network::Udp, src, local);
                let reply = Arc::new(UdpReply::new(socket.clone(), src));
                match tx.try_send(PacketAdapter::new(metadata, buf, reply)) {
                    Ok(()) => {}
                    Err(TrySendError::Full(mut pkt)) => {
                        debug!("[Inbound] udp queue full, drop packet from {}", src);
                        pkt.drop_payload();
                    }
                    Err(TrySendError::Disconnected(_)) => {
                        info!("udp queue disconnected, stop listening on {}", local);
                        break;
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                error!("[Inbound] udp {} recv: {}", local, err);
                break;
            }
        }
    })?;
    info!("tunnel(udp) {} --> {}", local, tunnel.target);
    Ok(ListenerHandle {
        network: Network::Udp,
        addr: local,
        tx_done,
        th,
    })
}

fn recv_packet(
    socket: &UdpSocket,
    pool: &BufferPool,
    timeout: Option<Duration>,
) -> Result<Option<(crate::pool::Buffer, SocketAddr)>, Error> {
    use std::io::ErrorKind as K;
    let mut buf = pool.get();
    match socket.recv_from_timeout(&mut buf, timeout) {
        Ok((size, src)) => {
            buf.truncate(size);
            Ok(Some((buf, src)))
        }
        Err(err) if matches!(err.kind(), K::TimedOut | K::Interrupted | K::WouldBlock) => Ok(None),
        // ICMP port unreachable from an earlier reply surfaces here
        Err(err) if err.kind() == K::ConnectionRefused => Ok(None),
        Err(err) => Err(err.into()),
    }
}
