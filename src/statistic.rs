//! Traffic accounting for live flows.
use std::collections::HashMap;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use derive_more::Display;
use log::*;
use serde::*;

use crate::adapter::Chain;
use crate::byte_stream::{BoxedStream, ByteStream, ReadHalf, WriteHalf};
use crate::model::{Error, Metadata, Rule};
use crate::pkt_stream::PacketConn;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, Serialize)]
#[display(fmt = "{:016x}", _0)]
pub struct TrackerId(u64);

impl TrackerId {
    fn random() -> Self {
        TrackerId(rand::random())
    }
}

#[derive(Debug)]
pub struct TrackerInfo {
    pub id: TrackerId,
    pub metadata: Metadata,
    pub chain: Chain,
    pub rule: String,
    pub rule_payload: String,
    pub start: SystemTime,
    upload: AtomicU64,
    download: AtomicU64,
}

impl TrackerInfo {
    fn new(metadata: &Metadata, chain: Chain, rule: Option<&Rule>) -> Self {
        Self {
            id: TrackerId::random(),
            metadata: metadata.clone(),
            chain,
            rule: rule.map(|r| r.rule_type().to_string()).unwrap_or_default(),
            rule_payload: rule.map(|r| r.payload()).unwrap_or_default(),
            start: SystemTime::now(),
            upload: AtomicU64::new(0),
            download: AtomicU64::new(0),
        }
    }

    pub fn upload(&self) -> u64 {
        self.upload.load(Ordering::Relaxed)
    }

    pub fn download(&self) -> u64 {
        self.download.load(Ordering::Relaxed)
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionSnapshot {
    pub id: TrackerId,
    pub metadata: Metadata,
    pub upload: u64,
    pub download: u64,
    pub start: SystemTime,
    pub chains: Vec<String>,
    pub rule: String,
    pub rule_payload: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Snapshot {
    pub download_total: u64,
    pub upload_total: u64,
    pub connections: Vec<ConnectionSnapshot>,
}

/// Registry of live trackers and running totals
#[derive(Debug, Default)]
pub struct Manager {
    connections: Mutex<HashMap<TrackerId, Arc<TrackerInfo>>>,
    upload_total: AtomicU64,
    download_total: AtomicU64,
}

impl Manager {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn join(&self, info: Arc<TrackerInfo>) {
        match self.connections.lock() {
            Ok(mut conns) => {
                conns.insert(info.id, info);
            }
            Err(err) => error!("statistic manager poisoned: {}", err),
        }
    }

    fn leave(&self, id: TrackerId) {
        match self.connections.lock() {
            Ok(mut conns) => {
                conns.remove(&id);
            }
            Err(err) => error!("statistic manager poisoned: {}", err),
        }
    }

    fn push_uploaded(&self, info: &TrackerInfo, size: usize) {
        info.upload.fetch_add(size as u64, Ordering::Relaxed);
        self.upload_total.fetch_add(size as u64, Ordering::Relaxed);
    }

    fn push_downloaded(&self, info: &TrackerInfo, size: usize) {
        info.download.fetch_add(size as u64, Ordering::Relaxed);
        self.download_total.fetch_add(size as u64, Ordering::Relaxed);
    }

    pub fn len(&self) -> usize {
        self.connections.lock().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn snapshot(&self) -> Result<Snapshot, Error> {
        let connections = self
            .connections
            .lock()?
            .values()
            .map(|info| ConnectionSnapshot {
                id: info.id,
                metadata: info.metadata.clone(),
                upload: info.upload(),
                download: info.download(),
                start: info.start,
                chains: info.chain.names().to_vec(),
                rule: info.rule.clone(),
                rule_payload: info.rule_payload.clone(),
            })
            .collect();
        Ok(Snapshot {
            download_total: self.download_total.load(Ordering::Relaxed),
            upload_total: self.upload_total.load(Ordering::Relaxed),
            connections,
        })
    }
}

/// Outbound TCP stream registered with a [`Manager`]
pub struct TcpTracker {
    conn: BoxedStream,
    info: Arc<TrackerInfo>,
    manager: Arc<Manager>,
}

impl TcpTracker {
    pub fn new(
        conn: BoxedStream,
        manager: Arc<Manager>,
        metadata: &Metadata,
        chain: Chain,
        rule: Option<&Rule>,
    ) -> Self {
        let info = Arc::new(TrackerInfo::new(metadata, chain, rule));
        manager.join(info.clone());
        Self {
            conn,
            info,
            manager,
        }
    }

    pub fn info(&self) -> &TrackerInfo {
        &self.info
    }

    pub fn proxy_chain(&self) -> &Chain {
        &self.info.chain
    }
}

impl fmt::Debug for TcpTracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("TcpTracker")
            .field("id", &self.info.id)
            .field("conn", &self.conn)
            .finish()
    }
}

impl io::Read for TcpTracker {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.conn.read(buf)?;
        self.manager.push_downloaded(&self.info, size);
        Ok(size)
    }
}

impl io::Write for TcpTracker {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let size = self.conn.write(buf)?;
        self.manager.push_uploaded(&self.info, size);
        Ok(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.conn.flush()
    }
}

impl ByteStream for TcpTracker {
    fn split(&self) -> Result<(ReadHalf, Box<dyn WriteHalf>), Error> {
        let (rd, wr) = self.conn.split()?;
        let rd = CountingRead {
            inner: rd,
            info: self.info.clone(),
            manager: self.manager.clone(),
        };
        let wr = CountingWrite {
            inner: wr,
            info: self.info.clone(),
            manager: self.manager.clone(),
        };
        Ok((Box::new(rd), Box::new(wr)))
    }
}

impl Drop for TcpTracker {
    fn drop(&mut self) {
        trace!(
            "[TCP] tracker {} closed: up {} down {}",
            self.info.id,
            self.info.upload(),
            self.info.download()
        );
        self.manager.leave(self.info.id);
    }
}

struct CountingRead {
    inner: ReadHalf,
    info: Arc<TrackerInfo>,
    manager: Arc<Manager>,
}

impl io::Read for CountingRead {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let size = self.inner.read(buf)?;
        self.manager.push_downloaded(&self.info, size);
        Ok(size)
    }
}

struct CountingWrite {
    inner: Box<dyn WriteHalf>,
    info: Arc<TrackerInfo>,
    manager: Arc<Manager>,
}

impl io::Write for CountingWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let size = self.inner.write(buf)?;
        self.manager.push_uploaded(&self.info, size);
        Ok(size)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

impl WriteHalf for CountingWrite {
    fn close(&mut self) -> io::Result<()> {
        self.inner.close()
    }
}

/// Outbound packet connection registered with a [`Manager`]
pub struct UdpTracker {
    conn: Box<dyn PacketConn>,
    info: Arc<TrackerInfo>,
    manager: Arc<Manager>,
}

impl UdpTracker {
    pub fn new(
        conn: Box<dyn PacketConn>,
        manager: Arc<Manager>,
        metadata: &Metadata,
        chain: Chain,
        rule: Option<&Rule>,
    ) -> Self {
        let info = Arc::new(TrackerInfo::new(metadata, chain, rule));
        manager.join(info.clone());
        Self {
            conn,
            info,
            manager,
        }
    }

    pub fn info(&self) -> &TrackerInfo {
        &self.info
    }

    pub fn proxy_chain(&self) -> &Chain {
        &self.info.chain
    }
}

impl fmt::Debug for UdpTracker {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("UdpTracker")
            .field("id", &self.info.id)
            .field("conn", &self.conn)
            .finish()
    }
}

impl PacketConn for UdpTracker {
    fn read_from(&self, buf: &mut [u8]) -> Result<(usize, SocketAddr), Error> {
        let (size, from) = self.conn.read_from(buf)?;
        self.manager.push_downloaded(&self.info, size);
        Ok((size, from))
    }

    fn write_to(&self, pkt: &[u8], addr: SocketAddr) -> Result<usize, Error> {
        let size = self.conn.write_to(pkt, addr)?;
        self.manager.push_uploaded(&self.info, size);
        Ok(size)
    }

    fn set_read_timeout(&self, dur: Option<Duration>) -> Result<(), Error> {
        self.conn.set_read_timeout(dur)
    }

    fn close(&self) -> Result<(), Error> {
        self.conn.close()
    }
}

impl Drop for UdpTracker {
    fn drop(&mut self) {
        self.manager.leave(self.info.id);
    }
}
