//! Units of work handed from inbound listeners to the dispatcher.
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use derive_more::{Display, From};

use crate::byte_stream::BoxedStream;
use crate::model::{Error, Metadata};
use crate::pkt_stream::PacketReply;
use crate::pool::Buffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display, From)]
pub struct ConnId(u64);

impl ConnId {
    pub fn random() -> Self {
        ConnId(rand::random())
    }
}

/// An accepted TCP connection with its flow description
#[derive(Debug)]
pub struct ConnContext {
    pub id: ConnId,
    pub metadata: Metadata,
    pub conn: BoxedStream,
}

impl ConnContext {
    pub fn new(metadata: Metadata, conn: BoxedStream) -> Self {
        Self {
            id: ConnId::random(),
            metadata,
            conn,
        }
    }
}

/// One inbound UDP datagram
pub struct PacketAdapter {
    pub metadata: Metadata,
    payload: Option<Buffer>,
    reply: Arc<dyn PacketReply>,
}

impl PacketAdapter {
    pub fn new(metadata: Metadata, payload: Buffer, reply: Arc<dyn PacketReply>) -> Self {
        Self {
            metadata,
            payload: Some(payload),
            reply,
        }
    }

    pub fn data(&self) -> &[u8] {
        self.payload.as_deref().unwrap_or(&[])
    }

    /// Release the payload buffer back to its pool
    pub fn drop_payload(&mut self) {
        if let Some(buf) = self.payload.take() {
            buf.release();
        }
    }

    pub fn write_back(&self, data: &[u8], from: SocketAddr) -> Result<usize, Error> {
        self.reply.write_back(data, from)
    }

    /// Client address; identifies the flow in the NAT table
    pub fn local_addr(&self) -> SocketAddr {
        self.reply.local_addr()
    }

    pub fn reply(&self) -> Arc<dyn PacketReply> {
        self.reply.clone()
    }
}

impl fmt::Debug for PacketAdapter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("PacketAdapter")
            .field("metadata", &self.metadata)
            .field("len", &self.data().len())
            .field("client", &self.local_addr())
            .finish()
    }
}
