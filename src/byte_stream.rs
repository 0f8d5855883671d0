use std::fmt;
use std::io;
use std::net::{Shutdown, TcpStream};
use std::ops::Deref;

use crate::model::Error;

/// Writing side of a split stream
pub trait WriteHalf: io::Write + Send {
    /// Close the underlying connection so that the peer half stops reading.
    fn close(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub type ReadHalf = Box<dyn io::Read + Send>;

/// read/write operations on byte stream
pub trait ByteStream: fmt::Debug + io::Read + io::Write + Send {
    fn split(&self) -> Result<(ReadHalf, Box<dyn WriteHalf>), Error>;
}

impl WriteHalf for TcpStream {
    fn close(&mut self) -> io::Result<()> {
        match self.shutdown(Shutdown::Both) {
            Err(err) if err.kind() == io::ErrorKind::NotConnected => Ok(()),
            other => other,
        }
    }
}

/// byte stream on tcp connection
impl ByteStream for TcpStream {
    fn split(&self) -> Result<(ReadHalf, Box<dyn WriteHalf>), Error> {
        let rd = self.try_clone()?;
        let wr = self.try_clone()?;
        Ok((Box::new(rd), Box::new(wr)))
    }
}

/// Boxed stream
impl<S: ByteStream + ?Sized> ByteStream for Box<S> {
    fn split(&self) -> Result<(ReadHalf, Box<dyn WriteHalf>), Error> {
        self.deref().split()
    }
}

pub type BoxedStream = Box<dyn ByteStream>;
