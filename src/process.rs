use std::fmt;
use std::net::SocketAddr;

use crate::model::{Error, Network};

/// Maps a local socket pair to the executable that owns it
pub trait ProcessFinder: fmt::Debug + Send + Sync {
    fn find_process_path(
        &self,
        network: Network,
        from: SocketAddr,
        to: SocketAddr,
    ) -> Result<String, Error>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct UnsupportedProcessFinder;

impl ProcessFinder for UnsupportedProcessFinder {
    fn find_process_path(
        &self,
        network: Network,
        from: SocketAddr,
        to: SocketAddr,
    ) -> Result<String, Error> {
        Err(Error::ProcessNotFound { network, from, to })
    }
}
