//! Server control command
use std::fmt;

use crate::config::ServerConfig;

pub enum ServerCommand {
    /// terminate
    Terminate,
    /// swap in rules, mode and proxies built from the config
    Reload(Box<ServerConfig>),
}

impl fmt::Debug for ServerCommand {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        use ServerCommand::*;
        match self {
            Terminate => write!(f, "Terminate"),
            Reload(config) => write!(
                f,
                "Reload(mode: {}, rules: {})",
                config.mode,
                config.rules.len()
            ),
        }
    }
}
