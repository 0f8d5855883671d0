use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync;

use crate::model::Network;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] io::Error),
    #[error("poisoned error: {}", _0)]
    Poisoned(String),
    #[error("disconnected channel error: {}", name)]
    Disconnected { name: String },
    #[error("metadata not valid: {}", metadata)]
    InvalidMetadata { metadata: String },
    /// the fake ip was never allocated or its record expired
    #[error("fake DNS record {} missing", ip)]
    DnsRecordMissing { ip: IpAddr },
    #[error("proxy {} not found", name)]
    ProxyNotFound { name: String },
    #[error("name not resolved: {}", domain)]
    DomainNotResolved { domain: String },
    #[error("process not found: {} {} --> {}", network, from, to)]
    ProcessNotFound {
        network: Network,
        from: SocketAddr,
        to: SocketAddr,
    },
    #[error("rule format invalid: {}", line)]
    RuleFormat { line: String },
    #[error("unsupported rule type {}", tp)]
    UnsupportedRuleType { tp: String },
    #[error("payload error: {}", payload)]
    Payload { payload: String },
    #[error("ipset {}: {}", name, reason)]
    IpSet { name: String, reason: String },
    #[error("dial {} --> {} error: {}", proxy, addr, source)]
    Dial {
        proxy: String,
        addr: String,
        #[source]
        source: io::Error,
    },
    #[error("address already in use: {}", addr)]
    AddressAlreadyInUse { addr: SocketAddr },
    #[error("address not available: {}", addr)]
    AddressNotAvailable { addr: SocketAddr },
}

impl Error {
    pub fn disconnected<S: Into<String>>(name: S) -> Self {
        Self::Disconnected { name: name.into() }
    }

    pub fn proxy_not_found<S: Into<String>>(name: S) -> Self {
        Self::ProxyNotFound { name: name.into() }
    }

    pub fn unsupported_rule_type<S: Into<String>>(tp: S) -> Self {
        Self::UnsupportedRuleType { tp: tp.into() }
    }

    pub fn payload<S: Into<String>>(payload: S) -> Self {
        Self::Payload {
            payload: payload.into(),
        }
    }

    pub fn dial(proxy: &str, addr: impl ToString, source: io::Error) -> Self {
        Self::Dial {
            proxy: proxy.to_owned(),
            addr: addr.to_string(),
            source,
        }
    }

    /// `true` if the error was caused by a timeout of the underlying socket
    pub fn is_timeout(&self) -> bool {
        use io::ErrorKind as K;
        match self {
            Error::Io(err) | Error::Dial { source: err, .. } => {
                matches!(err.kind(), K::TimedOut | K::WouldBlock)
            }
            _ => false,
        }
    }
}

impl<T> From<sync::PoisonError<T>> for Error {
    fn from(error: sync::PoisonError<T>) -> Self {
        Error::Poisoned(error.to_string())
    }
}
