use thiserror::Error;

use crate::model;

pub type Result<T> = ::std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("config error: {0}")]
    Config(String),
    #[error("not found error: {0}")]
    NotFound(String),
    #[error("resolve error: {0}")]
    Resolve(String),
    #[error("dial error: {0}")]
    Dial(String),
    #[error("not supported error")]
    NotSupported,
    #[error("unknown error: {0}")]
    Unknown(String),
}

impl Error {
    pub fn config(err: impl ToString) -> Self {
        Error::Config(err.to_string())
    }
}

impl From<model::Error> for Error {
    fn from(err: model::Error) -> Self {
        use model::Error as E;
        match err {
            E::Io(io_err) => Error::Io(io_err),
            err @ E::Poisoned(_) => Error::Unknown(err.to_string()),
            err @ E::Disconnected { .. } => Error::Unknown(err.to_string()),
            err @ E::InvalidMetadata { .. } => Error::Unknown(err.to_string()),
            err @ E::DnsRecordMissing { .. } => Error::Resolve(err.to_string()),
            err @ E::DomainNotResolved { .. } => Error::Resolve(err.to_string()),
            err @ E::ProxyNotFound { .. } => Error::NotFound(err.to_string()),
            err @ E::ProcessNotFound { .. } => Error::NotFound(err.to_string()),
            err @ E::RuleFormat { .. } => Error::Config(err.to_string()),
            err @ E::UnsupportedRuleType { .. } => Error::Config(err.to_string()),
            err @ E::Payload { .. } => Error::Config(err.to_string()),
            E::IpSet { .. } => Error::NotSupported,
            err @ E::Dial { .. } => Error::Dial(err.to_string()),
            err @ E::AddressAlreadyInUse { .. } => Error::Io(std::io::Error::new(
                std::io::ErrorKind::AddrInUse,
                err.to_string(),
            )),
            err @ E::AddressNotAvailable { .. } => Error::Io(std::io::Error::new(
                std::io::ErrorKind::AddrNotAvailable,
                err.to_string(),
            )),
        }
    }
}
