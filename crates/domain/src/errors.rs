use std::io::ErrorKind;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum ProxyError {
    /// The connection came from the cache and the upstream had already
    /// closed it. A caller may retry once on a fresh connection.
    #[error("cached upstream connection was closed")]
    CachedClosed,

    #[error("zone transfer did not start with an SOA record")]
    NoSoa,

    #[error("transport timeout for {server}")]
    TransportTimeout { server: String },

    #[error("invalid upstream endpoint: {0}")]
    InvalidEndpoint(String),

    #[error("invalid TLS server name: {0}")]
    InvalidTlsName(String),

    #[error("invalid DNS message: {0}")]
    InvalidMessage(String),

    #[error("connection manager is not running")]
    NotRunning,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// True for I/O errors that mean the peer hung up. A closed peer
    /// surfaces as a short read on the length prefix, a broken pipe on
    /// write, or a reset, depending on the platform and direction.
    pub fn is_eof(&self) -> bool {
        match self {
            ProxyError::Io(e) => matches!(
                e.kind(),
                ErrorKind::UnexpectedEof | ErrorKind::BrokenPipe | ErrorKind::ConnectionReset
            ),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    #[test]
    fn eof_kinds_are_eof() {
        for kind in [
            ErrorKind::UnexpectedEof,
            ErrorKind::BrokenPipe,
            ErrorKind::ConnectionReset,
        ] {
            let err = ProxyError::Io(io::Error::new(kind, "peer gone"));
            assert!(err.is_eof(), "{kind:?} should classify as eof");
        }
    }

    #[test]
    fn other_errors_are_not_eof() {
        let err = ProxyError::Io(io::Error::new(ErrorKind::ConnectionRefused, "refused"));
        assert!(!err.is_eof());
        assert!(!ProxyError::CachedClosed.is_eof());
        assert!(!ProxyError::NoSoa.is_eof());
    }
}
