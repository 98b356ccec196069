use std::fmt;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;

use crate::errors::ProxyError;

/// Transport tag for one upstream connection.
///
/// These are the protocols the connection cache keys on; encrypted
/// transports beyond TLS (DoH, DoQ) are not part of the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Proto {
    Udp,
    Tcp,
    Tls,
}

impl Proto {
    pub fn as_str(&self) -> &'static str {
        match self {
            Proto::Udp => "udp",
            Proto::Tcp => "tcp",
            Proto::Tls => "tcp-tls",
        }
    }

    /// True for stream transports that frame messages with a length
    /// prefix (RFC 1035 §4.2.2).
    pub fn is_stream(&self) -> bool {
        matches!(self, Proto::Tcp | Proto::Tls)
    }
}

impl fmt::Display for Proto {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Proto {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "udp" => Ok(Proto::Udp),
            "tcp" => Ok(Proto::Tcp),
            "tcp-tls" => Ok(Proto::Tls),
            other => Err(ProxyError::InvalidEndpoint(format!(
                "unknown protocol tag '{}'",
                other
            ))),
        }
    }
}

/// A parsed upstream endpoint: where to dial and over what.
///
/// TLS endpoints carry the server name to verify the certificate
/// against, which defaults to the host part of the URL.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoint {
    pub proto: Proto,
    pub addr: SocketAddr,
    pub tls_name: Option<Arc<str>>,
}

impl Endpoint {
    pub fn udp(addr: SocketAddr) -> Self {
        Self {
            proto: Proto::Udp,
            addr,
            tls_name: None,
        }
    }

    pub fn tcp(addr: SocketAddr) -> Self {
        Self {
            proto: Proto::Tcp,
            addr,
            tls_name: None,
        }
    }

    pub fn tls(addr: SocketAddr, server_name: impl Into<Arc<str>>) -> Self {
        Self {
            proto: Proto::Tls,
            addr,
            tls_name: Some(server_name.into()),
        }
    }
}

impl FromStr for Endpoint {
    type Err = ProxyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if let Some(rest) = s.strip_prefix("udp://") {
            let addr = rest.parse::<SocketAddr>().map_err(|_| {
                ProxyError::InvalidEndpoint(format!("invalid UDP address '{}'", rest))
            })?;
            return Ok(Endpoint::udp(addr));
        }
        if let Some(rest) = s.strip_prefix("tcp://") {
            let addr = rest.parse::<SocketAddr>().map_err(|_| {
                ProxyError::InvalidEndpoint(format!("invalid TCP address '{}'", rest))
            })?;
            return Ok(Endpoint::tcp(addr));
        }
        if let Some(rest) = s.strip_prefix("tls://") {
            let addr = rest.parse::<SocketAddr>().map_err(|_| {
                ProxyError::InvalidEndpoint(format!(
                    "invalid TLS address '{}'; expected 'tls://IP:PORT'",
                    rest
                ))
            })?;
            let host = rest.rsplit_once(':').map(|(h, _)| h).unwrap_or(rest);
            let host = host.trim_start_matches('[').trim_end_matches(']');
            return Ok(Endpoint::tls(addr, host));
        }
        // Bare IP:PORT defaults to plain DNS over UDP.
        if let Ok(addr) = s.parse::<SocketAddr>() {
            return Ok(Endpoint::udp(addr));
        }
        Err(ProxyError::InvalidEndpoint(format!(
            "invalid endpoint '{}'; expected udp://IP:PORT, tcp://IP:PORT, tls://IP:PORT, or IP:PORT",
            s
        )))
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.proto {
            Proto::Udp => write!(f, "udp://{}", self.addr),
            Proto::Tcp => write!(f, "tcp://{}", self.addr),
            Proto::Tls => write!(f, "tls://{}", self.addr),
        }
    }
}
