//! Dialing capability.
//!
//! The transport consumes this as a narrow trait so tests can inject
//! scripted dialers; `TokioDialer` is the production implementation.

use std::net::SocketAddr;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

use async_trait::async_trait;
use ferrous_forward_domain::{Proto, ProxyError};
use rustls::pki_types::ServerName;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::conn::DnsConn;

static SHARED_TLS_CONFIG: LazyLock<Arc<rustls::ClientConfig>> = LazyLock::new(|| {
    let mut root_store = rustls::RootCertStore::empty();
    root_store.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let _ = rustls::crypto::aws_lc_rs::default_provider().install_default();

    let config = rustls::ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Arc::new(config)
});

/// TLS client parameters for one upstream.
#[derive(Clone)]
pub struct TlsSettings {
    config: Arc<rustls::ClientConfig>,
    server_name: ServerName<'static>,
}

impl TlsSettings {
    /// Settings over the process-shared webpki root store.
    pub fn webpki(server_name: &str) -> Result<Self, ProxyError> {
        Self::with_config(SHARED_TLS_CONFIG.clone(), server_name)
    }

    /// Settings with a caller-provided client config.
    pub fn with_config(
        config: Arc<rustls::ClientConfig>,
        server_name: &str,
    ) -> Result<Self, ProxyError> {
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|e| ProxyError::InvalidTlsName(format!("{}: {}", server_name, e)))?;
        Ok(Self {
            config,
            server_name,
        })
    }
}

#[async_trait]
pub trait Dialer: Send + Sync {
    /// Dials a plain `udp` or `tcp` connection.
    async fn dial(
        &self,
        proto: Proto,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<DnsConn, ProxyError>;

    /// Dials and handshakes a `tcp-tls` connection.
    async fn dial_tls(
        &self,
        addr: SocketAddr,
        tls: &TlsSettings,
        timeout: Duration,
    ) -> Result<DnsConn, ProxyError>;
}

/// Production dialer over tokio sockets.
#[derive(Debug, Clone, Copy, Default)]
pub struct TokioDialer;

#[async_trait]
impl Dialer for TokioDialer {
    async fn dial(
        &self,
        proto: Proto,
        addr: SocketAddr,
        timeout: Duration,
    ) -> Result<DnsConn, ProxyError> {
        match proto {
            Proto::Udp => {
                let socket = udp_socket(addr)?;
                within(timeout, addr, socket.connect(addr)).await??;
                debug!(server = %addr, "UDP socket connected");
                Ok(DnsConn::udp(socket, addr))
            }
            Proto::Tcp => {
                let stream = within(timeout, addr, TcpStream::connect(addr)).await??;
                debug!(server = %addr, "TCP connection established");
                Ok(DnsConn::tcp(stream, addr))
            }
            Proto::Tls => Err(ProxyError::InvalidEndpoint(
                "tcp-tls dialing requires TLS settings".to_string(),
            )),
        }
    }

    async fn dial_tls(
        &self,
        addr: SocketAddr,
        tls: &TlsSettings,
        timeout: Duration,
    ) -> Result<DnsConn, ProxyError> {
        let connector = tokio_rustls::TlsConnector::from(tls.config.clone());
        let server_name = tls.server_name.clone();

        let stream = within(timeout, addr, async {
            let tcp = TcpStream::connect(addr).await?;
            connector.connect(server_name, tcp).await
        })
        .await??;

        debug!(server = %addr, "TLS connection established");
        Ok(DnsConn::tls(stream, addr))
    }
}

/// Builds an unconnected UDP socket bound to an ephemeral port, with
/// the address family matching the upstream and enlarged buffers for
/// response bursts.
fn udp_socket(server: SocketAddr) -> Result<UdpSocket, ProxyError> {
    use socket2::{Domain, Protocol, Socket, Type};

    let domain = if server.is_ipv4() {
        Domain::IPV4
    } else {
        Domain::IPV6
    };

    let socket = Socket::new(domain, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    socket.set_recv_buffer_size(256 * 1024)?;
    socket.set_send_buffer_size(128 * 1024)?;

    let bind_addr: SocketAddr = if server.is_ipv4() {
        "0.0.0.0:0".parse().unwrap()
    } else {
        "[::]:0".parse().unwrap()
    };
    socket.bind(&bind_addr.into())?;
    socket.set_nonblocking(true)?;

    let std_socket: std::net::UdpSocket = socket.into();
    Ok(UdpSocket::from_std(std_socket)?)
}

async fn within<T, F>(timeout: Duration, server: SocketAddr, fut: F) -> Result<T, ProxyError>
where
    F: std::future::Future<Output = T>,
{
    tokio::time::timeout(timeout, fut)
        .await
        .map_err(|_| ProxyError::TransportTimeout {
            server: server.to_string(),
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn dials_udp_to_a_local_peer() {
        let peer = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = peer.local_addr().unwrap();

        let conn = TokioDialer
            .dial(Proto::Udp, addr, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(conn.proto(), Proto::Udp);
        assert_eq!(conn.peer(), addr);
    }

    #[tokio::test]
    async fn plain_dial_refuses_tls_tag() {
        let addr: SocketAddr = "127.0.0.1:853".parse().unwrap();
        let err = TokioDialer
            .dial(Proto::Tls, addr, Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InvalidEndpoint(_)));
    }
}
