//! Message-level upstream connection.
//!
//! Wraps one socket and speaks whole DNS messages over it: raw
//! datagrams on UDP, 2-byte length-prefix framing on TCP and TLS
//! (RFC 1035 §4.2.2). Serialization is `hickory-proto`; this module
//! does not interpret message contents beyond the wire format.

use std::io;
use std::net::SocketAddr;
use std::time::Duration;

use ferrous_forward_domain::{Proto, ProxyError};
use hickory_proto::op::Message;
use hickory_proto::serialize::binary::{BinEncodable, BinEncoder};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpStream, UdpSocket};
use tokio_rustls::client::TlsStream;

/// Minimum UDP receive buffer (RFC 1035 §2.3.4).
const MIN_UDP_SIZE: u16 = 512;

#[derive(Debug)]
enum DnsStream {
    Udp(UdpSocket),
    Tcp(TcpStream),
    Tls(Box<TlsStream<TcpStream>>),
}

/// One upstream connection with message-oriented read/write.
///
/// `udp_size` bounds the receive buffer for datagram reads and is
/// adjusted per request from the client's advertised payload size.
#[derive(Debug)]
pub struct DnsConn {
    stream: DnsStream,
    peer: SocketAddr,
    udp_size: u16,
}

impl DnsConn {
    /// Wraps a connected UDP socket.
    pub fn udp(socket: UdpSocket, peer: SocketAddr) -> Self {
        Self {
            stream: DnsStream::Udp(socket),
            peer,
            udp_size: MIN_UDP_SIZE,
        }
    }

    pub fn tcp(stream: TcpStream, peer: SocketAddr) -> Self {
        Self {
            stream: DnsStream::Tcp(stream),
            peer,
            udp_size: MIN_UDP_SIZE,
        }
    }

    pub fn tls(stream: TlsStream<TcpStream>, peer: SocketAddr) -> Self {
        Self {
            stream: DnsStream::Tls(Box::new(stream)),
            peer,
            udp_size: MIN_UDP_SIZE,
        }
    }

    pub fn proto(&self) -> Proto {
        match self.stream {
            DnsStream::Udp(_) => Proto::Udp,
            DnsStream::Tcp(_) => Proto::Tcp,
            DnsStream::Tls(_) => Proto::Tls,
        }
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    pub fn udp_size(&self) -> u16 {
        self.udp_size
    }

    /// Sets the datagram receive buffer size, clamped to at least 512.
    pub fn set_udp_size(&mut self, size: u16) {
        self.udp_size = size.max(MIN_UDP_SIZE);
    }

    /// Writes one message within `timeout`.
    pub async fn write_msg(&mut self, msg: &Message, timeout: Duration) -> Result<(), ProxyError> {
        let bytes = serialize(msg)?;
        let io = async {
            match &mut self.stream {
                DnsStream::Udp(socket) => socket.send(&bytes).await.map(|_| ()),
                DnsStream::Tcp(stream) => write_framed(stream, &bytes).await,
                DnsStream::Tls(stream) => write_framed(stream.as_mut(), &bytes).await,
            }
        };
        match tokio::time::timeout(timeout, io).await {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(ProxyError::Io(e)),
            Err(_) => Err(self.timeout_error()),
        }
    }

    /// Reads one message within `timeout`.
    ///
    /// A `timeout` of zero fails immediately; callers use this to
    /// express an already-exhausted read deadline.
    pub async fn read_msg(&mut self, timeout: Duration) -> Result<Message, ProxyError> {
        let buf_size = self.udp_size as usize;
        let io = async {
            match &mut self.stream {
                DnsStream::Udp(socket) => {
                    let mut buf = vec![0u8; buf_size];
                    let n = socket.recv(&mut buf).await?;
                    buf.truncate(n);
                    Ok(buf)
                }
                DnsStream::Tcp(stream) => read_framed(stream).await,
                DnsStream::Tls(stream) => read_framed(stream.as_mut()).await,
            }
        };
        let bytes: Vec<u8> = match tokio::time::timeout(timeout, io).await {
            Ok(Ok(bytes)) => bytes,
            Ok(Err(e)) => return Err(ProxyError::Io(e)),
            Err(_) => return Err(self.timeout_error()),
        };
        Message::from_vec(&bytes).map_err(|e| ProxyError::InvalidMessage(e.to_string()))
    }

    /// Shuts the connection down. Close errors are ignored; the
    /// connection is forgotten regardless.
    pub async fn close(mut self) {
        let _ = match &mut self.stream {
            DnsStream::Udp(_) => Ok(()),
            DnsStream::Tcp(stream) => stream.shutdown().await,
            DnsStream::Tls(stream) => stream.shutdown().await,
        };
    }

    fn timeout_error(&self) -> ProxyError {
        ProxyError::TransportTimeout {
            server: self.peer.to_string(),
        }
    }
}

fn serialize(msg: &Message) -> Result<Vec<u8>, ProxyError> {
    let mut buf = Vec::with_capacity(512);
    let mut encoder = BinEncoder::new(&mut buf);
    msg.emit(&mut encoder)
        .map_err(|e| ProxyError::InvalidMessage(e.to_string()))?;
    Ok(buf)
}

async fn write_framed<S>(stream: &mut S, bytes: &[u8]) -> io::Result<()>
where
    S: AsyncWriteExt + Unpin,
{
    let len = (bytes.len() as u16).to_be_bytes();
    stream.write_all(&len).await?;
    stream.write_all(bytes).await?;
    stream.flush().await
}

async fn read_framed<S>(stream: &mut S) -> io::Result<Vec<u8>>
where
    S: AsyncReadExt + Unpin,
{
    let mut len_buf = [0u8; 2];
    stream.read_exact(&mut len_buf).await?;
    let len = u16::from_be_bytes(len_buf) as usize;
    let mut buf = vec![0u8; len];
    stream.read_exact(&mut buf).await?;
    Ok(buf)
}
