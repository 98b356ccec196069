//! The forwarding procedure: obtain a connection from the transport,
//! perform the wire exchange, hand the connection back.
//!
//! Ordinary queries are a single request/response pair correlated by
//! transaction id; zone transfers (AXFR/IXFR) stream frames bracketed
//! by SOA records. In both cases a connection that saw an I/O error
//! is closed, never released; a connection that completed its
//! exchange is always released.

use std::borrow::Cow;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use ferrous_forward_domain::{Endpoint, ForwardConfig, Proto, ProxyError};
use hickory_proto::op::{Message, ResponseCode};
use hickory_proto::rr::{Record, RecordType};
use tracing::debug;

use crate::dialer::{Dialer, TlsSettings};
use crate::metrics::MetricsSink;
use crate::request::UpstreamRequest;
use crate::transport::{PersistConn, Transport};

#[derive(Debug, Clone, Copy, Default)]
pub struct ConnectOptions {
    pub force_tcp: bool,
    pub prefer_udp: bool,
}

/// What the upstream answered: one message for ordinary queries, the
/// aggregated record stream for zone transfers.
#[derive(Debug)]
pub enum UpstreamReply {
    Answer(Message),
    Transfer(Vec<Record>),
}

/// A forwarding proxy for one upstream address.
pub struct Proxy {
    proxy_name: Arc<str>,
    addr_label: Arc<str>,
    transport: Transport,
    read_timeout: Duration,
    write_timeout: Duration,
    metrics: Arc<dyn MetricsSink>,
}

impl Proxy {
    /// Builds a proxy for `endpoint`. TLS endpoints get a rustls
    /// session over the shared webpki roots, verified against the
    /// endpoint's server name.
    pub fn new(
        proxy_name: impl Into<Arc<str>>,
        endpoint: &Endpoint,
        cfg: &ForwardConfig,
        dialer: Arc<dyn Dialer>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Result<Self, ProxyError> {
        let tls = match endpoint.proto {
            Proto::Tls => {
                let name = endpoint
                    .tls_name
                    .clone()
                    .unwrap_or_else(|| Arc::from(endpoint.addr.ip().to_string()));
                Some(TlsSettings::webpki(&name)?)
            }
            _ => None,
        };
        Ok(Self::with_tls(proxy_name, endpoint.addr, tls, cfg, dialer, metrics))
    }

    /// Builds a proxy with explicit TLS settings (or none), for
    /// callers that construct their own client config.
    pub fn with_tls(
        proxy_name: impl Into<Arc<str>>,
        addr: SocketAddr,
        tls: Option<TlsSettings>,
        cfg: &ForwardConfig,
        dialer: Arc<dyn Dialer>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let proxy_name = proxy_name.into();
        let transport = Transport::new(
            proxy_name.clone(),
            addr,
            tls,
            cfg,
            dialer,
            metrics.clone(),
        );
        Self {
            proxy_name,
            addr_label: Arc::from(addr.to_string()),
            transport,
            read_timeout: cfg.read_timeout(),
            write_timeout: cfg.write_timeout(),
            metrics,
        }
    }

    pub fn start(&self) {
        self.transport.start();
    }

    pub async fn stop(&self) {
        self.transport.stop().await;
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    pub fn addr(&self) -> &str {
        &self.addr_label
    }

    /// Forwards the request and waits for the response (or the frame
    /// stream for zone transfers).
    ///
    /// The request's transaction id is restored to the caller's value
    /// on every exit path, including errors and cancellation.
    pub async fn connect(
        &self,
        req: &mut UpstreamRequest,
        opts: ConnectOptions,
    ) -> Result<UpstreamReply, ProxyError> {
        let started = Instant::now();

        let proto = choose_proto(opts, req.proto());
        let (mut pc, cached) = self.transport.dial(proto).await?;
        pc.set_udp_size(req.size());

        if req.is_zone_transfer() {
            return self.transfer(req, pc, cached).await;
        }

        let origin_id = req.id();
        let mut req = RestoreId::new(req, origin_id);
        req.set_id(fastrand::u16(..));
        let sent_id = req.message().id();

        if let Err(e) = pc.write_msg(req.message(), self.write_timeout).await {
            return Err(self.discard(pc, cached, e).await);
        }

        // One read budget for the whole exchange; discarded frames
        // only burn what is left of it.
        let deadline = Instant::now() + self.read_timeout;
        let mut answer = loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match pc.read_msg(remaining).await {
                Ok(m) if m.id() == sent_id => break m,
                Ok(m) => {
                    debug!(got = m.id(), want = sent_id, "dropping out-of-order response");
                }
                Err(e) => return Err(self.discard(pc, cached, e).await),
            }
        };

        answer.set_id(origin_id);
        self.transport.release(pc).await;

        let rcode = rcode_label(answer.response_code());
        self.metrics
            .request_duration(&self.proxy_name, &self.addr_label, &rcode, started.elapsed());

        Ok(UpstreamReply::Answer(answer))
    }

    /// AXFR/IXFR: the caller's id is kept (no rewrite), the first
    /// frame must lead with an SOA, and a frame whose last answer is
    /// an SOA ends the stream.
    async fn transfer(
        &self,
        req: &UpstreamRequest,
        mut pc: PersistConn,
        cached: bool,
    ) -> Result<UpstreamReply, ProxyError> {
        if let Err(e) = pc.write_msg(req.message(), self.write_timeout).await {
            return Err(self.discard(pc, cached, e).await);
        }

        let mut records: Vec<Record> = Vec::new();
        let mut first = true;
        loop {
            let frame = match pc.read_msg(self.read_timeout).await {
                Ok(frame) => frame,
                Err(e) => return Err(self.discard(pc, cached, e).await),
            };
            if frame.id() != req.id() {
                debug!(got = frame.id(), want = req.id(), "dropping out-of-order frame");
                continue;
            }
            if first {
                let leads_with_soa = frame
                    .answers()
                    .first()
                    .is_some_and(|r| r.record_type() == RecordType::SOA);
                if !leads_with_soa {
                    pc.close().await;
                    return Err(ProxyError::NoSoa);
                }
                first = false;
                if frame.answers().len() == 1 {
                    records.push(frame.answers()[0].clone());
                    continue;
                }
            }
            records.extend(frame.answers().iter().cloned());
            let ends_with_soa = frame
                .answers()
                .last()
                .is_some_and(|r| r.record_type() == RecordType::SOA);
            if ends_with_soa {
                break;
            }
        }

        self.transport.release(pc).await;
        Ok(UpstreamReply::Transfer(records))
    }

    /// Closes a connection after an I/O failure. End-of-stream on a
    /// cached connection becomes the distinguished `CachedClosed` so
    /// callers can retry once on a fresh connection.
    async fn discard(&self, pc: PersistConn, cached: bool, err: ProxyError) -> ProxyError {
        debug!(server = %self.addr_label, error = %err, "closing connection after error");
        pc.close().await;
        if cached && err.is_eof() {
            ProxyError::CachedClosed
        } else {
            err
        }
    }
}

/// `force_tcp` has precedence over `prefer_udp`; either overrides the
/// client's native transport.
fn choose_proto(opts: ConnectOptions, client: Proto) -> Proto {
    if opts.force_tcp {
        Proto::Tcp
    } else if opts.prefer_udp {
        Proto::Udp
    } else {
        client
    }
}

fn rcode_label(rcode: ResponseCode) -> Cow<'static, str> {
    let label = match rcode {
        ResponseCode::NoError => "NOERROR",
        ResponseCode::FormErr => "FORMERR",
        ResponseCode::ServFail => "SERVFAIL",
        ResponseCode::NXDomain => "NXDOMAIN",
        ResponseCode::NotImp => "NOTIMP",
        ResponseCode::Refused => "REFUSED",
        other => return Cow::Owned(u16::from(other).to_string()),
    };
    Cow::Borrowed(label)
}

/// Restores the caller's transaction id when dropped, so the rewrite
/// cannot leak out of `connect` on any path.
struct RestoreId<'a> {
    req: &'a mut UpstreamRequest,
    origin: u16,
}

impl<'a> RestoreId<'a> {
    fn new(req: &'a mut UpstreamRequest, origin: u16) -> Self {
        Self { req, origin }
    }

    fn set_id(&mut self, id: u16) {
        self.req.message_mut().set_id(id);
    }

    fn message(&self) -> &Message {
        self.req.message()
    }
}

impl Drop for RestoreId<'_> {
    fn drop(&mut self) {
        self.req.message_mut().set_id(self.origin);
    }
}
