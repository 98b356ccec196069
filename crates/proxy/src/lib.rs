//! DNS forwarding proxy with a per-upstream connection cache.
//!
//! The transport keeps recently used upstream connections warm and
//! health-checks them in-band: a connection that fails a read or
//! write is discarded instead of returned. The forwarder on top picks
//! a protocol, performs the exchange (single response or zone-transfer
//! stream), and hands the connection back to the cache.

pub mod conn;
pub mod connect;
pub mod dialer;
pub mod metrics;
pub mod request;
pub mod transport;

pub use conn::DnsConn;
pub use connect::{ConnectOptions, Proxy, UpstreamReply};
pub use dialer::{Dialer, TlsSettings, TokioDialer};
pub use metrics::{DurationStat, MetricsSink, ProxyMetrics};
pub use request::UpstreamRequest;
pub use transport::{PersistConn, Transport};

pub use ferrous_forward_domain::{Endpoint, ForwardConfig, Proto, ProxyError};
