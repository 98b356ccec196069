//! Connection cache for one upstream address.
//!
//! Keeps recently used upstream connections warm so the TCP/TLS
//! handshake cost is paid once per burst of queries instead of once
//! per query. Health checking is in-band: a connection that fails a
//! read or write is closed by the caller instead of being released,
//! so dead connections age out of circulation immediately.
//!
//! Cache bookkeeping is serialised on a single worker task. The slow
//! part, dialing the network on a cache miss, happens on the caller's
//! task, so concurrent callers only contend for the brief
//! checkout/checkin rendezvous.

mod cache;

use std::net::SocketAddr;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use ferrous_forward_domain::{ForwardConfig, Proto, ProxyError};
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, info};

use crate::dialer::{Dialer, TlsSettings};
use crate::metrics::MetricsSink;
pub use cache::PersistConn;
use cache::{CacheEvent, ConnCache};

/// Weight of the exponentially-weighted dial-time average: each
/// observation moves the average a quarter of the way.
const CUMULATIVE_AVG_WEIGHT: i64 = 4;

pub struct Transport {
    proxy_name: Arc<str>,
    addr: SocketAddr,
    addr_label: Arc<str>,
    tls: Option<TlsSettings>,
    expire: Duration,
    min_dial_timeout: Duration,
    max_dial_timeout: Duration,
    avg_dial_ns: AtomicI64,
    dialer: Arc<dyn Dialer>,
    metrics: Arc<dyn MetricsSink>,
    events: mpsc::Sender<CacheEvent>,
    inbox: Mutex<Option<mpsc::Receiver<CacheEvent>>>,
}

impl Transport {
    pub fn new(
        proxy_name: Arc<str>,
        addr: SocketAddr,
        tls: Option<TlsSettings>,
        cfg: &ForwardConfig,
        dialer: Arc<dyn Dialer>,
        metrics: Arc<dyn MetricsSink>,
    ) -> Self {
        let (events, inbox) = mpsc::channel(1);
        Self {
            proxy_name,
            addr,
            addr_label: Arc::from(addr.to_string()),
            tls,
            expire: cfg.expire(),
            min_dial_timeout: cfg.min_dial_timeout(),
            max_dial_timeout: cfg.max_dial_timeout(),
            avg_dial_ns: AtomicI64::new(0),
            dialer,
            metrics,
            events,
            inbox: Mutex::new(Some(inbox)),
        }
    }

    /// Spawns the cache worker. Must be called before `dial`; calling
    /// it again is a no-op.
    pub fn start(&self) {
        if let Some(inbox) = self.inbox.lock().unwrap().take() {
            let cache = ConnCache::new(self.expire);
            tokio::spawn(cache::run(cache, inbox));
            info!(server = %self.addr, "connection cache started");
        }
    }

    /// Asks the worker to drain and exit. Cached connections are
    /// closed; in-flight connections close when their callers finish.
    pub async fn stop(&self) {
        let _ = self.events.send(CacheEvent::Shutdown).await;
    }

    /// Hands out a connection for `proto`, reusing a fresh cached one
    /// when possible. When TLS is configured the protocol is forced to
    /// `tcp-tls` regardless of the caller's choice.
    ///
    /// Returns the connection and whether it came from the cache. The
    /// caller owns it until `release` or close.
    pub async fn dial(&self, proto: Proto) -> Result<(PersistConn, bool), ProxyError> {
        let proto = if self.tls.is_some() {
            Proto::Tls
        } else {
            proto
        };

        let (reply, pickup) = oneshot::channel();
        self.events
            .send(CacheEvent::Checkout { proto, reply })
            .await
            .map_err(|_| ProxyError::NotRunning)?;
        let cached = pickup.await.map_err(|_| ProxyError::NotRunning)?;

        if let Some(pc) = cached {
            self.metrics
                .conn_cache_hit(&self.proxy_name, &self.addr_label, proto.as_str());
            debug!(server = %self.addr, proto = proto.as_str(), "reusing cached connection");
            return Ok((pc, true));
        }
        self.metrics
            .conn_cache_miss(&self.proxy_name, &self.addr_label, proto.as_str());

        let timeout = self.dial_timeout();
        let started = Instant::now();
        let dialed = match (&self.tls, proto) {
            (Some(tls), Proto::Tls) => self.dialer.dial_tls(self.addr, tls, timeout).await,
            _ => self.dialer.dial(proto, self.addr, timeout).await,
        };
        // A failed dial is still a latency observation.
        self.update_dial_timeout(started.elapsed());

        let conn = dialed?;
        Ok((PersistConn::new(conn), false))
    }

    /// Returns a healthy connection to the cache, refreshing its
    /// last-used timestamp.
    pub async fn release(&self, mut pc: PersistConn) {
        pc.touch();
        // If the worker is gone the connection just drops closed.
        let _ = self.events.send(CacheEvent::Checkin(pc)).await;
    }

    /// Average observed dial latency.
    pub fn avg_dial_time(&self) -> Duration {
        Duration::from_nanos(self.avg_dial_ns.load(Ordering::Relaxed).max(0) as u64)
    }

    fn dial_timeout(&self) -> Duration {
        let avg = self.avg_dial_time();
        if avg < self.min_dial_timeout {
            self.min_dial_timeout
        } else if avg < self.max_dial_timeout / 2 {
            avg * 2
        } else {
            self.max_dial_timeout
        }
    }

    fn update_dial_timeout(&self, observed: Duration) {
        let observed = observed.as_nanos().min(i64::MAX as u128) as i64;
        let avg = self.avg_dial_ns.load(Ordering::Relaxed);
        self.avg_dial_ns
            .fetch_add((observed - avg) / CUMULATIVE_AVG_WEIGHT, Ordering::Relaxed);
    }
}
