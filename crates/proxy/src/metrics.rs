//! Connection-cache and request metrics.
//!
//! The transport and forwarder consume `MetricsSink`; `ProxyMetrics`
//! is the in-process implementation, with snapshot accessors so
//! operators (and tests) can read the counters back. Exporting to a
//! concrete metrics backend is a separate concern.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;

pub trait MetricsSink: Send + Sync {
    fn conn_cache_hit(&self, proxy: &str, addr: &str, proto: &str);
    fn conn_cache_miss(&self, proxy: &str, addr: &str, proto: &str);
    fn request_duration(&self, proxy: &str, addr: &str, rcode: &str, elapsed: Duration);
}

type MetricKey = (Arc<str>, Arc<str>, Arc<str>);

fn key(a: &str, b: &str, c: &str) -> MetricKey {
    (Arc::from(a), Arc::from(b), Arc::from(c))
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DurationStat {
    pub count: u64,
    pub total: Duration,
}

impl DurationStat {
    pub fn mean(&self) -> Option<Duration> {
        if self.count == 0 {
            return None;
        }
        Some(self.total / self.count as u32)
    }
}

#[derive(Default)]
pub struct ProxyMetrics {
    conn_cache_hits: DashMap<MetricKey, u64>,
    conn_cache_misses: DashMap<MetricKey, u64>,
    request_durations: DashMap<MetricKey, DurationStat>,
}

impl ProxyMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cache_hits(&self, proxy: &str, addr: &str, proto: &str) -> u64 {
        self.conn_cache_hits
            .get(&key(proxy, addr, proto))
            .map(|c| *c)
            .unwrap_or(0)
    }

    pub fn cache_misses(&self, proxy: &str, addr: &str, proto: &str) -> u64 {
        self.conn_cache_misses
            .get(&key(proxy, addr, proto))
            .map(|c| *c)
            .unwrap_or(0)
    }

    pub fn request_stat(&self, proxy: &str, addr: &str, rcode: &str) -> DurationStat {
        self.request_durations
            .get(&key(proxy, addr, rcode))
            .map(|s| *s)
            .unwrap_or_default()
    }
}

impl MetricsSink for ProxyMetrics {
    fn conn_cache_hit(&self, proxy: &str, addr: &str, proto: &str) {
        self.conn_cache_hits
            .entry(key(proxy, addr, proto))
            .and_modify(|c| *c += 1)
            .or_insert(1);
    }

    fn conn_cache_miss(&self, proxy: &str, addr: &str, proto: &str) {
        self.conn_cache_misses
            .entry(key(proxy, addr, proto))
            .and_modify(|c| *c += 1)
            .or_insert(1);
    }

    fn request_duration(&self, proxy: &str, addr: &str, rcode: &str, elapsed: Duration) {
        self.request_durations
            .entry(key(proxy, addr, rcode))
            .and_modify(|s| {
                s.count += 1;
                s.total += elapsed;
            })
            .or_insert(DurationStat {
                count: 1,
                total: elapsed,
            });
    }
}
