//! Per-protocol connection stacks and the worker that owns them.
//!
//! All cache mutation happens on one task; callers rendezvous with it
//! over the event channel. Stacks are LIFO: the most recently used
//! connection is the most likely to still be open on the upstream
//! side, so it is handed out first. Entries in a stack are ordered by
//! `used_at`, oldest at the front.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use ferrous_forward_domain::{Proto, ProxyError};
use hickory_proto::op::Message;
use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use crate::conn::DnsConn;

/// A reusable upstream connection with its last-used timestamp.
///
/// Between `Transport::dial` and `Transport::release` the caller owns
/// the connection exclusively; inside the cache it is owned by the
/// worker. There is no shared state.
#[derive(Debug)]
pub struct PersistConn {
    conn: DnsConn,
    used_at: Instant,
}

impl PersistConn {
    pub(crate) fn new(conn: DnsConn) -> Self {
        Self {
            conn,
            used_at: Instant::now(),
        }
    }

    pub fn proto(&self) -> Proto {
        self.conn.proto()
    }

    pub fn peer(&self) -> std::net::SocketAddr {
        self.conn.peer()
    }

    pub fn set_udp_size(&mut self, size: u16) {
        self.conn.set_udp_size(size);
    }

    pub async fn write_msg(&mut self, msg: &Message, timeout: Duration) -> Result<(), ProxyError> {
        self.conn.write_msg(msg, timeout).await
    }

    pub async fn read_msg(&mut self, timeout: Duration) -> Result<Message, ProxyError> {
        self.conn.read_msg(timeout).await
    }

    /// Closes the underlying connection; errors are ignored.
    pub async fn close(self) {
        self.conn.close().await;
    }

    pub(crate) fn touch(&mut self) {
        self.used_at = Instant::now();
    }

    fn idle_for(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.used_at)
    }

    #[cfg(test)]
    pub(crate) fn backdate(&mut self, age: Duration) {
        self.used_at -= age;
    }
}

pub(super) enum CacheEvent {
    Checkout {
        proto: Proto,
        reply: oneshot::Sender<Option<PersistConn>>,
    },
    Checkin(PersistConn),
    Shutdown,
}

pub(super) struct ConnCache {
    stacks: [VecDeque<PersistConn>; 3],
    expire: Duration,
}

fn slot(proto: Proto) -> usize {
    match proto {
        Proto::Udp => 0,
        Proto::Tcp => 1,
        Proto::Tls => 2,
    }
}

impl ConnCache {
    pub(super) fn new(expire: Duration) -> Self {
        Self {
            stacks: Default::default(),
            expire,
        }
    }

    /// Pops the most recently used connection if it is still fresh.
    ///
    /// If the newest entry has already aged past the horizon, every
    /// entry beneath it is older still, so the whole stack is dropped.
    fn checkout(&mut self, proto: Proto) -> Option<PersistConn> {
        let stack = &mut self.stacks[slot(proto)];
        let newest = stack.back()?;
        if newest.idle_for(Instant::now()) < self.expire {
            return stack.pop_back();
        }
        debug!(
            proto = proto.as_str(),
            dropped = stack.len(),
            "newest cached connection expired, dropping stack"
        );
        stack.clear();
        None
    }

    fn checkin(&mut self, pc: PersistConn) {
        let proto = pc.proto();
        let stack = &mut self.stacks[slot(proto)];
        stack.push_back(pc);
        debug!(
            proto = proto.as_str(),
            depth = stack.len(),
            "connection returned to cache"
        );
    }

    /// Drops entries that have idled past the horizon. Entries are
    /// age-ordered, so the walk stops at the first fresh one.
    fn sweep(&mut self) {
        let now = Instant::now();
        for stack in &mut self.stacks {
            let before = stack.len();
            while stack
                .front()
                .is_some_and(|pc| pc.idle_for(now) >= self.expire)
            {
                stack.pop_front();
            }
            let dropped = before - stack.len();
            if dropped > 0 {
                debug!(dropped, "swept expired upstream connections");
            }
        }
    }

    fn drain(&mut self) {
        for stack in &mut self.stacks {
            stack.clear();
        }
    }
}

/// Worker loop: owns the stacks until shutdown or until every sender
/// is gone, then drains. Dropped connections close on drop.
pub(super) async fn run(mut cache: ConnCache, mut events: mpsc::Receiver<CacheEvent>) {
    let start = tokio::time::Instant::now() + cache.expire;
    let mut sweep = tokio::time::interval_at(start, cache.expire);

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Some(CacheEvent::Checkout { proto, reply }) => {
                    let _ = reply.send(cache.checkout(proto));
                }
                Some(CacheEvent::Checkin(pc)) => cache.checkin(pc),
                Some(CacheEvent::Shutdown) | None => break,
            },
            _ = sweep.tick() => cache.sweep(),
        }
    }
    cache.drain();
    debug!("connection cache worker stopped");
}
