use std::net::SocketAddr;
use std::sync::atomic::AtomicU64;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashMap;
use tokio::sync::{Mutex, RwLock};
use tracing::debug;


/// Per-peer command counters. One entry per distinct remote address, created lazily on the
///  first packet from that address and kept for the lifetime of the process. The counters
///  count attempts, not successes: a failed offer still increments `offer` (plus `errors`).
#[derive(Debug)]
pub struct PeerStats {
    pub addr: SocketAddr,
    pub ping: AtomicU64,
    pub offer: AtomicU64,
    pub answer: AtomicU64,
    pub delete: AtomicU64,
    pub query: AtomicU64,
    pub list: AtomicU64,
    pub errors: AtomicU64,
}

impl PeerStats {
    fn new(addr: SocketAddr) -> PeerStats {
        PeerStats {
            addr,
            ping: AtomicU64::new(0),
            offer: AtomicU64::new(0),
            answer: AtomicU64::new(0),
            delete: AtomicU64::new(0),
            query: AtomicU64::new(0),
            list: AtomicU64::new(0),
            errors: AtomicU64::new(0),
        }
    }
}


pub struct PeerStatsTable {
    peers: RwLock<FxHashMap<SocketAddr, Arc<PeerStats>>>,
}

impl PeerStatsTable {
    pub fn new() -> PeerStatsTable {
        PeerStatsTable {
            peers: Default::default(),
        }
    }

    pub async fn get_or_create(&self, addr: SocketAddr) -> Arc<PeerStats> {
        {
            // trying with a read lock first is an optimization for the common case
            if let Some(entry) = self.peers.read().await.get(&addr) {
                return entry.clone();
            }
        }

        let mut peers = self.peers.write().await;
        // we need to check again now that we have the exclusive lock to avoid racy initialization
        if let Some(entry) = peers.get(&addr) {
            return entry.clone();
        }

        debug!("adding a proxy for control stats: {}", addr);
        let entry = Arc::new(PeerStats::new(addr));
        peers.insert(addr, entry.clone());
        entry
    }

    /// lookup for the external reporting collaborator
    pub async fn get(&self, addr: SocketAddr) -> Option<Arc<PeerStats>> {
        self.peers.read().await
            .get(&addr)
            .cloned()
    }

    pub async fn snapshot(&self) -> Vec<Arc<PeerStats>> {
        self.peers.read().await
            .values()
            .cloned()
            .collect()
    }
}


/// The command kinds whose processing latency feeds the interval aggregates.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum TimedCommand {
    Offer,
    Answer,
    Delete,
}

#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
pub struct TimingSnapshot {
    pub min: Duration,
    pub max: Duration,
    pub sum: Duration,
    pub count: u64,
}

/// Running min/max/sum/count of request latency per timed command kind, across all peers.
///  Each kind has its own lock, so concurrent offers and answers never block each other.
///  The external reporting cycle reads and resets on its interval boundaries; this core
///  only records.
pub struct IntervalStats {
    offer: Mutex<TimingSnapshot>,
    answer: Mutex<TimingSnapshot>,
    delete: Mutex<TimingSnapshot>,
}

impl IntervalStats {
    pub fn new() -> IntervalStats {
        IntervalStats {
            offer: Default::default(),
            answer: Default::default(),
            delete: Default::default(),
        }
    }

    fn record_of(&self, kind: TimedCommand) -> &Mutex<TimingSnapshot> {
        match kind {
            TimedCommand::Offer => &self.offer,
            TimedCommand::Answer => &self.answer,
            TimedCommand::Delete => &self.delete,
        }
    }

    pub async fn record(&self, kind: TimedCommand, duration: Duration) {
        let mut record = self.record_of(kind).lock().await;
        if record.count == 0 || duration < record.min {
            record.min = duration;
        }
        if duration > record.max {
            record.max = duration;
        }
        record.sum += duration;
        record.count += 1;
    }

    pub async fn snapshot(&self, kind: TimedCommand) -> TimingSnapshot {
        *self.record_of(kind).lock().await
    }

    /// zeroes all fields; called by the external interval reporter
    pub async fn reset(&self, kind: TimedCommand) {
        *self.record_of(kind).lock().await = Default::default();
    }
}
