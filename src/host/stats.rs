use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic operational counters, shared by every component of a host.
///
/// A single `Stats` may be handed to several hosts through [`HostBuilder::stats`] to aggregate
/// them.
///
/// [`HostBuilder::stats`]: crate::HostBuilder::stats
#[derive(Debug, Default)]
pub struct Stats {
    sent_bytes: AtomicU64,
    received_bytes: AtomicU64,
    processed_bytes: AtomicU64,
    running_workers: AtomicU64,
    caught_panics: AtomicU64,
    connects: AtomicU64,
    denied_connects: AtomicU64,
    disconnects: AtomicU64,
    timeouts: AtomicU64,
}

/// Point-in-time copy of [`Stats`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct StatsSnapshot {
    pub sent_bytes: u64,
    pub received_bytes: u64,
    pub processed_bytes: u64,
    pub running_workers: u64,
    pub caught_panics: u64,
    pub connects: u64,
    pub denied_connects: u64,
    pub disconnects: u64,
    pub timeouts: u64,
}

impl Stats {
    pub fn new() -> Self {
        Default::default()
    }

    pub(crate) fn add_sent_bytes(&self, n: usize) {
        self.sent_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_received_bytes(&self, n: usize) {
        self.received_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn add_processed_bytes(&self, n: usize) {
        self.processed_bytes.fetch_add(n as u64, Ordering::Relaxed);
    }

    pub(crate) fn worker_started(&self) {
        self.running_workers.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn worker_stopped(&self) {
        self.running_workers.fetch_sub(1, Ordering::Relaxed);
    }

    pub(crate) fn panic_caught(&self) {
        self.caught_panics.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connect(&self) {
        self.connects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn connect_denied(&self) {
        self.denied_connects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn disconnect(&self) {
        self.disconnects.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn timeout(&self) {
        self.timeouts.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            sent_bytes: self.sent_bytes.load(Ordering::Relaxed),
            received_bytes: self.received_bytes.load(Ordering::Relaxed),
            processed_bytes: self.processed_bytes.load(Ordering::Relaxed),
            running_workers: self.running_workers.load(Ordering::Relaxed),
            caught_panics: self.caught_panics.load(Ordering::Relaxed),
            connects: self.connects.load(Ordering::Relaxed),
            denied_connects: self.denied_connects.load(Ordering::Relaxed),
            disconnects: self.disconnects.load(Ordering::Relaxed),
            timeouts: self.timeouts.load(Ordering::Relaxed),
        }
    }
}
