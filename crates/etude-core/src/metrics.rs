// src/metrics.rs
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

/// Server-wide counters. Written by the reactor, readable from anywhere.
#[repr(C, align(64))]
#[derive(Debug)]
pub struct ServerStats {
    pub accepted: AtomicU64,
    pub active_conns: AtomicUsize,
    pub requests: AtomicU64,
    pub bytes_sent: AtomicU64,
    pub rejected: AtomicU64,
    pub evicted: AtomicU64,
}

/// Point-in-time copy of [`ServerStats`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StatsSnapshot {
    pub accepted: u64,
    pub active_conns: usize,
    pub requests: u64,
    pub bytes_sent: u64,
    pub rejected: u64,
    pub evicted: u64,
}

impl ServerStats {
    pub fn new() -> Self {
        Self {
            accepted: AtomicU64::new(0),
            active_conns: AtomicUsize::new(0),
            requests: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
            evicted: AtomicU64::new(0),
        }
    }

    pub fn inc_accepted(&self) {
        self.accepted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_conn(&self) {
        self.active_conns.fetch_add(1, Ordering::Relaxed);
    }

    pub fn dec_conn(&self) {
        self.active_conns.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn inc_req(&self) {
        self.requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_bytes(&self, bytes: usize) {
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn inc_rejected(&self) {
        self.rejected.fetch_add(1, Ordering::Relaxed);
    }

    pub fn inc_evicted(&self) {
        self.evicted.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            accepted: self.accepted.load(Ordering::Relaxed),
            active_conns: self.active_conns.load(Ordering::Relaxed),
            requests: self.requests.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
            evicted: self.evicted.load(Ordering::Relaxed),
        }
    }
}

impl Default for ServerStats {
    fn default() -> Self {
        Self::new()
    }
}
