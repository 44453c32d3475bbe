//! Counter snapshots for observability
//!
//! Per-worker counts of new-flow events plus per-cache snapshots.
//! Workers own their counters outright; an aggregator can sum
//! snapshots across workers between batches.

use crate::flow::Protocol;

/// Per-worker new-flow counters, one per protocol family
///
/// Monotonic within a worker, independent of the caches' eviction
/// counters, resettable as a unit.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlowCounts {
    pub tcp: u64,
    pub udp: u64,
    pub icmp: u64,
    pub ip: u64,
}

impl FlowCounts {
    /// Count for one protocol family
    pub fn get(&self, proto: Protocol) -> u64 {
        match proto {
            Protocol::Tcp => self.tcp,
            Protocol::Udp => self.udp,
            Protocol::Icmp => self.icmp,
            Protocol::Ip => self.ip,
        }
    }

    pub(crate) fn add(&mut self, proto: Protocol, n: u64) {
        match proto {
            Protocol::Tcp => self.tcp += n,
            Protocol::Udp => self.udp += n,
            Protocol::Icmp => self.icmp += n,
            Protocol::Ip => self.ip += n,
        }
    }

    /// Zero all counters
    pub fn clear(&mut self) {
        *self = Self::default();
    }

    /// Total new flows across families
    pub fn total(&self) -> u64 {
        self.tcp + self.udp + self.icmp + self.ip
    }
}

/// Point-in-time snapshot of one flow cache
#[derive(Debug, Clone, Copy)]
pub struct CacheStats {
    /// Owning protocol family
    pub protocol: Protocol,
    /// Configured capacity
    pub max_flows: u32,
    /// Currently tracked flows
    pub in_use: u32,
    /// Flows evicted so far (stale + excess + timeout)
    pub prunes: u64,
}

impl CacheStats {
    /// Occupancy in [0, 1]
    pub fn utilization(&self) -> f64 {
        if self.max_flows == 0 {
            return 0.0;
        }
        f64::from(self.in_use) / f64::from(self.max_flows)
    }
}
