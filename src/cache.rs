//! Bounded flow cache
//!
//! Fixed arena of flow slots indexed by a free list, a key index, and
//! an intrusive list of flows still seen in only one direction. No
//! per-flow heap churn on the hot path; worst-case memory is set at
//! construction.
//!
//! Eviction tries age first (the common case: idle flows expiring) and
//! falls back to capacity pressure, always guaranteeing a slot for the
//! in-flight packet. Victims are picked oldest-last-seen first; ties
//! break to the lowest slot index.

use std::collections::HashMap;

use metrics::counter;
use tracing::{debug, trace};

use crate::config::FlowConfig;
use crate::flow::{Flow, Protocol, ReleaseReason};
use crate::key::FlowKey;
use crate::stats::CacheStats;

/// Flows released per aggressive excess-prune call
const EXCESS_PRUNE_BATCH: u32 = 5;

/// Handle to a flow slot inside one cache's arena
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FlowId(pub(crate) u32);

impl FlowId {
    /// Slot index within the owning cache
    pub fn index(&self) -> usize {
        self.0 as usize
    }
}

struct Slot {
    flow: Flow,
    in_use: bool,
}

/// Bounded, keyed store of flows for one protocol family
pub struct FlowCache {
    protocol: Protocol,
    slots: Vec<Slot>,
    free: Vec<u32>,
    index: HashMap<FlowKey, u32>,
    uni_head: Option<u32>,
    uni_tail: Option<u32>,
    pruning_timeout: u64,
    nominal_timeout: u64,
    prunes: u64,
}

impl FlowCache {
    /// Allocate the full slot arena up front
    pub fn new(protocol: Protocol, config: &FlowConfig) -> Self {
        let max = config.max_sessions as usize;
        let mut slots = Vec::with_capacity(max);
        for _ in 0..max {
            slots.push(Slot {
                flow: Flow::empty(protocol),
                in_use: false,
            });
        }
        // Highest index popped first: fresh caches fill from slot 0 up
        let free: Vec<u32> = (0..max as u32).rev().collect();

        Self {
            protocol,
            slots,
            free,
            index: HashMap::with_capacity(max),
            uni_head: None,
            uni_tail: None,
            pruning_timeout: config.pruning_timeout,
            nominal_timeout: config.nominal_timeout,
            prunes: 0,
        }
    }

    /// Existing flow for `key` (either direction) or a freshly
    /// initialized one. None only when capacity is zero or eviction
    /// cannot free a slot without touching `protect`.
    pub fn get(&mut self, key: &FlowKey, now: u64, protect: Option<FlowId>) -> Option<FlowId> {
        if self.slots.is_empty() {
            return None;
        }

        if let Some(&idx) = self.index.get(key) {
            self.slots[idx as usize].flow.last_seen = now;
            trace!(proto = %self.protocol, slot = idx, "flow cache hit");
            return Some(FlowId(idx));
        }

        if self.free.is_empty() && !self.prune_stale(now, protect) {
            // Not enough idle flows: force out the oldest
            self.prune_excess(false, protect);
        }

        let idx = self.free.pop()?;
        let slot = &mut self.slots[idx as usize];
        slot.in_use = true;
        slot.flow.reset(*key, now);
        self.index.insert(*key, idx);
        self.link_uni(idx);

        debug!(proto = %self.protocol, slot = idx, "flow created");
        Some(FlowId(idx))
    }

    /// Lookup without creation
    pub fn find(&self, key: &FlowKey) -> Option<FlowId> {
        self.index.get(key).map(|&idx| FlowId(idx))
    }

    /// Borrow a tracked flow
    pub fn flow(&self, id: FlowId) -> &Flow {
        &self.slots[id.index()].flow
    }

    /// Mutably borrow a tracked flow
    pub fn flow_mut(&mut self, id: FlowId) -> &mut Flow {
        &mut self.slots[id.index()].flow
    }

    /// Tear down the flow and return its slot to the free pool
    pub fn release(&mut self, id: FlowId, reason: ReleaseReason) {
        let idx = id.index();
        if !self.slots[idx].in_use {
            return;
        }

        if let Some(key) = self.slots[idx].flow.key {
            self.index.remove(&key);
        }
        self.unlink_uni(id);

        let slot = &mut self.slots[idx];
        slot.flow.teardown();
        slot.in_use = false;
        self.free.push(id.0);

        if reason.is_prune() {
            self.prunes += 1;
            counter!(
                "flowtrack_flow_prunes_total",
                "proto" => self.protocol.name(),
                "reason" => reason.name()
            )
            .increment(1);
        }
        debug!(proto = %self.protocol, slot = id.0, reason = %reason, "flow released");
    }

    /// Release every live flow (shutdown / config reload)
    pub fn purge(&mut self) -> u32 {
        let mut purged = 0;
        for idx in 0..self.slots.len() as u32 {
            if self.slots[idx as usize].in_use {
                self.release(FlowId(idx), ReleaseReason::Purge);
                purged += 1;
            }
        }
        purged
    }

    /// Release flows idle past the stale-pruning timeout, never
    /// touching `protect`. True if anything was released.
    pub fn prune_stale(&mut self, now: u64, protect: Option<FlowId>) -> bool {
        let mut pruned = 0;
        for idx in 0..self.slots.len() as u32 {
            let id = FlowId(idx);
            if Some(id) == protect || !self.slots[idx as usize].in_use {
                continue;
            }
            let last = self.slots[idx as usize].flow.last_seen;
            if now.saturating_sub(last) > self.pruning_timeout {
                self.release(id, ReleaseReason::Stale);
                pruned += 1;
            }
        }
        pruned > 0
    }

    /// Evict by oldest-last-seen until a slot is free (aggressive:
    /// up to a small batch), never touching `protect`. Guarantees
    /// forward progress for the in-flight packet even when nothing is
    /// stale. True if anything was released.
    pub fn prune_excess(&mut self, aggressive: bool, protect: Option<FlowId>) -> bool {
        let target = if aggressive { EXCESS_PRUNE_BATCH } else { 1 };
        let mut released = 0;

        while released < target {
            let Some(victim) = self.oldest(protect) else {
                break;
            };
            self.release(victim, ReleaseReason::Excess);
            released += 1;
            if !aggressive && !self.free.is_empty() {
                break;
            }
        }
        released > 0
    }

    /// Budgeted housekeeping sweep: release up to `budget` flows idle
    /// past the nominal timeout. Returns the number released.
    pub fn timeout(&mut self, budget: u32, now: u64) -> u32 {
        let mut released = 0;
        for idx in 0..self.slots.len() as u32 {
            if released >= budget {
                break;
            }
            if !self.slots[idx as usize].in_use {
                continue;
            }
            let last = self.slots[idx as usize].flow.last_seen;
            if now.saturating_sub(last) > self.nominal_timeout {
                self.release(FlowId(idx), ReleaseReason::Timeout);
                released += 1;
            }
        }
        released
    }

    /// Detach a flow from the unidirectional list once both directions
    /// have been seen
    pub fn unlink_uni(&mut self, id: FlowId) {
        let idx = id.index();
        if !self.slots[idx].flow.on_uni_list {
            return;
        }
        let prev = self.slots[idx].flow.uni_prev;
        let next = self.slots[idx].flow.uni_next;

        match prev {
            Some(p) => self.slots[p as usize].flow.uni_next = next,
            None => self.uni_head = next,
        }
        match next {
            Some(n) => self.slots[n as usize].flow.uni_prev = prev,
            None => self.uni_tail = prev,
        }

        let flow = &mut self.slots[idx].flow;
        flow.uni_prev = None;
        flow.uni_next = None;
        flow.on_uni_list = false;
    }

    /// Configured capacity
    pub fn max_flows(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Flows evicted so far (stale + excess + timeout)
    pub fn prunes(&self) -> u64 {
        self.prunes
    }

    /// Zero the eviction counter
    pub fn reset_prunes(&mut self) {
        self.prunes = 0;
    }

    /// Live flow count
    pub fn len(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// No live flows
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Counter snapshot
    pub fn stats(&self) -> CacheStats {
        CacheStats {
            protocol: self.protocol,
            max_flows: self.max_flows(),
            in_use: self.len() as u32,
            prunes: self.prunes,
        }
    }

    fn link_uni(&mut self, idx: u32) {
        let old_head = self.uni_head;
        {
            let flow = &mut self.slots[idx as usize].flow;
            flow.on_uni_list = true;
            flow.uni_prev = None;
            flow.uni_next = old_head;
        }
        if let Some(h) = old_head {
            self.slots[h as usize].flow.uni_prev = Some(idx);
        } else {
            self.uni_tail = Some(idx);
        }
        self.uni_head = Some(idx);
    }

    /// Oldest live flow by (last_seen, slot index), skipping `protect`
    fn oldest(&self, protect: Option<FlowId>) -> Option<FlowId> {
        let mut best: Option<(u64, u32)> = None;
        for idx in 0..self.slots.len() as u32 {
            if Some(FlowId(idx)) == protect || !self.slots[idx as usize].in_use {
                continue;
            }
            let last = self.slots[idx as usize].flow.last_seen;
            match best {
                Some((bl, _)) if bl <= last => {}
                _ => best = Some((last, idx)),
            }
        }
        best.map(|(_, idx)| FlowId(idx))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::Packet;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip(v: u32) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(v))
    }

    fn tcp_key(src: u32, sp: u16, dst: u32, dp: u16, ts: u64) -> (FlowKey, u64) {
        let p = Packet::tcp(ip(src), sp, ip(dst), dp, ts);
        (FlowKey::from_packet(&p), ts)
    }

    fn cache(max: u32) -> FlowCache {
        FlowCache::new(Protocol::Tcp, &FlowConfig::with_max_sessions(max))
    }

    #[test]
    fn test_get_both_directions_same_flow() {
        let mut c = cache(8);
        let p = Packet::tcp(ip(1), 40000, ip(2), 80, 10);

        let fwd = c.get(&FlowKey::from_packet(&p), 10, None).unwrap();
        let rev = c
            .get(&FlowKey::from_packet(&p.reverse()), 11, None)
            .unwrap();

        assert_eq!(fwd, rev);
        assert_eq!(c.len(), 1);
        assert_eq!(c.flow(fwd).last_seen, 11);
    }

    #[test]
    fn test_no_eviction_within_capacity() {
        let mut c = cache(4);
        for i in 0..4 {
            let (k, ts) = tcp_key(100 + i, 1000, 200, 80, u64::from(i));
            assert!(c.get(&k, ts, None).is_some());
        }
        assert_eq!(c.len(), 4);
        assert_eq!(c.prunes(), 0);
    }

    #[test]
    fn test_capacity_evicts_oldest() {
        let mut c = cache(2);
        let (k1, _) = tcp_key(1, 1000, 9, 80, 0);
        let (k2, _) = tcp_key(2, 1000, 9, 80, 0);
        let (k3, _) = tcp_key(3, 1000, 9, 80, 0);

        c.get(&k1, 10, None).unwrap();
        c.get(&k2, 20, None).unwrap();
        let id3 = c.get(&k3, 30, None);

        assert!(id3.is_some());
        assert!(c.find(&k1).is_none(), "oldest flow should be evicted");
        assert!(c.find(&k2).is_some());
        assert_eq!(c.prunes(), 1);
    }

    #[test]
    fn test_eviction_tie_break_lowest_slot() {
        let mut c = cache(2);
        let (k1, _) = tcp_key(1, 1000, 9, 80, 0);
        let (k2, _) = tcp_key(2, 1000, 9, 80, 0);
        let (k3, _) = tcp_key(3, 1000, 9, 80, 0);

        // Same last-seen on both: the lower slot index loses
        let id1 = c.get(&k1, 50, None).unwrap();
        let id2 = c.get(&k2, 50, None).unwrap();
        assert!(id1.index() < id2.index());

        c.get(&k3, 51, None).unwrap();
        assert!(c.find(&k1).is_none());
        assert!(c.find(&k2).is_some());
    }

    #[test]
    fn test_protect_never_evicted() {
        let mut c = cache(1);
        let (k1, _) = tcp_key(1, 1000, 9, 80, 0);
        let (k2, _) = tcp_key(2, 1000, 9, 80, 0);

        let id1 = c.get(&k1, 10, None).unwrap();

        // Sole candidate is protected: get must fail rather than evict it
        assert!(c.get(&k2, 20, Some(id1)).is_none());
        assert!(c.find(&k1).is_some());

        // Unprotected, the slot is reclaimed
        assert!(c.get(&k2, 20, None).is_some());
        assert!(c.find(&k1).is_none());
    }

    #[test]
    fn test_release_then_find_absent() {
        let mut c = cache(4);
        let (k, _) = tcp_key(1, 1000, 9, 80, 0);
        let id = c.get(&k, 10, None).unwrap();

        c.release(id, ReleaseReason::Explicit);
        assert!(c.find(&k).is_none());
        assert_eq!(c.len(), 0);
        // Explicit release is not a prune
        assert_eq!(c.prunes(), 0);
    }

    #[test]
    fn test_prune_stale_respects_timeout() {
        let mut c = FlowCache::new(
            Protocol::Tcp,
            &FlowConfig {
                max_sessions: 4,
                pruning_timeout: 30,
                nominal_timeout: 3600,
            },
        );
        let (k1, _) = tcp_key(1, 1000, 9, 80, 0);
        let (k2, _) = tcp_key(2, 1000, 9, 80, 0);
        c.get(&k1, 100, None).unwrap();
        c.get(&k2, 150, None).unwrap();

        // At t=140 only k1 (idle 40s) is past the 30s pruning timeout
        assert!(c.prune_stale(140, None));
        assert!(c.find(&k1).is_none());
        assert!(c.find(&k2).is_some());

        assert!(!c.prune_stale(141, None));
    }

    #[test]
    fn test_timeout_sweep_budget() {
        let mut c = FlowCache::new(
            Protocol::Udp,
            &FlowConfig {
                max_sessions: 8,
                pruning_timeout: 30,
                nominal_timeout: 60,
            },
        );
        for i in 0..6 {
            let (k, _) = tcp_key(100 + i, 53, 200, 53, 0);
            c.get(&k, 0, None).unwrap();
        }

        // All 6 are idle past nominal timeout at t=1000 but the budget
        // caps the sweep
        assert_eq!(c.timeout(4, 1000), 4);
        assert_eq!(c.len(), 2);
        assert_eq!(c.timeout(4, 1000), 2);
        assert!(c.is_empty());
    }

    #[test]
    fn test_purge_releases_everything() {
        let mut c = cache(8);
        for i in 0..5 {
            let (k, _) = tcp_key(100 + i, 1000, 200, 80, 0);
            c.get(&k, 0, None).unwrap();
        }
        assert_eq!(c.purge(), 5);
        assert!(c.is_empty());
        assert_eq!(c.prunes(), 0, "purge is not a prune");
    }

    #[test]
    fn test_reset_prunes() {
        let mut c = cache(1);
        let (k1, _) = tcp_key(1, 1000, 9, 80, 0);
        let (k2, _) = tcp_key(2, 1000, 9, 80, 0);
        c.get(&k1, 10, None).unwrap();
        c.get(&k2, 20, None).unwrap();
        assert_eq!(c.prunes(), 1);

        c.reset_prunes();
        assert_eq!(c.prunes(), 0);
    }

    #[test]
    fn test_uni_list_link_and_unlink() {
        let mut c = cache(4);
        let (k1, _) = tcp_key(1, 1000, 9, 80, 0);
        let (k2, _) = tcp_key(2, 1000, 9, 80, 0);
        let id1 = c.get(&k1, 0, None).unwrap();
        let id2 = c.get(&k2, 0, None).unwrap();

        assert!(c.flow(id1).on_uni_list());
        assert!(c.flow(id2).on_uni_list());

        // Unlink the middle of the list, then the remaining one
        c.unlink_uni(id1);
        assert!(!c.flow(id1).on_uni_list());
        assert!(c.flow(id2).on_uni_list());

        c.unlink_uni(id2);
        assert!(!c.flow(id2).on_uni_list());
        assert_eq!(c.uni_head, None);
        assert_eq!(c.uni_tail, None);
    }

    #[test]
    fn test_released_slot_unlinked_from_uni() {
        let mut c = cache(4);
        let (k1, _) = tcp_key(1, 1000, 9, 80, 0);
        let (k2, _) = tcp_key(2, 1000, 9, 80, 0);
        let (k3, _) = tcp_key(3, 1000, 9, 80, 0);
        let id1 = c.get(&k1, 0, None).unwrap();
        let id2 = c.get(&k2, 0, None).unwrap();
        let id3 = c.get(&k3, 0, None).unwrap();

        // Release the middle record; list must stay consistent
        c.release(id2, ReleaseReason::Explicit);
        assert_eq!(c.uni_head, Some(id3.0));
        assert_eq!(c.uni_tail, Some(id1.0));
        assert_eq!(c.flow(id3).uni_next, Some(id1.0));
        assert_eq!(c.flow(id1).uni_prev, Some(id3.0));
    }

    #[test]
    fn test_zero_capacity_disabled() {
        let mut c = cache(0);
        let (k, _) = tcp_key(1, 1000, 9, 80, 0);
        assert!(c.get(&k, 0, None).is_none());
        assert_eq!(c.max_flows(), 0);
    }
}
