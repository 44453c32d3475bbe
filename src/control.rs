//! Per-protocol flow orchestration
//!
//! One `FlowControl` per worker owns a flow cache per tracked protocol
//! family plus the expect cache, and drives the per-packet state
//! machine: key build, cache get, first-sight session setup and
//! binding, expectation check, session processing, and collapse of
//! unidirectional half-flows once both sides have been seen.

use tracing::{debug, trace};

use crate::cache::{FlowCache, FlowId};
use crate::config::FlowConfig;
use crate::expect::{ExpectCache, ExpectMode, ExpectStats};
use crate::flow::{FlowData, FlowFlags, IgnoreDirection, Protocol, ReleaseReason, Session};
use crate::key::FlowKey;
use crate::packet::Packet;
use crate::stats::{CacheStats, FlowCounts};
use crate::{FlowError, Result};

use std::net::IpAddr;

/// Builds a fresh session object for a newly sighted flow
pub type SessionFactory = Box<dyn Fn() -> Box<dyn Session>>;

/// Policy/rule attachment for new flows, supplied by the host engine
///
/// Called once when the flow is first sighted and once more after the
/// first packet has been inspected.
pub trait FlowBinder {
    /// First-sight binding, before any inspection
    fn bind(&self, flow: &mut crate::flow::Flow);

    /// Post-inspection binding, after the first packet was processed
    fn bind_packet(&self, flow: &mut crate::flow::Flow, pkt: &Packet);
}

/// Binder that attaches nothing
pub struct NullBinder;

impl FlowBinder for NullBinder {
    fn bind(&self, _flow: &mut crate::flow::Flow) {}
    fn bind_packet(&self, _flow: &mut crate::flow::Flow, _pkt: &Packet) {}
}

/// Quiesce hook for active responses (packet injection) around the
/// housekeeping sweep, so no response is emitted on behalf of a flow
/// being torn down
pub trait ActiveControl {
    fn suspend(&mut self);
    fn resume(&mut self);
}

struct NullActive;

impl ActiveControl for NullActive {
    fn suspend(&mut self) {}
    fn resume(&mut self) {}
}

struct ProtoCache {
    cache: FlowCache,
    factory: SessionFactory,
}

/// Per-worker flow orchestrator
pub struct FlowControl {
    tcp: Option<ProtoCache>,
    udp: Option<ProtoCache>,
    icmp: Option<ProtoCache>,
    ip: Option<ProtoCache>,
    exp: Option<ExpectCache>,
    binder: Box<dyn FlowBinder>,
    active: Box<dyn ActiveControl>,
    counts: FlowCounts,
}

impl FlowControl {
    /// Orchestrator with no caches configured yet
    pub fn new(binder: Box<dyn FlowBinder>) -> Self {
        Self {
            tcp: None,
            udp: None,
            icmp: None,
            ip: None,
            exp: None,
            binder,
            active: Box::new(NullActive),
            counts: FlowCounts::default(),
        }
    }

    /// Install the active-response quiesce hook
    pub fn set_active_control(&mut self, active: Box<dyn ActiveControl>) {
        self.active = active;
    }

    //---------------------------------------------------------------
    // init
    //---------------------------------------------------------------

    /// Configure TCP tracking; `max_sessions` of 0 leaves it disabled
    pub fn init_tcp(&mut self, config: &FlowConfig, factory: SessionFactory) {
        self.tcp = Self::init_cache(Protocol::Tcp, config, factory);
    }

    /// Configure UDP tracking
    pub fn init_udp(&mut self, config: &FlowConfig, factory: SessionFactory) {
        self.udp = Self::init_cache(Protocol::Udp, config, factory);
    }

    /// Configure ICMP tracking; when disabled, ICMP packets fall back
    /// to the IP cache
    pub fn init_icmp(&mut self, config: &FlowConfig, factory: SessionFactory) {
        self.icmp = Self::init_cache(Protocol::Icmp, config, factory);
    }

    /// Configure IP-other tracking
    pub fn init_ip(&mut self, config: &FlowConfig, factory: SessionFactory) {
        self.ip = Self::init_cache(Protocol::Ip, config, factory);
    }

    /// Size the expectation pool off the TCP and UDP budgets
    pub fn init_exp(&mut self, tcp: &FlowConfig, udp: &FlowConfig) {
        let mut max = (tcp.max_sessions as usize + udp.max_sessions as usize) >> 9;
        if max == 0 {
            max = 2;
        }
        self.exp = Some(ExpectCache::new(max));
    }

    fn init_cache(
        proto: Protocol,
        config: &FlowConfig,
        factory: SessionFactory,
    ) -> Option<ProtoCache> {
        if !config.enabled() {
            debug!(proto = %proto, "flow tracking disabled");
            return None;
        }
        Some(ProtoCache {
            cache: FlowCache::new(proto, config),
            factory,
        })
    }

    //---------------------------------------------------------------
    // packet path
    //---------------------------------------------------------------

    /// Track a TCP packet
    pub fn process_tcp(&mut self, pkt: &Packet) {
        if let Some(pc) = self.tcp.as_mut() {
            let news = process_packet(pc, self.exp.as_mut(), self.binder.as_ref(), pkt);
            self.counts.add(Protocol::Tcp, news);
        }
    }

    /// Track a UDP packet
    pub fn process_udp(&mut self, pkt: &Packet) {
        if let Some(pc) = self.udp.as_mut() {
            let news = process_packet(pc, self.exp.as_mut(), self.binder.as_ref(), pkt);
            self.counts.add(Protocol::Udp, news);
        }
    }

    /// Track an ICMP packet; without a dedicated ICMP cache it is
    /// tracked as a degenerate IP flow instead
    pub fn process_icmp(&mut self, pkt: &Packet) {
        if let Some(pc) = self.icmp.as_mut() {
            let news = process_packet(pc, self.exp.as_mut(), self.binder.as_ref(), pkt);
            self.counts.add(Protocol::Icmp, news);
        } else {
            self.process_ip(pkt);
        }
    }

    /// Track any other IP packet
    pub fn process_ip(&mut self, pkt: &Packet) {
        if let Some(pc) = self.ip.as_mut() {
            let news = process_packet(pc, self.exp.as_mut(), self.binder.as_ref(), pkt);
            self.counts.add(Protocol::Ip, news);
        }
    }

    //---------------------------------------------------------------
    // expected flows
    //---------------------------------------------------------------

    /// Pre-register a future flow with a direction hint. `src_port` of
    /// None matches any source port.
    #[allow(clippy::too_many_arguments)]
    pub fn add_expected(
        &mut self,
        src_ip: IpAddr,
        src_port: Option<u16>,
        dst_ip: IpAddr,
        dst_port: u16,
        protocol: u8,
        direction: IgnoreDirection,
        persist: bool,
        data: Box<dyn FlowData>,
        now: u64,
    ) -> Result<()> {
        let Some(exp) = self.exp.as_mut() else {
            return Err(FlowError::ExpectDisabled);
        };
        exp.add_flow(
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            protocol,
            ExpectMode::Direction(direction),
            persist,
            data,
            now,
        )
    }

    /// Pre-register a future flow classified under an application id
    #[allow(clippy::too_many_arguments)]
    pub fn add_expected_app(
        &mut self,
        src_ip: IpAddr,
        src_port: Option<u16>,
        dst_ip: IpAddr,
        dst_port: u16,
        protocol: u8,
        app_id: i16,
        persist: bool,
        data: Box<dyn FlowData>,
        now: u64,
    ) -> Result<()> {
        let Some(exp) = self.exp.as_mut() else {
            return Err(FlowError::ExpectDisabled);
        };
        exp.add_flow(
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            protocol,
            ExpectMode::AppId(app_id),
            persist,
            data,
            now,
        )
    }

    /// Match a packet against pending expectations for an existing
    /// flow; applies the ignore hint and returns it so the caller can
    /// skip inspection
    pub fn expected_flow(&mut self, proto: Protocol, id: FlowId, pkt: &Packet) -> IgnoreDirection {
        let Some(exp) = self.exp.as_mut() else {
            return IgnoreDirection::None;
        };
        let pc = match proto {
            Protocol::Tcp => self.tcp.as_mut(),
            Protocol::Udp => self.udp.as_mut(),
            Protocol::Icmp => self.icmp.as_mut(),
            Protocol::Ip => self.ip.as_mut(),
        };
        let Some(pc) = pc else {
            return IgnoreDirection::None;
        };

        let flow = pc.cache.flow_mut(id);
        let ignore = exp.check(pkt, flow, pkt.timestamp);
        if ignore != IgnoreDirection::None {
            trace!(proto = %proto, "suppressing inspection for expected flow");
            flow.ignore_direction = ignore;
        }
        ignore
    }

    /// Would this packet match a pending expectation?
    pub fn is_expected(&self, pkt: &Packet) -> bool {
        self.exp
            .as_ref()
            .map(|e| e.is_expected(pkt, pkt.timestamp))
            .unwrap_or(false)
    }

    /// Expect cache counters, if initialized
    pub fn expect_stats(&self) -> Option<ExpectStats> {
        self.exp.as_ref().map(|e| e.stats())
    }

    //---------------------------------------------------------------
    // management surface
    //---------------------------------------------------------------

    /// Lookup without creation, routed by the key's protocol
    pub fn find_flow(&self, key: &FlowKey) -> Option<FlowId> {
        self.cache(Protocol::from_ip_proto(key.protocol()))
            .and_then(|c| c.find(key))
    }

    /// Remove the flow for `key`, mirroring a high-availability peer
    pub fn delete_flow(&mut self, key: &FlowKey) {
        let proto = Protocol::from_ip_proto(key.protocol());
        if let Some(cache) = self.cache_mut(proto) {
            if let Some(id) = cache.find(key) {
                cache.release(id, ReleaseReason::HaSync);
            }
        }
    }

    /// Explicitly release one flow
    pub fn release_flow(&mut self, proto: Protocol, id: FlowId, reason: ReleaseReason) {
        if let Some(cache) = self.cache_mut(proto) {
            cache.release(id, reason);
        }
    }

    /// Release every flow tracked for a protocol
    pub fn purge_flows(&mut self, proto: Protocol) -> u32 {
        self.cache_mut(proto).map(|c| c.purge()).unwrap_or(0)
    }

    /// Pressure-relief entry point: stale pass first, then forced
    /// eviction, protecting the in-flight flow
    pub fn prune_flows(&mut self, proto: Protocol, now: u64, protect: Option<FlowId>) {
        if let Some(cache) = self.cache_mut(proto) {
            if !cache.prune_stale(now, protect) {
                cache.prune_excess(true, protect);
            }
        }
    }

    /// Budgeted idle sweep across TCP, UDP, then IP. ICMP flows need
    /// no idle cleanup. Active responses are suspended for the
    /// duration.
    pub fn timeout_flows(&mut self, budget: u32, now: u64) -> u32 {
        self.active.suspend();

        let mut released = 0;
        if let Some(pc) = self.tcp.as_mut() {
            released += pc.cache.timeout(budget, now);
        }
        if let Some(pc) = self.udp.as_mut() {
            released += pc.cache.timeout(budget, now);
        }
        if let Some(pc) = self.ip.as_mut() {
            released += pc.cache.timeout(budget, now);
        }

        self.active.resume();
        released
    }

    /// Configured capacity for a protocol (0 when untracked)
    pub fn max_flows(&self, proto: Protocol) -> u32 {
        self.cache(proto).map(|c| c.max_flows()).unwrap_or(0)
    }

    /// Eviction count for a protocol
    pub fn get_prunes(&self, proto: Protocol) -> u64 {
        self.cache(proto).map(|c| c.prunes()).unwrap_or(0)
    }

    /// Zero a protocol's eviction counter
    pub fn reset_prunes(&mut self, proto: Protocol) {
        if let Some(cache) = self.cache_mut(proto) {
            cache.reset_prunes();
        }
    }

    /// New-flow count for a protocol (worker-local)
    pub fn get_flow_count(&self, proto: Protocol) -> u64 {
        self.counts.get(proto)
    }

    /// Zero all new-flow counters
    pub fn clear_flow_counts(&mut self) {
        self.counts.clear();
    }

    /// Snapshot of one cache's counters
    pub fn cache_stats(&self, proto: Protocol) -> Option<CacheStats> {
        self.cache(proto).map(|c| c.stats())
    }

    /// The cache tracking a protocol family, if enabled
    pub fn cache(&self, proto: Protocol) -> Option<&FlowCache> {
        let pc = match proto {
            Protocol::Tcp => self.tcp.as_ref(),
            Protocol::Udp => self.udp.as_ref(),
            Protocol::Icmp => self.icmp.as_ref(),
            Protocol::Ip => self.ip.as_ref(),
        };
        pc.map(|pc| &pc.cache)
    }

    /// Mutable cache access
    pub fn cache_mut(&mut self, proto: Protocol) -> Option<&mut FlowCache> {
        let pc = match proto {
            Protocol::Tcp => self.tcp.as_mut(),
            Protocol::Udp => self.udp.as_mut(),
            Protocol::Icmp => self.icmp.as_mut(),
            Protocol::Ip => self.ip.as_mut(),
        };
        pc.map(|pc| &mut pc.cache)
    }
}

/// Per-packet state machine. Returns 1 when a new flow finished setup.
fn process_packet(
    pc: &mut ProtoCache,
    exp: Option<&mut ExpectCache>,
    binder: &dyn FlowBinder,
    pkt: &Packet,
) -> u64 {
    let key = FlowKey::from_packet(pkt);

    let Some(id) = pc.cache.get(&key, pkt.timestamp, None) else {
        return 0;
    };

    let mut news = 0u64;
    if !pc.cache.flow(id).has_session() {
        let mut session = (pc.factory)();
        let flow = pc.cache.flow_mut(id);
        binder.bind(flow);
        if !session.setup(flow, pkt) {
            // Flow stays allocated; a later packet retries setup
            debug!("session setup failed, flow excluded from inspection");
            return 0;
        }
        flow.session = Some(session);
        news = 1;
    }

    if let Some(exp) = exp {
        let flow = pc.cache.flow_mut(id);
        let ignore = exp.check(pkt, flow, pkt.timestamp);
        if ignore != IgnoreDirection::None {
            flow.ignore_direction = ignore;
        }
    }

    // Orientation relative to the stored key marks which side spoke
    let forward = pc
        .cache
        .flow(id)
        .key()
        .map(|stored| key.same_orientation(stored))
        .unwrap_or(true);
    {
        let flow = pc.cache.flow_mut(id);
        if forward {
            flow.flags.set(FlowFlags::SEEN_CLIENT);
        } else {
            flow.flags.set(FlowFlags::SEEN_SERVER);
        }
    }

    if let Some(mut session) = pc.cache.flow_mut(id).session.take() {
        let flow = pc.cache.flow_mut(id);
        session.process(flow, pkt);
        flow.session = Some(session);
    }

    if news == 1 {
        binder.bind_packet(pc.cache.flow_mut(id), pkt);
    }

    if pc.cache.flow(id).on_uni_list() && pc.cache.flow(id).is_bidirectional() {
        pc.cache.unlink_uni(id);
    }

    news
}
