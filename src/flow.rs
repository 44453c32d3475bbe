//! Flow state and the seams to the inspection layer
//!
//! A `Flow` is one tracked conversation: session-state flags, the bound
//! session object, and any flow-data attached by inspectors or matched
//! expectations. Flows live in their cache's slot arena and are
//! recycled, never reallocated.

use std::any::Any;
use std::fmt;

use crate::key::FlowKey;
use crate::packet::{Packet, IPPROTO_ICMP, IPPROTO_ICMPV6, IPPROTO_TCP, IPPROTO_UDP};

/// Tracked protocol families, one flow cache each
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Protocol {
    Tcp,
    Udp,
    Icmp,
    /// Everything else, tracked at the IP layer
    Ip,
}

impl Protocol {
    /// Family for a raw IP protocol number
    pub fn from_ip_proto(proto: u8) -> Self {
        match proto {
            IPPROTO_TCP => Protocol::Tcp,
            IPPROTO_UDP => Protocol::Udp,
            IPPROTO_ICMP | IPPROTO_ICMPV6 => Protocol::Icmp,
            _ => Protocol::Ip,
        }
    }

    /// Static label for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            Protocol::Tcp => "tcp",
            Protocol::Udp => "udp",
            Protocol::Icmp => "icmp",
            Protocol::Ip => "ip",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Session-state flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[repr(transparent)]
pub struct FlowFlags(u16);

impl FlowFlags {
    /// Traffic seen from the initiating side
    pub const SEEN_CLIENT: u16 = 1 << 0;
    /// Traffic seen from the responding side
    pub const SEEN_SERVER: u16 = 1 << 1;
    /// Inspectors should keep looking at this flow after classification
    pub const CONTINUE_INSPECTION: u16 = 1 << 2;

    /// Check if flag is set
    #[inline(always)]
    pub const fn has(&self, flag: u16) -> bool {
        self.0 & flag != 0
    }

    /// Set flag
    #[inline(always)]
    pub fn set(&mut self, flag: u16) {
        self.0 |= flag;
    }

    /// Clear flag
    #[inline(always)]
    pub fn clear(&mut self, flag: u16) {
        self.0 &= !flag;
    }
}

/// Which direction(s) of a flow further inspection should skip
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum IgnoreDirection {
    /// Inspect both directions
    #[default]
    None,
    /// Skip client-to-server traffic
    FromClient,
    /// Skip server-to-client traffic
    FromServer,
    /// Skip the whole flow
    Both,
}

/// Why a flow was released back to the free pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReleaseReason {
    /// Idle past the stale-pruning timeout
    Stale,
    /// Evicted under capacity pressure
    Excess,
    /// Idle past the nominal timeout (housekeeping sweep)
    Timeout,
    /// Cache shutdown or config reload
    Purge,
    /// Explicit teardown by the owner
    Explicit,
    /// Removed to mirror a high-availability peer
    HaSync,
}

impl ReleaseReason {
    /// True for the eviction-shaped reasons counted as prunes
    pub fn is_prune(&self) -> bool {
        matches!(
            self,
            ReleaseReason::Stale | ReleaseReason::Excess | ReleaseReason::Timeout
        )
    }

    /// Static label for logs and metrics
    pub fn name(&self) -> &'static str {
        match self {
            ReleaseReason::Stale => "stale",
            ReleaseReason::Excess => "excess",
            ReleaseReason::Timeout => "timeout",
            ReleaseReason::Purge => "purge",
            ReleaseReason::Explicit => "explicit",
            ReleaseReason::HaSync => "ha_sync",
        }
    }
}

impl fmt::Display for ReleaseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Protocol session state machine bound to a flow
///
/// Implemented by the external inspection layer and constructed through
/// the factory supplied at cache init.
pub trait Session {
    /// First-packet setup; false aborts processing for this packet and
    /// leaves the flow unbound for a later retry
    fn setup(&mut self, flow: &mut Flow, pkt: &Packet) -> bool;

    /// Per-packet processing
    fn process(&mut self, flow: &mut Flow, pkt: &Packet);
}

/// Opaque per-flow attachment owned by an inspector
///
/// Expectations deliver these to the flow they pre-authorized;
/// inspectors retrieve their own record by id and downcast.
pub trait FlowData: Any {
    /// Inspector-chosen discriminator
    fn id(&self) -> u32;

    /// Downcast support
    fn as_any(&self) -> &dyn Any;

    /// Mutable downcast support
    fn as_any_mut(&mut self) -> &mut dyn Any;

    /// Clone into a new box; persistent expectations hand a copy to
    /// each matched flow
    fn boxed_clone(&self) -> Box<dyn FlowData>;
}

/// One tracked conversation
pub struct Flow {
    /// Owning protocol family
    pub protocol: Protocol,
    /// Session-state flags
    pub flags: FlowFlags,
    /// Direction suppression applied by expectation matches
    pub ignore_direction: IgnoreDirection,
    /// Application id inherited from an appid expectation
    pub application_id: Option<i16>,
    /// Bound session, None until first sight
    pub session: Option<Box<dyn Session>>,
    /// Last-seen packet time, epoch seconds
    pub last_seen: u64,
    pub(crate) key: Option<FlowKey>,
    pub(crate) data: Vec<Box<dyn FlowData>>,
    // Uni-list linkage, owned by the cache
    pub(crate) uni_prev: Option<u32>,
    pub(crate) uni_next: Option<u32>,
    pub(crate) on_uni_list: bool,
}

impl Flow {
    pub(crate) fn empty(protocol: Protocol) -> Self {
        Self {
            protocol,
            flags: FlowFlags::default(),
            ignore_direction: IgnoreDirection::None,
            application_id: None,
            session: None,
            last_seen: 0,
            key: None,
            data: Vec::new(),
            uni_prev: None,
            uni_next: None,
            on_uni_list: false,
        }
    }

    /// Reinitialize a recycled slot under a new key
    pub(crate) fn reset(&mut self, key: FlowKey, now: u64) {
        self.flags = FlowFlags::default();
        self.ignore_direction = IgnoreDirection::None;
        self.application_id = None;
        self.session = None;
        self.last_seen = now;
        self.key = Some(key);
        self.data.clear();
    }

    /// Tear down session and attachments on release
    pub(crate) fn teardown(&mut self) {
        self.session = None;
        self.data.clear();
        self.key = None;
        self.flags = FlowFlags::default();
        self.ignore_direction = IgnoreDirection::None;
        self.application_id = None;
    }

    /// Key this flow is filed under (first-seen orientation)
    pub fn key(&self) -> Option<&FlowKey> {
        self.key.as_ref()
    }

    /// A session has been bound
    pub fn has_session(&self) -> bool {
        self.session.is_some()
    }

    /// Traffic seen from both sides
    pub fn is_bidirectional(&self) -> bool {
        self.flags.has(FlowFlags::SEEN_CLIENT) && self.flags.has(FlowFlags::SEEN_SERVER)
    }

    /// Still linked on the cache's unidirectional list
    pub fn on_uni_list(&self) -> bool {
        self.on_uni_list
    }

    /// Attach (or replace) a flow-data record
    pub fn set_data(&mut self, data: Box<dyn FlowData>) {
        let id = data.id();
        self.data.retain(|d| d.id() != id);
        self.data.push(data);
    }

    /// Look up an attachment by inspector id
    pub fn get_data(&self, id: u32) -> Option<&dyn FlowData> {
        self.data.iter().find(|d| d.id() == id).map(|d| d.as_ref())
    }

    /// Mutable attachment lookup
    pub fn get_data_mut(&mut self, id: u32) -> Option<&mut (dyn FlowData + 'static)> {
        self.data
            .iter_mut()
            .find(|d| d.id() == id)
            .map(|d| d.as_mut())
    }
}

impl fmt::Debug for Flow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Flow")
            .field("protocol", &self.protocol)
            .field("flags", &self.flags)
            .field("ignore_direction", &self.ignore_direction)
            .field("has_session", &self.has_session())
            .field("last_seen", &self.last_seen)
            .field("key", &self.key)
            .field("data", &self.data.len())
            .finish()
    }
}
