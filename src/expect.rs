//! Expected-flow ("pinhole") cache
//!
//! Protocol inspectors that watch a control channel negotiate a
//! secondary channel in-band (FTP data, SIP media, RTP/RTCP pairs) can
//! pre-register the anticipated tuple here. When a packet matching a
//! pending expectation arrives, the prepared flow-data and direction
//! hints are attached to the real flow instead of it starting life
//! unclassified.
//!
//! The pool is bounded and driven by untrusted protocol content:
//! registration fails softly at capacity, and expired records are
//! reclaimed before rejecting.

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;

use metrics::counter;
use tracing::{debug, trace};

use crate::flow::{Flow, FlowData, IgnoreDirection};
use crate::packet::Packet;
use crate::{FlowError, Result};

/// Seconds an expectation stays matchable
pub const DEFAULT_EXPECT_TTL: u64 = 300;

/// What a matched expectation applies to the flow
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExpectMode {
    /// Suppress inspection of the given direction(s)
    Direction(IgnoreDirection),
    /// Classify the flow under an application id
    AppId(i16),
}

/// Registration predicate: full tuple, optionally wildcarding the
/// source port (responder-only registrations)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
struct ExpectKey {
    src_ip: IpAddr,
    src_port: Option<u16>,
    dst_ip: IpAddr,
    dst_port: u16,
    protocol: u8,
}

struct Expectation {
    mode: ExpectMode,
    data: Box<dyn FlowData>,
    expires: u64,
    persist: bool,
}

/// Expect cache counters
#[derive(Debug, Clone, Copy, Default)]
pub struct ExpectStats {
    /// Successful registrations
    pub adds: u64,
    /// Expectations consumed or matched
    pub matches: u64,
    /// Registrations rejected at capacity
    pub rejects: u64,
    /// Records dropped past their expiry
    pub expired: u64,
    /// Currently outstanding records
    pub pending: usize,
}

/// Bounded pool of expected-flow registrations
pub struct ExpectCache {
    capacity: usize,
    ttl: u64,
    table: HashMap<ExpectKey, VecDeque<Expectation>>,
    count: usize,
    adds: u64,
    matches: u64,
    rejects: u64,
    expired: u64,
}

impl ExpectCache {
    /// Pool holding at most `capacity` outstanding expectations
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            ttl: DEFAULT_EXPECT_TTL,
            table: HashMap::with_capacity(capacity),
            count: 0,
            adds: 0,
            matches: 0,
            rejects: 0,
            expired: 0,
        }
    }

    /// Override the expectation lifetime
    pub fn with_ttl(mut self, ttl: u64) -> Self {
        self.ttl = ttl;
        self
    }

    /// Register an expectation. `src_port` of None matches any source
    /// port (the registering inspector only knows the responder side).
    /// Fails softly when the pool is full and nothing expired can be
    /// reclaimed.
    #[allow(clippy::too_many_arguments)]
    pub fn add_flow(
        &mut self,
        src_ip: IpAddr,
        src_port: Option<u16>,
        dst_ip: IpAddr,
        dst_port: u16,
        protocol: u8,
        mode: ExpectMode,
        persist: bool,
        data: Box<dyn FlowData>,
        now: u64,
    ) -> Result<()> {
        if self.count >= self.capacity && self.reclaim_expired(now) == 0 {
            self.rejects += 1;
            counter!("flowtrack_expect_rejects_total").increment(1);
            return Err(FlowError::ExpectCacheFull {
                capacity: self.capacity,
            });
        }

        let key = ExpectKey {
            src_ip,
            src_port,
            dst_ip,
            dst_port,
            protocol,
        };
        self.table.entry(key).or_default().push_back(Expectation {
            mode,
            data,
            expires: now + self.ttl,
            persist,
        });
        self.count += 1;
        self.adds += 1;

        debug!(
            src = %src_ip,
            dst = %dst_ip,
            dst_port,
            protocol,
            persist,
            "expectation registered"
        );
        Ok(())
    }

    /// Match `pkt` against outstanding expectations. On match the
    /// record's flow-data and hints are applied to `flow` and the
    /// record is consumed unless persistent. Returns the direction(s)
    /// the caller should stop inspecting.
    pub fn check(&mut self, pkt: &Packet, flow: &mut Flow, now: u64) -> IgnoreDirection {
        if self.count == 0 {
            return IgnoreDirection::None;
        }

        for key in Self::candidates(pkt) {
            let Some(queue) = self.table.get_mut(&key) else {
                continue;
            };

            // Skip over records that expired while waiting
            let mut hit = None;
            while let Some(exp) = queue.pop_front() {
                if exp.expires < now {
                    self.expired += 1;
                    self.count -= 1;
                    continue;
                }
                hit = Some(exp);
                break;
            }

            let Some(exp) = hit else {
                if queue.is_empty() {
                    self.table.remove(&key);
                }
                continue;
            };

            let ignore = match exp.mode {
                ExpectMode::Direction(dir) => dir,
                ExpectMode::AppId(app_id) => {
                    flow.application_id = Some(app_id);
                    IgnoreDirection::None
                }
            };
            if ignore != IgnoreDirection::None {
                flow.ignore_direction = ignore;
            }

            if exp.persist {
                flow.set_data(exp.data.boxed_clone());
                if let Some(q) = self.table.get_mut(&key) {
                    q.push_front(exp);
                }
            } else {
                flow.set_data(exp.data);
                self.count -= 1;
                if self
                    .table
                    .get(&key)
                    .map(|q| q.is_empty())
                    .unwrap_or(false)
                {
                    self.table.remove(&key);
                }
            }

            self.matches += 1;
            trace!(src = %pkt.src_ip, dst = %pkt.dst_ip, "expectation matched");
            return ignore;
        }

        IgnoreDirection::None
    }

    /// Pure predicate: would `pkt` match a live expectation?
    pub fn is_expected(&self, pkt: &Packet, now: u64) -> bool {
        if self.count == 0 {
            return false;
        }
        Self::candidates(pkt).into_iter().any(|key| {
            self.table
                .get(&key)
                .map(|q| q.iter().any(|e| e.expires >= now))
                .unwrap_or(false)
        })
    }

    /// Outstanding record count
    pub fn len(&self) -> usize {
        self.count
    }

    /// No outstanding records
    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// Counter snapshot
    pub fn stats(&self) -> ExpectStats {
        ExpectStats {
            adds: self.adds,
            matches: self.matches,
            rejects: self.rejects,
            expired: self.expired,
            pending: self.count,
        }
    }

    /// Drop expired records; returns how many were reclaimed
    fn reclaim_expired(&mut self, now: u64) -> usize {
        let mut reclaimed = 0;
        self.table.retain(|_, queue| {
            queue.retain(|e| {
                if e.expires < now {
                    reclaimed += 1;
                    false
                } else {
                    true
                }
            });
            !queue.is_empty()
        });
        self.count -= reclaimed;
        self.expired += reclaimed as u64;
        reclaimed
    }

    /// Lookup keys for a packet: exact then wildcard source port, in
    /// both orientations (the expected flow may be seen responder
    /// first)
    fn candidates(pkt: &Packet) -> [ExpectKey; 4] {
        [
            ExpectKey {
                src_ip: pkt.src_ip,
                src_port: Some(pkt.src_port),
                dst_ip: pkt.dst_ip,
                dst_port: pkt.dst_port,
                protocol: pkt.ip_proto,
            },
            ExpectKey {
                src_ip: pkt.src_ip,
                src_port: None,
                dst_ip: pkt.dst_ip,
                dst_port: pkt.dst_port,
                protocol: pkt.ip_proto,
            },
            ExpectKey {
                src_ip: pkt.dst_ip,
                src_port: Some(pkt.dst_port),
                dst_ip: pkt.src_ip,
                dst_port: pkt.src_port,
                protocol: pkt.ip_proto,
            },
            ExpectKey {
                src_ip: pkt.dst_ip,
                src_port: None,
                dst_ip: pkt.src_ip,
                dst_port: pkt.src_port,
                protocol: pkt.ip_proto,
            },
        ]
    }
}
