//! Canonical flow identity
//!
//! A `FlowKey` is built from the packet's own src/dst without forcing a
//! canonical ordering; equality and hashing are symmetric under
//! address-pair swap, so the cache matches both directions of one
//! conversation to the same entry.

use std::hash::{Hash, Hasher};
use std::net::IpAddr;

use crate::packet::{Packet, IPPROTO_ICMP, IPPROTO_ICMPV6};

/// Flow identity; shape selected by protocol/fragmentation
#[derive(Debug, Clone, Copy)]
pub enum FlowKey {
    /// 5-tuple shape (ICMP type rides in the source-port slot)
    Ports(PortsKey),
    /// Fragment shape: ports are not meaningful, IP id stands in
    Fragment(FragmentKey),
}

/// 5-tuple key fields
#[derive(Debug, Clone, Copy)]
pub struct PortsKey {
    pub src_ip: IpAddr,
    pub src_port: u16,
    pub dst_ip: IpAddr,
    pub dst_port: u16,
    pub protocol: u8,
    pub vlan_id: u16,
    pub mpls_label: u32,
    pub address_space: u16,
}

/// Fragment key fields
#[derive(Debug, Clone, Copy)]
pub struct FragmentKey {
    pub src_ip: IpAddr,
    pub dst_ip: IpAddr,
    pub ip_id: u16,
    pub protocol: u8,
    pub vlan_id: u16,
    pub mpls_label: u32,
    pub address_space: u16,
}

impl FlowKey {
    /// Build the key for a decoded packet. Total: every decodable
    /// packet yields a key.
    pub fn from_packet(p: &Packet) -> Self {
        if p.is_fragment {
            FlowKey::Fragment(FragmentKey {
                src_ip: p.src_ip,
                dst_ip: p.dst_ip,
                ip_id: p.ip_id,
                protocol: p.ip_proto,
                vlan_id: p.vlan_id,
                mpls_label: p.mpls_label,
                address_space: p.address_space,
            })
        } else if p.ip_proto == IPPROTO_ICMP || p.ip_proto == IPPROTO_ICMPV6 {
            FlowKey::Ports(PortsKey {
                src_ip: p.src_ip,
                src_port: u16::from(p.icmp_type),
                dst_ip: p.dst_ip,
                dst_port: 0,
                protocol: p.ip_proto,
                vlan_id: p.vlan_id,
                mpls_label: p.mpls_label,
                address_space: p.address_space,
            })
        } else {
            FlowKey::Ports(PortsKey {
                src_ip: p.src_ip,
                src_port: p.src_port,
                dst_ip: p.dst_ip,
                dst_port: p.dst_port,
                protocol: p.ip_proto,
                vlan_id: p.vlan_id,
                mpls_label: p.mpls_label,
                address_space: p.address_space,
            })
        }
    }

    /// Raw IP protocol number carried by the key
    pub fn protocol(&self) -> u8 {
        match self {
            FlowKey::Ports(k) => k.protocol,
            FlowKey::Fragment(k) => k.protocol,
        }
    }

    /// True when `self` and `stored` describe the same conversation in
    /// the same orientation (packet travelling client-to-server
    /// relative to the stored key). Only meaningful for equal keys.
    pub fn same_orientation(&self, stored: &FlowKey) -> bool {
        match (self, stored) {
            (FlowKey::Ports(a), FlowKey::Ports(b)) => {
                a.src_ip == b.src_ip && a.src_port == b.src_port
            }
            (FlowKey::Fragment(a), FlowKey::Fragment(b)) => a.src_ip == b.src_ip,
            _ => false,
        }
    }
}

impl PartialEq for PortsKey {
    fn eq(&self, other: &Self) -> bool {
        if self.protocol != other.protocol
            || self.vlan_id != other.vlan_id
            || self.mpls_label != other.mpls_label
            || self.address_space != other.address_space
        {
            return false;
        }
        let forward = self.src_ip == other.src_ip
            && self.dst_ip == other.dst_ip
            && self.src_port == other.src_port
            && self.dst_port == other.dst_port;
        let swapped = self.src_ip == other.dst_ip
            && self.dst_ip == other.src_ip
            && self.src_port == other.dst_port
            && self.dst_port == other.src_port;
        forward || swapped
    }
}

impl Eq for PortsKey {}

impl Hash for PortsKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        // Hash endpoints in canonical order so both directions of one
        // conversation collide.
        let a = (self.src_ip, self.src_port);
        let b = (self.dst_ip, self.dst_port);
        let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
        lo.hash(state);
        hi.hash(state);
        self.protocol.hash(state);
        self.vlan_id.hash(state);
        self.mpls_label.hash(state);
        self.address_space.hash(state);
    }
}

impl PartialEq for FragmentKey {
    fn eq(&self, other: &Self) -> bool {
        if self.ip_id != other.ip_id
            || self.protocol != other.protocol
            || self.vlan_id != other.vlan_id
            || self.mpls_label != other.mpls_label
            || self.address_space != other.address_space
        {
            return false;
        }
        (self.src_ip == other.src_ip && self.dst_ip == other.dst_ip)
            || (self.src_ip == other.dst_ip && self.dst_ip == other.src_ip)
    }
}

impl Eq for FragmentKey {}

impl Hash for FragmentKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        let (lo, hi) = if self.src_ip <= self.dst_ip {
            (self.src_ip, self.dst_ip)
        } else {
            (self.dst_ip, self.src_ip)
        };
        lo.hash(state);
        hi.hash(state);
        self.ip_id.hash(state);
        self.protocol.hash(state);
        self.vlan_id.hash(state);
        self.mpls_label.hash(state);
        self.address_space.hash(state);
    }
}

impl PartialEq for FlowKey {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FlowKey::Ports(a), FlowKey::Ports(b)) => a == b,
            (FlowKey::Fragment(a), FlowKey::Fragment(b)) => a == b,
            _ => false,
        }
    }
}

impl Eq for FlowKey {}

impl Hash for FlowKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        match self {
            FlowKey::Ports(k) => {
                0u8.hash(state);
                k.hash(state);
            }
            FlowKey::Fragment(k) => {
                1u8.hash(state);
                k.hash(state);
            }
        }
    }
}
