//! Decoded-packet view consumed by the flow core
//!
//! The decode layer is an external collaborator; this is the minimal
//! metadata it must expose for flow tracking. Malformed packets never
//! reach this layer.

use std::net::IpAddr;

/// IP protocol numbers the tracker distinguishes
pub const IPPROTO_ICMP: u8 = 1;
pub const IPPROTO_TCP: u8 = 6;
pub const IPPROTO_UDP: u8 = 17;
pub const IPPROTO_ICMPV6: u8 = 58;

/// Metadata of one decoded packet
#[derive(Debug, Clone)]
pub struct Packet {
    /// Source address
    pub src_ip: IpAddr,
    /// Destination address
    pub dst_ip: IpAddr,
    /// Transport source port (unused for ICMP and fragments)
    pub src_port: u16,
    /// Transport destination port (unused for ICMP and fragments)
    pub dst_port: u16,
    /// Raw IP protocol number
    pub ip_proto: u8,
    /// ICMP type, valid when `ip_proto` is ICMP/ICMPv6
    pub icmp_type: u8,
    /// IP identification field, valid when `is_fragment`
    pub ip_id: u16,
    /// Packet is an IP fragment (ports are not meaningful)
    pub is_fragment: bool,
    /// VLAN id, 0 if untagged
    pub vlan_id: u16,
    /// MPLS label, 0 if absent
    pub mpls_label: u32,
    /// Address-space (tenant/VRF) id, 0 if absent
    pub address_space: u16,
    /// Capture timestamp, epoch seconds
    pub timestamp: u64,
}

impl Packet {
    /// TCP packet with the common fields; metadata zeroed
    pub fn tcp(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16, ts: u64) -> Self {
        Self::transport(IPPROTO_TCP, src_ip, src_port, dst_ip, dst_port, ts)
    }

    /// UDP packet with the common fields; metadata zeroed
    pub fn udp(src_ip: IpAddr, src_port: u16, dst_ip: IpAddr, dst_port: u16, ts: u64) -> Self {
        Self::transport(IPPROTO_UDP, src_ip, src_port, dst_ip, dst_port, ts)
    }

    /// ICMPv4 packet
    pub fn icmp(src_ip: IpAddr, dst_ip: IpAddr, icmp_type: u8, ts: u64) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port: 0,
            dst_port: 0,
            ip_proto: IPPROTO_ICMP,
            icmp_type,
            ip_id: 0,
            is_fragment: false,
            vlan_id: 0,
            mpls_label: 0,
            address_space: 0,
            timestamp: ts,
        }
    }

    /// IP fragment carrying `proto` with identification `ip_id`
    pub fn fragment(src_ip: IpAddr, dst_ip: IpAddr, proto: u8, ip_id: u16, ts: u64) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port: 0,
            dst_port: 0,
            ip_proto: proto,
            icmp_type: 0,
            ip_id,
            is_fragment: true,
            vlan_id: 0,
            mpls_label: 0,
            address_space: 0,
            timestamp: ts,
        }
    }

    fn transport(
        proto: u8,
        src_ip: IpAddr,
        src_port: u16,
        dst_ip: IpAddr,
        dst_port: u16,
        ts: u64,
    ) -> Self {
        Self {
            src_ip,
            dst_ip,
            src_port,
            dst_port,
            ip_proto: proto,
            icmp_type: 0,
            ip_id: 0,
            is_fragment: false,
            vlan_id: 0,
            mpls_label: 0,
            address_space: 0,
            timestamp: ts,
        }
    }

    /// Reply direction of the same conversation
    pub fn reverse(&self) -> Self {
        let mut p = self.clone();
        p.src_ip = self.dst_ip;
        p.dst_ip = self.src_ip;
        p.src_port = self.dst_port;
        p.dst_port = self.src_port;
        p
    }
}
