//! End-to-end flow tracking scenarios driven through the public API

use std::any::Any;
use std::net::{IpAddr, Ipv4Addr};

use flowtrack::packet::IPPROTO_UDP;
use flowtrack::{
    Flow, FlowConfig, FlowControl, FlowData, FlowFlags, FlowKey, IgnoreDirection, Packet,
    Protocol, Session, SessionFactory,
};
use flowtrack::control::NullBinder;

fn ip(v: u32) -> IpAddr {
    IpAddr::V4(Ipv4Addr::from(v))
}

struct NullSession;

impl Session for NullSession {
    fn setup(&mut self, _flow: &mut Flow, _pkt: &Packet) -> bool {
        true
    }
    fn process(&mut self, _flow: &mut Flow, _pkt: &Packet) {}
}

fn null_factory() -> SessionFactory {
    Box::new(|| Box::new(NullSession))
}

fn control() -> FlowControl {
    FlowControl::new(Box::new(NullBinder))
}

#[derive(Clone)]
struct MediaPinhole {
    ssrc: u32,
}

impl FlowData for MediaPinhole {
    fn id(&self) -> u32 {
        0x5150
    }
    fn as_any(&self) -> &dyn Any {
        self
    }
    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
    fn boxed_clone(&self) -> Box<dyn FlowData> {
        Box::new(self.clone())
    }
}

/// Scenario A: two TCP sessions configured, three distinct 5-tuples;
/// the third get evicts the oldest idle flow and succeeds.
#[test]
fn scenario_a_capacity_eviction() {
    let mut fc = control();
    fc.init_tcp(&FlowConfig::with_max_sessions(2), null_factory());

    let p1 = Packet::tcp(ip(0x0A000001), 40001, ip(0x0A000099), 80, 100);
    let p2 = Packet::tcp(ip(0x0A000002), 40002, ip(0x0A000099), 80, 110);
    let p3 = Packet::tcp(ip(0x0A000003), 40003, ip(0x0A000099), 80, 120);

    fc.process_tcp(&p1);
    fc.process_tcp(&p2);
    fc.process_tcp(&p3);

    assert_eq!(fc.get_flow_count(Protocol::Tcp), 3);
    assert_eq!(fc.get_prunes(Protocol::Tcp), 1);

    // Oldest (p1) evicted, newer two still tracked
    assert!(fc.find_flow(&FlowKey::from_packet(&p1)).is_none());
    assert!(fc.find_flow(&FlowKey::from_packet(&p2)).is_some());
    assert!(fc.find_flow(&FlowKey::from_packet(&p3)).is_some());
}

/// Scenario B: no ICMP cache configured; ICMP packets are tracked as
/// degenerate IP flows and counted under IP.
#[test]
fn scenario_b_icmp_fallback_to_ip() {
    let mut fc = control();
    fc.init_icmp(&FlowConfig::disabled(), null_factory());
    fc.init_ip(&FlowConfig::with_max_sessions(16), null_factory());

    let ping = Packet::icmp(ip(0x0A000001), ip(0x0A000099), 8, 100);
    fc.process_icmp(&ping);

    assert_eq!(fc.get_flow_count(Protocol::Icmp), 0);
    assert_eq!(fc.get_flow_count(Protocol::Ip), 1);
    assert_eq!(fc.cache_stats(Protocol::Ip).unwrap().in_use, 1);
}

/// Scenario C: a unidirectional TCP flow sees its first reply; both
/// seen-direction flags end up set and the uni-list link is removed.
#[test]
fn scenario_c_uni_flow_collapse() {
    let mut fc = control();
    fc.init_tcp(&FlowConfig::with_max_sessions(8), null_factory());

    let c2s = Packet::tcp(ip(0x0A000001), 40000, ip(0x0A000099), 443, 100);
    fc.process_tcp(&c2s);

    let key = FlowKey::from_packet(&c2s);
    let id = fc.find_flow(&key).unwrap();
    {
        let flow = fc.cache(Protocol::Tcp).unwrap().flow(id);
        assert!(flow.flags.has(FlowFlags::SEEN_CLIENT));
        assert!(!flow.flags.has(FlowFlags::SEEN_SERVER));
        assert!(flow.on_uni_list());
    }

    let s2c = c2s.reverse();
    fc.process_tcp(&s2c);

    // Same flow, now bidirectional and off the uni list
    assert_eq!(fc.find_flow(&FlowKey::from_packet(&s2c)), Some(id));
    let flow = fc.cache(Protocol::Tcp).unwrap().flow(id);
    assert!(flow.is_bidirectional());
    assert!(!flow.on_uni_list());
    assert_eq!(fc.get_flow_count(Protocol::Tcp), 1, "reply is not a new flow");
}

/// Scenario D: a registered expectation fast-paths the matching packet:
/// the flow inherits the prepared flow-data and the ignore hint.
#[test]
fn scenario_d_expected_flow_pinhole() {
    let mut fc = control();
    let cfg = FlowConfig::with_max_sessions(1024);
    fc.init_udp(&cfg, null_factory());
    fc.init_exp(&cfg, &cfg);

    fc.add_expected(
        ip(0x0A000001),
        Some(5004),
        ip(0x0A000002),
        6004,
        IPPROTO_UDP,
        IgnoreDirection::Both,
        false,
        Box::new(MediaPinhole { ssrc: 0xDEAD }),
        100,
    )
    .unwrap();

    let media = Packet::udp(ip(0x0A000001), 5004, ip(0x0A000002), 6004, 101);
    assert!(fc.is_expected(&media));

    fc.process_udp(&media);

    let id = fc.find_flow(&FlowKey::from_packet(&media)).unwrap();
    let flow = fc.cache(Protocol::Udp).unwrap().flow(id);
    assert_eq!(flow.ignore_direction, IgnoreDirection::Both);

    let pinhole = flow
        .get_data(0x5150)
        .and_then(|d| d.as_any().downcast_ref::<MediaPinhole>())
        .expect("flow inherits the registered data");
    assert_eq!(pinhole.ssrc, 0xDEAD);

    // One-shot expectation: consumed by the first match
    assert!(!fc.is_expected(&media));
    assert_eq!(fc.expect_stats().unwrap().matches, 1);
}

/// The RTP/RTCP pair case: two independent expectations registered off
/// one signaling dialog, each consumed by its own media flow.
#[test]
fn scenario_d2_paired_expectations() {
    let mut fc = control();
    let cfg = FlowConfig::with_max_sessions(1024);
    fc.init_udp(&cfg, null_factory());
    fc.init_exp(&cfg, &cfg);

    for port in [5004u16, 5005u16] {
        fc.add_expected(
            ip(0x0A000001),
            Some(port),
            ip(0x0A000002),
            port + 1000,
            IPPROTO_UDP,
            IgnoreDirection::Both,
            false,
            Box::new(MediaPinhole { ssrc: u32::from(port) }),
            100,
        )
        .unwrap();
    }

    let rtp = Packet::udp(ip(0x0A000001), 5004, ip(0x0A000002), 6004, 101);
    let rtcp = Packet::udp(ip(0x0A000001), 5005, ip(0x0A000002), 6005, 101);
    fc.process_udp(&rtp);
    fc.process_udp(&rtcp);

    for (pkt, ssrc) in [(&rtp, 5004u32), (&rtcp, 5005u32)] {
        let id = fc.find_flow(&FlowKey::from_packet(pkt)).unwrap();
        let flow = fc.cache(Protocol::Udp).unwrap().flow(id);
        let pinhole = flow
            .get_data(0x5150)
            .and_then(|d| d.as_any().downcast_ref::<MediaPinhole>())
            .unwrap();
        assert_eq!(pinhole.ssrc, ssrc);
    }
    assert_eq!(fc.expect_stats().unwrap().pending, 0);
}

/// Direction-insensitive identity through the orchestrator: both
/// directions of one conversation map to one flow.
#[test]
fn direction_insensitive_identity() {
    let mut fc = control();
    fc.init_udp(&FlowConfig::with_max_sessions(8), null_factory());

    let out = Packet::udp(ip(0x0A000001), 53000, ip(0x08080808), 53, 100);
    fc.process_udp(&out);
    fc.process_udp(&out.reverse());

    assert_eq!(fc.get_flow_count(Protocol::Udp), 1);
    assert_eq!(fc.cache_stats(Protocol::Udp).unwrap().in_use, 1);
}

/// Fragments key on the IP identification field, not ports.
#[test]
fn fragment_flows_tracked_by_ip_id() {
    let mut fc = control();
    fc.init_ip(&FlowConfig::with_max_sessions(8), null_factory());

    let frag_a = Packet::fragment(ip(0x0A000001), ip(0x0A000002), 132, 0x1111, 100);
    let frag_b = Packet::fragment(ip(0x0A000001), ip(0x0A000002), 132, 0x2222, 100);
    fc.process_ip(&frag_a);
    fc.process_ip(&frag_b);

    assert_eq!(fc.get_flow_count(Protocol::Ip), 2, "distinct IP ids, distinct flows");
}

/// Housekeeping sweep honors its budget and skips ICMP.
#[test]
fn timeout_sweep_budget_across_caches() {
    let mut fc = control();
    let cfg = FlowConfig {
        max_sessions: 16,
        pruning_timeout: 30,
        nominal_timeout: 60,
    };
    fc.init_tcp(&cfg, null_factory());
    fc.init_udp(&cfg, null_factory());
    fc.init_icmp(&cfg, null_factory());

    for i in 0..4u32 {
        fc.process_tcp(&Packet::tcp(ip(0x0A000001 + i), 40000, ip(9), 80, 100));
        fc.process_udp(&Packet::udp(ip(0x0A000001 + i), 50000, ip(9), 53, 100));
        fc.process_icmp(&Packet::icmp(ip(0x0A000001 + i), ip(9), 8, 100));
    }

    // Budget is per cache: 2 from TCP, 2 from UDP, ICMP untouched
    let released = fc.timeout_flows(2, 1000);
    assert_eq!(released, 4);
    assert_eq!(fc.cache_stats(Protocol::Tcp).unwrap().in_use, 2);
    assert_eq!(fc.cache_stats(Protocol::Udp).unwrap().in_use, 2);
    assert_eq!(fc.cache_stats(Protocol::Icmp).unwrap().in_use, 4);
}
