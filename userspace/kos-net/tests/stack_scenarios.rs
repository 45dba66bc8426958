// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Whole-stack behaviour driven through loopback and capture devices.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use kos_abi::time::ManualClock;
use kos_net::dhcp::{self, DhcpOption, MessageType, DHCP_CLIENT_PORT, DHCP_SERVER_PORT};
use kos_net::dns::{Message, RData, Record, CLASS_IN, FLAG_QR, FLAG_RD, TYPE_A};
use kos_net::ethernet::{build_frame, ETHERTYPE_ARP, ETHERTYPE_IPV4, ETH_HLEN};
use kos_net::ipv4::{self, FLAG_MF, IPPROTO_UDP};
use kos_net::stack::ARP_RETRY_NS;
use kos_net::udp;
use kos_net::{
    ArpOp, ArpPacket, CaptureDevice, DhcpMessage, DhcpState, Ipv4Cidr, Ipv4Header, MacAddr, NetConfig, NetError,
    NetStack, Route, RouteTable, TcpSocket, TcpState,
};

const OUR_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
const PEER_MAC: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);

fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
    Ipv4Addr::new(a, b, c, d)
}

/// Stack with `eth0` on a capture device; `addr` is assigned when given.
fn boot(mac: MacAddr, addr: Option<Ipv4Addr>) -> (Arc<NetStack>, Arc<CaptureDevice>, Arc<ManualClock>, u32) {
    let clock = Arc::new(ManualClock::new(0));
    let stack = NetStack::new(NetConfig::default(), clock.clone()).expect("stack");
    let cap = Arc::new(CaptureDevice::new());
    let idx = stack.add_interface("eth0", mac, 1500, cap.clone()).expect("eth0");
    if let Some(addr) = addr {
        stack.set_ipv4(idx, Ipv4Cidr::new(addr, 24).expect("cidr")).expect("addr");
    }
    (stack, cap, clock, idx)
}

fn ipv4_of(frame: &[u8]) -> (Ipv4Header, Vec<u8>) {
    let hdr = Ipv4Header::parse(&frame[ETH_HLEN..]).expect("ipv4");
    let start = ETH_HLEN + hdr.header_len();
    let end = ETH_HLEN + usize::from(hdr.total_len);
    (hdr, frame[start..end].to_vec())
}

fn ethertype(frame: &[u8]) -> u16 {
    u16::from_be_bytes([frame[12], frame[13]])
}

fn udp_frame(src: SocketAddrV4, dst: SocketAddrV4, dst_mac: MacAddr, src_mac: MacAddr, data: &[u8]) -> Vec<u8> {
    let seg = udp::build_segment(src, dst, data).expect("segment");
    let hdr = Ipv4Header::new(*src.ip(), *dst.ip(), IPPROTO_UDP, seg.len()).expect("header");
    build_frame(dst_mac, src_mac, ETHERTYPE_IPV4, &ipv4::build_datagram(&hdr, &seg))
}

#[test]
fn tcp_handshake_and_data_over_loopback() {
    let (stack, _cap, _clock, _) = boot(OUR_MAC, Some(ip(10, 0, 0, 1)));
    let server = SocketAddrV4::new(ip(10, 0, 0, 1), 8000);
    let s1 = stack.tcp_socket();
    s1.bind(server).expect("bind");
    s1.listen(1).expect("listen");
    let s2 = stack.tcp_socket();
    s2.connect(server).expect("connect");
    assert_eq!(s2.state(), TcpState::SynSent);

    // SYN
    assert_eq!(stack.poll(), 1);
    assert_eq!(s1.accept().err(), Some(NetError::WouldBlock));
    // SYN|ACK
    assert_eq!(stack.poll(), 1);
    assert_eq!(s2.state(), TcpState::Established);
    // ACK
    assert_eq!(stack.poll(), 1);

    assert_eq!(s2.send(b"ping").expect("send"), 4);
    stack.poll_until_idle(8);
    let child = s1.accept().expect("accept");
    assert_eq!(child.state(), TcpState::Established);
    assert_eq!(child.peer_addr().expect("peer"), s2.local_addr().expect("local"));
    assert_eq!(child.recv(64).expect("recv"), b"ping");
}

/// Established loopback pair on a stack built from `config`: (stack, listener, client, accepted).
fn loopback_pair(config: NetConfig) -> (Arc<NetStack>, TcpSocket, TcpSocket, TcpSocket) {
    let clock = Arc::new(ManualClock::new(0));
    let stack = NetStack::new(config, clock).expect("stack");
    let idx = stack.add_interface("eth0", OUR_MAC, 1500, Arc::new(CaptureDevice::new())).expect("eth0");
    stack.set_ipv4(idx, Ipv4Cidr::new(ip(10, 0, 0, 1), 24).expect("cidr")).expect("addr");
    let server = SocketAddrV4::new(ip(10, 0, 0, 1), 8100);
    let listener = stack.tcp_socket();
    listener.bind(server).expect("bind");
    listener.listen(4).expect("listen");
    let client = stack.tcp_socket();
    client.connect(server).expect("connect");
    stack.poll_until_idle(8);
    let accepted = listener.accept().expect("accept");
    assert_eq!(client.state(), TcpState::Established);
    (stack, listener, client, accepted)
}

#[test]
fn close_releases_blocked_reader() {
    let (_stack, _listener, client, _accepted) = loopback_pair(NetConfig::default());
    let started = Instant::now();
    let res = thread::scope(|s| {
        let reader = s.spawn(|| client.recv_timeout(64, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(100));
        client.close();
        reader.join().expect("reader")
    });
    assert_eq!(res, Err(NetError::BadSocket));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn close_releases_blocked_writer() {
    let config = NetConfig { tcp_sndbuf: 1024, ..NetConfig::default() };
    let (_stack, _listener, client, _accepted) = loopback_pair(config);
    // Nothing polls the stack, so no ACK ever frees the send buffer.
    let data = vec![0x5a; 256 * 1024];
    let started = Instant::now();
    let res = thread::scope(|s| {
        let writer = s.spawn(|| client.send_all(&data, Duration::from_secs(5)));
        thread::sleep(Duration::from_millis(100));
        client.close();
        writer.join().expect("writer")
    });
    assert_eq!(res, Err(NetError::BadSocket));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn close_releases_blocked_accept() {
    let (stack, _cap, _clock, _) = boot(OUR_MAC, Some(ip(10, 0, 0, 1)));
    let listener = stack.tcp_socket();
    listener.bind(SocketAddrV4::new(ip(10, 0, 0, 1), 8200)).expect("bind");
    listener.listen(1).expect("listen");
    let started = Instant::now();
    let res = thread::scope(|s| {
        let acceptor = s.spawn(|| listener.accept_timeout(Duration::from_secs(5)).err());
        thread::sleep(Duration::from_millis(100));
        listener.close();
        acceptor.join().expect("acceptor")
    });
    assert_eq!(res, Some(NetError::BadSocket));
    assert!(started.elapsed() < Duration::from_secs(4));
}

#[test]
fn listener_closed_mid_handshake_resets_child() {
    let (stack, _cap, _clock, _) = boot(OUR_MAC, Some(ip(10, 0, 0, 1)));
    let server = SocketAddrV4::new(ip(10, 0, 0, 1), 8300);
    let listener = stack.tcp_socket();
    listener.bind(server).expect("bind");
    listener.listen(4).expect("listen");
    let client = stack.tcp_socket();
    client.connect(server).expect("connect");

    // SYN only: the child sits in SynRcvd.
    assert_eq!(stack.poll(), 1);
    assert_eq!(stack.tcp_table().len(), 2);
    listener.close();
    stack.poll_until_idle(16);

    assert_eq!(client.recv(64).err(), Some(NetError::ConnReset));
    drop(client);
    stack.poll_until_idle(16);
    assert!(stack.tcp_table().is_empty());
}

#[test]
fn oversized_datagram_fragments_and_reassembles_out_of_order() {
    let (tx, tx_cap, _, _) = boot(OUR_MAC, Some(ip(10, 0, 0, 1)));
    let (rx, rx_cap, _, _) = boot(PEER_MAC, Some(ip(10, 0, 0, 2)));
    tx.arp_add_static(ip(10, 0, 0, 2), PEER_MAC).expect("static arp");

    let sink = rx.udp_bind(SocketAddrV4::new(ip(10, 0, 0, 2), 7000), false).expect("bind");
    let source = tx.udp_bind(SocketAddrV4::new(ip(10, 0, 0, 1), 5000), false).expect("bind");
    // 8 bytes of UDP header make a 4000-byte IP payload.
    let data: Vec<u8> = (0..3992u32).map(|i| (i % 251) as u8).collect();
    source.send_to(&data, SocketAddrV4::new(ip(10, 0, 0, 2), 7000)).expect("send");

    let frames = tx_cap.take_frames();
    assert_eq!(frames.len(), 3);
    let layout: Vec<(usize, bool, usize)> = frames
        .iter()
        .map(|f| {
            let (h, payload) = ipv4_of(f);
            (usize::from(h.frag_offset) * 8, h.flags & FLAG_MF != 0, payload.len())
        })
        .collect();
    assert_eq!(layout, vec![(0, true, 1480), (1480, true, 1480), (2960, false, 1040)]);
    assert!(frames.iter().all(|f| f[..6] == PEER_MAC.0));

    for i in [2, 0, 1] {
        rx_cap.inject(frames[i].clone());
    }
    rx.poll_until_idle(4);
    let got = sink.recv_from().expect("datagram");
    assert_eq!(got.from, SocketAddrV4::new(ip(10, 0, 0, 1), 5000));
    assert_eq!(got.data, data);
    assert_eq!(rx.stats().reassembly.reassembled, 1);
}

#[test]
fn first_send_resolves_next_hop_then_flushes() {
    let (stack, cap, _, _) = boot(OUR_MAC, Some(ip(10, 0, 0, 1)));
    let sock = stack.udp_bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), false).expect("bind");
    sock.send_to(b"hello", SocketAddrV4::new(ip(10, 0, 0, 2), 9)).expect("parked");
    assert_eq!(stack.arp_pending(), 1);

    let frames = cap.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(ethertype(&frames[0]), ETHERTYPE_ARP);
    assert_eq!(&frames[0][..6], &MacAddr::BROADCAST.0);
    let request = ArpPacket::parse(&frames[0][ETH_HLEN..]).expect("arp");
    assert_eq!((request.op, request.spa, request.tpa), (ArpOp::Request, ip(10, 0, 0, 1), ip(10, 0, 0, 2)));

    let reply = ArpPacket::reply_to(&request, PEER_MAC);
    cap.inject(build_frame(OUR_MAC, PEER_MAC, ETHERTYPE_ARP, &reply.to_bytes()));
    assert_eq!(stack.poll(), 1);
    assert_eq!(stack.arp_lookup(ip(10, 0, 0, 2)), Some(PEER_MAC));
    assert_eq!(stack.arp_pending(), 0);

    let frames = cap.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..6], &PEER_MAC.0);
    assert_eq!(ethertype(&frames[0]), ETHERTYPE_IPV4);
    let (hdr, payload) = ipv4_of(&frames[0]);
    let (_, body) = udp::parse_segment(hdr.src, hdr.dst, &payload).expect("udp");
    assert_eq!(body, b"hello");
}

#[test]
fn unanswered_arp_gives_up_after_retries() {
    let (stack, cap, clock, _) = boot(OUR_MAC, Some(ip(10, 0, 0, 1)));
    let sock = stack.udp_bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), false).expect("bind");
    sock.send_to(b"lost", SocketAddrV4::new(ip(10, 0, 0, 3), 9)).expect("parked");
    for _ in 0..3 {
        clock.advance_ns(ARP_RETRY_NS);
        stack.tick();
    }
    assert_eq!(cap.take_frames().len(), 3);
    assert_eq!(stack.arp_pending(), 0);
    assert_eq!(stack.stats().arp_unresolved, 1);
}

#[test]
fn longest_prefix_wins() {
    let (gw1, gw2, gw3) = (ip(192, 168, 0, 1), ip(10, 0, 0, 254), ip(10, 1, 0, 254));
    let table = RouteTable::new();
    table.add(Route::new(Ipv4Addr::UNSPECIFIED, 0, Some(gw1), 1, 0).expect("default")).expect("add");
    table.add(Route::new(ip(10, 0, 0, 0), 8, Some(gw2), 1, 0).expect("/8")).expect("add");
    table.add(Route::new(ip(10, 1, 0, 0), 16, Some(gw3), 1, 0).expect("/16")).expect("add");
    assert_eq!(table.lookup(ip(10, 1, 2, 3)).expect("hit").gateway, Some(gw3));
    assert_eq!(table.lookup(ip(10, 2, 0, 1)).expect("hit").gateway, Some(gw2));
    assert_eq!(table.lookup(ip(8, 8, 8, 8)).expect("hit").gateway, Some(gw1));
}

fn dhcp_of(frame: &[u8]) -> DhcpMessage {
    let (hdr, payload) = ipv4_of(frame);
    let (uh, body) = udp::parse_segment(hdr.src, hdr.dst, &payload).expect("udp");
    assert_eq!((uh.sport, uh.dport), (DHCP_CLIENT_PORT, DHCP_SERVER_PORT));
    DhcpMessage::parse(body).expect("dhcp")
}

fn server_frame(msg: &DhcpMessage) -> Vec<u8> {
    udp_frame(
        SocketAddrV4::new(ip(10, 0, 0, 254), DHCP_SERVER_PORT),
        SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_CLIENT_PORT),
        MacAddr::BROADCAST,
        PEER_MAC,
        &msg.to_bytes().expect("encode"),
    )
}

#[test]
fn dhcp_exchange_configures_interface() {
    let (stack, cap, _, idx) = boot(OUR_MAC, None);
    stack.dhcp_start(idx).expect("start");
    assert_eq!(stack.dhcp_state(idx), Some(DhcpState::Selecting));
    let frames = cap.take_frames();
    assert_eq!(frames.len(), 1);
    let discover = dhcp_of(&frames[0]);
    assert_eq!(discover.message_type(), Some(MessageType::Discover));
    assert_eq!(discover.chaddr, OUR_MAC);

    let lease_opts = vec![
        DhcpOption::SubnetMask(ip(255, 255, 255, 0)),
        DhcpOption::Router(vec![ip(10, 0, 0, 254)]),
        DhcpOption::DnsServers(vec![ip(9, 9, 9, 9)]),
        DhcpOption::LeaseTime(3600),
    ];
    let offer = dhcp::server_reply(&discover, MessageType::Offer, ip(10, 0, 0, 50), ip(10, 0, 0, 254), lease_opts.clone());
    cap.inject(server_frame(&offer));
    stack.poll();
    let frames = cap.take_frames();
    assert_eq!(frames.len(), 1);
    let request = dhcp_of(&frames[0]);
    assert_eq!(request.message_type(), Some(MessageType::Request));
    assert_eq!(request.server_id(), Some(ip(10, 0, 0, 254)));

    let ack = dhcp::server_reply(&request, MessageType::Ack, ip(10, 0, 0, 50), ip(10, 0, 0, 254), lease_opts);
    cap.inject(server_frame(&ack));
    stack.poll();
    assert_eq!(stack.dhcp_state(idx), Some(DhcpState::Bound));
    let cidr = stack.interface(idx).expect("eth0").addr.expect("address");
    assert_eq!((cidr.addr, cidr.prefix_len), (ip(10, 0, 0, 50), 24));
    assert_eq!(stack.routes().lookup(ip(8, 8, 8, 8)).expect("default").gateway, Some(ip(10, 0, 0, 254)));
    assert_eq!(stack.dns_servers(), vec![ip(9, 9, 9, 9)]);
    let garp = cap.take_frames();
    assert_eq!(garp.len(), 1);
    assert_eq!(ethertype(&garp[0]), ETHERTYPE_ARP);

    stack.dhcp_release(idx).expect("release");
    assert!(stack.interface(idx).expect("eth0").addr.is_none());
    assert_eq!(stack.dhcp_state(idx), None);
}

#[test]
fn resolver_queries_server_and_caches() {
    let (stack, _cap, _, _) = boot(OUR_MAC, Some(ip(10, 0, 0, 1)));
    stack.set_dns_servers(vec![Ipv4Addr::LOCALHOST]);
    let server = stack.udp_bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 53), false).expect("bind 53");
    stack.start().expect("worker");
    assert_eq!(stack.start(), Err(NetError::Already));

    let responder = thread::spawn(move || {
        let query = server.recv_timeout(Duration::from_secs(5)).expect("query");
        let msg = Message::parse(&query.data).expect("parse");
        let name = msg.questions[0].name.clone();
        let answer = Message {
            id: msg.id,
            flags: FLAG_QR | FLAG_RD,
            questions: msg.questions.clone(),
            answers: vec![Record { name, rtype: TYPE_A, class: CLASS_IN, ttl: 60, data: RData::A(ip(192, 0, 2, 7)) }],
            ..Message::default()
        };
        server.send_to(&answer.to_bytes().expect("encode"), query.from).expect("reply");
    });

    let addrs = stack.resolve("host.example", Duration::from_secs(5)).expect("resolve");
    assert_eq!(addrs, vec![ip(192, 0, 2, 7)]);
    responder.join().expect("responder");
    assert_eq!(stack.resolve("HOST.example", Duration::from_millis(10)).expect("cached"), addrs);
    assert_eq!(stack.stats().dns_cache.hits, 1);
    assert_eq!(stack.resolve("10.9.8.7", Duration::ZERO).expect("literal"), vec![ip(10, 9, 8, 7)]);
    stack.shutdown();
    assert!(!stack.is_running());
}
