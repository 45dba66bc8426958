// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network scenarios against the stack a booted kernel owns; its worker
//! thread does all the polling.

use std::net::{Ipv4Addr, SocketAddrV4};
use std::time::Duration;

use kos_e2e::{attach_eth0, boot_manual, wait_until};
use kos_net::ethernet::{build_frame, ETHERTYPE_ARP, ETHERTYPE_IPV4, ETH_HLEN};
use kos_net::ipv4::FLAG_MF;
use kos_net::udp;
use kos_net::{ArpOp, ArpPacket, Ipv4Header, MacAddr, Route, TcpState};

const OUR_MAC: MacAddr = MacAddr([0x02, 0, 0, 0, 0, 0x01]);
const PEER_MAC: MacAddr = MacAddr([0xaa, 0xbb, 0xcc, 0xdd, 0xee, 0xff]);
const WAIT: Duration = Duration::from_secs(5);

fn ip(a: u8, b: u8, c: u8, d: u8) -> Ipv4Addr {
    Ipv4Addr::new(a, b, c, d)
}

fn ipv4_of(frame: &[u8]) -> (Ipv4Header, Vec<u8>) {
    let hdr = Ipv4Header::parse(&frame[ETH_HLEN..]).expect("ipv4");
    let start = ETH_HLEN + hdr.header_len();
    let end = ETH_HLEN + usize::from(hdr.total_len);
    (hdr, frame[start..end].to_vec())
}

#[test]
fn tcp_connect_accept_and_exchange() {
    let (kernel, _clock) = boot_manual();
    attach_eth0(&kernel, OUR_MAC, ip(10, 0, 0, 1));
    let net = kernel.net();
    let server = SocketAddrV4::new(ip(10, 0, 0, 1), 8000);

    let s1 = net.tcp_socket();
    s1.bind(server).expect("bind");
    s1.listen(1).expect("listen");
    let s2 = net.tcp_socket();
    s2.connect_timeout(server, WAIT).expect("connect");
    assert_eq!(s2.state(), TcpState::Established);

    assert_eq!(s2.send(b"ping").expect("send"), 4);
    let child = s1.accept_timeout(WAIT).expect("accept");
    assert_eq!(child.state(), TcpState::Established);
    assert_eq!(child.recv_timeout(64, WAIT).expect("recv"), b"ping");
    kernel.shutdown();
}

#[test]
fn fragments_reassemble_in_arrival_order_2_0_1() {
    let (tx_kernel, _c1) = boot_manual();
    let (rx_kernel, _c2) = boot_manual();
    let (tx_cap, _) = attach_eth0(&tx_kernel, OUR_MAC, ip(10, 0, 0, 1));
    let (rx_cap, _) = attach_eth0(&rx_kernel, PEER_MAC, ip(10, 0, 0, 2));
    let (tx, rx) = (tx_kernel.net(), rx_kernel.net());
    tx.arp_add_static(ip(10, 0, 0, 2), PEER_MAC).expect("static arp");

    let sink = rx.udp_bind(SocketAddrV4::new(ip(10, 0, 0, 2), 7000), false).expect("bind");
    let source = tx.udp_bind(SocketAddrV4::new(ip(10, 0, 0, 1), 5000), false).expect("bind");
    let data: Vec<u8> = (0..3992u32).map(|i| (i * 7 % 256) as u8).collect();
    source.send_to(&data, SocketAddrV4::new(ip(10, 0, 0, 2), 7000)).expect("send");

    let frames = tx_cap.take_frames();
    let layout: Vec<(usize, bool)> = frames
        .iter()
        .map(|f| {
            let (h, _) = ipv4_of(f);
            (usize::from(h.frag_offset) * 8, h.flags & FLAG_MF != 0)
        })
        .collect();
    assert_eq!(layout, vec![(0, true), (1480, true), (2960, false)]);

    for i in [2, 0, 1] {
        rx_cap.inject(frames[i].clone());
    }
    let got = sink.recv_timeout(WAIT).expect("reassembled datagram");
    assert_eq!(got.data, data);
    assert_eq!(rx.stats().reassembly.reassembled, 1);
    tx_kernel.shutdown();
    rx_kernel.shutdown();
}

#[test]
fn arp_request_then_reply_flushes_pending_send() {
    let (kernel, _clock) = boot_manual();
    let (cap, _) = attach_eth0(&kernel, OUR_MAC, ip(10, 0, 0, 1));
    let net = kernel.net();
    let sock = net.udp_bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), false).expect("bind");
    sock.send_to(b"hello", SocketAddrV4::new(ip(10, 0, 0, 2), 9)).expect("parked");

    let frames = cap.take_frames();
    assert_eq!(frames.len(), 1);
    assert_eq!(&frames[0][..6], &MacAddr::BROADCAST.0);
    assert_eq!(u16::from_be_bytes([frames[0][12], frames[0][13]]), ETHERTYPE_ARP);
    let request = ArpPacket::parse(&frames[0][ETH_HLEN..]).expect("arp");
    assert_eq!((request.op, request.tpa), (ArpOp::Request, ip(10, 0, 0, 2)));

    let reply = ArpPacket::reply_to(&request, PEER_MAC);
    cap.inject(build_frame(OUR_MAC, PEER_MAC, ETHERTYPE_ARP, &reply.to_bytes()));
    assert!(wait_until(WAIT, || net.arp_lookup(ip(10, 0, 0, 2)) == Some(PEER_MAC)));

    let mut sent = Vec::new();
    assert!(wait_until(WAIT, || {
        sent.extend(cap.take_frames());
        !sent.is_empty()
    }));
    assert_eq!(&sent[0][..6], &PEER_MAC.0);
    assert_eq!(u16::from_be_bytes([sent[0][12], sent[0][13]]), ETHERTYPE_IPV4);
    let (hdr, payload) = ipv4_of(&sent[0]);
    let (_, body) = udp::parse_segment(hdr.src, hdr.dst, &payload).expect("udp");
    assert_eq!(body, b"hello");
    assert_eq!(net.arp_pending(), 0);
    kernel.shutdown();
}

#[test]
fn longest_prefix_match_picks_most_specific_gateway() {
    let (kernel, _clock) = boot_manual();
    let (_, idx) = attach_eth0(&kernel, OUR_MAC, ip(10, 0, 0, 1));
    let routes = kernel.net().routes();
    let (gw1, gw2, gw3) = (ip(192, 168, 0, 1), ip(10, 0, 0, 254), ip(10, 1, 0, 254));
    routes.add(Route::new(Ipv4Addr::UNSPECIFIED, 0, Some(gw1), idx, 0).expect("default")).expect("add");
    routes.add(Route::new(ip(10, 0, 0, 0), 8, Some(gw2), idx, 0).expect("/8")).expect("add");
    routes.add(Route::new(ip(10, 1, 0, 0), 16, Some(gw3), idx, 0).expect("/16")).expect("add");
    assert_eq!(routes.lookup(ip(10, 1, 2, 3)).expect("hit").gateway, Some(gw3));
    assert_eq!(routes.lookup(ip(10, 2, 0, 1)).expect("hit").gateway, Some(gw2));
    assert_eq!(routes.lookup(ip(8, 8, 8, 8)).expect("hit").gateway, Some(gw1));
    kernel.shutdown();
}
