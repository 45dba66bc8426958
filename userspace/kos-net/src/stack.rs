// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! The network stack object: interfaces, the inbound demux path, the
//! outbound IPv4 path with ARP resolution, timers and the worker thread.
//!
//! Lock order is interface → ARP → routing → netfilter → socket. Frames are
//! never transmitted while the ARP lock or a socket lock is held.

use std::borrow::Cow;
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use kos_abi::time::{ClockSource, TimeKeeper};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::arp::{ArpCache, ArpOp, ArpPacket};
use crate::config::NetConfig;
use crate::conntrack::{Conntrack, CtStats};
use crate::dhcp::{DhcpAction, DhcpClient, DhcpMessage, DhcpState, Lease, DHCP_CLIENT_PORT, DHCP_SERVER_PORT};
use crate::dns::{DnsCache, DnsCacheStats, Message, DNS_PORT, TYPE_A};
use crate::error::{NetError, Result};
use crate::ethernet::{EthHeader, MacAddr, VlanTag, ETHERTYPE_ARP, ETHERTYPE_IPV4, ETHERTYPE_IPV6, ETHERTYPE_VLAN, ETH_HLEN, VLAN_HLEN};
use crate::fragment::{Reassembler, ReassemblyStats};
use crate::icmp::{self, IcmpMessage, UnreachCode};
use crate::iface::{CaptureDevice, IfFlags, IfStatsSnapshot, Interface, LoopbackDevice, NetDevice, LOOPBACK_MTU};
use crate::ipv4::{self, Ipv4Cidr, Ipv4Header, FLAG_DF, IPPROTO_ICMP, IPPROTO_TCP, IPPROTO_UDP};
use crate::ipv6::Ipv6Header;
use crate::netfilter::{Hook, Netfilter, NfPacket, Verdict};
use crate::packet::Packet;
use crate::recovery::{ErrorKind, ErrorRecovery, RecoveryAction, RecoveryStats};
use crate::route::{RouteFlags, RouteStats, RouteTable};
use crate::socket::{ConnParams, TcpSocket, TcpTable, UdpSocket};
use crate::tcp::{self, OutSegment, TCP_DEFAULT_MSS};
use crate::udp::{self, UdpTable};

/// Index of the loopback interface.
pub const LOOPBACK_INDEX: u32 = 0;
/// Datagrams parked per unresolved next hop.
pub const ARP_PENDING_MAX: usize = 16;
/// ARP requests sent before a next hop is declared unreachable.
pub const ARP_RETRIES: u32 = 3;
/// Interval between ARP requests for one next hop.
pub const ARP_RETRY_NS: u64 = 1_000_000_000;
/// Interval between dynamic route collections.
pub const ROUTE_GC_INTERVAL_NS: u64 = 60 * 1_000_000_000;
/// Echo replies kept for [`NetStack::take_echo_replies`].
pub const ECHO_QUEUE_LEN: usize = 64;

const IP_HLEN_TCP_HLEN: usize = 40;
const DNS_CACHE_ENTRIES: usize = 512;

/// Per-datagram IPv4 options for locally generated traffic.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SendOptions {
    /// Time to live.
    pub ttl: u8,
    /// Don't-fragment bit.
    pub df: bool,
    /// Type of service.
    pub tos: u8,
}

/// Echo reply received for a [`NetStack::ping`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct EchoReply {
    /// Responder.
    pub from: Ipv4Addr,
    /// Identifier.
    pub id: u16,
    /// Sequence number.
    pub seq: u16,
    /// Echoed payload.
    pub data: Vec<u8>,
    /// Arrival time.
    pub received_ns: u64,
}

struct Pending {
    ifindex: u32,
    datagrams: VecDeque<Vec<u8>>,
    attempts: u32,
    last_request_ns: u64,
}

struct ArpState {
    cache: ArpCache,
    pending: HashMap<Ipv4Addr, Pending>,
}

#[derive(Default)]
struct Counters {
    rx_frames: AtomicU64,
    rx_dropped: AtomicU64,
    vlan_frames: AtomicU64,
    arp_requests_sent: AtomicU64,
    arp_replies_sent: AtomicU64,
    arp_unresolved: AtomicU64,
    ip_in: AtomicU64,
    ip_delivered: AtomicU64,
    ip_forwarded: AtomicU64,
    ip_out: AtomicU64,
    ip_dropped: AtomicU64,
    ip_fragments_out: AtomicU64,
    ipv6_dropped: AtomicU64,
    icmp_in: AtomicU64,
    icmp_out: AtomicU64,
    udp_in: AtomicU64,
    udp_no_port: AtomicU64,
    udp_rcvbuf_drops: AtomicU64,
    tcp_in: AtomicU64,
    tcp_out: AtomicU64,
}

fn bump(c: &AtomicU64) {
    c.fetch_add(1, Ordering::Relaxed);
}

fn load(c: &AtomicU64) -> u64 {
    c.load(Ordering::Relaxed)
}

/// Stack-wide counters.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize)]
pub struct NetStats {
    /// Frames accepted by an interface.
    pub rx_frames: u64,
    /// Frames dropped before protocol demux.
    pub rx_dropped: u64,
    /// 802.1Q tagged frames.
    pub vlan_frames: u64,
    /// ARP requests sent.
    pub arp_requests_sent: u64,
    /// ARP replies sent.
    pub arp_replies_sent: u64,
    /// Datagrams dropped because the next hop never answered ARP.
    pub arp_unresolved: u64,
    /// IPv4 datagrams received.
    pub ip_in: u64,
    /// IPv4 datagrams handed to a transport.
    pub ip_delivered: u64,
    /// IPv4 datagrams forwarded.
    pub ip_forwarded: u64,
    /// IPv4 datagrams sent.
    pub ip_out: u64,
    /// IPv4 datagrams dropped.
    pub ip_dropped: u64,
    /// Fragments produced on output.
    pub ip_fragments_out: u64,
    /// IPv6 packets counted and dropped.
    pub ipv6_dropped: u64,
    /// ICMP messages received.
    pub icmp_in: u64,
    /// ICMP messages sent.
    pub icmp_out: u64,
    /// UDP datagrams received.
    pub udp_in: u64,
    /// UDP datagrams with no socket.
    pub udp_no_port: u64,
    /// UDP datagrams dropped on a full receive queue.
    pub udp_rcvbuf_drops: u64,
    /// TCP segments received.
    pub tcp_in: u64,
    /// TCP segments sent.
    pub tcp_out: u64,
    /// Reassembly counters.
    pub reassembly: ReassemblyStats,
    /// Routing counters.
    pub routes: RouteStats,
    /// Connection tracking counters.
    pub conntrack: CtStats,
    /// Error recovery counters.
    pub recovery: RecoveryStats,
    /// Resolver cache counters.
    pub dns_cache: DnsCacheStats,
    /// Per-interface counters.
    pub interfaces: Vec<(String, IfStatsSnapshot)>,
}

/// The network stack.
pub struct NetStack {
    config: NetConfig,
    clock: TimeKeeper,
    interfaces: RwLock<Vec<Interface>>,
    arp: Mutex<ArpState>,
    routes: RouteTable,
    netfilter: Netfilter,
    conntrack: Arc<Conntrack>,
    reasm: Mutex<Reassembler>,
    pub(crate) udp: UdpTable,
    pub(crate) tcp: TcpTable,
    dns_cache: Mutex<DnsCache>,
    dns_servers: RwLock<Vec<Ipv4Addr>>,
    dhcp: Mutex<HashMap<u32, DhcpClient>>,
    recovery: ErrorRecovery,
    counters: Counters,
    ip_id: AtomicU16,
    echo_replies: Mutex<VecDeque<EchoReply>>,
    last_route_gc_ns: AtomicU64,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl NetStack {
    /// Builds the stack with loopback plus the configured interfaces.
    /// Configured interfaces get a [`CaptureDevice`]; use
    /// [`Self::add_interface`] to attach other devices.
    pub fn new(config: NetConfig, clock: Arc<dyn ClockSource>) -> Result<Arc<Self>> {
        let conntrack = Arc::new(Conntrack::new(config.conntrack_max));
        let stack = Arc::new(Self {
            arp: Mutex::new(ArpState {
                cache: ArpCache::new(config.arp_max_entries, config.arp_ttl_secs.saturating_mul(1_000_000_000)),
                pending: HashMap::new(),
            }),
            routes: RouteTable::new(),
            netfilter: Netfilter::new(),
            conntrack,
            reasm: Mutex::new(Reassembler::default()),
            udp: UdpTable::new(),
            tcp: TcpTable::new(),
            dns_cache: Mutex::new(DnsCache::new(DNS_CACHE_ENTRIES)),
            dns_servers: RwLock::new(config.dns_servers.clone()),
            dhcp: Mutex::new(HashMap::new()),
            recovery: ErrorRecovery::new(config.errors_per_sec),
            counters: Counters::default(),
            ip_id: AtomicU16::new(rand::random::<u16>()),
            echo_replies: Mutex::new(VecDeque::new()),
            last_route_gc_ns: AtomicU64::new(0),
            running: AtomicBool::new(false),
            worker: Mutex::new(None),
            interfaces: RwLock::new(Vec::new()),
            clock: TimeKeeper::new(clock),
            config,
        });

        let lo = stack.add_interface("lo", MacAddr::ZERO, LOOPBACK_MTU, Arc::new(LoopbackDevice::new()))?;
        stack.update_interface(lo, |i| i.flags |= IfFlags::LOOPBACK | IfFlags::NOARP)?;
        stack.set_ipv4(lo, Ipv4Cidr::new(Ipv4Addr::LOCALHOST, 8)?)?;

        if stack.config.conntrack {
            stack.netfilter.register(Hook::PreRouting, "conntrack", -200, stack.conntrack.hook());
            stack.netfilter.register(Hook::LocalOut, "conntrack", -200, stack.conntrack.hook());
        }

        let mut dhcp_on = Vec::new();
        for ic in stack.config.interfaces.clone() {
            let index = stack.interfaces.read().len() as u32;
            let mac = match &ic.mac {
                Some(text) => text.parse()?,
                None => MacAddr::local(index),
            };
            let idx = stack.add_interface(&ic.name, mac, ic.mtu, Arc::new(CaptureDevice::new()))?;
            if ic.dhcp {
                dhcp_on.push(idx);
                continue;
            }
            if let Some(ip) = ic.ipv4 {
                stack.set_ipv4(idx, Ipv4Cidr::new(ip, ic.prefix_len)?)?;
            }
            if let Some(gw) = ic.gateway {
                stack.routes.add_default(gw, idx, 0)?;
            }
        }
        for idx in dhcp_on {
            stack.dhcp_start(idx)?;
        }
        log::info!("net: stack up with {} interfaces", stack.interfaces.read().len());
        Ok(stack)
    }

    /// Nanoseconds since the stack was created.
    pub fn now_ns(&self) -> u64 {
        self.clock.now_ns()
    }

    /// Configuration in force.
    pub fn config(&self) -> &NetConfig {
        &self.config
    }

    /// Routing table.
    pub fn routes(&self) -> &RouteTable {
        &self.routes
    }

    /// Netfilter hooks.
    pub fn netfilter(&self) -> &Netfilter {
        &self.netfilter
    }

    /// Connection tracker.
    pub fn conntrack(&self) -> &Conntrack {
        &self.conntrack
    }

    /// Error recovery policy.
    pub fn recovery(&self) -> &ErrorRecovery {
        &self.recovery
    }

    /// TCP connection table.
    pub fn tcp_table(&self) -> &TcpTable {
        &self.tcp
    }

    /// Attaches a device; returns the interface index.
    pub fn add_interface(&self, name: &str, mac: MacAddr, mtu: usize, device: Arc<dyn NetDevice>) -> Result<u32> {
        let mut ifaces = self.interfaces.write();
        if ifaces.iter().any(|i| i.name == name) {
            return Err(NetError::Exists);
        }
        if mtu < ipv4::IPV4_MIN_HLEN + 8 {
            return Err(NetError::Invalid("mtu too small"));
        }
        let index = ifaces.len() as u32;
        ifaces.push(Interface::new(index, name, mac, mtu, device));
        log::info!("net: {} index {} mac {} mtu {}", name, index, mac, mtu);
        Ok(index)
    }

    /// Snapshot of one interface.
    pub fn interface(&self, ifindex: u32) -> Result<Interface> {
        self.interfaces.read().get(ifindex as usize).cloned().ok_or(NetError::NotFound)
    }

    /// Interface index by name.
    pub fn interface_by_name(&self, name: &str) -> Option<u32> {
        self.interfaces.read().iter().find(|i| i.name == name).map(|i| i.index)
    }

    /// Snapshot of every interface.
    pub fn interfaces(&self) -> Vec<Interface> {
        self.interfaces.read().clone()
    }

    fn update_interface(&self, ifindex: u32, f: impl FnOnce(&mut Interface)) -> Result<()> {
        let mut ifaces = self.interfaces.write();
        let iface = ifaces.get_mut(ifindex as usize).ok_or(NetError::NotFound)?;
        f(iface);
        Ok(())
    }

    /// Brings the link up or down.
    pub fn set_link(&self, ifindex: u32, up: bool) -> Result<()> {
        self.update_interface(ifindex, |i| i.flags.set(IfFlags::UP, up))?;
        log::info!("net: link {} {}", ifindex, if up { "up" } else { "down" });
        Ok(())
    }

    /// Sets promiscuous reception.
    pub fn set_promisc(&self, ifindex: u32, on: bool) -> Result<()> {
        self.update_interface(ifindex, |i| i.flags.set(IfFlags::PROMISC, on))
    }

    /// Assigns an address; installs the subnet route and the local host route.
    pub fn set_ipv4(&self, ifindex: u32, cidr: Ipv4Cidr) -> Result<()> {
        if self.interface(ifindex)?.addr.is_some() {
            self.clear_ipv4(ifindex)?;
        }
        self.update_interface(ifindex, |i| i.addr = Some(cidr))?;
        match self.routes.add_interface_route(cidr, ifindex) {
            Ok(()) | Err(NetError::Exists) => {}
            Err(e) => return Err(e),
        }
        match self.routes.add_local(cidr.addr, LOOPBACK_INDEX) {
            Ok(()) | Err(NetError::Exists) => {}
            Err(e) => return Err(e),
        }
        log::info!("net: {} addr {}/{}", ifindex, cidr.addr, cidr.prefix_len);
        Ok(())
    }

    /// Removes the address and every route through the interface.
    pub fn clear_ipv4(&self, ifindex: u32) -> Result<()> {
        let mut old = None;
        self.update_interface(ifindex, |i| old = i.addr.take())?;
        if let Some(cidr) = old {
            if ifindex != LOOPBACK_INDEX {
                self.routes.remove_interface(ifindex);
            }
            let _ = self.routes.delete(cidr.addr, 32, None);
            log::info!("net: {} addr {} removed", ifindex, cidr.addr);
        }
        Ok(())
    }

    /// Sends a gratuitous ARP for the interface's address.
    pub fn announce(&self, ifindex: u32) -> Result<()> {
        let iface = self.interface(ifindex)?;
        let cidr = iface.addr.ok_or(NetError::AddrNotAvail)?;
        if iface.flags.contains(IfFlags::NOARP) {
            return Ok(());
        }
        let garp = ArpPacket::gratuitous(iface.mac, cidr.addr);
        self.emit(&iface, MacAddr::BROADCAST, ETHERTYPE_ARP, &garp.to_bytes())
    }

    /// DNS servers used by [`Self::resolve`].
    pub fn dns_servers(&self) -> Vec<Ipv4Addr> {
        self.dns_servers.read().clone()
    }

    /// Replaces the DNS server list.
    pub fn set_dns_servers(&self, servers: Vec<Ipv4Addr>) {
        *self.dns_servers.write() = servers;
    }

    /// Defaults for locally generated datagrams.
    pub fn default_send_options(&self) -> SendOptions {
        SendOptions { ttl: self.config.default_ttl, df: false, tos: 0 }
    }

    fn is_local_addr(&self, ip: Ipv4Addr) -> bool {
        if ip.is_broadcast() || ip.is_loopback() {
            return true;
        }
        self.interfaces.read().iter().filter_map(|i| i.addr).any(|c| c.addr == ip || (c.prefix_len < 31 && c.broadcast() == ip))
    }

    /// Source address for traffic to `dst`.
    pub fn source_for(&self, dst: Ipv4Addr) -> Result<Ipv4Addr> {
        let route = self.routes.lookup(dst)?;
        if route.flags.contains(RouteFlags::LOCAL) {
            return Ok(dst);
        }
        self.interface(route.ifindex)?.addr.map(|c| c.addr).ok_or(NetError::AddrNotAvail)
    }

    pub(crate) fn conn_params(&self, dst: Ipv4Addr) -> ConnParams {
        let mss = self
            .routes
            .lookup(dst)
            .ok()
            .map(|r| if r.flags.contains(RouteFlags::LOCAL) { LOOPBACK_INDEX } else { r.ifindex })
            .and_then(|idx| self.interface(idx).ok())
            .map_or(TCP_DEFAULT_MSS, |i| i.mtu.saturating_sub(IP_HLEN_TCP_HLEN).min(usize::from(u16::MAX)) as u16);
        ConnParams { mss, rcvbuf: self.config.tcp_rcvbuf, sndbuf: self.config.tcp_sndbuf }
    }

    fn next_id(&self) -> u16 {
        self.ip_id.fetch_add(1, Ordering::Relaxed)
    }

    fn packet_error(&self, err: NetError, ifindex: Option<u32>) {
        bump(&self.counters.ip_dropped);
        self.apply_recovery(ErrorKind::of(err), ifindex, err);
    }

    fn apply_recovery(&self, kind: ErrorKind, ifindex: Option<u32>, err: NetError) {
        match self.recovery.handle_kind(kind, self.now_ns()) {
            Some(RecoveryAction::Isolate) => {
                if let Some(idx) = ifindex.filter(|i| *i != LOOPBACK_INDEX) {
                    kos_diag::kwarn!("net: isolating interface {idx} after {err}");
                    let _ = self.set_link(idx, false);
                }
            }
            Some(action) => log::debug!("net: {} ({:?}) -> {:?}", err, kind, action),
            None => {}
        }
    }

    // ---- outbound ----------------------------------------------------------

    fn emit(&self, iface: &Interface, dst: MacAddr, ethertype: u16, payload: &[u8]) -> Result<()> {
        if !iface.is_up() {
            iface.stats.tx_error();
            return Err(NetError::HostUnreachable);
        }
        let mut pkt = Packet::from_payload(payload)?;
        pkt.mark_l3();
        let eth = EthHeader { dst, src: iface.mac, ethertype };
        eth.write(pkt.push(ETH_HLEN)?);
        pkt.mark_l2();
        match iface.device.transmit(pkt.data()) {
            Ok(()) => {
                iface.stats.tx(pkt.len());
                Ok(())
            }
            Err(e) => {
                iface.stats.tx_error();
                let kind = if e == NetError::NoBufs { ErrorKind::NoBufs } else { ErrorKind::Device };
                self.apply_recovery(kind, Some(iface.index), e);
                Err(e)
            }
        }
    }

    fn send_arp_request(&self, iface: &Interface, target: Ipv4Addr) -> Result<()> {
        let spa = iface.addr.map_or(Ipv4Addr::UNSPECIFIED, |c| c.addr);
        bump(&self.counters.arp_requests_sent);
        log::trace!("arp: who-has {} tell {} on {}", target, spa, iface.name);
        self.emit(iface, MacAddr::BROADCAST, ETHERTYPE_ARP, &ArpPacket::request(iface.mac, spa, target).to_bytes())
    }

    /// Resolves `next_hop` and emits the datagram, or parks it until the
    /// ARP reply arrives.
    fn transmit(&self, iface: &Interface, next_hop: Ipv4Addr, datagram: Vec<u8>) -> Result<()> {
        if iface.flags.intersects(IfFlags::LOOPBACK | IfFlags::NOARP) {
            return self.emit(iface, MacAddr::ZERO, ETHERTYPE_IPV4, &datagram);
        }
        let subnet_broadcast = iface.addr.is_some_and(|c| c.prefix_len < 31 && c.broadcast() == next_hop);
        if next_hop.is_broadcast() || subnet_broadcast {
            return self.emit(iface, MacAddr::BROADCAST, ETHERTYPE_IPV4, &datagram);
        }
        if next_hop.is_multicast() {
            return self.emit(iface, MacAddr::ipv4_multicast(next_hop), ETHERTYPE_IPV4, &datagram);
        }
        let now = self.now_ns();
        let request = {
            let mut st = self.arp.lock();
            if let Some(mac) = st.cache.lookup(next_hop, now) {
                drop(st);
                return self.emit(iface, mac, ETHERTYPE_IPV4, &datagram);
            }
            let entry = st.pending.entry(next_hop).or_insert_with(|| Pending {
                ifindex: iface.index,
                datagrams: VecDeque::new(),
                attempts: 0,
                last_request_ns: now,
            });
            if entry.datagrams.len() >= ARP_PENDING_MAX {
                entry.datagrams.pop_front();
                bump(&self.counters.ip_dropped);
            }
            entry.datagrams.push_back(datagram);
            let first = entry.attempts == 0;
            if first {
                entry.attempts = 1;
                entry.last_request_ns = now;
            }
            first
        };
        if request {
            self.send_arp_request(iface, next_hop)?;
        }
        Ok(())
    }

    /// Fragments to the interface MTU, runs POST_ROUTING and transmits.
    fn output(&self, header: &Ipv4Header, payload: &[u8], next_hop: Ipv4Addr, ifindex: u32, forwarded: bool) -> Result<()> {
        let iface = self.interface(ifindex)?;
        let datagrams = match ipv4::fragment(header, payload, iface.mtu) {
            Ok(d) => d,
            Err(NetError::MsgSize) => {
                bump(&self.counters.ip_dropped);
                if forwarded {
                    let mtu = iface.mtu.min(usize::from(u16::MAX)) as u16;
                    self.send_icmp_error(header, payload, UnreachCode::FragNeeded, mtu);
                }
                self.apply_recovery(ErrorKind::MsgSize, Some(ifindex), NetError::MsgSize);
                return Err(NetError::MsgSize);
            }
            Err(e) => return Err(e),
        };
        if datagrams.len() > 1 {
            self.counters.ip_fragments_out.fetch_add(datagrams.len() as u64, Ordering::Relaxed);
        }
        let now = self.now_ns();
        for datagram in datagrams {
            let hdr = Ipv4Header::parse(&datagram)?;
            let nf = NfPacket {
                hook: Hook::PostRouting,
                in_if: None,
                out_if: Some(ifindex),
                header: &hdr,
                payload: &datagram[hdr.header_len()..],
                now_ns: now,
            };
            if self.netfilter.run(&nf) != Verdict::Accept {
                continue;
            }
            bump(&self.counters.ip_out);
            self.transmit(&iface, next_hop, datagram)?;
        }
        Ok(())
    }

    /// Sends a locally generated datagram.
    pub fn send_ipv4(&self, src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload: &[u8], opts: SendOptions) -> Result<()> {
        let route = self.routes.lookup(dst)?;
        let ifindex = if route.flags.contains(RouteFlags::LOCAL) { LOOPBACK_INDEX } else { route.ifindex };
        let src = if src.is_unspecified() { self.source_for(dst).unwrap_or(Ipv4Addr::UNSPECIFIED) } else { src };
        let mut hdr = Ipv4Header::new(src, dst, proto, payload.len())?;
        hdr.id = self.next_id();
        hdr.ttl = opts.ttl;
        hdr.tos = opts.tos;
        if opts.df {
            hdr.flags |= FLAG_DF;
        }
        let nf = NfPacket { hook: Hook::LocalOut, in_if: None, out_if: Some(ifindex), header: &hdr, payload, now_ns: self.now_ns() };
        match self.netfilter.run(&nf) {
            Verdict::Accept => {}
            verdict => {
                log::debug!("net: LOCAL_OUT {:?} for {} -> {}", verdict, src, dst);
                return Ok(());
            }
        }
        self.output(&hdr, payload, route.next_hop(dst), ifindex, false)
    }

    /// Sends one UDP datagram; an unspecified source address is filled in
    /// from the route.
    pub fn send_udp(&self, src: SocketAddrV4, dst: SocketAddrV4, data: &[u8], opts: SendOptions) -> Result<()> {
        let src_ip = if src.ip().is_unspecified() { self.source_for(*dst.ip())? } else { *src.ip() };
        let segment = udp::build_segment(SocketAddrV4::new(src_ip, src.port()), dst, data)?;
        self.send_ipv4(src_ip, *dst.ip(), IPPROTO_UDP, &segment, opts)
    }

    pub(crate) fn send_tcp(&self, segments: Vec<OutSegment>) {
        let opts = self.default_send_options();
        for seg in segments {
            bump(&self.counters.tcp_out);
            if let Err(e) = self.send_ipv4(*seg.src.ip(), *seg.dst.ip(), IPPROTO_TCP, &seg.to_bytes(), opts) {
                log::debug!("tcp {} -> {}: send failed: {}", seg.src, seg.dst, e);
            }
        }
    }

    fn send_icmp(&self, dst: Ipv4Addr, msg: &IcmpMessage) {
        bump(&self.counters.icmp_out);
        if let Err(e) = self.send_ipv4(Ipv4Addr::UNSPECIFIED, dst, IPPROTO_ICMP, &msg.to_bytes(), self.default_send_options()) {
            log::debug!("icmp: to {} failed: {}", dst, e);
        }
    }

    /// Replies to `header` with an error quoting it. Never answers ICMP
    /// errors, broadcasts or non-first fragments.
    fn send_icmp_error(&self, header: &Ipv4Header, payload: &[u8], code: UnreachCode, mtu: u16) {
        if header.dst.is_broadcast() || header.dst.is_multicast() || header.frag_offset != 0 || header.src.is_unspecified() {
            return;
        }
        if header.proto == IPPROTO_ICMP && IcmpMessage::parse(payload).map_or(true, |m| m.is_error()) {
            return;
        }
        let data = icmp::quote(&ipv4::build_datagram(header, payload), header.header_len());
        self.send_icmp(header.src, &IcmpMessage::DestUnreachable { code, mtu, data });
    }

    fn send_time_exceeded(&self, header: &Ipv4Header, payload: &[u8]) {
        if header.dst.is_broadcast() || header.frag_offset != 0 {
            return;
        }
        let data = icmp::quote(&ipv4::build_datagram(header, payload), header.header_len());
        self.send_icmp(header.src, &IcmpMessage::TimeExceeded { code: 0, data });
    }

    /// Sends an echo request.
    pub fn ping(&self, dst: Ipv4Addr, id: u16, seq: u16, data: &[u8]) -> Result<()> {
        let msg = IcmpMessage::EchoRequest { id, seq, data: data.to_vec() };
        bump(&self.counters.icmp_out);
        self.send_ipv4(Ipv4Addr::UNSPECIFIED, dst, IPPROTO_ICMP, &msg.to_bytes(), self.default_send_options())
    }

    /// Drains the echo replies received so far.
    pub fn take_echo_replies(&self) -> Vec<EchoReply> {
        self.echo_replies.lock().drain(..).collect()
    }

    // ---- inbound -----------------------------------------------------------

    /// Processes one received Ethernet frame.
    pub fn receive_frame(&self, ifindex: u32, frame: &[u8]) {
        let Ok(iface) = self.interface(ifindex) else {
            return;
        };
        let now = self.now_ns();
        if !iface.is_up() {
            iface.stats.rx_drop();
            bump(&self.counters.rx_dropped);
            return;
        }
        let mut pkt = Packet::from_frame(frame);
        pkt.set_ifindex(ifindex);
        pkt.set_timestamp_ns(now);
        pkt.mark_l2();
        let eth = match EthHeader::parse(pkt.data()) {
            Ok(h) => h,
            Err(e) => {
                iface.stats.rx_drop();
                bump(&self.counters.rx_dropped);
                self.apply_recovery(ErrorKind::of(e), Some(ifindex), e);
                return;
            }
        };
        if !iface.accepts(eth.dst) {
            iface.stats.rx_drop();
            bump(&self.counters.rx_dropped);
            return;
        }
        iface.stats.rx(frame.len());
        bump(&self.counters.rx_frames);
        let mut ethertype = eth.ethertype;
        let mut strip = pkt.pull(ETH_HLEN);
        if strip.is_ok() && ethertype == ETHERTYPE_VLAN {
            match VlanTag::parse(pkt.data()) {
                Ok(tag) => {
                    bump(&self.counters.vlan_frames);
                    log::trace!("eth: vlan {} on {}", tag.vid, iface.name);
                    ethertype = tag.inner_ethertype;
                    strip = pkt.pull(VLAN_HLEN);
                }
                Err(e) => strip = Err(e),
            }
        }
        if let Err(e) = strip {
            bump(&self.counters.rx_dropped);
            self.apply_recovery(ErrorKind::of(e), Some(ifindex), e);
            return;
        }
        pkt.mark_l3();
        match ethertype {
            ETHERTYPE_ARP => self.arp_input(&iface, pkt.data(), now),
            ETHERTYPE_IPV4 => self.ipv4_input(&iface, pkt, now),
            ETHERTYPE_IPV6 => {
                bump(&self.counters.ipv6_dropped);
                match Ipv6Header::parse(pkt.data()) {
                    Ok(h) => log::trace!("ipv6: {} -> {} next {} dropped", h.src, h.dst, h.next_header),
                    Err(e) => self.apply_recovery(ErrorKind::of(e), Some(ifindex), e),
                }
            }
            other => {
                bump(&self.counters.rx_dropped);
                log::trace!("eth: unknown ethertype {:#06x} on {}", other, iface.name);
            }
        }
    }

    fn arp_input(&self, iface: &Interface, data: &[u8], now: u64) {
        let arp = match ArpPacket::parse(data) {
            Ok(a) => a,
            Err(e) => {
                self.packet_error(e, Some(iface.index));
                return;
            }
        };
        let my_ip = iface.addr.map(|c| c.addr);
        let for_me = my_ip == Some(arp.tpa) && !arp.is_gratuitous();
        let flushed = {
            let mut st = self.arp.lock();
            let mut learned = !arp.spa.is_unspecified() && st.cache.update_existing(arp.spa, arp.sha, now);
            if !learned && for_me && !arp.spa.is_unspecified() {
                match st.cache.insert(arp.spa, arp.sha, now, false) {
                    Ok(()) => learned = true,
                    Err(e) => log::debug!("arp: cannot cache {}: {}", arp.spa, e),
                }
            }
            if learned {
                st.pending.remove(&arp.spa)
            } else {
                None
            }
        };
        if for_me && arp.op == ArpOp::Request {
            if let Some(ip) = my_ip {
                bump(&self.counters.arp_replies_sent);
                log::trace!("arp: {} is-at {} for {}", ip, iface.mac, arp.spa);
                let reply = ArpPacket::reply_to(&arp, iface.mac);
                let _ = self.emit(iface, arp.sha, ETHERTYPE_ARP, &reply.to_bytes());
            }
        }
        if let Some(pending) = flushed {
            log::debug!("arp: {} resolved to {}, flushing {}", arp.spa, arp.sha, pending.datagrams.len());
            let out_iface = self.interface(pending.ifindex).ok();
            for datagram in pending.datagrams {
                if let Some(out) = &out_iface {
                    let _ = self.emit(out, arp.sha, ETHERTYPE_IPV4, &datagram);
                }
            }
        }
    }

    fn ipv4_input(&self, iface: &Interface, mut pkt: Packet, now: u64) {
        let hdr = match Ipv4Header::parse(pkt.data()) {
            Ok(h) => h,
            Err(e) => {
                self.packet_error(e, Some(iface.index));
                return;
            }
        };
        bump(&self.counters.ip_in);
        pkt.trim(usize::from(hdr.total_len));
        let hlen = hdr.header_len();
        if let Err(e) = pkt.pull(hlen) {
            self.packet_error(e, Some(iface.index));
            return;
        }
        pkt.mark_l4();
        let local = self.is_local_addr(hdr.dst);
        if !local && hdr.ttl <= 1 {
            bump(&self.counters.ip_dropped);
            self.send_time_exceeded(&hdr, pkt.data());
            return;
        }
        let (hdr, payload): (Ipv4Header, Cow<'_, [u8]>) = if local && hdr.is_fragment() {
            match self.reasm.lock().insert(&hdr, pkt.data(), now) {
                Ok(Some(whole)) => (whole.header, Cow::Owned(whole.payload)),
                Ok(None) => return,
                Err(e) => {
                    self.packet_error(e, Some(iface.index));
                    return;
                }
            }
        } else {
            (hdr, Cow::Borrowed(pkt.data()))
        };

        let mut nf = NfPacket { hook: Hook::PreRouting, in_if: Some(iface.index), out_if: None, header: &hdr, payload: &payload, now_ns: now };
        if self.netfilter.run(&nf) != Verdict::Accept {
            return;
        }
        if !local {
            self.forward(iface, &hdr, &payload, now);
            return;
        }
        nf.hook = Hook::LocalIn;
        if self.netfilter.run(&nf) != Verdict::Accept {
            return;
        }
        bump(&self.counters.ip_delivered);
        match hdr.proto {
            IPPROTO_ICMP => self.icmp_input(iface, &hdr, &payload, now),
            IPPROTO_UDP => self.udp_input(iface, &hdr, &payload, now),
            IPPROTO_TCP => self.tcp_input(iface, &hdr, &payload, now),
            _ => self.send_icmp_error(&hdr, &payload, UnreachCode::Protocol, 0),
        }
    }

    fn forward(&self, iface: &Interface, hdr: &Ipv4Header, payload: &[u8], now: u64) {
        if !self.config.ip_forward {
            bump(&self.counters.ip_dropped);
            return;
        }
        let route = match self.routes.lookup(hdr.dst) {
            Ok(r) => r,
            Err(e) => {
                bump(&self.counters.ip_dropped);
                self.send_icmp_error(hdr, payload, UnreachCode::Net, 0);
                self.apply_recovery(ErrorKind::of(e), Some(iface.index), e);
                return;
            }
        };
        let nf = NfPacket { hook: Hook::Forward, in_if: Some(iface.index), out_if: Some(route.ifindex), header: hdr, payload, now_ns: now };
        if self.netfilter.run(&nf) != Verdict::Accept {
            return;
        }
        let mut out = hdr.clone();
        out.ttl -= 1;
        bump(&self.counters.ip_forwarded);
        if let Err(e) = self.output(&out, payload, route.next_hop(hdr.dst), route.ifindex, true) {
            log::debug!("net: forward {} -> {} failed: {}", hdr.src, hdr.dst, e);
        }
    }

    fn icmp_input(&self, iface: &Interface, hdr: &Ipv4Header, payload: &[u8], now: u64) {
        bump(&self.counters.icmp_in);
        let msg = match IcmpMessage::parse(payload) {
            Ok(m) => m,
            Err(e) => {
                self.packet_error(e, Some(iface.index));
                return;
            }
        };
        match msg {
            IcmpMessage::EchoRequest { id, seq, data } => {
                if hdr.dst.is_broadcast() {
                    return;
                }
                let reply = IcmpMessage::EchoReply { id, seq, data };
                bump(&self.counters.icmp_out);
                if let Err(e) = self.send_ipv4(hdr.dst, hdr.src, IPPROTO_ICMP, &reply.to_bytes(), self.default_send_options()) {
                    log::debug!("icmp: echo reply to {} failed: {}", hdr.src, e);
                }
            }
            IcmpMessage::EchoReply { id, seq, data } => {
                let mut q = self.echo_replies.lock();
                if q.len() >= ECHO_QUEUE_LEN {
                    q.pop_front();
                }
                q.push_back(EchoReply { from: hdr.src, id, seq, data, received_ns: now });
            }
            IcmpMessage::Redirect { gateway, data, .. } => {
                // The quote is truncated, so only the fixed header is read.
                if data.len() < ipv4::IPV4_MIN_HLEN {
                    log::debug!("icmp: redirect with short quote from {}", hdr.src);
                    return;
                }
                let target = Ipv4Addr::new(data[16], data[17], data[18], data[19]);
                log::info!("icmp: redirect {} via {} from {}", target, gateway, hdr.src);
                if let Err(e) = self.routes.add_redirect(target, gateway, iface.index) {
                    log::debug!("icmp: redirect ignored: {}", e);
                }
            }
            IcmpMessage::DestUnreachable { code, mtu, .. } => {
                log::debug!("icmp: {} reports {:?} (mtu {})", hdr.src, code, mtu);
                self.apply_recovery(ErrorKind::HostUnreachable, Some(iface.index), NetError::HostUnreachable);
            }
            IcmpMessage::TimeExceeded { code, .. } => log::debug!("icmp: time exceeded code {} from {}", code, hdr.src),
            IcmpMessage::Other { kind, code, .. } => log::trace!("icmp: ignoring type {} code {}", kind, code),
        }
    }

    fn udp_input(&self, iface: &Interface, hdr: &Ipv4Header, payload: &[u8], now: u64) {
        let (uh, data) = match udp::parse_segment(hdr.src, hdr.dst, payload) {
            Ok(v) => v,
            Err(e) => {
                self.packet_error(e, Some(iface.index));
                return;
            }
        };
        bump(&self.counters.udp_in);
        let from = SocketAddrV4::new(hdr.src, uh.sport);
        match self.udp.lookup(hdr.dst, uh.dport) {
            Some(ep) => {
                if !ep.deliver(from, data) {
                    bump(&self.counters.udp_rcvbuf_drops);
                }
            }
            None if uh.dport == DHCP_CLIENT_PORT && self.dhcp.lock().contains_key(&iface.index) => {
                self.dhcp_input(iface.index, data, now);
            }
            None => {
                bump(&self.counters.udp_no_port);
                self.send_icmp_error(hdr, payload, UnreachCode::Port, 0);
            }
        }
    }

    fn tcp_input(&self, iface: &Interface, hdr: &Ipv4Header, payload: &[u8], now: u64) {
        let (th, data) = match tcp::parse_segment(hdr.src, hdr.dst, payload) {
            Ok(v) => v,
            Err(e) => {
                self.packet_error(e, Some(iface.index));
                return;
            }
        };
        bump(&self.counters.tcp_in);
        let local = SocketAddrV4::new(hdr.dst, th.dport);
        let remote = SocketAddrV4::new(hdr.src, th.sport);
        let out = self.tcp.input(local, remote, &th, data, self.conn_params(hdr.src), now);
        self.send_tcp(out);
    }

    // ---- sockets -----------------------------------------------------------

    /// Binds a UDP socket; port 0 picks an ephemeral port.
    pub fn udp_bind(self: &Arc<Self>, addr: SocketAddrV4, reuse: bool) -> Result<UdpSocket> {
        let endpoint = self.udp.bind(addr, reuse, self.config.udp_rcvbuf)?;
        Ok(UdpSocket::new(Arc::clone(self), endpoint))
    }

    /// Fresh unbound TCP socket.
    pub fn tcp_socket(self: &Arc<Self>) -> TcpSocket {
        TcpSocket::new(Arc::clone(self))
    }

    /// Resolves `name` to IPv4 addresses through the cache and the
    /// configured servers. Needs the worker (or another thread polling).
    pub fn resolve(self: &Arc<Self>, name: &str, timeout: Duration) -> Result<Vec<Ipv4Addr>> {
        if let Ok(ip) = name.parse::<Ipv4Addr>() {
            return Ok(vec![ip]);
        }
        if name.eq_ignore_ascii_case("localhost") {
            return Ok(vec![Ipv4Addr::LOCALHOST]);
        }
        if let Some(hit) = self.dns_cache.lock().lookup(name, self.now_ns()) {
            return Ok(hit);
        }
        let servers = self.dns_servers();
        if servers.is_empty() {
            return Err(NetError::NotFound);
        }
        let id = rand::random::<u16>();
        let query = Message::query(id, name, TYPE_A).to_bytes()?;
        let sock = self.udp_bind(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, 0), false)?;
        let per_server = timeout / servers.len() as u32;
        for server in servers {
            sock.send_to(&query, SocketAddrV4::new(server, DNS_PORT))?;
            let until = Instant::now() + per_server;
            loop {
                let left = until.saturating_duration_since(Instant::now());
                let dgram = match sock.recv_timeout(left) {
                    Ok(d) => d,
                    Err(NetError::TimedOut) => break,
                    Err(e) => return Err(e),
                };
                let Ok(msg) = Message::parse(&dgram.data) else {
                    continue;
                };
                if *dgram.from.ip() != server || msg.id != id || !msg.is_response() {
                    continue;
                }
                if msg.rcode() != 0 {
                    return Err(NetError::NotFound);
                }
                let answers = msg.addresses_for(name);
                if answers.is_empty() {
                    return Err(NetError::NotFound);
                }
                let ttl = answers.iter().map(|(_, t)| *t).min().unwrap_or(0);
                let addrs: Vec<Ipv4Addr> = answers.into_iter().map(|(a, _)| a).collect();
                self.dns_cache.lock().insert(name, addrs.clone(), ttl, self.now_ns());
                log::debug!("dns: {} -> {:?} (ttl {})", name, addrs, ttl);
                return Ok(addrs);
            }
            log::debug!("dns: {} did not answer for {}", server, name);
        }
        Err(NetError::TimedOut)
    }

    // ---- DHCP --------------------------------------------------------------

    /// Starts the DHCP client on an interface.
    pub fn dhcp_start(&self, ifindex: u32) -> Result<()> {
        let iface = self.interface(ifindex)?;
        if iface.flags.intersects(IfFlags::LOOPBACK | IfFlags::NOARP) {
            return Err(NetError::NotSupported);
        }
        let action = {
            let mut sessions = self.dhcp.lock();
            let client = sessions.entry(ifindex).or_insert_with(|| DhcpClient::new(iface.mac, rand::random::<u32>()));
            client.start(self.now_ns())
        };
        self.perform_dhcp(ifindex, vec![action]);
        Ok(())
    }

    /// Releases the lease and stops the client.
    pub fn dhcp_release(&self, ifindex: u32) -> Result<()> {
        let actions = {
            let mut sessions = self.dhcp.lock();
            let mut client = sessions.remove(&ifindex).ok_or(NetError::NotFound)?;
            client.release()
        };
        self.perform_dhcp(ifindex, actions);
        Ok(())
    }

    /// Client state on an interface.
    pub fn dhcp_state(&self, ifindex: u32) -> Option<DhcpState> {
        self.dhcp.lock().get(&ifindex).map(|c| c.state())
    }

    /// Lease held on an interface.
    pub fn dhcp_lease(&self, ifindex: u32) -> Option<Lease> {
        self.dhcp.lock().get(&ifindex).and_then(|c| c.lease().cloned())
    }

    fn dhcp_input(&self, ifindex: u32, data: &[u8], now: u64) {
        let msg = match DhcpMessage::parse(data) {
            Ok(m) => m,
            Err(e) => {
                self.packet_error(e, Some(ifindex));
                return;
            }
        };
        let actions = match self.dhcp.lock().get_mut(&ifindex) {
            Some(client) => client.handle(&msg, now),
            None => return,
        };
        self.perform_dhcp(ifindex, actions);
    }

    fn perform_dhcp(&self, ifindex: u32, actions: Vec<DhcpAction>) {
        for action in actions {
            if let Err(e) = self.dhcp_action(ifindex, action) {
                log::warn!("dhcp: action on {} failed: {}", ifindex, e);
            }
        }
    }

    fn dhcp_action(&self, ifindex: u32, action: DhcpAction) -> Result<()> {
        let iface = self.interface(ifindex)?;
        match action {
            DhcpAction::Broadcast(msg) => {
                let src_ip = iface.addr.map_or(Ipv4Addr::UNSPECIFIED, |c| c.addr);
                let segment = udp::build_segment(
                    SocketAddrV4::new(src_ip, DHCP_CLIENT_PORT),
                    SocketAddrV4::new(Ipv4Addr::BROADCAST, DHCP_SERVER_PORT),
                    &msg.to_bytes()?,
                )?;
                let mut hdr = Ipv4Header::new(src_ip, Ipv4Addr::BROADCAST, IPPROTO_UDP, segment.len())?;
                hdr.id = self.next_id();
                hdr.ttl = self.config.default_ttl;
                bump(&self.counters.ip_out);
                self.emit(&iface, MacAddr::BROADCAST, ETHERTYPE_IPV4, &ipv4::build_datagram(&hdr, &segment))
            }
            DhcpAction::Unicast(server, msg) => {
                let src_ip = iface.addr.map(|c| c.addr).ok_or(NetError::AddrNotAvail)?;
                self.send_udp(
                    SocketAddrV4::new(src_ip, DHCP_CLIENT_PORT),
                    SocketAddrV4::new(server, DHCP_SERVER_PORT),
                    &msg.to_bytes()?,
                    self.default_send_options(),
                )
            }
            DhcpAction::Configure(lease) => {
                self.set_ipv4(ifindex, Ipv4Cidr::new(lease.addr, lease.prefix_len)?)?;
                if let Some(gw) = lease.gateway {
                    match self.routes.add_default(gw, ifindex, 0) {
                        Ok(()) | Err(NetError::Exists) => {}
                        Err(e) => return Err(e),
                    }
                }
                if !lease.dns_servers.is_empty() {
                    self.set_dns_servers(lease.dns_servers.clone());
                }
                self.announce(ifindex)
            }
            DhcpAction::Deconfigure => self.clear_ipv4(ifindex),
        }
    }

    // ---- timers and the worker ---------------------------------------------

    /// Processes the frames queued on every device right now; returns how
    /// many were handled. Frames produced meanwhile wait for the next call.
    pub fn poll(&self) -> usize {
        let ifaces = self.interfaces();
        let mut handled = 0;
        for iface in ifaces {
            for _ in 0..iface.device.pending() {
                let Some(frame) = iface.device.receive() else {
                    break;
                };
                self.receive_frame(iface.index, &frame);
                handled += 1;
            }
        }
        handled
    }

    /// Polls until no device has queued frames, at most `max_rounds` times.
    pub fn poll_until_idle(&self, max_rounds: usize) -> usize {
        let mut total = 0;
        for _ in 0..max_rounds {
            let n = self.poll();
            if n == 0 {
                break;
            }
            total += n;
        }
        total
    }

    fn arp_tick(&self, now: u64) {
        let mut retry = Vec::new();
        {
            let mut st = self.arp.lock();
            st.cache.gc(now);
            let mut dead = Vec::new();
            for (ip, p) in st.pending.iter_mut() {
                if now.saturating_sub(p.last_request_ns) < ARP_RETRY_NS {
                    continue;
                }
                if p.attempts >= ARP_RETRIES {
                    dead.push(*ip);
                } else {
                    p.attempts += 1;
                    p.last_request_ns = now;
                    retry.push((p.ifindex, *ip));
                }
            }
            for ip in dead {
                if let Some(p) = st.pending.remove(&ip) {
                    log::debug!("arp: {} unresolved, dropping {} datagrams", ip, p.datagrams.len());
                    self.counters.arp_unresolved.fetch_add(p.datagrams.len() as u64, Ordering::Relaxed);
                }
            }
        }
        for (ifindex, ip) in retry {
            if let Ok(iface) = self.interface(ifindex) {
                let _ = self.send_arp_request(&iface, ip);
            }
        }
    }

    /// Runs every periodic duty once: TCP timers, ARP retries and expiry,
    /// reassembly timeouts, the conntrack sweep, route GC, DNS cache purge
    /// and DHCP timers.
    pub fn tick(&self) {
        let now = self.now_ns();
        let segments = self.tcp.on_timer(now);
        self.send_tcp(segments);
        self.arp_tick(now);
        let expired = self.reasm.lock().expire(now);
        if expired > 0 {
            log::debug!("ipv4: {} reassembly flows timed out", expired);
        }
        self.conntrack.sweep(now);
        let last = self.last_route_gc_ns.load(Ordering::Relaxed);
        if now.saturating_sub(last) >= ROUTE_GC_INTERVAL_NS {
            self.last_route_gc_ns.store(now, Ordering::Relaxed);
            self.routes.gc();
        }
        self.dns_cache.lock().purge(now);
        let due: Vec<(u32, Vec<DhcpAction>)> = self
            .dhcp
            .lock()
            .iter_mut()
            .map(|(idx, c)| (*idx, c.on_timer(now)))
            .filter(|(_, a)| !a.is_empty())
            .collect();
        for (ifindex, actions) in due {
            self.perform_dhcp(ifindex, actions);
        }
    }

    /// Starts the worker thread that polls devices and runs timers.
    pub fn start(self: &Arc<Self>) -> Result<()> {
        if self.running.swap(true, Ordering::AcqRel) {
            return Err(NetError::Already);
        }
        let weak: Weak<Self> = Arc::downgrade(self);
        let interval = Duration::from_millis(self.config.poll_interval_ms.max(1));
        let handle = std::thread::Builder::new()
            .name("kos-netstack".into())
            .spawn(move || loop {
                let Some(stack) = weak.upgrade() else {
                    break;
                };
                if !stack.running.load(Ordering::Acquire) {
                    break;
                }
                let handled = stack.poll();
                stack.tick();
                drop(stack);
                if handled == 0 {
                    std::thread::sleep(interval);
                }
            })
            .map_err(|e| {
                log::error!("net: cannot spawn worker: {}", e);
                self.running.store(false, Ordering::Release);
                NetError::NoBufs
            })?;
        *self.worker.lock() = Some(handle);
        log::info!("net: worker started");
        Ok(())
    }

    /// True while the worker runs.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Stops the worker, aborts every connection and closes every socket,
    /// waking all blocked callers.
    pub fn shutdown(&self) {
        self.running.store(false, Ordering::Release);
        if let Some(handle) = self.worker.lock().take() {
            if handle.join().is_err() {
                kos_diag::kwarn!("net: worker thread panicked");
            }
        }
        let segments = self.tcp.shutdown();
        self.send_tcp(segments);
        self.udp.close_all();
        self.arp.lock().pending.clear();
        log::info!("net: stack shut down");
    }

    /// Counter snapshot.
    pub fn stats(&self) -> NetStats {
        let c = &self.counters;
        NetStats {
            rx_frames: load(&c.rx_frames),
            rx_dropped: load(&c.rx_dropped),
            vlan_frames: load(&c.vlan_frames),
            arp_requests_sent: load(&c.arp_requests_sent),
            arp_replies_sent: load(&c.arp_replies_sent),
            arp_unresolved: load(&c.arp_unresolved),
            ip_in: load(&c.ip_in),
            ip_delivered: load(&c.ip_delivered),
            ip_forwarded: load(&c.ip_forwarded),
            ip_out: load(&c.ip_out),
            ip_dropped: load(&c.ip_dropped),
            ip_fragments_out: load(&c.ip_fragments_out),
            ipv6_dropped: load(&c.ipv6_dropped),
            icmp_in: load(&c.icmp_in),
            icmp_out: load(&c.icmp_out),
            udp_in: load(&c.udp_in),
            udp_no_port: load(&c.udp_no_port),
            udp_rcvbuf_drops: load(&c.udp_rcvbuf_drops),
            tcp_in: load(&c.tcp_in),
            tcp_out: load(&c.tcp_out),
            reassembly: self.reasm.lock().stats(),
            routes: self.routes.stats(),
            conntrack: self.conntrack.stats(),
            recovery: self.recovery.stats(),
            dns_cache: self.dns_cache.lock().stats(),
            interfaces: self.interfaces.read().iter().map(|i| (i.name.clone(), i.stats.snapshot())).collect(),
        }
    }

    /// ARP cache lookup.
    pub fn arp_lookup(&self, ip: Ipv4Addr) -> Option<MacAddr> {
        let now = self.now_ns();
        self.arp.lock().cache.lookup(ip, now)
    }

    /// Adds a permanent ARP entry.
    pub fn arp_add_static(&self, ip: Ipv4Addr, mac: MacAddr) -> Result<()> {
        let now = self.now_ns();
        self.arp.lock().cache.insert(ip, mac, now, true)
    }

    /// Datagrams parked waiting for ARP.
    pub fn arp_pending(&self) -> usize {
        self.arp.lock().pending.values().map(|p| p.datagrams.len()).sum()
    }
}

impl Drop for NetStack {
    fn drop(&mut self) {
        self.running.store(false, Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InterfaceConfig;
    use kos_abi::time::ManualClock;

    fn stack_with_eth0() -> (Arc<NetStack>, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::new(1_000));
        let cfg = NetConfig {
            interfaces: vec![InterfaceConfig {
                name: "eth0".into(),
                mac: Some("02:00:00:00:00:01".into()),
                ipv4: Some(Ipv4Addr::new(10, 0, 0, 1)),
                ..InterfaceConfig::default()
            }],
            ..NetConfig::default()
        };
        let stack = NetStack::new(cfg, clock.clone()).expect("stack");
        (stack, clock)
    }

    #[test]
    fn loopback_and_configured_interface() {
        let (stack, _) = stack_with_eth0();
        let lo = stack.interface(LOOPBACK_INDEX).expect("lo");
        assert!(lo.flags.contains(IfFlags::LOOPBACK | IfFlags::NOARP));
        assert_eq!(stack.interface_by_name("eth0"), Some(1));
        assert!(stack.routes().is_local(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(stack.source_for(Ipv4Addr::new(10, 0, 0, 7)), Ok(Ipv4Addr::new(10, 0, 0, 1)));
        assert_eq!(stack.source_for(Ipv4Addr::new(8, 8, 8, 8)), Err(NetError::NoRoute));
        assert_eq!(stack.add_interface("eth0", MacAddr::ZERO, 1500, Arc::new(CaptureDevice::new())), Err(NetError::Exists));
    }

    #[test]
    fn ping_over_loopback() {
        let (stack, _) = stack_with_eth0();
        stack.ping(Ipv4Addr::new(10, 0, 0, 1), 7, 1, b"abc").expect("ping");
        stack.poll_until_idle(8);
        let replies = stack.take_echo_replies();
        assert_eq!(replies.len(), 1);
        assert_eq!((replies[0].from, replies[0].id, replies[0].seq), (Ipv4Addr::new(10, 0, 0, 1), 7, 1));
        assert_eq!(replies[0].data, b"abc");
    }

    #[test]
    fn udp_to_closed_port_counts_and_answers() {
        let (stack, _) = stack_with_eth0();
        let sock = stack.udp_bind(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0), false).expect("bind");
        sock.send_to(b"x", SocketAddrV4::new(Ipv4Addr::LOCALHOST, 9)).expect("send");
        stack.poll_until_idle(8);
        let st = stack.stats();
        assert_eq!(st.udp_no_port, 1);
        assert_eq!(st.icmp_in, 1);
    }

    #[test]
    fn down_link_drops_frames() {
        let (stack, _) = stack_with_eth0();
        stack.set_link(1, false).expect("down");
        stack.receive_frame(1, &[0xff; 60]);
        assert_eq!(stack.stats().rx_dropped, 1);
        assert_eq!(stack.interface(1).expect("eth0").stats.snapshot().rx_dropped, 1);
    }

    #[test]
    fn ipv6_is_counted_and_dropped() {
        let (stack, _) = stack_with_eth0();
        let ip6 = Ipv6Header {
            traffic_class: 0,
            flow_label: 0,
            payload_len: 0,
            next_header: 59,
            hop_limit: 64,
            src: std::net::Ipv6Addr::LOCALHOST,
            dst: std::net::Ipv6Addr::LOCALHOST,
        };
        let frame = crate::ethernet::build_frame(MacAddr::BROADCAST, MacAddr::local(9), ETHERTYPE_IPV6, &ip6.to_bytes());
        stack.receive_frame(1, &frame);
        assert_eq!(stack.stats().ipv6_dropped, 1);
    }

    #[test]
    fn stats_serialize() {
        let (stack, _) = stack_with_eth0();
        let json = serde_json::to_value(stack.stats()).expect("json");
        assert_eq!(json["interfaces"][0][0], "lo");
        assert_eq!(json["ip_in"], 0);
    }
}
