// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! DHCP client (RFC 2131): BOOTP codec plus an event-driven state machine
//! that emits [`DhcpAction`]s for the stack to carry out.

use std::net::Ipv4Addr;

use serde::Serialize;

use crate::error::{NetError, Result};
use crate::ethernet::MacAddr;
use crate::ipv4::mask_to_prefix;

/// Server port.
pub const DHCP_SERVER_PORT: u16 = 67;
/// Client port.
pub const DHCP_CLIENT_PORT: u16 = 68;
/// Fixed BOOTP part.
pub const BOOTP_LEN: usize = 236;
/// Options cookie.
pub const DHCP_MAGIC: u32 = 0x6382_5363;
/// First retransmission delay.
pub const DHCP_RETRY_INITIAL_NS: u64 = 4_000_000_000;
/// Retransmission delay cap.
pub const DHCP_RETRY_MAX_NS: u64 = 64_000_000_000;
/// Attempts per phase before restarting discovery.
pub const DHCP_MAX_ATTEMPTS: u32 = 5;

const OP_REQUEST: u8 = 1;
const OP_REPLY: u8 = 2;
const FLAG_BROADCAST: u16 = 0x8000;
const SEC: u64 = 1_000_000_000;

const OPT_PAD: u8 = 0;
const OPT_SUBNET_MASK: u8 = 1;
const OPT_ROUTER: u8 = 3;
const OPT_DNS: u8 = 6;
const OPT_REQUESTED_IP: u8 = 50;
const OPT_LEASE_TIME: u8 = 51;
const OPT_MESSAGE_TYPE: u8 = 53;
const OPT_SERVER_ID: u8 = 54;
const OPT_PARAM_LIST: u8 = 55;
const OPT_RENEWAL_TIME: u8 = 58;
const OPT_REBINDING_TIME: u8 = 59;
const OPT_CLIENT_ID: u8 = 61;
const OPT_END: u8 = 255;

/// Option 53 values.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum MessageType {
    /// Client looks for servers.
    Discover = 1,
    /// Server offers an address.
    Offer = 2,
    /// Client requests the offered address.
    Request = 3,
    /// Client found the address in use.
    Decline = 4,
    /// Server confirms.
    Ack = 5,
    /// Server refuses.
    Nak = 6,
    /// Client gives the address back.
    Release = 7,
    /// Client asks for parameters only.
    Inform = 8,
}

impl MessageType {
    fn from_u8(v: u8) -> Option<Self> {
        Some(match v {
            1 => Self::Discover,
            2 => Self::Offer,
            3 => Self::Request,
            4 => Self::Decline,
            5 => Self::Ack,
            6 => Self::Nak,
            7 => Self::Release,
            8 => Self::Inform,
            _ => return None,
        })
    }
}

/// Decoded option.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DhcpOption {
    /// 53.
    MessageType(MessageType),
    /// 61.
    ClientId(Vec<u8>),
    /// 50.
    RequestedIp(Ipv4Addr),
    /// 54.
    ServerId(Ipv4Addr),
    /// 51, seconds.
    LeaseTime(u32),
    /// 58, seconds.
    RenewalTime(u32),
    /// 59, seconds.
    RebindingTime(u32),
    /// 1.
    SubnetMask(Ipv4Addr),
    /// 3.
    Router(Vec<Ipv4Addr>),
    /// 6.
    DnsServers(Vec<Ipv4Addr>),
    /// 55.
    ParamList(Vec<u8>),
    /// Unrecognised option.
    Other {
        /// Option code.
        code: u8,
        /// Raw value.
        data: Vec<u8>,
    },
}

fn addr_list(data: &[u8]) -> Result<Vec<Ipv4Addr>> {
    if data.is_empty() || data.len() % 4 != 0 {
        return Err(NetError::Malformed("dhcp address list"));
    }
    Ok(data.chunks_exact(4).map(|c| Ipv4Addr::new(c[0], c[1], c[2], c[3])).collect())
}

fn one_addr(data: &[u8]) -> Result<Ipv4Addr> {
    match data {
        [a, b, c, d] => Ok(Ipv4Addr::new(*a, *b, *c, *d)),
        _ => Err(NetError::Malformed("dhcp address option")),
    }
}

fn secs(data: &[u8]) -> Result<u32> {
    match data {
        [a, b, c, d] => Ok(u32::from_be_bytes([*a, *b, *c, *d])),
        _ => Err(NetError::Malformed("dhcp time option")),
    }
}

impl DhcpOption {
    fn decode(code: u8, data: &[u8]) -> Result<Self> {
        Ok(match code {
            OPT_MESSAGE_TYPE => match data {
                [t] => Self::MessageType(MessageType::from_u8(*t).ok_or(NetError::Malformed("dhcp message type"))?),
                _ => return Err(NetError::Malformed("dhcp message type")),
            },
            OPT_CLIENT_ID => Self::ClientId(data.to_vec()),
            OPT_REQUESTED_IP => Self::RequestedIp(one_addr(data)?),
            OPT_SERVER_ID => Self::ServerId(one_addr(data)?),
            OPT_LEASE_TIME => Self::LeaseTime(secs(data)?),
            OPT_RENEWAL_TIME => Self::RenewalTime(secs(data)?),
            OPT_REBINDING_TIME => Self::RebindingTime(secs(data)?),
            OPT_SUBNET_MASK => Self::SubnetMask(one_addr(data)?),
            OPT_ROUTER => Self::Router(addr_list(data)?),
            OPT_DNS => Self::DnsServers(addr_list(data)?),
            OPT_PARAM_LIST => Self::ParamList(data.to_vec()),
            _ => Self::Other { code, data: data.to_vec() },
        })
    }

    fn encode(&self, out: &mut Vec<u8>) -> Result<()> {
        let (code, data): (u8, Vec<u8>) = match self {
            Self::MessageType(t) => (OPT_MESSAGE_TYPE, vec![*t as u8]),
            Self::ClientId(id) => (OPT_CLIENT_ID, id.clone()),
            Self::RequestedIp(ip) => (OPT_REQUESTED_IP, ip.octets().to_vec()),
            Self::ServerId(ip) => (OPT_SERVER_ID, ip.octets().to_vec()),
            Self::LeaseTime(s) => (OPT_LEASE_TIME, s.to_be_bytes().to_vec()),
            Self::RenewalTime(s) => (OPT_RENEWAL_TIME, s.to_be_bytes().to_vec()),
            Self::RebindingTime(s) => (OPT_REBINDING_TIME, s.to_be_bytes().to_vec()),
            Self::SubnetMask(m) => (OPT_SUBNET_MASK, m.octets().to_vec()),
            Self::Router(list) => (OPT_ROUTER, list.iter().flat_map(|a| a.octets()).collect()),
            Self::DnsServers(list) => (OPT_DNS, list.iter().flat_map(|a| a.octets()).collect()),
            Self::ParamList(p) => (OPT_PARAM_LIST, p.clone()),
            Self::Other { code, data } => (*code, data.clone()),
        };
        let len = u8::try_from(data.len()).map_err(|_| NetError::Invalid("dhcp option too long"))?;
        out.push(code);
        out.push(len);
        out.extend_from_slice(&data);
        Ok(())
    }
}

/// BOOTP message with DHCP options.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct DhcpMessage {
    /// 1 = request, 2 = reply.
    pub op: u8,
    /// Transaction id.
    pub xid: u32,
    /// Seconds since the client began.
    pub secs: u16,
    /// Broadcast flag lives in the top bit.
    pub flags: u16,
    /// Client's current address.
    pub ciaddr: Ipv4Addr,
    /// Address offered to the client.
    pub yiaddr: Ipv4Addr,
    /// Next server.
    pub siaddr: Ipv4Addr,
    /// Relay agent.
    pub giaddr: Ipv4Addr,
    /// Client hardware address.
    pub chaddr: MacAddr,
    /// Options in wire order.
    pub options: Vec<DhcpOption>,
}

impl DhcpMessage {
    /// Client request skeleton.
    pub fn request(xid: u32, chaddr: MacAddr, kind: MessageType) -> Self {
        let mut client_id = vec![1];
        client_id.extend_from_slice(&chaddr.0);
        Self {
            op: OP_REQUEST,
            xid,
            secs: 0,
            flags: FLAG_BROADCAST,
            ciaddr: Ipv4Addr::UNSPECIFIED,
            yiaddr: Ipv4Addr::UNSPECIFIED,
            siaddr: Ipv4Addr::UNSPECIFIED,
            giaddr: Ipv4Addr::UNSPECIFIED,
            chaddr,
            options: vec![DhcpOption::MessageType(kind), DhcpOption::ClientId(client_id)],
        }
    }

    /// Value of option 53.
    pub fn message_type(&self) -> Option<MessageType> {
        self.options.iter().find_map(|o| match o {
            DhcpOption::MessageType(t) => Some(*t),
            _ => None,
        })
    }

    /// Value of option 54.
    pub fn server_id(&self) -> Option<Ipv4Addr> {
        self.options.iter().find_map(|o| match o {
            DhcpOption::ServerId(ip) => Some(*ip),
            _ => None,
        })
    }

    /// Parses a UDP payload.
    pub fn parse(b: &[u8]) -> Result<Self> {
        if b.len() < BOOTP_LEN + 4 {
            return Err(NetError::Malformed("short bootp message"));
        }
        if b[1] != 1 || b[2] != 6 {
            return Err(NetError::Malformed("bootp hardware type"));
        }
        if u32::from_be_bytes([b[236], b[237], b[238], b[239]]) != DHCP_MAGIC {
            return Err(NetError::Malformed("dhcp magic"));
        }
        let ip = |o: usize| Ipv4Addr::new(b[o], b[o + 1], b[o + 2], b[o + 3]);
        let mut chaddr = [0u8; 6];
        chaddr.copy_from_slice(&b[28..34]);
        let mut options = Vec::new();
        let mut pos = BOOTP_LEN + 4;
        while pos < b.len() {
            let code = b[pos];
            match code {
                OPT_PAD => pos += 1,
                OPT_END => break,
                _ => {
                    let len = usize::from(*b.get(pos + 1).ok_or(NetError::Malformed("dhcp option truncated"))?);
                    let data = b.get(pos + 2..pos + 2 + len).ok_or(NetError::Malformed("dhcp option truncated"))?;
                    options.push(DhcpOption::decode(code, data)?);
                    pos += 2 + len;
                }
            }
        }
        Ok(Self {
            op: b[0],
            xid: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
            secs: u16::from_be_bytes([b[8], b[9]]),
            flags: u16::from_be_bytes([b[10], b[11]]),
            ciaddr: ip(12),
            yiaddr: ip(16),
            siaddr: ip(20),
            giaddr: ip(24),
            chaddr: MacAddr(chaddr),
            options,
        })
    }

    /// Encodes with the END option appended.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut b = vec![0u8; BOOTP_LEN];
        b[0] = self.op;
        b[1] = 1;
        b[2] = 6;
        b[4..8].copy_from_slice(&self.xid.to_be_bytes());
        b[8..10].copy_from_slice(&self.secs.to_be_bytes());
        b[10..12].copy_from_slice(&self.flags.to_be_bytes());
        b[12..16].copy_from_slice(&self.ciaddr.octets());
        b[16..20].copy_from_slice(&self.yiaddr.octets());
        b[20..24].copy_from_slice(&self.siaddr.octets());
        b[24..28].copy_from_slice(&self.giaddr.octets());
        b[28..34].copy_from_slice(&self.chaddr.0);
        b.extend_from_slice(&DHCP_MAGIC.to_be_bytes());
        for opt in &self.options {
            opt.encode(&mut b)?;
        }
        b.push(OPT_END);
        Ok(b)
    }
}

/// Configuration obtained from an ACK.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Lease {
    /// Assigned address.
    pub addr: Ipv4Addr,
    /// Prefix length from the subnet mask option.
    pub prefix_len: u8,
    /// First router, if any.
    pub gateway: Option<Ipv4Addr>,
    /// DNS servers.
    pub dns_servers: Vec<Ipv4Addr>,
    /// Granting server.
    pub server: Ipv4Addr,
    /// Lease duration in seconds.
    pub lease_secs: u32,
    /// Renewal time (T1) in seconds.
    pub t1_secs: u32,
    /// Rebinding time (T2) in seconds.
    pub t2_secs: u32,
    /// When the lease was bound.
    pub acquired_ns: u64,
}

impl Lease {
    fn from_ack(msg: &DhcpMessage, server: Ipv4Addr, now_ns: u64) -> Self {
        let mut lease = Self {
            addr: msg.yiaddr,
            prefix_len: 24,
            gateway: None,
            dns_servers: Vec::new(),
            server,
            lease_secs: 86_400,
            t1_secs: 0,
            t2_secs: 0,
            acquired_ns: now_ns,
        };
        for opt in &msg.options {
            match opt {
                DhcpOption::SubnetMask(m) => lease.prefix_len = mask_to_prefix(*m),
                DhcpOption::Router(list) => lease.gateway = list.first().copied(),
                DhcpOption::DnsServers(list) => lease.dns_servers = list.clone(),
                DhcpOption::LeaseTime(s) => lease.lease_secs = *s,
                DhcpOption::RenewalTime(s) => lease.t1_secs = *s,
                DhcpOption::RebindingTime(s) => lease.t2_secs = *s,
                _ => {}
            }
        }
        if lease.t1_secs == 0 {
            lease.t1_secs = lease.lease_secs / 2;
        }
        if lease.t2_secs == 0 {
            lease.t2_secs = (u64::from(lease.lease_secs) * 7 / 8) as u32;
        }
        lease
    }

    fn at(&self, secs: u32) -> u64 {
        self.acquired_ns.saturating_add(u64::from(secs) * SEC)
    }

    /// Absolute T1.
    pub fn renew_at_ns(&self) -> u64 {
        self.at(self.t1_secs)
    }

    /// Absolute T2.
    pub fn rebind_at_ns(&self) -> u64 {
        self.at(self.t2_secs)
    }

    /// Absolute expiry.
    pub fn expires_at_ns(&self) -> u64 {
        self.at(self.lease_secs)
    }
}

/// Client states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub enum DhcpState {
    /// Not started or restarted after failure.
    Init,
    /// DISCOVER sent, collecting offers.
    Selecting,
    /// REQUEST sent for an offer.
    Requesting,
    /// Lease held.
    Bound,
    /// T1 passed, unicasting REQUEST to the server.
    Renewing,
    /// T2 passed, broadcasting REQUEST.
    Rebinding,
}

/// Work for the stack.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DhcpAction {
    /// Send from 0.0.0.0:68 to 255.255.255.255:67.
    Broadcast(DhcpMessage),
    /// Send to the server at the given address.
    Unicast(Ipv4Addr, DhcpMessage),
    /// Install the lease on the interface.
    Configure(Lease),
    /// Remove the lease from the interface.
    Deconfigure,
}

/// Per-interface client.
#[derive(Debug)]
pub struct DhcpClient {
    mac: MacAddr,
    state: DhcpState,
    xid: u32,
    offer: Option<(Ipv4Addr, Ipv4Addr)>,
    lease: Option<Lease>,
    attempts: u32,
    retry_at_ns: u64,
}

impl DhcpClient {
    /// Idle client.
    pub fn new(mac: MacAddr, xid: u32) -> Self {
        Self { mac, state: DhcpState::Init, xid, offer: None, lease: None, attempts: 0, retry_at_ns: u64::MAX }
    }

    /// Current state.
    pub fn state(&self) -> DhcpState {
        self.state
    }

    /// Current lease.
    pub fn lease(&self) -> Option<&Lease> {
        self.lease.as_ref()
    }

    /// Next time [`Self::on_timer`] has work.
    pub fn next_deadline(&self) -> u64 {
        match (self.state, &self.lease) {
            (DhcpState::Bound, Some(l)) => l.renew_at_ns(),
            (DhcpState::Renewing, Some(l)) => self.retry_at_ns.min(l.rebind_at_ns()),
            (DhcpState::Rebinding, Some(l)) => self.retry_at_ns.min(l.expires_at_ns()),
            _ => self.retry_at_ns,
        }
    }

    fn backoff(&mut self, now_ns: u64) {
        let delay = DHCP_RETRY_INITIAL_NS
            .saturating_mul(1u64 << self.attempts.min(6))
            .min(DHCP_RETRY_MAX_NS);
        self.attempts += 1;
        self.retry_at_ns = now_ns.saturating_add(delay);
    }

    fn discover(&self) -> DhcpMessage {
        let mut msg = DhcpMessage::request(self.xid, self.mac, MessageType::Discover);
        msg.options.push(DhcpOption::ParamList(vec![OPT_SUBNET_MASK, OPT_ROUTER, OPT_DNS, OPT_LEASE_TIME]));
        msg
    }

    fn select(&self, addr: Ipv4Addr, server: Ipv4Addr) -> DhcpMessage {
        let mut msg = DhcpMessage::request(self.xid, self.mac, MessageType::Request);
        msg.options.push(DhcpOption::RequestedIp(addr));
        msg.options.push(DhcpOption::ServerId(server));
        msg.options.push(DhcpOption::ParamList(vec![OPT_SUBNET_MASK, OPT_ROUTER, OPT_DNS, OPT_LEASE_TIME]));
        msg
    }

    fn extend(&self, addr: Ipv4Addr) -> DhcpMessage {
        let mut msg = DhcpMessage::request(self.xid, self.mac, MessageType::Request);
        msg.ciaddr = addr;
        msg.flags = 0;
        msg
    }

    /// Begins discovery.
    pub fn start(&mut self, now_ns: u64) -> DhcpAction {
        self.xid = self.xid.wrapping_add(1);
        self.state = DhcpState::Selecting;
        self.offer = None;
        self.attempts = 0;
        self.backoff(now_ns);
        log::debug!("dhcp: {} discover xid={:#x}", self.mac, self.xid);
        DhcpAction::Broadcast(self.discover())
    }

    /// Feeds a server reply.
    pub fn handle(&mut self, msg: &DhcpMessage, now_ns: u64) -> Vec<DhcpAction> {
        if msg.op != OP_REPLY || msg.xid != self.xid || msg.chaddr != self.mac {
            return Vec::new();
        }
        let kind = msg.message_type();
        match (self.state, kind) {
            (DhcpState::Selecting, Some(MessageType::Offer)) => {
                let Some(server) = msg.server_id() else {
                    return Vec::new();
                };
                self.offer = Some((msg.yiaddr, server));
                self.state = DhcpState::Requesting;
                self.attempts = 0;
                self.backoff(now_ns);
                vec![DhcpAction::Broadcast(self.select(msg.yiaddr, server))]
            }
            (DhcpState::Requesting | DhcpState::Renewing | DhcpState::Rebinding, Some(MessageType::Ack)) => {
                let server = msg
                    .server_id()
                    .or(self.offer.map(|(_, s)| s))
                    .or(self.lease.as_ref().map(|l| l.server))
                    .unwrap_or(Ipv4Addr::UNSPECIFIED);
                let lease = Lease::from_ack(msg, server, now_ns);
                log::info!("dhcp: {} bound {}/{} for {}s", self.mac, lease.addr, lease.prefix_len, lease.lease_secs);
                self.state = DhcpState::Bound;
                self.attempts = 0;
                self.retry_at_ns = u64::MAX;
                self.lease = Some(lease.clone());
                vec![DhcpAction::Configure(lease)]
            }
            (DhcpState::Requesting | DhcpState::Renewing | DhcpState::Rebinding, Some(MessageType::Nak)) => {
                log::warn!("dhcp: {} nak, restarting", self.mac);
                let had_lease = self.lease.take().is_some();
                let mut actions = Vec::new();
                if had_lease {
                    actions.push(DhcpAction::Deconfigure);
                }
                actions.push(self.start(now_ns));
                actions
            }
            _ => Vec::new(),
        }
    }

    /// Drives retransmissions and lease timers.
    pub fn on_timer(&mut self, now_ns: u64) -> Vec<DhcpAction> {
        if now_ns < self.next_deadline() {
            return Vec::new();
        }
        match self.state {
            DhcpState::Init => Vec::new(),
            DhcpState::Selecting | DhcpState::Requesting if self.attempts >= DHCP_MAX_ATTEMPTS => {
                log::warn!("dhcp: {} no answer after {} attempts", self.mac, self.attempts);
                vec![self.start(now_ns)]
            }
            DhcpState::Selecting => {
                self.backoff(now_ns);
                vec![DhcpAction::Broadcast(self.discover())]
            }
            DhcpState::Requesting => match self.offer {
                Some((addr, server)) => {
                    self.backoff(now_ns);
                    vec![DhcpAction::Broadcast(self.select(addr, server))]
                }
                None => vec![self.start(now_ns)],
            },
            DhcpState::Bound | DhcpState::Renewing | DhcpState::Rebinding => self.lease_timer(now_ns),
        }
    }

    fn lease_timer(&mut self, now_ns: u64) -> Vec<DhcpAction> {
        let Some(lease) = self.lease.clone() else {
            return vec![self.start(now_ns)];
        };
        if now_ns >= lease.expires_at_ns() {
            log::warn!("dhcp: {} lease on {} expired", self.mac, lease.addr);
            self.lease = None;
            return vec![DhcpAction::Deconfigure, self.start(now_ns)];
        }
        if now_ns >= lease.rebind_at_ns() {
            if self.state != DhcpState::Rebinding {
                self.state = DhcpState::Rebinding;
                self.attempts = 0;
            }
            self.backoff(now_ns);
            return vec![DhcpAction::Broadcast(self.extend(lease.addr))];
        }
        if self.state == DhcpState::Bound {
            self.state = DhcpState::Renewing;
            self.attempts = 0;
        }
        self.backoff(now_ns);
        vec![DhcpAction::Unicast(lease.server, self.extend(lease.addr))]
    }

    /// Gives the lease back.
    pub fn release(&mut self) -> Vec<DhcpAction> {
        self.state = DhcpState::Init;
        self.retry_at_ns = u64::MAX;
        self.offer = None;
        let Some(lease) = self.lease.take() else {
            return Vec::new();
        };
        let mut msg = DhcpMessage::request(self.xid, self.mac, MessageType::Release);
        msg.ciaddr = lease.addr;
        msg.flags = 0;
        msg.options.push(DhcpOption::ServerId(lease.server));
        vec![DhcpAction::Unicast(lease.server, msg), DhcpAction::Deconfigure]
    }
}

/// Builds a server reply for `req`; used by tests and simulated servers.
pub fn server_reply(req: &DhcpMessage, kind: MessageType, yiaddr: Ipv4Addr, server: Ipv4Addr, extra: Vec<DhcpOption>) -> DhcpMessage {
    let mut options = vec![DhcpOption::MessageType(kind), DhcpOption::ServerId(server)];
    options.extend(extra);
    DhcpMessage {
        op: OP_REPLY,
        xid: req.xid,
        secs: 0,
        flags: req.flags,
        ciaddr: req.ciaddr,
        yiaddr,
        siaddr: server,
        giaddr: Ipv4Addr::UNSPECIFIED,
        chaddr: req.chaddr,
        options,
    }
}
