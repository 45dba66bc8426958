// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! TCP: header codec and the per-connection state machine (RFC 793) with
//! RFC 6298 retransmission timing, RFC 5681 congestion control and an
//! out-of-order reassembly queue.
//!
//! A `Tcb` never performs I/O. Every event (segment, API call, timer)
//! appends the segments it wants sent to an output vector; the caller
//! transmits them after releasing the connection lock.

use std::collections::{BTreeMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};

use bitflags::bitflags;

use crate::checksum::transport_checksum_v4;
use crate::error::{NetError, Result};
use crate::ipv4::IPPROTO_TCP;

const MS: u64 = 1_000_000;
const SEC: u64 = 1_000_000_000;

/// Header length without options.
pub const TCP_HLEN: usize = 20;
/// MSS assumed when the peer sends none.
pub const TCP_DEFAULT_MSS: u16 = 536;
/// Initial retransmission timeout.
pub const TCP_RTO_INITIAL_NS: u64 = 3 * SEC;
/// Lower RTO bound.
pub const TCP_RTO_MIN_NS: u64 = 200 * MS;
/// Upper RTO bound.
pub const TCP_RTO_MAX_NS: u64 = 120 * SEC;
/// TIME_WAIT duration.
pub const TCP_TIME_WAIT_NS: u64 = 30 * SEC;
/// Longest an ACK for a small in-order segment is held back.
pub const TCP_DELAYED_ACK_NS: u64 = 200 * MS;
/// Consecutive timeouts before the connection is abandoned.
pub const TCP_MAX_RETRIES: u32 = 8;
/// Default receive buffer.
pub const TCP_DEFAULT_RCVBUF: usize = 64 * 1024;
/// Default send buffer.
pub const TCP_DEFAULT_SNDBUF: usize = 256 * 1024;
/// Duplicate ACKs that trigger fast retransmit.
pub const TCP_DUPACK_THRESHOLD: u32 = 3;

const INITIAL_SSTHRESH: u32 = 65_535;
const MAX_WINDOW: usize = 65_535;
/// Congestion window ceiling; the peer cannot open a wider window without scaling.
const MAX_CWND: u32 = MAX_WINDOW as u32;

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Control bits.
    pub struct TcpFlags: u8 {
        /// No more data from sender.
        const FIN = 0x01;
        /// Synchronize sequence numbers.
        const SYN = 0x02;
        /// Reset the connection.
        const RST = 0x04;
        /// Push function.
        const PSH = 0x08;
        /// Acknowledgment field is significant.
        const ACK = 0x10;
        /// Urgent pointer is significant.
        const URG = 0x20;
        /// ECN echo.
        const ECE = 0x40;
        /// Congestion window reduced.
        const CWR = 0x80;
    }
}

/// `a < b` in sequence space.
pub fn seq_lt(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) < 0
}

/// `a <= b` in sequence space.
pub fn seq_le(a: u32, b: u32) -> bool {
    (a.wrapping_sub(b) as i32) <= 0
}

/// `a > b` in sequence space.
pub fn seq_gt(a: u32, b: u32) -> bool {
    seq_lt(b, a)
}

/// `a >= b` in sequence space.
pub fn seq_ge(a: u32, b: u32) -> bool {
    seq_le(b, a)
}

/// TCP header with the MSS option decoded.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TcpHeader {
    /// Source port.
    pub sport: u16,
    /// Destination port.
    pub dport: u16,
    /// Sequence number.
    pub seq: u32,
    /// Acknowledgment number.
    pub ack: u32,
    /// Control bits.
    pub flags: TcpFlags,
    /// Receive window.
    pub window: u16,
    /// Checksum as received.
    pub checksum: u16,
    /// Urgent pointer.
    pub urgent: u16,
    /// Maximum segment size option.
    pub mss: Option<u16>,
}

impl TcpHeader {
    /// Encoded header length.
    pub fn header_len(&self) -> usize {
        TCP_HLEN + if self.mss.is_some() { 4 } else { 0 }
    }

    /// Parses the header; returns it with its encoded length.
    pub fn parse(b: &[u8]) -> Result<(Self, usize)> {
        if b.len() < TCP_HLEN {
            return Err(NetError::Malformed("short tcp header"));
        }
        let hlen = usize::from(b[12] >> 4) * 4;
        if hlen < TCP_HLEN || hlen > b.len() {
            return Err(NetError::Malformed("tcp data offset"));
        }
        let mut mss = None;
        let mut opts = &b[TCP_HLEN..hlen];
        while let Some(&kind) = opts.first() {
            match kind {
                0 => break,
                1 => opts = &opts[1..],
                _ => {
                    let len = usize::from(*opts.get(1).ok_or(NetError::Malformed("tcp option"))?);
                    if len < 2 || len > opts.len() {
                        return Err(NetError::Malformed("tcp option"));
                    }
                    if kind == 2 && len == 4 {
                        mss = Some(u16::from_be_bytes([opts[2], opts[3]]));
                    }
                    opts = &opts[len..];
                }
            }
        }
        let header = Self {
            sport: u16::from_be_bytes([b[0], b[1]]),
            dport: u16::from_be_bytes([b[2], b[3]]),
            seq: u32::from_be_bytes([b[4], b[5], b[6], b[7]]),
            ack: u32::from_be_bytes([b[8], b[9], b[10], b[11]]),
            flags: TcpFlags::from_bits_truncate(b[13]),
            window: u16::from_be_bytes([b[14], b[15]]),
            checksum: u16::from_be_bytes([b[16], b[17]]),
            urgent: u16::from_be_bytes([b[18], b[19]]),
            mss,
        };
        Ok((header, hlen))
    }

    /// Header bytes with the stored checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let hlen = self.header_len();
        let mut b = vec![0u8; hlen];
        b[0..2].copy_from_slice(&self.sport.to_be_bytes());
        b[2..4].copy_from_slice(&self.dport.to_be_bytes());
        b[4..8].copy_from_slice(&self.seq.to_be_bytes());
        b[8..12].copy_from_slice(&self.ack.to_be_bytes());
        b[12] = ((hlen / 4) as u8) << 4;
        b[13] = self.flags.bits();
        b[14..16].copy_from_slice(&self.window.to_be_bytes());
        b[16..18].copy_from_slice(&self.checksum.to_be_bytes());
        b[18..20].copy_from_slice(&self.urgent.to_be_bytes());
        if let Some(mss) = self.mss {
            b[20] = 2;
            b[21] = 4;
            b[22..24].copy_from_slice(&mss.to_be_bytes());
        }
        b
    }

    /// Sequence space consumed by a segment with this header.
    pub fn seg_len(&self, payload_len: usize) -> u32 {
        payload_len as u32 + u32::from(self.flags.contains(TcpFlags::SYN)) + u32::from(self.flags.contains(TcpFlags::FIN))
    }
}

/// Encodes a segment with its pseudo-header checksum.
pub fn build_segment(src: Ipv4Addr, dst: Ipv4Addr, header: &TcpHeader, payload: &[u8]) -> Vec<u8> {
    let mut seg = header.to_bytes();
    seg[16] = 0;
    seg[17] = 0;
    seg.extend_from_slice(payload);
    let sum = transport_checksum_v4(src, dst, IPPROTO_TCP, &seg);
    seg[16..18].copy_from_slice(&sum.to_be_bytes());
    seg
}

/// Parses a segment and verifies its checksum.
pub fn parse_segment(src: Ipv4Addr, dst: Ipv4Addr, segment: &[u8]) -> Result<(TcpHeader, &[u8])> {
    let (header, hlen) = TcpHeader::parse(segment)?;
    if transport_checksum_v4(src, dst, IPPROTO_TCP, segment) != 0 {
        return Err(NetError::Checksum);
    }
    Ok((header, &segment[hlen..]))
}

/// Connection states.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, serde::Serialize)]
pub enum TcpState {
    /// No connection.
    Closed,
    /// Waiting for a SYN.
    Listen,
    /// SYN sent, waiting for SYN|ACK.
    SynSent,
    /// SYN received and answered.
    SynRcvd,
    /// Data transfer.
    Established,
    /// FIN sent, not yet acknowledged.
    FinWait1,
    /// Our FIN acknowledged, waiting for the peer's.
    FinWait2,
    /// Peer closed, we may still send.
    CloseWait,
    /// Both sides sent FIN simultaneously.
    Closing,
    /// Peer closed first, our FIN awaits its ACK.
    LastAck,
    /// Waiting out stray segments.
    TimeWait,
}

impl TcpState {
    /// True once sequence numbers are synchronized.
    pub fn is_synchronized(self) -> bool {
        !matches!(self, Self::Closed | Self::Listen | Self::SynSent)
    }
}

/// Segment the connection wants transmitted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutSegment {
    /// Local endpoint.
    pub src: SocketAddrV4,
    /// Peer.
    pub dst: SocketAddrV4,
    /// Header; checksum is filled in by `to_bytes`.
    pub header: TcpHeader,
    /// Payload.
    pub payload: Vec<u8>,
}

impl OutSegment {
    /// Wire bytes of the TCP segment.
    pub fn to_bytes(&self) -> Vec<u8> {
        build_segment(*self.src.ip(), *self.dst.ip(), &self.header, &self.payload)
    }
}

/// RST answering a segment that matched no connection.
pub fn reset_for(src: SocketAddrV4, dst: SocketAddrV4, header: &TcpHeader, payload_len: usize) -> Option<OutSegment> {
    if header.flags.contains(TcpFlags::RST) {
        return None;
    }
    let mut rst = TcpHeader { sport: src.port(), dport: dst.port(), ..TcpHeader::default() };
    if header.flags.contains(TcpFlags::ACK) {
        rst.seq = header.ack;
        rst.flags = TcpFlags::RST;
    } else {
        rst.ack = header.seq.wrapping_add(header.seg_len(payload_len));
        rst.flags = TcpFlags::RST | TcpFlags::ACK;
    }
    Some(OutSegment { src, dst, header: rst, payload: Vec::new() })
}

struct Unacked {
    seq: u32,
    syn: bool,
    fin: bool,
    data: Vec<u8>,
    sent_ns: u64,
    retransmitted: bool,
}

impl Unacked {
    fn end(&self) -> u32 {
        self.seq.wrapping_add(self.data.len() as u32 + u32::from(self.syn) + u32::from(self.fin))
    }
}

fn initial_cwnd(mss: u16) -> u32 {
    let mss = u32::from(mss);
    (4 * mss).min((2 * mss).max(4380))
}

/// Transmission control block.
pub struct Tcb {
    /// Local endpoint.
    pub local: SocketAddrV4,
    /// Peer.
    pub remote: SocketAddrV4,
    /// Current state.
    pub state: TcpState,
    /// Oldest unacknowledged sequence number.
    pub snd_una: u32,
    /// Next sequence number to send.
    pub snd_nxt: u32,
    /// Peer's advertised window.
    pub snd_wnd: u32,
    snd_wl1: u32,
    snd_wl2: u32,
    /// Initial send sequence number.
    pub iss: u32,
    /// Next sequence number expected.
    pub rcv_nxt: u32,
    /// Window we advertise.
    pub rcv_wnd: u32,
    /// Initial receive sequence number.
    pub irs: u32,
    /// Retransmission timeout.
    pub rto_ns: u64,
    /// Smoothed RTT, zero before the first sample.
    pub srtt_ns: u64,
    /// RTT variance.
    pub rttvar_ns: u64,
    /// Time of the last acceptable ACK.
    pub last_ack_ns: u64,
    /// Congestion window in bytes.
    pub cwnd: u32,
    /// Slow-start threshold in bytes.
    pub ssthresh: u32,
    /// Consecutive duplicate ACKs.
    pub dupacks: u32,
    /// In fast recovery after a fast retransmit.
    pub fast_recovery: bool,
    /// Effective send MSS.
    pub mss: u16,
    recover: u32,
    rtt_valid: bool,
    retrans: VecDeque<Unacked>,
    ooo: BTreeMap<u32, Vec<u8>>,
    recv_buf: VecDeque<u8>,
    rcvbuf: usize,
    send_buf: VecDeque<u8>,
    sndbuf: usize,
    fin_pending: bool,
    fin_sent: bool,
    fin_received: bool,
    user_closed: bool,
    retries: u32,
    rto_deadline: Option<u64>,
    delayed_ack_deadline: Option<u64>,
    time_wait_deadline: Option<u64>,
    error: Option<NetError>,
}

impl Tcb {
    fn blank(local: SocketAddrV4, remote: SocketAddrV4, iss: u32, mss: u16, rcvbuf: usize, now_ns: u64) -> Self {
        let rcvbuf = rcvbuf.max(1);
        Self {
            local,
            remote,
            state: TcpState::Closed,
            snd_una: iss,
            snd_nxt: iss,
            snd_wnd: 0,
            snd_wl1: 0,
            snd_wl2: 0,
            iss,
            rcv_nxt: 0,
            rcv_wnd: rcvbuf.min(MAX_WINDOW) as u32,
            irs: 0,
            rto_ns: TCP_RTO_INITIAL_NS,
            srtt_ns: 0,
            rttvar_ns: 0,
            last_ack_ns: now_ns,
            cwnd: initial_cwnd(mss),
            ssthresh: INITIAL_SSTHRESH,
            dupacks: 0,
            fast_recovery: false,
            mss,
            recover: iss,
            rtt_valid: false,
            retrans: VecDeque::new(),
            ooo: BTreeMap::new(),
            recv_buf: VecDeque::new(),
            rcvbuf,
            send_buf: VecDeque::new(),
            sndbuf: TCP_DEFAULT_SNDBUF,
            fin_pending: false,
            fin_sent: false,
            fin_received: false,
            user_closed: false,
            retries: 0,
            rto_deadline: None,
            delayed_ack_deadline: None,
            time_wait_deadline: None,
            error: None,
        }
    }

    /// Active open: returns the TCB in SYN_SENT and the SYN to send.
    pub fn connect(
        local: SocketAddrV4,
        remote: SocketAddrV4,
        iss: u32,
        mss: u16,
        rcvbuf: usize,
        now_ns: u64,
    ) -> (Self, OutSegment) {
        let mut tcb = Self::blank(local, remote, iss, mss, rcvbuf, now_ns);
        tcb.state = TcpState::SynSent;
        let syn = tcb.send_control(TcpFlags::SYN, now_ns);
        (tcb, syn)
    }

    /// Passive open from a SYN that hit a listener: returns the child in
    /// SYN_RCVD and the SYN|ACK to send.
    pub fn accept_syn(
        local: SocketAddrV4,
        remote: SocketAddrV4,
        syn: &TcpHeader,
        iss: u32,
        mss: u16,
        rcvbuf: usize,
        now_ns: u64,
    ) -> (Self, OutSegment) {
        let mss = syn.mss.map_or(mss.min(TCP_DEFAULT_MSS), |peer| mss.min(peer));
        let mut tcb = Self::blank(local, remote, iss, mss, rcvbuf, now_ns);
        tcb.state = TcpState::SynRcvd;
        tcb.irs = syn.seq;
        tcb.rcv_nxt = syn.seq.wrapping_add(1);
        tcb.snd_wnd = u32::from(syn.window);
        tcb.snd_wl1 = syn.seq;
        let synack = tcb.send_control(TcpFlags::SYN | TcpFlags::ACK, now_ns);
        (tcb, synack)
    }

    /// Bytes ready for `recv`.
    pub fn readable(&self) -> usize {
        self.recv_buf.len()
    }

    /// Bytes queued but not yet sent.
    pub fn unsent(&self) -> usize {
        self.send_buf.len()
    }

    /// Segments awaiting acknowledgment.
    pub fn unacked(&self) -> usize {
        self.retrans.len()
    }

    /// Out-of-order segments held for reassembly.
    pub fn out_of_order(&self) -> usize {
        self.ooo.len()
    }

    /// True once the owning socket closed the connection.
    pub fn user_closed(&self) -> bool {
        self.user_closed
    }

    /// Error that closed the connection, if any.
    pub fn error(&self) -> Option<NetError> {
        self.error
    }

    /// True once the peer's FIN has been consumed.
    pub fn peer_closed(&self) -> bool {
        self.fin_received
    }

    /// TIME_WAIT expiry.
    pub fn time_wait_deadline(&self) -> Option<u64> {
        self.time_wait_deadline
    }

    /// Earliest pending timer.
    pub fn next_deadline(&self) -> Option<u64> {
        [self.rto_deadline, self.delayed_ack_deadline, self.time_wait_deadline].into_iter().flatten().min()
    }

    /// Send buffer capacity.
    pub fn set_sndbuf(&mut self, bytes: usize) {
        self.sndbuf = bytes.max(1);
    }

    fn make(&self, seq: u32, flags: TcpFlags, payload: Vec<u8>) -> OutSegment {
        let header = TcpHeader {
            sport: self.local.port(),
            dport: self.remote.port(),
            seq,
            ack: if flags.contains(TcpFlags::ACK) { self.rcv_nxt } else { 0 },
            flags,
            window: self.rcv_wnd.min(MAX_WINDOW as u32) as u16,
            checksum: 0,
            urgent: 0,
            mss: flags.contains(TcpFlags::SYN).then_some(self.mss),
        };
        OutSegment { src: self.local, dst: self.remote, header, payload }
    }

    fn send_control(&mut self, flags: TcpFlags, now_ns: u64) -> OutSegment {
        let seg = self.make(self.snd_nxt, flags, Vec::new());
        self.retrans.push_back(Unacked {
            seq: self.snd_nxt,
            syn: flags.contains(TcpFlags::SYN),
            fin: flags.contains(TcpFlags::FIN),
            data: Vec::new(),
            sent_ns: now_ns,
            retransmitted: false,
        });
        self.snd_nxt = self.snd_nxt.wrapping_add(1);
        self.rto_deadline.get_or_insert(now_ns + self.rto_ns);
        if flags.contains(TcpFlags::ACK) {
            self.delayed_ack_deadline = None;
        }
        seg
    }

    fn send_ack(&mut self, out: &mut Vec<OutSegment>) {
        self.delayed_ack_deadline = None;
        out.push(self.make(self.snd_nxt, TcpFlags::ACK, Vec::new()));
    }

    fn retransmit_head(&mut self, now_ns: u64, out: &mut Vec<OutSegment>) {
        let state = self.state;
        let Some(head) = self.retrans.front_mut() else {
            return;
        };
        head.retransmitted = true;
        head.sent_ns = now_ns;
        let mut flags = TcpFlags::empty();
        if head.syn {
            flags |= TcpFlags::SYN;
        }
        if head.fin {
            flags |= TcpFlags::FIN;
        }
        if !head.data.is_empty() {
            flags |= TcpFlags::PSH;
        }
        if state != TcpState::SynSent {
            flags |= TcpFlags::ACK;
        }
        let (seq, data) = (head.seq, head.data.clone());
        log::trace!("tcp {} -> {}: retransmit seq {} len {}", self.local, self.remote, seq, data.len());
        out.push(self.make(seq, flags, data));
        self.delayed_ack_deadline = None;
    }

    fn update_rtt(&mut self, sample_ns: u64) {
        if self.rtt_valid {
            let delta = self.srtt_ns.abs_diff(sample_ns);
            self.rttvar_ns = (3 * self.rttvar_ns + delta) / 4;
            self.srtt_ns = (7 * self.srtt_ns + sample_ns) / 8;
        } else {
            self.srtt_ns = sample_ns;
            self.rttvar_ns = sample_ns / 2;
            self.rtt_valid = true;
        }
        self.rto_ns = (self.srtt_ns + (4 * self.rttvar_ns).max(MS)).clamp(TCP_RTO_MIN_NS, TCP_RTO_MAX_NS);
    }

    fn update_rcv_wnd(&mut self) {
        self.rcv_wnd = self.rcvbuf.saturating_sub(self.recv_buf.len()).min(MAX_WINDOW) as u32;
    }

    fn close_now(&mut self) {
        self.state = TcpState::Closed;
        self.retrans.clear();
        self.send_buf.clear();
        self.ooo.clear();
        self.rto_deadline = None;
        self.delayed_ack_deadline = None;
        self.time_wait_deadline = None;
    }

    fn enter_time_wait(&mut self, now_ns: u64) {
        self.state = TcpState::TimeWait;
        self.retrans.clear();
        self.rto_deadline = None;
        self.time_wait_deadline = Some(now_ns + TCP_TIME_WAIT_NS);
    }

    fn reset(&mut self) -> Result<()> {
        let err = match self.state {
            TcpState::SynRcvd => NetError::ConnRefused,
            TcpState::Closing | TcpState::LastAck | TcpState::TimeWait => {
                self.close_now();
                return Ok(());
            }
            _ => NetError::ConnReset,
        };
        log::debug!("tcp {} -> {}: reset in {:?}", self.local, self.remote, self.state);
        self.close_now();
        self.error = Some(err);
        Err(err)
    }

    fn acceptable(&self, seq: u32, seg_len: u32) -> bool {
        let wnd = self.rcv_wnd;
        let in_window = |s: u32| seq_le(self.rcv_nxt, s) && seq_lt(s, self.rcv_nxt.wrapping_add(wnd));
        match (seg_len, wnd) {
            (0, 0) => seq == self.rcv_nxt,
            (0, _) => in_window(seq),
            (_, 0) => false,
            (len, _) => in_window(seq) || in_window(seq.wrapping_add(len - 1)),
        }
    }

    /// Processes one received segment.
    pub fn input(&mut self, hdr: &TcpHeader, payload: &[u8], now_ns: u64, out: &mut Vec<OutSegment>) -> Result<()> {
        match self.state {
            TcpState::Closed | TcpState::Listen => return Ok(()),
            TcpState::SynSent => return self.input_syn_sent(hdr, now_ns, out),
            _ => {}
        }
        if !self.acceptable(hdr.seq, hdr.seg_len(payload.len())) {
            if !hdr.flags.contains(TcpFlags::RST) {
                self.send_ack(out);
            }
            return Ok(());
        }
        if hdr.flags.contains(TcpFlags::RST) {
            return self.reset();
        }
        if hdr.flags.contains(TcpFlags::SYN) {
            out.push(self.make(self.snd_nxt, TcpFlags::RST, Vec::new()));
            return self.reset();
        }
        if !hdr.flags.contains(TcpFlags::ACK) {
            return Ok(());
        }
        if self.state == TcpState::SynRcvd {
            if seq_lt(self.snd_una, hdr.ack) && seq_le(hdr.ack, self.snd_nxt) {
                self.state = TcpState::Established;
                log::debug!("tcp {} -> {}: established (passive)", self.local, self.remote);
            } else {
                out.push(self.make(hdr.ack, TcpFlags::RST, Vec::new()));
                return Ok(());
            }
        }
        if !self.process_ack(hdr, payload.len(), now_ns, out) {
            return Ok(());
        }

        let fin_acked = self.fin_sent && self.snd_una == self.snd_nxt;
        match self.state {
            TcpState::FinWait1 if fin_acked => self.state = TcpState::FinWait2,
            TcpState::Closing if fin_acked => {
                self.enter_time_wait(now_ns);
                return Ok(());
            }
            TcpState::LastAck if fin_acked => {
                self.close_now();
                return Ok(());
            }
            TcpState::TimeWait => return Ok(()),
            _ => {}
        }

        let receiving = matches!(self.state, TcpState::Established | TcpState::FinWait1 | TcpState::FinWait2);
        if receiving && !payload.is_empty() {
            self.receive_data(hdr, payload, now_ns, out);
        }

        let fin_seq = hdr.seq.wrapping_add(payload.len() as u32);
        if receiving && hdr.flags.contains(TcpFlags::FIN) && fin_seq == self.rcv_nxt {
            self.rcv_nxt = self.rcv_nxt.wrapping_add(1);
            self.fin_received = true;
            self.send_ack(out);
            let fin_acked = self.fin_sent && self.snd_una == self.snd_nxt;
            match self.state {
                TcpState::Established => self.state = TcpState::CloseWait,
                TcpState::FinWait1 if fin_acked => self.enter_time_wait(now_ns),
                TcpState::FinWait1 => self.state = TcpState::Closing,
                TcpState::FinWait2 => self.enter_time_wait(now_ns),
                _ => {}
            }
            log::debug!("tcp {} -> {}: peer FIN, now {:?}", self.local, self.remote, self.state);
        }
        self.flush(now_ns, out);
        Ok(())
    }

    fn input_syn_sent(&mut self, hdr: &TcpHeader, now_ns: u64, out: &mut Vec<OutSegment>) -> Result<()> {
        let has_ack = hdr.flags.contains(TcpFlags::ACK);
        let ack_ok = has_ack && seq_lt(self.iss, hdr.ack) && seq_le(hdr.ack, self.snd_nxt);
        if has_ack && !ack_ok {
            if !hdr.flags.contains(TcpFlags::RST) {
                out.push(self.make(hdr.ack, TcpFlags::RST, Vec::new()));
            }
            return Ok(());
        }
        if hdr.flags.contains(TcpFlags::RST) {
            if ack_ok {
                self.close_now();
                self.error = Some(NetError::ConnRefused);
                return Err(NetError::ConnRefused);
            }
            return Ok(());
        }
        if !hdr.flags.contains(TcpFlags::SYN) {
            return Ok(());
        }
        self.irs = hdr.seq;
        self.rcv_nxt = hdr.seq.wrapping_add(1);
        self.snd_wnd = u32::from(hdr.window);
        self.snd_wl1 = hdr.seq;
        self.snd_wl2 = hdr.ack;
        if let Some(peer) = hdr.mss {
            self.mss = self.mss.min(peer);
            self.cwnd = initial_cwnd(self.mss);
        }
        if ack_ok {
            self.snd_una = hdr.ack;
            if let Some(syn) = self.retrans.pop_front() {
                if !syn.retransmitted {
                    self.update_rtt(now_ns.saturating_sub(syn.sent_ns));
                }
            }
            self.rto_deadline = None;
            self.retries = 0;
            self.state = TcpState::Established;
            log::debug!("tcp {} -> {}: established (active)", self.local, self.remote);
            self.send_ack(out);
            self.flush(now_ns, out);
        } else {
            self.state = TcpState::SynRcvd;
            out.push(self.make(self.iss, TcpFlags::SYN | TcpFlags::ACK, Vec::new()));
        }
        Ok(())
    }

    /// ACK processing for synchronized states. Returns false when the
    /// segment must not be processed further.
    fn process_ack(&mut self, hdr: &TcpHeader, payload_len: usize, now_ns: u64, out: &mut Vec<OutSegment>) -> bool {
        let ack = hdr.ack;
        let mss = u32::from(self.mss);
        if seq_lt(self.snd_una, ack) && seq_le(ack, self.snd_nxt) {
            self.snd_una = ack;
            self.last_ack_ns = now_ns;
            let mut sample = None;
            while self.retrans.front().is_some_and(|u| seq_le(u.end(), ack)) {
                if let Some(done) = self.retrans.pop_front() {
                    if !done.retransmitted {
                        sample = Some(now_ns.saturating_sub(done.sent_ns));
                    }
                }
            }
            if let Some(rtt) = sample {
                self.update_rtt(rtt);
            }
            self.retries = 0;
            self.rto_deadline = (!self.retrans.is_empty()).then_some(now_ns + self.rto_ns);
            if self.fast_recovery {
                if seq_ge(ack, self.recover) {
                    self.cwnd = self.ssthresh;
                    self.fast_recovery = false;
                } else {
                    self.retransmit_head(now_ns, out);
                }
            } else if self.cwnd < self.ssthresh {
                self.grow_cwnd(mss);
            } else {
                self.grow_cwnd((mss * mss / self.cwnd).max(1));
            }
            self.dupacks = 0;
        } else if ack == self.snd_una
            && payload_len == 0
            && !hdr.flags.intersects(TcpFlags::SYN | TcpFlags::FIN)
            && u32::from(hdr.window) == self.snd_wnd
            && self.snd_una != self.snd_nxt
        {
            self.dupacks += 1;
            if self.dupacks == TCP_DUPACK_THRESHOLD {
                self.ssthresh = (self.cwnd / 2).max(2 * mss);
                self.cwnd = self.ssthresh + 3 * mss;
                self.fast_recovery = true;
                self.recover = self.snd_nxt;
                log::debug!("tcp {} -> {}: fast retransmit at {}", self.local, self.remote, self.snd_una);
                self.retransmit_head(now_ns, out);
            } else if self.dupacks > TCP_DUPACK_THRESHOLD && self.fast_recovery {
                self.grow_cwnd(mss);
            }
        } else if seq_gt(ack, self.snd_nxt) {
            self.send_ack(out);
            return false;
        }
        if seq_lt(self.snd_wl1, hdr.seq) || (self.snd_wl1 == hdr.seq && seq_le(self.snd_wl2, ack)) {
            self.snd_wnd = u32::from(hdr.window);
            self.snd_wl1 = hdr.seq;
            self.snd_wl2 = ack;
        }
        true
    }

    fn grow_cwnd(&mut self, by: u32) {
        self.cwnd = self.cwnd.saturating_add(by).min(MAX_CWND);
    }

    fn deliver(&mut self, data: &[u8]) -> usize {
        if self.user_closed {
            // Nobody can read it any more; acknowledge and discard.
            self.rcv_nxt = self.rcv_nxt.wrapping_add(data.len() as u32);
            return data.len();
        }
        let take = data.len().min(self.rcvbuf.saturating_sub(self.recv_buf.len()));
        self.recv_buf.extend(&data[..take]);
        self.rcv_nxt = self.rcv_nxt.wrapping_add(take as u32);
        self.update_rcv_wnd();
        take
    }

    fn drain_reassembly(&mut self) -> bool {
        let mut drained = false;
        loop {
            let next = self.rcv_nxt.wrapping_sub(self.irs);
            let Some((&rel, _)) = self.ooo.iter().next() else {
                break;
            };
            if rel > next {
                break;
            }
            let Some(data) = self.ooo.remove(&rel) else {
                break;
            };
            let skip = (next - rel) as usize;
            if skip < data.len() {
                self.deliver(&data[skip..]);
                drained = true;
            }
        }
        drained
    }

    fn receive_data(&mut self, hdr: &TcpHeader, payload: &[u8], now_ns: u64, out: &mut Vec<OutSegment>) {
        let mut seq = hdr.seq;
        let mut data = payload;
        if seq_lt(seq, self.rcv_nxt) {
            let skip = self.rcv_nxt.wrapping_sub(seq) as usize;
            if skip >= data.len() {
                self.send_ack(out);
                return;
            }
            data = &data[skip..];
            seq = self.rcv_nxt;
        }
        if seq == self.rcv_nxt {
            let taken = self.deliver(data);
            let drained = self.drain_reassembly();
            if taken >= usize::from(self.mss) || drained || self.delayed_ack_deadline.is_some() {
                self.send_ack(out);
            } else {
                self.delayed_ack_deadline = Some(now_ns + TCP_DELAYED_ACK_NS);
            }
        } else {
            let rel = seq.wrapping_sub(self.irs);
            let slot = self.ooo.entry(rel).or_default();
            if data.len() > slot.len() {
                *slot = data.to_vec();
            }
            self.send_ack(out);
        }
    }

    fn flush(&mut self, now_ns: u64, out: &mut Vec<OutSegment>) {
        if !matches!(
            self.state,
            TcpState::Established | TcpState::CloseWait | TcpState::FinWait1 | TcpState::LastAck
        ) {
            return;
        }
        while !self.send_buf.is_empty() && !self.fin_sent {
            let flight = self.snd_nxt.wrapping_sub(self.snd_una);
            let mut usable = self.snd_wnd.min(self.cwnd).saturating_sub(flight);
            if usable == 0 {
                if self.snd_wnd == 0 && flight == 0 {
                    usable = 1;
                } else {
                    break;
                }
            }
            let n = (usable as usize).min(usize::from(self.mss)).min(self.send_buf.len());
            let data: Vec<u8> = self.send_buf.drain(..n).collect();
            let seq = self.snd_nxt;
            out.push(self.make(seq, TcpFlags::ACK | TcpFlags::PSH, data.clone()));
            self.retrans.push_back(Unacked { seq, syn: false, fin: false, data, sent_ns: now_ns, retransmitted: false });
            self.snd_nxt = self.snd_nxt.wrapping_add(n as u32);
            self.rto_deadline.get_or_insert(now_ns + self.rto_ns);
            self.delayed_ack_deadline = None;
        }
        if self.fin_pending && !self.fin_sent && self.send_buf.is_empty() {
            out.push(self.send_control(TcpFlags::FIN | TcpFlags::ACK, now_ns));
            self.fin_sent = true;
        }
    }

    /// Queues data for transmission; returns the bytes accepted.
    pub fn send(&mut self, data: &[u8], now_ns: u64, out: &mut Vec<OutSegment>) -> Result<usize> {
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.user_closed {
            return Err(NetError::BadSocket);
        }
        match self.state {
            TcpState::SynSent | TcpState::SynRcvd | TcpState::Established | TcpState::CloseWait => {}
            TcpState::Closed | TcpState::Listen => return Err(NetError::NotConnected),
            _ => return Err(NetError::Pipe),
        }
        if self.fin_pending {
            return Err(NetError::Pipe);
        }
        let room = self.sndbuf.saturating_sub(self.send_buf.len());
        if room == 0 && !data.is_empty() {
            return Err(NetError::WouldBlock);
        }
        let n = room.min(data.len());
        self.send_buf.extend(&data[..n]);
        self.flush(now_ns, out);
        Ok(n)
    }

    /// Takes up to `max` received bytes. An empty vector is end of stream.
    pub fn recv(&mut self, max: usize, out: &mut Vec<OutSegment>) -> Result<Vec<u8>> {
        if self.user_closed {
            return Err(self.error.unwrap_or(NetError::BadSocket));
        }
        if !self.recv_buf.is_empty() {
            let n = max.min(self.recv_buf.len());
            let data: Vec<u8> = self.recv_buf.drain(..n).collect();
            let before = self.rcv_wnd;
            self.update_rcv_wnd();
            let opened = before < u32::from(self.mss) && self.rcv_wnd >= u32::from(self.mss);
            if opened && self.state.is_synchronized() && self.state != TcpState::TimeWait {
                self.send_ack(out);
            }
            return Ok(data);
        }
        if let Some(err) = self.error {
            return Err(err);
        }
        if self.fin_received {
            return Ok(Vec::new());
        }
        match self.state {
            TcpState::Closed => Err(NetError::NotConnected),
            _ => Err(NetError::WouldBlock),
        }
    }

    /// User close: sends FIN once queued data drains. Received data is
    /// dropped and later `recv`/`send` calls fail with `BadSocket`.
    pub fn close(&mut self, now_ns: u64, out: &mut Vec<OutSegment>) {
        self.user_closed = true;
        self.recv_buf.clear();
        self.ooo.clear();
        self.update_rcv_wnd();
        match self.state {
            TcpState::Closed | TcpState::Listen | TcpState::SynSent => self.close_now(),
            TcpState::SynRcvd | TcpState::Established => {
                self.fin_pending = true;
                self.state = TcpState::FinWait1;
                self.flush(now_ns, out);
            }
            TcpState::CloseWait => {
                self.fin_pending = true;
                self.state = TcpState::LastAck;
                self.flush(now_ns, out);
            }
            _ => {}
        }
    }

    /// Aborts with RST when synchronized.
    pub fn abort(&mut self, out: &mut Vec<OutSegment>) {
        if self.state.is_synchronized() && self.state != TcpState::TimeWait {
            out.push(self.make(self.snd_nxt, TcpFlags::RST, Vec::new()));
        }
        self.close_now();
        self.recv_buf.clear();
        self.error.get_or_insert(NetError::ConnAborted);
    }

    /// Runs expired timers: TIME_WAIT, delayed ACK and retransmission.
    pub fn on_timer(&mut self, now_ns: u64, out: &mut Vec<OutSegment>) -> Result<()> {
        if self.state == TcpState::TimeWait {
            if self.time_wait_deadline.is_some_and(|d| now_ns >= d) {
                log::debug!("tcp {} -> {}: TIME_WAIT expired", self.local, self.remote);
                self.close_now();
            }
            return Ok(());
        }
        if self.delayed_ack_deadline.is_some_and(|d| now_ns >= d) {
            self.send_ack(out);
        }
        if !self.rto_deadline.is_some_and(|d| now_ns >= d) {
            return Ok(());
        }
        if self.retrans.is_empty() {
            self.rto_deadline = None;
            return Ok(());
        }
        self.retries += 1;
        if self.retries > TCP_MAX_RETRIES {
            log::warn!("tcp {} -> {}: giving up after {} retries", self.local, self.remote, TCP_MAX_RETRIES);
            self.close_now();
            self.error = Some(NetError::TimedOut);
            return Err(NetError::TimedOut);
        }
        let mss = u32::from(self.mss);
        let flight = self.snd_nxt.wrapping_sub(self.snd_una);
        self.ssthresh = (flight / 2).max(2 * mss);
        self.cwnd = mss;
        self.dupacks = 0;
        self.fast_recovery = false;
        self.rto_ns = (self.rto_ns * 2).min(TCP_RTO_MAX_NS);
        self.retransmit_head(now_ns, out);
        self.rto_deadline = Some(now_ns + self.rto_ns);
        Ok(())
    }
}
