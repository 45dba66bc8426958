// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! IPv4 header codec (RFC 791), outbound fragmentation and address helpers.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::checksum::internet_checksum;
use crate::error::{NetError, Result};

/// Header length without options.
pub const IPV4_MIN_HLEN: usize = 20;
/// Header length with maximal options.
pub const IPV4_MAX_HLEN: usize = 60;
/// ICMP protocol number.
pub const IPPROTO_ICMP: u8 = 1;
/// TCP protocol number.
pub const IPPROTO_TCP: u8 = 6;
/// UDP protocol number.
pub const IPPROTO_UDP: u8 = 17;
/// Default time to live.
pub const DEFAULT_TTL: u8 = 64;
/// Don't fragment.
pub const FLAG_DF: u8 = 0b010;
/// More fragments.
pub const FLAG_MF: u8 = 0b001;

/// Parsed IPv4 header.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Ipv4Header {
    /// Type of service.
    pub tos: u8,
    /// Header plus payload length.
    pub total_len: u16,
    /// Identification.
    pub id: u16,
    /// `FLAG_DF | FLAG_MF` bits.
    pub flags: u8,
    /// Fragment offset in 8-byte units.
    pub frag_offset: u16,
    /// Time to live.
    pub ttl: u8,
    /// Upper-layer protocol.
    pub proto: u8,
    /// Header checksum as received (recomputed on encode).
    pub checksum: u16,
    /// Source.
    pub src: Ipv4Addr,
    /// Destination.
    pub dst: Ipv4Addr,
    /// Raw options, padded to a multiple of 4.
    pub options: Vec<u8>,
}

impl Ipv4Header {
    /// Header for a fresh datagram carrying `payload_len` bytes.
    pub fn new(src: Ipv4Addr, dst: Ipv4Addr, proto: u8, payload_len: usize) -> Result<Self> {
        let total = IPV4_MIN_HLEN + payload_len;
        let total_len = u16::try_from(total).map_err(|_| NetError::MsgSize)?;
        Ok(Self {
            tos: 0,
            total_len,
            id: 0,
            flags: 0,
            frag_offset: 0,
            ttl: DEFAULT_TTL,
            proto,
            checksum: 0,
            src,
            dst,
            options: Vec::new(),
        })
    }

    /// Header length in bytes.
    pub fn header_len(&self) -> usize {
        IPV4_MIN_HLEN + self.options.len()
    }

    /// Payload length implied by `total_len`.
    pub fn payload_len(&self) -> usize {
        usize::from(self.total_len).saturating_sub(self.header_len())
    }

    /// More-fragments flag.
    pub fn more_fragments(&self) -> bool {
        self.flags & FLAG_MF != 0
    }

    /// Don't-fragment flag.
    pub fn dont_fragment(&self) -> bool {
        self.flags & FLAG_DF != 0
    }

    /// True when this datagram is a fragment of a larger one.
    pub fn is_fragment(&self) -> bool {
        self.more_fragments() || self.frag_offset != 0
    }

    /// Parses and validates version, IHL, total length and checksum.
    pub fn parse(b: &[u8]) -> Result<Self> {
        if b.len() < IPV4_MIN_HLEN {
            return Err(NetError::Malformed("short ipv4 header"));
        }
        if b[0] >> 4 != 4 {
            return Err(NetError::Malformed("ip version"));
        }
        let ihl = usize::from(b[0] & 0x0f);
        if !(5..=15).contains(&ihl) {
            return Err(NetError::Malformed("ipv4 ihl"));
        }
        let hlen = ihl * 4;
        let total_len = u16::from_be_bytes([b[2], b[3]]);
        if b.len() < hlen || usize::from(total_len) > b.len() || usize::from(total_len) < hlen {
            return Err(NetError::Malformed("ipv4 total length"));
        }
        if internet_checksum(&b[..hlen]) != 0 {
            return Err(NetError::Checksum);
        }
        let frag = u16::from_be_bytes([b[6], b[7]]);
        Ok(Self {
            tos: b[1],
            total_len,
            id: u16::from_be_bytes([b[4], b[5]]),
            flags: (frag >> 13) as u8,
            frag_offset: frag & 0x1fff,
            ttl: b[8],
            proto: b[9],
            checksum: u16::from_be_bytes([b[10], b[11]]),
            src: Ipv4Addr::new(b[12], b[13], b[14], b[15]),
            dst: Ipv4Addr::new(b[16], b[17], b[18], b[19]),
            options: b[IPV4_MIN_HLEN..hlen].to_vec(),
        })
    }

    /// Header bytes with a freshly computed checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let hlen = self.header_len();
        let mut b = vec![0u8; hlen];
        b[0] = 0x40 | (hlen / 4) as u8;
        b[1] = self.tos;
        b[2..4].copy_from_slice(&self.total_len.to_be_bytes());
        b[4..6].copy_from_slice(&self.id.to_be_bytes());
        let frag = (u16::from(self.flags & 0x7) << 13) | (self.frag_offset & 0x1fff);
        b[6..8].copy_from_slice(&frag.to_be_bytes());
        b[8] = self.ttl;
        b[9] = self.proto;
        b[12..16].copy_from_slice(&self.src.octets());
        b[16..20].copy_from_slice(&self.dst.octets());
        b[IPV4_MIN_HLEN..].copy_from_slice(&self.options);
        let sum = internet_checksum(&b);
        b[10..12].copy_from_slice(&sum.to_be_bytes());
        b
    }
}

/// Full datagram: header followed by `payload`.
pub fn build_datagram(header: &Ipv4Header, payload: &[u8]) -> Vec<u8> {
    let mut out = header.to_bytes();
    out.extend_from_slice(payload);
    out
}

/// Splits `payload` into datagrams that fit `mtu`. Chunks are
/// `(mtu - hlen)` rounded down to 8 bytes; every fragment but the last
/// carries MF. A datagram that already fits is returned whole.
pub fn fragment(header: &Ipv4Header, payload: &[u8], mtu: usize) -> Result<Vec<Vec<u8>>> {
    let hlen = header.header_len();
    if hlen + payload.len() <= mtu {
        let mut whole = header.clone();
        whole.total_len = u16::try_from(hlen + payload.len()).map_err(|_| NetError::MsgSize)?;
        return Ok(vec![build_datagram(&whole, payload)]);
    }
    if header.dont_fragment() {
        return Err(NetError::MsgSize);
    }
    let chunk = mtu.saturating_sub(hlen) / 8 * 8;
    if chunk == 0 {
        return Err(NetError::Invalid("mtu below ipv4 minimum"));
    }
    let base = usize::from(header.frag_offset) * 8;
    let last_mf = header.more_fragments();
    let mut out = Vec::with_capacity(payload.len().div_ceil(chunk));
    for (i, piece) in payload.chunks(chunk).enumerate() {
        let offset = base + i * chunk;
        let is_last = offset + piece.len() == base + payload.len();
        let mut frag = header.clone();
        frag.frag_offset = u16::try_from(offset / 8).map_err(|_| NetError::MsgSize)?;
        frag.flags = (header.flags & !FLAG_MF) | if is_last && !last_mf { 0 } else { FLAG_MF };
        frag.total_len = u16::try_from(hlen + piece.len()).map_err(|_| NetError::MsgSize)?;
        out.push(build_datagram(&frag, piece));
    }
    Ok(out)
}

/// Address plus prefix length.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Ipv4Cidr {
    /// Interface or network address.
    pub addr: Ipv4Addr,
    /// Prefix length, 0..=32.
    pub prefix_len: u8,
}

impl Ipv4Cidr {
    /// Validated constructor.
    pub fn new(addr: Ipv4Addr, prefix_len: u8) -> Result<Self> {
        if prefix_len > 32 {
            return Err(NetError::Invalid("prefix length"));
        }
        Ok(Self { addr, prefix_len })
    }

    /// Netmask for `prefix_len`.
    pub fn netmask(&self) -> Ipv4Addr {
        prefix_to_mask(self.prefix_len)
    }

    /// Network address.
    pub fn network(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) & u32::from(self.netmask()))
    }

    /// Directed broadcast address.
    pub fn broadcast(&self) -> Ipv4Addr {
        Ipv4Addr::from(u32::from(self.addr) | !u32::from(self.netmask()))
    }

    /// True when `ip` is inside the prefix.
    pub fn contains(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.netmask());
        u32::from(ip) & mask == u32::from(self.addr) & mask
    }
}

/// Netmask with `prefix_len` leading ones.
pub fn prefix_to_mask(prefix_len: u8) -> Ipv4Addr {
    match prefix_len {
        0 => Ipv4Addr::UNSPECIFIED,
        p if p >= 32 => Ipv4Addr::BROADCAST,
        p => Ipv4Addr::from(u32::MAX << (32 - u32::from(p))),
    }
}

/// Leading ones of a netmask.
pub fn mask_to_prefix(mask: Ipv4Addr) -> u8 {
    u32::from(mask).leading_ones() as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn hdr(len: usize) -> Ipv4Header {
        let mut h = Ipv4Header::new(Ipv4Addr::new(10, 0, 0, 1), Ipv4Addr::new(10, 0, 0, 2), IPPROTO_UDP, len)
            .expect("header");
        h.id = 0x1234;
        h
    }

    #[test]
    fn parse_rejects_bad_fields() {
        let good = build_datagram(&hdr(4), b"data");
        assert_eq!(Ipv4Header::parse(&good).expect("parse").payload_len(), 4);

        let mut bad_version = good.clone();
        bad_version[0] = 0x65;
        assert_eq!(Ipv4Header::parse(&bad_version), Err(NetError::Malformed("ip version")));

        let mut bad_ihl = good.clone();
        bad_ihl[0] = 0x44;
        assert_eq!(Ipv4Header::parse(&bad_ihl), Err(NetError::Malformed("ipv4 ihl")));

        assert_eq!(Ipv4Header::parse(&good[..22]), Err(NetError::Malformed("ipv4 total length")));

        let mut bad_sum = good;
        bad_sum[8] ^= 0xff;
        assert_eq!(Ipv4Header::parse(&bad_sum), Err(NetError::Checksum));
    }

    #[test]
    fn four_thousand_bytes_over_1500_make_three_fragments() {
        let payload = vec![7u8; 4000];
        let frags = fragment(&hdr(payload.len()), &payload, 1500).expect("fragment");
        let parsed: Vec<Ipv4Header> = frags.iter().map(|f| Ipv4Header::parse(f).expect("parse")).collect();
        let offsets: Vec<usize> = parsed.iter().map(|h| usize::from(h.frag_offset) * 8).collect();
        let mf: Vec<bool> = parsed.iter().map(Ipv4Header::more_fragments).collect();
        assert_eq!(offsets, vec![0, 1480, 2960]);
        assert_eq!(mf, vec![true, true, false]);
        assert_eq!(parsed[2].payload_len(), 1040);
        assert!(frags.iter().all(|f| f.len() <= 1500));
    }

    #[test]
    fn dont_fragment_oversize_is_msgsize() {
        let mut h = hdr(2000);
        h.flags |= FLAG_DF;
        assert_eq!(fragment(&h, &[0u8; 2000], 1500), Err(NetError::MsgSize));
        assert_eq!(fragment(&h, &[0u8; 100], 1500).expect("fits").len(), 1);
    }

    #[test]
    fn cidr_helpers() {
        let c = Ipv4Cidr::new(Ipv4Addr::new(192, 168, 1, 20), 24).expect("cidr");
        assert_eq!(c.netmask(), Ipv4Addr::new(255, 255, 255, 0));
        assert_eq!(c.network(), Ipv4Addr::new(192, 168, 1, 0));
        assert_eq!(c.broadcast(), Ipv4Addr::new(192, 168, 1, 255));
        assert!(c.contains(Ipv4Addr::new(192, 168, 1, 200)));
        assert!(!c.contains(Ipv4Addr::new(192, 168, 2, 1)));
        assert_eq!(mask_to_prefix(prefix_to_mask(17)), 17);
        assert_eq!(prefix_to_mask(0), Ipv4Addr::UNSPECIFIED);
    }

    proptest! {
        #[test]
        fn header_codec_is_lossless(tos in any::<u8>(), id in any::<u16>(), ttl in 1u8.., off in 0u16..0x1fff,
                                    mf in any::<bool>(), src in any::<u32>(), dst in any::<u32>(), len in 0usize..1400) {
            let mut h = Ipv4Header::new(Ipv4Addr::from(src), Ipv4Addr::from(dst), IPPROTO_TCP, len).expect("header");
            h.tos = tos;
            h.id = id;
            h.ttl = ttl;
            h.frag_offset = off;
            h.flags = if mf { FLAG_MF } else { 0 };
            let bytes = build_datagram(&h, &vec![0u8; len]);
            let mut back = Ipv4Header::parse(&bytes).expect("parse");
            back.checksum = 0;
            prop_assert_eq!(back, h);
        }
    }
}
