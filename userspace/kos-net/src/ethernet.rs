// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Ethernet II framing and 802.1Q VLAN tags.

use std::fmt;
use std::net::Ipv4Addr;
use std::str::FromStr;

use crate::error::{NetError, Result};

/// Ethernet header length.
pub const ETH_HLEN: usize = 14;
/// 802.1Q tag length.
pub const VLAN_HLEN: usize = 4;
/// IPv4 EtherType.
pub const ETHERTYPE_IPV4: u16 = 0x0800;
/// ARP EtherType.
pub const ETHERTYPE_ARP: u16 = 0x0806;
/// 802.1Q EtherType.
pub const ETHERTYPE_VLAN: u16 = 0x8100;
/// IPv6 EtherType.
pub const ETHERTYPE_IPV6: u16 = 0x86dd;

/// 48-bit hardware address.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MacAddr(pub [u8; 6]);

impl MacAddr {
    /// `ff:ff:ff:ff:ff:ff`.
    pub const BROADCAST: MacAddr = MacAddr([0xff; 6]);
    /// `00:00:00:00:00:00`, used on loopback.
    pub const ZERO: MacAddr = MacAddr([0; 6]);

    /// All ones.
    pub fn is_broadcast(&self) -> bool {
        *self == Self::BROADCAST
    }

    /// Group bit set (includes broadcast).
    pub fn is_multicast(&self) -> bool {
        self.0[0] & 0x01 != 0
    }

    /// RFC 1112 mapping of an IPv4 multicast group.
    pub fn ipv4_multicast(group: Ipv4Addr) -> Self {
        let o = group.octets();
        MacAddr([0x01, 0x00, 0x5e, o[1] & 0x7f, o[2], o[3]])
    }

    /// Locally administered unicast address derived from `seed`.
    pub fn local(seed: u32) -> Self {
        let b = seed.to_be_bytes();
        MacAddr([0x02, 0x00, b[0], b[1], b[2], b[3]])
    }
}

impl fmt::Display for MacAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let m = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", m[0], m[1], m[2], m[3], m[4], m[5])
    }
}

impl FromStr for MacAddr {
    type Err = NetError;

    fn from_str(s: &str) -> Result<Self> {
        let mut out = [0u8; 6];
        let mut parts = s.split(':');
        for byte in &mut out {
            let part = parts.next().ok_or(NetError::Invalid("mac address"))?;
            if part.len() != 2 {
                return Err(NetError::Invalid("mac address"));
            }
            *byte = u8::from_str_radix(part, 16).map_err(|_| NetError::Invalid("mac address"))?;
        }
        if parts.next().is_some() {
            return Err(NetError::Invalid("mac address"));
        }
        Ok(MacAddr(out))
    }
}

/// Ethernet II header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EthHeader {
    /// Destination.
    pub dst: MacAddr,
    /// Source.
    pub src: MacAddr,
    /// Payload type.
    pub ethertype: u16,
}

impl EthHeader {
    /// Parses the first 14 bytes of `frame`.
    pub fn parse(frame: &[u8]) -> Result<Self> {
        if frame.len() < ETH_HLEN {
            return Err(NetError::Malformed("short ethernet frame"));
        }
        let mut dst = [0u8; 6];
        let mut src = [0u8; 6];
        dst.copy_from_slice(&frame[0..6]);
        src.copy_from_slice(&frame[6..12]);
        Ok(Self { dst: MacAddr(dst), src: MacAddr(src), ethertype: u16::from_be_bytes([frame[12], frame[13]]) })
    }

    /// Writes the header into `out[..14]`.
    pub fn write(&self, out: &mut [u8]) {
        out[0..6].copy_from_slice(&self.dst.0);
        out[6..12].copy_from_slice(&self.src.0);
        out[12..14].copy_from_slice(&self.ethertype.to_be_bytes());
    }

    /// Header bytes.
    pub fn to_bytes(&self) -> [u8; ETH_HLEN] {
        let mut out = [0u8; ETH_HLEN];
        self.write(&mut out);
        out
    }
}

/// 802.1Q tag following an `ETHERTYPE_VLAN` header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct VlanTag {
    /// Priority code point.
    pub pcp: u8,
    /// Drop eligible indicator.
    pub dei: bool,
    /// VLAN identifier (12 bits).
    pub vid: u16,
    /// EtherType of the encapsulated payload.
    pub inner_ethertype: u16,
}

impl VlanTag {
    /// Parses the 4-byte tag.
    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < VLAN_HLEN {
            return Err(NetError::Malformed("short vlan tag"));
        }
        let tci = u16::from_be_bytes([data[0], data[1]]);
        Ok(Self {
            pcp: (tci >> 13) as u8,
            dei: tci & 0x1000 != 0,
            vid: tci & 0x0fff,
            inner_ethertype: u16::from_be_bytes([data[2], data[3]]),
        })
    }

    /// Tag bytes.
    pub fn to_bytes(&self) -> [u8; VLAN_HLEN] {
        let tci = (u16::from(self.pcp & 0x7) << 13) | (u16::from(self.dei) << 12) | (self.vid & 0x0fff);
        let t = tci.to_be_bytes();
        let e = self.inner_ethertype.to_be_bytes();
        [t[0], t[1], e[0], e[1]]
    }
}

/// Builds a complete frame.
pub fn build_frame(dst: MacAddr, src: MacAddr, ethertype: u16, payload: &[u8]) -> Vec<u8> {
    let mut frame = Vec::with_capacity(ETH_HLEN + payload.len());
    frame.extend_from_slice(&EthHeader { dst, src, ethertype }.to_bytes());
    frame.extend_from_slice(payload);
    frame
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mac_parse_and_display() {
        let mac: MacAddr = "aa:bb:cc:dd:ee:ff".parse().expect("parse");
        assert_eq!(mac.to_string(), "aa:bb:cc:dd:ee:ff");
        assert!("aa:bb".parse::<MacAddr>().is_err());
        assert!("aa:bb:cc:dd:ee:ff:00".parse::<MacAddr>().is_err());
        assert!(MacAddr::BROADCAST.is_multicast());
        assert!(!mac.is_broadcast());
    }

    #[test]
    fn header_decode_matches_wire_layout() {
        let frame = build_frame(MacAddr::BROADCAST, MacAddr::local(7), ETHERTYPE_ARP, &[1, 2]);
        assert_eq!(&frame[12..14], &[0x08, 0x06]);
        let hdr = EthHeader::parse(&frame).expect("parse");
        assert_eq!(hdr.src, MacAddr([0x02, 0, 0, 0, 0, 7]));
        assert!(EthHeader::parse(&frame[..13]).is_err());
    }

    #[test]
    fn vlan_tag_fields() {
        let tag = VlanTag::parse(&[0xa0, 0x64, 0x08, 0x00]).expect("tag");
        assert_eq!(tag, VlanTag { pcp: 5, dei: false, vid: 100, inner_ethertype: ETHERTYPE_IPV4 });
        assert_eq!(tag.to_bytes(), [0xa0, 0x64, 0x08, 0x00]);
    }

    #[test]
    fn multicast_mapping() {
        let mac = MacAddr::ipv4_multicast(Ipv4Addr::new(224, 129, 2, 3));
        assert_eq!(mac, MacAddr([0x01, 0x00, 0x5e, 0x01, 0x02, 0x03]));
    }
}
