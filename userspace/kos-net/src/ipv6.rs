// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! IPv6 fixed header (RFC 8200). The stack validates and counts IPv6
//! traffic but does not deliver it.

use std::net::Ipv6Addr;

use crate::error::{NetError, Result};

/// Fixed header length.
pub const IPV6_HLEN: usize = 40;

/// Parsed IPv6 header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Ipv6Header {
    /// Traffic class.
    pub traffic_class: u8,
    /// 20-bit flow label.
    pub flow_label: u32,
    /// Bytes after the fixed header.
    pub payload_len: u16,
    /// Next header protocol.
    pub next_header: u8,
    /// Hop limit.
    pub hop_limit: u8,
    /// Source.
    pub src: Ipv6Addr,
    /// Destination.
    pub dst: Ipv6Addr,
}

impl Ipv6Header {
    /// Parses and checks version and payload length.
    pub fn parse(b: &[u8]) -> Result<Self> {
        if b.len() < IPV6_HLEN {
            return Err(NetError::Malformed("short ipv6 header"));
        }
        let word = u32::from_be_bytes([b[0], b[1], b[2], b[3]]);
        if word >> 28 != 6 {
            return Err(NetError::Malformed("ip version"));
        }
        let payload_len = u16::from_be_bytes([b[4], b[5]]);
        if IPV6_HLEN + usize::from(payload_len) > b.len() {
            return Err(NetError::Malformed("ipv6 payload length"));
        }
        let mut src = [0u8; 16];
        let mut dst = [0u8; 16];
        src.copy_from_slice(&b[8..24]);
        dst.copy_from_slice(&b[24..40]);
        Ok(Self {
            traffic_class: ((word >> 20) & 0xff) as u8,
            flow_label: word & 0x000f_ffff,
            payload_len,
            next_header: b[6],
            hop_limit: b[7],
            src: Ipv6Addr::from(src),
            dst: Ipv6Addr::from(dst),
        })
    }

    /// Encodes the fixed header.
    pub fn to_bytes(&self) -> [u8; IPV6_HLEN] {
        let mut b = [0u8; IPV6_HLEN];
        let word = (6u32 << 28) | (u32::from(self.traffic_class) << 20) | (self.flow_label & 0x000f_ffff);
        b[0..4].copy_from_slice(&word.to_be_bytes());
        b[4..6].copy_from_slice(&self.payload_len.to_be_bytes());
        b[6] = self.next_header;
        b[7] = self.hop_limit;
        b[8..24].copy_from_slice(&self.src.octets());
        b[24..40].copy_from_slice(&self.dst.octets());
        b
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decodes_fields() {
        let h = Ipv6Header {
            traffic_class: 0xab,
            flow_label: 0x12345,
            payload_len: 4,
            next_header: 17,
            hop_limit: 64,
            src: Ipv6Addr::LOCALHOST,
            dst: "fe80::1".parse().expect("addr"),
        };
        let mut wire = h.to_bytes().to_vec();
        assert_eq!(wire[0], 0x6a);
        wire.extend_from_slice(&[0; 4]);
        assert_eq!(Ipv6Header::parse(&wire), Ok(h));
    }

    #[test]
    fn rejects_bad_version_and_length() {
        let mut wire = [0u8; 40];
        wire[0] = 0x40;
        assert_eq!(Ipv6Header::parse(&wire), Err(NetError::Malformed("ip version")));
        wire[0] = 0x60;
        wire[5] = 1;
        assert_eq!(Ipv6Header::parse(&wire), Err(NetError::Malformed("ipv6 payload length")));
    }
}
