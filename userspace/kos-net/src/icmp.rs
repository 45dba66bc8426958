// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! ICMPv4 messages (RFC 792) used by the stack: echo, destination
//! unreachable, time exceeded and redirect.

use std::net::Ipv4Addr;

use crate::checksum::internet_checksum;
use crate::error::{NetError, Result};

/// ICMP header length.
pub const ICMP_HLEN: usize = 8;
/// Bytes of the offending datagram's payload quoted in error messages.
pub const ICMP_QUOTE_LEN: usize = 8;

const TYPE_ECHO_REPLY: u8 = 0;
const TYPE_DEST_UNREACH: u8 = 3;
const TYPE_REDIRECT: u8 = 5;
const TYPE_ECHO_REQUEST: u8 = 8;
const TYPE_TIME_EXCEEDED: u8 = 11;

/// Destination-unreachable codes the stack emits.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum UnreachCode {
    /// Network unreachable.
    Net = 0,
    /// Host unreachable.
    Host = 1,
    /// Protocol unreachable.
    Protocol = 2,
    /// Port unreachable.
    Port = 3,
    /// Fragmentation needed and DF set.
    FragNeeded = 4,
}

impl UnreachCode {
    fn from_code(code: u8) -> Option<Self> {
        Some(match code {
            0 => Self::Net,
            1 => Self::Host,
            2 => Self::Protocol,
            3 => Self::Port,
            4 => Self::FragNeeded,
            _ => return None,
        })
    }
}

/// Decoded ICMP message. `data` carries the echo payload or the quoted
/// original datagram (IP header plus the first 8 payload bytes).
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum IcmpMessage {
    /// Echo request.
    EchoRequest {
        /// Identifier.
        id: u16,
        /// Sequence number.
        seq: u16,
        /// Echo payload.
        data: Vec<u8>,
    },
    /// Echo reply.
    EchoReply {
        /// Identifier copied from the request.
        id: u16,
        /// Sequence number copied from the request.
        seq: u16,
        /// Echo payload.
        data: Vec<u8>,
    },
    /// Destination unreachable.
    DestUnreachable {
        /// Reason.
        code: UnreachCode,
        /// Next-hop MTU for `FragNeeded`, else zero.
        mtu: u16,
        /// Quoted datagram.
        data: Vec<u8>,
    },
    /// TTL (code 0) or reassembly (code 1) time exceeded.
    TimeExceeded {
        /// 0 for TTL, 1 for reassembly.
        code: u8,
        /// Quoted datagram.
        data: Vec<u8>,
    },
    /// Redirect to a better gateway.
    Redirect {
        /// Redirect scope.
        code: u8,
        /// Gateway to use instead.
        gateway: Ipv4Addr,
        /// Quoted datagram.
        data: Vec<u8>,
    },
    /// Anything else, kept verbatim.
    Other {
        /// ICMP type.
        kind: u8,
        /// ICMP code.
        code: u8,
        /// Type-specific header word.
        rest: [u8; 4],
        /// Remaining bytes.
        data: Vec<u8>,
    },
}

impl IcmpMessage {
    /// Parses a message and verifies its checksum.
    pub fn parse(b: &[u8]) -> Result<Self> {
        if b.len() < ICMP_HLEN {
            return Err(NetError::Malformed("short icmp header"));
        }
        if internet_checksum(b) != 0 {
            return Err(NetError::Checksum);
        }
        let (kind, code) = (b[0], b[1]);
        let rest = [b[4], b[5], b[6], b[7]];
        let hi = u16::from_be_bytes([rest[0], rest[1]]);
        let lo = u16::from_be_bytes([rest[2], rest[3]]);
        let data = b[ICMP_HLEN..].to_vec();
        Ok(match kind {
            TYPE_ECHO_REQUEST => Self::EchoRequest { id: hi, seq: lo, data },
            TYPE_ECHO_REPLY => Self::EchoReply { id: hi, seq: lo, data },
            TYPE_DEST_UNREACH => match UnreachCode::from_code(code) {
                Some(code) => Self::DestUnreachable { code, mtu: lo, data },
                None => Self::Other { kind, code, rest, data },
            },
            TYPE_TIME_EXCEEDED => Self::TimeExceeded { code, data },
            TYPE_REDIRECT => Self::Redirect { code, gateway: Ipv4Addr::from(rest), data },
            _ => Self::Other { kind, code, rest, data },
        })
    }

    /// Encodes the message with its checksum.
    pub fn to_bytes(&self) -> Vec<u8> {
        let (kind, code, rest, data): (u8, u8, [u8; 4], &[u8]) = match self {
            Self::EchoRequest { id, seq, data } => (TYPE_ECHO_REQUEST, 0, join(*id, *seq), data),
            Self::EchoReply { id, seq, data } => (TYPE_ECHO_REPLY, 0, join(*id, *seq), data),
            Self::DestUnreachable { code, mtu, data } => (TYPE_DEST_UNREACH, *code as u8, join(0, *mtu), data),
            Self::TimeExceeded { code, data } => (TYPE_TIME_EXCEEDED, *code, [0; 4], data),
            Self::Redirect { code, gateway, data } => (TYPE_REDIRECT, *code, gateway.octets(), data),
            Self::Other { kind, code, rest, data } => (*kind, *code, *rest, data),
        };
        let mut out = Vec::with_capacity(ICMP_HLEN + data.len());
        out.extend_from_slice(&[kind, code, 0, 0]);
        out.extend_from_slice(&rest);
        out.extend_from_slice(data);
        let sum = internet_checksum(&out);
        out[2..4].copy_from_slice(&sum.to_be_bytes());
        out
    }

    /// True for error messages, which must never trigger another error.
    pub fn is_error(&self) -> bool {
        matches!(self, Self::DestUnreachable { .. } | Self::TimeExceeded { .. } | Self::Redirect { .. })
    }
}

fn join(hi: u16, lo: u16) -> [u8; 4] {
    let [a, b] = hi.to_be_bytes();
    let [c, d] = lo.to_be_bytes();
    [a, b, c, d]
}

/// Quote for an error message: the offending IP header plus 8 payload bytes.
pub fn quote(datagram: &[u8], header_len: usize) -> Vec<u8> {
    datagram[..datagram.len().min(header_len + ICMP_QUOTE_LEN)].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn echo_request_golden_vector() {
        let msg = IcmpMessage::EchoRequest { id: 1, seq: 2, data: b"ab".to_vec() };
        let bytes = msg.to_bytes();
        assert_eq!(&bytes[..2], &[8, 0]);
        assert_eq!(&bytes[4..8], &[0, 1, 0, 2]);
        assert_eq!(internet_checksum(&bytes), 0);
        assert_eq!(IcmpMessage::parse(&bytes).expect("parse"), msg);
    }

    #[test]
    fn frag_needed_carries_mtu() {
        let msg = IcmpMessage::DestUnreachable { code: UnreachCode::FragNeeded, mtu: 1500, data: vec![0x45; 28] };
        let bytes = msg.to_bytes();
        assert_eq!((bytes[0], bytes[1]), (3, 4));
        assert_eq!(u16::from_be_bytes([bytes[6], bytes[7]]), 1500);
        assert!(IcmpMessage::parse(&bytes).expect("parse").is_error());
    }

    #[test]
    fn corrupted_checksum_rejected() {
        let mut bytes = IcmpMessage::TimeExceeded { code: 0, data: vec![1, 2, 3, 4] }.to_bytes();
        bytes[9] ^= 1;
        assert_eq!(IcmpMessage::parse(&bytes), Err(NetError::Checksum));
        assert_eq!(IcmpMessage::parse(&bytes[..4]), Err(NetError::Malformed("short icmp header")));
    }

    #[test]
    fn quote_is_header_plus_eight() {
        let dgram = vec![0u8; 100];
        assert_eq!(quote(&dgram, 20).len(), 28);
        assert_eq!(quote(&dgram[..24], 20).len(), 24);
    }
}
