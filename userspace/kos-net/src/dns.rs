// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! DNS message codec (RFC 1035) and the resolver cache. Names decode
//! through compression pointers; encoding never compresses.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use serde::Serialize;

use crate::error::{NetError, Result};

/// Resolver port.
pub const DNS_PORT: u16 = 53;
/// Header length.
pub const DNS_HLEN: usize = 12;
/// Host address record.
pub const TYPE_A: u16 = 1;
/// Canonical name record.
pub const TYPE_CNAME: u16 = 5;
/// IPv6 host address record.
pub const TYPE_AAAA: u16 = 28;
/// Internet class.
pub const CLASS_IN: u16 = 1;
/// Recursion desired.
pub const FLAG_RD: u16 = 0x0100;
/// Response bit.
pub const FLAG_QR: u16 = 0x8000;

const MAX_LABEL: usize = 63;
const MAX_NAME: usize = 255;
const MAX_POINTERS: usize = 16;

/// Question section entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Question {
    /// Queried name, dot separated, no trailing dot.
    pub name: String,
    /// Record type.
    pub qtype: u16,
    /// Class.
    pub qclass: u16,
}

/// Decoded record data.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RData {
    /// IPv4 address.
    A(Ipv4Addr),
    /// Alias target.
    Cname(String),
    /// Anything else, verbatim.
    Raw(Vec<u8>),
}

/// Resource record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Record {
    /// Owner name.
    pub name: String,
    /// Record type.
    pub rtype: u16,
    /// Class.
    pub class: u16,
    /// Time to live in seconds.
    pub ttl: u32,
    /// Payload.
    pub data: RData,
}

/// Complete DNS message.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Message {
    /// Transaction id.
    pub id: u16,
    /// Header flags including opcode and rcode.
    pub flags: u16,
    /// Questions.
    pub questions: Vec<Question>,
    /// Answers.
    pub answers: Vec<Record>,
    /// Authority records.
    pub authorities: Vec<Record>,
    /// Additional records.
    pub additionals: Vec<Record>,
}

fn take<'a>(b: &mut &'a [u8], n: usize) -> Result<&'a [u8]> {
    if b.len() < n {
        return Err(NetError::Malformed("dns truncated"));
    }
    let (head, tail) = b.split_at(n);
    *b = tail;
    Ok(head)
}

fn be16(b: &mut &[u8]) -> Result<u16> {
    let s = take(b, 2)?;
    Ok(u16::from_be_bytes([s[0], s[1]]))
}

fn be32(b: &mut &[u8]) -> Result<u32> {
    let s = take(b, 4)?;
    Ok(u32::from_be_bytes([s[0], s[1], s[2], s[3]]))
}

/// Appends `name` as length-prefixed labels.
pub fn encode_name(name: &str, out: &mut Vec<u8>) -> Result<()> {
    let name = name.trim_end_matches('.');
    let mut total = 1;
    if !name.is_empty() {
        for label in name.split('.') {
            if label.is_empty() || label.len() > MAX_LABEL {
                return Err(NetError::Invalid("dns label length"));
            }
            total += label.len() + 1;
            if total > MAX_NAME {
                return Err(NetError::Invalid("dns name length"));
            }
            out.push(label.len() as u8);
            out.extend_from_slice(label.as_bytes());
        }
    }
    out.push(0);
    Ok(())
}

/// Decodes the name at `pos` of `msg`, following compression pointers.
/// Returns the name and the offset just past it in the original stream.
pub fn decode_name(msg: &[u8], mut pos: usize) -> Result<(String, usize)> {
    let mut labels: Vec<String> = Vec::new();
    let mut resume = None;
    let mut jumps = 0;
    let mut total = 1;
    loop {
        let len = *msg.get(pos).ok_or(NetError::Malformed("dns name truncated"))?;
        match len >> 6 {
            0b11 => {
                let lo = *msg.get(pos + 1).ok_or(NetError::Malformed("dns pointer truncated"))?;
                jumps += 1;
                if jumps > MAX_POINTERS {
                    return Err(NetError::Malformed("dns pointer loop"));
                }
                resume.get_or_insert(pos + 2);
                pos = (usize::from(len & 0x3f) << 8) | usize::from(lo);
            }
            0b00 if len == 0 => {
                let end = resume.unwrap_or(pos + 1);
                return Ok((labels.join("."), end));
            }
            0b00 => {
                let len = usize::from(len);
                let label = msg.get(pos + 1..pos + 1 + len).ok_or(NetError::Malformed("dns label truncated"))?;
                total += len + 1;
                if total > MAX_NAME {
                    return Err(NetError::Malformed("dns name too long"));
                }
                labels.push(String::from_utf8_lossy(label).into_owned());
                pos += 1 + len;
            }
            _ => return Err(NetError::Malformed("dns label type")),
        }
    }
}

impl Message {
    /// Recursive query for `name`.
    pub fn query(id: u16, name: &str, qtype: u16) -> Self {
        Self {
            id,
            flags: FLAG_RD,
            questions: vec![Question { name: name.to_string(), qtype, qclass: CLASS_IN }],
            ..Self::default()
        }
    }

    /// True for responses.
    pub fn is_response(&self) -> bool {
        self.flags & FLAG_QR != 0
    }

    /// Response code.
    pub fn rcode(&self) -> u8 {
        (self.flags & 0x000f) as u8
    }

    /// Addresses answering `name`, following CNAME chains inside the
    /// answer section, each with its TTL.
    pub fn addresses_for(&self, name: &str) -> Vec<(Ipv4Addr, u32)> {
        let mut target = name.trim_end_matches('.').to_ascii_lowercase();
        for _ in 0..=self.answers.len() {
            let mut next = None;
            let mut found = Vec::new();
            for rr in &self.answers {
                if !rr.name.eq_ignore_ascii_case(&target) {
                    continue;
                }
                match &rr.data {
                    RData::A(ip) => found.push((*ip, rr.ttl)),
                    RData::Cname(alias) => next = Some(alias.to_ascii_lowercase()),
                    RData::Raw(_) => {}
                }
            }
            if !found.is_empty() {
                return found;
            }
            match next {
                Some(alias) => target = alias,
                None => break,
            }
        }
        Vec::new()
    }

    /// Parses a message.
    pub fn parse(msg: &[u8]) -> Result<Self> {
        if msg.len() < DNS_HLEN {
            return Err(NetError::Malformed("short dns header"));
        }
        let mut hdr = &msg[..DNS_HLEN];
        let id = be16(&mut hdr)?;
        let flags = be16(&mut hdr)?;
        let counts = [be16(&mut hdr)?, be16(&mut hdr)?, be16(&mut hdr)?, be16(&mut hdr)?];
        let mut pos = DNS_HLEN;
        let mut questions = Vec::with_capacity(usize::from(counts[0]).min(16));
        for _ in 0..counts[0] {
            let (name, next) = decode_name(msg, pos)?;
            let mut rest = msg.get(next..).ok_or(NetError::Malformed("dns truncated"))?;
            let qtype = be16(&mut rest)?;
            let qclass = be16(&mut rest)?;
            questions.push(Question { name, qtype, qclass });
            pos = next + 4;
        }
        let mut sections: [Vec<Record>; 3] = Default::default();
        for (section, count) in sections.iter_mut().zip(&counts[1..]) {
            for _ in 0..*count {
                let (record, next) = Self::parse_record(msg, pos)?;
                section.push(record);
                pos = next;
            }
        }
        let [answers, authorities, additionals] = sections;
        Ok(Self { id, flags, questions, answers, authorities, additionals })
    }

    fn parse_record(msg: &[u8], pos: usize) -> Result<(Record, usize)> {
        let (name, next) = decode_name(msg, pos)?;
        let mut rest = msg.get(next..).ok_or(NetError::Malformed("dns truncated"))?;
        let rtype = be16(&mut rest)?;
        let class = be16(&mut rest)?;
        let ttl = be32(&mut rest)?;
        let rdlen = usize::from(be16(&mut rest)?);
        let rdata = take(&mut rest, rdlen)?;
        let rdata_pos = next + 10;
        let data = match rtype {
            TYPE_A if rdlen == 4 => RData::A(Ipv4Addr::new(rdata[0], rdata[1], rdata[2], rdata[3])),
            TYPE_CNAME => RData::Cname(decode_name(msg, rdata_pos)?.0),
            _ => RData::Raw(rdata.to_vec()),
        };
        Ok((Record { name, rtype, class, ttl, data }, rdata_pos + rdlen))
    }

    /// Encodes the message without name compression.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(512);
        out.extend_from_slice(&self.id.to_be_bytes());
        out.extend_from_slice(&self.flags.to_be_bytes());
        for n in [self.questions.len(), self.answers.len(), self.authorities.len(), self.additionals.len()] {
            let n = u16::try_from(n).map_err(|_| NetError::Invalid("dns section too large"))?;
            out.extend_from_slice(&n.to_be_bytes());
        }
        for q in &self.questions {
            encode_name(&q.name, &mut out)?;
            out.extend_from_slice(&q.qtype.to_be_bytes());
            out.extend_from_slice(&q.qclass.to_be_bytes());
        }
        for rr in self.answers.iter().chain(&self.authorities).chain(&self.additionals) {
            encode_name(&rr.name, &mut out)?;
            out.extend_from_slice(&rr.rtype.to_be_bytes());
            out.extend_from_slice(&rr.class.to_be_bytes());
            out.extend_from_slice(&rr.ttl.to_be_bytes());
            let mut rdata = Vec::new();
            match &rr.data {
                RData::A(ip) => rdata.extend_from_slice(&ip.octets()),
                RData::Cname(alias) => encode_name(alias, &mut rdata)?,
                RData::Raw(raw) => rdata.extend_from_slice(raw),
            }
            let rdlen = u16::try_from(rdata.len()).map_err(|_| NetError::Invalid("dns rdata too large"))?;
            out.extend_from_slice(&rdlen.to_be_bytes());
            out.extend_from_slice(&rdata);
        }
        Ok(out)
    }
}

/// Cache counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct DnsCacheStats {
    /// Lookups answered from the cache.
    pub hits: u64,
    /// Lookups that missed or found an expired entry.
    pub misses: u64,
}

struct CacheEntry {
    addrs: Vec<Ipv4Addr>,
    expires_ns: u64,
}

/// Positive answer cache keyed by lower-cased name.
pub struct DnsCache {
    entries: HashMap<String, CacheEntry>,
    max_entries: usize,
    stats: DnsCacheStats,
}

impl DnsCache {
    /// Empty cache.
    pub fn new(max_entries: usize) -> Self {
        Self { entries: HashMap::new(), max_entries: max_entries.max(1), stats: DnsCacheStats::default() }
    }

    /// Stores `addrs` for `ttl_secs`.
    pub fn insert(&mut self, name: &str, addrs: Vec<Ipv4Addr>, ttl_secs: u32, now_ns: u64) {
        if ttl_secs == 0 || addrs.is_empty() {
            return;
        }
        if self.entries.len() >= self.max_entries {
            self.purge(now_ns);
        }
        if self.entries.len() >= self.max_entries {
            let soonest = self.entries.iter().min_by_key(|(_, e)| e.expires_ns).map(|(k, _)| k.clone());
            if let Some(key) = soonest {
                self.entries.remove(&key);
            }
        }
        let expires_ns = now_ns.saturating_add(u64::from(ttl_secs) * 1_000_000_000);
        self.entries.insert(name.trim_end_matches('.').to_ascii_lowercase(), CacheEntry { addrs, expires_ns });
    }

    /// Unexpired addresses for `name`.
    pub fn lookup(&mut self, name: &str, now_ns: u64) -> Option<Vec<Ipv4Addr>> {
        let key = name.trim_end_matches('.').to_ascii_lowercase();
        match self.entries.get(&key) {
            Some(e) if e.expires_ns > now_ns => {
                self.stats.hits += 1;
                Some(e.addrs.clone())
            }
            Some(_) => {
                self.entries.remove(&key);
                self.stats.misses += 1;
                None
            }
            None => {
                self.stats.misses += 1;
                None
            }
        }
    }

    /// Drops expired entries.
    pub fn purge(&mut self, now_ns: u64) -> usize {
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_ns > now_ns);
        before - self.entries.len()
    }

    /// Cached names.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Counters.
    pub fn stats(&self) -> DnsCacheStats {
        self.stats
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn query_golden_vector() {
        let bytes = Message::query(0xbeef, "a.bc", TYPE_A).to_bytes().expect("encode");
        assert_eq!(
            bytes,
            vec![0xbe, 0xef, 0x01, 0x00, 0, 1, 0, 0, 0, 0, 0, 0, 1, b'a', 2, b'b', b'c', 0, 0, 1, 0, 1]
        );
    }

    #[test]
    fn decodes_compressed_response() {
        // Answer owner name is a pointer to the question name at offset 12;
        // the CNAME target reuses the "example.com" suffix at offset 16.
        let mut msg = vec![0x12, 0x34, 0x81, 0x80, 0, 1, 0, 2, 0, 0, 0, 0];
        msg.extend_from_slice(&[3, b'w', b'w', b'w', 7]);
        msg.extend_from_slice(b"example");
        msg.extend_from_slice(&[3, b'c', b'o', b'm', 0, 0, 1, 0, 1]);
        msg.extend_from_slice(&[0xc0, 12, 0, 5, 0, 1, 0, 0, 0, 60, 0, 6, 3, b'c', b'd', b'n', 0xc0, 16]);
        msg.extend_from_slice(&[0xc0, 45, 0, 1, 0, 1, 0, 0, 0, 30, 0, 4, 93, 184, 216, 34]);
        let m = Message::parse(&msg).expect("parse");
        assert!(m.is_response());
        assert_eq!(m.rcode(), 0);
        assert_eq!(m.questions[0].name, "www.example.com");
        assert_eq!(m.answers[0].data, RData::Cname("cdn.example.com".into()));
        assert_eq!(m.answers[1].name, "cdn.example.com");
        assert_eq!(m.addresses_for("www.example.com"), vec![(Ipv4Addr::new(93, 184, 216, 34), 30)]);
    }

    #[test]
    fn pointer_loop_is_rejected() {
        let mut msg = vec![0u8; 12];
        msg[5] = 1;
        msg.extend_from_slice(&[0xc0, 12]);
        assert_eq!(Message::parse(&msg), Err(NetError::Malformed("dns pointer loop")));
    }

    #[test]
    fn oversized_label_rejected() {
        let long = "x".repeat(64);
        assert_eq!(encode_name(&long, &mut Vec::new()), Err(NetError::Invalid("dns label length")));
        assert_eq!(encode_name("a..b", &mut Vec::new()), Err(NetError::Invalid("dns label length")));
    }

    #[test]
    fn cache_honours_ttl() {
        let mut c = DnsCache::new(8);
        c.insert("Example.COM.", vec![Ipv4Addr::new(1, 2, 3, 4)], 10, 0);
        assert_eq!(c.lookup("example.com", 9_999_999_999), Some(vec![Ipv4Addr::new(1, 2, 3, 4)]));
        assert_eq!(c.lookup("example.com", 10_000_000_000), None);
        assert!(c.is_empty());
        assert_eq!(c.stats(), DnsCacheStats { hits: 1, misses: 1 });
    }

    #[test]
    fn cache_evicts_soonest_expiry_when_full() {
        let mut c = DnsCache::new(2);
        c.insert("a", vec![Ipv4Addr::LOCALHOST], 5, 0);
        c.insert("b", vec![Ipv4Addr::LOCALHOST], 50, 0);
        c.insert("c", vec![Ipv4Addr::LOCALHOST], 50, 0);
        assert_eq!(c.len(), 2);
        assert!(c.lookup("a", 0).is_none());
        assert!(c.lookup("b", 0).is_some());
    }

    proptest! {
        #[test]
        fn name_codec_is_lossless(labels in proptest::collection::vec("[a-z0-9-]{1,20}", 1..6)) {
            let name = labels.join(".");
            let mut wire = Vec::new();
            encode_name(&name, &mut wire).expect("encode");
            let (back, end) = decode_name(&wire, 0).expect("decode");
            prop_assert_eq!(back, name);
            prop_assert_eq!(end, wire.len());
        }
    }
}
