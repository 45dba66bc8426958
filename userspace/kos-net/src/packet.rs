// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Packet buffer with headroom and per-layer header cursors.
//!
//! Usable data is `buf[head .. head + len]`. Cursors are absolute offsets into
//! `buf`, so they stay valid while `push`/`pull` move the head.

use crate::error::{NetError, Result};

/// Headroom reserved by [`Packet::from_payload`]: Ethernet + VLAN + IPv4 with
/// options + TCP with options.
pub const DEFAULT_HEADROOM: usize = 14 + 4 + 60 + 60;

/// Upper bound for a single packet buffer.
pub const MAX_PACKET: usize = 65_535 + DEFAULT_HEADROOM;

/// Owned packet buffer.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Packet {
    buf: Vec<u8>,
    head: usize,
    len: usize,
    l2: Option<usize>,
    l3: Option<usize>,
    l4: Option<usize>,
    l7: Option<usize>,
    timestamp_ns: u64,
    ifindex: Option<u32>,
}

impl Packet {
    /// Zeroed buffer of `capacity` bytes, `headroom` of which sit in front of
    /// the (empty) data area.
    pub fn with_headroom(headroom: usize, capacity: usize) -> Result<Self> {
        if headroom > capacity || capacity > MAX_PACKET {
            return Err(NetError::Invalid("packet capacity"));
        }
        Ok(Self {
            buf: vec![0; capacity],
            head: headroom,
            len: 0,
            l2: None,
            l3: None,
            l4: None,
            l7: None,
            timestamp_ns: 0,
            ifindex: None,
        })
    }

    /// Zeroed buffer without headroom.
    pub fn new(capacity: usize) -> Result<Self> {
        Self::with_headroom(0, capacity)
    }

    /// Received frame; no headroom needed.
    pub fn from_frame(frame: &[u8]) -> Self {
        Self {
            buf: frame.to_vec(),
            head: 0,
            len: frame.len(),
            l2: None,
            l3: None,
            l4: None,
            l7: None,
            timestamp_ns: 0,
            ifindex: None,
        }
    }

    /// Outbound payload with [`DEFAULT_HEADROOM`] in front of it.
    pub fn from_payload(payload: &[u8]) -> Result<Self> {
        let mut pkt = Self::with_headroom(DEFAULT_HEADROOM, DEFAULT_HEADROOM + payload.len())?;
        pkt.put(payload)?;
        Ok(pkt)
    }

    /// Appends `data` at the tail.
    pub fn put(&mut self, data: &[u8]) -> Result<()> {
        let end = self.head + self.len;
        if data.len() > self.buf.len() - end {
            return Err(NetError::NoBufs);
        }
        self.buf[end..end + data.len()].copy_from_slice(data);
        self.len += data.len();
        Ok(())
    }

    /// Reserves `n` bytes of header space at the front and returns it.
    pub fn push(&mut self, n: usize) -> Result<&mut [u8]> {
        if n > self.head {
            return Err(NetError::NoBufs);
        }
        self.head -= n;
        self.len += n;
        Ok(&mut self.buf[self.head..self.head + n])
    }

    /// Strips `n` bytes from the front.
    pub fn pull(&mut self, n: usize) -> Result<()> {
        if n > self.len {
            return Err(NetError::Malformed("pull past end"));
        }
        self.head += n;
        self.len -= n;
        Ok(())
    }

    /// Drops tail bytes beyond `len` (link-layer padding).
    pub fn trim(&mut self, len: usize) {
        self.len = self.len.min(len);
    }

    /// Current data.
    pub fn data(&self) -> &[u8] {
        &self.buf[self.head..self.head + self.len]
    }

    /// Current data, mutable.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.buf[self.head..self.head + self.len]
    }

    /// Data length.
    pub fn len(&self) -> usize {
        self.len
    }

    /// True when no data is present.
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Bytes available for `push`.
    pub fn headroom(&self) -> usize {
        self.head
    }

    /// Bytes available for `put`.
    pub fn tailroom(&self) -> usize {
        self.buf.len() - self.head - self.len
    }

    /// Total buffer size.
    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    /// Marks the current head as the link-layer header.
    pub fn mark_l2(&mut self) {
        self.l2 = Some(self.head);
    }

    /// Marks the current head as the network header.
    pub fn mark_l3(&mut self) {
        self.l3 = Some(self.head);
    }

    /// Marks the current head as the transport header.
    pub fn mark_l4(&mut self) {
        self.l4 = Some(self.head);
    }

    /// Marks the current head as application data.
    pub fn mark_l7(&mut self) {
        self.l7 = Some(self.head);
    }

    fn from_cursor(&self, cursor: Option<usize>) -> Option<&[u8]> {
        let end = self.head + self.len;
        cursor.filter(|&c| c <= end).map(|c| &self.buf[c..end])
    }

    /// Bytes from the link-layer header to the end of data.
    pub fn l2(&self) -> Option<&[u8]> {
        self.from_cursor(self.l2)
    }

    /// Bytes from the network header to the end of data.
    pub fn l3(&self) -> Option<&[u8]> {
        self.from_cursor(self.l3)
    }

    /// Bytes from the transport header to the end of data.
    pub fn l4(&self) -> Option<&[u8]> {
        self.from_cursor(self.l4)
    }

    /// Application payload.
    pub fn l7(&self) -> Option<&[u8]> {
        self.from_cursor(self.l7)
    }

    /// Arrival or creation time.
    pub fn timestamp_ns(&self) -> u64 {
        self.timestamp_ns
    }

    /// Sets the arrival or creation time.
    pub fn set_timestamp_ns(&mut self, ns: u64) {
        self.timestamp_ns = ns;
    }

    /// Receiving interface.
    pub fn ifindex(&self) -> Option<u32> {
        self.ifindex
    }

    /// Records the receiving interface.
    pub fn set_ifindex(&mut self, ifindex: u32) {
        self.ifindex = Some(ifindex);
    }

    /// Consumes the packet, returning its data.
    pub fn into_data(mut self) -> Vec<u8> {
        self.buf.truncate(self.head + self.len);
        self.buf.drain(..self.head);
        self.buf
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn push_pull_put_move_the_window() {
        let mut pkt = Packet::with_headroom(16, 64).expect("alloc");
        assert!(pkt.buf.iter().all(|&b| b == 0));
        pkt.put(b"payload").expect("put");
        pkt.push(4).expect("push").copy_from_slice(b"HDR:");
        assert_eq!(pkt.data(), b"HDR:payload");
        assert_eq!(pkt.headroom(), 12);
        pkt.pull(4).expect("pull");
        assert_eq!(pkt.data(), b"payload");
        assert_eq!(pkt.pull(8), Err(NetError::Malformed("pull past end")));
        assert_eq!(pkt.push(13).unwrap_err(), NetError::NoBufs);
    }

    #[test]
    fn put_respects_capacity() {
        let mut pkt = Packet::new(4).expect("alloc");
        pkt.put(b"abcd").expect("fits");
        assert_eq!(pkt.put(b"e"), Err(NetError::NoBufs));
        assert_eq!(pkt.tailroom(), 0);
    }

    #[test]
    fn cursors_survive_head_moves() {
        let mut pkt = Packet::from_frame(b"ETHHDR|IPHDR|TCP|data");
        pkt.mark_l2();
        pkt.pull(7).expect("strip l2");
        pkt.mark_l3();
        pkt.pull(6).expect("strip l3");
        pkt.mark_l4();
        assert_eq!(pkt.l3(), Some(&b"IPHDR|TCP|data"[..]));
        assert_eq!(pkt.l2().map(<[u8]>::len), Some(21));
        pkt.trim(4);
        assert_eq!(pkt.l4(), Some(&b"TCP|"[..]));
        assert_eq!(pkt.into_data(), b"TCP|");
    }
}
