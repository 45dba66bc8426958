// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

#![forbid(unsafe_code)]
#![deny(clippy::all, missing_docs)]

//! CONTEXT: Network stack for the KOS userspace kernel
//! OWNERS: @kernel-team
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per protocol module, proptests for codecs and
//!   reassembly, loopback and capture-device scenarios under tests/
//!
//! PUBLIC API:
//!   - NetStack: interfaces, IPv4 in/out paths, timers, worker thread
//!   - TcpSocket/UdpSocket: blocking and non-blocking socket calls
//!   - RouteTable/Netfilter/Conntrack: routing and packet filtering
//!   - DnsCache/DhcpClient: resolver cache and lease state machine
//!   - Packet: headroom buffer with per-layer cursors
//!
//! INVARIANTS:
//!   - Locks nest interface → ARP → routing → netfilter → socket
//!   - No frame is transmitted while an ARP or socket lock is held; TCP
//!     state machines return segments that the stack sends afterwards
//!   - Malformed input is counted and dropped, never surfaced to callers
//!   - Every error maps onto an errno through `NetError::errno`

pub mod arp;
pub mod checksum;
pub mod config;
pub mod conntrack;
pub mod dhcp;
pub mod dns;
pub mod error;
pub mod ethernet;
pub mod fragment;
pub mod icmp;
pub mod iface;
pub mod ipv4;
pub mod ipv6;
pub mod netfilter;
pub mod packet;
pub mod recovery;
pub mod route;
pub mod socket;
pub mod stack;
pub mod tcp;
pub mod udp;

pub use arp::{ArpCache, ArpEntry, ArpOp, ArpPacket};
pub use config::{InterfaceConfig, NetConfig};
pub use conntrack::{Conntrack, CtEntry, CtState, CtStats, FlowKey};
pub use dhcp::{DhcpAction, DhcpClient, DhcpMessage, DhcpState, Lease};
pub use dns::{DnsCache, DnsCacheStats, Message as DnsMessage};
pub use error::{NetError, Result};
pub use ethernet::{EthHeader, MacAddr, VlanTag};
pub use fragment::{Reassembler, ReassemblyStats};
pub use icmp::{IcmpMessage, UnreachCode};
pub use iface::{CaptureDevice, IfFlags, IfStatsSnapshot, Interface, LoopbackDevice, NetDevice};
pub use ipv4::{Ipv4Cidr, Ipv4Header};
pub use ipv6::Ipv6Header;
pub use netfilter::{Hook, HookFn, HookId, Netfilter, NfPacket, Verdict};
pub use packet::Packet;
pub use recovery::{ErrorKind, ErrorRecovery, RecoveryAction, RecoveryStats};
pub use route::{Route, RouteFlags, RouteStats, RouteTable};
pub use socket::{TcpSocket, TcpTable, UdpSocket};
pub use stack::{EchoReply, NetStack, NetStats, SendOptions};
pub use tcp::TcpState;
pub use udp::Datagram;
