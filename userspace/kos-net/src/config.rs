// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Network stack tunables, embedded in the kernel configuration document.

use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

use crate::arp::ARP_MAX_ENTRIES;
use crate::conntrack::CONNTRACK_MAX;
use crate::iface::DEFAULT_MTU;
use crate::ipv4::DEFAULT_TTL;
use crate::recovery::ERRORS_PER_SEC;
use crate::tcp::{TCP_DEFAULT_RCVBUF, TCP_DEFAULT_SNDBUF};
use crate::udp::UDP_RCVBUF_DEFAULT;

/// One Ethernet interface to bring up at boot.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterfaceConfig {
    /// Interface name.
    pub name: String,
    /// Hardware address; derived from the index when absent.
    pub mac: Option<String>,
    /// Static address.
    pub ipv4: Option<Ipv4Addr>,
    /// Prefix length of `ipv4`.
    pub prefix_len: u8,
    /// Link MTU.
    pub mtu: usize,
    /// Default gateway reachable through this interface.
    pub gateway: Option<Ipv4Addr>,
    /// Run the DHCP client instead of the static address.
    pub dhcp: bool,
}

impl Default for InterfaceConfig {
    fn default() -> Self {
        Self {
            name: "eth0".to_string(),
            mac: None,
            ipv4: None,
            prefix_len: 24,
            mtu: DEFAULT_MTU,
            gateway: None,
            dhcp: false,
        }
    }
}

/// Network configuration section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetConfig {
    /// Interfaces besides loopback.
    pub interfaces: Vec<InterfaceConfig>,
    /// ARP entry lifetime.
    pub arp_ttl_secs: u64,
    /// ARP cache capacity.
    pub arp_max_entries: usize,
    /// UDP receive buffer per socket.
    pub udp_rcvbuf: usize,
    /// TCP receive buffer per connection.
    pub tcp_rcvbuf: usize,
    /// TCP send buffer per connection.
    pub tcp_sndbuf: usize,
    /// Errors handled per second before the rest are dropped silently.
    pub errors_per_sec: u32,
    /// Resolvers used by the DNS client.
    pub dns_servers: Vec<Ipv4Addr>,
    /// Forward datagrams not addressed to us.
    pub ip_forward: bool,
    /// TTL of locally generated datagrams.
    pub default_ttl: u8,
    /// Conntrack table capacity.
    pub conntrack_max: usize,
    /// Register the conntrack hook at boot.
    pub conntrack: bool,
    /// Worker thread poll period.
    pub poll_interval_ms: u64,
}

impl Default for NetConfig {
    fn default() -> Self {
        Self {
            interfaces: Vec::new(),
            arp_ttl_secs: 300,
            arp_max_entries: ARP_MAX_ENTRIES,
            udp_rcvbuf: UDP_RCVBUF_DEFAULT,
            tcp_rcvbuf: TCP_DEFAULT_RCVBUF,
            tcp_sndbuf: TCP_DEFAULT_SNDBUF,
            errors_per_sec: ERRORS_PER_SEC,
            dns_servers: Vec::new(),
            ip_forward: false,
            default_ttl: DEFAULT_TTL,
            conntrack_max: CONNTRACK_MAX,
            conntrack: true,
            poll_interval_ms: 1,
        }
    }
}
