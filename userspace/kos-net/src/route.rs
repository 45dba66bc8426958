// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! IPv4 routing table: longest-prefix match with metric tie-break.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;
use parking_lot::RwLock;
use serde::Serialize;

use crate::error::{NetError, Result};
use crate::ipv4::{prefix_to_mask, Ipv4Cidr};

bitflags! {
    #[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
    /// Route attributes.
    pub struct RouteFlags: u32 {
        /// Route is usable.
        const UP = 1 << 0;
        /// Next hop is a gateway rather than the destination itself.
        const GATEWAY = 1 << 1;
        /// Destination is a single host.
        const HOST = 1 << 2;
        /// Learned from an ICMP redirect; reaped by GC when unused.
        const DYNAMIC = 1 << 3;
        /// Destination is one of our own addresses.
        const LOCAL = 1 << 4;
    }
}

/// Snapshot of a routing entry.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Route {
    /// Network address (already masked).
    pub dest: Ipv4Addr,
    /// Netmask.
    pub genmask: Ipv4Addr,
    /// Next-hop gateway, if any.
    pub gateway: Option<Ipv4Addr>,
    /// Outgoing interface.
    pub ifindex: u32,
    /// Attributes.
    pub flags: RouteFlags,
    /// Lower wins among equal prefixes.
    pub metric: u32,
    /// Lookups that selected this route since the last GC.
    pub uses: u64,
}

impl Route {
    /// Route to `dest/prefix_len`, via `gateway` when given.
    pub fn new(dest: Ipv4Addr, prefix_len: u8, gateway: Option<Ipv4Addr>, ifindex: u32, metric: u32) -> Result<Self> {
        if prefix_len > 32 {
            return Err(NetError::Invalid("prefix length"));
        }
        let genmask = prefix_to_mask(prefix_len);
        let mut flags = RouteFlags::UP;
        if gateway.is_some() {
            flags |= RouteFlags::GATEWAY;
        }
        if prefix_len == 32 {
            flags |= RouteFlags::HOST;
        }
        Ok(Self {
            dest: Ipv4Addr::from(u32::from(dest) & u32::from(genmask)),
            genmask,
            gateway,
            ifindex,
            flags,
            metric,
            uses: 0,
        })
    }

    /// Prefix length of the mask.
    pub fn prefix_len(&self) -> u8 {
        u32::from(self.genmask).leading_ones() as u8
    }

    /// True when `ip` falls inside the route's prefix.
    pub fn matches(&self, ip: Ipv4Addr) -> bool {
        let mask = u32::from(self.genmask);
        u32::from(ip) & mask == u32::from(self.dest) & mask
    }

    /// Address to resolve at link layer for traffic to `dst`.
    pub fn next_hop(&self, dst: Ipv4Addr) -> Ipv4Addr {
        self.gateway.unwrap_or(dst)
    }

    fn same_key(&self, other: &Route) -> bool {
        self.dest == other.dest
            && self.genmask == other.genmask
            && self.gateway == other.gateway
            && self.ifindex == other.ifindex
            && self.metric == other.metric
    }
}

struct Entry {
    route: Route,
    uses: AtomicU64,
}

impl Entry {
    fn snapshot(&self) -> Route {
        Route { uses: self.uses.load(Ordering::Relaxed), ..self.route.clone() }
    }
}

/// Route table counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct RouteStats {
    /// Successful lookups.
    pub hits: u64,
    /// Lookups with no matching route.
    pub misses: u64,
    /// Dynamic routes reaped.
    pub reaped: u64,
}

/// Shared routing table. Readers take the read lock on the fast path; use
/// counters are atomics so lookups never need the write lock.
#[derive(Default)]
pub struct RouteTable {
    routes: RwLock<Vec<Entry>>,
    hits: AtomicU64,
    misses: AtomicU64,
    reaped: AtomicU64,
}

impl RouteTable {
    /// Empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a route; an identical route is `Exists`.
    pub fn add(&self, route: Route) -> Result<()> {
        let mut routes = self.routes.write();
        if routes.iter().any(|e| e.route.same_key(&route)) {
            return Err(NetError::Exists);
        }
        log::debug!(
            "route: add {}/{} via {:?} dev {} metric {}",
            route.dest,
            route.prefix_len(),
            route.gateway,
            route.ifindex,
            route.metric
        );
        routes.push(Entry { uses: AtomicU64::new(route.uses), route });
        Ok(())
    }

    /// Default route through `gateway`.
    pub fn add_default(&self, gateway: Ipv4Addr, ifindex: u32, metric: u32) -> Result<()> {
        self.add(Route::new(Ipv4Addr::UNSPECIFIED, 0, Some(gateway), ifindex, metric)?)
    }

    /// On-link route for an interface address.
    pub fn add_interface_route(&self, cidr: Ipv4Cidr, ifindex: u32) -> Result<()> {
        self.add(Route::new(cidr.network(), cidr.prefix_len, None, ifindex, 0)?)
    }

    /// Host route marking `ip` as local, delivered through `ifindex`.
    pub fn add_local(&self, ip: Ipv4Addr, ifindex: u32) -> Result<()> {
        let mut route = Route::new(ip, 32, None, ifindex, 0)?;
        route.flags |= RouteFlags::LOCAL;
        self.add(route)
    }

    /// Host route learned from an ICMP redirect.
    pub fn add_redirect(&self, dest: Ipv4Addr, gateway: Ipv4Addr, ifindex: u32) -> Result<()> {
        let mut route = Route::new(dest, 32, Some(gateway), ifindex, 0)?;
        route.flags |= RouteFlags::DYNAMIC;
        let mut routes = self.routes.write();
        routes.retain(|e| !(e.route.flags.contains(RouteFlags::DYNAMIC) && e.route.dest == dest));
        routes.push(Entry { uses: AtomicU64::new(0), route });
        Ok(())
    }

    /// Removes the route matching `dest/prefix_len` and `gateway`.
    pub fn delete(&self, dest: Ipv4Addr, prefix_len: u8, gateway: Option<Ipv4Addr>) -> Result<()> {
        let genmask = prefix_to_mask(prefix_len);
        let dest = Ipv4Addr::from(u32::from(dest) & u32::from(genmask));
        let mut routes = self.routes.write();
        let pos = routes
            .iter()
            .position(|e| e.route.dest == dest && e.route.genmask == genmask && e.route.gateway == gateway)
            .ok_or(NetError::NotFound)?;
        routes.remove(pos);
        Ok(())
    }

    /// Drops every route through `ifindex`.
    pub fn remove_interface(&self, ifindex: u32) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|e| e.route.ifindex != ifindex);
        before - routes.len()
    }

    /// Longest-prefix match; equal prefixes prefer the lower metric.
    pub fn lookup(&self, dst: Ipv4Addr) -> Result<Route> {
        let routes = self.routes.read();
        let mut best: Option<&Entry> = None;
        for entry in routes.iter() {
            let r = &entry.route;
            if !r.flags.contains(RouteFlags::UP) || !r.matches(dst) {
                continue;
            }
            let better = match best {
                None => true,
                Some(b) => {
                    let (mask, best_mask) = (u32::from(r.genmask), u32::from(b.route.genmask));
                    mask > best_mask || (mask == best_mask && r.metric < b.route.metric)
                }
            };
            if better {
                best = Some(entry);
            }
        }
        match best {
            Some(entry) => {
                entry.uses.fetch_add(1, Ordering::Relaxed);
                self.hits.fetch_add(1, Ordering::Relaxed);
                Ok(entry.snapshot())
            }
            None => {
                self.misses.fetch_add(1, Ordering::Relaxed);
                Err(NetError::NoRoute)
            }
        }
    }

    /// True when `ip` has a LOCAL host route.
    pub fn is_local(&self, ip: Ipv4Addr) -> bool {
        self.routes
            .read()
            .iter()
            .any(|e| e.route.flags.contains(RouteFlags::LOCAL) && e.route.dest == ip)
    }

    /// Reaps dynamic routes unused since the previous pass and restarts the
    /// use count of the survivors.
    pub fn gc(&self) -> usize {
        let mut routes = self.routes.write();
        let before = routes.len();
        routes.retain(|e| {
            !e.route.flags.contains(RouteFlags::DYNAMIC) || e.uses.swap(0, Ordering::Relaxed) != 0
        });
        let reaped = before - routes.len();
        self.reaped.fetch_add(reaped as u64, Ordering::Relaxed);
        reaped
    }

    /// Snapshot of all routes in insertion order.
    pub fn routes(&self) -> Vec<Route> {
        self.routes.read().iter().map(Entry::snapshot).collect()
    }

    /// Counters.
    pub fn stats(&self) -> RouteStats {
        RouteStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            reaped: self.reaped.load(Ordering::Relaxed),
        }
    }
}
