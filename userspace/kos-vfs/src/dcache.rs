// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Dentry cache: `(parent, name)` hash threaded by an LRU list.
//!
//! INVARIANTS:
//!   - Every cached dentry's parent is cached or is a root.
//!   - Only dentries with a zero count are evicted or pruned.
//!   - Dentries are dropped outside the cache lock.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use kos_abi::time::{ClockSource, NSEC_PER_SEC};
use parking_lot::RwLock;

use crate::config::VfsConfig;
use crate::dentry::{Dentry, DentryId, DentryRef, D_HASHED};

type Key = (DentryId, String);

/// A name known to be absent from its parent directory.
struct Negative {
    parent: DentryRef,
    dir_version: u64,
    cache_time_ns: u64,
}

enum Entry {
    Positive(Arc<Dentry>),
    Negative(Negative),
}

impl Entry {
    fn positive(&self) -> Option<&Arc<Dentry>> {
        match self {
            Self::Positive(dentry) => Some(dentry),
            Self::Negative(_) => None,
        }
    }

    /// Negative entries are never referenced from outside the cache.
    fn unused(&self) -> bool {
        match self {
            Self::Positive(dentry) => dentry.refcount() == 0,
            Self::Negative(_) => true,
        }
    }

    fn dev(&self) -> u32 {
        match self {
            Self::Positive(dentry) => dentry.inode().dev(),
            Self::Negative(neg) => neg.parent.inode().dev(),
        }
    }

    fn parent(&self) -> Option<DentryRef> {
        match self {
            Self::Positive(dentry) => dentry.parent(),
            Self::Negative(neg) => Some(neg.parent.clone()),
        }
    }
}

struct Node {
    key: Key,
    entry: Entry,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Default)]
struct Lru {
    map: HashMap<Key, usize>,
    nodes: Vec<Option<Node>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
}

impl Lru {
    fn node(&self, idx: usize) -> Option<&Node> {
        self.nodes.get(idx).and_then(Option::as_ref)
    }

    fn node_mut(&mut self, idx: usize) -> Option<&mut Node> {
        self.nodes.get_mut(idx).and_then(Option::as_mut)
    }

    fn unlink(&mut self, idx: usize) {
        let (prev, next) = match self.node(idx) {
            Some(n) => (n.prev, n.next),
            None => return,
        };
        match prev {
            Some(p) => {
                if let Some(n) = self.node_mut(p) {
                    n.next = next;
                }
            }
            None => self.head = next,
        }
        match next {
            Some(nx) => {
                if let Some(n) = self.node_mut(nx) {
                    n.prev = prev;
                }
            }
            None => self.tail = prev,
        }
    }

    fn push_front(&mut self, idx: usize) {
        let old_head = self.head;
        if let Some(n) = self.node_mut(idx) {
            n.prev = None;
            n.next = old_head;
        }
        if let Some(h) = old_head {
            if let Some(n) = self.node_mut(h) {
                n.prev = Some(idx);
            }
        }
        self.head = Some(idx);
        if self.tail.is_none() {
            self.tail = Some(idx);
        }
    }

    fn promote(&mut self, idx: usize) {
        if self.head != Some(idx) {
            self.unlink(idx);
            self.push_front(idx);
        }
    }

    fn insert(&mut self, key: Key, entry: Entry) {
        let node = Node { key: key.clone(), entry, prev: None, next: None };
        let idx = match self.free.pop() {
            Some(idx) => {
                self.nodes[idx] = Some(node);
                idx
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };
        self.map.insert(key, idx);
        self.push_front(idx);
    }

    fn remove(&mut self, idx: usize) -> Option<Entry> {
        self.unlink(idx);
        let node = self.nodes.get_mut(idx)?.take()?;
        self.map.remove(&node.key);
        self.free.push(idx);
        if let Some(dentry) = node.entry.positive() {
            dentry.clear_flag(D_HASHED);
        }
        Some(node.entry)
    }

    /// Makes room for one more entry, evicting the first unused entry from
    /// the tail when full. Returns the evicted entry.
    fn make_room(&mut self, max_entries: usize) -> Option<Entry> {
        if self.len() < max_entries {
            return None;
        }
        let idx = self.eviction_candidate()?;
        self.remove(idx)
    }

    /// First unused entry walking from the tail.
    fn eviction_candidate(&self) -> Option<usize> {
        let mut cur = self.tail;
        while let Some(idx) = cur {
            let node = self.node(idx)?;
            if node.entry.unused() {
                return Some(idx);
            }
            cur = node.prev;
        }
        None
    }

    fn len(&self) -> usize {
        self.map.len()
    }
}

/// Outcome of a cache lookup.
#[derive(Debug)]
pub enum DcacheLookup {
    /// Fresh entry.
    Hit(DentryRef),
    /// Entry outlived its TTL (or lost its last link) while still referenced;
    /// the caller must revalidate it.
    Stale(DentryRef),
    /// The name is known not to exist and the directory has not changed since.
    Negative,
    /// Not cached.
    Miss,
}

/// Counters exposed for diagnostics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct DcacheStats {
    /// Fresh hits.
    pub hits: u64,
    /// Lookups answered by a negative entry.
    pub negative_hits: u64,
    /// Misses, including expired entries.
    pub misses: u64,
    /// LRU evictions.
    pub evictions: u64,
    /// Entries removed by TTL expiry or pruning.
    pub expired: u64,
}

/// The dentry cache.
pub struct Dcache {
    lru: RwLock<Lru>,
    max_entries: usize,
    ttl_ns: u64,
    clock: Arc<dyn ClockSource>,
    hits: AtomicU64,
    negative_hits: AtomicU64,
    misses: AtomicU64,
    evictions: AtomicU64,
    expired: AtomicU64,
}

impl Dcache {
    /// Cache bounded to `max_entries` with a TTL, timed by `clock`.
    pub fn new(max_entries: usize, ttl_ns: u64, clock: Arc<dyn ClockSource>) -> Self {
        Self {
            lru: RwLock::new(Lru::default()),
            max_entries: max_entries.max(1),
            ttl_ns,
            clock,
            hits: AtomicU64::new(0),
            negative_hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            evictions: AtomicU64::new(0),
            expired: AtomicU64::new(0),
        }
    }

    /// Cache sized from the VFS configuration.
    pub fn from_config(cfg: &VfsConfig, clock: Arc<dyn ClockSource>) -> Self {
        Self::new(cfg.dcache_max_entries, cfg.dcache_ttl_secs.saturating_mul(NSEC_PER_SEC), clock)
    }

    fn now(&self) -> u64 {
        self.clock.read_ns()
    }

    fn is_expired(&self, dentry: &Dentry, now: u64) -> bool {
        now.saturating_sub(dentry.cache_time_ns()) > self.ttl_ns || dentry.inode().nlink() == 0
    }

    fn entry_expired(&self, entry: &Entry, now: u64) -> bool {
        match entry {
            Entry::Positive(dentry) => self.is_expired(dentry, now),
            Entry::Negative(neg) => now.saturating_sub(neg.cache_time_ns) > self.ttl_ns,
        }
    }

    /// Number of cached entries, negative ones included.
    pub fn len(&self) -> usize {
        self.lru.read().len()
    }

    /// True when empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Configured capacity.
    pub fn capacity(&self) -> usize {
        self.max_entries
    }

    /// True when `(parent, name)` is cached.
    pub fn contains(&self, parent: DentryId, name: &str) -> bool {
        self.lru.read().map.contains_key(&(parent, name.to_string()))
    }

    /// True when `(parent, name)` is cached as absent.
    pub fn contains_negative(&self, parent: DentryId, name: &str) -> bool {
        let lru = self.lru.read();
        lru.map
            .get(&(parent, name.to_string()))
            .and_then(|&idx| lru.node(idx))
            .is_some_and(|n| matches!(n.entry, Entry::Negative(_)))
    }

    /// Counter snapshot.
    pub fn stats(&self) -> DcacheStats {
        DcacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            negative_hits: self.negative_hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            evictions: self.evictions.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
        }
    }

    /// Looks up `(parent, name)`; a hit is `dget` plus promotion to the LRU head.
    /// A negative entry only answers while `parent`'s directory version still
    /// matches the one it was recorded under.
    pub fn lookup(&self, parent: &Dentry, name: &str) -> DcacheLookup {
        let now = self.now();
        let key = (parent.id(), name.to_string());
        let mut victim = None;
        let mut recorded_version = None;
        let mut result = {
            let mut lru = self.lru.write();
            match lru.map.get(&key).copied() {
                None => DcacheLookup::Miss,
                Some(idx) => match lru.node(idx).map(|n| &n.entry) {
                    None => DcacheLookup::Miss,
                    Some(Entry::Negative(neg)) => {
                        let (version, cached_at) = (neg.dir_version, neg.cache_time_ns);
                        if now.saturating_sub(cached_at) > self.ttl_ns {
                            victim = lru.remove(idx);
                            self.expired.fetch_add(1, Ordering::Relaxed);
                            DcacheLookup::Miss
                        } else {
                            recorded_version = Some(version);
                            lru.promote(idx);
                            DcacheLookup::Negative
                        }
                    }
                    Some(Entry::Positive(dentry)) => {
                        let dentry = Arc::clone(dentry);
                        if self.is_expired(&dentry, now) {
                            if dentry.refcount() == 0 {
                                victim = lru.remove(idx);
                                self.expired.fetch_add(1, Ordering::Relaxed);
                                DcacheLookup::Miss
                            } else {
                                DcacheLookup::Stale(DentryRef::get(&dentry))
                            }
                        } else {
                            lru.promote(idx);
                            DcacheLookup::Hit(DentryRef::get(&dentry))
                        }
                    }
                },
            }
        };
        drop(victim);
        // The directory lock is only taken once the cache lock is released.
        if let Some(version) = recorded_version {
            if parent.inode().read().dir_version != version {
                self.forget_negative(&key);
                result = DcacheLookup::Miss;
            }
        }
        match &result {
            DcacheLookup::Hit(_) => self.hits.fetch_add(1, Ordering::Relaxed),
            DcacheLookup::Negative => self.negative_hits.fetch_add(1, Ordering::Relaxed),
            _ => self.misses.fetch_add(1, Ordering::Relaxed),
        };
        result
    }

    fn forget_negative(&self, key: &Key) {
        let victim = {
            let mut lru = self.lru.write();
            match lru.map.get(key).copied() {
                Some(idx) if lru.node(idx).is_some_and(|n| matches!(n.entry, Entry::Negative(_))) => {
                    lru.remove(idx)
                }
                _ => None,
            }
        };
        drop(victim);
    }

    /// `d_add`: caches `dentry` under its parent, replacing a negative entry
    /// for the same name. Returns the canonical entry, which is an already
    /// cached one when another walker won the race. A dentry whose parent is
    /// neither cached nor a root is returned uncached.
    pub fn insert(&self, dentry: DentryRef) -> DentryRef {
        let Some(parent) = dentry.parent() else {
            return dentry;
        };
        if !(parent.is_hashed() || parent.is_root()) {
            return dentry;
        }
        let key = (parent.id(), dentry.name());
        let now = self.now();
        let mut victim = None;
        let canonical = {
            let mut lru = self.lru.write();
            if let Some(existing) = lru.map.get(&key).copied().and_then(|idx| lru.node(idx)) {
                if let Some(existing) = existing.entry.positive() {
                    if !self.is_expired(existing, now) {
                        return DentryRef::get(existing);
                    }
                }
            }
            if let Some(idx) = lru.map.get(&key).copied() {
                victim = lru.remove(idx);
            } else {
                victim = lru.make_room(self.max_entries);
                if victim.is_some() {
                    self.evictions.fetch_add(1, Ordering::Relaxed);
                }
            }
            if lru.len() < self.max_entries {
                dentry.set_cache_time_ns(now);
                dentry.set_flag(D_HASHED);
                lru.insert(key, Entry::Positive(dentry.arc().clone()));
            }
            dentry
        };
        drop(victim);
        canonical
    }

    /// Records that `name` is absent from `parent` as of directory version
    /// `dir_version`. A live positive entry for the name wins.
    pub fn insert_negative(&self, parent: &DentryRef, name: &str, dir_version: u64) {
        if !(parent.is_hashed() || parent.is_root()) {
            return;
        }
        let key = (parent.id(), name.to_string());
        let now = self.now();
        let victim = {
            let mut lru = self.lru.write();
            let victim = match lru.map.get(&key).copied() {
                Some(idx) => {
                    if lru.node(idx).is_some_and(|n| n.entry.positive().is_some()) {
                        return;
                    }
                    lru.remove(idx)
                }
                None => {
                    let evicted = lru.make_room(self.max_entries);
                    if evicted.is_some() {
                        self.evictions.fetch_add(1, Ordering::Relaxed);
                    }
                    evicted
                }
            };
            if lru.len() < self.max_entries {
                let neg = Negative { parent: parent.clone(), dir_version, cache_time_ns: now };
                lru.insert(key, Entry::Negative(neg));
            }
            victim
        };
        drop(victim);
    }

    /// Restarts the TTL of a revalidated entry and promotes it.
    pub fn refresh(&self, dentry: &Dentry) {
        let now = self.now();
        let mut lru = self.lru.write();
        if let Some(idx) = lru.map.get(&Self::key_of(dentry)).copied() {
            if lru.node(idx).is_some_and(|n| n.entry.positive().is_some_and(|d| d.id() == dentry.id())) {
                dentry.set_cache_time_ns(now);
                lru.promote(idx);
            }
        }
    }

    fn key_of(dentry: &Dentry) -> Key {
        (dentry.parent().map(|p| p.id()).unwrap_or(0), dentry.name())
    }

    fn holds(lru: &Lru, idx: usize, dentry: &Dentry) -> bool {
        lru.node(idx).is_some_and(|n| n.entry.positive().is_some_and(|d| d.id() == dentry.id()))
    }

    /// `d_drop`: unhashes `dentry` if it is the cached entry for its key.
    pub fn d_drop(&self, dentry: &Dentry) {
        let victim = {
            let mut lru = self.lru.write();
            match lru.map.get(&Self::key_of(dentry)).copied() {
                Some(idx) if Self::holds(&lru, idx, dentry) => lru.remove(idx),
                _ => None,
            }
        };
        drop(victim);
    }

    /// `d_move`: rebinds `dentry` under `new_parent` as `new_name`, rehashing
    /// it when the new parent is cached.
    pub fn d_move(&self, dentry: &DentryRef, new_parent: &DentryRef, new_name: &str) {
        let now = self.now();
        let mut victims = Vec::new();
        {
            let mut lru = self.lru.write();
            if let Some(idx) = lru.map.get(&Self::key_of(dentry)).copied() {
                if Self::holds(&lru, idx, dentry) {
                    victims.extend(lru.remove(idx));
                }
            }
            let key = (new_parent.id(), new_name.to_string());
            if let Some(idx) = lru.map.get(&key).copied() {
                victims.extend(lru.remove(idx));
            }
            dentry.rebind(new_parent.clone(), new_name);
            if (new_parent.is_hashed() || new_parent.is_root()) && lru.len() < self.max_entries {
                dentry.set_cache_time_ns(now);
                dentry.set_flag(D_HASHED);
                lru.insert(key, Entry::Positive(dentry.arc().clone()));
            }
        }
        drop(victims);
    }

    /// Prune pass: removes expired unused entries. Candidates are collected
    /// under the read lock and released outside any lock.
    pub fn prune(&self) -> usize {
        let now = self.now();
        let candidates: Vec<Key> = {
            let lru = self.lru.read();
            lru.nodes
                .iter()
                .flatten()
                .filter(|n| n.entry.unused() && self.entry_expired(&n.entry, now))
                .map(|n| n.key.clone())
                .collect()
        };
        if candidates.is_empty() {
            return 0;
        }
        let victims: Vec<Entry> = {
            let mut lru = self.lru.write();
            candidates
                .into_iter()
                .filter_map(|key| {
                    let idx = lru.map.get(&key).copied()?;
                    let node = lru.node(idx)?;
                    if node.entry.unused() && self.entry_expired(&node.entry, now) {
                        lru.remove(idx)
                    } else {
                        None
                    }
                })
                .collect()
        };
        let removed = victims.len();
        self.expired.fetch_add(removed as u64, Ordering::Relaxed);
        drop(victims);
        log::debug!("vfs: dcache pruned {removed} entries");
        removed
    }

    /// Removes every unused entry on device `dev` (all devices when `None`),
    /// repeating until parents freed by their children are gone too.
    pub fn shrink(&self, dev: Option<u32>) -> usize {
        let mut total = 0;
        loop {
            let victims: Vec<Entry> = {
                let mut lru = self.lru.write();
                let idxs: Vec<usize> = lru
                    .nodes
                    .iter()
                    .enumerate()
                    .filter_map(|(idx, n)| n.as_ref().map(|n| (idx, n)))
                    .filter(|(_, n)| n.entry.unused())
                    .filter(|(_, n)| match dev {
                        Some(d) => n.entry.dev() == d,
                        None => true,
                    })
                    .map(|(idx, _)| idx)
                    .collect();
                idxs.into_iter().filter_map(|idx| lru.remove(idx)).collect()
            };
            if victims.is_empty() {
                return total;
            }
            total += victims.len();
            drop(victims);
        }
    }

    /// Checks that every cached entry's parent is cached or a root.
    pub fn parents_consistent(&self) -> bool {
        let lru = self.lru.read();
        lru.nodes.iter().flatten().all(|n| match n.entry.parent() {
            Some(p) => p.is_root() || p.is_hashed(),
            None => true,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inode::{S_IFDIR, S_IFREG};
    use crate::ramfs::Ramfs;
    use crate::superblock::{FileSystemType, SuperBlock};
    use kos_abi::time::ManualClock;
    use kos_abi::Credentials;
    use proptest::prelude::*;

    struct Fixture {
        sb: Arc<SuperBlock>,
        root: DentryRef,
        clock: Arc<ManualClock>,
    }

    fn fixture() -> Fixture {
        let sb = Ramfs::new(4096).mount(1, "t").expect("mount");
        let root = Dentry::alloc_root("/", None, sb.iget(sb.root_ino()).expect("root"));
        Fixture { sb, root, clock: Arc::new(ManualClock::new(0)) }
    }

    fn child(f: &Fixture, parent: &DentryRef, name: &str, mode: u32) -> DentryRef {
        let inode = f.sb.alloc_inode(mode, &Credentials::ROOT).expect("alloc");
        Dentry::alloc(name, Some(parent.clone()), inode)
    }

    #[test]
    fn hit_promotes_and_counts() {
        let f = fixture();
        let cache = Dcache::new(8, 300 * NSEC_PER_SEC, f.clock.clone());
        let d = cache.insert(child(&f, &f.root, "a", S_IFREG | 0o644));
        assert!(d.is_hashed());
        drop(d);
        match cache.lookup(&f.root, "a") {
            DcacheLookup::Hit(hit) => assert_eq!(hit.refcount(), 1),
            other => panic!("expected hit, got {other:?}"),
        }
        assert!(matches!(cache.lookup(&f.root, "b"), DcacheLookup::Miss));
        assert_eq!(cache.stats().hits, 1);
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn overflow_evicts_oldest_unreferenced() {
        let f = fixture();
        let cache = Dcache::new(3, 300 * NSEC_PER_SEC, f.clock.clone());
        let pinned = cache.insert(child(&f, &f.root, "pinned", S_IFREG | 0o644));
        drop(cache.insert(child(&f, &f.root, "b", S_IFREG | 0o644)));
        drop(cache.insert(child(&f, &f.root, "c", S_IFREG | 0o644)));
        drop(cache.insert(child(&f, &f.root, "d", S_IFREG | 0o644)));
        assert_eq!(cache.len(), 3);
        assert!(cache.contains(f.root.id(), "pinned"));
        assert!(!cache.contains(f.root.id(), "b"));
        assert_eq!(cache.stats().evictions, 1);
        drop(pinned);
    }

    #[test]
    fn expired_entries_miss_or_need_revalidation() {
        let f = fixture();
        let cache = Dcache::new(8, NSEC_PER_SEC, f.clock.clone());
        drop(cache.insert(child(&f, &f.root, "idle", S_IFREG | 0o644)));
        let held = cache.insert(child(&f, &f.root, "held", S_IFREG | 0o644));
        f.clock.advance_ms(1500);
        assert!(matches!(cache.lookup(&f.root, "idle"), DcacheLookup::Miss));
        assert!(!cache.contains(f.root.id(), "idle"));
        match cache.lookup(&f.root, "held") {
            DcacheLookup::Stale(d) => {
                cache.refresh(&d);
            }
            other => panic!("expected stale, got {other:?}"),
        }
        assert!(matches!(cache.lookup(&f.root, "held"), DcacheLookup::Hit(_)));
        drop(held);
    }

    #[test]
    fn uncached_parent_keeps_child_uncached() {
        let f = fixture();
        let cache = Dcache::new(8, NSEC_PER_SEC, f.clock.clone());
        let loose = child(&f, &f.root, "loose", S_IFDIR | 0o755);
        let grandchild = cache.insert(child(&f, &loose, "x", S_IFREG | 0o644));
        assert!(!grandchild.is_hashed());
        assert!(cache.parents_consistent());
    }

    #[test]
    fn prune_and_shrink_release_zero_count_entries() {
        let f = fixture();
        let cache = Dcache::new(16, NSEC_PER_SEC, f.clock.clone());
        let dir = cache.insert(child(&f, &f.root, "dir", S_IFDIR | 0o755));
        drop(cache.insert(child(&f, &dir, "leaf", S_IFREG | 0o644)));
        drop(dir);
        f.clock.advance_ms(2000);
        assert_eq!(cache.prune(), 1);
        assert_eq!(cache.shrink(None), 1);
        assert!(cache.is_empty());
    }

    #[test]
    fn d_move_rekeys_entry() {
        let f = fixture();
        let cache = Dcache::new(16, NSEC_PER_SEC, f.clock.clone());
        let dir = cache.insert(child(&f, &f.root, "dir", S_IFDIR | 0o755));
        let file = cache.insert(child(&f, &f.root, "old", S_IFREG | 0o644));
        cache.d_move(&file, &dir, "new");
        assert!(!cache.contains(f.root.id(), "old"));
        assert!(cache.contains(dir.id(), "new"));
        assert_eq!(file.path(), "/dir/new");
    }

    #[test]
    fn negative_entry_holds_until_directory_changes() {
        let f = fixture();
        let cache = Dcache::new(8, 300 * NSEC_PER_SEC, f.clock.clone());
        let version = f.root.inode().read().dir_version;
        cache.insert_negative(&f.root, "ghost", version);
        assert!(cache.contains_negative(f.root.id(), "ghost"));
        assert!(matches!(cache.lookup(&f.root, "ghost"), DcacheLookup::Negative));
        assert_eq!(cache.stats().negative_hits, 1);

        f.root.inode().write().dir_mut().expect("dir").insert("ghost".into(), 99);
        assert!(matches!(cache.lookup(&f.root, "ghost"), DcacheLookup::Miss));
        assert!(!cache.contains(f.root.id(), "ghost"));
        assert_eq!(cache.stats().misses, 1);
    }

    #[test]
    fn positive_entry_replaces_negative_and_wins() {
        let f = fixture();
        let cache = Dcache::new(8, 300 * NSEC_PER_SEC, f.clock.clone());
        let version = f.root.inode().read().dir_version;
        cache.insert_negative(&f.root, "late", version);
        let late = cache.insert(child(&f, &f.root, "late", S_IFREG | 0o644));
        assert!(late.is_hashed());
        assert!(!cache.contains_negative(f.root.id(), "late"));
        cache.insert_negative(&f.root, "late", version);
        assert!(matches!(cache.lookup(&f.root, "late"), DcacheLookup::Hit(_)));
    }

    #[test]
    fn negative_entries_expire_and_never_pin_capacity() {
        let f = fixture();
        let cache = Dcache::new(2, NSEC_PER_SEC, f.clock.clone());
        let version = f.root.inode().read().dir_version;
        cache.insert_negative(&f.root, "a", version);
        cache.insert_negative(&f.root, "b", version);
        assert_eq!(f.root.refcount(), 3);
        let real = cache.insert(child(&f, &f.root, "real", S_IFREG | 0o644));
        assert!(real.is_hashed());
        assert!(!cache.contains(f.root.id(), "a"));
        assert_eq!(cache.stats().evictions, 1);

        f.clock.advance_ms(1500);
        assert!(matches!(cache.lookup(&f.root, "b"), DcacheLookup::Miss));
        assert_eq!(f.root.refcount(), 2);
        drop(real);
        assert_eq!(cache.shrink(None), 1);
        assert!(cache.is_empty());
        assert_eq!(f.root.refcount(), 1);
    }

    proptest! {
        #[test]
        fn eviction_never_touches_referenced_entries(
            ops in proptest::collection::vec((0usize..12, any::<bool>()), 1..64)
        ) {
            let f = fixture();
            let cache = Dcache::new(4, 300 * NSEC_PER_SEC, f.clock.clone());
            let mut held: Vec<(String, DentryRef)> = Vec::new();
            for (n, keep) in ops {
                let name = format!("f{n}");
                let d = match cache.lookup(&f.root, &name) {
                    DcacheLookup::Hit(d) | DcacheLookup::Stale(d) => d,
                    DcacheLookup::Negative | DcacheLookup::Miss => {
                        cache.insert(child(&f, &f.root, &name, S_IFREG | 0o644))
                    }
                };
                if keep && held.len() < 3 {
                    held.push((name, d));
                }
                for (held_name, dentry) in &held {
                    if dentry.is_hashed() {
                        prop_assert!(cache.contains(f.root.id(), held_name));
                    }
                }
                prop_assert!(cache.len() <= cache.capacity());
                prop_assert!(cache.parents_consistent());
            }
        }
    }
}
