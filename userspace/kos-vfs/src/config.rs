// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! VFS tunables, embedded in the kernel configuration document.

use serde::{Deserialize, Serialize};

/// Default dentry cache capacity.
pub const DCACHE_MAX_ENTRIES: usize = 10_000;
/// Default dentry time-to-live in seconds.
pub const DCACHE_TTL_SECS: u64 = 300;
/// Symlink nesting limit during a walk.
pub const MAX_SYMLINK_DEPTH: u32 = 40;

/// VFS configuration section.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VfsConfig {
    /// Dentry cache capacity before LRU eviction kicks in.
    pub dcache_max_entries: usize,
    /// Age after which a cached dentry is treated as a miss.
    pub dcache_ttl_secs: u64,
    /// Umask given to new contexts.
    pub default_umask: u32,
    /// Descriptor table size per context.
    pub max_fds: usize,
    /// Inode budget of the root ramfs.
    pub ramfs_max_inodes: u64,
}

impl Default for VfsConfig {
    fn default() -> Self {
        Self {
            dcache_max_entries: DCACHE_MAX_ENTRIES,
            dcache_ttl_secs: DCACHE_TTL_SECS,
            default_umask: 0o022,
            max_fds: kos_abi::MAX_FDS,
            ramfs_max_inodes: 1 << 20,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let cfg: VfsConfig = serde_json::from_str(r#"{"dcache_max_entries": 64}"#).expect("parse");
        assert_eq!(cfg.dcache_max_entries, 64);
        assert_eq!(cfg.dcache_ttl_secs, DCACHE_TTL_SECS);
        assert_eq!(cfg.default_umask, 0o022);
    }
}
