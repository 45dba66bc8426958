// Copyright 2026 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Simulated per-process user address space
//! OWNERS: @kernel-team
//! PUBLIC API: UserMemory (map/unmap/read/write/read_cstr/brk), validate_user_range
//! INVARIANTS:
//!   - Mapped regions never overlap and never reach kernel space
//!   - Every access is validated (non-null, below KERNEL_SPACE_START, no wrap)
//!     before a region lookup; accesses straddling regions fault
//!   - The heap grows from HEAP_BASE and never past HEAP_BASE + heap_max

use std::collections::BTreeMap;

use kos_abi::{Errno, KERNEL_SPACE_START, PATH_MAX};

/// Page granule used for heap growth.
pub const PAGE_SIZE: u64 = 4096;
/// Start of the `brk` heap.
pub const HEAP_BASE: u64 = 0x0000_1000_0000;
/// Default upper bound on heap size.
pub const DEFAULT_HEAP_MAX: u64 = 64 * 1024 * 1024;

/// Checks that `[addr, addr + len)` is a plausible user range: non-null,
/// entirely below kernel space and not wrapping.
pub fn validate_user_range(addr: u64, len: u64) -> Result<(), Errno> {
    if addr == 0 {
        return Err(Errno::EFAULT);
    }
    let end = addr.checked_add(len).ok_or(Errno::EFAULT)?;
    if addr >= KERNEL_SPACE_START || end > KERNEL_SPACE_START {
        return Err(Errno::EFAULT);
    }
    Ok(())
}

fn page_align(v: u64) -> u64 {
    v.div_ceil(PAGE_SIZE) * PAGE_SIZE
}

/// Byte-addressable user memory made of disjoint zero-filled regions.
#[derive(Clone, Debug)]
pub struct UserMemory {
    regions: BTreeMap<u64, Vec<u8>>,
    brk: u64,
    heap_max: u64,
}

impl Default for UserMemory {
    fn default() -> Self {
        Self::new(DEFAULT_HEAP_MAX)
    }
}

impl UserMemory {
    /// Empty address space whose heap may grow to `heap_max` bytes.
    pub fn new(heap_max: u64) -> Self {
        Self { regions: BTreeMap::new(), brk: HEAP_BASE, heap_max }
    }

    fn overlaps(&self, addr: u64, end: u64) -> bool {
        if let Some((&base, data)) = self.regions.range(..end).next_back() {
            return base + data.len() as u64 > addr;
        }
        false
    }

    /// Maps `len` zeroed bytes at `addr`.
    pub fn map(&mut self, addr: u64, len: u64) -> Result<(), Errno> {
        validate_user_range(addr, len)?;
        if len == 0 {
            return Err(Errno::EINVAL);
        }
        let heap_end = HEAP_BASE + self.heap_max;
        if addr < heap_end && addr + len > HEAP_BASE {
            return Err(Errno::EINVAL);
        }
        if self.overlaps(addr, addr + len) {
            return Err(Errno::EEXIST);
        }
        let len = usize::try_from(len).map_err(|_| Errno::ENOMEM)?;
        self.regions.insert(addr, vec![0; len]);
        Ok(())
    }

    /// Drops the region starting at `addr`.
    pub fn unmap(&mut self, addr: u64) -> Result<(), Errno> {
        if addr == HEAP_BASE {
            return Err(Errno::EINVAL);
        }
        self.regions.remove(&addr).map(|_| ()).ok_or(Errno::EINVAL)
    }

    /// Number of mapped bytes.
    pub fn mapped_bytes(&self) -> u64 {
        self.regions.values().map(|r| r.len() as u64).sum()
    }

    fn locate(&self, addr: u64, len: u64) -> Result<(u64, usize), Errno> {
        validate_user_range(addr, len)?;
        let (&base, data) = self.regions.range(..=addr).next_back().ok_or(Errno::EFAULT)?;
        let offset = addr - base;
        if offset + len > data.len() as u64 {
            return Err(Errno::EFAULT);
        }
        Ok((base, offset as usize))
    }

    /// Fails with `EFAULT` unless the whole range is mapped.
    pub fn check(&self, addr: u64, len: u64) -> Result<(), Errno> {
        if len == 0 {
            return Ok(());
        }
        self.locate(addr, len).map(|_| ())
    }

    /// Copies `len` bytes out of user memory.
    pub fn read(&self, addr: u64, len: u64) -> Result<Vec<u8>, Errno> {
        if len == 0 {
            return Ok(Vec::new());
        }
        let (base, off) = self.locate(addr, len)?;
        let data = &self.regions[&base];
        Ok(data[off..off + len as usize].to_vec())
    }

    /// Copies `bytes` into user memory.
    pub fn write(&mut self, addr: u64, bytes: &[u8]) -> Result<(), Errno> {
        if bytes.is_empty() {
            return Ok(());
        }
        let (base, off) = self.locate(addr, bytes.len() as u64)?;
        let data = self.regions.get_mut(&base).ok_or(Errno::EFAULT)?;
        data[off..off + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }

    /// Reads a NUL-terminated UTF-8 string of at most `PATH_MAX` bytes.
    pub fn read_cstr(&self, addr: u64) -> Result<String, Errno> {
        let (base, off) = self.locate(addr, 1)?;
        let data = &self.regions[&base][off..];
        let window = &data[..data.len().min(PATH_MAX + 1)];
        let nul = match window.iter().position(|b| *b == 0) {
            Some(n) => n,
            None if window.len() > PATH_MAX => return Err(Errno::ENAMETOOLONG),
            None => return Err(Errno::EFAULT),
        };
        String::from_utf8(window[..nul].to_vec()).map_err(|_| Errno::EINVAL)
    }

    /// Reads a little-endian `u64`.
    pub fn read_u64(&self, addr: u64) -> Result<u64, Errno> {
        let bytes = self.read(addr, 8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(&bytes);
        Ok(u64::from_le_bytes(raw))
    }

    /// Writes a little-endian `u64`.
    pub fn write_u64(&mut self, addr: u64, value: u64) -> Result<(), Errno> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Current program break.
    pub fn current_brk(&self) -> u64 {
        self.brk
    }

    /// Moves the program break. Out-of-range requests (including 0) leave
    /// it unchanged; the return value is always the resulting break.
    pub fn brk(&mut self, new_brk: u64) -> u64 {
        if new_brk < HEAP_BASE || new_brk > HEAP_BASE + self.heap_max {
            return self.brk;
        }
        let pages = page_align(new_brk - HEAP_BASE);
        if pages == 0 {
            self.regions.remove(&HEAP_BASE);
        } else {
            let Ok(len) = usize::try_from(pages) else {
                return self.brk;
            };
            let heap = self.regions.entry(HEAP_BASE).or_default();
            heap.resize(len, 0);
        }
        self.brk = new_brk;
        self.brk
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn validation_rejects_null_kernel_and_wrap() {
        assert_eq!(validate_user_range(0, 1), Err(Errno::EFAULT));
        assert_eq!(validate_user_range(KERNEL_SPACE_START, 1), Err(Errno::EFAULT));
        assert_eq!(validate_user_range(KERNEL_SPACE_START - 4, 8), Err(Errno::EFAULT));
        assert_eq!(validate_user_range(u64::MAX - 2, 8), Err(Errno::EFAULT));
        assert_eq!(validate_user_range(KERNEL_SPACE_START - 8, 8), Ok(()));
    }

    #[test]
    fn map_read_write() {
        let mut m = UserMemory::default();
        m.map(0x4000, 64).unwrap();
        m.write(0x4010, b"abc").unwrap();
        assert_eq!(m.read(0x4010, 3).unwrap(), b"abc");
        assert_eq!(m.read(0x4000, 2).unwrap(), vec![0, 0]);
        assert_eq!(m.read(0x4030, 32), Err(Errno::EFAULT));
        assert_eq!(m.read(0x3000, 1), Err(Errno::EFAULT));
        assert_eq!(m.map(0x4020, 8), Err(Errno::EEXIST));
        assert_eq!(m.map(0x3ff8, 16), Err(Errno::EEXIST));
        m.unmap(0x4000).unwrap();
        assert_eq!(m.read(0x4010, 1), Err(Errno::EFAULT));
    }

    #[test]
    fn cstr_needs_terminator() {
        let mut m = UserMemory::default();
        m.map(0x8000, 16).unwrap();
        m.write(0x8000, b"/tmp/x\0").unwrap();
        assert_eq!(m.read_cstr(0x8000).unwrap(), "/tmp/x");
        m.write(0x8000, &[b'a'; 16]).unwrap();
        assert_eq!(m.read_cstr(0x8000), Err(Errno::EFAULT));
    }

    #[test]
    fn overlong_cstr_is_enametoolong() {
        let mut m = UserMemory::default();
        m.map(0x10_0000, PATH_MAX as u64 + 16).unwrap();
        m.write(0x10_0000, &vec![b'a'; PATH_MAX + 8]).unwrap();
        assert_eq!(m.read_cstr(0x10_0000), Err(Errno::ENAMETOOLONG));
    }

    #[test]
    fn brk_grows_shrinks_and_is_bounded() {
        let mut m = UserMemory::new(4 * PAGE_SIZE);
        assert_eq!(m.brk(0), HEAP_BASE);
        assert_eq!(m.brk(HEAP_BASE + 100), HEAP_BASE + 100);
        m.write(HEAP_BASE + 4000, &[1; 96]).unwrap();
        assert_eq!(m.brk(HEAP_BASE + 5 * PAGE_SIZE), HEAP_BASE + 100);
        assert_eq!(m.brk(HEAP_BASE), HEAP_BASE);
        assert_eq!(m.read(HEAP_BASE, 1), Err(Errno::EFAULT));
        assert_eq!(m.map(HEAP_BASE + PAGE_SIZE, 8), Err(Errno::EINVAL));
    }

    proptest! {
        #[test]
        fn access_succeeds_iff_inside_a_region(off in 0u64..320, len in 1u64..128) {
            let mut m = UserMemory::default();
            m.map(0x20_0000, 256).unwrap();
            let inside = off + len <= 256;
            prop_assert_eq!(m.check(0x20_0000 + off, len).is_ok(), inside);
            prop_assert_eq!(m.write(0x20_0000 + off, &vec![7u8; len as usize]).is_ok(), inside);
        }
    }
}
