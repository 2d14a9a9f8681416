// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Architecture-Specific Virtual Address Space
//!
//! This module provides the interface between the VM core and the MMU code
//! of an architecture. The core only ever installs, removes, re-protects and
//! queries single-page translations through it.
//!
//! [`SoftArchVmAspace`] keeps translations in a sorted map instead of hardware
//! page tables. It is the implementation used on hosted builds and in tests.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

use bitflags::bitflags;
use spin::Mutex;

use super::layout::{checked_round_up, is_page_aligned, PAGE_SIZE};
use super::{Result, VmError};
use crate::rustux::types::{PAddr, VAddr};

bitflags! {
    /// Architecture-independent MMU flags
    ///
    /// The low two bits hold the cache policy; the rest are permissions.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct ArchMmuFlags: u32 {
        /// Normal cached memory
        const CACHED = 0;
        /// Uncached (strongly ordered) memory
        const UNCACHED = 1;
        /// Uncached device memory
        const UNCACHED_DEVICE = 2;
        /// Write-combining memory
        const WRITE_COMBINING = 3;
        /// Cache policy field
        const CACHE_MASK = 3;

        /// Accessible from user mode
        const PERM_USER = 1 << 2;
        /// Readable
        const PERM_READ = 1 << 3;
        /// Writable
        const PERM_WRITE = 1 << 4;
        /// Executable
        const PERM_EXECUTE = 1 << 5;
    }
}

impl ArchMmuFlags {
    /// The cache policy bits alone
    pub fn cache_policy(self) -> ArchMmuFlags {
        self & Self::CACHE_MASK
    }

    /// The permission bits alone
    pub fn permissions(self) -> ArchMmuFlags {
        self - Self::CACHE_MASK
    }
}

/// Architecture-specific VM address space interface
///
/// All calls operate on whole pages. Implementations serialize internally, so
/// every method takes `&self`.
pub trait ArchVmAspace: Send + Sync {
    /// Set up the translation context for `[base, base + size)`
    fn init(&self, base: VAddr, size: usize, kernel: bool) -> Result;

    /// Tear down the translation context
    fn destroy(&self) -> Result;

    /// Map `count` pages starting at `paddr` to `vaddr`
    ///
    /// Fails with `AlreadyExists` if any page in the range is mapped.
    fn map(&self, vaddr: VAddr, paddr: PAddr, count: usize, flags: ArchMmuFlags) -> Result<usize>;

    /// Unmap `count` pages at `vaddr`; unmapped pages are skipped
    fn unmap(&self, vaddr: VAddr, count: usize) -> Result<usize>;

    /// Change the flags of the mapped pages in the range
    fn protect(&self, vaddr: VAddr, count: usize, flags: ArchMmuFlags) -> Result;

    /// Look up the translation for `vaddr`
    fn query(&self, vaddr: VAddr) -> Result<(PAddr, ArchMmuFlags)>;

    /// Pick an address for a new region inside the gap `[base, end)`
    ///
    /// The neighbours' flags let an architecture keep incompatible regions
    /// apart. The default just rounds `base` up to `align`.
    #[allow(clippy::too_many_arguments)]
    fn pick_spot(
        &self,
        base: VAddr,
        _prev_region_flags: ArchMmuFlags,
        _end: VAddr,
        _next_region_flags: ArchMmuFlags,
        align: usize,
        _size: usize,
        _flags: ArchMmuFlags,
    ) -> Option<VAddr> {
        checked_round_up(base, align)
    }

    /// Switch the hardware to this context
    fn context_switch(&self, _old: Option<&dyn ArchVmAspace>) {}
}

/// ============================================================================
/// Software Translation Table
/// ============================================================================

struct SoftState {
    base: VAddr,
    size: usize,
    initialized: bool,
    entries: BTreeMap<VAddr, (PAddr, ArchMmuFlags)>,
}

/// Translation table kept in memory
pub struct SoftArchVmAspace {
    state: Mutex<SoftState>,
    fail_maps: AtomicBool,
    switches: AtomicUsize,
}

impl Default for SoftArchVmAspace {
    fn default() -> Self {
        Self::new()
    }
}

impl SoftArchVmAspace {
    /// Create an uninitialized table
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(SoftState {
                base: 0,
                size: 0,
                initialized: false,
                entries: BTreeMap::new(),
            }),
            fail_maps: AtomicBool::new(false),
            switches: AtomicUsize::new(0),
        }
    }

    /// Make every later `map` call fail with `NoMemory`
    pub fn set_fail_maps(&self, fail: bool) {
        self.fail_maps.store(fail, Ordering::Relaxed);
    }

    /// Number of installed translations
    pub fn mapping_count(&self) -> usize {
        self.state.lock().entries.len()
    }

    /// Snapshot of all installed translations
    pub fn entries(&self) -> Vec<(VAddr, PAddr, ArchMmuFlags)> {
        self.state
            .lock()
            .entries
            .iter()
            .map(|(va, (pa, fl))| (*va, *pa, *fl))
            .collect()
    }

    /// Number of times this context was switched to
    pub fn context_switch_count(&self) -> usize {
        self.switches.load(Ordering::Relaxed)
    }

    /// Validate `count` pages at `vaddr`, returning the last byte covered
    ///
    /// `None` for an empty range. The range may end at the very top of the
    /// address space.
    fn check_range(state: &SoftState, vaddr: VAddr, count: usize) -> Result<Option<VAddr>> {
        if !state.initialized {
            return Err(VmError::BadState);
        }
        if !is_page_aligned(vaddr) {
            return Err(VmError::InvalidArgs);
        }
        if count == 0 {
            return Ok(None);
        }
        let len = count.checked_mul(PAGE_SIZE).ok_or(VmError::OutOfRange)?;
        let last = vaddr.checked_add(len - 1).ok_or(VmError::OutOfRange)?;
        if vaddr < state.base || last - state.base > state.size - 1 {
            return Err(VmError::OutOfRange);
        }
        Ok(Some(last))
    }
}

impl ArchVmAspace for SoftArchVmAspace {
    fn init(&self, base: VAddr, size: usize, _kernel: bool) -> Result {
        let mut state = self.state.lock();
        if state.initialized {
            return Err(VmError::BadState);
        }
        if size == 0 {
            return Err(VmError::InvalidArgs);
        }
        state.base = base;
        state.size = size;
        state.initialized = true;
        Ok(())
    }

    fn destroy(&self) -> Result {
        let mut state = self.state.lock();
        if !state.entries.is_empty() {
            log::warn!(
                "arch aspace destroyed with {} live translations",
                state.entries.len()
            );
            state.entries.clear();
        }
        state.initialized = false;
        Ok(())
    }

    fn map(&self, vaddr: VAddr, paddr: PAddr, count: usize, flags: ArchMmuFlags) -> Result<usize> {
        if self.fail_maps.load(Ordering::Relaxed) {
            return Err(VmError::NoMemory);
        }
        if !is_page_aligned(paddr) {
            return Err(VmError::InvalidArgs);
        }
        let mut state = self.state.lock();
        let last = match Self::check_range(&state, vaddr, count)? {
            Some(last) => last,
            None => return Ok(0),
        };
        if state.entries.range(vaddr..=last).next().is_some() {
            return Err(VmError::AlreadyExists);
        }
        for i in 0..count {
            state
                .entries
                .insert(vaddr + i * PAGE_SIZE, (paddr + i * PAGE_SIZE, flags));
        }
        Ok(count)
    }

    fn unmap(&self, vaddr: VAddr, count: usize) -> Result<usize> {
        let mut state = self.state.lock();
        let last = match Self::check_range(&state, vaddr, count)? {
            Some(last) => last,
            None => return Ok(0),
        };
        let doomed: Vec<VAddr> = state.entries.range(vaddr..=last).map(|(va, _)| *va).collect();
        for va in doomed.iter() {
            state.entries.remove(va);
        }
        Ok(doomed.len())
    }

    fn protect(&self, vaddr: VAddr, count: usize, flags: ArchMmuFlags) -> Result {
        let mut state = self.state.lock();
        let last = match Self::check_range(&state, vaddr, count)? {
            Some(last) => last,
            None => return Ok(()),
        };
        for (_, entry) in state.entries.range_mut(vaddr..=last) {
            entry.1 = flags;
        }
        Ok(())
    }

    fn query(&self, vaddr: VAddr) -> Result<(PAddr, ArchMmuFlags)> {
        let state = self.state.lock();
        let page = vaddr & !(PAGE_SIZE - 1);
        let (pa, flags) = state.entries.get(&page).ok_or(VmError::NotFound)?;
        Ok((pa + (vaddr - page), *flags))
    }

    fn context_switch(&self, _old: Option<&dyn ArchVmAspace>) {
        self.switches.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::vm::layout::{KERNEL_ASPACE_BASE, KERNEL_ASPACE_SIZE};

    const RW: ArchMmuFlags = ArchMmuFlags::PERM_READ.union(ArchMmuFlags::PERM_WRITE);

    fn table() -> SoftArchVmAspace {
        let t = SoftArchVmAspace::new();
        t.init(0x1000_0000, 0x10_0000, false).unwrap();
        t
    }

    #[test]
    fn test_map_query_unmap() {
        let t = table();
        assert_eq!(t.map(0x1000_2000, 0x8000, 2, RW), Ok(2));
        assert_eq!(t.query(0x1000_3004), Ok((0x9004, RW)));
        assert_eq!(t.map(0x1000_3000, 0xa000, 1, RW), Err(VmError::AlreadyExists));
        assert_eq!(t.unmap(0x1000_0000, 8), Ok(2));
        assert_eq!(t.query(0x1000_2000), Err(VmError::NotFound));
    }

    #[test]
    fn test_protect_and_bounds() {
        let t = table();
        t.map(0x1000_0000, 0x8000, 1, RW).unwrap();
        t.protect(0x1000_0000, 4, ArchMmuFlags::PERM_READ).unwrap();
        assert_eq!(t.query(0x1000_0000).unwrap().1, ArchMmuFlags::PERM_READ);
        assert_eq!(t.map(0x0fff_f000, 0x8000, 1, RW), Err(VmError::OutOfRange));
        assert_eq!(t.map(0x1000_0800, 0x8000, 1, RW), Err(VmError::InvalidArgs));
        assert_eq!(SoftArchVmAspace::new().query(0), Err(VmError::NotFound));
        assert_eq!(
            SoftArchVmAspace::new().map(0, 0, 1, RW),
            Err(VmError::BadState)
        );
    }

    #[test]
    fn test_last_page_of_address_space() {
        let t = SoftArchVmAspace::new();
        t.init(KERNEL_ASPACE_BASE, KERNEL_ASPACE_SIZE, true).unwrap();
        let top = usize::MAX - (PAGE_SIZE - 1);
        assert_eq!(t.map(top, 0x8000, 1, RW), Ok(1));
        assert_eq!(t.query(top + 0x10), Ok((0x8010, RW)));
        t.protect(top, 1, ArchMmuFlags::PERM_READ).unwrap();
        assert_eq!(t.map(top, 0x9000, 2, RW), Err(VmError::OutOfRange));
        assert_eq!(t.unmap(top - PAGE_SIZE, 2), Ok(1));
        assert_eq!(t.map(top, 0x8000, 0, RW), Ok(0));
        assert_eq!(SoftArchVmAspace::new().init(0, 0, false), Err(VmError::InvalidArgs));
    }

    #[test]
    fn test_default_pick_spot_rounds_up() {
        let t = table();
        let none = ArchMmuFlags::empty();
        assert_eq!(
            t.pick_spot(0x1000_1000, none, 0x1001_0000, none, 0x4000, 0x1000, none),
            Some(0x1000_4000)
        );
        assert_eq!(t.pick_spot(usize::MAX - 10, none, usize::MAX, none, 0x1000, 1, none), None);
    }

    #[test]
    fn test_flag_fields() {
        let f = ArchMmuFlags::UNCACHED_DEVICE | ArchMmuFlags::PERM_READ;
        assert_eq!(f.cache_policy(), ArchMmuFlags::UNCACHED_DEVICE);
        assert_eq!(f.permissions(), ArchMmuFlags::PERM_READ);
    }
}
