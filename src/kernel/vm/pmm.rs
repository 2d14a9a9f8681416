// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Physical Memory Manager (PMM)
//!
//! This module provides physical memory allocation services for the kernel.
//! It manages physical memory pages, tracking which pages are free or allocated.
//!
//! # Design
//!
//! Physical memory is registered as a set of arenas, kept in a list ordered by
//! ascending priority. Each arena owns a parallel array of [`Page`] records and
//! an index-linked free list. The whole manager sits behind a single lock, so
//! every allocation and free is serialized.
//!
//! - Fresh arenas put their pages on the free list in ascending address order.
//! - Allocation pops the head of the first eligible arena.
//! - Frees push to the head, so recently freed pages are reused first.
//!
//! Allocation primitives never panic: they return `None` or a partial count
//! and leave the rollback policy to the caller.
//!
//! # Physmap
//!
//! Each arena is backed by a page-aligned, zero-initialised window standing in
//! for the kernel direct map. [`PhysicalMemoryManager::paddr_to_kvaddr`]
//! translates into it and all page content access goes through it.
//!
//! # Usage
//!
//! ```rust,ignore
//! let pmm = PhysicalMemoryManager::new();
//! pmm.add_arena(ArenaInfo::new("ram", ArenaFlags::KMAP, 0, 0x10_0000, 16 * PAGE_SIZE))?;
//!
//! // Allocate a single page
//! let pa = pmm.alloc_page(PmmAllocFlags::empty()).ok_or(VmError::NoMemory)?;
//!
//! // Allocate 8 contiguous pages aligned to 64KB
//! let mut list = Vec::new();
//! let base = pmm.alloc_contiguous(8, PmmAllocFlags::empty(), 16, &mut list);
//!
//! // Free pages
//! pmm.free_page(pa);
//! pmm.free(&mut list);
//! ```

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::fmt;
use core::ptr::NonNull;

use bitflags::bitflags;
use spin::{Mutex, Once};

use super::layout::{checked_round_up, is_page_aligned, PAGE_SIZE, PAGE_SIZE_SHIFT};
use super::{Result, VmError};
use crate::rustux::types::{PAddr, VAddr};

bitflags! {
    /// Arena capability flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct ArenaFlags: u32 {
        /// Arena is in "low memory" (< 4GB)
        const LOW_MEM = 0x1;
        /// Arena is in "high memory" (>= 4GB)
        const HIGH_MEM = 0x2;
        /// Arena is reachable through the kernel physmap
        const KMAP = 0x4;
    }
}

bitflags! {
    /// PMM allocation flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PmmAllocFlags: u32 {
        /// Allocate only from arenas with [`ArenaFlags::KMAP`]
        const KMAP = 0x1;
        /// Allocate only from arenas with [`ArenaFlags::LOW_MEM`]
        const LOW_MEM = 0x2;
    }
}

/// Page state enumeration
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageState {
    /// Page is on its arena free list
    Free = 0,
    /// Page is allocated (general purpose)
    Alloc = 1,
    /// Page is owned by a VM object
    Object = 2,
    /// Page is pinned for kernel use and never freed
    Wired = 3,
    /// Page is used for MMU structures
    Mmu = 4,
}

/// Physical memory arena information
#[derive(Debug, Clone, Copy)]
pub struct ArenaInfo {
    /// Arena name (e.g., "low_mem", "high_mem")
    pub name: &'static str,

    /// Arena capability flags
    pub flags: ArenaFlags,

    /// Arena allocation priority (lower = tried first)
    pub priority: u32,

    /// Base physical address
    pub base: PAddr,

    /// Size in bytes
    pub size: usize,
}

impl ArenaInfo {
    /// Create a new arena info structure
    pub const fn new(
        name: &'static str,
        flags: ArenaFlags,
        priority: u32,
        base: PAddr,
        size: usize,
    ) -> Self {
        Self {
            name,
            flags,
            priority,
            base,
            size,
        }
    }

    /// Get the number of pages in this arena
    pub const fn page_count(&self) -> usize {
        self.size / PAGE_SIZE
    }

    /// Get the end physical address (exclusive)
    pub const fn end(&self) -> PAddr {
        self.base + self.size
    }
}

/// Page structure tracking a single physical page
#[derive(Debug, Clone, Copy)]
pub struct Page {
    /// Physical address of this page
    pub paddr: PAddr,

    /// Current state of the page
    pub state: PageState,
}

impl Page {
    /// Check if this page is free
    pub fn is_free(&self) -> bool {
        self.state == PageState::Free
    }
}

/// End-of-list marker for the index-linked free list
const NIL: u32 = u32::MAX;

/// Backing store for an arena's slice of the physmap
struct PhysWindow {
    ptr: NonNull<u8>,
    layout: Layout,
}

// SAFETY: the window is plain memory owned by the arena; concurrent access to
// a page is governed by the owner of that page, as with a real direct map.
unsafe impl Send for PhysWindow {}
unsafe impl Sync for PhysWindow {}

impl PhysWindow {
    fn new(size: usize) -> Result<Self> {
        let layout = Layout::from_size_align(size, PAGE_SIZE).map_err(|_| VmError::InvalidArgs)?;
        // SAFETY: size is non-zero, checked by add_arena.
        let raw = unsafe { alloc_zeroed(layout) };
        let ptr = NonNull::new(raw).ok_or(VmError::NoMemory)?;
        Ok(Self { ptr, layout })
    }

    fn base(&self) -> VAddr {
        self.ptr.as_ptr() as VAddr
    }
}

impl Drop for PhysWindow {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with the same layout.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) };
    }
}

/// Memory arena structure
struct Arena {
    /// Arena information
    info: ArenaInfo,

    /// Array of page structures
    pages: Vec<Page>,

    /// Free list links, parallel to `pages`
    next: Vec<u32>,
    prev: Vec<u32>,
    head: u32,
    tail: u32,

    /// Number of free pages
    free_count: usize,

    /// Physmap window
    window: PhysWindow,
}

impl Arena {
    fn new(info: ArenaInfo) -> Result<Self> {
        let count = info.page_count();
        if count >= NIL as usize {
            return Err(VmError::OutOfRange);
        }

        let mut pages = Vec::new();
        pages
            .try_reserve_exact(count)
            .map_err(|_| VmError::NoMemory)?;
        let mut next = Vec::new();
        next.try_reserve_exact(count).map_err(|_| VmError::NoMemory)?;
        let mut prev = Vec::new();
        prev.try_reserve_exact(count).map_err(|_| VmError::NoMemory)?;

        for i in 0..count {
            pages.push(Page {
                paddr: info.base + i * PAGE_SIZE,
                state: PageState::Free,
            });
            next.push(NIL);
            prev.push(NIL);
        }

        let mut arena = Self {
            info,
            pages,
            next,
            prev,
            head: NIL,
            tail: NIL,
            free_count: 0,
            window: PhysWindow::new(info.size)?,
        };

        for i in 0..count as u32 {
            arena.push_tail(i);
        }
        Ok(arena)
    }

    fn contains(&self, paddr: PAddr) -> bool {
        paddr >= self.info.base && paddr - self.info.base < self.info.size
    }

    fn overlaps(&self, base: PAddr, size: usize) -> bool {
        base < self.info.end() && self.info.base < base + size
    }

    fn index_of(&self, paddr: PAddr) -> usize {
        (paddr - self.info.base) >> PAGE_SIZE_SHIFT
    }

    fn eligible(&self, flags: PmmAllocFlags) -> bool {
        if flags.contains(PmmAllocFlags::KMAP) && !self.info.flags.contains(ArenaFlags::KMAP) {
            return false;
        }
        if flags.contains(PmmAllocFlags::LOW_MEM) && !self.info.flags.contains(ArenaFlags::LOW_MEM)
        {
            return false;
        }
        true
    }

    /// ========================================================================
    /// Free list
    /// ========================================================================

    fn push_tail(&mut self, i: u32) {
        self.prev[i as usize] = self.tail;
        self.next[i as usize] = NIL;
        if self.tail == NIL {
            self.head = i;
        } else {
            self.next[self.tail as usize] = i;
        }
        self.tail = i;
        self.free_count += 1;
    }

    fn push_head(&mut self, i: u32) {
        self.next[i as usize] = self.head;
        self.prev[i as usize] = NIL;
        if self.head == NIL {
            self.tail = i;
        } else {
            self.prev[self.head as usize] = i;
        }
        self.head = i;
        self.free_count += 1;
    }

    fn unlink(&mut self, i: u32) {
        let (p, n) = (self.prev[i as usize], self.next[i as usize]);
        if p == NIL {
            self.head = n;
        } else {
            self.next[p as usize] = n;
        }
        if n == NIL {
            self.tail = p;
        } else {
            self.prev[n as usize] = p;
        }
        self.next[i as usize] = NIL;
        self.prev[i as usize] = NIL;
        self.free_count -= 1;
    }

    /// ========================================================================
    /// Allocation
    /// ========================================================================

    fn take(&mut self, i: usize) -> PAddr {
        debug_assert!(self.pages[i].is_free());
        self.unlink(i as u32);
        self.pages[i].state = PageState::Alloc;
        self.pages[i].paddr
    }

    fn alloc_page(&mut self) -> Option<PAddr> {
        if self.head == NIL {
            return None;
        }
        let i = self.head as usize;
        Some(self.take(i))
    }

    fn release(&mut self, paddr: PAddr) -> bool {
        let i = self.index_of(paddr);
        if self.pages[i].is_free() {
            return false;
        }
        self.pages[i].state = PageState::Free;
        self.push_head(i as u32);
        true
    }

    /// Find `count` free pages starting at an address aligned to `align`
    ///
    /// On a busy page the scan resumes at the next aligned address past it.
    fn find_free_run(&self, count: usize, align: usize) -> Option<usize> {
        let total = self.pages.len();
        let mut start_pa = checked_round_up(self.info.base, align)?;
        loop {
            let start = self.index_of(start_pa);
            if start.checked_add(count)? > total {
                return None;
            }
            match (0..count).find(|j| !self.pages[start + j].is_free()) {
                None => return Some(start),
                Some(j) => {
                    let busy_pa = self.pages[start + j].paddr;
                    start_pa = checked_round_up(busy_pa.checked_add(PAGE_SIZE)?, align)?;
                }
            }
        }
    }
}

struct PmmState {
    /// Arenas in ascending priority order
    arenas: Vec<Arena>,
}

impl PmmState {
    fn arena_for(&self, paddr: PAddr) -> Option<&Arena> {
        self.arenas.iter().find(|a| a.contains(paddr))
    }

    fn arena_for_mut(&mut self, paddr: PAddr) -> Option<&mut Arena> {
        self.arenas.iter_mut().find(|a| a.contains(paddr))
    }
}

/// ============================================================================
/// Physical Memory Manager
/// ============================================================================

/// Owner of all physical memory registered at boot
pub struct PhysicalMemoryManager {
    state: Mutex<PmmState>,
    zero_page: Once<PAddr>,
}

impl Default for PhysicalMemoryManager {
    fn default() -> Self {
        Self::new()
    }
}

impl PhysicalMemoryManager {
    /// Create an empty manager with no arenas
    pub const fn new() -> Self {
        Self {
            state: Mutex::new(PmmState { arenas: Vec::new() }),
            zero_page: Once::new(),
        }
    }

    /// Add a memory arena
    ///
    /// The arena is inserted before the first arena with a strictly greater
    /// priority, so equal priorities keep their registration order.
    ///
    /// # Arguments
    ///
    /// * `info` - Arena information (base address, size, flags)
    ///
    /// # Returns
    ///
    /// `InvalidArgs` for an empty, unaligned, wrapping or overlapping arena.
    pub fn add_arena(&self, info: ArenaInfo) -> Result {
        if info.size == 0 || !is_page_aligned(info.base) || !is_page_aligned(info.size) {
            return Err(VmError::InvalidArgs);
        }
        if info.base.checked_add(info.size).is_none() {
            return Err(VmError::InvalidArgs);
        }

        let mut state = self.state.lock();
        if state.arenas.iter().any(|a| a.overlaps(info.base, info.size)) {
            return Err(VmError::InvalidArgs);
        }

        let arena = Arena::new(info)?;
        let pos = state
            .arenas
            .iter()
            .position(|a| a.info.priority > info.priority)
            .unwrap_or(state.arenas.len());
        state.arenas.insert(pos, arena);

        log::debug!(
            "pmm: arena '{}' [{:#x}, {:#x}) priority {} ({} pages)",
            info.name,
            info.base,
            info.end(),
            info.priority,
            info.page_count()
        );
        Ok(())
    }

    /// Allocate a single page
    ///
    /// Returns `None` if no eligible arena has a free page.
    pub fn alloc_page(&self, flags: PmmAllocFlags) -> Option<PAddr> {
        let mut state = self.state.lock();
        let pa = state
            .arenas
            .iter_mut()
            .filter(|a| a.eligible(flags))
            .find_map(|a| a.alloc_page());
        ltracef!("pmm: alloc_page -> {:?}", pa);
        pa
    }

    /// Allocate up to `count` pages, appending them to `list`
    ///
    /// # Returns
    ///
    /// The number of pages obtained; a short count is not an error here.
    pub fn alloc_pages(&self, count: usize, flags: PmmAllocFlags, list: &mut Vec<PAddr>) -> usize {
        if list.try_reserve(count).is_err() {
            return 0;
        }

        let mut state = self.state.lock();
        let mut allocated = 0;
        for arena in state.arenas.iter_mut().filter(|a| a.eligible(flags)) {
            while allocated < count {
                match arena.alloc_page() {
                    Some(pa) => {
                        list.push(pa);
                        allocated += 1;
                    }
                    None => break,
                }
            }
            if allocated == count {
                break;
            }
        }
        ltracef!("pmm: alloc_pages {} -> {}", count, allocated);
        allocated
    }

    /// Allocate the specific physical run `[paddr, paddr + count pages)`
    ///
    /// Stops at the first page that is not free or not covered by an arena.
    ///
    /// # Returns
    ///
    /// The number of pages obtained, all appended to `list`.
    pub fn alloc_range(&self, paddr: PAddr, count: usize, list: &mut Vec<PAddr>) -> usize {
        if !is_page_aligned(paddr) || list.try_reserve(count).is_err() {
            return 0;
        }

        let mut state = self.state.lock();
        let mut allocated = 0;
        while allocated < count {
            let pa = match paddr.checked_add(allocated * PAGE_SIZE) {
                Some(pa) => pa,
                None => break,
            };
            let arena = match state.arena_for_mut(pa) {
                Some(a) => a,
                None => break,
            };
            let i = arena.index_of(pa);
            if !arena.pages[i].is_free() {
                break;
            }
            list.push(arena.take(i));
            allocated += 1;
        }
        ltracef!("pmm: alloc_range {:#x} {} -> {}", paddr, count, allocated);
        allocated
    }

    /// Allocate `count` physically contiguous pages
    ///
    /// # Arguments
    ///
    /// * `count` - Number of pages
    /// * `flags` - Arena eligibility flags
    /// * `align_log2` - Required alignment of the first page; values below the
    ///   page shift are treated as page alignment
    /// * `list` - Receives the pages in ascending order
    ///
    /// # Returns
    ///
    /// The physical address of the first page, or `None` if no single arena
    /// holds a suitable run.
    pub fn alloc_contiguous(
        &self,
        count: usize,
        flags: PmmAllocFlags,
        align_log2: u8,
        list: &mut Vec<PAddr>,
    ) -> Option<PAddr> {
        if count == 0 || align_log2 as u32 >= usize::BITS {
            return None;
        }
        list.try_reserve(count).ok()?;
        let align = 1usize << core::cmp::max(align_log2, PAGE_SIZE_SHIFT);

        let mut state = self.state.lock();
        for arena in state.arenas.iter_mut().filter(|a| a.eligible(flags)) {
            if arena.free_count < count {
                continue;
            }
            if let Some(start) = arena.find_free_run(count, align) {
                for i in start..start + count {
                    list.push(arena.take(i));
                }
                let base = arena.pages[start].paddr;
                ltracef!("pmm: alloc_contiguous {} pages at {:#x}", count, base);
                return Some(base);
            }
        }
        log::warn!("pmm: no contiguous run of {} pages (align 2^{})", count, align_log2);
        None
    }

    /// Free every page in `list`, leaving it empty
    ///
    /// # Returns
    ///
    /// The number of pages actually returned to the free lists.
    pub fn free(&self, list: &mut Vec<PAddr>) -> usize {
        let mut state = self.state.lock();
        let mut freed = 0;
        for pa in list.drain(..) {
            if Self::free_locked(&mut state, pa) {
                freed += 1;
            }
        }
        freed
    }

    /// Free a single page
    pub fn free_page(&self, paddr: PAddr) -> bool {
        let mut state = self.state.lock();
        Self::free_locked(&mut state, paddr)
    }

    fn free_locked(state: &mut PmmState, paddr: PAddr) -> bool {
        let arena = match state.arena_for_mut(paddr) {
            Some(a) if is_page_aligned(paddr) => a,
            _ => {
                log::error!("pmm: free of unmanaged address {:#x}", paddr);
                return false;
            }
        };
        if !arena.release(paddr) {
            log::error!("pmm: double free of page {:#x}", paddr);
            return false;
        }
        true
    }

    /// ========================================================================
    /// Page state
    /// ========================================================================

    /// State of the page at `paddr`, or `None` if no arena covers it
    pub fn page_state(&self, paddr: PAddr) -> Option<PageState> {
        let state = self.state.lock();
        let arena = state.arena_for(paddr)?;
        Some(arena.pages[arena.index_of(paddr)].state)
    }

    /// Retag an allocated page
    ///
    /// Only allocated pages can be retagged and only to an allocated state;
    /// pages go back to `Free` through [`free_page`](Self::free_page).
    pub fn set_page_state(&self, paddr: PAddr, new_state: PageState) -> Result {
        if new_state == PageState::Free {
            return Err(VmError::InvalidArgs);
        }
        let mut state = self.state.lock();
        let arena = state.arena_for_mut(paddr).ok_or(VmError::NotFound)?;
        let i = arena.index_of(paddr);
        if arena.pages[i].is_free() {
            return Err(VmError::BadState);
        }
        arena.pages[i].state = new_state;
        Ok(())
    }

    /// ========================================================================
    /// Statistics
    /// ========================================================================

    /// Number of free pages across all arenas
    pub fn count_free_pages(&self) -> usize {
        self.state.lock().arenas.iter().map(|a| a.free_count).sum()
    }

    /// Number of pages across all arenas
    pub fn count_total_pages(&self) -> usize {
        self.state.lock().arenas.iter().map(|a| a.pages.len()).sum()
    }

    /// Number of bytes across all arenas
    pub fn count_total_bytes(&self) -> usize {
        self.state.lock().arenas.iter().map(|a| a.info.size).sum()
    }

    /// Number of registered arenas
    pub fn arena_count(&self) -> usize {
        self.state.lock().arenas.len()
    }

    /// Arena priorities, in list order
    pub fn arena_priorities(&self) -> Vec<u32> {
        self.state.lock().arenas.iter().map(|a| a.info.priority).collect()
    }

    /// Arena names, in list order
    pub fn arena_names(&self) -> Vec<&'static str> {
        self.state.lock().arenas.iter().map(|a| a.info.name).collect()
    }

    /// ========================================================================
    /// Physmap access
    /// ========================================================================

    /// Translate a physical address into its physmap virtual address
    pub fn paddr_to_kvaddr(&self, paddr: PAddr) -> Option<VAddr> {
        let state = self.state.lock();
        let arena = state.arena_for(paddr)?;
        Some(arena.window.base() + (paddr - arena.info.base))
    }

    fn page_ptr(&self, paddr: PAddr) -> Result<*mut u8> {
        if !is_page_aligned(paddr) {
            return Err(VmError::InvalidArgs);
        }
        let va = self.paddr_to_kvaddr(paddr).ok_or(VmError::NotFound)?;
        Ok(va as *mut u8)
    }

    /// Fill a page with zeroes
    pub fn zero_page_contents(&self, paddr: PAddr) -> Result {
        let dst = self.page_ptr(paddr)?;
        // SAFETY: dst covers one page inside an arena window.
        unsafe { core::ptr::write_bytes(dst, 0, PAGE_SIZE) };
        Ok(())
    }

    /// Copy the contents of page `src` into page `dst`
    pub fn copy_page(&self, dst: PAddr, src: PAddr) -> Result {
        if dst == src {
            return Err(VmError::InvalidArgs);
        }
        let d = self.page_ptr(dst)?;
        let s = self.page_ptr(src)?;
        // SAFETY: both pointers cover distinct pages inside arena windows.
        unsafe { core::ptr::copy_nonoverlapping(s, d, PAGE_SIZE) };
        Ok(())
    }

    /// Copy bytes out of a page, starting at `offset` within it
    pub fn read_page(&self, paddr: PAddr, offset: usize, buf: &mut [u8]) -> Result {
        if offset.checked_add(buf.len()).map_or(true, |end| end > PAGE_SIZE) {
            return Err(VmError::OutOfRange);
        }
        let src = self.page_ptr(paddr)?;
        // SAFETY: the range was checked to stay within the page.
        unsafe { core::ptr::copy_nonoverlapping(src.add(offset), buf.as_mut_ptr(), buf.len()) };
        Ok(())
    }

    /// Copy bytes into a page, starting at `offset` within it
    pub fn write_page(&self, paddr: PAddr, offset: usize, buf: &[u8]) -> Result {
        if offset.checked_add(buf.len()).map_or(true, |end| end > PAGE_SIZE) {
            return Err(VmError::OutOfRange);
        }
        let dst = self.page_ptr(paddr)?;
        // SAFETY: the range was checked to stay within the page.
        unsafe { core::ptr::copy_nonoverlapping(buf.as_ptr(), dst.add(offset), buf.len()) };
        Ok(())
    }

    /// The shared, read-only zero page
    ///
    /// Allocated and zeroed on first use, marked `Wired` and never freed.
    pub fn zero_page(&self) -> Result<PAddr> {
        self.zero_page
            .try_call_once(|| {
                let pa = self.alloc_page(PmmAllocFlags::empty()).ok_or(VmError::NoMemory)?;
                self.zero_page_contents(pa)?;
                self.set_page_state(pa, PageState::Wired)?;
                Ok(pa)
            })
            .copied()
    }

    /// Print arena usage
    pub fn dump(&self, out: &mut dyn fmt::Write) -> fmt::Result {
        let state = self.state.lock();
        for arena in state.arenas.iter() {
            writeln!(
                out,
                "arena '{}': base {:#x} size {:#x} priority {} flags {:?} free {}/{}",
                arena.info.name,
                arena.info.base,
                arena.info.size,
                arena.info.priority,
                arena.info.flags,
                arena.free_count,
                arena.pages.len()
            )?;
        }
        Ok(())
    }
}

/// ============================================================================
/// Global Instance
/// ============================================================================

static PMM: Once<Arc<PhysicalMemoryManager>> = Once::new();

/// Initialize the global PMM from the boot memory map
///
/// # Returns
///
/// `BadState` if the global PMM was already initialized.
pub fn init(arenas: &[ArenaInfo]) -> Result<Arc<PhysicalMemoryManager>> {
    if PMM.is_completed() {
        return Err(VmError::BadState);
    }
    let pmm = PhysicalMemoryManager::new();
    for info in arenas {
        pmm.add_arena(*info)?;
    }
    let mut installed = false;
    let global = PMM.call_once(|| {
        installed = true;
        Arc::new(pmm)
    });
    if !installed {
        return Err(VmError::BadState);
    }
    log::info!(
        "pmm: {} arenas, {} pages",
        global.arena_count(),
        global.count_total_pages()
    );
    Ok(global.clone())
}

/// The global PMM, if [`init`] has run
pub fn global() -> Option<Arc<PhysicalMemoryManager>> {
    PMM.get().cloned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::vec;

    const BASE: PAddr = 0x10_0000;

    fn pmm_with(pages: usize) -> PhysicalMemoryManager {
        let pmm = PhysicalMemoryManager::new();
        pmm.add_arena(ArenaInfo::new(
            "test",
            ArenaFlags::KMAP,
            0,
            BASE,
            pages * PAGE_SIZE,
        ))
        .unwrap();
        pmm
    }

    /// Walk every free list and check it against the page records
    fn check_consistency(pmm: &PhysicalMemoryManager) {
        let state = pmm.state.lock();
        for arena in state.arenas.iter() {
            let mut n = 0;
            let mut i = arena.head;
            let mut last = NIL;
            while i != NIL {
                assert!(arena.pages[i as usize].is_free());
                assert_eq!(arena.prev[i as usize], last);
                last = i;
                i = arena.next[i as usize];
                n += 1;
            }
            assert_eq!(arena.tail, last);
            assert_eq!(n, arena.free_count);
            let free = arena.pages.iter().filter(|p| p.is_free()).count();
            assert_eq!(free, arena.free_count);
        }
    }

    #[test]
    fn test_alloc_exhaust_and_free() {
        let pmm = pmm_with(16);
        let mut list = Vec::new();
        assert_eq!(pmm.alloc_pages(16, PmmAllocFlags::empty(), &mut list), 16);
        assert_eq!(pmm.alloc_page(PmmAllocFlags::empty()), None);
        assert_eq!(pmm.free(&mut list), 16);
        assert!(list.is_empty());
        assert!(pmm.alloc_page(PmmAllocFlags::empty()).is_some());
        check_consistency(&pmm);
    }

    #[test]
    fn test_fresh_arena_hands_out_ascending_pages() {
        let pmm = pmm_with(4);
        let mut list = Vec::new();
        pmm.alloc_pages(4, PmmAllocFlags::empty(), &mut list);
        assert_eq!(
            list,
            vec![BASE, BASE + PAGE_SIZE, BASE + 2 * PAGE_SIZE, BASE + 3 * PAGE_SIZE]
        );
    }

    #[test]
    fn test_free_is_lifo() {
        let pmm = pmm_with(8);
        let a = pmm.alloc_page(PmmAllocFlags::empty()).unwrap();
        let b = pmm.alloc_page(PmmAllocFlags::empty()).unwrap();
        assert!(pmm.free_page(a));
        assert!(pmm.free_page(b));
        assert_eq!(pmm.alloc_page(PmmAllocFlags::empty()), Some(b));
        assert_eq!(pmm.alloc_page(PmmAllocFlags::empty()), Some(a));
        check_consistency(&pmm);
    }

    #[test]
    fn test_double_free_is_skipped() {
        let pmm = pmm_with(2);
        let a = pmm.alloc_page(PmmAllocFlags::empty()).unwrap();
        assert!(pmm.free_page(a));
        assert!(!pmm.free_page(a));
        assert!(!pmm.free_page(0xdead_0000));
        assert_eq!(pmm.count_free_pages(), 2);
        check_consistency(&pmm);
    }

    #[test]
    fn test_arena_priority_order_is_stable() {
        let pmm = PhysicalMemoryManager::new();
        let arenas = [
            ("a", 2, 0x10_0000),
            ("b", 1, 0x20_0000),
            ("c", 2, 0x30_0000),
            ("d", 0, 0x40_0000),
            ("e", 1, 0x50_0000),
        ];
        for (name, prio, base) in arenas {
            pmm.add_arena(ArenaInfo::new(name, ArenaFlags::empty(), prio, base, PAGE_SIZE))
                .unwrap();
        }
        assert_eq!(pmm.arena_priorities(), vec![0, 1, 1, 2, 2]);
        assert_eq!(pmm.arena_names(), vec!["d", "b", "e", "a", "c"]);
    }

    #[test]
    fn test_add_arena_rejects_bad_ranges() {
        let pmm = pmm_with(4);
        let bad = [
            ArenaInfo::new("empty", ArenaFlags::empty(), 0, 0x80_0000, 0),
            ArenaInfo::new("unaligned", ArenaFlags::empty(), 0, 0x80_0010, PAGE_SIZE),
            ArenaInfo::new("overlap", ArenaFlags::empty(), 0, BASE + PAGE_SIZE, PAGE_SIZE),
            ArenaInfo::new("wrap", ArenaFlags::empty(), 0, usize::MAX - 0xfff, 2 * PAGE_SIZE),
        ];
        for info in bad {
            assert_eq!(pmm.add_arena(info), Err(VmError::InvalidArgs), "{}", info.name);
        }
        assert_eq!(pmm.arena_count(), 1);
    }

    #[test]
    fn test_kmap_flag_skips_arenas() {
        let pmm = PhysicalMemoryManager::new();
        pmm.add_arena(ArenaInfo::new("nokmap", ArenaFlags::empty(), 0, 0x10_0000, PAGE_SIZE))
            .unwrap();
        pmm.add_arena(ArenaInfo::new("kmap", ArenaFlags::KMAP, 1, 0x20_0000, PAGE_SIZE))
            .unwrap();
        assert_eq!(pmm.alloc_page(PmmAllocFlags::KMAP), Some(0x20_0000));
        assert_eq!(pmm.alloc_page(PmmAllocFlags::KMAP), None);
        assert_eq!(pmm.alloc_page(PmmAllocFlags::empty()), Some(0x10_0000));
    }

    #[test]
    fn test_alloc_pages_drains_arenas_in_order() {
        let pmm = PhysicalMemoryManager::new();
        pmm.add_arena(ArenaInfo::new("hi", ArenaFlags::empty(), 5, 0x20_0000, 2 * PAGE_SIZE))
            .unwrap();
        pmm.add_arena(ArenaInfo::new("lo", ArenaFlags::empty(), 1, 0x10_0000, 2 * PAGE_SIZE))
            .unwrap();
        let mut list = Vec::new();
        assert_eq!(pmm.alloc_pages(5, PmmAllocFlags::empty(), &mut list), 4);
        assert_eq!(list, vec![0x10_0000, 0x10_1000, 0x20_0000, 0x20_1000]);
    }

    #[test]
    fn test_alloc_range_stops_at_busy_page() {
        let pmm = pmm_with(8);
        let mut first = Vec::new();
        assert_eq!(pmm.alloc_range(BASE + 3 * PAGE_SIZE, 1, &mut first), 1);

        let mut list = Vec::new();
        assert_eq!(pmm.alloc_range(BASE + PAGE_SIZE, 4, &mut list), 2);
        assert_eq!(list, vec![BASE + PAGE_SIZE, BASE + 2 * PAGE_SIZE]);
        assert_eq!(pmm.alloc_range(BASE + 7 * PAGE_SIZE, 3, &mut list), 1);
        check_consistency(&pmm);
    }

    #[test]
    fn test_alloc_contiguous_alignment_and_restart() {
        let pmm = pmm_with(64);
        // Punch holes so the first aligned candidates fail part way.
        let mut holes = Vec::new();
        pmm.alloc_range(BASE + 2 * PAGE_SIZE, 1, &mut holes);
        pmm.alloc_range(BASE + 12 * PAGE_SIZE, 1, &mut holes);

        let mut list = Vec::new();
        let base = pmm
            .alloc_contiguous(8, PmmAllocFlags::empty(), 15, &mut list)
            .unwrap();
        // 32KB alignment: 0x100000 fails at page 2, 0x108000 fails at page 12.
        assert_eq!(base, BASE + 0x10000);
        assert_eq!(base % (1 << 15), 0);
        assert_eq!(list.len(), 8);
        for (i, pa) in list.iter().enumerate() {
            assert_eq!(*pa, base + i * PAGE_SIZE);
            assert_eq!(pmm.page_state(*pa), Some(PageState::Alloc));
        }
        check_consistency(&pmm);
    }

    #[test]
    fn test_alloc_contiguous_runs_never_overlap() {
        let pmm = pmm_with(32);
        let mut runs = Vec::new();
        loop {
            let mut list = Vec::new();
            match pmm.alloc_contiguous(3, PmmAllocFlags::empty(), 12, &mut list) {
                Some(base) => runs.push((base, list)),
                None => break,
            }
        }
        assert_eq!(runs.len(), 10);
        for (i, (a, _)) in runs.iter().enumerate() {
            for (b, _) in runs.iter().skip(i + 1) {
                assert!(a + 3 * PAGE_SIZE <= *b || b + 3 * PAGE_SIZE <= *a);
            }
        }
        assert_eq!(pmm.count_free_pages(), 2);
    }

    #[test]
    fn test_alloc_contiguous_fails_without_run() {
        let pmm = pmm_with(4);
        let mut list = Vec::new();
        assert!(pmm.alloc_contiguous(5, PmmAllocFlags::empty(), 12, &mut list).is_none());
        assert!(list.is_empty());
        assert_eq!(pmm.count_free_pages(), 4);
    }

    #[test]
    fn test_conservation_under_mixed_operations() {
        let pmm = PhysicalMemoryManager::new();
        pmm.add_arena(ArenaInfo::new("a", ArenaFlags::KMAP, 0, 0x10_0000, 24 * PAGE_SIZE))
            .unwrap();
        pmm.add_arena(ArenaInfo::new("b", ArenaFlags::empty(), 1, 0x40_0000, 40 * PAGE_SIZE))
            .unwrap();
        let total = pmm.count_total_pages();
        let mut held: Vec<Vec<PAddr>> = Vec::new();

        for round in 0..40usize {
            let mut list = Vec::new();
            match round % 4 {
                0 => {
                    pmm.alloc_pages(round % 7 + 1, PmmAllocFlags::empty(), &mut list);
                }
                1 => {
                    pmm.alloc_contiguous(round % 5 + 1, PmmAllocFlags::empty(), 13, &mut list);
                }
                2 => {
                    if let Some(pa) = pmm.alloc_page(PmmAllocFlags::KMAP) {
                        list.push(pa);
                    }
                }
                _ => {
                    if !held.is_empty() {
                        let mut victim = held.remove(round % held.len());
                        pmm.free(&mut victim);
                    }
                }
            }
            held.push(list);

            let allocated: usize = held.iter().map(|l| l.len()).sum();
            assert_eq!(pmm.count_free_pages() + allocated, total);
            check_consistency(&pmm);
        }
    }

    #[test]
    fn test_page_contents_roundtrip_through_physmap() {
        let pmm = pmm_with(4);
        let a = pmm.alloc_page(PmmAllocFlags::empty()).unwrap();
        let b = pmm.alloc_page(PmmAllocFlags::empty()).unwrap();
        pmm.write_page(a, 100, b"hello").unwrap();
        pmm.copy_page(b, a).unwrap();
        let mut buf = [0u8; 5];
        pmm.read_page(b, 100, &mut buf).unwrap();
        assert_eq!(&buf, b"hello");
        pmm.zero_page_contents(b).unwrap();
        pmm.read_page(b, 100, &mut buf).unwrap();
        assert_eq!(buf, [0; 5]);
        assert_eq!(pmm.read_page(a, PAGE_SIZE - 2, &mut buf), Err(VmError::OutOfRange));
    }

    #[test]
    fn test_zero_page_is_wired_and_shared() {
        let pmm = pmm_with(4);
        let z = pmm.zero_page().unwrap();
        assert_eq!(pmm.zero_page().unwrap(), z);
        assert_eq!(pmm.page_state(z), Some(PageState::Wired));
        assert_eq!(pmm.count_free_pages(), 3);
    }

    #[test]
    fn test_set_page_state_rules() {
        let pmm = pmm_with(2);
        let a = pmm.alloc_page(PmmAllocFlags::empty()).unwrap();
        assert_eq!(pmm.set_page_state(a, PageState::Free), Err(VmError::InvalidArgs));
        pmm.set_page_state(a, PageState::Object).unwrap();
        assert_eq!(pmm.page_state(a), Some(PageState::Object));
        assert_eq!(
            pmm.set_page_state(BASE + PAGE_SIZE, PageState::Mmu),
            Err(VmError::BadState)
        );
        assert!(pmm.free_page(a));
        assert_eq!(pmm.page_state(a), Some(PageState::Free));
    }
}
