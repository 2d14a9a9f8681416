// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Paged VM Objects
//!
//! A [`VmObjectPaged`] owns a sparse set of physical pages, indexed by page
//! number, and allocates them lazily from the PMM.
//!
//! # Design
//!
//! - **Lazy allocation**: a page is allocated on the first write fault, or by
//!   an explicit commit. Read faults on never-written offsets are served by
//!   the shared zero page.
//! - **Copy-on-write clones**: a clone keeps its parent alive and starts with
//!   no pages of its own. Reads fall through to the parent's page; the first
//!   write copies it into the clone.
//! - **Invalidation before release**: shrinking or decommitting first removes
//!   every translation of the range (through the mapping registry and every
//!   clone), then returns pages to the PMM.
//!
//! # Locking
//!
//! `state` guards the size and the page map. `registry` guards the mappings
//! and clones that must hear about range changes. The page state of a clone is
//! locked before its parent's; registries are locked parent first.

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;

use spin::Mutex;

use super::fault::PageFaultFlags;
use super::layout::{PAGE_SIZE, PAGE_SIZE_SHIFT};
use super::pmm::{PageState, PhysicalMemoryManager, PmmAllocFlags};
use super::stats;
use super::vm_mapping::VmMapping;
use super::vm_object::{
    in_range, next_object_id, offset_align_down, offset_align_up, trim_range, MappingList,
    VmObject, VmObjectRef, PAGE_SIZE_U64,
};
use super::{Result, VmError};
use crate::kernel::usercopy::{UserInPtr, UserOutPtr};
use crate::rustux::types::PAddr;

/// Largest supported object size, keeping page index arithmetic in range
pub const MAX_SIZE: u64 = u64::MAX & !(2 * PAGE_SIZE_U64 - 1);

struct PagedState {
    /// Size in bytes, always page aligned
    size: u64,

    /// Owned pages, by page index
    pages: BTreeMap<u64, PAddr>,
}

struct Registry {
    mappings: MappingList,
    children: Vec<Weak<VmObjectPaged>>,
}

/// Demand-paged, resizable, clonable memory object
pub struct VmObjectPaged {
    id: u64,
    name: Mutex<String>,
    pmm: Arc<PhysicalMemoryManager>,
    pmm_alloc_flags: PmmAllocFlags,
    parent: Option<Arc<VmObjectPaged>>,
    parent_offset: u64,
    state: Mutex<PagedState>,
    registry: Mutex<Registry>,
}

fn page_index(offset: u64) -> u64 {
    offset >> PAGE_SIZE_SHIFT
}

impl VmObjectPaged {
    fn new_internal(
        pmm: Arc<PhysicalMemoryManager>,
        pmm_alloc_flags: PmmAllocFlags,
        size: u64,
        parent: Option<Arc<VmObjectPaged>>,
        parent_offset: u64,
    ) -> Self {
        Self {
            id: next_object_id(),
            name: Mutex::new(String::new()),
            pmm,
            pmm_alloc_flags,
            parent,
            parent_offset,
            state: Mutex::new(PagedState {
                size,
                pages: BTreeMap::new(),
            }),
            registry: Mutex::new(Registry {
                mappings: MappingList::new(),
                children: Vec::new(),
            }),
        }
    }

    fn round_size(size: u64) -> Result<u64> {
        if size > MAX_SIZE {
            return Err(VmError::OutOfRange);
        }
        offset_align_up(size).ok_or(VmError::OutOfRange)
    }

    /// Create a new paged object
    ///
    /// # Arguments
    ///
    /// * `pmm` - Allocator the object takes its pages from
    /// * `pmm_alloc_flags` - Flags for every page allocation
    /// * `size` - Size in bytes, rounded up to a page
    ///
    /// # Returns
    ///
    /// `OutOfRange` if the size exceeds [`MAX_SIZE`].
    pub fn create(
        pmm: Arc<PhysicalMemoryManager>,
        pmm_alloc_flags: PmmAllocFlags,
        size: u64,
    ) -> Result<Arc<Self>> {
        let size = Self::round_size(size)?;
        let vmo = Arc::new(Self::new_internal(pmm, pmm_alloc_flags, size, None, 0));
        log::debug!("vmo {}: created, size {:#x}", vmo.id, size);
        Ok(vmo)
    }

    /// Create an object holding a copy of `data`
    pub fn create_from_ro_data(pmm: Arc<PhysicalMemoryManager>, data: &[u8]) -> Result<Arc<Self>> {
        let vmo = Self::create(pmm, PmmAllocFlags::empty(), data.len() as u64)?;
        if !data.is_empty() {
            vmo.commit_range(0, data.len() as u64)?;
            vmo.write(data, 0)?;
        }
        Ok(vmo)
    }

    /// Parent of a copy-on-write clone
    pub fn parent(&self) -> Option<&Arc<VmObjectPaged>> {
        self.parent.as_ref()
    }

    /// Offset of this clone within its parent
    pub fn parent_offset(&self) -> u64 {
        self.parent_offset
    }

    /// Number of live clones
    pub fn child_count(&self) -> usize {
        self.registry
            .lock()
            .children
            .iter()
            .filter(|c| c.strong_count() > 0)
            .count()
    }

    /// Allocate one zeroed page owned by this object
    fn alloc_object_page(&self) -> Result<PAddr> {
        let pa = match self.pmm.alloc_page(self.pmm_alloc_flags) {
            Some(pa) => pa,
            None => {
                log::warn!("vmo {}: out of physical pages", self.id);
                return Err(VmError::NoMemory);
            }
        };
        let prepared = self
            .pmm
            .zero_page_contents(pa)
            .and_then(|_| self.pmm.set_page_state(pa, PageState::Object));
        if let Err(e) = prepared {
            self.pmm.free_page(pa);
            return Err(e);
        }
        Ok(pa)
    }

    /// Look the page up in the parent chain without allocating
    ///
    /// `f` runs with the parent locked. Returns `Ok(false)` when no ancestor
    /// has a page at the offset (or the offset lies past the parent).
    fn fault_from_parent(
        &self,
        offset: u64,
        pf_flags: PageFaultFlags,
        f: &mut dyn FnMut(PAddr) -> Result,
    ) -> Result<bool> {
        let parent = match &self.parent {
            Some(p) => p,
            None => return Ok(false),
        };
        let parent_offset = self
            .parent_offset
            .checked_add(offset)
            .ok_or(VmError::OutOfRange)?;

        // Ancestors are only ever read; a write is resolved by copying here.
        let parent_flags = pf_flags - PageFaultFlags::FAULT_MASK - PageFaultFlags::WRITE;
        let mut hit = false;
        let r = parent.fault_page(parent_offset, parent_flags, &mut |pa| {
            hit = true;
            f(pa)
        });
        match r {
            Ok(()) => Ok(true),
            Err(e) if hit => Err(e),
            Err(VmError::NotFound) | Err(VmError::OutOfRange) => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn fault_page_locked(
        &self,
        state: &mut PagedState,
        offset: u64,
        pf_flags: PageFaultFlags,
        f: &mut dyn FnMut(PAddr) -> Result,
    ) -> Result {
        if offset >= state.size {
            return Err(VmError::OutOfRange);
        }
        let offset = offset_align_down(offset);
        let index = page_index(offset);

        if let Some(&pa) = state.pages.get(&index) {
            ltracef!("vmo {}: offset {:#x} resident at {:#x}", self.id, offset, pa);
            return f(pa);
        }

        if pf_flags.is_write() && pf_flags.may_allocate() {
            // Copy the ancestor's page, if any, into a private page.
            let mut copied = None;
            let found = self.fault_from_parent(offset, pf_flags, &mut |parent_pa| {
                let pa = self.alloc_object_page()?;
                if let Err(e) = self.pmm.copy_page(pa, parent_pa) {
                    self.pmm.free_page(pa);
                    return Err(e);
                }
                copied = Some(pa);
                Ok(())
            })?;
            if found {
                if let Some(pa) = copied {
                    state.pages.insert(index, pa);
                    // Translations of the ancestor's page must go.
                    self.range_change_update_locked(offset, PAGE_SIZE_U64);
                    stats::record_cow_fault();
                    stats::record_pages_committed(1);
                    ltracef!("vmo {}: cow copy at offset {:#x} -> {:#x}", self.id, offset, pa);
                    return f(pa);
                }
            }
        } else if self.fault_from_parent(offset, pf_flags, f)? {
            return Ok(());
        }

        if !pf_flags.may_allocate() {
            return Err(VmError::NotFound);
        }

        if !pf_flags.is_write() {
            let zero = self.pmm.zero_page()?;
            stats::record_zero_page_fault();
            return f(zero);
        }

        let pa = self.alloc_object_page()?;
        state.pages.insert(index, pa);
        self.range_change_update_locked(offset, PAGE_SIZE_U64);
        stats::record_pages_committed(1);
        ltracef!("vmo {}: new page at offset {:#x} -> {:#x}", self.id, offset, pa);
        f(pa)
    }

    /// Tell mappings and clones that `[offset, offset + len)` changed
    ///
    /// Called with `state` locked.
    fn range_change_update_locked(&self, offset: u64, len: u64) {
        if len == 0 {
            return;
        }
        let registry = self.registry.lock();
        registry.mappings.range_change_update(offset, len);

        let end = offset.saturating_add(len);
        for child in registry.children.iter().filter_map(Weak::upgrade) {
            let po = child.parent_offset;
            if end <= po {
                continue;
            }
            let start = offset.saturating_sub(po);
            child.range_change_update(start, end - po - start);
        }
    }

    /// Remove and return the pages with index in `[start, end)`
    fn take_pages(state: &mut PagedState, start: u64, end: u64) -> Vec<PAddr> {
        let doomed: Vec<u64> = state
            .pages
            .range(start..end)
            .map(|(index, _)| *index)
            .collect();
        doomed
            .iter()
            .filter_map(|index| state.pages.remove(index))
            .collect()
    }

    fn release_pages(&self, mut pages: Vec<PAddr>) {
        let count = pages.len();
        if count == 0 {
            return;
        }
        self.pmm.free(&mut pages);
        stats::record_pages_decommitted(count);
    }

    /// Page-by-page copy loop shared by the read and write paths
    ///
    /// `copy` receives the physical page, the offset within it, the offset
    /// within the caller's buffer and the chunk length.
    fn copy_loop(
        &self,
        offset: u64,
        len: usize,
        pf_flags: PageFaultFlags,
        copy: &mut dyn FnMut(PAddr, usize, usize, usize) -> Result,
    ) -> Result<usize> {
        let mut state = self.state.lock();
        let len = trim_range(state.size, offset, len as u64)? as usize;

        let mut done = 0usize;
        while done < len {
            let cur = offset + done as u64;
            let page_offset = (cur & (PAGE_SIZE_U64 - 1)) as usize;
            let chunk = core::cmp::min(PAGE_SIZE - page_offset, len - done);
            self.fault_page_locked(&mut state, cur, pf_flags, &mut |pa| {
                copy(pa, page_offset, done, chunk)
            })?;
            done += chunk;
        }
        Ok(len)
    }
}

impl VmObject for VmObjectPaged {
    fn id(&self) -> u64 {
        self.id
    }

    fn name(&self) -> String {
        self.name.lock().clone()
    }

    fn set_name(&self, name: &str) {
        *self.name.lock() = String::from(name);
    }

    fn size(&self) -> u64 {
        self.state.lock().size
    }

    fn is_paged(&self) -> bool {
        true
    }

    fn resize(&self, size: u64) -> Result {
        let new_size = Self::round_size(size)?;
        let mut state = self.state.lock();
        let old_size = state.size;

        if new_size < old_size {
            // Translations go before the pages do.
            self.range_change_update_locked(new_size, old_size - new_size);
            let pages = Self::take_pages(&mut state, page_index(new_size), page_index(old_size));
            self.release_pages(pages);
        } else if new_size > old_size {
            self.range_change_update_locked(old_size, new_size - old_size);
        }

        state.size = new_size;
        ltracef!("vmo {}: resized {:#x} -> {:#x}", self.id, old_size, new_size);
        Ok(())
    }

    fn commit_range(&self, offset: u64, len: u64) -> Result<u64> {
        let mut state = self.state.lock();
        let len = trim_range(state.size, offset, len)?;
        if len == 0 {
            return Ok(0);
        }
        let start = offset_align_down(offset);
        let end = offset_align_up(offset + len).ok_or(VmError::OutOfRange)?;

        let missing: Vec<u64> = (page_index(start)..page_index(end))
            .filter(|index| !state.pages.contains_key(index))
            .collect();
        if missing.is_empty() {
            return Ok(0);
        }

        let mut list = Vec::new();
        let got = self
            .pmm
            .alloc_pages(missing.len(), self.pmm_alloc_flags, &mut list);
        if got < missing.len() {
            log::warn!(
                "vmo {}: commit wanted {} pages, got {}",
                self.id,
                missing.len(),
                got
            );
            self.pmm.free(&mut list);
            return Err(VmError::NoMemory);
        }

        // Fill every page before any is inserted, so a failure leaves the
        // object untouched.
        for (index, pa) in missing.iter().zip(list.iter()) {
            let mut filled = false;
            let prepared = self
                .fault_from_parent(index << PAGE_SIZE_SHIFT, PageFaultFlags::empty(), &mut |ppa| {
                    filled = true;
                    self.pmm.copy_page(*pa, ppa)
                })
                .and_then(|_| {
                    if filled {
                        Ok(())
                    } else {
                        self.pmm.zero_page_contents(*pa)
                    }
                })
                .and_then(|_| self.pmm.set_page_state(*pa, PageState::Object));
            if let Err(e) = prepared {
                self.pmm.free(&mut list);
                return Err(e);
            }
        }

        for (index, pa) in missing.iter().zip(list.iter()) {
            state.pages.insert(*index, *pa);
        }
        // Zero page and ancestor translations over the range are stale now.
        self.range_change_update_locked(start, end - start);
        stats::record_pages_committed(missing.len());
        ltracef!("vmo {}: committed {} pages", self.id, missing.len());
        Ok(missing.len() as u64 * PAGE_SIZE_U64)
    }

    fn commit_range_contiguous(&self, offset: u64, len: u64, align_log2: u8) -> Result<u64> {
        if self.parent.is_some() {
            return Err(VmError::NotSupported);
        }
        let mut state = self.state.lock();
        let len = trim_range(state.size, offset, len)?;
        if len == 0 {
            return Ok(0);
        }
        let start = offset_align_down(offset);
        let end = offset_align_up(offset + len).ok_or(VmError::OutOfRange)?;
        if state
            .pages
            .range(page_index(start)..page_index(end))
            .next()
            .is_some()
        {
            return Err(VmError::BadState);
        }

        let count = page_index(end - start) as usize;
        let mut list = Vec::new();
        if self
            .pmm
            .alloc_contiguous(count, self.pmm_alloc_flags, align_log2, &mut list)
            .is_none()
        {
            log::warn!("vmo {}: no contiguous run of {} pages", self.id, count);
            return Err(VmError::NoMemory);
        }

        for pa in list.iter() {
            let prepared = self
                .pmm
                .zero_page_contents(*pa)
                .and_then(|_| self.pmm.set_page_state(*pa, PageState::Object));
            if let Err(e) = prepared {
                self.pmm.free(&mut list);
                return Err(e);
            }
        }
        for (i, pa) in list.iter().enumerate() {
            state.pages.insert(page_index(start) + i as u64, *pa);
        }
        self.range_change_update_locked(start, end - start);
        stats::record_pages_committed(count);
        Ok(count as u64 * PAGE_SIZE_U64)
    }

    /// Return the committed pages of `[offset, offset + len)` to the PMM
    ///
    /// Clones fail with `NotSupported` and keep their pages: a decommitted
    /// clone page would read through to the parent's page again, not zeroes.
    fn decommit_range(&self, offset: u64, len: u64) -> Result<u64> {
        if self.parent.is_some() {
            return Err(VmError::NotSupported);
        }
        let mut state = self.state.lock();
        let len = trim_range(state.size, offset, len)?;
        if len == 0 {
            return Ok(0);
        }
        let start = offset_align_down(offset);
        let end = offset_align_up(offset + len).ok_or(VmError::OutOfRange)?;

        self.range_change_update_locked(start, end - start);
        let pages = Self::take_pages(&mut state, page_index(start), page_index(end));
        let bytes = pages.len() as u64 * PAGE_SIZE_U64;
        self.release_pages(pages);
        Ok(bytes)
    }

    fn read(&self, dst: &mut [u8], offset: u64) -> Result<usize> {
        let pmm = &self.pmm;
        self.copy_loop(
            offset,
            dst.len(),
            PageFaultFlags::SW_FAULT,
            &mut |pa, page_offset, at, chunk| pmm.read_page(pa, page_offset, &mut dst[at..at + chunk]),
        )
    }

    fn write(&self, src: &[u8], offset: u64) -> Result<usize> {
        let pmm = &self.pmm;
        self.copy_loop(
            offset,
            src.len(),
            PageFaultFlags::SW_FAULT | PageFaultFlags::WRITE,
            &mut |pa, page_offset, at, chunk| pmm.write_page(pa, page_offset, &src[at..at + chunk]),
        )
    }

    fn read_user(&self, dst: UserOutPtr<u8>, offset: u64, len: usize) -> Result<usize> {
        dst.validate(len)?;
        let pmm = &self.pmm;
        let mut bounce = [0u8; PAGE_SIZE];
        self.copy_loop(
            offset,
            len,
            PageFaultFlags::SW_FAULT,
            &mut |pa, page_offset, at, chunk| {
                pmm.read_page(pa, page_offset, &mut bounce[..chunk])?;
                dst.byte_add(at)?.copy_array_to_user(&bounce[..chunk])
            },
        )
    }

    fn write_user(&self, src: UserInPtr<u8>, offset: u64, len: usize) -> Result<usize> {
        src.validate(len)?;
        let pmm = &self.pmm;
        let mut bounce = [0u8; PAGE_SIZE];
        self.copy_loop(
            offset,
            len,
            PageFaultFlags::SW_FAULT | PageFaultFlags::WRITE,
            &mut |pa, page_offset, at, chunk| {
                src.byte_add(at)?.copy_array_from_user(&mut bounce[..chunk])?;
                pmm.write_page(pa, page_offset, &bounce[..chunk])
            },
        )
    }

    fn lookup(
        &self,
        offset: u64,
        len: u64,
        pf_flags: PageFaultFlags,
        f: &mut dyn FnMut(u64, PAddr) -> Result,
    ) -> Result {
        if len == 0 {
            return Err(VmError::InvalidArgs);
        }
        let mut state = self.state.lock();
        if !in_range(state.size, offset, len) {
            return Err(VmError::OutOfRange);
        }
        let start = offset_align_down(offset);
        let end = offset_align_up(offset + len).ok_or(VmError::OutOfRange)?;

        let mut cur = start;
        while cur < end {
            self.fault_page_locked(&mut state, cur, pf_flags, &mut |pa| f(cur, pa))?;
            cur += PAGE_SIZE_U64;
        }
        Ok(())
    }

    fn clone_cow(self: Arc<Self>, offset: u64, size: u64) -> Result<VmObjectRef> {
        let size = Self::round_size(size)?;
        if offset & (PAGE_SIZE_U64 - 1) != 0 {
            return Err(VmError::InvalidArgs);
        }
        offset.checked_add(size).ok_or(VmError::OutOfRange)?;

        let pmm = self.pmm.clone();
        let flags = self.pmm_alloc_flags;
        let parent = self.clone();
        let clone = Arc::new(Self::new_internal(pmm, flags, size, Some(parent), offset));

        let mut registry = self.registry.lock();
        registry.children.retain(|c| c.strong_count() > 0);
        registry.children.push(Arc::downgrade(&clone));
        drop(registry);

        log::debug!(
            "vmo {}: cow clone of vmo {} at {:#x}, size {:#x}",
            clone.id,
            self.id,
            offset,
            size
        );
        Ok(clone)
    }

    fn fault_page(
        &self,
        offset: u64,
        pf_flags: PageFaultFlags,
        f: &mut dyn FnMut(PAddr) -> Result,
    ) -> Result {
        let mut state = self.state.lock();
        self.fault_page_locked(&mut state, offset, pf_flags, f)
    }

    fn add_mapping(&self, mapping: Weak<VmMapping>) {
        self.registry.lock().mappings.add(mapping);
    }

    fn remove_mapping(&self, mapping: &VmMapping) {
        self.registry.lock().mappings.remove(mapping);
    }

    fn mapping_count(&self) -> usize {
        self.registry.lock().mappings.len()
    }

    fn range_change_update(&self, offset: u64, len: u64) {
        self.range_change_update_locked(offset, len);
    }

    fn allocated_pages_in_range(&self, offset: u64, len: u64) -> usize {
        let state = self.state.lock();
        let len = match trim_range(state.size, offset, len) {
            Ok(len) if len > 0 => len,
            _ => return 0,
        };
        let start = page_index(offset_align_down(offset));
        let end = match offset_align_up(offset + len) {
            Some(end) => page_index(end),
            None => return 0,
        };
        state.pages.range(start..end).count()
    }

    fn dump(&self, out: &mut dyn fmt::Write, depth: usize, verbose: bool) -> fmt::Result {
        let state = self.state.lock();
        for _ in 0..depth {
            write!(out, "  ")?;
        }
        write!(
            out,
            "vmo {} '{}' paged size {:#x} pages {}",
            self.id,
            self.name.lock(),
            state.size,
            state.pages.len()
        )?;
        if let Some(parent) = &self.parent {
            write!(out, " parent {} offset {:#x}", parent.id, self.parent_offset)?;
        }
        writeln!(out)?;
        if verbose {
            for (index, pa) in state.pages.iter() {
                for _ in 0..depth + 1 {
                    write!(out, "  ")?;
                }
                writeln!(out, "offset {:#x} -> {:#x}", index << PAGE_SIZE_SHIFT, pa)?;
            }
        }
        Ok(())
    }
}

impl Drop for VmObjectPaged {
    fn drop(&mut self) {
        let pages: Vec<PAddr> = core::mem::take(&mut self.state.get_mut().pages)
            .into_values()
            .collect();
        ltracef!("vmo {}: destroyed, freeing {} pages", self.id, pages.len());
        self.release_pages(pages);
    }
}
