// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Virtual Memory Objects
//!
//! A VM object (VMO) is a page-indexed container of physical memory that can
//! be mapped into any number of address spaces.
//!
//! # Design
//!
//! - [`VmObject`] is the interface the region tree and syscall layers work
//!   against. It is object safe; objects are shared as [`VmObjectRef`].
//! - Operations an object kind cannot support return `NotSupported` through
//!   the default method bodies.
//! - Every object keeps a [`MappingList`] of the mappings that reference it,
//!   so invalidating a range of the object can tear down the matching
//!   translations in every address space before pages are released.
//!
//! # Locking
//!
//! An object's page state is locked before its mapping registry, and a clone's
//! page state before its parent's. Callbacks passed to
//! [`VmObject::fault_page`] and [`VmObject::lookup`] run with the page state
//! locked, so a page handed to them stays owned by the object for the whole
//! call.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, Ordering};

use super::fault::PageFaultFlags;
use super::layout::PAGE_SIZE;
use super::vm_mapping::VmMapping;
use super::{Result, VmError};
use crate::kernel::usercopy::{UserInPtr, UserOutPtr};
use crate::rustux::types::PAddr;

/// Shared handle to a VM object
pub type VmObjectRef = Arc<dyn VmObject>;

/// Page size as a 64-bit object offset
pub(crate) const PAGE_SIZE_U64: u64 = PAGE_SIZE as u64;

static NEXT_OBJECT_ID: AtomicU64 = AtomicU64::new(1);

/// Allocate a process-wide unique object id
pub(crate) fn next_object_id() -> u64 {
    NEXT_OBJECT_ID.fetch_add(1, Ordering::Relaxed)
}

/// Round an object offset down to a page boundary
#[inline]
pub(crate) const fn offset_align_down(offset: u64) -> u64 {
    offset & !(PAGE_SIZE_U64 - 1)
}

/// Round an object offset up to a page boundary, `None` on overflow
#[inline]
pub(crate) const fn offset_align_up(offset: u64) -> Option<u64> {
    match offset.checked_add(PAGE_SIZE_U64 - 1) {
        Some(v) => Some(v & !(PAGE_SIZE_U64 - 1)),
        None => None,
    }
}

/// Clip `[offset, offset + len)` to an object of `size` bytes
///
/// # Returns
///
/// The clipped length, or `OutOfRange` if `offset` lies past the end.
pub(crate) fn trim_range(size: u64, offset: u64, len: u64) -> Result<u64> {
    if offset > size {
        return Err(VmError::OutOfRange);
    }
    Ok(core::cmp::min(len, size - offset))
}

/// Check that `[offset, offset + len)` lies inside an object of `size` bytes
pub(crate) fn in_range(size: u64, offset: u64, len: u64) -> bool {
    offset <= size && size - offset >= len
}

/// ============================================================================
/// Mapping Registry
/// ============================================================================

/// Non-owning list of the mappings that reference an object
#[derive(Default)]
pub struct MappingList {
    list: Vec<Weak<VmMapping>>,
}

impl MappingList {
    /// Create an empty list
    pub const fn new() -> Self {
        Self { list: Vec::new() }
    }

    /// Register a mapping, pruning entries whose mapping is gone
    pub fn add(&mut self, mapping: Weak<VmMapping>) {
        self.list.retain(|w| w.strong_count() > 0);
        self.list.push(mapping);
    }

    /// Unregister a mapping by identity
    pub fn remove(&mut self, mapping: &VmMapping) {
        let target = mapping as *const VmMapping;
        self.list
            .retain(|w| w.strong_count() > 0 && !core::ptr::eq(w.as_ptr(), target));
    }

    /// Number of live registered mappings
    pub fn len(&self) -> usize {
        self.list.iter().filter(|w| w.strong_count() > 0).count()
    }

    /// Whether no live mapping is registered
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Remove the translations of every mapping for an object range
    pub fn range_change_update(&self, offset: u64, len: u64) {
        for mapping in self.list.iter().filter_map(Weak::upgrade) {
            if let Err(e) = mapping.unmap_vmo_range(offset, len) {
                log::error!(
                    "vmo range change: unmap of mapping '{}' failed: {}",
                    mapping.name(),
                    e
                );
            }
        }
    }
}

/// ============================================================================
/// VM Object Interface
/// ============================================================================

/// Memory object interface
pub trait VmObject: Send + Sync {
    /// Process-wide unique id
    fn id(&self) -> u64;

    /// Object name
    fn name(&self) -> String;

    /// Set the object name
    fn set_name(&self, name: &str);

    /// Current size in bytes
    fn size(&self) -> u64;

    /// Whether the object owns demand-paged memory
    fn is_paged(&self) -> bool;

    /// Change the size of the object
    fn resize(&self, _size: u64) -> Result {
        Err(VmError::NotSupported)
    }

    /// Allocate pages for `[offset, offset + len)`
    ///
    /// # Returns
    ///
    /// The number of bytes newly committed.
    fn commit_range(&self, _offset: u64, _len: u64) -> Result<u64> {
        Err(VmError::NotSupported)
    }

    /// Allocate physically contiguous pages for an uncommitted range
    fn commit_range_contiguous(&self, _offset: u64, _len: u64, _align_log2: u8) -> Result<u64> {
        Err(VmError::NotSupported)
    }

    /// Release the pages of `[offset, offset + len)`
    ///
    /// # Returns
    ///
    /// The number of bytes released.
    fn decommit_range(&self, _offset: u64, _len: u64) -> Result<u64> {
        Err(VmError::NotSupported)
    }

    /// Copy object contents into `dst`, returning the number of bytes copied
    fn read(&self, _dst: &mut [u8], _offset: u64) -> Result<usize> {
        Err(VmError::NotSupported)
    }

    /// Copy `src` into the object, returning the number of bytes copied
    fn write(&self, _src: &[u8], _offset: u64) -> Result<usize> {
        Err(VmError::NotSupported)
    }

    /// Copy object contents out to a user buffer
    fn read_user(&self, _dst: UserOutPtr<u8>, _offset: u64, _len: usize) -> Result<usize> {
        Err(VmError::NotSupported)
    }

    /// Copy a user buffer into the object
    fn write_user(&self, _src: UserInPtr<u8>, _offset: u64, _len: usize) -> Result<usize> {
        Err(VmError::NotSupported)
    }

    /// Report the physical page behind every page of a range
    ///
    /// `f` receives the page-aligned object offset and physical address of
    /// each page. Absent pages fail the whole call unless `pf_flags` allows
    /// allocation.
    fn lookup(
        &self,
        offset: u64,
        len: u64,
        pf_flags: PageFaultFlags,
        f: &mut dyn FnMut(u64, PAddr) -> Result,
    ) -> Result;

    /// Write the physical address of each page of a range to a user array
    fn lookup_user(&self, offset: u64, len: u64, buffer: UserOutPtr<PAddr>) -> Result {
        let pages = offset_align_up(offset.checked_add(len).ok_or(VmError::OutOfRange)?)
            .ok_or(VmError::OutOfRange)?
            .saturating_sub(offset_align_down(offset))
            / PAGE_SIZE_U64;
        buffer.validate(pages as usize)?;
        let mut index = 0usize;
        self.lookup(offset, len, PageFaultFlags::empty(), &mut |_, pa| {
            buffer
                .byte_add(index * core::mem::size_of::<PAddr>())?
                .write(pa)?;
            index += 1;
            Ok(())
        })
    }

    /// Create a copy-on-write clone of `[offset, offset + size)`
    fn clone_cow(self: Arc<Self>, _offset: u64, _size: u64) -> Result<VmObjectRef> {
        Err(VmError::NotSupported)
    }

    /// Supply the page at `offset` to `f`
    ///
    /// With [`PageFaultFlags::FAULT_MASK`] bits set the object may allocate,
    /// zero or copy a page; without them an absent page is `NotFound`.
    fn fault_page(
        &self,
        offset: u64,
        pf_flags: PageFaultFlags,
        f: &mut dyn FnMut(PAddr) -> Result,
    ) -> Result;

    /// Physical address of the page at `offset`
    fn get_page(&self, offset: u64, pf_flags: PageFaultFlags) -> Result<PAddr> {
        let mut found = 0;
        self.fault_page(offset, pf_flags, &mut |pa| {
            found = pa;
            Ok(())
        })?;
        Ok(found)
    }

    /// Register a mapping that references this object
    fn add_mapping(&self, mapping: Weak<VmMapping>);

    /// Unregister a mapping
    fn remove_mapping(&self, mapping: &VmMapping);

    /// Number of registered mappings
    fn mapping_count(&self) -> usize;

    /// Invalidate every translation of `[offset, offset + len)`
    fn range_change_update(&self, offset: u64, len: u64);

    /// Number of pages owned by the object in a range
    fn allocated_pages_in_range(&self, offset: u64, len: u64) -> usize;

    /// Number of pages owned by the object
    fn allocated_pages(&self) -> usize {
        self.allocated_pages_in_range(0, self.size())
    }

    /// Print the object
    fn dump(&self, out: &mut dyn fmt::Write, depth: usize, verbose: bool) -> fmt::Result;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_trim_range() {
        assert_eq!(trim_range(0x3000, 0x1000, 0x1000), Ok(0x1000));
        assert_eq!(trim_range(0x3000, 0x2000, 0x4000), Ok(0x1000));
        assert_eq!(trim_range(0x3000, 0x3000, 0x10), Ok(0));
        assert_eq!(trim_range(0x3000, 0x3001, 0x10), Err(VmError::OutOfRange));
    }

    #[test]
    fn test_offset_rounding() {
        assert_eq!(offset_align_down(0x1fff), 0x1000);
        assert_eq!(offset_align_up(0x1001), Some(0x2000));
        assert_eq!(offset_align_up(u64::MAX), None);
        assert!(in_range(0x2000, 0x1000, 0x1000));
        assert!(!in_range(0x2000, 0x1000, 0x1001));
        assert!(!in_range(0x2000, 0x3000, 0));
    }

    #[test]
    fn test_object_ids_are_unique() {
        assert_ne!(next_object_id(), next_object_id());
    }
}
