// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Physical VM Objects
//!
//! A [`VmObjectPhysical`] describes a fixed, pre-existing physical range such
//! as device registers or a framebuffer. It owns no pages and never touches the
//! PMM: page lookups are plain arithmetic on the base address.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::fmt;

use spin::Mutex;

use super::fault::PageFaultFlags;
use super::layout::is_page_aligned;
use super::vm_mapping::VmMapping;
use super::vm_object::{
    in_range, next_object_id, offset_align_down, offset_align_up, MappingList, VmObject,
    PAGE_SIZE_U64,
};
use super::{Result, VmError};
use crate::rustux::types::PAddr;

/// Memory object over a fixed physical range
pub struct VmObjectPhysical {
    id: u64,
    name: Mutex<String>,
    base: PAddr,
    size: u64,
    mappings: Mutex<MappingList>,
}

impl VmObjectPhysical {
    /// Create an object covering `[base, base + size)`
    ///
    /// Both `base` and `size` must be page aligned.
    pub fn create(base: PAddr, size: u64) -> Result<Arc<Self>> {
        if !is_page_aligned(base) || size & (PAGE_SIZE_U64 - 1) != 0 {
            return Err(VmError::InvalidArgs);
        }
        let end = (base as u64).checked_add(size).ok_or(VmError::OutOfRange)?;
        if end > usize::MAX as u64 {
            return Err(VmError::OutOfRange);
        }
        let vmo = Arc::new(Self {
            id: next_object_id(),
            name: Mutex::new(String::new()),
            base,
            size,
            mappings: Mutex::new(MappingList::new()),
        });
        log::debug!("vmo {}: physical [{:#x}, {:#x})", vmo.id, base, end);
        Ok(vmo)
    }

    /// Physical base address
    pub fn base(&self) -> PAddr {
        self.base
    }
}

impl VmObject for VmObjectPhysical {
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
        self.size
    }

    fn is_paged(&self) -> bool {
        false
    }

    fn lookup(
        &self,
        offset: u64,
        len: u64,
        _pf_flags: PageFaultFlags,
        f: &mut dyn FnMut(u64, PAddr) -> Result,
    ) -> Result {
        if len == 0 {
            return Err(VmError::InvalidArgs);
        }
        if !in_range(self.size, offset, len) {
            return Err(VmError::OutOfRange);
        }
        let end = offset_align_up(offset + len).ok_or(VmError::OutOfRange)?;
        let mut cur = offset_align_down(offset);
        while cur < end {
            f(cur, self.base + cur as usize)?;
            cur += PAGE_SIZE_U64;
        }
        Ok(())
    }

    fn fault_page(
        &self,
        offset: u64,
        _pf_flags: PageFaultFlags,
        f: &mut dyn FnMut(PAddr) -> Result,
    ) -> Result {
        if offset >= self.size {
            return Err(VmError::OutOfRange);
        }
        f(self.base + offset_align_down(offset) as usize)
    }

    fn add_mapping(&self, mapping: Weak<VmMapping>) {
        self.mappings.lock().add(mapping);
    }

    fn remove_mapping(&self, mapping: &VmMapping) {
        self.mappings.lock().remove(mapping);
    }

    fn mapping_count(&self) -> usize {
        self.mappings.lock().len()
    }

    fn range_change_update(&self, offset: u64, len: u64) {
        self.mappings.lock().range_change_update(offset, len);
    }

    fn allocated_pages_in_range(&self, _offset: u64, _len: u64) -> usize {
        0
    }

    fn dump(&self, out: &mut dyn fmt::Write, depth: usize, _verbose: bool) -> fmt::Result {
        for _ in 0..depth {
            write!(out, "  ")?;
        }
        writeln!(
            out,
            "vmo {} '{}' physical base {:#x} size {:#x}",
            self.id,
            self.name.lock(),
            self.base,
            self.size
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pages_are_arithmetic() {
        let vmo = VmObjectPhysical::create(0xfe00_0000, 4 * PAGE_SIZE_U64).unwrap();
        assert_eq!(
            vmo.get_page(0x1234, PageFaultFlags::empty()),
            Ok(0xfe00_1000)
        );
        assert_eq!(
            vmo.get_page(4 * PAGE_SIZE_U64, PageFaultFlags::HW_FAULT),
            Err(VmError::OutOfRange)
        );
        assert_eq!(vmo.allocated_pages(), 0);
    }

    #[test]
    fn test_unsupported_operations() {
        let vmo = VmObjectPhysical::create(0x1000, PAGE_SIZE_U64).unwrap();
        assert_eq!(vmo.resize(0x2000), Err(VmError::NotSupported));
        assert_eq!(vmo.commit_range(0, 0x1000), Err(VmError::NotSupported));
        let mut buf = [0u8; 4];
        assert_eq!(vmo.read(&mut buf, 0), Err(VmError::NotSupported));
        assert!(vmo.clone().clone_cow(0, 0x1000).is_err());
    }

    #[test]
    fn test_create_validates_range() {
        assert!(VmObjectPhysical::create(0x1001, PAGE_SIZE_U64).is_err());
        assert!(VmObjectPhysical::create(0x1000, 10).is_err());
    }

    #[test]
    fn test_lookup_walks_pages() {
        let vmo = VmObjectPhysical::create(0x10_0000, 3 * PAGE_SIZE_U64).unwrap();
        let mut pages = alloc::vec::Vec::new();
        vmo.lookup(0x800, 0x1000, PageFaultFlags::empty(), &mut |off, pa| {
            pages.push((off, pa));
            Ok(())
        })
        .unwrap();
        assert_eq!(pages, alloc::vec![(0, 0x10_0000), (0x1000, 0x10_1000)]);
    }
}
