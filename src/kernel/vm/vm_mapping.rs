// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! VMO Mappings
//!
//! A [`VmMapping`] is a leaf of the region tree. It binds a page-aligned
//! virtual range to a range of a [`VmObject`] with fixed MMU flags, and is
//! where page faults are resolved into translations.
//!
//! # Design
//!
//! - Unmapping or re-protecting part of a mapping trims it or splits it into
//!   several mappings of the same object. New pieces register with the object
//!   before the original shrinks, so an object-side invalidation never misses
//!   a translation.
//! - Read faults install translations without write permission. A later
//!   write fault upgrades them once the object has supplied a private page.
//! - The state lock is never held across a call into the object. The object
//!   calls back into [`VmMapping::unmap_vmo_range`] with its own locks held.

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use core::fmt;

use spin::Mutex;

use super::arch_vm_aspace::{ArchMmuFlags, ArchVmAspace};
use super::aspace::{AspaceLocked, VmAspace};
use super::fault::PageFaultFlags;
use super::layout::*;
use super::vm_address_region::{
    next_region_id, LifeCycle, VmAddressRegion, VmAddressRegionOrMapping, VmarFlags,
};
use super::vm_object::{offset_align_down, offset_align_up, VmObjectRef, PAGE_SIZE_U64};
use super::{Result, VmError};
use crate::rustux::types::PAddr;

struct MappingState {
    life: LifeCycle,
    base: VAddr,
    size: usize,
    object_offset: u64,
    arch_mmu_flags: ArchMmuFlags,
    vmo: Option<VmObjectRef>,
}

/// Geometry and object of a live mapping, copied out of the state lock
struct Snapshot {
    base: VAddr,
    size: usize,
    object_offset: u64,
    arch_mmu_flags: ArchMmuFlags,
    vmo: VmObjectRef,
}

impl Snapshot {
    fn last(&self) -> VAddr {
        self.base + (self.size - 1)
    }
}

/// Mapping of a VM object range into an aspace
pub struct VmMapping {
    id: u64,
    aspace: Arc<VmAspace>,
    parent: Weak<VmAddressRegion>,
    flags: VmarFlags,
    name: String,
    state: Mutex<MappingState>,
}

/// Install the translation of one page
///
/// An existing translation of the same page is re-protected if it lacks
/// `flags`. A read-only translation of another page is replaced on a write
/// fault; any other conflict means a stale translation and fails.
fn install_page(
    arch: &dyn ArchVmAspace,
    va: VAddr,
    pa: PAddr,
    flags: ArchMmuFlags,
    write: bool,
) -> Result {
    match arch.query(va) {
        Ok((cur_pa, cur_flags)) if cur_pa == pa => {
            if !cur_flags.contains(flags) {
                arch.protect(va, 1, flags)?;
            }
            Ok(())
        }
        Ok((cur_pa, cur_flags)) => {
            if write && !cur_flags.contains(ArchMmuFlags::PERM_WRITE) {
                arch.unmap(va, 1)?;
                arch.map(va, pa, 1, flags)?;
                return Ok(());
            }
            log::error!(
                "va {:#x} maps {:#x}, object supplied {:#x}",
                va,
                cur_pa,
                pa
            );
            debug_assert!(false, "conflicting translation at {:#x}", va);
            Err(VmError::NotSupported)
        }
        Err(VmError::NotFound) => arch.map(va, pa, 1, flags).map(|_| ()),
        Err(e) => Err(e),
    }
}

impl VmMapping {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        aspace: Arc<VmAspace>,
        parent: &Arc<VmAddressRegion>,
        base: VAddr,
        size: usize,
        flags: VmarFlags,
        vmo: VmObjectRef,
        object_offset: u64,
        arch_mmu_flags: ArchMmuFlags,
        name: &str,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: next_region_id(),
            aspace,
            parent: Arc::downgrade(parent),
            flags,
            name: String::from(name),
            state: Mutex::new(MappingState {
                life: LifeCycle::NotReady,
                base,
                size,
                object_offset,
                arch_mmu_flags,
                vmo: Some(vmo),
            }),
        })
    }

    /// A new piece of this mapping over `[base, base + size)`
    fn split_piece(
        &self,
        base: VAddr,
        size: usize,
        object_offset: u64,
        arch_mmu_flags: ArchMmuFlags,
        vmo: &VmObjectRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: next_region_id(),
            aspace: self.aspace.clone(),
            parent: self.parent.clone(),
            flags: self.flags,
            name: self.name.clone(),
            state: Mutex::new(MappingState {
                life: LifeCycle::NotReady,
                base,
                size,
                object_offset,
                arch_mmu_flags,
                vmo: Some(vmo.clone()),
            }),
        })
    }

    /// Unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name given at creation
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Capability flags
    pub fn flags(&self) -> VmarFlags {
        self.flags
    }

    /// Base address
    pub fn base(&self) -> VAddr {
        self.state.lock().base
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.state.lock().size
    }

    /// Offset of the mapping within its object
    pub fn object_offset(&self) -> u64 {
        self.state.lock().object_offset
    }

    /// MMU flags of the translations
    pub fn arch_mmu_flags(&self) -> ArchMmuFlags {
        self.state.lock().arch_mmu_flags
    }

    /// Mapped object, `None` once destroyed
    pub fn vmo(&self) -> Option<VmObjectRef> {
        self.state.lock().vmo.clone()
    }

    /// Owning aspace
    pub fn aspace(&self) -> &Arc<VmAspace> {
        &self.aspace
    }

    /// Region containing the mapping
    pub fn parent(&self) -> Option<Arc<VmAddressRegion>> {
        self.parent.upgrade()
    }

    /// Whether the mapping is live in the tree
    pub fn is_alive(&self) -> bool {
        self.state.lock().life == LifeCycle::Alive
    }

    /// Whether this mapping's capabilities allow `flags`
    pub fn is_valid_mapping_flags(&self, flags: ArchMmuFlags) -> bool {
        self.flags.allows(flags)
    }

    fn check_locked(&self, locked: &AspaceLocked) {
        debug_assert_eq!(locked.aspace_id, self.aspace.id());
    }

    fn snapshot(&self) -> Result<Snapshot> {
        let state = self.state.lock();
        if state.life != LifeCycle::Alive {
            return Err(VmError::BadState);
        }
        let vmo = state.vmo.clone().ok_or(VmError::BadState)?;
        Ok(Snapshot {
            base: state.base,
            size: state.size,
            object_offset: state.object_offset,
            arch_mmu_flags: state.arch_mmu_flags,
            vmo,
        })
    }

    /// ========================================================================
    /// Activation
    /// ========================================================================

    /// Register with the mapped object
    fn register(self: &Arc<Self>) {
        if let Some(vmo) = self.vmo() {
            vmo.add_mapping(Arc::downgrade(self));
        }
    }

    /// Enter the parent's child map and go live
    fn attach(self: &Arc<Self>) {
        let base = {
            let mut state = self.state.lock();
            state.life = LifeCycle::Alive;
            state.base
        };
        if let Some(parent) = self.parent.upgrade() {
            parent.insert_child(base, VmAddressRegionOrMapping::Mapping(self.clone()));
        }
    }

    /// Make a newly created mapping visible to its object and parent
    pub(crate) fn activate_locked(self: &Arc<Self>, locked: &mut AspaceLocked) {
        self.check_locked(locked);
        self.register();
        self.attach();
    }

    fn unregister(&self, vmo: &VmObjectRef) {
        vmo.remove_mapping(self);
    }

    /// ========================================================================
    /// Object Callbacks
    /// ========================================================================

    /// Remove the translations backed by `[offset, offset + len)` of the object
    ///
    /// Called by the object with its locks held.
    pub fn unmap_vmo_range(&self, offset: u64, len: u64) -> Result {
        let state = self.state.lock();
        if state.life == LifeCycle::Dead || len == 0 {
            return Ok(());
        }
        let map_start = state.object_offset;
        let map_end = map_start.saturating_add(state.size as u64);
        let start = core::cmp::max(offset, map_start);
        let end = core::cmp::min(offset.saturating_add(len), map_end);
        if start >= end {
            return Ok(());
        }
        let start = offset_align_down(start);
        let end = offset_align_up(end).unwrap_or(map_end);

        let va = state.base + (start - map_start) as usize;
        let pages = ((end - start) / PAGE_SIZE_U64) as usize;
        ltracef!(
            "mapping {}: object range {:#x}+{:#x} -> unmap {:#x} x{}",
            self.id,
            offset,
            len,
            va,
            pages
        );
        self.aspace.arch_aspace().unmap(va, pages).map(|_| ())
    }

    /// ========================================================================
    /// Faults and Prefaulting
    /// ========================================================================

    /// Resolve a fault at `va` inside this mapping
    pub(crate) fn page_fault_locked(
        &self,
        locked: &mut AspaceLocked,
        va: VAddr,
        pf_flags: PageFaultFlags,
    ) -> Result {
        self.check_locked(locked);
        let snap = self.snapshot()?;
        debug_assert!(va >= snap.base && va <= snap.last());

        let mmu = snap.arch_mmu_flags;
        if pf_flags.is_write() && !mmu.contains(ArchMmuFlags::PERM_WRITE) {
            log::debug!("mapping {}: write fault at {:#x} on non-writable mapping", self.id, va);
            return Err(VmError::AccessDenied);
        }
        if pf_flags.contains(PageFaultFlags::INSTRUCTION)
            && !mmu.contains(ArchMmuFlags::PERM_EXECUTE)
        {
            log::debug!("mapping {}: exec fault at {:#x} on non-exec mapping", self.id, va);
            return Err(VmError::AccessDenied);
        }
        if !pf_flags.intersects(PageFaultFlags::WRITE | PageFaultFlags::INSTRUCTION)
            && !mmu.contains(ArchMmuFlags::PERM_READ)
        {
            log::debug!("mapping {}: read fault at {:#x} on non-readable mapping", self.id, va);
            return Err(VmError::AccessDenied);
        }
        if pf_flags.contains(PageFaultFlags::USER) && !mmu.contains(ArchMmuFlags::PERM_USER) {
            log::debug!("mapping {}: user fault at {:#x} on kernel mapping", self.id, va);
            return Err(VmError::AccessDenied);
        }
        if !pf_flags.intersects(PageFaultFlags::USER | PageFaultFlags::USER_COPY)
            && mmu.contains(ArchMmuFlags::PERM_USER)
        {
            log::debug!("mapping {}: kernel access to user page {:#x}", self.id, va);
            return Err(VmError::AccessDenied);
        }

        let va = page_align_down(va);
        let vmo_offset = snap.object_offset + (va - snap.base) as u64;
        let write = pf_flags.is_write();
        let flags = if write {
            mmu
        } else {
            mmu - ArchMmuFlags::PERM_WRITE
        };

        let arch = self.aspace.arch_aspace();
        snap.vmo.fault_page(vmo_offset, pf_flags, &mut |pa| {
            ltracef!("mapping {}: fault {:#x} -> {:#x} {:?}", self.id, va, pa, flags);
            install_page(arch, va, pa, flags, write)
        })
    }

    /// Install translations for `[offset, offset + len)` of the mapping
    ///
    /// With `commit` every page is allocated and mapped with the mapping's
    /// full flags, and any failure fails the call. Without it only pages the
    /// object already has are mapped, without write permission.
    pub fn map_range(&self, offset: usize, len: usize, commit: bool) -> Result {
        let mut guard = self.aspace.lock();
        self.map_range_locked(&mut guard, offset, len, commit)
    }

    pub(crate) fn map_range_locked(
        &self,
        locked: &mut AspaceLocked,
        offset: usize,
        len: usize,
        commit: bool,
    ) -> Result {
        self.check_locked(locked);
        let len = checked_page_align_up(len).ok_or(VmError::InvalidArgs)?;
        if len == 0 {
            return Err(VmError::InvalidArgs);
        }
        let snap = self.snapshot()?;
        if !is_page_aligned(offset) || offset > snap.size || snap.size - offset < len {
            return Err(VmError::InvalidArgs);
        }

        let (pf_flags, flags) = if commit {
            (
                PageFaultFlags::SW_FAULT | PageFaultFlags::WRITE,
                snap.arch_mmu_flags,
            )
        } else {
            (
                PageFaultFlags::empty(),
                snap.arch_mmu_flags - ArchMmuFlags::PERM_WRITE,
            )
        };

        let arch = self.aspace.arch_aspace();
        let mut o = offset;
        while o < offset + len {
            let va = snap.base + o;
            let r = snap.vmo.fault_page(
                snap.object_offset + o as u64,
                pf_flags,
                &mut |pa| install_page(arch, va, pa, flags, commit),
            );
            match r {
                Ok(()) => {}
                Err(VmError::NotFound) | Err(VmError::OutOfRange) if !commit => {}
                Err(e) => {
                    log::debug!("mapping {}: map_range stopped at {:#x}: {}", self.id, va, e);
                    return Err(e);
                }
            }
            o += PAGE_SIZE;
        }
        Ok(())
    }

    /// ========================================================================
    /// Unmap, Protect and Destroy
    /// ========================================================================

    fn check_subrange(snap: &Snapshot, base: VAddr, size: usize) -> Result<usize> {
        let size = checked_page_align_up(size).ok_or(VmError::InvalidArgs)?;
        if size == 0 || !is_page_aligned(base) || !is_in_range(base, size, snap.base, snap.size) {
            return Err(VmError::InvalidArgs);
        }
        Ok(size)
    }

    /// Unmap `[base, base + size)`, which must lie inside the mapping
    pub fn unmap(self: &Arc<Self>, base: VAddr, size: usize) -> Result {
        let mut guard = self.aspace.lock();
        let snap = self.snapshot()?;
        let size = Self::check_subrange(&snap, base, size)?;
        self.unmap_locked(&mut guard, base, size)
    }

    /// Remove `[base, base + size)` from the mapping
    ///
    /// Unmapping everything destroys the mapping; a prefix or suffix trims
    /// it; an interior range splits off a new mapping for the tail.
    pub(crate) fn unmap_locked(
        self: &Arc<Self>,
        locked: &mut AspaceLocked,
        base: VAddr,
        size: usize,
    ) -> Result {
        self.check_locked(locked);
        let snap = self.snapshot()?;
        debug_assert!(is_in_range(base, size, snap.base, snap.size));

        if base == snap.base && size == snap.size {
            return self.destroy_locked(locked);
        }

        let arch = self.aspace.arch_aspace();
        let pages = size / PAGE_SIZE;
        let last = base + (size - 1);

        if base == snap.base {
            arch.unmap(base, pages)?;
            {
                let mut state = self.state.lock();
                state.base += size;
                state.object_offset += size as u64;
                state.size -= size;
            }
            // The base is the key in the parent's child map.
            if let Some(parent) = self.parent.upgrade() {
                let node = VmAddressRegionOrMapping::Mapping(self.clone());
                parent.remove_child(snap.base, &node);
                parent.insert_child(base + size, node);
            }
            return Ok(());
        }

        if last == snap.last() {
            arch.unmap(base, pages)?;
            self.state.lock().size -= size;
            return Ok(());
        }

        let right_base = base + size;
        let right = self.split_piece(
            right_base,
            snap.last() - last,
            snap.object_offset + (right_base - snap.base) as u64,
            snap.arch_mmu_flags,
            &snap.vmo,
        );
        right.register();
        if let Err(e) = arch.unmap(base, pages) {
            right.unregister(&snap.vmo);
            return Err(e);
        }
        self.state.lock().size = base - snap.base;
        right.attach();
        ltracef!("mapping {}: split at {:#x}, tail is mapping {}", self.id, base, right.id);
        Ok(())
    }

    /// Change the flags of `[base, base + size)`, which must lie inside the mapping
    pub fn protect(self: &Arc<Self>, base: VAddr, size: usize, flags: ArchMmuFlags) -> Result {
        let mut guard = self.aspace.lock();
        let snap = self.snapshot()?;
        let size = Self::check_subrange(&snap, base, size)?;
        self.protect_locked(&mut guard, base, size, flags)
    }

    /// Re-protect `[base, base + size)`, splitting the mapping as needed
    ///
    /// The cache policy cannot change. Translations lose write permission
    /// here and regain it on the next write fault.
    pub(crate) fn protect_locked(
        self: &Arc<Self>,
        locked: &mut AspaceLocked,
        base: VAddr,
        size: usize,
        new_arch_mmu_flags: ArchMmuFlags,
    ) -> Result {
        self.check_locked(locked);
        if new_arch_mmu_flags.intersects(ArchMmuFlags::CACHE_MASK) {
            return Err(VmError::InvalidArgs);
        }
        if !self.is_valid_mapping_flags(new_arch_mmu_flags) {
            return Err(VmError::AccessDenied);
        }
        let snap = self.snapshot()?;
        debug_assert!(is_in_range(base, size, snap.base, snap.size));

        let new_flags = new_arch_mmu_flags | snap.arch_mmu_flags.cache_policy();
        if new_flags == snap.arch_mmu_flags {
            return Ok(());
        }
        let arch_flags = new_flags - ArchMmuFlags::PERM_WRITE;
        let arch = self.aspace.arch_aspace();
        let pages = size / PAGE_SIZE;
        let last = base + (size - 1);
        let offset_of = |va: VAddr| snap.object_offset + (va - snap.base) as u64;

        if base == snap.base && size == snap.size {
            arch.protect(base, pages, arch_flags)?;
            self.state.lock().arch_mmu_flags = new_flags;
            return Ok(());
        }

        if base == snap.base {
            // Head takes the new flags, a new tail keeps the old ones.
            let tail = self.split_piece(
                base + size,
                snap.size - size,
                offset_of(base + size),
                snap.arch_mmu_flags,
                &snap.vmo,
            );
            tail.register();
            if let Err(e) = arch.protect(base, pages, arch_flags) {
                tail.unregister(&snap.vmo);
                return Err(e);
            }
            {
                let mut state = self.state.lock();
                state.size = size;
                state.arch_mmu_flags = new_flags;
            }
            tail.attach();
            return Ok(());
        }

        if last == snap.last() {
            let tail = self.split_piece(base, size, offset_of(base), new_flags, &snap.vmo);
            tail.register();
            if let Err(e) = arch.protect(base, pages, arch_flags) {
                tail.unregister(&snap.vmo);
                return Err(e);
            }
            self.state.lock().size -= size;
            tail.attach();
            return Ok(());
        }

        let center = self.split_piece(base, size, offset_of(base), new_flags, &snap.vmo);
        let right = self.split_piece(
            base + size,
            snap.last() - last,
            offset_of(base + size),
            snap.arch_mmu_flags,
            &snap.vmo,
        );
        center.register();
        right.register();
        if let Err(e) = arch.protect(base, pages, arch_flags) {
            center.unregister(&snap.vmo);
            right.unregister(&snap.vmo);
            return Err(e);
        }
        self.state.lock().size = base - snap.base;
        center.attach();
        right.attach();
        Ok(())
    }

    /// Destroy the mapping
    pub fn destroy(self: &Arc<Self>) -> Result {
        let mut guard = self.aspace.lock();
        if !self.is_alive() {
            return Err(VmError::BadState);
        }
        self.destroy_locked(&mut guard)
    }

    /// Unmap everything, leave the object and the parent, and go dead
    ///
    /// MMU errors are logged; the mapping is torn down regardless.
    pub(crate) fn destroy_locked(self: &Arc<Self>, locked: &mut AspaceLocked) -> Result {
        self.check_locked(locked);
        let (base, vmo) = {
            let mut state = self.state.lock();
            if state.life == LifeCycle::Dead {
                return Ok(());
            }
            if let Err(e) = self
                .aspace
                .arch_aspace()
                .unmap(state.base, state.size / PAGE_SIZE)
            {
                log::error!(
                    "mapping {} '{}': unmap of {:#x}+{:#x} failed: {}",
                    self.id,
                    self.name,
                    state.base,
                    state.size,
                    e
                );
            }
            state.life = LifeCycle::Dead;
            (state.base, state.vmo.take())
        };

        if let Some(vmo) = vmo {
            self.unregister(&vmo);
        }
        if let Some(parent) = self.parent.upgrade() {
            parent.remove_child(base, &VmAddressRegionOrMapping::Mapping(self.clone()));
        }
        ltracef!("mapping {} '{}': destroyed", self.id, self.name);
        Ok(())
    }

    pub(crate) fn allocated_pages_locked(&self, locked: &mut AspaceLocked) -> usize {
        self.check_locked(locked);
        match self.snapshot() {
            Ok(snap) => snap
                .vmo
                .allocated_pages_in_range(snap.object_offset, snap.size as u64),
            Err(_) => 0,
        }
    }

    pub(crate) fn dump_locked(
        &self,
        locked: &mut AspaceLocked,
        out: &mut dyn fmt::Write,
        depth: usize,
        verbose: bool,
    ) -> fmt::Result {
        self.check_locked(locked);
        let snap = match self.snapshot() {
            Ok(snap) => snap,
            Err(_) => return Ok(()),
        };
        for _ in 0..depth {
            write!(out, "  ")?;
        }
        writeln!(
            out,
            "map {} '{}' [{:#x}, {:#x}] vmo {} offset {:#x} flags {:?}",
            self.id,
            self.name,
            snap.base,
            snap.last(),
            snap.vmo.id(),
            snap.object_offset,
            snap.arch_mmu_flags
        )?;
        if verbose {
            snap.vmo.dump(out, depth + 1, verbose)?;
        }
        Ok(())
    }
}

impl fmt::Debug for VmMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.state.lock();
        f.debug_struct("VmMapping")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base", &state.base)
            .field("size", &state.size)
            .field("object_offset", &state.object_offset)
            .field("flags", &state.arch_mmu_flags)
            .finish()
    }
}
