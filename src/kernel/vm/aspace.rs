// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Address Space Management
//!
//! A [`VmAspace`] is one virtual address space: a translation context on the
//! MMU side plus the tree of regions and mappings that describes it. Address
//! spaces are reference counted and live independently of the threads that
//! run in them.
//!
//! # Design
//!
//! - Every aspace owns a root [`VmAddressRegion`] spanning its whole range.
//!   The root holds a strong reference back to the aspace, so an aspace stays
//!   alive until [`VmAspace::destroy`] tears its tree down.
//! - A single aspace lock serializes every structural change and every page
//!   fault. It guards an [`AspaceLocked`] token that tree operations take as
//!   proof the lock is held; the token also carries the ASLR generator.
//! - All live aspaces are kept on a global list for diagnostics.
//!
//! # Usage
//!
//! ```ignore
//! let aspace = VmAspace::create(AspaceType::User, "proc", pmm)?;
//! let va = aspace.alloc("stack", 0x4000, 0, 0, VmmFlags::COMMIT, flags)?;
//! aspace.page_fault(va, PageFaultFlags::HW_FAULT | PageFaultFlags::WRITE)?;
//! ```

use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use ::rand::rngs::SmallRng;
use bitflags::bitflags;
use spin::{Mutex, MutexGuard, Once};

use super::arch_vm_aspace::{ArchMmuFlags, ArchVmAspace, SoftArchVmAspace};
use super::fault::PageFaultFlags;
use super::layout::*;
use super::pmm::{PhysicalMemoryManager, PmmAllocFlags};
use super::stats;
use super::vm_address_region::{VmAddressRegion, VmAddressRegionOrMapping, VmarFlags};
use super::vm_mapping::VmMapping;
use super::vm_object::{VmObject, VmObjectRef};
use super::vm_object_paged::VmObjectPaged;
use super::vm_object_physical::VmObjectPhysical;
use super::{Result, VmError};
use crate::kernel::thread::{Thread, ThreadState};
use crate::rustux::types::PAddr;

/// ============================================================================
/// Aspace Types and Flags
/// ============================================================================

/// Kind of address space
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AspaceType {
    /// A user process address space
    User,

    /// The kernel's own address space
    Kernel,

    /// A kernel aspace covering the low half of memory
    LowKernel,
}

impl AspaceType {
    /// Base and size of an aspace of this type
    pub const fn range(self) -> (VAddr, usize) {
        match self {
            AspaceType::User => (USER_ASPACE_BASE, USER_ASPACE_SIZE),
            AspaceType::Kernel => (KERNEL_ASPACE_BASE, KERNEL_ASPACE_SIZE),
            AspaceType::LowKernel => (LOW_KERNEL_ASPACE_BASE, LOW_KERNEL_ASPACE_SIZE),
        }
    }

    const fn as_str(self) -> &'static str {
        match self {
            AspaceType::User => "user",
            AspaceType::Kernel => "kernel",
            AspaceType::LowKernel => "low-kernel",
        }
    }
}

bitflags! {
    /// Flags for [`VmAspace::alloc`] and friends
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmmFlags: u32 {
        /// Place the region at the given address
        const VALLOC_SPECIFIC = 1 << 0;
        /// Allocate and map every page up front
        const COMMIT = 1 << 1;
    }
}

/// State guarded by the aspace lock
///
/// Holding a `&mut AspaceLocked` is proof that the aspace lock is held.
pub struct AspaceLocked {
    pub(crate) aspace_id: u64,
    pub(crate) aslr_enabled: bool,
    pub(crate) aslr: SmallRng,
    pub(crate) root_vmar: Option<Arc<VmAddressRegion>>,
}

impl AspaceLocked {
    /// Id of the aspace whose lock this is
    pub fn aspace_id(&self) -> u64 {
        self.aspace_id
    }

    /// Root region, `None` once the aspace is destroyed
    pub fn root_vmar(&self) -> Option<&Arc<VmAddressRegion>> {
        self.root_vmar.as_ref()
    }
}

static NEXT_ASPACE_ID: AtomicU64 = AtomicU64::new(1);

/// Every aspace that has not been dropped
static ASPACES: Mutex<Vec<Weak<VmAspace>>> = Mutex::new(Vec::new());

/// The kernel address space, once created
static KERNEL_ASPACE: Once<Arc<VmAspace>> = Once::new();

/// ============================================================================
/// Address Space
/// ============================================================================

/// Virtual address space
pub struct VmAspace {
    id: u64,
    name: String,
    ty: AspaceType,
    base: VAddr,
    size: usize,
    pmm: Arc<PhysicalMemoryManager>,
    arch: Arc<dyn ArchVmAspace>,
    destroyed: AtomicBool,
    lock: Mutex<AspaceLocked>,
}

impl VmAspace {
    /// Create an aspace backed by an in-memory translation table
    pub fn create(
        ty: AspaceType,
        name: &str,
        pmm: Arc<PhysicalMemoryManager>,
    ) -> Result<Arc<Self>> {
        Self::create_with_arch(ty, name, pmm, Arc::new(SoftArchVmAspace::new()))
    }

    /// Create an aspace on top of an architecture translation context
    ///
    /// # Arguments
    ///
    /// * `ty` - Which range the aspace covers
    /// * `name` - Name for diagnostics
    /// * `pmm` - Allocator backing the objects the aspace creates itself
    /// * `arch` - Uninitialized translation context
    pub fn create_with_arch(
        ty: AspaceType,
        name: &str,
        pmm: Arc<PhysicalMemoryManager>,
        arch: Arc<dyn ArchVmAspace>,
    ) -> Result<Arc<Self>> {
        let (base, size) = ty.range();
        arch.init(base, size, ty != AspaceType::User)?;

        let id = NEXT_ASPACE_ID.fetch_add(1, Ordering::Relaxed);
        let aspace = Arc::new(Self {
            id,
            name: String::from(name),
            ty,
            base,
            size,
            pmm,
            arch,
            destroyed: AtomicBool::new(false),
            lock: Mutex::new(AspaceLocked {
                aspace_id: id,
                aslr_enabled: ty == AspaceType::User,
                aslr: crate::rand::fork_rng(),
                root_vmar: None,
            }),
        });

        let root = VmAddressRegion::create_root(
            aspace.clone(),
            VmarFlags::CAN_MAP_SPECIFIC | VmarFlags::CAN_MAP_RWX,
        );
        aspace.lock.lock().root_vmar = Some(root);

        let mut list = ASPACES.lock();
        list.retain(|a| a.strong_count() > 0);
        list.push(Arc::downgrade(&aspace));
        drop(list);

        log::debug!(
            "aspace {} '{}': created {} [{:#x}, {:#x})",
            id,
            name,
            ty.as_str(),
            base,
            base.wrapping_add(size)
        );
        Ok(aspace)
    }

    /// Unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Name given at creation
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Aspace type
    pub fn aspace_type(&self) -> AspaceType {
        self.ty
    }

    /// Whether this is a user aspace
    pub fn is_user(&self) -> bool {
        self.ty == AspaceType::User
    }

    /// Lowest address of the aspace
    pub fn base(&self) -> VAddr {
        self.base
    }

    /// Size of the aspace in bytes
    pub fn size(&self) -> usize {
        self.size
    }

    /// Translation context
    pub fn arch_aspace(&self) -> &dyn ArchVmAspace {
        self.arch.as_ref()
    }

    /// Physical allocator
    pub fn pmm(&self) -> &Arc<PhysicalMemoryManager> {
        &self.pmm
    }

    /// Take the aspace lock
    pub fn lock(&self) -> MutexGuard<'_, AspaceLocked> {
        self.lock.lock()
    }

    /// Root region of the aspace
    pub fn root_vmar(&self) -> Option<Arc<VmAddressRegion>> {
        self.lock.lock().root_vmar.clone()
    }

    /// Whether [`destroy`](Self::destroy) has run
    pub fn is_destroyed(&self) -> bool {
        self.destroyed.load(Ordering::Acquire)
    }

    /// Turn randomized placement on or off
    pub fn set_aslr_enabled(&self, enabled: bool) {
        self.lock.lock().aslr_enabled = enabled;
    }

    /// Whether randomized placement is on
    pub fn aslr_enabled(&self) -> bool {
        self.lock.lock().aslr_enabled
    }

    /// Resolve a page fault at `va`
    ///
    /// # Arguments
    ///
    /// * `va` - Faulting address
    /// * `pf_flags` - Access kind; trap handlers set [`PageFaultFlags::HW_FAULT`]
    ///
    /// # Returns
    ///
    /// `NotFound` if no mapping covers `va`, `AccessDenied` if the mapping
    /// forbids the access.
    pub fn page_fault(&self, va: VAddr, pf_flags: PageFaultFlags) -> Result {
        ltracef!("aspace {}: fault at {:#x} flags {:?}", self.id, va, pf_flags);
        stats::record_page_fault();

        let mut guard = self.lock.lock();
        let root = guard.root_vmar.clone().ok_or(VmError::BadState)?;
        let r = root.page_fault_locked(&mut guard, va, pf_flags);
        if let Err(e) = r {
            log::debug!(
                "aspace {}: unhandled fault at {:#x} ({:?}): {}",
                self.id,
                va,
                pf_flags,
                e
            );
        }
        r
    }

    /// Tear down every region, then the translation context
    ///
    /// Top-level regions are removed one at a time; the aspace lock is
    /// dropped between unmapping a region and destroying it.
    pub fn destroy(&self) -> Result {
        loop {
            let mut guard = self.lock.lock();
            let root = match guard.root_vmar.clone() {
                Some(root) => root,
                None => return Err(VmError::BadState),
            };
            let child = match root.first_child_locked(&mut guard) {
                Some(child) => child,
                None => break,
            };
            let pages = child.size() / PAGE_SIZE;
            if let Err(e) = self.arch.unmap(child.base(), pages) {
                log::error!(
                    "aspace {}: unmap of {:#x}+{:#x} failed: {}",
                    self.id,
                    child.base(),
                    child.size(),
                    e
                );
            }
            drop(guard);

            let mut guard = self.lock.lock();
            if let Err(e) = child.destroy_locked(&mut guard) {
                log::error!("aspace {}: region destroy failed: {}", self.id, e);
            }
        }

        let mut guard = self.lock.lock();
        if let Some(root) = guard.root_vmar.take() {
            if let Err(e) = root.destroy_locked(&mut guard) {
                log::error!("aspace {}: root destroy failed: {}", self.id, e);
            }
        }
        drop(guard);

        self.destroyed.store(true, Ordering::Release);
        if let Err(e) = self.arch.destroy() {
            log::error!("aspace {}: arch destroy failed: {}", self.id, e);
        }
        log::debug!("aspace {} '{}': destroyed", self.id, self.name);
        Ok(())
    }

    /// Allocate a fresh paged object and map it
    ///
    /// # Arguments
    ///
    /// * `name` - Name of the region and its object
    /// * `size` - Size in bytes, rounded up to a page
    /// * `vaddr` - Address used with [`VmmFlags::VALLOC_SPECIFIC`]
    /// * `align_log2` - Alignment of an automatically placed region
    /// * `vmm_flags` - Placement and commit flags
    /// * `arch_mmu_flags` - Permissions and cache policy of the mapping
    ///
    /// # Returns
    ///
    /// The base address of the new region.
    pub fn alloc(
        &self,
        name: &str,
        size: usize,
        vaddr: VAddr,
        align_log2: u8,
        vmm_flags: VmmFlags,
        arch_mmu_flags: ArchMmuFlags,
    ) -> Result<VAddr> {
        let size = checked_page_align_up(size)
            .filter(|s| *s != 0)
            .ok_or(VmError::InvalidArgs)?;
        let vmo = VmObjectPaged::create(self.pmm.clone(), PmmAllocFlags::empty(), size as u64)?;
        vmo.set_name(name);
        self.map_object_internal(name, size, vaddr, align_log2, vmm_flags, arch_mmu_flags, vmo)
    }

    /// Allocate physically contiguous memory and map it
    pub fn alloc_contiguous(
        &self,
        name: &str,
        size: usize,
        align_log2: u8,
        vmm_flags: VmmFlags,
        arch_mmu_flags: ArchMmuFlags,
    ) -> Result<VAddr> {
        if vmm_flags.contains(VmmFlags::VALLOC_SPECIFIC) {
            return Err(VmError::InvalidArgs);
        }
        let size = checked_page_align_up(size)
            .filter(|s| *s != 0)
            .ok_or(VmError::InvalidArgs)?;
        let vmo = VmObjectPaged::create(self.pmm.clone(), PmmAllocFlags::empty(), size as u64)?;
        vmo.set_name(name);
        vmo.commit_range_contiguous(0, size as u64, align_log2)?;
        self.map_object_internal(
            name,
            size,
            0,
            align_log2,
            vmm_flags | VmmFlags::COMMIT,
            arch_mmu_flags,
            vmo,
        )
    }

    /// Map a fixed physical range
    #[allow(clippy::too_many_arguments)]
    pub fn alloc_physical(
        &self,
        name: &str,
        size: usize,
        vaddr: VAddr,
        align_log2: u8,
        paddr: PAddr,
        vmm_flags: VmmFlags,
        arch_mmu_flags: ArchMmuFlags,
    ) -> Result<VAddr> {
        let size = checked_page_align_up(size)
            .filter(|s| *s != 0)
            .ok_or(VmError::InvalidArgs)?;
        let vmo = VmObjectPhysical::create(paddr, size as u64)?;
        vmo.set_name(name);
        self.map_object_internal(
            name,
            size,
            vaddr,
            align_log2,
            vmm_flags | VmmFlags::COMMIT,
            arch_mmu_flags,
            vmo,
        )
    }

    #[allow(clippy::too_many_arguments)]
    fn map_object_internal(
        &self,
        name: &str,
        size: usize,
        vaddr: VAddr,
        align_log2: u8,
        vmm_flags: VmmFlags,
        arch_mmu_flags: ArchMmuFlags,
        vmo: VmObjectRef,
    ) -> Result<VAddr> {
        let root = self.root_vmar().ok_or(VmError::BadState)?;
        let (offset, vmar_flags) = if vmm_flags.contains(VmmFlags::VALLOC_SPECIFIC) {
            let offset = vaddr.checked_sub(root.base()).ok_or(VmError::InvalidArgs)?;
            (offset, VmarFlags::SPECIFIC)
        } else {
            (0, VmarFlags::empty())
        };

        let mapping: Arc<VmMapping> = root.create_vm_mapping(
            offset,
            size,
            align_log2,
            vmar_flags,
            vmo,
            0,
            arch_mmu_flags,
            name,
        )?;

        if vmm_flags.contains(VmmFlags::COMMIT) {
            if let Err(e) = mapping.map_range(0, size, true) {
                if let Err(destroy_err) = mapping.destroy() {
                    log::error!("aspace {}: cleanup of '{}' failed: {}", self.id, name, destroy_err);
                }
                return Err(e);
            }
        }
        Ok(mapping.base())
    }

    /// Destroy the top-level region containing `va`
    pub fn free_region(&self, va: VAddr) -> Result {
        let root = self.root_vmar().ok_or(VmError::BadState)?;
        let region = root.find_region(va).ok_or(VmError::NotFound)?;
        match region {
            VmAddressRegionOrMapping::Region(r) => r.destroy(),
            VmAddressRegionOrMapping::Mapping(m) => m.destroy(),
        }
    }

    /// Pages committed by all objects mapped into the aspace
    pub fn allocated_pages(&self) -> usize {
        let mut guard = self.lock.lock();
        match guard.root_vmar.clone() {
            Some(root) => root.allocated_pages_locked(&mut guard),
            None => 0,
        }
    }

    /// Attach the aspace to a thread that is not running
    pub fn attach_to_thread(self: &Arc<Self>, thread: &Thread) -> Result {
        let mut inner = thread.lock();
        if inner.state == ThreadState::Running {
            return Err(VmError::BadState);
        }
        inner.aspace = Some(self.clone());
        Ok(())
    }

    /// Print the aspace and its region tree
    pub fn dump(&self, out: &mut dyn fmt::Write, verbose: bool) -> fmt::Result {
        let mut guard = self.lock.lock();
        writeln!(
            out,
            "as {} '{}' {} [{:#x}, {:#x}) aslr {}{}",
            self.id,
            self.name,
            self.ty.as_str(),
            self.base,
            self.base.wrapping_add(self.size),
            guard.aslr_enabled,
            if self.is_destroyed() { " destroyed" } else { "" }
        )?;
        match guard.root_vmar.clone() {
            Some(root) => root.dump_locked(&mut guard, out, 1, verbose),
            None => Ok(()),
        }
    }
}

impl Drop for VmAspace {
    fn drop(&mut self) {
        ASPACES.lock().retain(|a| a.strong_count() > 0);
        ltracef!("aspace {}: dropped", self.id);
    }
}

impl fmt::Debug for VmAspace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmAspace")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("type", &self.ty)
            .finish()
    }
}

/// ============================================================================
/// Global Aspace Management
/// ============================================================================

/// Create the kernel address space
///
/// Fails with `BadState` if it already exists.
pub fn init_kernel_aspace(pmm: Arc<PhysicalMemoryManager>) -> Result<Arc<VmAspace>> {
    let mut created = false;
    let aspace = KERNEL_ASPACE.try_call_once(|| {
        created = true;
        let aspace = VmAspace::create(AspaceType::Kernel, "kernel", pmm)?;
        aspace.set_aslr_enabled(false);
        Ok::<_, VmError>(aspace)
    })?;
    if !created {
        return Err(VmError::BadState);
    }
    Ok(aspace.clone())
}

/// The kernel address space, if created
pub fn kernel_aspace() -> Option<Arc<VmAspace>> {
    KERNEL_ASPACE.get().cloned()
}

/// Switch `thread` to `aspace`
///
/// The translation context of the new aspace is activated under the thread
/// lock. `None` leaves the thread on the kernel context only.
pub fn set_active_aspace(thread: &Thread, aspace: Option<Arc<VmAspace>>) {
    let mut inner = thread.lock();
    let same = match (&inner.aspace, &aspace) {
        (Some(old), Some(new)) => Arc::ptr_eq(old, new),
        (None, None) => true,
        _ => false,
    };
    if same {
        return;
    }
    let old = core::mem::replace(&mut inner.aspace, aspace);
    if let Some(new) = &inner.aspace {
        new.arch.context_switch(old.as_ref().map(|a| a.arch.as_ref()));
    }
}

/// Number of live aspaces
pub fn aspace_count() -> usize {
    ASPACES.lock().iter().filter(|a| a.strong_count() > 0).count()
}

/// Print every live aspace
pub fn dump_all_aspaces(out: &mut dyn fmt::Write, verbose: bool) -> fmt::Result {
    let aspaces: Vec<Arc<VmAspace>> = ASPACES.lock().iter().filter_map(Weak::upgrade).collect();
    for aspace in aspaces.iter() {
        aspace.dump(out, verbose)?;
    }
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::kernel::vm::pmm::{ArenaFlags, ArenaInfo};

    /// A PMM with a single arena of `pages` pages
    pub fn test_pmm(pages: usize) -> Arc<PhysicalMemoryManager> {
        let pmm = Arc::new(PhysicalMemoryManager::new());
        pmm.add_arena(ArenaInfo::new(
            "aspace-test",
            ArenaFlags::KMAP,
            0,
            0x4000_0000,
            pages * PAGE_SIZE,
        ))
        .unwrap();
        pmm
    }

    /// An aspace over an inspectable translation table
    pub fn test_aspace(
        ty: AspaceType,
        pages: usize,
    ) -> (Arc<VmAspace>, Arc<SoftArchVmAspace>, Arc<PhysicalMemoryManager>) {
        let pmm = test_pmm(pages);
        let arch = Arc::new(SoftArchVmAspace::new());
        let aspace = VmAspace::create_with_arch(ty, "test", pmm.clone(), arch.clone()).unwrap();
        (aspace, arch, pmm)
    }
}
