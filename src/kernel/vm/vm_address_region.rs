// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Virtual Memory Address Regions
//!
//! A VMAR is a node of the per-aspace region tree. It owns a contiguous
//! virtual range and hands out non-overlapping pieces of it to child regions
//! and to [`VmMapping`] leaves.
//!
//! # Design
//!
//! - Children are kept in a map keyed by base address, so overlap checks and
//!   gap searches are ordered walks.
//! - Each region carries capability flags (`CAN_MAP_*`). A child can never
//!   hold a capability its parent lacks.
//! - Automatic placement is first-fit, or randomized when ASLR is enabled on
//!   the aspace and the region is not `COMPACT`.
//! - Every structural operation runs under the aspace lock and takes the
//!   [`AspaceLocked`] token as proof.
//!
//! # Usage
//!
//! ```ignore
//! let root = aspace.root_vmar().ok_or(VmError::BadState)?;
//! let vmar = root.create_sub_vmar(0, 0x10_0000, 0, VmarFlags::CAN_MAP_RWX, "heap")?;
//! let mapping = vmar.create_vm_mapping(0, 0x4000, 0, VmarFlags::empty(), vmo, 0, flags, "data")?;
//! ```

use alloc::collections::BTreeMap;
use alloc::string::String;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU64, AtomicUsize, Ordering};

use ::rand::RngCore;
use bitflags::bitflags;
use spin::Mutex;

use super::arch_vm_aspace::ArchMmuFlags;
use super::aspace::{AspaceLocked, VmAspace};
use super::fault::PageFaultFlags;
use super::layout::*;
use super::vm_mapping::VmMapping;
use super::vm_object::{VmObjectRef, PAGE_SIZE_U64};
use super::{Result, VmError};

bitflags! {
    /// Region creation and capability flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct VmarFlags: u32 {
        /// Place children first-fit, without randomization
        const COMPACT = 1 << 0;
        /// Place the new region at the given offset
        const SPECIFIC = 1 << 1;
        /// Like `SPECIFIC`, replacing whatever is mapped there
        const SPECIFIC_OVERWRITE = 1 << 2;
        /// Children may be placed at specific offsets
        const CAN_MAP_SPECIFIC = 1 << 3;
        /// Readable mappings may be created below this region
        const CAN_MAP_READ = 1 << 4;
        /// Writable mappings may be created below this region
        const CAN_MAP_WRITE = 1 << 5;
        /// Executable mappings may be created below this region
        const CAN_MAP_EXECUTE = 1 << 6;

        /// All three mapping capabilities
        const CAN_MAP_RWX = Self::CAN_MAP_READ.bits()
            | Self::CAN_MAP_WRITE.bits()
            | Self::CAN_MAP_EXECUTE.bits();
    }
}

impl VmarFlags {
    /// Capabilities implied by a set of MMU permissions
    pub fn from_mmu_flags(flags: ArchMmuFlags) -> VmarFlags {
        let mut caps = VmarFlags::empty();
        if flags.contains(ArchMmuFlags::PERM_READ) {
            caps |= VmarFlags::CAN_MAP_READ;
        }
        if flags.contains(ArchMmuFlags::PERM_WRITE) {
            caps |= VmarFlags::CAN_MAP_WRITE;
        }
        if flags.contains(ArchMmuFlags::PERM_EXECUTE) {
            caps |= VmarFlags::CAN_MAP_EXECUTE;
        }
        caps
    }

    /// Whether these capabilities allow the MMU permissions in `flags`
    pub fn allows(self, flags: ArchMmuFlags) -> bool {
        self.contains(Self::from_mmu_flags(flags))
    }
}

/// Lifecycle of a region-tree node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum LifeCycle {
    NotReady,
    Alive,
    Dead,
}

/// Attempts a randomized placement makes before giving up
const ASLR_MAX_TRIES: usize = 10;

/// Entropy cap for user aspaces
const USER_ASLR_MAX_BITS: u32 = 31;

static NEXT_REGION_ID: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_region_id() -> u64 {
    NEXT_REGION_ID.fetch_add(1, Ordering::Relaxed)
}

/// ============================================================================
/// Region Tree Nodes
/// ============================================================================

/// A child of a region: either a sub-region or a mapping
#[derive(Clone)]
pub enum VmAddressRegionOrMapping {
    /// A sub-region
    Region(Arc<VmAddressRegion>),
    /// A VMO mapping
    Mapping(Arc<VmMapping>),
}

impl VmAddressRegionOrMapping {
    /// Base address
    pub fn base(&self) -> VAddr {
        match self {
            Self::Region(r) => r.base(),
            Self::Mapping(m) => m.base(),
        }
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        match self {
            Self::Region(r) => r.size(),
            Self::Mapping(m) => m.size(),
        }
    }

    /// Last byte covered
    fn last(&self) -> VAddr {
        self.base() + (self.size() - 1)
    }

    /// Name given at creation
    pub fn name(&self) -> &str {
        match self {
            Self::Region(r) => r.name(),
            Self::Mapping(m) => m.name(),
        }
    }

    /// Whether the node is live in the tree
    pub fn is_alive(&self) -> bool {
        match self {
            Self::Region(r) => r.is_alive(),
            Self::Mapping(m) => m.is_alive(),
        }
    }

    /// Whether this is a mapping
    pub fn is_mapping(&self) -> bool {
        matches!(self, Self::Mapping(_))
    }

    /// The node as a sub-region
    pub fn as_vm_address_region(&self) -> Option<Arc<VmAddressRegion>> {
        match self {
            Self::Region(r) => Some(r.clone()),
            Self::Mapping(_) => None,
        }
    }

    /// The node as a mapping
    pub fn as_vm_mapping(&self) -> Option<Arc<VmMapping>> {
        match self {
            Self::Region(_) => None,
            Self::Mapping(m) => Some(m.clone()),
        }
    }

    /// Destroy the node and everything below it
    pub(crate) fn destroy_locked(&self, locked: &mut AspaceLocked) -> Result {
        match self {
            Self::Region(r) => r.destroy_locked(locked),
            Self::Mapping(m) => m.destroy_locked(locked),
        }
    }

    pub(crate) fn allocated_pages_locked(&self, locked: &mut AspaceLocked) -> usize {
        match self {
            Self::Region(r) => r.allocated_pages_locked(locked),
            Self::Mapping(m) => m.allocated_pages_locked(locked),
        }
    }

    pub(crate) fn dump_locked(
        &self,
        locked: &mut AspaceLocked,
        out: &mut dyn fmt::Write,
        depth: usize,
        verbose: bool,
    ) -> fmt::Result {
        match self {
            Self::Region(r) => r.dump_locked(locked, out, depth, verbose),
            Self::Mapping(m) => m.dump_locked(locked, out, depth, verbose),
        }
    }

    /// Whether both handles refer to the same node
    pub fn ptr_eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::Region(a), Self::Region(b)) => Arc::ptr_eq(a, b),
            (Self::Mapping(a), Self::Mapping(b)) => Arc::ptr_eq(a, b),
            _ => false,
        }
    }
}

impl fmt::Debug for VmAddressRegionOrMapping {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let kind = if self.is_mapping() { "mapping" } else { "vmar" };
        write!(f, "{} '{}' {:#x}+{:#x}", kind, self.name(), self.base(), self.size())
    }
}

/// Geometry of a child, copied out for gap searches
#[derive(Debug, Clone, Copy)]
struct ChildSpan {
    base: VAddr,
    size: usize,
    mmu_flags: ArchMmuFlags,
}

/// Result of examining one gap between children
#[derive(Debug, PartialEq, Eq)]
enum GapCheck {
    /// The region fits at this address
    Found(VAddr),
    /// Try the next gap
    Continue,
    /// No later gap can succeed
    Stop,
}

struct VmarState {
    life: LifeCycle,
    children: BTreeMap<VAddr, VmAddressRegionOrMapping>,
}

/// Virtual memory address region
pub struct VmAddressRegion {
    id: u64,
    aspace: Arc<VmAspace>,
    parent: Weak<VmAddressRegion>,
    /// Extent; moved only by an overwrite trim, under the aspace lock
    base: AtomicUsize,
    size: AtomicUsize,
    flags: VmarFlags,
    name: String,
    state: Mutex<VmarState>,
}

impl VmAddressRegion {
    /// Create the root region of an aspace
    pub(crate) fn create_root(aspace: Arc<VmAspace>, flags: VmarFlags) -> Arc<Self> {
        let base = aspace.base();
        let size = aspace.size();
        Arc::new(Self {
            id: next_region_id(),
            aspace,
            parent: Weak::new(),
            base: AtomicUsize::new(base),
            size: AtomicUsize::new(size),
            flags,
            name: String::from("root"),
            state: Mutex::new(VmarState {
                life: LifeCycle::Alive,
                children: BTreeMap::new(),
            }),
        })
    }

    /// Unique id
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Base address
    pub fn base(&self) -> VAddr {
        self.base.load(Ordering::Relaxed)
    }

    /// Size in bytes
    pub fn size(&self) -> usize {
        self.size.load(Ordering::Relaxed)
    }

    fn last(&self) -> VAddr {
        self.base() + (self.size() - 1)
    }

    /// Creation and capability flags
    pub fn flags(&self) -> VmarFlags {
        self.flags
    }

    /// Name given at creation
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Owning aspace
    pub fn aspace(&self) -> &Arc<VmAspace> {
        &self.aspace
    }

    /// Parent region, `None` for the root or once detached
    pub fn parent(&self) -> Option<Arc<VmAddressRegion>> {
        self.parent.upgrade()
    }

    /// Whether the region is live in the tree
    pub fn is_alive(&self) -> bool {
        self.state.lock().life == LifeCycle::Alive
    }

    /// Snapshot of the children in address order
    pub fn children(&self) -> Vec<VmAddressRegionOrMapping> {
        self.state.lock().children.values().cloned().collect()
    }

    fn check_locked(&self, locked: &AspaceLocked) {
        debug_assert_eq!(locked.aspace_id, self.aspace.id());
    }

    /// Insert a child keyed by its base
    pub(crate) fn insert_child(&self, base: VAddr, child: VmAddressRegionOrMapping) {
        let old = self.state.lock().children.insert(base, child);
        debug_assert!(old.is_none(), "vmar {}: duplicate child at {:#x}", self.id, base);
    }

    /// Remove the child at `base` if it is `child`
    pub(crate) fn remove_child(&self, base: VAddr, child: &VmAddressRegionOrMapping) -> bool {
        let mut state = self.state.lock();
        match state.children.get(&base) {
            Some(c) if c.ptr_eq(child) => {
                state.children.remove(&base);
                true
            }
            _ => false,
        }
    }

    /// First child in address order
    pub(crate) fn first_child_locked(
        &self,
        locked: &mut AspaceLocked,
    ) -> Option<VmAddressRegionOrMapping> {
        self.check_locked(locked);
        self.state.lock().children.values().next().cloned()
    }

    /// The direct child containing `va`
    pub fn find_region(&self, va: VAddr) -> Option<VmAddressRegionOrMapping> {
        let mut guard = self.aspace.lock();
        self.find_region_locked(&mut guard, va)
    }

    pub(crate) fn find_region_locked(
        &self,
        locked: &mut AspaceLocked,
        va: VAddr,
    ) -> Option<VmAddressRegionOrMapping> {
        self.check_locked(locked);
        let state = self.state.lock();
        let (_, child) = state.children.range(..=va).next_back()?;
        if va - child.base() < child.size() {
            Some(child.clone())
        } else {
            None
        }
    }

    /// Children overlapping `[base, last]`, in address order
    fn overlapping_children(&self, base: VAddr, last: VAddr) -> Vec<VmAddressRegionOrMapping> {
        let state = self.state.lock();
        let mut nodes = Vec::new();
        if let Some((_, prev)) = state.children.range(..base).next_back() {
            if prev.last() >= base {
                nodes.push(prev.clone());
            }
        }
        nodes.extend(state.children.range(base..=last).map(|(_, c)| c.clone()));
        nodes
    }

    fn child_spans(&self) -> Vec<ChildSpan> {
        self.state
            .lock()
            .children
            .values()
            .map(|c| ChildSpan {
                base: c.base(),
                size: c.size(),
                mmu_flags: c
                    .as_vm_mapping()
                    .map(|m| m.arch_mmu_flags())
                    .unwrap_or(ArchMmuFlags::empty()),
            })
            .collect()
    }

    fn is_range_available_locked(&self, base: VAddr, size: usize) -> bool {
        self.overlapping_children(base, base + (size - 1)).is_empty()
    }

    /// ========================================================================
    /// Child Creation
    /// ========================================================================

    /// Create a sub-region
    ///
    /// # Arguments
    ///
    /// * `offset` - Offset from this region's base, used with `SPECIFIC`
    /// * `size` - Size in bytes, rounded up to a page
    /// * `align_log2` - Placement alignment; anything below a page means a page
    /// * `vmar_flags` - Placement and capability flags for the new region
    /// * `name` - Name for diagnostics
    pub fn create_sub_vmar(
        self: &Arc<Self>,
        offset: usize,
        size: usize,
        align_log2: u8,
        vmar_flags: VmarFlags,
        name: &str,
    ) -> Result<Arc<VmAddressRegion>> {
        let size = checked_page_align_up(size).ok_or(VmError::InvalidArgs)?;
        let mut guard = self.aspace.lock();
        let node = self.create_sub_vmar_internal_locked(
            &mut guard,
            offset,
            size,
            align_log2,
            vmar_flags,
            None,
            ArchMmuFlags::empty(),
            name,
        )?;
        node.as_vm_address_region().ok_or(VmError::BadState)
    }

    /// Map `[vmo_offset, vmo_offset + size)` of `vmo` into this region
    ///
    /// The mapping's capabilities are widened to cover `arch_mmu_flags`, and
    /// must still be within this region's.
    #[allow(clippy::too_many_arguments)]
    pub fn create_vm_mapping(
        self: &Arc<Self>,
        offset: usize,
        size: usize,
        align_log2: u8,
        vmar_flags: VmarFlags,
        vmo: VmObjectRef,
        vmo_offset: u64,
        arch_mmu_flags: ArchMmuFlags,
        name: &str,
    ) -> Result<Arc<VmMapping>> {
        let size = checked_page_align_up(size).ok_or(VmError::InvalidArgs)?;
        let mut guard = self.aspace.lock();
        let node = self.create_sub_vmar_internal_locked(
            &mut guard,
            offset,
            size,
            align_log2,
            vmar_flags,
            Some((vmo, vmo_offset)),
            arch_mmu_flags,
            name,
        )?;
        node.as_vm_mapping().ok_or(VmError::BadState)
    }

    #[allow(clippy::too_many_arguments)]
    pub(crate) fn create_sub_vmar_internal_locked(
        self: &Arc<Self>,
        locked: &mut AspaceLocked,
        offset: usize,
        size: usize,
        align_log2: u8,
        mut vmar_flags: VmarFlags,
        vmo: Option<(VmObjectRef, u64)>,
        arch_mmu_flags: ArchMmuFlags,
        name: &str,
    ) -> Result<VmAddressRegionOrMapping> {
        self.check_locked(locked);

        if !self.is_alive() {
            return Err(VmError::BadState);
        }
        if size == 0 || !is_page_aligned(size) {
            return Err(VmError::InvalidArgs);
        }
        if align_log2 as u32 >= usize::BITS {
            return Err(VmError::InvalidArgs);
        }
        let align_log2 = core::cmp::max(align_log2, PAGE_SIZE_SHIFT);
        let align = 1usize << align_log2;

        if let Some((_, vmo_offset)) = &vmo {
            if vmo_offset & (PAGE_SIZE_U64 - 1) != 0 {
                return Err(VmError::InvalidArgs);
            }
            vmo_offset
                .checked_add(size as u64)
                .ok_or(VmError::OutOfRange)?;
            vmar_flags |= VmarFlags::from_mmu_flags(arch_mmu_flags);
        }

        // A child may not hold a capability this region lacks.
        if !(vmar_flags & VmarFlags::CAN_MAP_RWX & !self.flags).is_empty() {
            log::debug!(
                "vmar {}: capability escalation {:?} over {:?}",
                self.id,
                vmar_flags,
                self.flags
            );
            return Err(VmError::AccessDenied);
        }

        let overwrite = vmar_flags.contains(VmarFlags::SPECIFIC_OVERWRITE);
        let specific = overwrite || vmar_flags.contains(VmarFlags::SPECIFIC);
        if !specific && offset != 0 {
            return Err(VmError::InvalidArgs);
        }

        let new_base = if specific {
            if !self.flags.contains(VmarFlags::CAN_MAP_SPECIFIC) {
                return Err(VmError::AccessDenied);
            }
            if !is_page_aligned(offset) || offset >= self.size() || size > self.size() - offset {
                return Err(VmError::InvalidArgs);
            }
            let new_base = self.base() + offset;
            if new_base & (align - 1) != 0 {
                return Err(VmError::InvalidArgs);
            }
            if !self.is_range_available_locked(new_base, size) {
                if !overwrite {
                    return Err(VmError::NoMemory);
                }
                self.unmap_internal_locked(locked, new_base, size, true)?;
            }
            new_base
        } else {
            self.alloc_spot_locked(locked, size, align_log2, arch_mmu_flags)?
        };
        // Placement bits apply to this call only.
        let vmar_flags = vmar_flags - (VmarFlags::SPECIFIC | VmarFlags::SPECIFIC_OVERWRITE);

        let node = match vmo {
            Some((vmo, vmo_offset)) => {
                let mapping = VmMapping::new(
                    self.aspace.clone(),
                    self,
                    new_base,
                    size,
                    vmar_flags,
                    vmo,
                    vmo_offset,
                    arch_mmu_flags,
                    name,
                );
                mapping.activate_locked(locked);
                VmAddressRegionOrMapping::Mapping(mapping)
            }
            None => {
                let region = Arc::new(VmAddressRegion {
                    id: next_region_id(),
                    aspace: self.aspace.clone(),
                    parent: Arc::downgrade(self),
                    base: AtomicUsize::new(new_base),
                    size: AtomicUsize::new(size),
                    flags: vmar_flags,
                    name: String::from(name),
                    state: Mutex::new(VmarState {
                        life: LifeCycle::Alive,
                        children: BTreeMap::new(),
                    }),
                });
                let node = VmAddressRegionOrMapping::Region(region);
                self.insert_child(new_base, node.clone());
                node
            }
        };

        ltracef!(
            "vmar {}: created {:?} (flags {:?})",
            self.id,
            node,
            vmar_flags
        );
        Ok(node)
    }

    /// ========================================================================
    /// Placement
    /// ========================================================================

    /// Pick a base address for a new child of `size` bytes
    fn alloc_spot_locked(
        &self,
        locked: &mut AspaceLocked,
        size: usize,
        align_log2: u8,
        arch_mmu_flags: ArchMmuFlags,
    ) -> Result<VAddr> {
        let align = 1usize << align_log2;
        let spans = self.child_spans();
        if locked.aslr_enabled && !self.flags.contains(VmarFlags::COMPACT) {
            self.randomized_spot_locked(locked, &spans, size, align, arch_mmu_flags)
        } else {
            self.linear_spot(&spans, size, align, arch_mmu_flags)
        }
    }

    /// First gap, in address order, that fits the region
    fn linear_spot(
        &self,
        spans: &[ChildSpan],
        size: usize,
        align: usize,
        arch_mmu_flags: ArchMmuFlags,
    ) -> Result<VAddr> {
        for i in 0..=spans.len() {
            let prev = if i == 0 { None } else { spans.get(i - 1) };
            let next = spans.get(i);
            match self.check_gap(prev, next, self.base(), align, size, 0, arch_mmu_flags) {
                GapCheck::Found(va) => return Ok(va),
                GapCheck::Stop => break,
                GapCheck::Continue => {}
            }
        }
        Err(VmError::NoMemory)
    }

    /// Place the region at a random offset
    ///
    /// Draws an offset below `2^width`, where `width` is the log2 of the
    /// slack left by the region, and takes the gap containing it. Gives up
    /// with `NoMemory` after [`ASLR_MAX_TRIES`] misses.
    fn randomized_spot_locked(
        &self,
        locked: &mut AspaceLocked,
        spans: &[ChildSpan],
        size: usize,
        align: usize,
        arch_mmu_flags: ArchMmuFlags,
    ) -> Result<VAddr> {
        if size > self.size() {
            return Err(VmError::NoMemory);
        }
        let slack = self.size() - size;
        let mut width = if slack == 0 { 0 } else { slack.ilog2() };
        if self.aspace.is_user() {
            width = core::cmp::min(width, USER_ASLR_MAX_BITS);
        }
        if width == 0 {
            return self.linear_spot(spans, size, align, arch_mmu_flags);
        }

        let mask = (1u64 << width) - 1;
        for _ in 0..ASLR_MAX_TRIES {
            let offset = round_down((locked.aslr.next_u64() & mask) as usize, align);
            let candidate = self.base() + offset;

            let next_index = spans.partition_point(|c| c.base <= candidate);
            let prev = if next_index == 0 {
                None
            } else {
                spans.get(next_index - 1)
            };
            if let Some(p) = prev {
                if candidate - p.base < p.size {
                    continue;
                }
            }
            if let GapCheck::Found(va) = self.check_gap(
                prev,
                spans.get(next_index),
                candidate,
                align,
                size,
                0,
                arch_mmu_flags,
            ) {
                ltracef!("vmar {}: aslr picked {:#x}", self.id, va);
                return Ok(va);
            }
        }
        log::debug!(
            "vmar {}: no randomized spot for {:#x} bytes after {} tries",
            self.id,
            size,
            ASLR_MAX_TRIES
        );
        Err(VmError::NoMemory)
    }

    /// Check whether the gap between `prev` and `next` fits the region
    ///
    /// Only the part of the gap at or above `search_base` is considered.
    #[allow(clippy::too_many_arguments)]
    fn check_gap(
        &self,
        prev: Option<&ChildSpan>,
        next: Option<&ChildSpan>,
        search_base: VAddr,
        align: usize,
        size: usize,
        min_gap: usize,
        arch_mmu_flags: ArchMmuFlags,
    ) -> GapCheck {
        // First byte of the gap.
        let gap_beg = match prev {
            Some(p) => match p.base.checked_add(p.size).and_then(|v| v.checked_add(min_gap)) {
                Some(v) => v,
                None => return GapCheck::Stop,
            },
            None => self.base(),
        };

        // Last byte of the gap.
        let gap_end = match next {
            Some(n) => {
                if gap_beg == n.base {
                    return GapCheck::Continue;
                }
                match n.base.checked_sub(1).and_then(|v| v.checked_sub(min_gap)) {
                    Some(v) => v,
                    None => return GapCheck::Stop,
                }
            }
            None => {
                let last = self.last();
                if gap_beg > last {
                    return GapCheck::Stop;
                }
                last
            }
        };
        if gap_end < gap_beg || gap_end <= search_base {
            return GapCheck::Continue;
        }
        let gap_beg = core::cmp::max(gap_beg, search_base);

        let prev_flags = prev.map(|p| p.mmu_flags).unwrap_or(ArchMmuFlags::empty());
        let next_flags = next.map(|n| n.mmu_flags).unwrap_or(ArchMmuFlags::empty());
        let va = match self.aspace.arch_aspace().pick_spot(
            gap_beg,
            prev_flags,
            gap_end,
            next_flags,
            align,
            size,
            arch_mmu_flags,
        ) {
            Some(va) => va,
            None => return GapCheck::Stop,
        };
        if va < gap_beg {
            return GapCheck::Stop;
        }
        if va <= gap_end && gap_end - va >= size - 1 {
            return GapCheck::Found(va);
        }
        GapCheck::Continue
    }

    /// ========================================================================
    /// Unmap and Protect
    /// ========================================================================

    /// Remove everything mapped in `[base, base + size)`
    ///
    /// Mappings that straddle the range are trimmed or split. A sub-region
    /// that the range only partially covers fails the call before anything
    /// is changed; fully covered sub-regions are destroyed.
    pub fn unmap(&self, base: VAddr, size: usize) -> Result {
        let size = checked_page_align_up(size).ok_or(VmError::InvalidArgs)?;
        if size == 0 || !is_page_aligned(base) {
            return Err(VmError::InvalidArgs);
        }
        let mut guard = self.aspace.lock();
        if !self.is_alive() {
            return Err(VmError::BadState);
        }
        self.unmap_internal_locked(&mut guard, base, size, false)
    }

    /// Remove everything in `[base, base + size)`
    ///
    /// With `trim_regions` a sub-region the range only partly covers is
    /// emptied over the range and shrunk to the rest, as long as it keeps a
    /// single piece; without it such a sub-region fails the call. Either
    /// failure is reported before anything changes.
    pub(crate) fn unmap_internal_locked(
        &self,
        locked: &mut AspaceLocked,
        base: VAddr,
        size: usize,
        trim_regions: bool,
    ) -> Result {
        self.check_locked(locked);
        if !is_in_range(base, size, self.base(), self.size()) {
            return Err(VmError::InvalidArgs);
        }
        let last = base + (size - 1);
        let nodes = self.overlapping_children(base, last);

        for node in nodes.iter() {
            let contained = node.base() >= base && node.last() <= last;
            if node.is_mapping() || contained {
                continue;
            }
            let straddles = node.base() < base && node.last() > last;
            if !trim_regions || straddles {
                return Err(VmError::InvalidArgs);
            }
        }

        for node in nodes.iter() {
            let node_base = node.base();
            let node_last = node.last();
            let unmap_base = core::cmp::max(node_base, base);
            let unmap_last = core::cmp::min(node_last, last);
            let partial = node_base < base || node_last > last;
            match node {
                VmAddressRegionOrMapping::Mapping(m) if partial => {
                    m.unmap_locked(locked, unmap_base, unmap_last - unmap_base + 1)?;
                }
                VmAddressRegionOrMapping::Region(r) if partial => {
                    r.trim_locked(locked, unmap_base, unmap_last)?;
                }
                _ => node.destroy_locked(locked)?,
            }
        }
        ltracef!("vmar {}: unmapped {:#x}+{:#x}", self.id, base, size);
        Ok(())
    }

    /// Empty `[base, last]`, a prefix or suffix of this region, and drop it
    /// from the region's extent
    fn trim_locked(self: &Arc<Self>, locked: &mut AspaceLocked, base: VAddr, last: VAddr) -> Result {
        let old_base = self.base();
        let old_last = self.last();
        debug_assert!(base == old_base || last == old_last);
        debug_assert!(base > old_base || last < old_last);

        // Nested regions always touch an edge of the range, so this never
        // hits the straddling case.
        self.unmap_internal_locked(locked, base, last - base + 1, true)?;

        let size = last - base + 1;
        if base == old_base {
            let new_base = last + 1;
            self.base.store(new_base, Ordering::Relaxed);
            self.size.fetch_sub(size, Ordering::Relaxed);
            // The base is the key in the parent's child map.
            if let Some(parent) = self.parent.upgrade() {
                let node = VmAddressRegionOrMapping::Region(self.clone());
                parent.remove_child(old_base, &node);
                parent.insert_child(new_base, node);
            }
        } else {
            self.size.fetch_sub(size, Ordering::Relaxed);
        }
        log::debug!(
            "vmar {} '{}': trimmed to [{:#x}, {:#x}]",
            self.id,
            self.name,
            self.base(),
            self.last()
        );
        Ok(())
    }

    /// Change the permissions of `[base, base + size)`
    ///
    /// The range must be covered, without holes, by mappings that are direct
    /// children of this region.
    pub fn protect(&self, base: VAddr, size: usize, new_arch_mmu_flags: ArchMmuFlags) -> Result {
        let size = checked_page_align_up(size).ok_or(VmError::InvalidArgs)?;
        if size == 0 || !is_page_aligned(base) {
            return Err(VmError::InvalidArgs);
        }
        let mut guard = self.aspace.lock();
        if !self.is_alive() {
            return Err(VmError::BadState);
        }
        self.protect_locked(&mut guard, base, size, new_arch_mmu_flags)
    }

    fn protect_locked(
        &self,
        locked: &mut AspaceLocked,
        base: VAddr,
        size: usize,
        new_arch_mmu_flags: ArchMmuFlags,
    ) -> Result {
        self.check_locked(locked);
        if !is_in_range(base, size, self.base(), self.size()) {
            return Err(VmError::InvalidArgs);
        }
        if new_arch_mmu_flags.intersects(ArchMmuFlags::CACHE_MASK) {
            return Err(VmError::InvalidArgs);
        }
        let last = base + (size - 1);
        let nodes = self.overlapping_children(base, last);
        if nodes.is_empty() {
            return Err(VmError::NotFound);
        }

        // Validate the whole range before touching any mapping.
        let mut mappings = Vec::with_capacity(nodes.len());
        let mut covered: Option<VAddr> = None;
        for node in nodes.iter() {
            let mapping = node.as_vm_mapping().ok_or(VmError::InvalidArgs)?;
            let contiguous = match covered {
                None => node.base() <= base,
                Some(prev_last) => prev_last.checked_add(1) == Some(node.base()),
            };
            if !contiguous {
                return Err(VmError::NotFound);
            }
            if !mapping.is_valid_mapping_flags(new_arch_mmu_flags) {
                return Err(VmError::AccessDenied);
            }
            covered = Some(node.last());
            mappings.push(mapping);
        }
        if covered.map_or(true, |c| c < last) {
            return Err(VmError::NotFound);
        }

        for mapping in mappings.iter() {
            let m_base = mapping.base();
            let m_last = m_base + (mapping.size() - 1);
            let p_base = core::cmp::max(m_base, base);
            let p_last = core::cmp::min(m_last, last);
            mapping.protect_locked(locked, p_base, p_last - p_base + 1, new_arch_mmu_flags)?;
        }
        Ok(())
    }

    /// ========================================================================
    /// Destruction and Faults
    /// ========================================================================

    /// Destroy this region and everything below it
    pub fn destroy(self: &Arc<Self>) -> Result {
        let mut guard = self.aspace.lock();
        if !self.is_alive() {
            return Err(VmError::BadState);
        }
        self.destroy_locked(&mut guard)
    }

    pub(crate) fn destroy_locked(self: &Arc<Self>, locked: &mut AspaceLocked) -> Result {
        self.check_locked(locked);
        loop {
            let child = {
                let mut state = self.state.lock();
                match state.children.pop_first() {
                    Some((_, child)) => child,
                    None => break,
                }
            };
            child.destroy_locked(locked)?;
        }

        self.state.lock().life = LifeCycle::Dead;
        if let Some(parent) = self.parent.upgrade() {
            parent.remove_child(self.base(), &VmAddressRegionOrMapping::Region(self.clone()));
        }
        ltracef!("vmar {} '{}': destroyed", self.id, self.name);
        Ok(())
    }

    /// Route a page fault to the mapping covering `va`
    pub(crate) fn page_fault_locked(
        self: &Arc<Self>,
        locked: &mut AspaceLocked,
        va: VAddr,
        pf_flags: PageFaultFlags,
    ) -> Result {
        let mut vmar = self.clone();
        loop {
            match vmar.find_region_locked(locked, va) {
                Some(VmAddressRegionOrMapping::Region(r)) => vmar = r,
                Some(VmAddressRegionOrMapping::Mapping(m)) => {
                    return m.page_fault_locked(locked, va, pf_flags)
                }
                None => return Err(VmError::NotFound),
            }
        }
    }

    /// Pages committed by the objects mapped below this region
    pub fn allocated_pages(&self) -> usize {
        let mut guard = self.aspace.lock();
        self.allocated_pages_locked(&mut guard)
    }

    pub(crate) fn allocated_pages_locked(&self, locked: &mut AspaceLocked) -> usize {
        self.children()
            .iter()
            .map(|c| c.allocated_pages_locked(locked))
            .sum()
    }

    /// Print this region and its subtree
    pub fn dump(&self, out: &mut dyn fmt::Write, depth: usize, verbose: bool) -> fmt::Result {
        let mut guard = self.aspace.lock();
        self.dump_locked(&mut guard, out, depth, verbose)
    }

    pub(crate) fn dump_locked(
        &self,
        locked: &mut AspaceLocked,
        out: &mut dyn fmt::Write,
        depth: usize,
        verbose: bool,
    ) -> fmt::Result {
        for _ in 0..depth {
            write!(out, "  ")?;
        }
        writeln!(
            out,
            "vmar {} '{}' [{:#x}, {:#x}] flags {:?}",
            self.id,
            self.name,
            self.base(),
            self.last(),
            self.flags
        )?;
        for child in self.children() {
            child.dump_locked(locked, out, depth + 1, verbose)?;
        }
        Ok(())
    }
}

impl fmt::Debug for VmAddressRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VmAddressRegion")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("base", &self.base())
            .field("size", &self.size())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::vm::aspace::testing::test_aspace;
    use crate::kernel::vm::aspace::AspaceType;
    use crate::kernel::vm::pmm::PmmAllocFlags;
    use crate::kernel::vm::vm_object::VmObject;
    use crate::kernel::vm::vm_object_paged::VmObjectPaged;
    use crate::kernel::vm::ArchVmAspace;

    const PG: usize = PAGE_SIZE;
    const RW: ArchMmuFlags = ArchMmuFlags::PERM_READ
        .union(ArchMmuFlags::PERM_WRITE)
        .union(ArchMmuFlags::PERM_USER);
    const CAPS: VmarFlags = VmarFlags::CAN_MAP_SPECIFIC.union(VmarFlags::CAN_MAP_RWX);

    fn assert_disjoint(vmar: &VmAddressRegion) {
        let children = vmar.children();
        for pair in children.windows(2) {
            assert!(pair[0].base() + pair[0].size() <= pair[1].base());
        }
        for child in children.iter() {
            assert!(is_in_range(child.base(), child.size(), vmar.base(), vmar.size()));
        }
    }

    #[test]
    fn test_specific_placement_and_conflicts() {
        let (aspace, _arch, _pmm) = test_aspace(AspaceType::User, 4);
        let root = aspace.root_vmar().unwrap();
        let vmar = root.create_sub_vmar(0x10_0000, 0x10000, 0, VmarFlags::SPECIFIC | CAPS, "a").unwrap();
        assert_eq!(vmar.base(), root.base() + 0x10_0000);
        assert_eq!(vmar.parent().map(|p| p.id()), Some(root.id()));

        assert_eq!(
            root.create_sub_vmar(0x10_8000, 0x10000, 0, VmarFlags::SPECIFIC, "b").err(),
            Some(VmError::NoMemory)
        );
        assert_eq!(
            root.create_sub_vmar(0x10_0800, PG, 0, VmarFlags::SPECIFIC, "c").err(),
            Some(VmError::InvalidArgs)
        );
        assert_eq!(
            root.create_sub_vmar(0x20_1000, PG, 16, VmarFlags::SPECIFIC, "d").err(),
            Some(VmError::InvalidArgs)
        );
        assert_eq!(
            root.create_sub_vmar(PG, PG, 0, VmarFlags::empty(), "e").err(),
            Some(VmError::InvalidArgs)
        );
        assert_eq!(
            root.create_sub_vmar(0, 0, 0, VmarFlags::empty(), "f").err(),
            Some(VmError::InvalidArgs)
        );
        assert_eq!(
            root.create_sub_vmar(USER_ASPACE_SIZE, PG, 0, VmarFlags::SPECIFIC, "g").err(),
            Some(VmError::InvalidArgs)
        );

        // No CAN_MAP_SPECIFIC on the inner region.
        let inner = vmar.create_sub_vmar(0, 0x4000, 0, VmarFlags::CAN_MAP_READ, "inner").unwrap();
        assert_eq!(
            inner.create_sub_vmar(0, PG, 0, VmarFlags::SPECIFIC, "h").err(),
            Some(VmError::AccessDenied)
        );
        assert_disjoint(&root);
        assert_disjoint(&vmar);
    }

    #[test]
    fn test_capabilities_cannot_escalate() {
        let (aspace, _arch, pmm) = test_aspace(AspaceType::User, 4);
        let root = aspace.root_vmar().unwrap();
        let ro = root.create_sub_vmar(0, 0x10000, 0, VmarFlags::CAN_MAP_READ, "ro").unwrap();
        assert_eq!(
            ro.create_sub_vmar(0, PG, 0, VmarFlags::CAN_MAP_WRITE, "w").err(),
            Some(VmError::AccessDenied)
        );
        let vmo = VmObjectPaged::create(pmm, PmmAllocFlags::empty(), PG as u64).unwrap();
        assert_eq!(
            ro.create_vm_mapping(0, PG, 0, VmarFlags::empty(), vmo.clone(), 0, RW, "m").err(),
            Some(VmError::AccessDenied)
        );
        let m = ro
            .create_vm_mapping(0, PG, 0, VmarFlags::empty(), vmo.clone(), 0, ArchMmuFlags::PERM_READ, "r")
            .unwrap();
        assert!(m.flags().contains(VmarFlags::CAN_MAP_READ));
        assert_eq!(
            ro.create_vm_mapping(0, PG, 0, VmarFlags::empty(), vmo, 0x10, ArchMmuFlags::PERM_READ, "u").err(),
            Some(VmError::InvalidArgs)
        );
    }

    #[test]
    fn test_linear_placement_is_first_fit() {
        let (aspace, _arch, _pmm) = test_aspace(AspaceType::User, 4);
        aspace.set_aslr_enabled(false);
        let root = aspace.root_vmar().unwrap();
        let vmar = root.create_sub_vmar(0, 0x10000, 0, CAPS, "lin").unwrap();
        assert_eq!(vmar.base(), USER_ASPACE_BASE);

        let a = vmar.create_sub_vmar(0, 0x2000, 0, VmarFlags::empty(), "a").unwrap();
        let b = vmar.create_sub_vmar(0, 0x2000, 0, VmarFlags::empty(), "b").unwrap();
        assert_eq!(a.base(), vmar.base());
        assert_eq!(b.base(), vmar.base() + 0x2000);

        a.destroy().unwrap();
        let c = vmar.create_sub_vmar(0, PG, 0, VmarFlags::empty(), "c").unwrap();
        assert_eq!(c.base(), vmar.base());

        let d = vmar.create_sub_vmar(0, PG, 15, VmarFlags::empty(), "d").unwrap();
        assert_eq!(d.base() % (1 << 15), 0);
        assert!(d.base() >= b.base() + b.size());

        assert_eq!(
            vmar.create_sub_vmar(0, 0x10000, 0, VmarFlags::empty(), "full").err(),
            Some(VmError::NoMemory)
        );
        assert_disjoint(&vmar);
    }

    #[test]
    fn test_randomized_placement_stays_in_bounds() {
        let (aspace, _arch, _pmm) = test_aspace(AspaceType::User, 4);
        let root = aspace.root_vmar().unwrap();
        let mut bases = Vec::new();
        for i in 0..32usize {
            let size = (i % 4 + 1) * PG;
            let align = if i % 3 == 0 { 16 } else { 0 };
            let r = root.create_sub_vmar(0, size, align, VmarFlags::empty(), "r").unwrap();
            assert!(is_in_range(r.base(), r.size(), root.base(), root.size()));
            assert_eq!(r.base() % (1 << core::cmp::max(align, PAGE_SIZE_SHIFT)), 0);
            assert!(r.base() - root.base() < 1usize << USER_ASLR_MAX_BITS);
            bases.push(r.base());
        }
        assert_disjoint(&root);
        bases.sort_unstable();
        bases.dedup();
        assert_eq!(bases.len(), 32);
    }

    #[test]
    fn test_compact_region_ignores_aslr() {
        let (aspace, _arch, _pmm) = test_aspace(AspaceType::User, 4);
        let root = aspace.root_vmar().unwrap();
        let compact = root
            .create_sub_vmar(0, 0x10_0000, 0, VmarFlags::COMPACT | CAPS, "compact")
            .unwrap();
        for i in 0..4 {
            let r = compact.create_sub_vmar(0, PG, 0, VmarFlags::empty(), "c").unwrap();
            assert_eq!(r.base(), compact.base() + i * PG);
        }
    }

    #[test]
    fn test_overwrite_replaces_part_of_a_mapping() {
        let (aspace, arch, pmm) = test_aspace(AspaceType::User, 16);
        let root = aspace.root_vmar().unwrap();
        let vmar = root.create_sub_vmar(0, 0x10000, 0, CAPS, "vmar").unwrap();
        let vmo = VmObjectPaged::create(pmm.clone(), PmmAllocFlags::empty(), 0x4000).unwrap();

        let first = vmar
            .create_vm_mapping(0, 0x4000, 0, VmarFlags::SPECIFIC, vmo.clone(), 0, RW, "first")
            .unwrap();
        first.map_range(0, 0x4000, true).unwrap();
        assert_eq!(arch.mapping_count(), 4);

        assert_eq!(
            vmar.create_sub_vmar(0x2000, 0x2000, 0, VmarFlags::SPECIFIC, "clash").err(),
            Some(VmError::NoMemory)
        );
        let second = vmar
            .create_sub_vmar(0x2000, 0x2000, 0, VmarFlags::SPECIFIC_OVERWRITE, "second")
            .unwrap();
        assert_eq!(second.base(), vmar.base() + 0x2000);
        assert_eq!(first.size(), 0x2000);
        assert_eq!(arch.mapping_count(), 2);
        assert_eq!(arch.query(vmar.base() + 0x3000), Err(VmError::NotFound));
        assert_disjoint(&vmar);

        // Overwriting the tail of a sub-region shrinks it.
        let third = vmar
            .create_sub_vmar(0x3000, 0x2000, 0, VmarFlags::SPECIFIC_OVERWRITE, "third")
            .unwrap();
        assert!(second.is_alive());
        assert_eq!((second.base(), second.size()), (vmar.base() + 0x2000, PG));
        assert_eq!(third.base(), vmar.base() + 0x3000);
        assert!(!third.flags().intersects(VmarFlags::SPECIFIC_OVERWRITE));
        assert_disjoint(&vmar);
    }

    #[test]
    fn test_overwrite_trims_overlapped_sub_region() {
        let (aspace, arch, pmm) = test_aspace(AspaceType::User, 16);
        let root = aspace.root_vmar().unwrap();
        let vmar = root.create_sub_vmar(0, 0x10000, 0, CAPS, "vmar").unwrap();
        let sub = vmar
            .create_sub_vmar(0, 0x4000, 0, VmarFlags::SPECIFIC | CAPS, "sub")
            .unwrap();
        assert_eq!(sub.flags(), CAPS);
        let vmo = VmObjectPaged::create(pmm, PmmAllocFlags::empty(), 0x4000).unwrap();
        let m = sub
            .create_vm_mapping(0, 0x4000, 0, VmarFlags::SPECIFIC, vmo.clone(), 0, RW, "m")
            .unwrap();
        m.map_range(0, 0x4000, true).unwrap();

        assert_eq!(
            vmar.create_sub_vmar(0x2000, 0x2000, 0, VmarFlags::SPECIFIC, "clash").err(),
            Some(VmError::NoMemory)
        );
        let over = vmar
            .create_sub_vmar(0x2000, 0x2000, 0, VmarFlags::SPECIFIC_OVERWRITE, "over")
            .unwrap();
        assert_eq!(over.base(), vmar.base() + 0x2000);

        // The old sub-region keeps its head, minus the overwritten range.
        assert!(sub.is_alive());
        assert_eq!((sub.base(), sub.size()), (vmar.base(), 0x2000));
        assert_eq!(m.size(), 0x2000);
        assert_eq!(arch.mapping_count(), 2);
        assert_eq!(arch.query(vmar.base() + 0x2000), Err(VmError::NotFound));
        assert_eq!(arch.query(vmar.base() + 0x3000), Err(VmError::NotFound));
        assert!(arch.query(vmar.base() + PG).is_ok());
        assert_eq!(
            vmar.find_region(vmar.base() + 0x2000).map(|n| n.name() == "over"),
            Some(true)
        );
        assert_disjoint(&vmar);

        // Overwriting the head moves the base of what is left.
        let head = vmar
            .create_sub_vmar(0, PG, 0, VmarFlags::SPECIFIC_OVERWRITE, "head")
            .unwrap();
        assert_eq!((sub.base(), sub.size()), (vmar.base() + PG, PG));
        assert_eq!(m.base(), vmar.base() + PG);
        assert_eq!(m.object_offset(), PG as u64);
        assert_eq!(head.base(), vmar.base());
        assert_eq!(
            vmar.find_region(vmar.base() + PG).and_then(|n| n.as_vm_address_region()).map(|r| r.id()),
            Some(sub.id())
        );
        assert_disjoint(&vmar);
        assert_disjoint(&sub);
    }

    #[test]
    fn test_overwrite_inside_sub_region_fails_cleanly() {
        let (aspace, _arch, _pmm) = test_aspace(AspaceType::User, 4);
        let root = aspace.root_vmar().unwrap();
        let vmar = root.create_sub_vmar(0, 0x10000, 0, CAPS, "vmar").unwrap();
        let sub = vmar.create_sub_vmar(0, 0x4000, 0, VmarFlags::SPECIFIC, "sub").unwrap();
        assert_eq!(
            vmar.create_sub_vmar(PG, PG, 0, VmarFlags::SPECIFIC_OVERWRITE, "mid").err(),
            Some(VmError::InvalidArgs)
        );
        assert_eq!((sub.base(), sub.size()), (vmar.base(), 0x4000));
        // Plain unmap never trims sub-regions.
        assert_eq!(vmar.unmap(vmar.base(), PG), Err(VmError::InvalidArgs));
        assert!(sub.is_alive());
    }

    #[test]
    fn test_unmap_rules() {
        let (aspace, arch, pmm) = test_aspace(AspaceType::User, 32);
        aspace.set_aslr_enabled(false);
        let root = aspace.root_vmar().unwrap();
        let vmar = root.create_sub_vmar(0, 0x20000, 0, CAPS, "vmar").unwrap();
        let vmo = VmObjectPaged::create(pmm.clone(), PmmAllocFlags::empty(), 0x8000).unwrap();
        let m = vmar
            .create_vm_mapping(0, 0x8000, 0, VmarFlags::SPECIFIC, vmo.clone(), 0, RW, "m")
            .unwrap();
        m.map_range(0, 0x8000, true).unwrap();
        let sub = vmar.create_sub_vmar(0x10000, 0x4000, 0, VmarFlags::SPECIFIC, "sub").unwrap();

        // Partial overlap of a sub-region fails before anything changes.
        assert_eq!(vmar.unmap(vmar.base() + 0x7000, 0xa000), Err(VmError::InvalidArgs));
        assert_eq!(arch.mapping_count(), 8);
        assert_eq!(vmar.unmap(vmar.base() + 1, PG), Err(VmError::InvalidArgs));
        assert_eq!(vmar.unmap(vmar.base(), 0), Err(VmError::InvalidArgs));
        assert_eq!(vmar.unmap(vmar.base() + 0x1f000, 0x2000), Err(VmError::InvalidArgs));

        // Interior unmap splits the mapping.
        vmar.unmap(vmar.base() + 0x2000, 0x2000).unwrap();
        assert_eq!(m.size(), 0x2000);
        assert_eq!(vmo.mapping_count(), 2);
        let right = vmar.find_region(vmar.base() + 0x4000).unwrap().as_vm_mapping().unwrap();
        assert_eq!(right.object_offset(), 0x4000);
        assert_eq!(arch.mapping_count(), 6);

        // Prefix unmap moves the base of the right half.
        vmar.unmap(vmar.base() + 0x4000, PG).unwrap();
        assert_eq!(right.base(), vmar.base() + 0x5000);
        assert_eq!(right.object_offset(), 0x5000);
        assert!(vmar.find_region(vmar.base() + 0x4000).is_none());

        // Whole sub-region is destroyed by a covering unmap.
        vmar.unmap(vmar.base() + 0x5000, 0x10000).unwrap();
        assert!(!sub.is_alive());
        assert!(!right.is_alive());
        assert_eq!(vmo.mapping_count(), 1);
        assert_eq!(arch.mapping_count(), 2);
        assert_disjoint(&vmar);
    }

    #[test]
    fn test_protect_rules() {
        let (aspace, arch, pmm) = test_aspace(AspaceType::User, 16);
        let root = aspace.root_vmar().unwrap();
        let vmar = root.create_sub_vmar(0, 0x10000, 0, CAPS, "vmar").unwrap();
        let vmo = VmObjectPaged::create(pmm.clone(), PmmAllocFlags::empty(), 0x4000).unwrap();
        let a = vmar
            .create_vm_mapping(0, 0x2000, 0, VmarFlags::SPECIFIC, vmo.clone(), 0, RW, "a")
            .unwrap();
        let b = vmar
            .create_vm_mapping(0x2000, 0x2000, 0, VmarFlags::SPECIFIC, vmo.clone(), 0x2000, RW, "b")
            .unwrap();
        a.map_range(0, 0x2000, true).unwrap();
        let ro = ArchMmuFlags::PERM_READ | ArchMmuFlags::PERM_USER;

        // Spanning two adjacent mappings works and splits the second.
        vmar.protect(vmar.base() + PG, 0x2000, ro).unwrap();
        assert_eq!(a.size(), PG);
        assert_eq!(b.arch_mmu_flags(), ro);
        assert_eq!(b.size(), PG);
        assert_eq!(vmar.children().len(), 4);
        assert_eq!(arch.query(vmar.base() + PG).unwrap().1, ro);
        assert!(arch.query(vmar.base()).unwrap().1.contains(ArchMmuFlags::PERM_WRITE));

        // Holes, sub-regions, capabilities and cache bits.
        assert_eq!(vmar.protect(vmar.base(), 0x5000, ro), Err(VmError::NotFound));
        assert_eq!(vmar.protect(vmar.base() + 0x8000, PG, ro), Err(VmError::NotFound));
        let sub = vmar.create_sub_vmar(0x4000, 0x1000, 0, VmarFlags::SPECIFIC, "sub").unwrap();
        assert_eq!(vmar.protect(vmar.base(), 0x5000, ro), Err(VmError::InvalidArgs));
        assert_eq!(
            vmar.protect(vmar.base(), PG, ro | ArchMmuFlags::PERM_EXECUTE),
            Err(VmError::AccessDenied)
        );
        assert!(sub.is_alive());
        assert_eq!(
            vmar.protect(vmar.base(), PG, ro | ArchMmuFlags::UNCACHED),
            Err(VmError::InvalidArgs)
        );

        let narrow = root.create_sub_vmar(0, 0x4000, 0, VmarFlags::CAN_MAP_READ, "narrow").unwrap();
        let m = narrow
            .create_vm_mapping(0, PG, 0, VmarFlags::empty(), vmo, 0, ArchMmuFlags::PERM_READ, "n")
            .unwrap();
        assert_eq!(
            narrow.protect(m.base(), PG, ArchMmuFlags::PERM_READ | ArchMmuFlags::PERM_WRITE),
            Err(VmError::AccessDenied)
        );
    }

    #[test]
    fn test_destroy_subtree() {
        let (aspace, arch, pmm) = test_aspace(AspaceType::User, 16);
        let root = aspace.root_vmar().unwrap();
        let outer = root.create_sub_vmar(0, 0x20000, 0, CAPS, "outer").unwrap();
        let inner = outer.create_sub_vmar(0, 0x8000, 0, CAPS, "inner").unwrap();
        let vmo = VmObjectPaged::create(pmm.clone(), PmmAllocFlags::empty(), 0x2000).unwrap();
        let m = inner
            .create_vm_mapping(0, 0x2000, 0, VmarFlags::empty(), vmo.clone(), 0, RW, "m")
            .unwrap();
        m.map_range(0, 0x2000, true).unwrap();
        assert_eq!(outer.allocated_pages(), 2);

        outer.destroy().unwrap();
        assert!(!outer.is_alive() && !inner.is_alive() && !m.is_alive());
        assert_eq!(arch.mapping_count(), 0);
        assert_eq!(vmo.mapping_count(), 0);
        assert!(root.children().is_empty());
        assert_eq!(outer.destroy(), Err(VmError::BadState));
        assert_eq!(
            outer.create_sub_vmar(0, PG, 0, VmarFlags::empty(), "late").err(),
            Some(VmError::BadState)
        );
        assert_eq!(outer.unmap(outer.base(), PG), Err(VmError::BadState));
    }

    #[test]
    fn test_fault_routing_through_nested_regions() {
        let (aspace, arch, pmm) = test_aspace(AspaceType::User, 16);
        let root = aspace.root_vmar().unwrap();
        let outer = root.create_sub_vmar(0, 0x20000, 0, CAPS, "outer").unwrap();
        let inner = outer
            .create_sub_vmar(0, 0x8000, 0, CAPS | VmarFlags::COMPACT, "inner")
            .unwrap();
        let vmo = VmObjectPaged::create(pmm, PmmAllocFlags::empty(), 0x2000).unwrap();
        let m = inner
            .create_vm_mapping(0, 0x2000, 0, VmarFlags::empty(), vmo, 0, RW, "m")
            .unwrap();
        let fault = PageFaultFlags::HW_FAULT | PageFaultFlags::WRITE | PageFaultFlags::USER;
        aspace.page_fault(m.base() + PG, fault).unwrap();
        assert!(arch.query(m.base() + PG).is_ok());
        assert_eq!(
            aspace.page_fault(inner.base() + 0x4000, fault),
            Err(VmError::NotFound)
        );
    }

    #[test]
    fn test_dump_lists_children() {
        let (aspace, _arch, _pmm) = test_aspace(AspaceType::User, 4);
        let root = aspace.root_vmar().unwrap();
        root.create_sub_vmar(0, PG, 0, VmarFlags::empty(), "child").unwrap();
        let mut out = String::new();
        root.dump(&mut out, 0, false).unwrap();
        assert!(out.starts_with("vmar "));
        assert!(out.contains("'root'"));
        assert!(out.contains("  vmar "));
        assert!(out.contains("'child'"));
    }
}
