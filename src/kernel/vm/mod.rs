// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Virtual Memory Subsystem
//!
//! This module provides the architecture-agnostic virtual memory core of the
//! Rustux kernel.
//!
//! # Organization
//!
//! - [`pmm`] - Physical page allocator (arenas, free lists, physmap)
//! - [`vm_object`] - The memory object interface shared by all VMO kinds
//! - [`vm_object_paged`] - Demand-paged, resizable, clonable VMOs
//! - [`vm_object_physical`] - VMOs over a fixed physical range
//! - [`vm_address_region`] - Hierarchical region tree (VMARs)
//! - [`vm_mapping`] - Leaf regions binding a virtual range to a VMO
//! - [`aspace`] - Address spaces, fault dispatch, the global aspace list
//! - [`arch_vm_aspace`] - MMU capability interface consumed by the core
//!
//! # Control flow
//!
//! ```text
//! fault / map call
//!   -> VmAspace (aspace lock)
//!     -> VmAddressRegion tree walk
//!       -> VmMapping (permission checks)
//!         -> VmObject::fault_page (VMO lock; allocate / zero / COW via PMM)
//!           -> ArchVmAspace::map / protect (translation install)
//! ```
//!
//! # Lock ordering
//!
//! Outermost first: aspace lock, VMO page locks (clone before parent), VMO
//! registry locks (parent before clone), region-node state locks (parent
//! before child), then the architecture aspace and PMM locks as leaves. Every
//! operation that walks the region tree takes an [`aspace::AspaceLocked`]
//! token, which can only be obtained by holding the aspace lock.

use core::fmt;

pub mod arch_vm_aspace;
pub mod aspace;
pub mod fault;
pub mod layout;
pub mod pmm;
pub mod stats;
pub mod vm_address_region;
pub mod vm_mapping;
pub mod vm_object;
pub mod vm_object_paged;
pub mod vm_object_physical;

pub use crate::rustux::types::{PAddr, VAddr};

pub use layout::{
    is_page_aligned, page_align_down, page_align_up, PAGE_MASK, PAGE_SIZE, PAGE_SIZE_SHIFT,
};

pub use arch_vm_aspace::{ArchMmuFlags, ArchVmAspace, SoftArchVmAspace};
pub use aspace::{AspaceType, VmAspace};
pub use fault::PageFaultFlags;
pub use pmm::{ArenaInfo, PageState, PhysicalMemoryManager, PmmAllocFlags};
pub use vm_address_region::{VmAddressRegion, VmAddressRegionOrMapping, VmarFlags};
pub use vm_mapping::VmMapping;
pub use vm_object::{VmObject, VmObjectRef};
pub use vm_object_paged::VmObjectPaged;
pub use vm_object_physical::VmObjectPhysical;

use crate::rustux::types::status;

/// Virtual memory errors
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    /// Misaligned or zero-length range, bad flag combination, privilege
    /// escalation, partial overlap of a sub-region
    InvalidArgs = status::ERR_INVALID_ARGS,

    /// No free physical page/run, or bookkeeping allocation failed
    NoMemory = status::ERR_NO_MEMORY,

    /// Address not mapped, range not fully covered, page absent
    NotFound = status::ERR_NOT_FOUND,

    /// Offset or size beyond an object, or arithmetic overflow
    OutOfRange = status::ERR_OUT_OF_RANGE,

    /// Permission or capability mismatch
    AccessDenied = status::ERR_ACCESS_DENIED,

    /// Operation on a dead or not-yet-activated object
    BadState = status::ERR_BAD_STATE,

    /// Operation not implemented for this object
    NotSupported = status::ERR_NOT_SUPPORTED,

    /// A translation is already installed at the address
    AlreadyExists = status::ERR_ALREADY_EXISTS,
}

impl VmError {
    /// Convert to raw status code
    pub const fn as_raw(self) -> i32 {
        self as i32
    }

    /// Short name of the status, as printed in traces
    pub const fn name(self) -> &'static str {
        match self {
            VmError::InvalidArgs => "ERR_INVALID_ARGS",
            VmError::NoMemory => "ERR_NO_MEMORY",
            VmError::NotFound => "ERR_NOT_FOUND",
            VmError::OutOfRange => "ERR_OUT_OF_RANGE",
            VmError::AccessDenied => "ERR_ACCESS_DENIED",
            VmError::BadState => "ERR_BAD_STATE",
            VmError::NotSupported => "ERR_NOT_SUPPORTED",
            VmError::AlreadyExists => "ERR_ALREADY_EXISTS",
        }
    }
}

impl fmt::Display for VmError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.name(), self.as_raw())
    }
}

/// Result type for VM operations
pub type Result<T = ()> = core::result::Result<T, VmError>;

/// Calculate number of pages needed for a given size
pub const fn bytes_to_pages(size: usize) -> usize {
    (size + PAGE_SIZE - 1) / PAGE_SIZE
}

/// Convert page count to bytes
pub const fn pages_to_bytes(pages: usize) -> usize {
    pages * PAGE_SIZE
}
