// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Rustux Virtual Memory Core
//!
//! The kernel virtual-memory subsystem of the Rustux microkernel, built as a
//! standalone `no_std` library:
//!
//! - [`kernel::vm::pmm`] - physical page allocator (arenas + free lists)
//! - [`kernel::vm::vm_object_paged`] / [`kernel::vm::vm_object_physical`] -
//!   memory objects, including copy-on-write clones
//! - [`kernel::vm::vm_address_region`] - the per-aspace region tree
//! - [`kernel::vm::vm_mapping`] - VMO-backed leaves of the region tree
//! - [`kernel::vm::aspace`] - address spaces and page-fault dispatch
//!
//! The hardware MMU is reached only through the
//! [`kernel::vm::arch_vm_aspace::ArchVmAspace`] capability trait.

#![no_std]

extern crate alloc;

#[cfg(test)]
extern crate std;

#[macro_use]
pub mod trace;

pub mod kernel;
pub mod rand;
pub mod rustux;

pub use kernel::vm::{Result, VmError};
