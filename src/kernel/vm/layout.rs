// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Virtual Address Layout
//!
//! Page geometry and the fixed virtual ranges handed to each kind of address
//! space.
//!
//! # Design Principles
//!
//! 1. **User space in low half, kernel in high half**
//! 2. **Low kernel aspace** - a kernel-owned aspace that spans the user range,
//!    used for kernel work that needs user-style addresses
//! 3. **Canonical addressing** - ranges stay inside the 48-bit canonical halves

pub use crate::rustux::types::VAddr;

/// Page size (4KB is standard across all architectures)
pub const PAGE_SIZE: usize = 4096;

/// Page size shift for quick division/multiplication
pub const PAGE_SIZE_SHIFT: u8 = 12;

/// Mask for page-aligned addresses
pub const PAGE_MASK: usize = PAGE_SIZE - 1;

/// ============================================================================
/// Address Space Ranges
/// ============================================================================

/// Base of user space (the first 16MB stay unmapped to catch null derefs)
pub const USER_ASPACE_BASE: VAddr = 0x0000_0000_0100_0000;

/// Size of user space (up to 16MB below the canonical hole)
pub const USER_ASPACE_SIZE: usize = 0x0000_7fff_fe00_0000;

/// Base of kernel space
pub const KERNEL_ASPACE_BASE: VAddr = 0xffff_ff80_0000_0000;

/// Size of kernel space (512 GB)
pub const KERNEL_ASPACE_SIZE: usize = 0x0000_0080_0000_0000;

/// Base of the low kernel aspace
pub const LOW_KERNEL_ASPACE_BASE: VAddr = 0;

/// Size of the low kernel aspace, covering the whole user range
pub const LOW_KERNEL_ASPACE_SIZE: usize = USER_ASPACE_BASE + USER_ASPACE_SIZE;

/// ============================================================================
/// Alignment Helpers
/// ============================================================================

/// Align an address down to page boundary
#[inline]
pub const fn page_align_down(addr: usize) -> usize {
    addr & !PAGE_MASK
}

/// Align an address up to page boundary
///
/// Wraps on overflow; use [`checked_page_align_up`] for untrusted sizes.
#[inline]
pub const fn page_align_up(addr: usize) -> usize {
    addr.wrapping_add(PAGE_MASK) & !PAGE_MASK
}

/// Align an address up to page boundary, `None` on overflow
#[inline]
pub const fn checked_page_align_up(addr: usize) -> Option<usize> {
    match addr.checked_add(PAGE_MASK) {
        Some(v) => Some(v & !PAGE_MASK),
        None => None,
    }
}

/// Check if an address is page-aligned
#[inline]
pub const fn is_page_aligned(addr: usize) -> bool {
    (addr & PAGE_MASK) == 0
}

/// Round `value` down to a power-of-two `align`
#[inline]
pub const fn round_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Round `value` up to a power-of-two `align`, `None` on overflow
#[inline]
pub const fn checked_round_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// ============================================================================
/// Range Classification
/// ============================================================================

/// Check if a virtual address lies in the kernel aspace
#[inline]
pub const fn is_kernel_address(va: VAddr) -> bool {
    va >= KERNEL_ASPACE_BASE && va - KERNEL_ASPACE_BASE < KERNEL_ASPACE_SIZE
}

/// Check if a virtual address lies in the user aspace
#[inline]
pub const fn is_user_address(va: VAddr) -> bool {
    va >= USER_ASPACE_BASE && va - USER_ASPACE_BASE < USER_ASPACE_SIZE
}

/// Check if `[va, va + len)` lies entirely in the user aspace
#[inline]
pub fn is_user_address_range(va: VAddr, len: usize) -> bool {
    if len == 0 {
        return is_user_address(va) || va == USER_ASPACE_BASE + USER_ASPACE_SIZE;
    }
    match va.checked_add(len - 1) {
        Some(last) => is_user_address(va) && is_user_address(last),
        None => false,
    }
}

/// Check if `[base, base + size)` lies entirely inside `[outer_base, outer_base + outer_size)`
#[inline]
pub fn is_in_range(base: VAddr, size: usize, outer_base: VAddr, outer_size: usize) -> bool {
    if base < outer_base {
        return false;
    }
    let offset = base - outer_base;
    offset < outer_size && outer_size - offset >= size
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rounding() {
        assert_eq!(round_down(0x12345, 0x1000), 0x12000);
        assert_eq!(checked_round_up(0x12345, 0x1000), Some(0x13000));
        assert_eq!(checked_round_up(usize::MAX, 0x1000), None);
        assert_eq!(checked_page_align_up(usize::MAX - 1), None);
        assert_eq!(checked_page_align_up(0x1001), Some(0x2000));
    }

    #[test]
    fn test_ranges_do_not_overlap() {
        assert!(is_user_address(USER_ASPACE_BASE));
        assert!(!is_user_address(USER_ASPACE_BASE - 1));
        assert!(!is_user_address(KERNEL_ASPACE_BASE));
        assert!(is_kernel_address(KERNEL_ASPACE_BASE));
        assert!(is_kernel_address(usize::MAX));
        assert!(!is_kernel_address(USER_ASPACE_BASE));
    }

    #[test]
    fn test_user_range_checks() {
        assert!(is_user_address_range(USER_ASPACE_BASE, PAGE_SIZE));
        assert!(!is_user_address_range(USER_ASPACE_BASE - PAGE_SIZE, 2 * PAGE_SIZE));
        assert!(!is_user_address_range(USER_ASPACE_BASE, usize::MAX));
    }

    #[test]
    fn test_is_in_range() {
        assert!(is_in_range(0x1000, 0x1000, 0x1000, 0x2000));
        assert!(is_in_range(0x2000, 0x1000, 0x1000, 0x2000));
        assert!(!is_in_range(0x2000, 0x2000, 0x1000, 0x2000));
        assert!(!is_in_range(0x0, 0x1000, 0x1000, 0x2000));
        assert!(!is_in_range(0x3000, 0, 0x1000, 0x2000));
    }
}
