// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Page Fault Flags
//!
//! Flags describing a page fault as it travels from the trap handler through
//! the address space, the region tree and finally the memory object.
//!
//! # Page Fault Handling Flow
//!
//! ```text
//! 1. Page fault occurs (HW_FAULT) or the kernel pre-faults a range (SW_FAULT)
//! 2. VmAspace looks up the region for the fault address
//! 3. VmMapping checks the access against its permissions
//! 4. The VMO supplies a page (zero page, COW copy or fresh allocation)
//! 5. The translation is installed
//! ```
//!
//! A VMO only allocates when one of [`PageFaultFlags::FAULT_MASK`] is set. A
//! lookup with neither bit set reports absent pages as `NotFound`.

use core::fmt;

use bitflags::bitflags;

use crate::rustux::types::VAddr;

bitflags! {
    /// Page fault flags
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub struct PageFaultFlags: u32 {
        /// Page fault was caused by a write operation
        const WRITE = 0x01;
        /// Page fault was caused by a user mode access
        const USER = 0x02;
        /// Page fault was caused by an instruction fetch
        const INSTRUCTION = 0x04;
        /// Page fault was caused by a non-present page
        const NOT_PRESENT = 0x08;
        /// Kernel access to user memory on behalf of a user copy
        const USER_COPY = 0x10;
        /// Fault raised by the hardware
        const HW_FAULT = 0x20;
        /// Fault raised by software (pre-faulting, commit)
        const SW_FAULT = 0x40;

        /// Any fault that may allocate pages
        const FAULT_MASK = Self::HW_FAULT.bits() | Self::SW_FAULT.bits();
    }
}

impl PageFaultFlags {
    /// Check if fault was caused by write
    pub fn is_write(self) -> bool {
        self.contains(Self::WRITE)
    }

    /// Check if fault may allocate pages
    pub fn may_allocate(self) -> bool {
        self.intersects(Self::FAULT_MASK)
    }
}

/// Page fault information
#[derive(Debug, Clone, Copy)]
pub struct PageFaultInfo {
    /// Faulting virtual address
    pub addr: VAddr,

    /// Fault flags
    pub flags: PageFaultFlags,
}

impl PageFaultInfo {
    /// Create new page fault info
    pub fn new(addr: VAddr, flags: PageFaultFlags) -> Self {
        Self { addr, flags }
    }
}

impl fmt::Display for PageFaultInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let fl = self.flags;
        write!(
            f,
            "{:#x} {}{}{}{}{}",
            self.addr,
            if fl.contains(PageFaultFlags::WRITE) { 'w' } else { 'r' },
            if fl.contains(PageFaultFlags::USER) { 'u' } else { 's' },
            if fl.contains(PageFaultFlags::INSTRUCTION) { 'i' } else { 'd' },
            if fl.contains(PageFaultFlags::NOT_PRESENT) { 'n' } else { 'p' },
            if fl.contains(PageFaultFlags::SW_FAULT) { " sw" } else { "" },
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use alloc::format;

    #[test]
    fn test_fault_mask() {
        assert!(PageFaultFlags::HW_FAULT.may_allocate());
        assert!((PageFaultFlags::SW_FAULT | PageFaultFlags::WRITE).may_allocate());
        assert!(!PageFaultFlags::WRITE.may_allocate());
        let parent = (PageFaultFlags::HW_FAULT | PageFaultFlags::WRITE) - PageFaultFlags::FAULT_MASK;
        assert_eq!(parent, PageFaultFlags::WRITE);
    }

    #[test]
    fn test_display() {
        let info = PageFaultInfo::new(
            0x1000,
            PageFaultFlags::WRITE | PageFaultFlags::USER | PageFaultFlags::NOT_PRESENT,
        );
        assert_eq!(format!("{}", info), "0x1000 wudn");
    }
}
