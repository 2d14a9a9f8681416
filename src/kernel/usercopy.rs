// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! User/Kernel Boundary Safety
//!
//! This module provides safe copying between user and kernel space.
//! All user pointers must be validated before access to prevent
//! kernel memory corruption and information leaks.
//!
//! # Design
//!
//! - **Validation first**: every copy checks that the whole user range lies in
//!   the user aspace before touching it
//! - **Direction in the type**: [`UserInPtr`] can only be read from and
//!   [`UserOutPtr`] can only be written to
//! - **Faults are recoverable**: a copy that faults on an unmapped user page is
//!   resolved by the fault path with [`PageFaultFlags::USER_COPY`] set
//!
//! [`PageFaultFlags::USER_COPY`]: crate::kernel::vm::PageFaultFlags::USER_COPY

use core::marker::PhantomData;
use core::mem::size_of;

use crate::kernel::vm::layout::is_user_address_range;
use crate::kernel::vm::{Result, VmError};
use crate::rustux::types::VAddr;

/// ============================================================================
/// User Pointer Types
/// ============================================================================

/// User pointer to data the kernel reads
#[repr(transparent)]
#[derive(Debug)]
pub struct UserInPtr<T> {
    addr: VAddr,
    _phantom: PhantomData<*const T>,
}

/// User pointer to data the kernel writes
#[repr(transparent)]
#[derive(Debug)]
pub struct UserOutPtr<T> {
    addr: VAddr,
    _phantom: PhantomData<*mut T>,
}

impl<T> Clone for UserInPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for UserInPtr<T> {}

impl<T> Clone for UserOutPtr<T> {
    fn clone(&self) -> Self {
        *self
    }
}
impl<T> Copy for UserOutPtr<T> {}

/// Validate `count` elements of `T` at `addr`, returning the byte length
fn validate<T>(addr: VAddr, count: usize) -> Result<usize> {
    if addr == 0 {
        return Err(VmError::InvalidArgs);
    }
    let len = count
        .checked_mul(size_of::<T>())
        .ok_or(VmError::InvalidArgs)?;
    if !is_user_address_range(addr, len) {
        log::debug!("usercopy: range not in user space {:#x}+{:#x}", addr, len);
        return Err(VmError::InvalidArgs);
    }
    Ok(len)
}

impl<T> UserInPtr<T> {
    /// Create a new user pointer from a raw address
    pub const fn new(addr: VAddr) -> Self {
        Self {
            addr,
            _phantom: PhantomData,
        }
    }

    /// Get the raw address
    pub const fn addr(&self) -> VAddr {
        self.addr
    }

    /// Check if the pointer is null
    pub const fn is_null(&self) -> bool {
        self.addr == 0
    }

    /// Pointer `bytes` further into the user buffer
    pub fn byte_add(&self, bytes: usize) -> Result<Self> {
        let addr = self.addr.checked_add(bytes).ok_or(VmError::InvalidArgs)?;
        Ok(Self::new(addr))
    }

    /// Check that `count` elements can be read
    pub fn validate(&self, count: usize) -> Result {
        validate::<T>(self.addr, count).map(|_| ())
    }
}

impl<T: Copy> UserInPtr<T> {
    /// Copy one value in from user space
    pub fn read(&self) -> Result<T> {
        validate::<T>(self.addr, 1)?;
        // SAFETY: the range lies in the user aspace; faults on it are resolved
        // by the user-copy fault path.
        Ok(unsafe { core::ptr::read_unaligned(self.addr as *const T) })
    }

    /// Copy `dst.len()` values in from user space
    pub fn copy_array_from_user(&self, dst: &mut [T]) -> Result {
        validate::<T>(self.addr, dst.len())?;
        // SAFETY: as for `read`; `dst` is kernel memory and cannot overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(self.addr as *const T, dst.as_mut_ptr(), dst.len())
        };
        ltracef!("copy_from_user: src={:#x} count={}", self.addr, dst.len());
        Ok(())
    }
}

impl<T> UserOutPtr<T> {
    /// Create a new user pointer from a raw address
    pub const fn new(addr: VAddr) -> Self {
        Self {
            addr,
            _phantom: PhantomData,
        }
    }

    /// Get the raw address
    pub const fn addr(&self) -> VAddr {
        self.addr
    }

    /// Check if the pointer is null
    pub const fn is_null(&self) -> bool {
        self.addr == 0
    }

    /// Pointer `bytes` further into the user buffer
    pub fn byte_add(&self, bytes: usize) -> Result<Self> {
        let addr = self.addr.checked_add(bytes).ok_or(VmError::InvalidArgs)?;
        Ok(Self::new(addr))
    }

    /// Check that `count` elements can be written
    pub fn validate(&self, count: usize) -> Result {
        validate::<T>(self.addr, count).map(|_| ())
    }
}

impl<T: Copy> UserOutPtr<T> {
    /// Copy one value out to user space
    pub fn write(&self, value: T) -> Result {
        validate::<T>(self.addr, 1)?;
        // SAFETY: the range lies in the user aspace; faults on it are resolved
        // by the user-copy fault path.
        unsafe { core::ptr::write_unaligned(self.addr as *mut T, value) };
        Ok(())
    }

    /// Copy `src.len()` values out to user space
    pub fn copy_array_to_user(&self, src: &[T]) -> Result {
        validate::<T>(self.addr, src.len())?;
        // SAFETY: as for `write`; `src` is kernel memory and cannot overlap.
        unsafe { core::ptr::copy_nonoverlapping(src.as_ptr(), self.addr as *mut T, src.len()) };
        ltracef!("copy_to_user: dst={:#x} count={}", self.addr, src.len());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernel::vm::layout::{KERNEL_ASPACE_BASE, USER_ASPACE_BASE};
    use alloc::vec;

    #[test]
    fn test_validation_rejects_bad_ranges() {
        assert_eq!(UserInPtr::<u8>::new(0).validate(1), Err(VmError::InvalidArgs));
        assert_eq!(
            UserInPtr::<u8>::new(KERNEL_ASPACE_BASE).validate(1),
            Err(VmError::InvalidArgs)
        );
        assert_eq!(
            UserOutPtr::<u64>::new(USER_ASPACE_BASE).validate(usize::MAX / 4),
            Err(VmError::InvalidArgs)
        );
        assert!(UserOutPtr::<u8>::new(USER_ASPACE_BASE).validate(4096).is_ok());
        assert!(UserInPtr::<u8>::new(usize::MAX).byte_add(1).is_err());
    }

    #[test]
    fn test_copy_roundtrip_through_host_buffer() {
        // Host heap addresses fall inside the user range.
        let mut user = vec![0u8; 16];
        let addr = user.as_mut_ptr() as VAddr;
        if !is_user_address_range(addr, user.len()) {
            return;
        }
        UserOutPtr::<u8>::new(addr)
            .byte_add(4)
            .unwrap()
            .copy_array_to_user(b"abcd")
            .unwrap();
        let mut back = [0u8; 4];
        UserInPtr::<u8>::new(addr + 4)
            .copy_array_from_user(&mut back)
            .unwrap();
        assert_eq!(&back, b"abcd");
        assert_eq!(&user[4..8], b"abcd");
    }
}
