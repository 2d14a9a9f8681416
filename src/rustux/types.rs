// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Common type aliases used throughout the kernel

/// Virtual address type
pub type VAddr = usize;

/// Physical address type
pub type PAddr = usize;

/// Error code type (negative values indicate errors)
pub type Status = i32;

/// Common status codes
pub mod status {
    use super::Status;

    pub const OK: Status = 0;
    pub const ERR_INVALID_ARGS: Status = -2;
    pub const ERR_BAD_STATE: Status = -4;
    pub const ERR_NOT_SUPPORTED: Status = -5;
    pub const ERR_NO_MEMORY: Status = -6;
    pub const ERR_NOT_FOUND: Status = -8;
    pub const ERR_ALREADY_EXISTS: Status = -9;
    pub const ERR_ACCESS_DENIED: Status = -10;
    pub const ERR_OUT_OF_RANGE: Status = -17;
}
