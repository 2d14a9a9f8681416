// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Rustux Microkernel - Core Kernel Module
//!
//! The parts of the kernel the virtual memory core is built from, plus the
//! two thin collaborators it talks to (threads and user copies).

pub mod thread;
pub mod usercopy;
pub mod vm;
