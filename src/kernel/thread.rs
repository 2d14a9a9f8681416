// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Thread Management
//!
//! The slice of a thread the VM core needs: its scheduling state and the
//! address space it runs in. Both live under the thread lock.
//!
//! # Thread States
//!
//! ```text
//! New -> Ready -> Running -> Blocked -> Ready -> Running
//!                 |           |                      |
//!                 v           v                      v
//!               Dying -------> Dead <-----------------
//! ```

use alloc::string::String;
use alloc::sync::Arc;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::{Mutex, MutexGuard};

use crate::kernel::vm::VmAspace;

/// Thread ID type
pub type ThreadId = u64;

/// Invalid thread ID
pub const TID_INVALID: ThreadId = 0;

static NEXT_TID: AtomicU64 = AtomicU64::new(1);

/// Thread state
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThreadState {
    /// Thread has been created but not yet started
    New = 0,

    /// Thread is ready to run (in run queue)
    Ready = 1,

    /// Thread is currently running on a CPU
    Running = 2,

    /// Thread is blocked (waiting for I/O, mutex, etc.)
    Blocked = 3,

    /// Thread is dying (being terminated)
    Dying = 4,

    /// Thread is dead (terminated and cleaned up)
    Dead = 5,
}

/// State guarded by the thread lock
pub struct ThreadInner {
    /// Scheduling state
    pub state: ThreadState,

    /// Address space the thread runs in, `None` for kernel-only threads
    pub aspace: Option<Arc<VmAspace>>,
}

/// Thread control block
pub struct Thread {
    tid: ThreadId,
    name: String,
    inner: Mutex<ThreadInner>,
}

impl Thread {
    /// Create a new thread in the `New` state
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            tid: NEXT_TID.fetch_add(1, Ordering::Relaxed),
            name: String::from(name),
            inner: Mutex::new(ThreadInner {
                state: ThreadState::New,
                aspace: None,
            }),
        })
    }

    /// Get thread ID
    pub fn tid(&self) -> ThreadId {
        self.tid
    }

    /// Get thread name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Get thread state
    pub fn state(&self) -> ThreadState {
        self.inner.lock().state
    }

    /// Set thread state
    pub fn set_state(&self, new_state: ThreadState) {
        self.inner.lock().state = new_state;
    }

    /// Address space the thread is attached to
    pub fn aspace(&self) -> Option<Arc<VmAspace>> {
        self.inner.lock().aspace.clone()
    }

    /// Take the thread lock
    pub fn lock(&self) -> MutexGuard<'_, ThreadInner> {
        self.inner.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_thread_ids_are_unique() {
        let a = Thread::new("a");
        let b = Thread::new("b");
        assert_ne!(a.tid(), b.tid());
        assert_ne!(a.tid(), TID_INVALID);
        assert_eq!(b.name(), "b");
    }

    #[test]
    fn test_thread_state() {
        let t = Thread::new("t");
        assert_eq!(t.state(), ThreadState::New);
        t.set_state(ThreadState::Running);
        assert_eq!(t.state(), ThreadState::Running);
        assert!(t.aspace().is_none());
    }
}
