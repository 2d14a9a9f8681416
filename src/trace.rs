// Copyright 2025 The Rustux Authors
//
// Use of this source code is governed by a MIT-style
// license that can be found in the LICENSE file or at
// https://opensource.org/licenses/MIT

//! Kernel Trace Support
//!
//! Local trace macros layered over the `log` facade. Local tracing is very
//! verbose (one line per page on some paths) and is compiled in only with the
//! `local-trace` feature.

/// Local function trace
///
/// Expands to `log::trace!` when the `local-trace` feature is enabled and to
/// nothing otherwise. The arguments are still type-checked in both cases.
#[macro_export]
macro_rules! ltracef {
    ($($arg:tt)*) => {
        if cfg!(feature = "local-trace") {
            log::trace!($($arg)*);
        }
    };
}

/// Function entry trace
#[macro_export]
macro_rules! ltrace_entry {
    () => {
        $crate::ltracef!("{}: entry", core::module_path!());
    };
}
