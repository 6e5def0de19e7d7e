//! Allocation accounting for manually managed memory.
//!
//! Route native-heap allocations through a [`Ledger`] and every live block
//! carries its call site, size and a human-readable annotation. Double
//! frees, resizes of unknown addresses and out-of-bounds derived pointers
//! abort the process with a diagnostic; blocks still tracked at exit are
//! printed as a leak report.
//!
//! ```no_run
//! use std::sync::LazyLock;
//! use memledger::{ledger_alloc, ledger_free, Ledger};
//!
//! static LEDGER: LazyLock<Ledger> = LazyLock::new(Ledger::default);
//!
//! #[memledger::main(LEDGER)]
//! fn main() {
//!     let rows: usize = 4;
//!     let p = ledger_alloc!(LEDGER, rows * 16, "table of {rows} rows");
//!     // ... use p ...
//!     unsafe { ledger_free!(LEDGER, p) };
//! }
//! ```
//!
//! Instrumentation is opt-in twice over: only pointers explicitly routed
//! through a ledger are tracked, and with the `ledger` cargo feature
//! disabled the macros below compile down to the bare native primitives.

pub use memledger_macros::main;

mod bounds;
mod ledger;
mod oplog;
pub mod output;
mod registry;

pub use ledger::{Ledger, LedgerConfig, ShutdownGuard};
pub use output::{JsonPrettyReporter, JsonReporter, PlainReporter, Reporter, TableReporter};
pub use registry::{AllocationRecord, CallSite, Registry};

#[doc(hidden)]
pub use libc as __libc;

use std::fmt;

/// Print one diagnostic line naming the offending operation and terminate.
/// No unwinding, no recovery: inconsistencies exist to be seen.
pub(crate) fn fatal(args: fmt::Arguments<'_>) -> ! {
    eprintln!("[memledger] aborting: {args}");
    std::process::abort()
}

/// Allocate through a [`Ledger`], capturing the call site and expanding the
/// annotation format string.
///
/// ```ignore
/// let p = ledger_alloc!(ledger, 64, "row buffer {}", row_id);
/// ```
///
/// Returns null on native allocation failure. Without the `ledger` feature
/// this is a plain `malloc` and the annotation is not evaluated.
#[cfg(feature = "ledger")]
#[macro_export]
macro_rules! ledger_alloc {
    ($ledger:expr, $size:expr, $($annotation:tt)+) => {
        $ledger.alloc(
            $size,
            $crate::CallSite::new(::std::file!(), ::std::line!()),
            ::std::format!($($annotation)+),
        )
    };
}

#[cfg(not(feature = "ledger"))]
#[macro_export]
macro_rules! ledger_alloc {
    ($ledger:expr, $size:expr, $($annotation:tt)+) => {{
        let _ = &$ledger;
        unsafe { $crate::__libc::malloc($size) as *mut u8 }
    }};
}

/// Resize a tracked block through a [`Ledger`]. Must be called from an
/// `unsafe` context: the pointer is handed to the native `realloc`.
///
/// Resizing an address the ledger never saw aborts the process. Without the
/// `ledger` feature this is a plain `realloc`.
#[cfg(feature = "ledger")]
#[macro_export]
macro_rules! ledger_realloc {
    ($ledger:expr, $ptr:expr, $size:expr) => {
        $ledger.realloc($ptr, $size, $crate::CallSite::new(::std::file!(), ::std::line!()))
    };
}

#[cfg(not(feature = "ledger"))]
#[macro_export]
macro_rules! ledger_realloc {
    ($ledger:expr, $ptr:expr, $size:expr) => {{
        let _ = &$ledger;
        $crate::__libc::realloc($ptr as *mut $crate::__libc::c_void, $size) as *mut u8
    }};
}

/// Release a tracked block through a [`Ledger`]. Must be called from an
/// `unsafe` context.
///
/// Releasing an address that is not live (freed twice, foreign, or null)
/// aborts the process. Without the `ledger` feature this is a plain `free`.
#[cfg(feature = "ledger")]
#[macro_export]
macro_rules! ledger_free {
    ($ledger:expr, $ptr:expr) => {
        $ledger.free($ptr, $crate::CallSite::new(::std::file!(), ::std::line!()))
    };
}

#[cfg(not(feature = "ledger"))]
#[macro_export]
macro_rules! ledger_free {
    ($ledger:expr, $ptr:expr) => {{
        let _ = &$ledger;
        $crate::__libc::free($ptr as *mut $crate::__libc::c_void)
    }};
}

/// Duplicate a C string through a [`Ledger`]; the copy is tracked with the
/// duplicated content as its annotation.
#[cfg(feature = "ledger")]
#[macro_export]
macro_rules! ledger_strdup {
    ($ledger:expr, $str:expr) => {
        $ledger.strdup($str, $crate::CallSite::new(::std::file!(), ::std::line!()))
    };
}

#[cfg(not(feature = "ledger"))]
#[macro_export]
macro_rules! ledger_strdup {
    ($ledger:expr, $str:expr) => {{
        let _ = &$ledger;
        let __s: &::std::ffi::CStr = $str;
        unsafe { $crate::__libc::strdup(__s.as_ptr()) }
    }};
}

/// Length-limited [`ledger_strdup!`].
#[cfg(feature = "ledger")]
#[macro_export]
macro_rules! ledger_strndup {
    ($ledger:expr, $str:expr, $limit:expr) => {
        $ledger.strndup($str, $limit, $crate::CallSite::new(::std::file!(), ::std::line!()))
    };
}

#[cfg(not(feature = "ledger"))]
#[macro_export]
macro_rules! ledger_strndup {
    ($ledger:expr, $str:expr, $limit:expr) => {{
        let _ = &$ledger;
        let __s: &::std::ffi::CStr = $str;
        unsafe { $crate::__libc::strndup(__s.as_ptr(), $limit) }
    }};
}

/// Abort unless `ptr` lies within the tracked extent of `base`. Expands to
/// nothing observable without the `ledger` feature.
#[cfg(feature = "ledger")]
#[macro_export]
macro_rules! ledger_check {
    ($ledger:expr, $ptr:expr, $base:expr) => {
        $ledger.check(
            $ptr as *const u8,
            $base as *const u8,
            $crate::CallSite::new(::std::file!(), ::std::line!()),
        )
    };
}

#[cfg(not(feature = "ledger"))]
#[macro_export]
macro_rules! ledger_check {
    ($ledger:expr, $ptr:expr, $base:expr) => {{
        let _ = (&$ledger, $ptr, $base);
    }};
}

/// Abort unless `[ptr, ptr + len)` lies within the tracked extent of `base`.
/// Expands to nothing observable without the `ledger` feature.
#[cfg(feature = "ledger")]
#[macro_export]
macro_rules! ledger_check_range {
    ($ledger:expr, $ptr:expr, $len:expr, $base:expr) => {
        $ledger.check_range(
            $ptr as *const u8,
            $len,
            $base as *const u8,
            $crate::CallSite::new(::std::file!(), ::std::line!()),
        )
    };
}

#[cfg(not(feature = "ledger"))]
#[macro_export]
macro_rules! ledger_check_range {
    ($ledger:expr, $ptr:expr, $len:expr, $base:expr) => {{
        let _ = (&$ledger, $ptr, $len, $base);
    }};
}
