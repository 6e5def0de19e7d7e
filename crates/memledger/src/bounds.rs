//! Containment checks for derived pointers.
//!
//! Read-only queries against the registry: given a pointer that claims to
//! belong to a tracked base allocation, confirm it (or a whole range) lies
//! within the base's recorded extent. Violations abort the process; a check
//! that returns has no observable effect.

use crate::fatal;
use crate::registry::{CallSite, Registry};

/// Abort unless `ptr` lies within the tracked extent of `base`.
pub(crate) fn check(registry: &Registry, ptr: *const u8, base: *const u8, site: CallSite) {
    let Some(size) = registry.size_of(base as usize) else {
        fatal(format_args!(
            "checking pointer {ptr:p} at {site}: base {base:p} is not tracked"
        ));
    };
    let (ptr, base) = (ptr as usize, base as usize);

    if ptr < base {
        fatal(format_args!(
            "checking pointer {ptr:#x} at {site}: it lies below base {base:#x}"
        ));
    }
    if ptr >= base + size {
        fatal(format_args!(
            "checking pointer {ptr:#x} at {site}: offset {} is past the end of base {base:#x} \
             of length {size}",
            ptr - base
        ));
    }
}

/// Abort unless the whole range `[ptr, ptr + len)` lies within the tracked
/// extent of `base`.
///
/// The range's start must satisfy the same conditions as [`check`]; on top of
/// that the range's end may not run past the end of the base allocation, even
/// when the start alone is a valid offset.
pub(crate) fn check_range(
    registry: &Registry,
    ptr: *const u8,
    len: usize,
    base: *const u8,
    site: CallSite,
) {
    let Some(size) = registry.size_of(base as usize) else {
        fatal(format_args!(
            "checking range {ptr:p} + {len} at {site}: base {base:p} is not tracked"
        ));
    };
    let (ptr, base) = (ptr as usize, base as usize);
    let end = base + size;

    if ptr < base {
        fatal(format_args!(
            "checking range start {ptr:#x} at {site}: it lies below base {base:#x}"
        ));
    }
    if ptr >= end {
        fatal(format_args!(
            "checking range {ptr:#x} + {len} at {site}: start offset {} is past the end of \
             base {base:#x} of length {size}",
            ptr - base
        ));
    }
    match ptr.checked_add(len) {
        Some(range_end) if range_end <= end => {}
        Some(range_end) => fatal(format_args!(
            "checking range {ptr:#x} + {len} at {site}: end overshoots base {base:#x} of \
             length {size} by {} bytes",
            range_end - end
        )),
        None => fatal(format_args!(
            "checking range {ptr:#x} + {len} at {site}: length overflows the address space"
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site() -> CallSite {
        CallSite::new("bounds_test.rs", 1)
    }

    // Only non-aborting paths are exercised here; the violations terminate
    // the process and are covered by the scenario driver tests.

    #[test]
    fn every_interior_offset_passes() {
        let registry = Registry::new();
        let base = 0x1000usize as *const u8;
        registry.register(base as usize, 64, site(), "block".into());

        for offset in 0usize..64 {
            check(&registry, (0x1000 + offset) as *const u8, base, site());
        }
    }

    #[test]
    fn range_reaching_exactly_the_end_passes() {
        let registry = Registry::new();
        let base = 0x1000usize as *const u8;
        registry.register(base as usize, 64, site(), "block".into());

        check_range(&registry, base, 64, base, site());
        check_range(&registry, (0x1000usize + 16) as *const u8, 48, base, site());
        check_range(&registry, (0x1000usize + 63) as *const u8, 1, base, site());
    }
}
