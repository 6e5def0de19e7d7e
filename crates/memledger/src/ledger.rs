use std::ffi::CStr;
use std::fmt;
use std::path::{Path, PathBuf};
use std::ptr;
use std::sync::atomic::{AtomicBool, Ordering};

use eyre::Result;
use libc::{c_char, c_void};

use crate::bounds;
use crate::fatal;
use crate::oplog::OpLog;
use crate::output::{PlainReporter, Reporter};
use crate::registry::{CallSite, Registry};

/// Behavioral switches for a [`Ledger`].
///
/// Cargo features flip the defaults so a build can bake the policy in; each
/// knob can still be set per instance.
#[derive(Clone, Debug)]
pub struct LedgerConfig {
    /// Overwrite freed blocks with zero bytes before the native release.
    pub zero_on_release: bool,
    /// Log every accounting operation to this file.
    pub oplog_path: Option<PathBuf>,
}

impl Default for LedgerConfig {
    fn default() -> Self {
        Self {
            zero_on_release: cfg!(feature = "zero-on-release"),
            oplog_path: if cfg!(feature = "oplog") {
                Some(PathBuf::from("memory.log"))
            } else {
                None
            },
        }
    }
}

/// The accounting allocator: wraps the native heap primitives with registry
/// bookkeeping, so every live block carries its provenance and every misuse
/// is caught at the call that commits it.
///
/// A `Ledger` is an explicit context object: construct one per process (or
/// per test) and route allocations through it, normally via the `ledger_*!`
/// macros which capture the call site for you. There is no process-global
/// instance in this crate; programs that want one declare a `static`
/// themselves and wire the shutdown report with [`macro@crate::main`] or a
/// [`ShutdownGuard`].
///
/// Native allocation failure is returned as a null pointer and leaves the
/// registry untouched. Every bookkeeping inconsistency (double free, resize
/// or release of an address the ledger never saw, a bounds violation) prints
/// one diagnostic line to stderr and aborts the process. That is the point
/// of the tool: a memory bug must never be silently tolerated.
pub struct Ledger {
    registry: Registry,
    zero_on_release: bool,
    oplog: OpLog,
    concurrency_safe: AtomicBool,
}

impl Default for Ledger {
    fn default() -> Self {
        Self::new()
    }
}

impl Ledger {
    pub fn new() -> Self {
        Self::with_config(LedgerConfig::default())
    }

    /// Build a ledger with explicit policy. A configured operation-log path
    /// that cannot be opened is ignored, matching the "diagnostics must not
    /// break the program" rule; use [`Ledger::enable_oplog`] to observe the
    /// failure instead.
    pub fn with_config(config: LedgerConfig) -> Self {
        let ledger = Self {
            registry: Registry::new(),
            zero_on_release: config.zero_on_release,
            oplog: OpLog::new(),
            concurrency_safe: AtomicBool::new(false),
        };
        if let Some(path) = config.oplog_path {
            let _ = ledger.oplog.enable(&path);
        }
        ledger
    }

    /// Start appending one line per accounting operation to `path`.
    pub fn enable_oplog<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        self.oplog.enable(path.as_ref())
    }

    /// Record that this ledger is about to be shared across threads.
    ///
    /// The registry lock is unconditional in this implementation, so the
    /// call only records the mode; it exists so callers keep declaring their
    /// intent and so the mode shows up in diagnostics.
    pub fn enable_concurrency_safe(&self) {
        self.concurrency_safe.store(true, Ordering::Release);
    }

    pub fn concurrency_safe(&self) -> bool {
        self.concurrency_safe.load(Ordering::Acquire)
    }

    /// The underlying registry, for enumeration and direct queries.
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Allocate `size` bytes from the native heap and track the block.
    ///
    /// Returns null when the native allocation fails; nothing is registered
    /// in that case.
    pub fn alloc(&self, size: usize, site: CallSite, annotation: impl Into<String>) -> *mut u8 {
        let ret = unsafe { libc::malloc(size) } as *mut u8;
        if ret.is_null() {
            return ptr::null_mut();
        }
        let annotation = annotation.into();
        self.oplog.line(format_args!(
            "{ret:p}: allocated {size} bytes at {site}: {annotation}"
        ));
        self.registry.register(ret as usize, size, site, annotation);
        ret
    }

    /// Resize a tracked block, or allocate fresh when `ptr` is null.
    ///
    /// Resizing an address this ledger never produced aborts before the
    /// native call is made. On native failure the original block and its
    /// record are left untouched and null is returned. On success the record
    /// follows the block to its (possibly new) address: size and call site
    /// are refreshed, the annotation is carried over unchanged.
    ///
    /// # Safety
    ///
    /// `ptr` must be null or a pointer previously returned by this ledger's
    /// allocation operations and not yet freed.
    pub unsafe fn realloc(&self, ptr: *mut u8, new_size: usize, site: CallSite) -> *mut u8 {
        if !ptr.is_null() && self.registry.size_of(ptr as usize).is_none() {
            fatal(format_args!(
                "reallocating {ptr:p} to {new_size} bytes at {site}: address is not tracked"
            ));
        }

        let ret = libc::realloc(ptr as *mut c_void, new_size) as *mut u8;
        if ret.is_null() {
            return ptr::null_mut();
        }

        if ptr.is_null() {
            self.registry.register(
                ret as usize,
                new_size,
                site,
                "reallocated from a null origin".to_string(),
            );
        } else if !self.registry.rename(ptr as usize, ret as usize, new_size, site) {
            fatal(format_args!(
                "reallocating {ptr:p} to {new_size} bytes at {site}: record vanished mid-resize"
            ));
        }

        self.oplog.line(format_args!(
            "{ret:p}: reallocated {ptr:p} to {new_size} bytes at {site}"
        ));
        ret
    }

    /// Release a tracked block back to the native heap.
    ///
    /// When the zero-on-release policy is enabled the block's tracked extent
    /// is overwritten with zero bytes first. Releasing an address that is not
    /// tracked (freed twice, never allocated through this ledger, or null)
    /// aborts; the native release only happens once the record is removed.
    ///
    /// # Safety
    ///
    /// `ptr` must be a pointer previously returned by this ledger's
    /// allocation operations and not yet freed.
    pub unsafe fn free(&self, ptr: *mut u8, site: CallSite) {
        if self.zero_on_release {
            if let Some(size) = self.registry.size_of(ptr as usize) {
                ptr::write_bytes(ptr, 0, size);
            }
        }

        self.oplog.line(format_args!("{ptr:p}: freed at {site}"));

        if !self.registry.remove(ptr as usize) {
            fatal(format_args!(
                "freeing {ptr:p} at {site}: address is not tracked (double free or foreign \
                 pointer)"
            ));
        }
        libc::free(ptr as *mut c_void);
    }

    /// Duplicate a C string on the native heap and track the copy.
    ///
    /// The record's size is the duplicated length plus its terminator and
    /// the annotation defaults to the duplicated content.
    pub fn strdup(&self, s: &CStr, site: CallSite) -> *mut c_char {
        let ret = unsafe { libc::strdup(s.as_ptr()) };
        if ret.is_null() {
            return ptr::null_mut();
        }
        let size = s.to_bytes().len() + 1;
        let annotation = s.to_string_lossy().into_owned();
        self.oplog.line(format_args!(
            "{ret:p}: strduped {size} bytes at {site}: {annotation}"
        ));
        self.registry.register(ret as usize, size, site, annotation);
        ret as *mut c_char
    }

    /// Like [`Ledger::strdup`], copying at most `limit` bytes.
    ///
    /// The record is sized to the duplicate actually produced, which is
    /// shorter than the source when `limit` truncates it.
    pub fn strndup(&self, s: &CStr, limit: usize, site: CallSite) -> *mut c_char {
        let ret = unsafe { libc::strndup(s.as_ptr(), limit) };
        if ret.is_null() {
            return ptr::null_mut();
        }
        let dup = unsafe { CStr::from_ptr(ret) };
        let size = dup.to_bytes().len() + 1;
        let annotation = dup.to_string_lossy().into_owned();
        self.oplog.line(format_args!(
            "{ret:p}: strnduped {size} bytes at {site}: {annotation}"
        ));
        self.registry.register(ret as usize, size, site, annotation);
        ret as *mut c_char
    }

    /// Annotation recorded for `ptr`, if it is a live tracked address.
    pub fn annotation(&self, ptr: *const u8) -> Option<String> {
        self.registry.annotation_of(ptr as usize)
    }

    /// Number of live tracked blocks.
    pub fn live_blocks(&self) -> usize {
        self.registry.len()
    }

    /// Abort unless `ptr` lies within the tracked extent of `base`.
    pub fn check(&self, ptr: *const u8, base: *const u8, site: CallSite) {
        bounds::check(&self.registry, ptr, base, site);
    }

    /// Abort unless `[ptr, ptr + len)` lies within the tracked extent of
    /// `base`.
    pub fn check_range(&self, ptr: *const u8, len: usize, base: *const u8, site: CallSite) {
        bounds::check_range(&self.registry, ptr, len, base, site);
    }

    /// Emit the leak report for all still-tracked records, in the classic
    /// line format. Call once the ledger has stopped accepting allocations;
    /// normally wired through a [`ShutdownGuard`].
    pub fn shutdown_report(&self) {
        self.report_with(&PlainReporter);
    }

    /// Emit the leak report through a specific [`Reporter`]. Nothing is
    /// emitted when no records are left.
    pub fn report_with(&self, reporter: &dyn Reporter) {
        let leaks = self.registry.snapshot();
        if leaks.is_empty() {
            return;
        }
        if let Err(err) = reporter.report(&leaks) {
            eprintln!("[memledger] leak report failed: {err}");
        }
    }
}

impl fmt::Debug for Ledger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Ledger")
            .field("live_blocks", &self.live_blocks())
            .field("zero_on_release", &self.zero_on_release)
            .field("oplog", &self.oplog.enabled())
            .field("concurrency_safe", &self.concurrency_safe())
            .finish()
    }
}

/// Runs the leak report when dropped.
///
/// Bind one at the top of `main` (or let [`macro@crate::main`] do it) so the
/// report covers everything still tracked at process exit.
pub struct ShutdownGuard<'a> {
    ledger: &'a Ledger,
    reporter: Box<dyn Reporter>,
}

impl<'a> ShutdownGuard<'a> {
    pub fn new(ledger: &'a Ledger) -> Self {
        Self {
            ledger,
            reporter: Box::new(PlainReporter),
        }
    }

    pub fn with_reporter(ledger: &'a Ledger, reporter: Box<dyn Reporter>) -> Self {
        Self { ledger, reporter }
    }

    pub fn set_reporter(&mut self, reporter: Box<dyn Reporter>) {
        self.reporter = reporter;
    }
}

impl Drop for ShutdownGuard<'_> {
    fn drop(&mut self) {
        self.ledger.report_with(&*self.reporter);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CString;

    fn site(line: u32) -> CallSite {
        CallSite::new("ledger_test.rs", line)
    }

    #[test]
    fn successful_operations_keep_the_count_balanced() {
        let ledger = Ledger::new();

        let a = ledger.alloc(64, site(1), "a");
        let b = ledger.alloc(128, site(2), "b");
        let text = CString::new("hello").unwrap();
        let c = ledger.strdup(&text, site(3));
        assert!(!a.is_null() && !b.is_null() && !c.is_null());
        assert_eq!(ledger.live_blocks(), 3);

        unsafe {
            ledger.free(a, site(4));
            ledger.free(c as *mut u8, site(5));
        }
        assert_eq!(ledger.live_blocks(), 1);

        unsafe { ledger.free(b, site(6)) };
        assert_eq!(ledger.live_blocks(), 0);
    }

    #[test]
    fn annotation_lives_and_dies_with_the_record() {
        let ledger = Ledger::new();

        let p = ledger.alloc(64, site(10), "buffer A");
        assert_eq!(ledger.annotation(p), Some("buffer A".to_string()));

        unsafe { ledger.free(p, site(11)) };
        assert_eq!(ledger.annotation(p), None);
    }

    #[test]
    fn realloc_from_null_registers_a_synthetic_annotation() {
        let ledger = Ledger::new();

        let p = unsafe { ledger.realloc(ptr::null_mut(), 96, site(20)) };
        assert!(!p.is_null());
        assert_eq!(ledger.live_blocks(), 1);
        assert_eq!(
            ledger.annotation(p),
            Some("reallocated from a null origin".to_string())
        );
        assert_eq!(ledger.registry().size_of(p as usize), Some(96));

        unsafe { ledger.free(p, site(21)) };
    }

    #[test]
    fn realloc_refreshes_size_and_site_but_keeps_the_annotation() {
        let ledger = Ledger::new();

        let p = ledger.alloc(32, site(30), "grows");
        let q = unsafe { ledger.realloc(p, 128, site(31)) };
        assert!(!q.is_null());

        assert_eq!(ledger.live_blocks(), 1);
        assert_eq!(ledger.registry().size_of(q as usize), Some(128));
        assert_eq!(ledger.annotation(q), Some("grows".to_string()));

        let records = ledger.registry().snapshot();
        assert_eq!(records[0].site.line, 31);

        unsafe { ledger.free(q, site(32)) };
    }

    #[test]
    fn strdup_records_length_plus_terminator_and_the_content() {
        let ledger = Ledger::new();
        let text = CString::new("buffer A").unwrap();

        let p = ledger.strdup(&text, site(40));
        assert_eq!(ledger.registry().size_of(p as usize), Some(9));
        assert_eq!(ledger.annotation(p as *const u8), Some("buffer A".into()));

        unsafe { ledger.free(p as *mut u8, site(41)) };
    }

    #[test]
    fn strndup_records_the_truncated_length() {
        let ledger = Ledger::new();
        let text = CString::new("truncate me").unwrap();

        let p = ledger.strndup(&text, 8, site(50));
        assert_eq!(ledger.registry().size_of(p as usize), Some(9));
        assert_eq!(ledger.annotation(p as *const u8), Some("truncate".into()));

        unsafe { ledger.free(p as *mut u8, site(51)) };
    }

    #[test]
    fn checks_accept_interior_pointers_and_full_ranges() {
        let ledger = Ledger::new();

        let base = ledger.alloc(64, site(60), "checked");
        let interior = unsafe { base.add(63) };
        ledger.check(interior, base, site(61));
        ledger.check_range(base, 64, base, site(62));
        ledger.check_range(unsafe { base.add(16) }, 48, base, site(63));

        unsafe { ledger.free(base, site(64)) };
    }

    #[test]
    fn oplog_sees_allocation_and_release_lines() {
        let dir = std::env::temp_dir().join("memledger-ledger-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("ops.log");

        let ledger = Ledger::new();
        ledger.enable_oplog(&path).unwrap();

        let p = ledger.alloc(64, site(70), "logged");
        unsafe { ledger.free(p, site(71)) };

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("allocated 64 bytes"));
        assert!(contents.contains("logged"));
        assert!(contents.contains("freed at"));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn concurrency_safe_mode_is_recorded() {
        let ledger = Ledger::new();
        assert!(!ledger.concurrency_safe());
        ledger.enable_concurrency_safe();
        assert!(ledger.concurrency_safe());
    }
}
