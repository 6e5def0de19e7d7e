use std::collections::HashMap;
use std::fmt;

use parking_lot::Mutex;
use serde::Serialize;

use crate::fatal;

/// Provenance of an accounting operation: the source location that issued it.
///
/// Built by the `ledger_*!` macros from `file!()` and `line!()`, so the file
/// name is always a `'static` string baked into the caller's binary.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
pub struct CallSite {
    pub file: &'static str,
    pub line: u32,
}

impl CallSite {
    pub const fn new(file: &'static str, line: u32) -> Self {
        Self { file, line }
    }
}

impl fmt::Display for CallSite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}, line {}", self.file, self.line)
    }
}

/// One live tracked allocation.
#[derive(Clone, Debug, Serialize)]
pub struct AllocationRecord {
    /// The pointer value the native allocator returned. Opaque identity;
    /// never dereferenced by the registry.
    pub addr: usize,
    /// Byte length as most recently requested.
    pub size: usize,
    /// Call site of the allocation, refreshed on resize.
    pub site: CallSite,
    /// Human-readable description, fully expanded before it got here.
    pub annotation: String,
}

/// Address-keyed store of allocation records.
///
/// Keys are raw pointer values and are unique while live. The native
/// allocator may hand the same address out again after a release, so the
/// bookkeeping stays truthful only if every release is reported before the
/// address can legally come back; the [`Ledger`](crate::Ledger) enforces
/// exactly that discipline.
///
/// Every operation takes the internal lock for its duration; `for_each`
/// snapshots the records and visits them after the lock is released, so
/// visitors may freely issue further registry queries.
#[derive(Default)]
pub struct Registry {
    records: Mutex<HashMap<usize, AllocationRecord>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record for a freshly allocated address.
    ///
    /// Aborts if `addr` is already live: that means the native allocator
    /// returned an address the ledger still considers allocated, so a release
    /// went unreported and every lookup from here on would lie.
    pub fn register(&self, addr: usize, size: usize, site: CallSite, annotation: String) {
        let mut records = self.records.lock();
        if let Some(prev) = records.insert(
            addr,
            AllocationRecord {
                addr,
                size,
                site,
                annotation,
            },
        ) {
            drop(records);
            fatal(format_args!(
                "registering {addr:#x} ({size} bytes) at {site}: address is already tracked \
                 ({} bytes from {})",
                prev.size, prev.site
            ));
        }
    }

    /// Move the record at `old` to `new`, refreshing size and call site.
    ///
    /// The annotation captured at allocation time is carried over untouched:
    /// it describes what the block is, while the call site records who last
    /// resized it. Returns `false` when `old` is not tracked; the caller
    /// decides whether that is a fresh allocation or a usage error.
    pub fn rename(&self, old: usize, new: usize, size: usize, site: CallSite) -> bool {
        let mut records = self.records.lock();
        let Some(mut record) = records.remove(&old) else {
            return false;
        };
        record.addr = new;
        record.size = size;
        record.site = site;
        if let Some(prev) = records.insert(new, record) {
            drop(records);
            fatal(format_args!(
                "renaming {old:#x} to {new:#x} at {site}: new address is already tracked \
                 ({} bytes from {})",
                prev.size, prev.site
            ));
        }
        true
    }

    /// Tracked size of `addr`, if live.
    pub fn size_of(&self, addr: usize) -> Option<usize> {
        self.records.lock().get(&addr).map(|record| record.size)
    }

    /// Annotation of `addr`, if live. Returns an owned copy, so the result
    /// stays valid across later registry mutations.
    pub fn annotation_of(&self, addr: usize) -> Option<String> {
        self.records
            .lock()
            .get(&addr)
            .map(|record| record.annotation.clone())
    }

    /// Delete the record at `addr`. Returns `false` when `addr` is not
    /// tracked; the caller treats that as a double release.
    pub fn remove(&self, addr: usize) -> bool {
        self.records.lock().remove(&addr).is_some()
    }

    /// Visit every live record.
    ///
    /// The records are copied out under the lock and visited afterwards, so
    /// the visitor sees a consistent snapshot and may query the registry
    /// without deadlocking. Mutations made while visiting affect the live
    /// map, not the snapshot.
    pub fn for_each<F>(&self, mut visitor: F)
    where
        F: FnMut(&AllocationRecord),
    {
        for record in self.snapshot() {
            visitor(&record);
        }
    }

    /// Copy of all live records, ordered by address.
    pub fn snapshot(&self) -> Vec<AllocationRecord> {
        let mut records: Vec<_> = self.records.lock().values().cloned().collect();
        records.sort_by_key(|record| record.addr);
        records
    }

    /// Number of live records.
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.lock().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn site(line: u32) -> CallSite {
        CallSite::new("registry_test.rs", line)
    }

    #[test]
    fn register_and_remove_keep_the_count_balanced() {
        let registry = Registry::new();
        assert!(registry.is_empty());

        registry.register(0x1000, 64, site(1), "one".into());
        registry.register(0x2000, 32, site(2), "two".into());
        registry.register(0x3000, 16, site(3), "three".into());
        assert_eq!(registry.len(), 3);

        assert!(registry.remove(0x2000));
        assert_eq!(registry.len(), 2);
        assert!(!registry.remove(0x2000));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn lookups_reflect_the_live_record() {
        let registry = Registry::new();
        registry.register(0x1000, 64, site(10), "buffer A".into());

        assert_eq!(registry.size_of(0x1000), Some(64));
        assert_eq!(registry.annotation_of(0x1000), Some("buffer A".into()));
        assert_eq!(registry.size_of(0x2000), None);

        assert!(registry.remove(0x1000));
        assert_eq!(registry.annotation_of(0x1000), None);
    }

    #[test]
    fn rename_moves_the_record_and_keeps_the_annotation() {
        let registry = Registry::new();
        registry.register(0x1000, 32, site(5), "grows".into());

        assert!(registry.rename(0x1000, 0x2000, 128, site(9)));

        assert_eq!(registry.size_of(0x1000), None);
        assert_eq!(registry.size_of(0x2000), Some(128));
        assert_eq!(registry.annotation_of(0x2000), Some("grows".into()));

        let records = registry.snapshot();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].site.line, 9);
    }

    #[test]
    fn rename_of_an_untracked_address_reports_not_found() {
        let registry = Registry::new();
        assert!(!registry.rename(0x1000, 0x2000, 64, site(1)));
        assert!(registry.is_empty());
    }

    #[test]
    fn rename_to_the_same_address_updates_in_place() {
        let registry = Registry::new();
        registry.register(0x1000, 32, site(1), "stays".into());

        assert!(registry.rename(0x1000, 0x1000, 64, site(2)));
        assert_eq!(registry.size_of(0x1000), Some(64));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn visitors_can_query_the_registry_while_enumerating() {
        let registry = Registry::new();
        registry.register(0x1000, 64, site(1), "one".into());
        registry.register(0x2000, 32, site(2), "two".into());

        let mut seen = Vec::new();
        registry.for_each(|record| {
            // A nested lookup must not deadlock against the enumeration.
            let annotation = registry.annotation_of(record.addr);
            seen.push((record.addr, annotation));
        });

        seen.sort();
        assert_eq!(
            seen,
            vec![
                (0x1000, Some("one".to_string())),
                (0x2000, Some("two".to_string())),
            ]
        );
    }

    #[test]
    fn snapshot_is_ordered_by_address() {
        let registry = Registry::new();
        registry.register(0x3000, 1, site(1), "c".into());
        registry.register(0x1000, 1, site(2), "a".into());
        registry.register(0x2000, 1, site(3), "b".into());

        let addrs: Vec<_> = registry.snapshot().iter().map(|r| r.addr).collect();
        assert_eq!(addrs, vec![0x1000, 0x2000, 0x3000]);
    }
}
