//! Append-only diagnostic log of accounting operations.

use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::Path;
use std::sync::OnceLock;

use eyre::{Result, WrapErr};
use parking_lot::Mutex;

/// One line per accounting operation, in the order the ledger saw them.
///
/// Disabled until [`OpLog::enable`] succeeds. Write errors are swallowed:
/// the log must never take down the program it is diagnosing.
pub(crate) struct OpLog {
    file: OnceLock<Mutex<File>>,
}

impl OpLog {
    pub(crate) const fn new() -> Self {
        Self {
            file: OnceLock::new(),
        }
    }

    /// Start logging to `path`, truncating any previous log. Enabling twice
    /// is accepted and keeps the first destination.
    pub(crate) fn enable(&self, path: &Path) -> Result<()> {
        if self.file.get().is_some() {
            return Ok(());
        }
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(path)
            .wrap_err_with(|| format!("opening operation log {}", path.display()))?;
        let _ = self.file.set(Mutex::new(file));
        Ok(())
    }

    pub(crate) fn enabled(&self) -> bool {
        self.file.get().is_some()
    }

    pub(crate) fn line(&self, args: fmt::Arguments<'_>) {
        if let Some(file) = self.file.get() {
            let mut file = file.lock();
            let _ = writeln!(&mut *file, "{args}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_reach_the_file_once_enabled() {
        let dir = std::env::temp_dir().join("memledger-oplog-test");
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join("memory.log");

        let log = OpLog::new();
        log.line(format_args!("dropped before enable"));
        log.enable(&path).unwrap();
        log.line(format_args!("0x1000: allocated 64 bytes"));

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(!contents.contains("dropped before enable"));
        assert!(contents.contains("0x1000: allocated 64 bytes"));

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn enabling_twice_keeps_the_first_destination() {
        let dir = std::env::temp_dir().join("memledger-oplog-test2");
        std::fs::create_dir_all(&dir).unwrap();
        let first = dir.join("first.log");
        let second = dir.join("second.log");
        let _ = std::fs::remove_file(&second);

        let log = OpLog::new();
        log.enable(&first).unwrap();
        log.enable(&second).unwrap();
        log.line(format_args!("entry"));

        assert!(std::fs::read_to_string(&first).unwrap().contains("entry"));
        assert!(!second.exists());

        std::fs::remove_file(&first).unwrap();
    }
}
