//! Leak-report output.
//!
//! The shutdown report is routed through a [`Reporter`] so applications can
//! swap the classic diagnostic lines for a table or JSON, or feed the records
//! into their own logging. All reporters write to the standard diagnostic
//! stream; nothing here mutates the registry.

use std::error::Error;
use std::io::Write;

use colored::*;
use prettytable::{color, Attr, Cell, Row, Table};

use crate::registry::AllocationRecord;

/// Formats the process-exit leak report.
///
/// `leaks` holds every record still tracked at shutdown, ordered by address.
/// Implementations are only invoked when at least one record is left.
pub trait Reporter {
    fn report(&self, leaks: &[AllocationRecord]) -> Result<(), Box<dyn Error>>;
}

fn count_summary(count: usize) -> String {
    format!(
        "{count} allocated {} on termination:",
        if count == 1 {
            "block exists"
        } else {
            "blocks exist"
        }
    )
}

/// The classic diagnostic format: a count header, then one line per block.
pub struct PlainReporter;

impl Reporter for PlainReporter {
    fn report(&self, leaks: &[AllocationRecord]) -> Result<(), Box<dyn Error>> {
        let mut err = std::io::stderr().lock();
        writeln!(err, "{}", count_summary(leaks.len()))?;
        for record in leaks {
            writeln!(
                err,
                "- {} bytes allocated in {}: `{}'",
                record.size, record.site, record.annotation
            )?;
        }
        Ok(())
    }
}

/// One row per leaked block, with the count summary as a colored header.
pub struct TableReporter;

impl Reporter for TableReporter {
    fn report(&self, leaks: &[AllocationRecord]) -> Result<(), Box<dyn Error>> {
        let mut table = Table::new();
        table.add_row(Row::new(vec![
            Cell::new("Address").with_style(Attr::Bold),
            Cell::new("Size").with_style(Attr::Bold),
            Cell::new("Source").with_style(Attr::Bold),
            Cell::new("Annotation").with_style(Attr::Bold),
        ]));

        for record in leaks {
            table.add_row(Row::new(vec![
                Cell::new(&format!("{:#x}", record.addr)),
                Cell::new(&record.size.to_string())
                    .with_style(Attr::ForegroundColor(color::RED)),
                Cell::new(&record.site.to_string()),
                Cell::new(&record.annotation),
            ]));
        }

        eprintln!(
            "\n{} {}",
            "[memledger]".blue().bold(),
            count_summary(leaks.len()).yellow().bold()
        );
        table.print(&mut std::io::stderr())?;
        Ok(())
    }
}

/// The raw records as a JSON array, one machine-readable line.
pub struct JsonReporter;

impl Reporter for JsonReporter {
    fn report(&self, leaks: &[AllocationRecord]) -> Result<(), Box<dyn Error>> {
        let mut err = std::io::stderr().lock();
        serde_json::to_writer(&mut err, leaks)?;
        writeln!(err)?;
        Ok(())
    }
}

/// [`JsonReporter`], pretty-printed.
pub struct JsonPrettyReporter;

impl Reporter for JsonPrettyReporter {
    fn report(&self, leaks: &[AllocationRecord]) -> Result<(), Box<dyn Error>> {
        let mut err = std::io::stderr().lock();
        serde_json::to_writer_pretty(&mut err, leaks)?;
        writeln!(err)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn count_summary_matches_singular_and_plural() {
        assert_eq!(count_summary(1), "1 allocated block exists on termination:");
        assert_eq!(
            count_summary(3),
            "3 allocated blocks exist on termination:"
        );
    }
}
