//! Scenario driver: drives the accounting allocator the way a misbehaving
//! (or well-behaved) program would, from a real process, so the abort paths
//! and the shutdown report can be observed end to end.

use std::ffi::CString;
use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use eyre::Result;
use memledger::{
    JsonPrettyReporter, JsonReporter, Ledger, LedgerConfig, PlainReporter, Reporter,
    ShutdownGuard, TableReporter, ledger_alloc, ledger_check, ledger_check_range, ledger_free,
    ledger_realloc, ledger_strdup,
};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

#[derive(Parser)]
#[command(
    name = "memledger",
    version,
    about = "Exercise the allocation ledger from the command line"
)]
struct Cli {
    /// Zero freed blocks before they are released.
    #[arg(long)]
    zero: bool,

    /// Append one line per accounting operation to this file.
    #[arg(long)]
    oplog: Option<PathBuf>,

    /// Leak-report format.
    #[arg(long, value_enum, default_value = "plain")]
    format: ReportFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum ReportFormat {
    Plain,
    Table,
    Json,
    JsonPretty,
}

impl ReportFormat {
    fn reporter(self) -> Box<dyn Reporter> {
        match self {
            ReportFormat::Plain => Box::new(PlainReporter),
            ReportFormat::Table => Box::new(TableReporter),
            ReportFormat::Json => Box::new(JsonReporter),
            ReportFormat::JsonPretty => Box::new(JsonPrettyReporter),
        }
    }
}

#[derive(Subcommand)]
enum Command {
    /// Allocate pseudo-random blocks from a fixed seed, then free one of
    /// them twice. The second free must abort.
    DoubleRelease {
        #[arg(long, default_value_t = 0)]
        seed: u64,
        #[arg(long, default_value_t = 1000)]
        blocks: usize,
    },
    /// Leave annotated blocks unfreed so the shutdown report has something
    /// to say.
    Leak,
    /// Derive a pointer one byte past its block and bounds-check it.
    Bounds {
        /// Violate with a range whose start is valid but whose end overshoots.
        #[arg(long)]
        range: bool,
        /// Violate with a pointer below the base instead of past the end.
        #[arg(long)]
        below: bool,
    },
    /// Grow a block until the allocator relocates it, then verify the record
    /// followed.
    Resize,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let ledger = Ledger::with_config(LedgerConfig {
        zero_on_release: cli.zero,
        oplog_path: None,
    });
    if let Some(path) = &cli.oplog {
        ledger.enable_oplog(path)?;
    }

    let _shutdown = ShutdownGuard::with_reporter(&ledger, cli.format.reporter());

    match cli.command {
        Command::DoubleRelease { seed, blocks } => double_release(&ledger, seed, blocks),
        Command::Leak => leak(&ledger),
        Command::Bounds { range, below } => bounds(&ledger, range, below),
        Command::Resize => resize(&ledger),
    }

    Ok(())
}

fn double_release(ledger: &Ledger, seed: u64, blocks: usize) {
    let mut rng = StdRng::seed_from_u64(seed);

    let mut allocs = Vec::with_capacity(blocks);
    for i in 0..blocks {
        let size: usize = rng.gen_range(1..=4096);
        allocs.push(ledger_alloc!(ledger, size, "random allocation {i}"));
    }
    println!("allocated {} blocks", ledger.live_blocks());

    let victim = allocs[rng.gen_range(0..blocks)];
    unsafe {
        ledger_free!(ledger, victim);
        ledger_free!(ledger, victim);
    }
    unreachable!("the second release of {victim:p} did not abort");
}

fn leak(ledger: &Ledger) {
    for i in 0..3usize {
        let size = 32 * (i + 1);
        let _ = ledger_alloc!(ledger, size, "leaked buffer {i}");
    }
    let name = CString::new("leaked name").unwrap();
    let _ = ledger_strdup!(ledger, &name);

    println!("left {} blocks live", ledger.live_blocks());
}

fn bounds(ledger: &Ledger, range: bool, below: bool) {
    let base = ledger_alloc!(ledger, 64, "bounds probe");

    ledger_check!(ledger, unsafe { base.add(16) }, base);
    ledger_check_range!(ledger, base, 64, base);
    println!("interior checks passed");

    if below {
        ledger_check!(ledger, base.wrapping_sub(1), base);
    } else if range {
        // Valid start, but the last 16 bytes of the range fall past the end.
        ledger_check_range!(ledger, unsafe { base.add(16) }, 64, base);
    } else {
        ledger_check!(ledger, base.wrapping_add(64), base);
    }
    unreachable!("the out-of-bounds check did not abort");
}

fn resize(ledger: &Ledger) {
    let mut ptr = ledger_alloc!(ledger, 32, "growing buffer");
    let mut size: usize = 32;

    // Keep doubling until the native allocator relocates the block (a heap
    // this empty almost always moves it on the first large jump).
    let moved = loop {
        size *= 2;
        let next = unsafe { ledger_realloc!(ledger, ptr, size) };
        assert!(!next.is_null(), "native realloc failed at {size} bytes");
        if next != ptr || size >= 1 << 26 {
            break next;
        }
        ptr = next;
    };

    assert_eq!(ledger.live_blocks(), 1);
    assert_eq!(ledger.registry().size_of(moved as usize), Some(size));
    assert_eq!(ledger.annotation(moved), Some("growing buffer".to_string()));
    println!("record followed the block to {moved:p}: size {size}, annotation intact");

    unsafe { ledger_free!(ledger, moved) };
}
