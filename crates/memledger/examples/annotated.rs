use std::sync::LazyLock;

use memledger::{Ledger, ledger_alloc, ledger_free};

static LEDGER: LazyLock<Ledger> = LazyLock::new(Ledger::default);

// Leaks one block on purpose so the shutdown report has something to show.
// Run with `--features ledger` for the instrumented build; without it the
// macros compile down to bare malloc/free and no report is printed.
#[memledger::main(LEDGER)]
fn main() {
    let p = ledger_alloc!(LEDGER, 64, "scratch buffer");
    assert!(!p.is_null());
    unsafe { ledger_free!(LEDGER, p) };

    let _leaked = ledger_alloc!(LEDGER, 128, "forgotten buffer");
}
