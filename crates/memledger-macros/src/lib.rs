use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

#[cfg(feature = "ledger")]
use syn::Path;

/// Wraps a program entry point so the named ledger emits its leak report
/// when the function returns.
///
/// The attribute argument is a path to a `Ledger` (or anything that derefs
/// to one, such as a `LazyLock<Ledger>`):
///
/// ```ignore
/// static LEDGER: LazyLock<Ledger> = LazyLock::new(Ledger::default);
///
/// #[memledger::main(LEDGER)]
/// fn main() {
///     // allocations routed through LEDGER are reported on exit
/// }
/// ```
///
/// Without the `ledger` feature the function is emitted unchanged.
#[cfg(feature = "ledger")]
#[proc_macro_attribute]
pub fn main(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let ledger = parse_macro_input!(attr as Path);

    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;

    let output = quote! {
        #vis #sig {
            let __memledger_shutdown = memledger::ShutdownGuard::new(&#ledger);

            #block
        }
    };

    output.into()
}

#[cfg(not(feature = "ledger"))]
#[proc_macro_attribute]
pub fn main(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);

    let output = quote! { #input };

    output.into()
}
