//! Watchdog attributes for Parley tests.
//!
//! Every test runs on its own thread and fails if it does not report back
//! within its budget. Without an explicit budget the limit is
//! `PARLEY_TEST_TIMEOUT_SECS` (read when the test runs) or 60 seconds.

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{parse_macro_input, Attribute, ItemFn, LitInt};

const DEFAULT_TIMEOUT_SECS: u64 = 60;
const TIMEOUT_ENV: &str = "PARLEY_TEST_TIMEOUT_SECS";

/// Async test on a current-thread Tokio runtime with a deadline.
///
/// Replaces `#[tokio::test]`; a stray `#[tokio::test]` on the same item is dropped.
#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let explicit = match parse_budget(attr) {
        Ok(budget) => budget,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test only applies to async fns",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs = strip_attrs(attrs, &["tokio", "test"]);
    let budget = budget_expr(explicit);
    let body = quote! {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(__budget, async move #block)
                .await
                .expect("test timed out");
        });
    };
    let watchdog = watchdog(budget, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watchdog
        }
    })
}

/// Synchronous test with a deadline. Replaces `#[test]`.
#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let explicit = match parse_budget(attr) {
        Ok(budget) => budget,
        Err(err) => return err.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = parse_macro_input!(item as ItemFn);

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout expects a synchronous fn; use tokio_timeout_test for async tests",
        )
        .to_compile_error()
        .into();
    }

    let attrs = strip_attrs(attrs, &["test"]);
    let budget = budget_expr(explicit);
    let watchdog = watchdog(budget, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #watchdog
        }
    })
}

fn parse_budget(attr: TokenStream) -> syn::Result<Option<u64>> {
    if attr.is_empty() {
        return Ok(None);
    }
    let lit: LitInt = syn::parse(attr)?;
    let secs: u64 = lit.base10_parse()?;
    if secs == 0 {
        return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
    }
    Ok(Some(secs))
}

fn budget_expr(explicit: Option<u64>) -> TokenStream2 {
    match explicit {
        Some(secs) => quote! { std::time::Duration::from_secs(#secs) },
        None => quote! {
            std::time::Duration::from_secs(
                std::env::var(#TIMEOUT_ENV)
                    .ok()
                    .and_then(|value| value.trim().parse::<u64>().ok())
                    .filter(|secs| *secs > 0)
                    .unwrap_or(#DEFAULT_TIMEOUT_SECS),
            )
        },
    }
}

fn watchdog(budget: TokenStream2, body: TokenStream2) -> TokenStream2 {
    quote! {
        let __budget: std::time::Duration = #budget;
        let (__done_tx, __done_rx) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let outcome = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = __done_tx.send(outcome);
        });
        match __done_rx.recv_timeout(__budget) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {
                panic!("test exceeded its {:?} budget", __budget)
            }
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread exited without reporting a result")
            }
        }
    }
}

/// Drops attributes whose path is exactly `path` (e.g. `tokio::test` or `test`).
fn strip_attrs(attrs: Vec<Attribute>, path: &[&str]) -> Vec<Attribute> {
    attrs
        .into_iter()
        .filter(|attr| {
            let segments: Vec<String> = attr
                .path()
                .segments
                .iter()
                .map(|segment| segment.ident.to_string())
                .collect();
            segments.len() != path.len() || segments.iter().zip(path).any(|(a, b)| a != b)
        })
        .collect()
}
