//! `#[timeout]` and `#[tokio_timeout_test]` run a test body on a watchdog
//! thread and fail the test when it does not finish within its time limit
//! (60 seconds unless overridden).
//!
//! ```ignore
//! #[test_timeout::timeout(5)]
//! fn quick() {}
//!
//! #[test_timeout::tokio_timeout_test(10, multi_thread)]
//! async fn networked() {}
//! ```

use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::parse::Parser;
use syn::punctuated::Punctuated;
use syn::{Attribute, Expr, ExprLit, ExprPath, ItemFn, Lit, Token};

const DEFAULT_TIMEOUT_SECS: u64 = 60;

#[derive(Clone, Copy, PartialEq, Eq)]
enum Flavor {
    CurrentThread,
    MultiThread,
}

struct Options {
    timeout_secs: u64,
    flavor: Flavor,
}

fn parse_options(attr: TokenStream, allow_flavor: bool) -> syn::Result<Options> {
    let mut options = Options {
        timeout_secs: DEFAULT_TIMEOUT_SECS,
        flavor: Flavor::CurrentThread,
    };
    let args = Punctuated::<Expr, Token![,]>::parse_terminated.parse(attr)?;
    for arg in args {
        match &arg {
            Expr::Lit(ExprLit {
                lit: Lit::Int(lit), ..
            }) => {
                let secs: u64 = lit.base10_parse()?;
                if secs == 0 {
                    return Err(syn::Error::new_spanned(lit, "timeout must be greater than zero"));
                }
                options.timeout_secs = secs;
            }
            Expr::Path(ExprPath { path, .. }) if allow_flavor && path.is_ident("multi_thread") => {
                options.flavor = Flavor::MultiThread;
            }
            Expr::Path(ExprPath { path, .. }) if allow_flavor && path.is_ident("current_thread") => {
                options.flavor = Flavor::CurrentThread;
            }
            other => {
                return Err(syn::Error::new_spanned(
                    other,
                    "expected a timeout in seconds or a runtime flavor",
                ));
            }
        }
    }
    Ok(options)
}

fn is_path(attr: &Attribute, expected: &[&str]) -> bool {
    let segments: Vec<String> = attr
        .path()
        .segments
        .iter()
        .map(|segment| segment.ident.to_string())
        .collect();
    segments.iter().map(String::as_str).eq(expected.iter().copied())
}

/// Runs `body` on a fresh thread and waits at most `timeout_secs` for it,
/// re-raising any panic on the test thread.
fn watchdog(timeout_secs: u64, body: TokenStream2) -> TokenStream2 {
    quote! {
        let timeout_duration = std::time::Duration::from_secs(#timeout_secs);
        let (sender, receiver) = std::sync::mpsc::channel();
        std::thread::spawn(move || {
            let result = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| { #body }));
            let _ = sender.send(result);
        });
        match receiver.recv_timeout(timeout_duration) {
            Ok(Ok(_)) => {}
            Ok(Err(payload)) => std::panic::resume_unwind(payload),
            Err(std::sync::mpsc::RecvTimeoutError::Timeout) => panic!("test timed out"),
            Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => {
                panic!("test thread failed before reporting result")
            }
        }
    }
}

#[proc_macro_attribute]
pub fn tokio_timeout_test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, true) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        mut sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_none() {
        return syn::Error::new_spanned(
            &sig.ident,
            "tokio_timeout_test can only be applied to async functions",
        )
        .to_compile_error()
        .into();
    }
    sig.asyncness = None;

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_path(attr, &["tokio", "test"]))
        .collect();

    let builder = match options.flavor {
        Flavor::CurrentThread => quote! { tokio::runtime::Builder::new_current_thread() },
        Flavor::MultiThread => quote! {
            let mut builder = tokio::runtime::Builder::new_multi_thread();
            builder.worker_threads(2);
            builder
        },
    };
    let timeout_secs = options.timeout_secs;
    let body = quote! {
        let runtime = { #builder }
            .enable_all()
            .build()
            .expect("failed to build Tokio runtime");
        runtime.block_on(async {
            tokio::time::timeout(
                std::time::Duration::from_secs(#timeout_secs),
                async move #block,
            )
            .await
            .expect("test timed out");
        });
    };
    let guarded = watchdog(timeout_secs, body);

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    })
}

#[proc_macro_attribute]
pub fn timeout(attr: TokenStream, item: TokenStream) -> TokenStream {
    let options = match parse_options(attr, false) {
        Ok(options) => options,
        Err(err) => return err.to_compile_error().into(),
    };
    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = match syn::parse::<ItemFn>(item) {
        Ok(item) => item,
        Err(err) => return err.to_compile_error().into(),
    };

    if sig.asyncness.is_some() {
        return syn::Error::new_spanned(
            &sig.ident,
            "timeout attribute expects a synchronous test function",
        )
        .to_compile_error()
        .into();
    }

    let attrs: Vec<Attribute> = attrs
        .into_iter()
        .filter(|attr| !is_path(attr, &["test"]))
        .collect();
    let guarded = watchdog(options.timeout_secs, quote! { #block });

    TokenStream::from(quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            #guarded
        }
    })
}
