use proc_macro::TokenStream;
use proc_macro2::TokenStream as TokenStream2;
use quote::quote;
use syn::{ItemFn, parse_macro_input};

/// `#[faultline::test]`: a test that runs inside its own tracing scope.
///
/// Async bodies become `#[tokio::test]`, with any attribute arguments passed
/// through (`#[faultline::test(start_paused = true)]` gives paused time).
/// Plain functions become `#[test]` and take no arguments.
#[proc_macro_attribute]
pub fn test(attr: TokenStream, item: TokenStream) -> TokenStream {
    let args = TokenStream2::from(attr);
    let func = parse_macro_input!(item as ItemFn);

    let expanded = if func.sig.asyncness.is_some() {
        async_test(&func, args)
    } else if args.is_empty() {
        sync_test(&func)
    } else {
        syn::Error::new_spanned(&func.sig.fn_token, "arguments need an async test")
            .to_compile_error()
    };
    expanded.into()
}

fn async_test(func: &ItemFn, args: TokenStream2) -> TokenStream2 {
    let ItemFn { attrs, vis, sig, block } = func;
    let name = &sig.ident;
    let runtime = if args.is_empty() {
        quote! { #[tokio::test] }
    } else {
        quote! { #[tokio::test(#args)] }
    };
    quote! {
        #runtime
        #(#attrs)*
        #vis #sig {
            faultline::trace::with_test_tracing(stringify!(#name), || async move #block).await
        }
    }
}

fn sync_test(func: &ItemFn) -> TokenStream2 {
    let ItemFn { attrs, vis, sig, block } = func;
    let name = &sig.ident;
    quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            faultline::trace::with_test_tracing_sync(stringify!(#name), || #block)
        }
    }
}
