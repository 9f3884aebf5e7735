//! Attribute macros for the causa causal profiler.
//!
//! `#[profile]` turns a function into a throughput progress point and
//! `#[latency]` turns it into a latency point. Both count on every exit path,
//! including early returns and unwinding.

use proc_macro::TokenStream;
use quote::quote;
use syn::{parse_macro_input, ItemFn, LitStr};

/// Progress point name: the attribute's string literal, or the function's
/// path within its crate.
fn point_name(attr: TokenStream, input: &ItemFn) -> syn::Result<proc_macro2::TokenStream> {
    if attr.is_empty() {
        let ident = input.sig.ident.to_string();
        Ok(quote!(concat!(module_path!(), "::", #ident)))
    } else {
        let name: LitStr = syn::parse(attr)?;
        Ok(quote!(#name))
    }
}

/// Counts one visit to a throughput point each time the function returns.
///
/// ```ignore
/// #[causa::profile]
/// fn handle(req: Request) -> Response {
///     // ...
/// }
///
/// #[causa::profile("frames")]
/// fn render(frame: &mut Frame) {
///     // ...
/// }
/// ```
///
/// expands to roughly
///
/// ```ignore
/// fn handle(req: Request) -> Response {
///     let _guard = ScopeGuard::new(&THROUGHPUT_COUNTER);
///     // ...
/// }
/// ```
#[proc_macro_attribute]
pub fn profile(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let name = match point_name(attr, &input) {
        Ok(name) => name,
        Err(e) => return e.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;
    quote! {
        #(#attrs)*
        #vis #sig {
            let _causa_progress = {
                static COUNTER: ::causa::progress_point::Counter =
                    ::causa::progress_point::Counter::throughput(#name);
                ::causa::progress_point::ScopeGuard::new(&COUNTER)
            };
            #block
        }
    }
    .into()
}

/// Treats each call of the function as one transaction of a latency point:
/// an arrival on entry and a departure on return.
///
/// ```ignore
/// #[causa::latency("request")]
/// fn serve(req: Request) -> Response {
///     // ...
/// }
/// ```
#[proc_macro_attribute]
pub fn latency(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let name = match point_name(attr, &input) {
        Ok(name) => name,
        Err(e) => return e.to_compile_error().into(),
    };

    let ItemFn {
        attrs,
        vis,
        sig,
        block,
    } = input;
    quote! {
        #(#attrs)*
        #vis #sig {
            ::causa::scope!(#name);
            #block
        }
    }
    .into()
}
