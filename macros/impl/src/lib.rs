//! Procedural macro implementations re-exported by `recycle-macros`.

use proc_macro::TokenStream;
use proc_macro2::Span;
use quote::quote;
use syn::{parse::Parser, parse_macro_input, punctuated::Punctuated, Ident, ItemFn, Lit, Meta, NestedMeta, Token};

/// Levels accepted by [`macro@test_traced`].
const LEVELS: [&str; 5] = ["TRACE", "DEBUG", "INFO", "WARN", "ERROR"];

/// Run a test with a `tracing` subscriber that writes to the test harness.
///
/// The level defaults to `DEBUG` and can be overridden with either
/// `#[test_traced("TRACE")]` or `#[test_traced(level = "TRACE")]`.
///
/// The subscriber is scoped to the test thread. Threads spawned by the test
/// do not inherit it.
#[proc_macro_attribute]
pub fn test_traced(attr: TokenStream, item: TokenStream) -> TokenStream {
    let input = parse_macro_input!(item as ItemFn);
    let level = match parse_level(attr.into()) {
        Ok(level) => level,
        Err(err) => return err.to_compile_error().into(),
    };

    let attrs = &input.attrs;
    let vis = &input.vis;
    let sig = &input.sig;
    let block = &input.block;
    let level = Ident::new(&level, Span::call_site());

    let expanded = quote! {
        #[test]
        #(#attrs)*
        #vis #sig {
            let subscriber = ::recycle_macros::tracing_subscriber::fmt()
                .with_test_writer()
                .with_max_level(::recycle_macros::tracing::Level::#level)
                .with_line_number(true)
                .finish();
            ::recycle_macros::tracing::subscriber::with_default(subscriber, || #block)
        }
    };
    TokenStream::from(expanded)
}

fn parse_level(attr: proc_macro2::TokenStream) -> syn::Result<String> {
    if attr.is_empty() {
        return Ok("DEBUG".to_string());
    }
    let args = Punctuated::<NestedMeta, Token![,]>::parse_terminated.parse2(attr)?;
    let mut level = None;
    for arg in args {
        let lit = match arg {
            NestedMeta::Lit(Lit::Str(lit)) => lit,
            NestedMeta::Meta(Meta::NameValue(nv)) if nv.path.is_ident("level") => match nv.lit {
                Lit::Str(lit) => lit,
                other => return Err(syn::Error::new_spanned(other, "level must be a string")),
            },
            other => return Err(syn::Error::new_spanned(other, "unsupported argument")),
        };
        let value = lit.value().to_ascii_uppercase();
        if !LEVELS.contains(&value.as_str()) {
            return Err(syn::Error::new(
                lit.span(),
                format!("invalid level `{}`, expected one of {:?}", lit.value(), LEVELS),
            ));
        }
        level = Some(value);
    }
    Ok(level.unwrap_or_else(|| "DEBUG".to_string()))
}
