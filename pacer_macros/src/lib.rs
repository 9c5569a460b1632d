//! Procedural macros for `pacer`.
//!
//! They only remove boilerplate; everything they generate can be written by hand.

use proc_macro::TokenStream;
use quote::quote;
use syn::{ItemStruct, parse_macro_input};

extern crate proc_macro;

/// Declares a struct as a `pacer` metric.
///
/// Derives the serde and comparison traits `Metric` requires and implements the
/// marker trait. `Metric` must be in scope where the attribute is used.
#[proc_macro_attribute]
pub fn metric(_attr: TokenStream, item: TokenStream) -> TokenStream {
    let ast = parse_macro_input!(item as ItemStruct);
    let input_struct = &ast.ident;
    let (impl_generics, ty_generics, where_clause) = ast.generics.split_for_impl();
    let expanded = quote! {
        #[derive(
            serde::Serialize,
            serde::Deserialize,
            std::cmp::PartialOrd,
            std::cmp::PartialEq,
            std::fmt::Debug,
            std::clone::Clone
        )]
        #ast

        impl #impl_generics Metric for #input_struct #ty_generics #where_clause {}
    };

    TokenStream::from(expanded)
}
