//! Implementation of `#[derive(SecureZeroize)]`.
//!
//! Generates `zeroize::Zeroize` for the struct (wiping every field not marked
//! `#[no_zeroize]`) and a `Drop` implementation that calls it.
//!
//! The consuming crate must have `zeroize` as a dependency.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{DeriveInput, Result};

pub fn expand(input: DeriveInput) -> Result<TokenStream> {
    let name = &input.ident;

    let fields = match &input.data {
        syn::Data::Struct(data) => match &data.fields {
            syn::Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    name,
                    "SecureZeroize only supports structs with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                name,
                "SecureZeroize can only be derived for structs",
            ));
        }
    };

    let mut zeroize_calls = Vec::new();
    for f in fields {
        if f.attrs.iter().any(|a| a.path().is_ident("no_zeroize")) {
            continue;
        }
        let field_name = f
            .ident
            .as_ref()
            .ok_or_else(|| syn::Error::new_spanned(f, "expected a named field"))?;
        zeroize_calls.push(quote! {
            ::zeroize::Zeroize::zeroize(&mut self.#field_name);
        });
    }

    if zeroize_calls.is_empty() {
        return Err(syn::Error::new_spanned(
            name,
            "SecureZeroize needs at least one field without #[no_zeroize]",
        ));
    }

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::zeroize::Zeroize for #name #ty_generics #where_clause {
            fn zeroize(&mut self) {
                #(#zeroize_calls)*
            }
        }

        impl #impl_generics ::std::ops::Drop for #name #ty_generics #where_clause {
            fn drop(&mut self) {
                ::zeroize::Zeroize::zeroize(self);
            }
        }
    })
}
