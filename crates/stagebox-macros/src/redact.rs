//! Implementation of `#[derive(Redact)]`.

use proc_macro2::TokenStream;
use quote::quote;
use syn::{DeriveInput, Result, Type};

pub fn expand(input: DeriveInput) -> Result<TokenStream> {
    let name = &input.ident;

    let fields = match &input.data {
        syn::Data::Struct(data) => match &data.fields {
            syn::Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    name,
                    "Redact only supports structs with named fields",
                ));
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                name,
                "Redact can only be derived for structs",
            ));
        }
    };

    let mut field_debug = Vec::with_capacity(fields.len());
    for f in fields {
        let field_name = f
            .ident
            .as_ref()
            .ok_or_else(|| syn::Error::new_spanned(f, "expected a named field"))?;
        let field_name_str = field_name.to_string();
        let is_redacted = f.attrs.iter().any(|a| a.path().is_ident("redact"));

        let tokens = if !is_redacted {
            quote! { .field(#field_name_str, &self.#field_name) }
        } else if is_option(&f.ty) {
            quote! {
                .field(#field_name_str, &self.#field_name.as_ref().map(|_| "[REDACTED]"))
            }
        } else {
            quote! { .field(#field_name_str, &"[REDACTED]") }
        };
        field_debug.push(tokens);
    }

    let name_str = name.to_string();

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics ::std::fmt::Debug for #name #ty_generics #where_clause {
            fn fmt(&self, f: &mut ::std::fmt::Formatter<'_>) -> ::std::fmt::Result {
                f.debug_struct(#name_str)
                    #(#field_debug)*
                    .finish()
            }
        }
    })
}

/// Whether the field's declared type is spelled `Option<..>`.
fn is_option(ty: &Type) -> bool {
    match ty {
        Type::Path(path) if path.qself.is_none() => path
            .path
            .segments
            .last()
            .is_some_and(|segment| segment.ident == "Option"),
        _ => false,
    }
}
