//! `#[derive(Validate)]`: field constraints checked by a generated
//! `validate(&self) -> Result<(), Vec<String>>`.

use proc_macro2::TokenStream;
use quote::quote;
use syn::meta::ParseNestedMeta;
use syn::punctuated::Punctuated;
use syn::token::Comma;
use syn::{DeriveInput, Field, Ident, LitInt, LitStr, Result};

/// One constraint on one field.
enum Rule {
    NonEmpty,
    MinLen(usize),
    MaxLen(usize),
    /// Inclusive bounds, compared as `i128` so any primitive integer fits.
    Range { min: Option<i128>, max: Option<i128> },
}

impl Rule {
    fn parse(meta: &ParseNestedMeta) -> Result<Self> {
        let path = &meta.path;
        if path.is_ident("non_empty") {
            Ok(Rule::NonEmpty)
        } else if path.is_ident("min_len") {
            Ok(Rule::MinLen(int_value(meta)?))
        } else if path.is_ident("max_len") {
            Ok(Rule::MaxLen(int_value(meta)?))
        } else if path.is_ident("range") {
            let (mut min, mut max): (Option<i128>, Option<i128>) = (None, None);
            meta.parse_nested_meta(|bound| {
                if bound.path.is_ident("min") {
                    min = Some(int_value(&bound)?);
                } else if bound.path.is_ident("max") {
                    max = Some(int_value(&bound)?);
                } else {
                    return Err(bound.error("expected `min` or `max`"));
                }
                Ok(())
            })?;
            match (min, max) {
                (None, None) => Err(meta.error("range needs `min`, `max`, or both")),
                (Some(lo), Some(hi)) if lo > hi => Err(meta.error("range min is greater than max")),
                _ => Ok(Rule::Range { min, max }),
            }
        } else {
            Err(meta.error("unknown validate rule; expected non_empty, range, min_len, or max_len"))
        }
    }

    /// Code pushing a message onto `errors` when `self.<field>` breaks the rule.
    fn check(&self, field: &Ident, key: &str) -> TokenStream {
        let fail = |condition: TokenStream, message: String| {
            quote! {
                if #condition {
                    errors.push(::std::format!("{}: {}", #key, #message));
                }
            }
        };
        match self {
            Rule::NonEmpty => fail(
                quote!(self.#field.is_empty()),
                "must not be empty".to_string(),
            ),
            Rule::MinLen(n) => fail(
                quote!(self.#field.len() < #n),
                format!("length must be at least {n}"),
            ),
            Rule::MaxLen(n) => fail(
                quote!(self.#field.len() > #n),
                format!("length must be at most {n}"),
            ),
            Rule::Range { min, max } => {
                let lower = min.map(|n| {
                    fail(
                        quote!((self.#field as i128) < #n),
                        format!("must be at least {n}"),
                    )
                });
                let upper = max.map(|n| {
                    fail(
                        quote!((self.#field as i128) > #n),
                        format!("must be at most {n}"),
                    )
                });
                quote! { #lower #upper }
            }
        }
    }
}

fn int_value<N>(meta: &ParseNestedMeta) -> Result<N>
where
    N: std::str::FromStr,
    N::Err: std::fmt::Display,
{
    meta.value()?.parse::<LitInt>()?.base10_parse()
}

fn field_rules(field: &Field) -> Result<Vec<Rule>> {
    let mut rules = Vec::new();
    for attr in field.attrs.iter().filter(|a| a.path().is_ident("validate")) {
        attr.parse_nested_meta(|meta| {
            rules.push(Rule::parse(&meta)?);
            Ok(())
        })?;
    }
    Ok(rules)
}

/// The struct-level `#[validate(section = "...")]`, if any.
fn section(input: &DeriveInput) -> Result<Option<String>> {
    let mut section = None;
    for attr in input.attrs.iter().filter(|a| a.path().is_ident("validate")) {
        attr.parse_nested_meta(|meta| {
            if !meta.path.is_ident("section") {
                return Err(meta.error("unknown struct-level validate option; expected `section`"));
            }
            section = Some(meta.value()?.parse::<LitStr>()?.value());
            Ok(())
        })?;
    }
    Ok(section)
}

fn named_fields(input: &DeriveInput) -> Result<&Punctuated<Field, Comma>> {
    match &input.data {
        syn::Data::Struct(syn::DataStruct {
            fields: syn::Fields::Named(named),
            ..
        }) => Ok(&named.named),
        _ => Err(syn::Error::new_spanned(
            &input.ident,
            "Validate only supports structs with named fields",
        )),
    }
}

pub fn expand(input: DeriveInput) -> Result<TokenStream> {
    let section = section(&input)?;

    let mut checks = Vec::new();
    for field in named_fields(&input)? {
        let Some(ident) = &field.ident else { continue };
        let key = match &section {
            Some(section) => format!("{section}.{ident}"),
            None => ident.to_string(),
        };
        for rule in field_rules(field)? {
            checks.push(rule.check(ident, &key));
        }
    }

    let name = &input.ident;
    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();

    Ok(quote! {
        impl #impl_generics #name #ty_generics #where_clause {
            /// Check every `#[validate(...)]` constraint, collecting one
            /// message per violation.
            pub fn validate(&self) -> ::std::result::Result<(), ::std::vec::Vec<::std::string::String>> {
                let mut errors: ::std::vec::Vec<::std::string::String> = ::std::vec::Vec::new();
                #(#checks)*
                if errors.is_empty() {
                    ::std::result::Result::Ok(())
                } else {
                    ::std::result::Result::Err(errors)
                }
            }
        }
    })
}
