#![deny(unsafe_code)]

//! Procedural macros for stagebox.
//!
//! - `#[derive(Redact)]`: hide staged values in `Debug` output
//! - `#[derive(SecureZeroize)]`: wipe sensitive fields explicitly and on drop
//! - `#[derive(Validate)]`: generate a `validate()` method from field annotations

extern crate proc_macro;

mod redact;
mod secure_zeroize;
mod validate;

use proc_macro::TokenStream;
use syn::{DeriveInput, parse_macro_input};

/// Derive a `Debug` implementation that hides sensitive fields.
///
/// Fields annotated with `#[redact]` render as `"[REDACTED]"`. When the
/// field type is an `Option`, presence is kept visible: `Some("[REDACTED]")`
/// or `None`, so a staged delete (no value) can still be told apart from a
/// staged update while debugging.
///
/// # Example
///
/// ```ignore
/// use stagebox_macros::Redact;
///
/// #[derive(Redact)]
/// struct Change {
///     pub name: String,
///     #[redact]
///     pub value: Option<String>,
/// }
/// ```
#[proc_macro_derive(Redact, attributes(redact))]
pub fn derive_redact(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    redact::expand(input)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}

/// Derive `zeroize::Zeroize` plus a `Drop` that calls it.
///
/// Every named field is wiped unless marked `#[no_zeroize]`. The generated
/// `Zeroize` impl lets owners scrub a value before it is dropped (for
/// example when a buffer is replaced), while `Drop` covers every other path.
/// The consuming crate must depend on `zeroize`.
///
/// # Example
///
/// ```ignore
/// use stagebox_macros::SecureZeroize;
///
/// #[derive(SecureZeroize)]
/// struct Sealed {
///     pub bytes: Vec<u8>,
///     #[no_zeroize]
///     pub label: &'static str,
/// }
/// ```
#[proc_macro_derive(SecureZeroize, attributes(no_zeroize))]
pub fn derive_secure_zeroize(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    secure_zeroize::expand(input)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}

/// Derive a `validate(&self) -> Result<(), Vec<String>>` method.
///
/// Field attributes:
/// - `#[validate(non_empty)]`: string/collection must not be empty
/// - `#[validate(range(min = N, max = M))]`: integer value in `[N, M]`
/// - `#[validate(min_len = N)]` / `#[validate(max_len = N)]`: length bounds
///
/// A struct-level `#[validate(section = "daemon")]` prefixes every message
/// with the section name (`daemon.read_timeout_ms: must be at most 9999`),
/// matching how configuration errors name TOML keys.
///
/// # Example
///
/// ```ignore
/// use stagebox_macros::Validate;
///
/// #[derive(Validate)]
/// #[validate(section = "client")]
/// struct ClientConfig {
///     #[validate(range(min = 1, max = 60000))]
///     pub connect_timeout_ms: u64,
/// }
/// ```
#[proc_macro_derive(Validate, attributes(validate))]
pub fn derive_validate(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    validate::expand(input)
        .unwrap_or_else(|e| e.to_compile_error())
        .into()
}
