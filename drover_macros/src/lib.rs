//! Derive macros for drover.
//!
//! `#[derive(StepInput)]` lets a plain struct serve as a step's input type.
//! The struct needs a field named `run` (the flow input); every other field
//! names a dependency whose output it receives. Names follow the struct's
//! serde attributes, so `#[serde(rename = "...")]` and
//! `#[serde(rename_all = "...")]` work as they do for deserialization.

use proc_macro::TokenStream;
use syn::{parse_macro_input, DeriveInput};

mod serde_attrs;
mod step_input;

/// Implements `drover::graph::StepInput` for a struct with named fields.
///
/// The generated impl reports every field except `run` as a dependency slug.
/// `Flow::step` compares that list with the step's declared dependencies and
/// rejects the step when they differ.
///
/// # Example
///
/// ```
/// use drover::StepInput;
/// use serde::Deserialize;
///
/// #[derive(Deserialize, StepInput)]
/// #[serde(rename_all = "kebab-case")]
/// struct Input {
///     run: serde_json::Value,
///     fetch_user: String,
///     #[serde(skip)]
///     cache: Option<String>,
/// }
///
/// assert_eq!(
///     <Input as drover::graph::StepInput>::dependency_slugs(),
///     Some(&["fetch-user"][..])
/// );
/// ```
///
/// Structs without a `run` field, tuple structs, enums and unions are
/// rejected at compile time, as are `#[serde(flatten)]` fields, whose keys
/// cannot be known ahead of time.
#[proc_macro_derive(StepInput, attributes(serde))]
pub fn derive_step_input(input: TokenStream) -> TokenStream {
    let input = parse_macro_input!(input as DeriveInput);
    step_input::expand(&input)
        .unwrap_or_else(syn::Error::into_compile_error)
        .into()
}
