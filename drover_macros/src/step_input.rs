use crate::serde_attrs::{container_attrs, field_attrs};
use proc_macro2::TokenStream;
use quote::quote;
use syn::{Data, DeriveInput, Fields};

const RUN_KEY: &str = "run";

pub(crate) fn expand(input: &DeriveInput) -> syn::Result<TokenStream> {
    let name = &input.ident;
    let fields = match &input.data {
        Data::Struct(data) => match &data.fields {
            Fields::Named(fields) => &fields.named,
            _ => {
                return Err(syn::Error::new_spanned(
                    name,
                    "StepInput can only be derived for structs with named fields",
                ))
            }
        },
        _ => {
            return Err(syn::Error::new_spanned(
                name,
                "StepInput can only be derived for structs",
            ))
        }
    };

    let container = container_attrs(&input.attrs)?;
    let mut has_run = false;
    let mut deps: Vec<String> = Vec::new();

    for field in fields {
        let attrs = field_attrs(&field.attrs)?;
        if attrs.flatten {
            return Err(syn::Error::new_spanned(
                field,
                "StepInput does not support #[serde(flatten)] fields",
            ));
        }
        if attrs.skip {
            continue;
        }

        let Some(ident) = &field.ident else { continue };
        let raw = ident.to_string();
        let field_name = raw.strip_prefix("r#").unwrap_or(&raw);
        let key = match (attrs.rename, container.rename_all) {
            (Some(rename), _) => rename,
            (None, Some(rule)) => rule.apply(field_name),
            (None, None) => field_name.to_string(),
        };

        if key == RUN_KEY {
            has_run = true;
        } else if deps.contains(&key) {
            return Err(syn::Error::new_spanned(
                field,
                format!("two fields deserialize from the key \"{key}\""),
            ));
        } else {
            deps.push(key);
        }
    }

    if !has_run {
        return Err(syn::Error::new_spanned(
            name,
            "StepInput requires a field that deserializes from the key \"run\"",
        ));
    }

    let (impl_generics, ty_generics, where_clause) = input.generics.split_for_impl();
    Ok(quote! {
        #[automatically_derived]
        impl #impl_generics ::drover::graph::StepInput for #name #ty_generics #where_clause {
            fn dependency_slugs() -> ::core::option::Option<&'static [&'static str]> {
                ::core::option::Option::Some(&[#(#deps),*])
            }
        }
    })
}
