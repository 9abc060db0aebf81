//! The slice of serde's attribute grammar that decides deserialized key names.
//!
//! Only `rename`, `rename_all`, `skip`, `skip_deserializing` and `flatten`
//! matter here. Every other serde attribute is parsed past and ignored.

use syn::meta::ParseNestedMeta;
use syn::{Attribute, LitStr, Token};

/// Key naming conventions accepted by `#[serde(rename_all = "...")]`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum RenameRule {
    Lower,
    Upper,
    Pascal,
    Camel,
    Snake,
    ScreamingSnake,
    Kebab,
    ScreamingKebab,
}

impl RenameRule {
    fn from_str(rule: &str) -> Option<Self> {
        Some(match rule {
            "lowercase" => RenameRule::Lower,
            "UPPERCASE" => RenameRule::Upper,
            "PascalCase" => RenameRule::Pascal,
            "camelCase" => RenameRule::Camel,
            "snake_case" => RenameRule::Snake,
            "SCREAMING_SNAKE_CASE" => RenameRule::ScreamingSnake,
            "kebab-case" => RenameRule::Kebab,
            "SCREAMING-KEBAB-CASE" => RenameRule::ScreamingKebab,
            _ => return None,
        })
    }

    /// Applies the rule to a snake_case field name.
    pub(crate) fn apply(self, field: &str) -> String {
        match self {
            RenameRule::Lower | RenameRule::Snake => field.to_string(),
            RenameRule::Upper | RenameRule::ScreamingSnake => field.to_ascii_uppercase(),
            RenameRule::Pascal => pascal_case(field),
            RenameRule::Camel => {
                let pascal = pascal_case(field);
                let mut chars = pascal.chars();
                match chars.next() {
                    Some(first) => first.to_ascii_lowercase().to_string() + chars.as_str(),
                    None => String::new(),
                }
            }
            RenameRule::Kebab => field.replace('_', "-"),
            RenameRule::ScreamingKebab => field.replace('_', "-").to_ascii_uppercase(),
        }
    }
}

fn pascal_case(field: &str) -> String {
    let mut out = String::with_capacity(field.len());
    let mut capitalize = true;
    for ch in field.chars() {
        if ch == '_' {
            capitalize = true;
        } else if capitalize {
            out.push(ch.to_ascii_uppercase());
            capitalize = false;
        } else {
            out.push(ch);
        }
    }
    out
}

#[derive(Default)]
pub(crate) struct ContainerAttrs {
    pub rename_all: Option<RenameRule>,
}

#[derive(Default)]
pub(crate) struct FieldAttrs {
    pub rename: Option<String>,
    pub skip: bool,
    pub flatten: bool,
}

pub(crate) fn container_attrs(attrs: &[Attribute]) -> syn::Result<ContainerAttrs> {
    let mut out = ContainerAttrs::default();
    for attr in attrs.iter().filter(|a| a.path().is_ident("serde")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename_all") {
                if let Some(rule) = deserialize_value(&meta)? {
                    let parsed = RenameRule::from_str(&rule.value()).ok_or_else(|| {
                        syn::Error::new(rule.span(), format!("unknown rename rule `{}`", rule.value()))
                    })?;
                    out.rename_all = Some(parsed);
                }
                Ok(())
            } else {
                skip_meta(&meta)
            }
        })?;
    }
    Ok(out)
}

pub(crate) fn field_attrs(attrs: &[Attribute]) -> syn::Result<FieldAttrs> {
    let mut out = FieldAttrs::default();
    for attr in attrs.iter().filter(|a| a.path().is_ident("serde")) {
        attr.parse_nested_meta(|meta| {
            if meta.path.is_ident("rename") {
                if let Some(name) = deserialize_value(&meta)? {
                    out.rename = Some(name.value());
                }
                Ok(())
            } else if meta.path.is_ident("skip") || meta.path.is_ident("skip_deserializing") {
                out.skip = true;
                Ok(())
            } else if meta.path.is_ident("flatten") {
                out.flatten = true;
                Ok(())
            } else {
                skip_meta(&meta)
            }
        })?;
    }
    Ok(out)
}

/// Reads `key = "x"` or the `deserialize` half of
/// `key(serialize = "x", deserialize = "y")`.
fn deserialize_value(meta: &ParseNestedMeta) -> syn::Result<Option<LitStr>> {
    if meta.input.peek(Token![=]) {
        return Ok(Some(meta.value()?.parse()?));
    }
    let mut found = None;
    meta.parse_nested_meta(|inner| {
        let value: LitStr = inner.value()?.parse()?;
        if inner.path.is_ident("deserialize") {
            found = Some(value);
        }
        Ok(())
    })?;
    Ok(found)
}

fn skip_meta(meta: &ParseNestedMeta) -> syn::Result<()> {
    if meta.input.peek(Token![=]) {
        let _: syn::Expr = meta.value()?.parse()?;
    } else if meta.input.peek(syn::token::Paren) {
        let content;
        syn::parenthesized!(content in meta.input);
        let _: proc_macro2::TokenStream = content.parse()?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rename_rules() {
        let field = "lookup_user_id";
        assert_eq!(RenameRule::Camel.apply(field), "lookupUserId");
        assert_eq!(RenameRule::Pascal.apply(field), "LookupUserId");
        assert_eq!(RenameRule::Kebab.apply(field), "lookup-user-id");
        assert_eq!(RenameRule::ScreamingSnake.apply(field), "LOOKUP_USER_ID");
        assert_eq!(RenameRule::ScreamingKebab.apply(field), "LOOKUP-USER-ID");
        assert_eq!(RenameRule::Snake.apply(field), field);
    }

    #[test]
    fn test_field_attrs_read_deserialize_name() {
        let attrs: Vec<Attribute> = vec![
            syn::parse_quote!(#[serde(default, rename(serialize = "a", deserialize = "b"))]),
            syn::parse_quote!(#[serde(deserialize_with = "parse")]),
        ];
        let parsed = field_attrs(&attrs).unwrap();
        assert_eq!(parsed.rename.as_deref(), Some("b"));
        assert!(!parsed.skip);
    }

    #[test]
    fn test_unknown_rule_is_an_error() {
        let attrs: Vec<Attribute> = vec![syn::parse_quote!(#[serde(rename_all = "Train-Case")])];
        assert!(container_attrs(&attrs).is_err());
    }
}
