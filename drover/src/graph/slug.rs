//! Validated identifiers for flows and steps
//!
//! A slug names a flow or a step and doubles as the key a step's output is
//! published under in its dependents' input, so it must survive being used
//! as a JSON object key, a queue name and a SQL literal.

use serde::{Deserialize, Serialize};
use std::borrow::Borrow;
use std::fmt;
use thiserror::Error;

/// Longest slug accepted, in UTF-16 code units, so a character outside the
/// Basic Multilingual Plane counts twice.
pub const MAX_SLUG_LENGTH: usize = 128;

const SPECIAL_CHARACTERS: [char; 4] = ['/', ':', '?', '#'];

/// Why a string was rejected as a slug.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum SlugError {
    #[error("Slug cannot be longer than {MAX_SLUG_LENGTH} characters")]
    TooLong,

    #[error("Slug cannot start with a number")]
    LeadingDigit,

    #[error("Slug cannot start with an underscore")]
    LeadingUnderscore,

    #[error("Slug cannot contain spaces")]
    Whitespace,

    #[error("Slug cannot contain special characters like /, :, ?, #")]
    SpecialCharacter,
}

/// Identifier of a flow or a step.
///
/// # Examples
///
/// ```
/// use drover::graph::{Slug, SlugError};
///
/// let slug = Slug::new("send_email").unwrap();
/// assert_eq!(slug.as_str(), "send_email");
///
/// assert_eq!(Slug::new("1st").unwrap_err(), SlugError::LeadingDigit);
/// assert_eq!(Slug::new("a/b").unwrap_err(), SlugError::SpecialCharacter);
/// ```
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Slug(String);

impl Slug {
    pub fn new(value: impl Into<String>) -> Result<Self, SlugError> {
        let value = value.into();
        validate(&value)?;
        Ok(Self(value))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

fn validate(value: &str) -> Result<(), SlugError> {
    if value.encode_utf16().count() > MAX_SLUG_LENGTH {
        return Err(SlugError::TooLong);
    }
    match value.chars().next() {
        Some(c) if c.is_ascii_digit() => return Err(SlugError::LeadingDigit),
        Some('_') => return Err(SlugError::LeadingUnderscore),
        _ => {}
    }
    if value.chars().any(char::is_whitespace) {
        return Err(SlugError::Whitespace);
    }
    if value.contains(SPECIAL_CHARACTERS) {
        return Err(SlugError::SpecialCharacter);
    }
    Ok(())
}

impl fmt::Display for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for Slug {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Slug({})", self.0)
    }
}

impl TryFrom<String> for Slug {
    type Error = SlugError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for Slug {
    type Error = SlugError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<Slug> for String {
    fn from(slug: Slug) -> Self {
        slug.0
    }
}

impl AsRef<str> for Slug {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Borrow<str> for Slug {
    fn borrow(&self) -> &str {
        &self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_accepts_ordinary_slugs() {
        for ok in ["a", "send_email", "step-2", "Flow.v2", "ümlaut", "a_"] {
            assert!(Slug::new(ok).is_ok(), "{ok} should be valid");
        }
    }

    #[test]
    fn test_length_limit_counts_utf16_units() {
        assert!(Slug::new("a".repeat(128)).is_ok());
        assert_eq!(Slug::new("a".repeat(129)), Err(SlugError::TooLong));
        assert!(Slug::new("é".repeat(128)).is_ok());
        // U+1D11E takes a surrogate pair.
        assert!(Slug::new("𝄞".repeat(64)).is_ok());
        assert_eq!(Slug::new("𝄞".repeat(65)), Err(SlugError::TooLong));
    }

    #[test]
    fn test_each_rule_has_its_own_reason() {
        assert_eq!(Slug::new("9lives"), Err(SlugError::LeadingDigit));
        assert_eq!(Slug::new("_private"), Err(SlugError::LeadingUnderscore));
        assert_eq!(Slug::new("two words"), Err(SlugError::Whitespace));
        assert_eq!(Slug::new("tab\there"), Err(SlugError::Whitespace));
        for bad in ["a/b", "a:b", "a?b", "a#b"] {
            assert_eq!(Slug::new(bad), Err(SlugError::SpecialCharacter), "{bad}");
        }
    }

    #[test]
    fn test_error_messages() {
        assert_eq!(
            SlugError::TooLong.to_string(),
            "Slug cannot be longer than 128 characters"
        );
        assert_eq!(
            SlugError::SpecialCharacter.to_string(),
            "Slug cannot contain special characters like /, :, ?, #"
        );
    }

    #[test]
    fn test_serde_validates_on_deserialize() {
        let slug: Slug = serde_json::from_str("\"fetch\"").unwrap();
        assert_eq!(slug.as_str(), "fetch");
        assert!(serde_json::from_str::<Slug>("\"_hidden\"").is_err());
    }

    #[test]
    fn test_display_and_debug() {
        let slug = Slug::new("fetch").unwrap();
        assert_eq!(slug.to_string(), "fetch");
        assert_eq!(format!("{slug:?}"), "Slug(fetch)");
    }
}
