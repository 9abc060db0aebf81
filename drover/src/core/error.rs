use serde_json::Value;
use std::fmt;

/// Error type returned by user handlers.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A handler failure carrying an arbitrary JSON value.
///
/// Handlers that want to fail with structured data return this; the recorded
/// message is the value itself when it is a JSON string and its compact JSON
/// text otherwise.
///
/// ```
/// use drover::core::{error_message, BoxError, JsonError};
/// use serde_json::json;
///
/// let err: BoxError = JsonError(json!({"code": 42})).into();
/// assert_eq!(error_message(err.as_ref()), r#"{"code":42}"#);
///
/// let err: BoxError = JsonError(json!("plain")).into();
/// assert_eq!(error_message(err.as_ref()), "plain");
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct JsonError(pub Value);

impl fmt::Display for JsonError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.0 {
            Value::String(s) => f.write_str(s),
            other => write!(f, "{other}"),
        }
    }
}

impl std::error::Error for JsonError {}

/// Coerces a handler failure into the message recorded by the store.
///
/// String errors pass through unchanged, typed errors use their `Display`
/// text and [`JsonError`] values are JSON-stringified.
pub fn error_message(err: &(dyn std::error::Error + Send + Sync + 'static)) -> String {
    err.to_string()
}
