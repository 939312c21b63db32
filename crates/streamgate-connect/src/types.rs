//! Common types for streamgate-connect
//!
//! Workspace tokens and broker passwords travel through config files,
//! connector structs and API payloads. They are all wrapped in
//! [`SensitiveString`] so none of those paths can print them.

use schemars::JsonSchema;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};

/// A secret string (auth token, password) that never shows up in logs.
///
/// - `Debug` / `Display` print `[REDACTED]`
/// - serializing writes `"***REDACTED***"`, so config dumps stay clean
/// - [`expose_secret`](Self::expose_secret) hands out the real value
///
/// ```rust
/// use streamgate_connect::SensitiveString;
///
/// let token = SensitiveString::new("sdk-token-123");
/// assert_eq!(format!("{:?}", token), "[REDACTED]");
/// assert_eq!(token.expose_secret(), "sdk-token-123");
/// ```
#[derive(Clone)]
pub struct SensitiveString(SecretString);

impl SensitiveString {
    pub fn new(value: impl Into<String>) -> Self {
        Self(SecretString::new(value.into().into_boxed_str()))
    }

    /// Expose the secret value.
    ///
    /// Only call this where the raw value goes on the wire (auth headers).
    pub fn expose_secret(&self) -> &str {
        self.0.expose_secret()
    }

    pub fn is_empty(&self) -> bool {
        self.0.expose_secret().is_empty()
    }
}

impl std::fmt::Debug for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl std::fmt::Display for SensitiveString {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[REDACTED]")
    }
}

impl From<String> for SensitiveString {
    fn from(value: String) -> Self {
        Self::new(value)
    }
}

impl From<&str> for SensitiveString {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl Serialize for SensitiveString {
    fn serialize<S: serde::Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str("***REDACTED***")
    }
}

impl<'de> Deserialize<'de> for SensitiveString {
    fn deserialize<D: serde::Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let value = String::deserialize(deserializer)?;
        Ok(Self::new(value))
    }
}

impl JsonSchema for SensitiveString {
    fn schema_name() -> String {
        "SensitiveString".to_string()
    }

    fn json_schema(gen: &mut schemars::gen::SchemaGenerator) -> schemars::schema::Schema {
        let mut schema = gen.subschema_for::<String>();
        if let schemars::schema::Schema::Object(obj) = &mut schema {
            obj.format = Some("password".to_string());
            obj.metadata().description =
                Some("Secret value (token, password). Redacted in logs.".to_string());
        }
        schema
    }
}
