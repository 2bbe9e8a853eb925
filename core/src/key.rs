//! Validated names for isolation domains (breakers, bulkheads, command groups)

use crate::errors::ValidationError;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::OnceLock;

/// Name of a breaker, bulkhead or command group.
///
/// Must start with a letter and contain at least three letters, digits or
/// underscores. Keys are cheap to clone and are used as map keys by the
/// factories and the config source.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Key {
    name: String,
}

impl Key {
    /// Validate `name` and build a key from it
    pub fn new(name: impl Into<String>) -> Result<Self, ValidationError> {
        let name = name.into();
        if key_pattern().is_match(&name) {
            Ok(Self { name })
        } else {
            Err(ValidationError::InvalidKey { name })
        }
    }

    /// The validated name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Placeholder key used by `Default` impls inside the crate
    pub(crate) fn placeholder() -> Self {
        Self {
            name: "default".to_string(),
        }
    }
}

fn key_pattern() -> &'static Regex {
    static KEY_RE: OnceLock<Regex> = OnceLock::new();
    KEY_RE.get_or_init(|| Regex::new(r"^[A-Za-z][A-Za-z0-9_]{2,}$").unwrap())
}

impl fmt::Display for Key {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}

impl AsRef<str> for Key {
    fn as_ref(&self) -> &str {
        &self.name
    }
}

impl TryFrom<String> for Key {
    type Error = ValidationError;

    fn try_from(name: String) -> Result<Self, Self::Error> {
        Key::new(name)
    }
}

impl TryFrom<&str> for Key {
    type Error = ValidationError;

    fn try_from(name: &str) -> Result<Self, Self::Error> {
        Key::new(name)
    }
}

impl From<Key> for String {
    fn from(key: Key) -> Self {
        key.name
    }
}
