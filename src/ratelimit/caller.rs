//! Caller identity handling.

use std::fmt;

use crate::error::{GatewayError, Result};

/// The identity every limit is keyed on.
///
/// The gateway never authenticates it; it only guarantees that the string
/// handed over by the authentication layer is non-empty.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CallerId(String);

impl CallerId {
    /// Create a caller identity, rejecting empty strings.
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.is_empty() {
            return Err(GatewayError::InvalidCaller(
                "caller identity must not be empty".to_string(),
            ));
        }
        Ok(Self(id))
    }

    /// The raw identity, as used in storage keys.
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// A log-safe rendering showing only the first and last four characters.
    pub fn masked(&self) -> String {
        let chars: Vec<char> = self.0.chars().collect();
        if chars.len() <= 8 {
            return "***".to_string();
        }

        let head: String = chars[..4].iter().collect();
        let tail: String = chars[chars.len() - 4..].iter().collect();
        format!("{}...{}", head, tail)
    }
}

impl fmt::Display for CallerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.masked())
    }
}
