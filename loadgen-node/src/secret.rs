use crate::error::{LoadgenError, Result};
use serde::{Serialize, Serializer};
use sha2::{Digest, Sha256};
use std::fmt;
use tracing::{error, info};

/// A secret value that never shows up in logs or Debug output
///
/// The bearer token lives in one of these for the whole run. The raw value
/// is only reachable through [`Secret::expose_secret`].
#[derive(Clone)]
pub struct Secret<T> {
    inner: T,
}

impl<T> Secret<T> {
    pub fn new(value: T) -> Self {
        Self { inner: value }
    }

    /// Expose the secret value (use with caution)
    pub fn expose_secret(&self) -> &T {
        &self.inner
    }
}

impl Secret<String> {
    /// Header value for `profile` from the raw value of `var_name`
    ///
    /// The value may hold either `Bearer <jwt>` or the bare token; a bare
    /// token gets the `Bearer ` scheme prepended. A blank value is a
    /// [`LoadgenError::MissingToken`].
    pub fn bearer_for_profile(raw: &str, var_name: &str, profile: &str) -> Result<Self> {
        Self::bearer_from_raw(raw).ok_or_else(|| LoadgenError::MissingToken {
            profile: profile.to_string(),
            env_key: var_name.to_string(),
        })
    }

    /// Build a header value from an already-read token, `None` when blank
    pub fn bearer_from_raw(raw: &str) -> Option<Self> {
        let trimmed = raw.trim();
        if trimmed.is_empty() {
            return None;
        }
        let has_scheme = trimmed
            .get(..7)
            .map(|p| p.eq_ignore_ascii_case("bearer "))
            .unwrap_or(false);
        if has_scheme {
            Some(Self::new(trimmed.to_string()))
        } else {
            Some(Self::new(format!("Bearer {}", trimmed)))
        }
    }

    /// Short, stable fingerprint that can be logged in place of the token
    pub fn digest(&self) -> String {
        let token = self
            .inner
            .split_whitespace()
            .nth(1)
            .unwrap_or_default();
        let hash = Sha256::digest(token.as_bytes());
        hash.iter().take(4).map(|b| format!("{:02x}", b)).collect()
    }

    /// Length of the full header value
    pub fn len(&self) -> usize {
        self.inner.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.is_empty()
    }

    /// True when the value carries CR/LF/TAB or other control characters
    pub fn has_control_chars(&self) -> bool {
        self.inner.chars().any(|c| c.is_control())
    }
}

/// Token facts that are safe to log
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TokenDiagnostics {
    pub env_key: String,
    pub raw_len: usize,
    pub raw_has_control_chars: bool,
    pub bearer_len: usize,
    pub digest: String,
}

impl TokenDiagnostics {
    pub fn new(env_key: &str, raw: &str, bearer: &Secret<String>) -> Self {
        Self {
            env_key: env_key.to_string(),
            raw_len: raw.len(),
            raw_has_control_chars: raw.chars().any(|c| c.is_control()),
            bearer_len: bearer.len(),
            digest: bearer.digest(),
        }
    }

    pub fn log(&self) {
        info!(
            env_key = %self.env_key,
            raw_len = self.raw_len,
            bearer_len = self.bearer_len,
            digest = %self.digest,
            "Using auth token"
        );
        if self.raw_has_control_chars {
            error!(
                env_key = %self.env_key,
                "Token contains control characters (CR/LF/TAB); supply it as one clean line"
            );
        }
    }
}

impl<T> fmt::Debug for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl<T> fmt::Display for Secret<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("[REDACTED]")
    }
}

impl Serialize for Secret<String> {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str("[REDACTED]")
    }
}
