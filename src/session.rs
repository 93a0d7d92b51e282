use std::fmt;

use serde::{Serialize, Serializer};
use thiserror::Error;

/// Maximum length of a session name, in bytes.
pub const MAX_SESSION_NAME_LEN: usize = 64;

/// Validate a session name. Names must be 1-64 chars, ASCII alphanumeric/hyphens/underscores/dots,
/// and must not contain a `..` sequence.
pub fn validate_session_name(name: &str) -> Result<(), String> {
    if name.is_empty() {
        return Err("session name must not be empty".into());
    }
    if name.len() > MAX_SESSION_NAME_LEN {
        return Err(format!(
            "session name too long ({} chars, max {})",
            name.len(),
            MAX_SESSION_NAME_LEN
        ));
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err("session name contains invalid characters".into());
    }
    if name == "." || name.contains("..") {
        return Err("session name must not contain path traversal sequences".into());
    }
    Ok(())
}

/// Returns `true` if `candidate` may be used to look up a backing session.
pub fn is_valid_session_name(candidate: &str) -> bool {
    validate_session_name(candidate).is_ok()
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("invalid session name: {reason}")]
pub struct InvalidSessionName {
    pub reason: String,
}

/// A session name that has passed [`validate_session_name`].
///
/// The output source and the stream manager only accept this type, so a raw
/// request string can never reach the multiplexer without validation.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SessionName(String);

impl SessionName {
    pub fn parse(candidate: &str) -> Result<Self, InvalidSessionName> {
        validate_session_name(candidate)
            .map(|()| Self(candidate.to_string()))
            .map_err(|reason| InvalidSessionName { reason })
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SessionName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for SessionName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl Serialize for SessionName {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}
