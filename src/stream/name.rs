//! Validated, path-like stream names
//!
//! A stream name is a sequence of `/`-separated segments. Each segment starts
//! with an alphanumeric character followed by alphanumerics or `:_-.`.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::StreamError;

static SEGMENT_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9:_\-.]*$").expect("valid segment regex"));

/// Separator between stream name segments
pub const SEPARATOR: char = '/';

/// A validated stream name such as `annotee/steps/compile/stdout`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct StreamName(String);

impl StreamName {
    /// Parse and validate a stream name
    pub fn new(name: impl Into<String>) -> Result<Self, StreamError> {
        let name = name.into();
        if name.is_empty() {
            return Err(StreamError::InvalidName {
                name,
                reason: "name is empty".to_string(),
            });
        }
        for segment in name.split(SEPARATOR) {
            if !SEGMENT_RE.is_match(segment) {
                return Err(StreamError::InvalidName {
                    reason: format!("invalid segment {:?}", segment),
                    name,
                });
            }
        }
        Ok(Self(name))
    }

    /// Coerce arbitrary text into a single valid segment.
    ///
    /// Invalid characters become `_`; a leading non-alphanumeric character is
    /// prefixed with `s`. Empty input yields `s`.
    pub fn normalize(text: &str) -> Self {
        let mut out = String::with_capacity(text.len() + 1);
        for c in text.trim().chars() {
            if c.is_ascii_alphanumeric() || matches!(c, ':' | '_' | '-' | '.') {
                out.push(c);
            } else {
                out.push('_');
            }
        }
        if !out.starts_with(|c: char| c.is_ascii_alphanumeric()) {
            out.insert(0, 's');
        }
        Self(out)
    }

    /// Append all segments of `other`
    pub fn join(&self, other: &StreamName) -> StreamName {
        StreamName(format!("{}{}{}", self.0, SEPARATOR, other.0))
    }

    /// Append a fixed, already-valid segment
    pub(crate) fn child(&self, segment: &str) -> StreamName {
        self.join(&StreamName::normalize(segment))
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split(SEPARATOR)
    }

    pub fn last_segment(&self) -> &str {
        self.0.rsplit(SEPARATOR).next().unwrap_or(&self.0)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for StreamName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for StreamName {
    type Error = StreamError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for StreamName {
    type Error = StreamError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<StreamName> for String {
    fn from(name: StreamName) -> Self {
        name.0
    }
}

impl AsRef<str> for StreamName {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
