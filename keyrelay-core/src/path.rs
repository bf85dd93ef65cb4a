use crate::errors::{Error, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Validates that a path segment is non-empty and uses the supported alphabet.
pub(crate) fn validate_segment(value: &str, field: &'static str) -> Result<()> {
    if value.trim().is_empty() {
        return Err(Error::EmptyComponent { field });
    }

    if !value
        .chars()
        .all(|c| matches!(c, 'a'..='z' | '0'..='9' | '-' | '_' | '.'))
    {
        return Err(Error::InvalidCharacters {
            field,
            value: value.to_string(),
        });
    }

    Ok(())
}

/// Hierarchical secret identifier, e.g. `secret/db`.
///
/// Paths are `/`-separated lowercase segments, unique per backend namespace.
/// Prefix relationships between paths drive policy evaluation.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SecretPath {
    segments: Vec<String>,
}

impl SecretPath {
    /// Parse and validate a path from its string form.
    pub fn parse(input: &str) -> Result<Self> {
        let raw = input.trim().trim_matches('/');
        if raw.is_empty() {
            return Err(Error::EmptyPath);
        }

        let mut segments = Vec::new();
        for segment in raw.split('/') {
            validate_segment(segment, "path segment")?;
            segments.push(segment.to_string());
        }

        Ok(Self { segments })
    }

    /// Borrow the individual segments.
    pub fn segments(&self) -> &[String] {
        &self.segments
    }

    /// Number of segments in the path.
    pub fn depth(&self) -> usize {
        self.segments.len()
    }

    /// Returns true when `prefix` is a segment-wise prefix of this path.
    ///
    /// `secret/db` is a prefix of `secret/db/creds` but `secret/d` is not.
    pub fn starts_with(&self, prefix: &SecretPath) -> bool {
        prefix.segments.len() <= self.segments.len()
            && self
                .segments
                .iter()
                .zip(prefix.segments.iter())
                .all(|(a, b)| a == b)
    }
}

impl fmt::Display for SecretPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.segments.join("/"))
    }
}

impl FromStr for SecretPath {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        SecretPath::parse(s)
    }
}

impl TryFrom<&str> for SecretPath {
    type Error = Error;

    fn try_from(value: &str) -> Result<Self> {
        SecretPath::parse(value)
    }
}

impl TryFrom<String> for SecretPath {
    type Error = Error;

    fn try_from(value: String) -> Result<Self> {
        SecretPath::parse(&value)
    }
}

impl Serialize for SecretPath {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: serde::Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for SecretPath {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: serde::Deserializer<'de>,
    {
        let value = String::deserialize(deserializer)?;
        SecretPath::parse(&value).map_err(serde::de::Error::custom)
    }
}
