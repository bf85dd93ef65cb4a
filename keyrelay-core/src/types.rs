use crate::errors::Result;
use crate::path::validate_segment;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

/// Capabilities a policy rule may grant on a path prefix.
///
/// `delete` is a destructive write and is governed by [`Capability::Write`].
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "lowercase")]
pub enum Capability {
    Read,
    Write,
    Rotate,
}

impl Capability {
    /// Stable string label used in audit records and policy documents.
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Read => "read",
            Self::Write => "write",
            Self::Rotate => "rotate",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A secret's material plus the metadata the broker tracks for it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct SecretValue {
    /// Field name to string value.
    pub fields: BTreeMap<String, String>,
    /// Monotonic version assigned by the backend, per path.
    pub version: u64,
    /// Backend-reported lease duration; absent for static secrets.
    #[serde(
        default,
        rename = "lease_ttl_secs",
        skip_serializing_if = "Option::is_none",
        with = "lease_secs"
    )]
    pub lease_ttl: Option<Duration>,
}

impl SecretValue {
    /// Construct a static (lease-less) value.
    pub fn new(fields: BTreeMap<String, String>, version: u64) -> Self {
        Self {
            fields,
            version,
            lease_ttl: None,
        }
    }

    /// Attach a backend-granted lease duration.
    pub fn with_lease(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    /// Look up a single field.
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(String::as_str)
    }
}

mod lease_secs {
    use serde::{Deserialize, Deserializer, Serialize, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(value: &Option<Duration>, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        value.map(|d| d.as_secs()).serialize(serializer)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<Duration>, D::Error>
    where
        D: Deserializer<'de>,
    {
        Ok(Option::<u64>::deserialize(deserializer)?.map(Duration::from_secs))
    }
}

/// Actor attempting an operation, resolved once per request from the
/// presented credential and never persisted beyond it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallerIdentity {
    subject: String,
}

impl CallerIdentity {
    /// Construct a caller with a validated subject.
    pub fn new(subject: impl Into<String>) -> Result<Self> {
        let subject = subject.into();
        validate_segment(&subject, "subject")?;
        Ok(Self { subject })
    }

    /// Subject identifier (for policy lookup and auditing).
    pub fn subject(&self) -> &str {
        &self.subject
    }
}

impl fmt::Display for CallerIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.subject)
    }
}
