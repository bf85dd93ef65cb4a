use keyrelay_core::{SecretPath, SecretValue};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecretResponse {
    pub path: String,
    pub version: u64,
    pub fields: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_ttl_secs: Option<u64>,
}

impl SecretResponse {
    pub fn new(path: &SecretPath, value: SecretValue) -> Self {
        Self {
            path: path.to_string(),
            version: value.version,
            lease_ttl_secs: value.lease_ttl.map(|ttl| ttl.as_secs()),
            fields: value.fields,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct PutSecretRequest {
    pub fields: BTreeMap<String, String>,
    /// When set the write is compare-and-set against this version;
    /// `0` asserts the secret does not exist yet.
    #[serde(default)]
    pub expected_version: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PutSecretResponse {
    pub path: String,
    pub version: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    pub path: String,
    pub deleted: bool,
}
