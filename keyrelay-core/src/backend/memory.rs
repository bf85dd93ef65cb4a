use crate::backend::{SecretsBackend, regenerate_fields};
use crate::errors::{Error, Result};
use crate::path::SecretPath;
use crate::types::SecretValue;
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;
use std::time::Duration;

const BACKEND_NAME: &str = "memory";

/// In-process versioned backend for development mode and tests.
#[derive(Debug, Default)]
pub struct MemoryBackend {
    state: Mutex<HashMap<SecretPath, Vec<StoredVersion>>>,
    lease_ttl: Option<Duration>,
}

#[derive(Debug, Clone)]
struct StoredVersion {
    version: u64,
    deleted: bool,
    fields: Option<BTreeMap<String, String>>,
}

impl StoredVersion {
    fn live(version: u64, fields: BTreeMap<String, String>) -> Self {
        Self {
            version,
            deleted: false,
            fields: Some(fields),
        }
    }

    fn tombstone(version: u64) -> Self {
        Self {
            version,
            deleted: true,
            fields: None,
        }
    }
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Report a lease duration on fetched values, as a leasing backend would.
    pub fn with_lease_ttl(mut self, ttl: Duration) -> Self {
        self.lease_ttl = Some(ttl);
        self
    }

    fn current_version(versions: &[StoredVersion]) -> u64 {
        versions.last().map(|v| v.version).unwrap_or(0)
    }

    fn live_value(&self, versions: &[StoredVersion]) -> Option<SecretValue> {
        let latest = versions.last()?;
        if latest.deleted {
            return None;
        }
        let fields = latest.fields.clone()?;
        let mut value = SecretValue::new(fields, latest.version);
        if let Some(ttl) = self.lease_ttl {
            value = value.with_lease(ttl);
        }
        Some(value)
    }
}

#[async_trait]
impl SecretsBackend for MemoryBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn fetch(&self, path: &SecretPath) -> Result<Option<SecretValue>> {
        let state = self.state.lock().expect("memory backend lock poisoned");
        Ok(state
            .get(path)
            .and_then(|versions| self.live_value(versions)))
    }

    async fn store(
        &self,
        path: &SecretPath,
        fields: BTreeMap<String, String>,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let mut state = self.state.lock().expect("memory backend lock poisoned");
        let versions = state.entry(path.clone()).or_default();
        let current = Self::current_version(versions);

        if let Some(expected) = expected_version {
            if expected != current {
                return Err(Error::Conflict {
                    expected,
                    actual: current,
                });
            }
        }

        let next = current + 1;
        versions.push(StoredVersion::live(next, fields));
        Ok(next)
    }

    async fn rotate(&self, path: &SecretPath) -> Result<SecretValue> {
        let mut state = self.state.lock().expect("memory backend lock poisoned");
        let versions = state.get_mut(path).ok_or_else(|| Error::NotFound {
            path: path.to_string(),
        })?;
        let current = self.live_value(versions).ok_or_else(|| Error::NotFound {
            path: path.to_string(),
        })?;

        let rotated = regenerate_fields(&current.fields);
        let next = Self::current_version(versions) + 1;
        versions.push(StoredVersion::live(next, rotated.clone()));

        let mut value = SecretValue::new(rotated, next);
        if let Some(ttl) = self.lease_ttl {
            value = value.with_lease(ttl);
        }
        Ok(value)
    }

    async fn delete(&self, path: &SecretPath) -> Result<()> {
        let mut state = self.state.lock().expect("memory backend lock poisoned");
        let versions = state.get_mut(path).ok_or_else(|| Error::NotFound {
            path: path.to_string(),
        })?;
        if self.live_value(versions).is_none() {
            return Err(Error::NotFound {
                path: path.to_string(),
            });
        }
        let next = Self::current_version(versions) + 1;
        versions.push(StoredVersion::tombstone(next));
        Ok(())
    }
}
