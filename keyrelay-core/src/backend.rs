use crate::errors::Result;
use crate::path::SecretPath;
use crate::types::SecretValue;
use async_trait::async_trait;
use rand::Rng;
use rand::distr::Alphanumeric;
use std::collections::BTreeMap;

pub mod memory;

#[cfg(feature = "aws-sm")]
pub mod aws;
#[cfg(feature = "vault-kv")]
pub mod vault;

/// Length of the material generated for each field during a rotation.
const ROTATED_FIELD_LEN: usize = 32;

/// Common contract every vendor adapter implements.
///
/// Adapters translate these calls into vendor-specific API requests and map
/// vendor failures into the shared [`crate::Error`] taxonomy. They hold no
/// local state across calls beyond the vendor client handle; network I/O is
/// their only side effect.
#[async_trait]
pub trait SecretsBackend: Send + Sync {
    /// Short backend label recorded in audit events.
    fn name(&self) -> &str;

    /// Read the current value at `path`; `None` when no live secret exists.
    async fn fetch(&self, path: &SecretPath) -> Result<Option<SecretValue>>;

    /// Write `fields` as a new version and return its number.
    ///
    /// With `expected_version` set the write is compare-and-set: it fails
    /// with `Conflict` unless the current version matches. `Some(0)` asserts
    /// the secret does not exist yet.
    async fn store(
        &self,
        path: &SecretPath,
        fields: BTreeMap<String, String>,
        expected_version: Option<u64>,
    ) -> Result<u64>;

    /// Regenerate the material of every field at `path` as a new version and
    /// return it. Fails with `NotFound` when no live secret exists.
    async fn rotate(&self, path: &SecretPath) -> Result<SecretValue>;

    /// Remove the secret at `path`. Fails with `NotFound` when absent.
    async fn delete(&self, path: &SecretPath) -> Result<()>;
}

#[async_trait]
impl<T> SecretsBackend for Box<T>
where
    T: SecretsBackend + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn fetch(&self, path: &SecretPath) -> Result<Option<SecretValue>> {
        (**self).fetch(path).await
    }

    async fn store(
        &self,
        path: &SecretPath,
        fields: BTreeMap<String, String>,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        (**self).store(path, fields, expected_version).await
    }

    async fn rotate(&self, path: &SecretPath) -> Result<SecretValue> {
        (**self).rotate(path).await
    }

    async fn delete(&self, path: &SecretPath) -> Result<()> {
        (**self).delete(path).await
    }
}

#[async_trait]
impl<T> SecretsBackend for std::sync::Arc<T>
where
    T: SecretsBackend + ?Sized,
{
    fn name(&self) -> &str {
        (**self).name()
    }

    async fn fetch(&self, path: &SecretPath) -> Result<Option<SecretValue>> {
        (**self).fetch(path).await
    }

    async fn store(
        &self,
        path: &SecretPath,
        fields: BTreeMap<String, String>,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        (**self).store(path, fields, expected_version).await
    }

    async fn rotate(&self, path: &SecretPath) -> Result<SecretValue> {
        (**self).rotate(path).await
    }

    async fn delete(&self, path: &SecretPath) -> Result<()> {
        (**self).delete(path).await
    }
}

/// Fresh random material for every field of a rotated secret.
pub(crate) fn regenerate_fields(fields: &BTreeMap<String, String>) -> BTreeMap<String, String> {
    fields
        .keys()
        .map(|name| (name.clone(), random_material()))
        .collect()
}

fn random_material() -> String {
    rand::rng()
        .sample_iter(Alphanumeric)
        .take(ROTATED_FIELD_LEN)
        .map(char::from)
        .collect()
}
