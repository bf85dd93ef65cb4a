//! HashiCorp Vault KV v2 backend using the live Vault HTTP API.
//!
//! Secrets live under a KV v2 mount at `{prefix}/{path}`. Field maps are
//! stored natively as the KV `data` object; compare-and-set writes use the
//! engine's `options.cas` parameter, and version numbers come straight from
//! the KV metadata.

use crate::backend::{SecretsBackend, regenerate_fields};
use crate::errors::{Error, Result};
use crate::path::SecretPath;
use crate::types::SecretValue;
use async_trait::async_trait;
use reqwest::{Client, Method, Response, StatusCode};
use serde::Deserialize;
use serde_json::{Value, json};
use std::collections::BTreeMap;
use std::time::Duration;

const BACKEND_NAME: &str = "vault";
const DEFAULT_MOUNT: &str = "secret";
const DEFAULT_PREFIX: &str = "keyrelay";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(15);

/// Connection settings for a Vault KV v2 mount.
///
/// Constructed explicitly by the caller; the adapter never reads process
/// environment.
#[derive(Debug, Clone)]
pub struct VaultKvConfig {
    pub addr: String,
    pub token: String,
    pub namespace: Option<String>,
    pub mount: String,
    pub prefix: String,
    pub timeout: Duration,
}

impl VaultKvConfig {
    pub fn new(addr: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            addr: addr.into(),
            token: token.into(),
            namespace: None,
            mount: DEFAULT_MOUNT.to_string(),
            prefix: DEFAULT_PREFIX.to_string(),
            timeout: DEFAULT_TIMEOUT,
        }
    }

    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    pub fn mount(mut self, mount: impl Into<String>) -> Self {
        self.mount = mount.into();
        self
    }

    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Vault KV v2 adapter.
pub struct VaultKvBackend {
    config: VaultKvConfig,
    client: Client,
}

impl VaultKvBackend {
    pub fn new(config: VaultKvConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|err| Error::Config(format!("failed to build vault http client: {err}")))?;
        Ok(Self { config, client })
    }

    fn api_url(&self, route: &str, path: &SecretPath) -> String {
        format!(
            "{addr}/v1/{mount}/{route}/{prefix}/{path}",
            addr = self.config.addr.trim_end_matches('/'),
            mount = self.config.mount.trim_matches('/'),
            route = route,
            prefix = self.config.prefix.trim_matches('/'),
            path = path
        )
    }

    async fn send(&self, method: Method, url: String, body: Option<Value>) -> Result<Response> {
        let mut request = self
            .client
            .request(method, url)
            .header("X-Vault-Token", &self.config.token);
        if let Some(namespace) = &self.config.namespace {
            request = request.header("X-Vault-Namespace", namespace);
        }
        if let Some(payload) = body {
            request = request.json(&payload);
        }
        request.send().await.map_err(|err| {
            if err.is_timeout() || err.is_connect() {
                Error::Unavailable(format!("vault request failed: {err}"))
            } else {
                Error::Internal(format!("vault request failed: {err}"))
            }
        })
    }

    async fn read_raw(&self, path: &SecretPath) -> Result<Option<KvReadResponse>> {
        let response = self
            .send(Method::GET, self.api_url("data", path), None)
            .await?;
        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let parsed: KvReadResponse = response.json().await.map_err(|err| {
                    Error::Internal(format!("failed to decode vault read response: {err}"))
                })?;
                Ok(Some(parsed))
            }
            status => Err(self.status_error("read secret", status, response).await),
        }
    }

    async fn current_version(&self, path: &SecretPath) -> u64 {
        let Ok(response) = self
            .send(Method::GET, self.api_url("metadata", path), None)
            .await
        else {
            return 0;
        };
        if !response.status().is_success() {
            return 0;
        }
        response
            .json::<KvMetadataResponse>()
            .await
            .map(|parsed| parsed.data.current_version)
            .unwrap_or(0)
    }

    async fn status_error(&self, operation: &str, status: StatusCode, response: Response) -> Error {
        let detail = response
            .json::<VaultErrorBody>()
            .await
            .map(|body| body.errors.join("; "))
            .unwrap_or_default();
        map_status(operation, status, &detail)
    }
}

#[async_trait]
impl SecretsBackend for VaultKvBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn fetch(&self, path: &SecretPath) -> Result<Option<SecretValue>> {
        let Some(parsed) = self.read_raw(path).await? else {
            return Ok(None);
        };

        let metadata = &parsed.data.metadata;
        if metadata.destroyed || !metadata.deletion_time.is_empty() {
            return Ok(None);
        }

        let fields = string_fields(path, parsed.data.data)?;
        let mut value = SecretValue::new(fields, metadata.version);
        if parsed.lease_duration > 0 {
            value = value.with_lease(Duration::from_secs(parsed.lease_duration));
        }
        Ok(Some(value))
    }

    async fn store(
        &self,
        path: &SecretPath,
        fields: BTreeMap<String, String>,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let mut body = json!({ "data": fields });
        if let Some(cas) = expected_version {
            body["options"] = json!({ "cas": cas });
        }

        let response = self
            .send(Method::POST, self.api_url("data", path), Some(body))
            .await?;
        let status = response.status();
        if status.is_success() {
            let parsed: KvWriteResponse = response.json().await.map_err(|err| {
                Error::Internal(format!("failed to decode vault write response: {err}"))
            })?;
            return Ok(parsed.data.version);
        }

        let detail = response
            .json::<VaultErrorBody>()
            .await
            .map(|body| body.errors.join("; "))
            .unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && is_cas_failure(&detail) {
            let actual = self.current_version(path).await;
            return Err(Error::Conflict {
                expected: expected_version.unwrap_or(0),
                actual,
            });
        }
        Err(map_status("write secret", status, &detail))
    }

    async fn rotate(&self, path: &SecretPath) -> Result<SecretValue> {
        let current = self.fetch(path).await?.ok_or_else(|| Error::NotFound {
            path: path.to_string(),
        })?;

        let rotated = regenerate_fields(&current.fields);
        let version = self
            .store(path, rotated.clone(), Some(current.version))
            .await?;

        let mut value = SecretValue::new(rotated, version);
        if let Some(ttl) = current.lease_ttl {
            value = value.with_lease(ttl);
        }
        Ok(value)
    }

    async fn delete(&self, path: &SecretPath) -> Result<()> {
        // Vault's DELETE succeeds for absent paths; the adapter contract
        // requires NotFound, so presence is checked first.
        if self.fetch(path).await?.is_none() {
            return Err(Error::NotFound {
                path: path.to_string(),
            });
        }

        let response = self
            .send(Method::DELETE, self.api_url("data", path), None)
            .await?;
        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        Err(self.status_error("delete secret", status, response).await)
    }
}

fn string_fields(
    path: &SecretPath,
    raw: BTreeMap<String, Value>,
) -> Result<BTreeMap<String, String>> {
    raw.into_iter()
        .map(|(name, value)| match value {
            Value::String(text) => Ok((name, text)),
            other => Err(Error::Internal(format!(
                "secret {path} field {name} is not a string: {other}"
            ))),
        })
        .collect()
}

fn map_status(operation: &str, status: StatusCode, detail: &str) -> Error {
    match status {
        StatusCode::FORBIDDEN => Error::Unauthorized {
            reason: format!("vault rejected the token: {detail}"),
        },
        StatusCode::TOO_MANY_REQUESTS => Error::RateLimited(format!("{operation}: {detail}")),
        status if status.is_server_error() => {
            Error::Unavailable(format!("{operation}: {status} {detail}"))
        }
        status => Error::Internal(format!("{operation}: {status} {detail}")),
    }
}

fn is_cas_failure(detail: &str) -> bool {
    detail.contains("check-and-set")
}

#[derive(Deserialize)]
struct KvReadResponse {
    #[serde(default)]
    lease_duration: u64,
    data: KvReadData,
}

#[derive(Deserialize)]
struct KvReadData {
    data: BTreeMap<String, Value>,
    metadata: KvMetadata,
}

#[derive(Deserialize)]
struct KvMetadata {
    version: u64,
    #[serde(default)]
    destroyed: bool,
    #[serde(default)]
    deletion_time: String,
}

#[derive(Deserialize)]
struct KvWriteResponse {
    data: KvWriteMetadata,
}

#[derive(Deserialize)]
struct KvWriteMetadata {
    version: u64,
}

#[derive(Deserialize)]
struct KvMetadataResponse {
    data: KvMetadataInfo,
}

#[derive(Deserialize)]
struct KvMetadataInfo {
    #[serde(default)]
    current_version: u64,
}

#[derive(Deserialize)]
struct VaultErrorBody {
    #[serde(default)]
    errors: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn backend() -> VaultKvBackend {
        VaultKvBackend::new(VaultKvConfig::new("http://127.0.0.1:8200/", "root")).unwrap()
    }

    #[test]
    fn kv_url_mapping() {
        let backend = backend();
        let path = SecretPath::parse("secret/db").unwrap();
        assert_eq!(
            backend.api_url("data", &path),
            "http://127.0.0.1:8200/v1/secret/data/keyrelay/secret/db"
        );
        assert_eq!(
            backend.api_url("metadata", &path),
            "http://127.0.0.1:8200/v1/secret/metadata/keyrelay/secret/db"
        );
    }

    #[test]
    fn custom_mount_and_prefix() {
        let config = VaultKvConfig::new("http://vault:8200", "root")
            .mount("kv/")
            .prefix("apps");
        let backend = VaultKvBackend::new(config).unwrap();
        let path = SecretPath::parse("secret/db").unwrap();
        assert_eq!(
            backend.api_url("data", &path),
            "http://vault:8200/v1/kv/data/apps/secret/db"
        );
    }

    #[test]
    fn status_mapping_matches_the_taxonomy() {
        assert!(matches!(
            map_status("read secret", StatusCode::FORBIDDEN, "permission denied"),
            Error::Unauthorized { .. }
        ));
        assert!(matches!(
            map_status("read secret", StatusCode::TOO_MANY_REQUESTS, ""),
            Error::RateLimited(_)
        ));
        assert!(matches!(
            map_status("read secret", StatusCode::SERVICE_UNAVAILABLE, "sealed"),
            Error::Unavailable(_)
        ));
        assert!(matches!(
            map_status("read secret", StatusCode::BAD_REQUEST, ""),
            Error::Internal(_)
        ));
    }

    #[test]
    fn cas_failures_are_detected_from_the_error_body() {
        assert!(is_cas_failure(
            "check-and-set parameter did not match the current version"
        ));
        assert!(!is_cas_failure("permission denied"));
    }

    #[test]
    fn read_response_decodes_fields_and_metadata() {
        let raw = r#"{
            "request_id": "a1",
            "lease_id": "",
            "lease_duration": 0,
            "data": {
                "data": { "username": "app", "password": "hunter2" },
                "metadata": {
                    "created_time": "2026-01-12T09:30:00Z",
                    "deletion_time": "",
                    "destroyed": false,
                    "version": 4
                }
            }
        }"#;
        let parsed: KvReadResponse = serde_json::from_str(raw).unwrap();
        assert_eq!(parsed.data.metadata.version, 4);
        assert!(!parsed.data.metadata.destroyed);

        let path = SecretPath::parse("secret/db").unwrap();
        let fields = string_fields(&path, parsed.data.data).unwrap();
        assert_eq!(fields["password"], "hunter2");
    }

    #[test]
    fn non_string_fields_are_rejected() {
        let path = SecretPath::parse("secret/db").unwrap();
        let mut raw = BTreeMap::new();
        raw.insert("port".to_string(), json!(5432));
        let err = string_fields(&path, raw).unwrap_err();
        assert!(matches!(err, Error::Internal(_)));
    }
}
