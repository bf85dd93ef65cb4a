//! AWS Secrets Manager backend via the official SDK.
//!
//! Each secret is stored under `{prefix}/{path}` with a JSON payload that
//! embeds the broker's monotonic version alongside the field map (Secrets
//! Manager's own version ids are opaque UUIDs). Compare-and-set is
//! read-compare-write; Secrets Manager has no native CAS.

use crate::backend::{SecretsBackend, regenerate_fields};
use crate::errors::{Error, Result};
use crate::path::SecretPath;
use crate::types::SecretValue;
use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_secretsmanager::Client;
use aws_sdk_secretsmanager::error::{ProvideErrorMetadata, SdkError};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

const BACKEND_NAME: &str = "aws-secrets-manager";
const DEFAULT_PREFIX: &str = "keyrelay";

/// Settings for the Secrets Manager adapter.
///
/// Credentials come from the standard AWS provider chain; the adapter itself
/// never reads process environment.
#[derive(Debug, Clone)]
pub struct AwsSmConfig {
    pub prefix: String,
    pub region: Option<String>,
    pub endpoint: Option<String>,
}

impl Default for AwsSmConfig {
    fn default() -> Self {
        Self {
            prefix: DEFAULT_PREFIX.to_string(),
            region: None,
            endpoint: None,
        }
    }
}

/// AWS Secrets Manager adapter.
pub struct AwsSecretsManagerBackend {
    client: Client,
    prefix: String,
}

impl AwsSecretsManagerBackend {
    /// Resolve the AWS shared configuration and build the client.
    pub async fn connect(config: AwsSmConfig) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.clone()));
        }
        let shared = loader.load().await;

        let mut builder = aws_sdk_secretsmanager::config::Builder::from(&shared);
        if let Some(endpoint) = &config.endpoint {
            builder = builder.endpoint_url(endpoint);
        }
        Self::from_client(Client::from_conf(builder.build()), config.prefix)
    }

    /// Wrap an already-configured client (used by tests against emulators).
    pub fn from_client(client: Client, prefix: impl Into<String>) -> Self {
        Self {
            client,
            prefix: prefix.into(),
        }
    }

    fn secret_id(&self, path: &SecretPath) -> String {
        format!(
            "{prefix}/{path}",
            prefix = self.prefix.trim_matches('/'),
            path = path
        )
    }

    async fn read_stored(&self, path: &SecretPath) -> Result<Option<StoredSecret>> {
        let result = self
            .client
            .get_secret_value()
            .secret_id(self.secret_id(path))
            .send()
            .await;

        let output = match result {
            Ok(output) => output,
            Err(err) => {
                // InvalidRequestException covers secrets scheduled for
                // deletion; both read as absent.
                if matches!(
                    service_code(&err).as_deref(),
                    Some("ResourceNotFoundException") | Some("InvalidRequestException")
                ) {
                    return Ok(None);
                }
                return Err(map_sdk_error("get secret value", err));
            }
        };

        let raw = output.secret_string().ok_or_else(|| {
            Error::Internal(format!("secret {path} does not hold a string payload"))
        })?;
        decode_stored(raw).map(Some)
    }

    async fn write_stored(&self, path: &SecretPath, stored: &StoredSecret) -> Result<()> {
        let payload = encode_stored(stored)?;
        let secret_id = self.secret_id(path);

        let put = self
            .client
            .put_secret_value()
            .secret_id(&secret_id)
            .secret_string(&payload)
            .send()
            .await;
        match put {
            Ok(_) => Ok(()),
            Err(err) if service_code(&err).as_deref() == Some("ResourceNotFoundException") => {
                let create = self
                    .client
                    .create_secret()
                    .name(&secret_id)
                    .secret_string(&payload)
                    .send()
                    .await;
                match create {
                    Ok(_) => Ok(()),
                    Err(err) => {
                        if let SdkError::ServiceError(context) = &err {
                            // Lost a create race; the plain put now succeeds.
                            if context.err().is_resource_exists_exception() {
                                self.client
                                    .put_secret_value()
                                    .secret_id(&secret_id)
                                    .secret_string(&payload)
                                    .send()
                                    .await
                                    .map_err(|err| map_sdk_error("put secret value", err))?;
                                return Ok(());
                            }
                        }
                        Err(map_sdk_error("create secret", err))
                    }
                }
            }
            Err(err) => Err(map_sdk_error("put secret value", err)),
        }
    }
}

#[async_trait]
impl SecretsBackend for AwsSecretsManagerBackend {
    fn name(&self) -> &str {
        BACKEND_NAME
    }

    async fn fetch(&self, path: &SecretPath) -> Result<Option<SecretValue>> {
        Ok(self
            .read_stored(path)
            .await?
            .map(|stored| SecretValue::new(stored.fields, stored.version)))
    }

    async fn store(
        &self,
        path: &SecretPath,
        fields: BTreeMap<String, String>,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        let current = self
            .read_stored(path)
            .await?
            .map(|stored| stored.version)
            .unwrap_or(0);

        if let Some(expected) = expected_version {
            if expected != current {
                return Err(Error::Conflict {
                    expected,
                    actual: current,
                });
            }
        }

        let stored = StoredSecret {
            version: current + 1,
            fields,
        };
        self.write_stored(path, &stored).await?;
        Ok(stored.version)
    }

    async fn rotate(&self, path: &SecretPath) -> Result<SecretValue> {
        let current = self.read_stored(path).await?.ok_or_else(|| Error::NotFound {
            path: path.to_string(),
        })?;

        let stored = StoredSecret {
            version: current.version + 1,
            fields: regenerate_fields(&current.fields),
        };
        self.write_stored(path, &stored).await?;
        Ok(SecretValue::new(stored.fields, stored.version))
    }

    async fn delete(&self, path: &SecretPath) -> Result<()> {
        if self.read_stored(path).await?.is_none() {
            return Err(Error::NotFound {
                path: path.to_string(),
            });
        }

        // Without force, the name stays reserved for the recovery window and
        // a later store on the same path would fail.
        self.client
            .delete_secret()
            .secret_id(self.secret_id(path))
            .force_delete_without_recovery(true)
            .send()
            .await
            .map_err(|err| map_sdk_error("delete secret", err))?;
        Ok(())
    }
}

/// Persisted payload: the field map plus the broker's monotonic version.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct StoredSecret {
    version: u64,
    fields: BTreeMap<String, String>,
}

fn encode_stored(stored: &StoredSecret) -> Result<String> {
    serde_json::to_string(stored)
        .map_err(|err| Error::Internal(format!("serialize secret payload: {err}")))
}

fn decode_stored(raw: &str) -> Result<StoredSecret> {
    serde_json::from_str(raw)
        .map_err(|err| Error::Internal(format!("decode secret payload: {err}")))
}

fn service_code<E, R>(err: &SdkError<E, R>) -> Option<String>
where
    E: ProvideErrorMetadata,
{
    if let SdkError::ServiceError(context) = err {
        return context.err().code().map(str::to_string);
    }
    None
}

fn map_sdk_error<E, R>(operation: &str, err: SdkError<E, R>) -> Error
where
    E: ProvideErrorMetadata,
{
    match &err {
        SdkError::ServiceError(context) => {
            let meta = context.err();
            let detail = meta.message().unwrap_or("request failed");
            taxonomy_for_code(meta.code(), operation, detail)
        }
        SdkError::TimeoutError(_) | SdkError::DispatchFailure(_) => {
            Error::Unavailable(format!("{operation}: {err}"))
        }
        _ => Error::Internal(format!("{operation}: {err}")),
    }
}

fn taxonomy_for_code(code: Option<&str>, operation: &str, detail: &str) -> Error {
    match code {
        Some("ThrottlingException") | Some("TooManyRequestsException")
        | Some("LimitExceededException") => Error::RateLimited(format!("{operation}: {detail}")),
        Some("AccessDeniedException") | Some("UnrecognizedClientException")
        | Some("ExpiredTokenException") | Some("InvalidSignatureException") => Error::Unauthorized {
            reason: format!("aws rejected the credentials: {detail}"),
        },
        Some("InternalServiceError") | Some("ServiceUnavailableException") => {
            Error::Unavailable(format!("{operation}: {detail}"))
        }
        _ => Error::Internal(format!("{operation}: {detail}")),
    }
}
