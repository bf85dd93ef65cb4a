use anyhow::{Context, Result};
use serde::Deserialize;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use keyrelay_core::audit::{AuditSink, JsonlSink, TracingSink};
use keyrelay_core::backend::SecretsBackend;
use keyrelay_core::backend::memory::MemoryBackend;

/// Service configuration, loaded from one YAML document.
///
/// Everything the broker needs arrives here as explicit values; the library
/// layer never consults process environment. The binary honors a small set
/// of `KEYRELAY_*` overrides at its own edge.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    #[serde(default = "default_listen")]
    pub listen: SocketAddr,
    pub backend: BackendConfig,
    /// Policy rules document (YAML) evaluated by the policy gate.
    pub policy_file: PathBuf,
    #[serde(default)]
    pub audit: AuditConfig,
    #[serde(default = "default_lease_ttl_secs")]
    pub default_lease_ttl_secs: u64,
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,
    #[serde(default = "default_backend_timeout_secs")]
    pub backend_timeout_secs: u64,
    #[serde(default = "default_max_read_retries")]
    pub max_read_retries: u32,
    #[serde(default)]
    pub tokens: Vec<TokenEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenEntry {
    pub token: String,
    pub subject: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// In-process store for development and tests.
    Memory {
        #[serde(default)]
        lease_ttl_secs: Option<u64>,
    },
    /// Vault KV v2 mount (requires the `vault-kv` feature).
    Vault {
        addr: String,
        token: String,
        #[serde(default)]
        namespace: Option<String>,
        #[serde(default = "default_vault_mount")]
        mount: String,
        #[serde(default = "default_secret_prefix")]
        prefix: String,
    },
    /// AWS Secrets Manager (requires the `aws-sm` feature).
    Aws {
        #[serde(default = "default_secret_prefix")]
        prefix: String,
        #[serde(default)]
        region: Option<String>,
        #[serde(default)]
        endpoint: Option<String>,
    },
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum AuditConfig {
    /// Structured log lines under the `audit` target.
    #[default]
    Log,
    /// Append-only JSONL file.
    File { path: PathBuf },
}

impl ServiceConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read config file {}", path.display()))?;
        let mut config: ServiceConfig =
            serde_yaml::from_str(&raw).context("invalid config file")?;

        if let Ok(listen) = std::env::var("KEYRELAY_LISTEN") {
            config.listen = listen
                .parse()
                .context("KEYRELAY_LISTEN is not a valid socket address")?;
        }

        Ok(config)
    }

    pub fn default_lease_ttl(&self) -> Duration {
        Duration::from_secs(self.default_lease_ttl_secs.max(1))
    }

    pub fn backend_timeout(&self) -> Duration {
        Duration::from_secs(self.backend_timeout_secs.max(1))
    }
}

/// Build the configured backend adapter.
///
/// Backends are feature-gated; asking for one that was not compiled in is a
/// configuration error, not a silent fallback.
pub async fn build_backend(config: &ServiceConfig) -> Result<Box<dyn SecretsBackend>> {
    match &config.backend {
        BackendConfig::Memory { lease_ttl_secs } => {
            let mut backend = MemoryBackend::new();
            if let Some(secs) = lease_ttl_secs {
                backend = backend.with_lease_ttl(Duration::from_secs(*secs));
            }
            Ok(Box::new(backend))
        }
        BackendConfig::Vault {
            addr,
            token,
            namespace,
            mount,
            prefix,
        } => {
            #[cfg(feature = "vault-kv")]
            {
                use keyrelay_core::backend::vault::{VaultKvBackend, VaultKvConfig};

                let mut vault = VaultKvConfig::new(addr.clone(), token.clone())
                    .mount(mount.clone())
                    .prefix(prefix.clone())
                    .timeout(config.backend_timeout());
                if let Some(namespace) = namespace {
                    vault = vault.namespace(namespace.clone());
                }
                let backend = VaultKvBackend::new(vault)
                    .context("failed to initialize vault secrets backend")?;
                Ok(Box::new(backend))
            }

            #[cfg(not(feature = "vault-kv"))]
            {
                let _ = (addr, token, namespace, mount, prefix);
                anyhow::bail!("vault backend requested but the vault-kv feature is not enabled");
            }
        }
        BackendConfig::Aws {
            prefix,
            region,
            endpoint,
        } => {
            #[cfg(feature = "aws-sm")]
            {
                use keyrelay_core::backend::aws::{AwsSecretsManagerBackend, AwsSmConfig};

                let backend = AwsSecretsManagerBackend::connect(AwsSmConfig {
                    prefix: prefix.clone(),
                    region: region.clone(),
                    endpoint: endpoint.clone(),
                })
                .await;
                Ok(Box::new(backend))
            }

            #[cfg(not(feature = "aws-sm"))]
            {
                let _ = (prefix, region, endpoint);
                anyhow::bail!("aws backend requested but the aws-sm feature is not enabled");
            }
        }
    }
}

/// Build the configured audit sink.
pub fn build_audit_sink(config: &AuditConfig) -> Result<Box<dyn AuditSink>> {
    match config {
        AuditConfig::Log => Ok(Box::new(TracingSink)),
        AuditConfig::File { path } => {
            let sink = JsonlSink::open(path).with_context(|| {
                format!("failed to open audit file {}", path.display())
            })?;
            Ok(Box::new(sink))
        }
    }
}

fn default_listen() -> SocketAddr {
    SocketAddr::from(([127, 0, 0, 1], 8200))
}

fn default_lease_ttl_secs() -> u64 {
    300
}

fn default_cache_capacity() -> usize {
    256
}

fn default_backend_timeout_secs() -> u64 {
    10
}

fn default_max_read_retries() -> u32 {
    1
}

fn default_vault_mount() -> String {
    "secret".to_string()
}

fn default_secret_prefix() -> String {
    "keyrelay".to_string()
}
