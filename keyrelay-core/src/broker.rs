use crate::audit::{AuditEvent, AuditOutcome, AuditRecorder, AuditSink, TracingSink};
use crate::backend::SecretsBackend;
use crate::cache::{LeaseCache, Source};
use crate::errors::{Error, Result};
use crate::path::SecretPath;
use crate::policy::{PolicyGate, PolicySet};
use crate::types::{CallerIdentity, Capability, SecretValue};
use rand::Rng;
use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;
use tracing::debug;

/// Tunables captured when building a [`Broker`].
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Cache TTL applied to values without a backend-reported lease.
    pub default_lease_ttl: Duration,
    /// Maximum number of cached entries retained.
    pub cache_capacity: usize,
    /// Upper bound on any single backend call.
    pub backend_timeout: Duration,
    /// Read retries after a transient failure; writes are never retried.
    pub max_read_retries: u32,
    /// Base backoff between read retries; a random jitter of up to the same
    /// amount is added.
    pub retry_backoff: Duration,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            default_lease_ttl: Duration::from_secs(300),
            cache_capacity: 256,
            backend_timeout: Duration::from_secs(10),
            max_read_retries: 1,
            retry_backoff: Duration::from_millis(50),
        }
    }
}

/// Builder for [`Broker`] instances.
///
/// All configuration arrives through explicit objects; the broker never
/// consults process environment.
#[derive(Default)]
pub struct BrokerBuilder {
    backend: Option<Box<dyn SecretsBackend>>,
    policy: Option<PolicySet>,
    audit_sink: Option<Box<dyn AuditSink>>,
    config: BrokerConfig,
}

impl BrokerBuilder {
    /// Set the backend adapter serving this broker.
    pub fn backend<B>(mut self, backend: B) -> Self
    where
        B: SecretsBackend + 'static,
    {
        self.backend = Some(Box::new(backend));
        self
    }

    /// Set an already-boxed backend adapter.
    pub fn boxed_backend(mut self, backend: Box<dyn SecretsBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Set the policy rule set. Defaults to deny-everything.
    pub fn policy(mut self, policy: PolicySet) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Set the audit sink. Defaults to structured log lines.
    pub fn audit_sink<S>(mut self, sink: S) -> Self
    where
        S: AuditSink + 'static,
    {
        self.audit_sink = Some(Box::new(sink));
        self
    }

    pub fn boxed_audit_sink(mut self, sink: Box<dyn AuditSink>) -> Self {
        self.audit_sink = Some(sink);
        self
    }

    pub fn default_lease_ttl(mut self, ttl: Duration) -> Self {
        self.config.default_lease_ttl = ttl;
        self
    }

    pub fn cache_capacity(mut self, capacity: usize) -> Self {
        self.config.cache_capacity = capacity.max(1);
        self
    }

    pub fn backend_timeout(mut self, timeout: Duration) -> Self {
        self.config.backend_timeout = timeout;
        self
    }

    pub fn max_read_retries(mut self, retries: u32) -> Self {
        self.config.max_read_retries = retries;
        self
    }

    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    pub fn build(self) -> Result<Broker> {
        let backend = self
            .backend
            .ok_or_else(|| Error::Config("a backend adapter is required".into()))?;
        let backend_name = backend.name().to_string();
        let cache = LeaseCache::new(self.config.cache_capacity, self.config.default_lease_ttl);
        let policy = PolicyGate::new(self.policy.unwrap_or_default());
        let audit = AuditRecorder::new(
            self.audit_sink
                .unwrap_or_else(|| Box::new(TracingSink)),
        );

        Ok(Broker {
            backend,
            backend_name,
            cache,
            policy,
            audit,
            config: self.config,
        })
    }
}

/// The public façade: policy gate, lease cache, backend adapter, and audit
/// sink composed into one pipeline.
///
/// Every operation runs `authorize → cache/backend → audit → return`; a
/// denial is audited and returned without contacting the backend, and any
/// failure after authorization is audited with its error kind. Each value
/// handed to a caller has passed exactly one policy check and produced
/// exactly one audit event, in that order.
pub struct Broker {
    backend: Box<dyn SecretsBackend>,
    backend_name: String,
    cache: LeaseCache,
    policy: PolicyGate,
    audit: AuditRecorder,
    config: BrokerConfig,
}

impl std::fmt::Debug for Broker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Broker")
            .field("backend_name", &self.backend_name)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl Broker {
    pub fn builder() -> BrokerBuilder {
        BrokerBuilder::default()
    }

    /// Read a secret, serving from the lease cache when possible.
    pub async fn get(&self, caller: &CallerIdentity, path: &SecretPath) -> Result<SecretValue> {
        self.authorize(caller, path, Capability::Read)?;

        let outcome = self
            .cache
            .get_or_fetch(path, || self.fetch_fresh(path))
            .await;
        match outcome {
            Ok((value, source)) => {
                self.record(caller, path, Capability::Read, AuditOutcome::Granted {
                    cache_hit: source == Source::CacheHit,
                });
                Ok(value)
            }
            Err(err) => {
                self.record(caller, path, Capability::Read, AuditOutcome::Failed {
                    kind: err.kind(),
                });
                Err(err)
            }
        }
    }

    /// Write a new version. With `expected_version` the write is
    /// compare-and-set. Never retried.
    pub async fn put(
        &self,
        caller: &CallerIdentity,
        path: &SecretPath,
        fields: BTreeMap<String, String>,
        expected_version: Option<u64>,
    ) -> Result<u64> {
        self.authorize(caller, path, Capability::Write)?;

        let result = self
            .with_timeout(self.backend.store(path, fields, expected_version))
            .await;
        match result {
            Ok(version) => {
                self.cache.invalidate(path);
                self.record(caller, path, Capability::Write, AuditOutcome::Granted {
                    cache_hit: false,
                });
                Ok(version)
            }
            Err(err) => {
                self.record(caller, path, Capability::Write, AuditOutcome::Failed {
                    kind: err.kind(),
                });
                Err(err)
            }
        }
    }

    /// Rotate the secret's material. Invalidates the cache entry on success.
    /// Never retried.
    pub async fn rotate(&self, caller: &CallerIdentity, path: &SecretPath) -> Result<SecretValue> {
        self.authorize(caller, path, Capability::Rotate)?;

        let result = self.with_timeout(self.backend.rotate(path)).await;
        match result {
            Ok(value) => {
                self.cache.invalidate(path);
                self.record(caller, path, Capability::Rotate, AuditOutcome::Granted {
                    cache_hit: false,
                });
                Ok(value)
            }
            Err(err) => {
                self.record(caller, path, Capability::Rotate, AuditOutcome::Failed {
                    kind: err.kind(),
                });
                Err(err)
            }
        }
    }

    /// Delete the secret. Governed by the `write` capability.
    pub async fn delete(&self, caller: &CallerIdentity, path: &SecretPath) -> Result<()> {
        self.authorize(caller, path, Capability::Write)?;

        let result = self.with_timeout(self.backend.delete(path)).await;
        match result {
            Ok(()) => {
                self.cache.invalidate(path);
                self.record(caller, path, Capability::Write, AuditOutcome::Granted {
                    cache_hit: false,
                });
                Ok(())
            }
            Err(err) => {
                self.record(caller, path, Capability::Write, AuditOutcome::Failed {
                    kind: err.kind(),
                });
                Err(err)
            }
        }
    }

    /// Replace the active policy rule set.
    pub fn replace_policy(&self, rules: PolicySet) {
        self.policy.replace(rules);
    }

    /// Number of audit events the sink failed to persist.
    pub fn audit_dropped(&self) -> u64 {
        self.audit.dropped()
    }

    /// Label of the backend serving this broker.
    pub fn backend_name(&self) -> &str {
        &self.backend_name
    }

    /// Flush the audit sink and release backend connections.
    pub fn close(self) {
        if let Err(err) = self.audit.flush() {
            tracing::warn!(error = %err, "failed to flush audit sink on close");
        }
    }

    fn authorize(
        &self,
        caller: &CallerIdentity,
        path: &SecretPath,
        capability: Capability,
    ) -> Result<()> {
        if let Err(denial) = self.policy.authorize(caller, path, capability) {
            let reason = denial.into_reason();
            self.record(caller, path, capability, AuditOutcome::Denied {
                reason: reason.clone(),
            });
            return Err(Error::Unauthorized { reason });
        }
        Ok(())
    }

    async fn fetch_fresh(&self, path: &SecretPath) -> Result<SecretValue> {
        let mut attempt = 0u32;
        loop {
            let result = self.with_timeout(self.backend.fetch(path)).await;
            match result {
                Ok(Some(value)) => return Ok(value),
                Ok(None) => {
                    return Err(Error::NotFound {
                        path: path.to_string(),
                    });
                }
                Err(err) if err.is_retryable() && attempt < self.config.max_read_retries => {
                    attempt += 1;
                    let backoff = self.jittered_backoff();
                    debug!(
                        %path,
                        attempt,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %err,
                        "retrying backend fetch"
                    );
                    tokio::time::sleep(backoff).await;
                }
                Err(err) => return Err(err),
            }
        }
    }

    async fn with_timeout<T>(&self, call: impl Future<Output = Result<T>>) -> Result<T> {
        match tokio::time::timeout(self.config.backend_timeout, call).await {
            Ok(result) => result,
            Err(_) => Err(Error::Unavailable(format!(
                "backend call exceeded {}ms",
                self.config.backend_timeout.as_millis()
            ))),
        }
    }

    fn jittered_backoff(&self) -> Duration {
        let base = self.config.retry_backoff;
        let jitter_ms = rand::rng().random_range(0..=base.as_millis() as u64);
        base + Duration::from_millis(jitter_ms)
    }

    fn record(
        &self,
        caller: &CallerIdentity,
        path: &SecretPath,
        capability: Capability,
        outcome: AuditOutcome,
    ) {
        self.audit.record(AuditEvent::new(
            caller,
            path,
            capability,
            outcome,
            &self.backend_name,
        ));
    }
}
