//! Core broker primitives: one consistent secrets contract over
//! heterogeneous backends, with a lease-aware cache, a prefix-matched
//! policy gate, and append-only audit events.

pub mod audit;
pub mod backend;
pub mod broker;
pub mod cache;
pub mod errors;
pub mod path;
pub mod policy;
pub mod types;

pub use audit::{AuditEvent, AuditOutcome, AuditRecorder, AuditSink, JsonlSink, MemorySink, TracingSink};
#[cfg(feature = "aws-sm")]
pub use backend::aws::{AwsSecretsManagerBackend, AwsSmConfig};
pub use backend::memory::MemoryBackend;
#[cfg(feature = "vault-kv")]
pub use backend::vault::{VaultKvBackend, VaultKvConfig};
pub use backend::SecretsBackend;
pub use broker::{Broker, BrokerBuilder, BrokerConfig};
pub use cache::{LeaseCache, Source};
pub use errors::{Error, ErrorKind, Result};
pub use path::SecretPath;
pub use policy::{Denial, PolicyGate, PolicyRule, PolicySet};
pub use types::{CallerIdentity, Capability, SecretValue};
