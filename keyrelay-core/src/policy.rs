use crate::errors::{Error, Result};
use crate::path::SecretPath;
use crate::types::{CallerIdentity, Capability};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::RwLock;

/// A single allow-list entry: a path prefix and the capabilities it grants.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicyRule {
    pub prefix: SecretPath,
    pub capabilities: BTreeSet<Capability>,
}

impl PolicyRule {
    pub fn new(prefix: SecretPath, capabilities: impl IntoIterator<Item = Capability>) -> Self {
        Self {
            prefix,
            capabilities: capabilities.into_iter().collect(),
        }
    }
}

/// Static allow-list grouped by caller subject.
///
/// Evaluation picks the most specific (longest) matching prefix among the
/// subject's rules; among equally specific prefixes the first listed wins.
/// The matched rule alone decides — a capability missing from it is a
/// denial even if a shorter prefix would have granted it. No matching rule,
/// or an unknown subject, is a denial.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct PolicySet {
    #[serde(default)]
    subjects: BTreeMap<String, Vec<PolicyRule>>,
}

impl PolicySet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a rule granting `capabilities` under `prefix` to `subject`.
    pub fn allow(
        mut self,
        subject: impl Into<String>,
        prefix: &str,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Result<Self> {
        let prefix = SecretPath::parse(prefix)?;
        self.subjects
            .entry(subject.into())
            .or_default()
            .push(PolicyRule::new(prefix, capabilities));
        Ok(self)
    }

    /// Parse a policy document from YAML.
    pub fn from_yaml(input: &str) -> Result<Self> {
        serde_yaml::from_str(input)
            .map_err(|err| Error::Config(format!("invalid policy document: {err}")))
    }

    /// Load a policy document from a file.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|err| {
            Error::Config(format!(
                "failed to read policy file {path}: {err}",
                path = path.display()
            ))
        })?;
        Self::from_yaml(&raw)
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }

    fn matching_rule(&self, subject: &str, path: &SecretPath) -> Option<&PolicyRule> {
        let rules = self.subjects.get(subject)?;
        let mut best: Option<&PolicyRule> = None;
        for rule in rules {
            if !path.starts_with(&rule.prefix) {
                continue;
            }
            // Strictly greater, so the first of equally specific rules wins.
            if best.is_none_or(|current| rule.prefix.depth() > current.prefix.depth()) {
                best = Some(rule);
            }
        }
        best
    }
}

/// Reason a request was denied by the policy gate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Denial {
    reason: String,
}

impl Denial {
    fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn into_reason(self) -> String {
        self.reason
    }
}

/// Authorization gate evaluated on every operation.
///
/// Decisions are never cached per caller; the rule set can be replaced at
/// runtime so a revocation takes effect between calls.
#[derive(Debug)]
pub struct PolicyGate {
    rules: RwLock<PolicySet>,
}

impl PolicyGate {
    pub fn new(rules: PolicySet) -> Self {
        Self {
            rules: RwLock::new(rules),
        }
    }

    /// Replace the active rule set wholesale.
    pub fn replace(&self, rules: PolicySet) {
        *self.rules.write().expect("policy lock poisoned") = rules;
    }

    /// Decide whether `caller` may exercise `capability` on `path`.
    pub fn authorize(
        &self,
        caller: &CallerIdentity,
        path: &SecretPath,
        capability: Capability,
    ) -> std::result::Result<(), Denial> {
        let rules = self.rules.read().expect("policy lock poisoned");
        match rules.matching_rule(caller.subject(), path) {
            Some(rule) if rule.capabilities.contains(&capability) => Ok(()),
            Some(rule) => Err(Denial::new(format!(
                "rule for prefix {prefix} does not grant {capability}",
                prefix = rule.prefix
            ))),
            None => Err(Denial::new(format!(
                "no rule matches {path} for subject {subject}",
                subject = caller.subject()
            ))),
        }
    }
}

impl Default for PolicyGate {
    fn default() -> Self {
        Self::new(PolicySet::new())
    }
}
