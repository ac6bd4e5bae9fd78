use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use pkg_constants::probe::{
    DEFAULT_FAILURE_THRESHOLD, DEFAULT_INITIAL_DELAY_SECS, DEFAULT_PERIOD_SECS,
    DEFAULT_SUCCESS_THRESHOLD,
};

// --- Resource requirements ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct ResourceRequirements {
    /// CPU in millicores (1000 = 1 core)
    #[serde(default)]
    pub cpu_millis: u64,
    /// Memory in bytes
    #[serde(default)]
    pub memory_bytes: u64,
}

// --- Environment bindings ---

/// Value bound to an environment variable: either a literal string or a
/// reference into external config/secret storage, resolved by the runtime.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EnvValue {
    Literal(String),
    ConfigRef(String),
    SecretRef(String),
}

// --- Liveness probe policy ---

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeSpec {
    /// Seconds to wait after instance start before the first probe.
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: u64,
    /// Seconds between probes after the initial delay.
    #[serde(default = "default_period")]
    pub period_secs: u64,
    /// Consecutive successes required before an instance becomes Ready.
    #[serde(default = "default_success_threshold")]
    pub success_threshold: u32,
    /// Consecutive failures before a Running or Ready instance is Failed.
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,
}

fn default_initial_delay() -> u64 {
    DEFAULT_INITIAL_DELAY_SECS
}
fn default_period() -> u64 {
    DEFAULT_PERIOD_SECS
}
fn default_success_threshold() -> u32 {
    DEFAULT_SUCCESS_THRESHOLD
}
fn default_failure_threshold() -> u32 {
    DEFAULT_FAILURE_THRESHOLD
}

impl Default for ProbeSpec {
    fn default() -> Self {
        Self {
            initial_delay_secs: default_initial_delay(),
            period_secs: default_period(),
            success_threshold: default_success_threshold(),
            failure_threshold: default_failure_threshold(),
        }
    }
}

// --- Pod template ---

/// Immutable description of one workload instance. Two templates describe
/// the same workload version iff their `template_hash()` values are equal,
/// so any field change triggers a rollout.
///
/// Maps are `BTreeMap` so the canonical JSON encoding (and therefore the
/// hash) is stable across processes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodTemplate {
    /// Container image reference, e.g. `registry.local/iris-serve:v2`.
    pub image: String,
    #[serde(default)]
    pub resources: ResourceRequirements,
    #[serde(default)]
    pub liveness_probe: ProbeSpec,
    #[serde(default)]
    pub env: BTreeMap<String, EnvValue>,
    #[serde(default)]
    pub labels: BTreeMap<String, String>,
}

impl PodTemplate {
    /// Structural identity: hash of the canonical JSON encoding.
    pub fn template_hash(&self) -> String {
        let json = serde_json::to_string(self).unwrap_or_default();
        let mut hash: u64 = 0;
        for byte in json.bytes() {
            hash = hash.wrapping_mul(31).wrapping_add(byte as u64);
        }
        format!("{:016x}", hash)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_template(image: &str) -> PodTemplate {
        PodTemplate {
            image: image.to_string(),
            resources: ResourceRequirements {
                cpu_millis: 250,
                memory_bytes: 256_000_000,
            },
            liveness_probe: ProbeSpec::default(),
            env: BTreeMap::new(),
            labels: BTreeMap::from([("app".to_string(), "iris".to_string())]),
        }
    }

    #[test]
    fn test_hash_stable_for_equal_templates() {
        let a = make_template("iris-serve:v1");
        let b = make_template("iris-serve:v1");
        assert_eq!(a.template_hash(), b.template_hash());
    }

    #[test]
    fn test_hash_changes_on_image_change() {
        let a = make_template("iris-serve:v1");
        let b = make_template("iris-serve:v2");
        assert_ne!(a.template_hash(), b.template_hash());
    }

    #[test]
    fn test_hash_changes_on_env_change() {
        let a = make_template("iris-serve:v1");
        let mut b = a.clone();
        b.env.insert(
            "MODEL_PATH".to_string(),
            EnvValue::ConfigRef("model-config/path".to_string()),
        );
        assert_ne!(a.template_hash(), b.template_hash());
    }
}
