use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::template::PodTemplate;

// --- ReplicaSet status ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReplicaSetStatus {
    pub replicas: u32,
    pub ready_replicas: u32,
    pub failed_replicas: u32,
}

// --- ReplicaSet spec ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSetSpec {
    pub replicas: u32,
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    pub template: PodTemplate,
    /// Hard cap on live instances (counting in-flight creations), set by the
    /// rollout controller during a rollout. `None` means `replicas` is the cap.
    #[serde(default)]
    pub surge_ceiling: Option<u32>,
}

// --- ReplicaSet ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicaSet {
    pub id: String,
    pub name: String,
    pub spec: ReplicaSetSpec,
    #[serde(default)]
    pub status: ReplicaSetStatus,
    /// Owner reference (Deployment id that manages this ReplicaSet)
    #[serde(default)]
    pub owner_ref: Option<String>,
    /// Template hash tracking which workload version this ReplicaSet runs
    #[serde(default)]
    pub template_hash: String,
    pub created_at: DateTime<Utc>,
}
