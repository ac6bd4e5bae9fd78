use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::template::PodTemplate;
use pkg_constants::controller::{
    DEFAULT_MAX_SURGE_RATIO, DEFAULT_MAX_UNAVAILABLE_RATIO, DEFAULT_PROGRESS_DEADLINE_SECS,
    DEFAULT_SCALE_COOLDOWN_SECS,
};

// --- Rollout strategy ---

/// Rolling-update parameters. Surge rounds up, unavailable rounds down, so a
/// strategy with any surge at all always has room to make progress.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutStrategy {
    #[serde(default = "default_max_surge_ratio")]
    pub max_surge_ratio: f64,
    #[serde(default = "default_max_unavailable_ratio")]
    pub max_unavailable_ratio: f64,
    /// A rollout with no forward progress for this long is marked Failed.
    #[serde(default = "default_progress_deadline")]
    pub progress_deadline_secs: u64,
}

fn default_max_surge_ratio() -> f64 {
    DEFAULT_MAX_SURGE_RATIO
}
fn default_max_unavailable_ratio() -> f64 {
    DEFAULT_MAX_UNAVAILABLE_RATIO
}
fn default_progress_deadline() -> u64 {
    DEFAULT_PROGRESS_DEADLINE_SECS
}

impl Default for RolloutStrategy {
    fn default() -> Self {
        Self {
            max_surge_ratio: default_max_surge_ratio(),
            max_unavailable_ratio: default_max_unavailable_ratio(),
            progress_deadline_secs: default_progress_deadline(),
        }
    }
}

impl RolloutStrategy {
    /// Extra instances tolerated above `desired` during a rollout.
    pub fn surge(&self, desired: u32) -> u32 {
        (desired as f64 * self.max_surge_ratio).ceil() as u32
    }

    /// Missing ready instances tolerated below `desired` during a rollout.
    pub fn unavailable_budget(&self, desired: u32) -> u32 {
        (desired as f64 * self.max_unavailable_ratio).floor() as u32
    }
}

// --- Autoscale policy ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoscalePolicy {
    pub min_replicas: u32,
    pub max_replicas: u32,
    /// Target mean CPU utilization across Ready instances (percent).
    pub target_utilization_percent: u32,
    /// Minimum gap between two scale changes, to stop flapping.
    #[serde(default = "default_cooldown")]
    pub cooldown_secs: u64,
}

fn default_cooldown() -> u64 {
    DEFAULT_SCALE_COOLDOWN_SECS
}

// --- Rollout history ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum RolloutStatus {
    Progressing,
    Paused,
    Complete,
    Failed,
}

impl std::fmt::Display for RolloutStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RolloutStatus::Progressing => write!(f, "Progressing"),
            RolloutStatus::Paused => write!(f, "Paused"),
            RolloutStatus::Complete => write!(f, "Complete"),
            RolloutStatus::Failed => write!(f, "Failed"),
        }
    }
}

/// Snapshot of one rollout attempt. Revisions are strictly increasing and
/// never reused; the template is kept so a rollback can restore it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RolloutRecord {
    pub revision: u64,
    pub template_hash: String,
    pub template: PodTemplate,
    /// The ReplicaSet being scaled up by this rollout.
    pub replicaset_id: String,
    /// The ReplicaSet being scaled down, if any.
    #[serde(default)]
    pub old_replicaset_id: Option<String>,
    pub status: RolloutStatus,
    pub started_at: DateTime<Utc>,
    /// Last time `observed_ready` increased; drives the progress deadline.
    pub last_progress_at: DateTime<Utc>,
    #[serde(default)]
    pub observed_ready: u32,
}

// --- Deployment status ---

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeploymentStatus {
    pub ready_replicas: u32,
    /// Ready replicas running the current template version.
    pub updated_replicas: u32,
    /// When the autoscaler last changed the replica count.
    #[serde(default)]
    pub last_scale_time: Option<DateTime<Utc>>,
}

// --- Deployment spec ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeploymentSpec {
    pub replicas: u32,
    pub template: PodTemplate,
    #[serde(default)]
    pub strategy: RolloutStrategy,
    /// Label selector for matching instances
    #[serde(default)]
    pub selector: BTreeMap<String, String>,
    /// Pause an in-progress rollout; no new scale changes are issued.
    #[serde(default)]
    pub paused: bool,
    /// Operator-requested undo; consumed by the rollout controller.
    #[serde(default)]
    pub rollback_requested: bool,
    #[serde(default)]
    pub autoscale: Option<AutoscalePolicy>,
}

// --- Deployment ---

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Deployment {
    pub id: String,
    pub name: String,
    pub spec: DeploymentSpec,
    #[serde(default)]
    pub status: DeploymentStatus,
    /// Monotonically increasing generation; bumped on spec changes
    #[serde(default)]
    pub generation: u64,
    /// Last generation observed by the rollout controller
    #[serde(default)]
    pub observed_generation: u64,
    /// ReplicaSet currently serving this deployment's template
    #[serde(default)]
    pub active_replicaset: Option<String>,
    /// ReplicaSet of the previously completed revision (rollback target)
    #[serde(default)]
    pub previous_replicaset: Option<String>,
    /// Ordered rollout history, oldest first.
    #[serde(default)]
    pub history: Vec<RolloutRecord>,
    pub created_at: DateTime<Utc>,
}

impl Deployment {
    /// Highest revision number issued so far (0 before the first rollout).
    pub fn latest_revision(&self) -> u64 {
        self.history.last().map(|r| r.revision).unwrap_or(0)
    }

    /// The record an undo would restore: the highest revision strictly below
    /// the current one whose rollout completed.
    pub fn rollback_target(&self) -> Option<&RolloutRecord> {
        let current = self.latest_revision();
        self.history
            .iter()
            .rev()
            .find(|r| r.revision < current && r.status == RolloutStatus::Complete)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::template::PodTemplate;

    fn make_template(image: &str) -> PodTemplate {
        PodTemplate {
            image: image.to_string(),
            resources: Default::default(),
            liveness_probe: Default::default(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    fn make_record(revision: u64, image: &str, status: RolloutStatus) -> RolloutRecord {
        let template = make_template(image);
        RolloutRecord {
            revision,
            template_hash: template.template_hash(),
            template,
            replicaset_id: format!("rs-{}", revision),
            old_replicaset_id: None,
            status,
            started_at: Utc::now(),
            last_progress_at: Utc::now(),
            observed_ready: 0,
        }
    }

    fn make_deployment(history: Vec<RolloutRecord>) -> Deployment {
        Deployment {
            id: "dep-1".to_string(),
            name: "iris-serve".to_string(),
            spec: DeploymentSpec {
                replicas: 2,
                template: make_template("iris-serve:v3"),
                strategy: RolloutStrategy::default(),
                selector: BTreeMap::new(),
                paused: false,
                rollback_requested: false,
                autoscale: None,
            },
            status: DeploymentStatus::default(),
            generation: 1,
            observed_generation: 0,
            active_replicaset: None,
            previous_replicaset: None,
            history,
            created_at: Utc::now(),
        }
    }

    #[test]
    fn test_surge_rounds_up_and_budget_rounds_down() {
        let strategy = RolloutStrategy {
            max_surge_ratio: 0.25,
            max_unavailable_ratio: 0.25,
            progress_deadline_secs: 600,
        };
        assert_eq!(strategy.surge(2), 1);
        assert_eq!(strategy.unavailable_budget(2), 0);
        assert_eq!(strategy.surge(4), 1);
        assert_eq!(strategy.unavailable_budget(4), 1);
        assert_eq!(strategy.surge(0), 0);
    }

    #[test]
    fn test_rollback_target_picks_highest_complete_revision() {
        let deploy = make_deployment(vec![
            make_record(1, "iris-serve:v1", RolloutStatus::Complete),
            make_record(2, "iris-serve:v2", RolloutStatus::Complete),
            make_record(3, "iris-serve:v3", RolloutStatus::Failed),
        ]);
        let target = deploy.rollback_target().unwrap();
        assert_eq!(target.revision, 2);
        assert_eq!(target.template.image, "iris-serve:v2");
    }

    #[test]
    fn test_rollback_target_skips_failed_revisions() {
        let deploy = make_deployment(vec![
            make_record(1, "iris-serve:v1", RolloutStatus::Complete),
            make_record(2, "iris-serve:v2", RolloutStatus::Failed),
            make_record(3, "iris-serve:v3", RolloutStatus::Failed),
        ]);
        assert_eq!(deploy.rollback_target().unwrap().revision, 1);
    }

    #[test]
    fn test_no_rollback_target_without_completed_history() {
        let deploy = make_deployment(vec![make_record(1, "iris-serve:v1", RolloutStatus::Failed)]);
        assert!(deploy.rollback_target().is_none());

        let empty = make_deployment(vec![]);
        assert!(empty.rollback_target().is_none());
    }
}
