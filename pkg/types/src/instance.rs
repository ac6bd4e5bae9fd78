use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::template::ProbeSpec;

// --- Instance phase ---

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum InstancePhase {
    Pending,
    Running,
    Ready,
    Failed,
    Terminating,
    Terminated,
}

impl InstancePhase {
    /// Phases that count toward a ReplicaSet's desired replica total.
    pub fn counts_toward_desired(self) -> bool {
        matches!(
            self,
            InstancePhase::Pending | InstancePhase::Running | InstancePhase::Ready
        )
    }
}

impl std::fmt::Display for InstancePhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            InstancePhase::Pending => write!(f, "Pending"),
            InstancePhase::Running => write!(f, "Running"),
            InstancePhase::Ready => write!(f, "Ready"),
            InstancePhase::Failed => write!(f, "Failed"),
            InstancePhase::Terminating => write!(f, "Terminating"),
            InstancePhase::Terminated => write!(f, "Terminated"),
        }
    }
}

// --- Probe result ---

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ProbeResult {
    pub ok: bool,
    pub at: DateTime<Utc>,
}

// --- Pod instance ---

/// One running (or starting, or dying) copy of a workload.
/// `owner_ref` is the owning ReplicaSet id and never changes after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PodInstance {
    pub id: String,
    pub owner_ref: String,
    pub phase: InstancePhase,
    #[serde(default)]
    pub last_probe: Option<ProbeResult>,
    #[serde(default)]
    pub consecutive_successes: u32,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub created_at: DateTime<Utc>,
}

impl PodInstance {
    pub fn new(id: String, owner_ref: String) -> Self {
        Self {
            id,
            owner_ref,
            phase: InstancePhase::Pending,
            last_probe: None,
            consecutive_successes: 0,
            consecutive_failures: 0,
            created_at: Utc::now(),
        }
    }

    /// Apply one probe observation under the given policy.
    ///
    /// Running → Ready after `success_threshold` consecutive successes.
    /// Running/Ready → Failed after `failure_threshold` consecutive failures;
    /// a single failure never demotes a Ready instance.
    pub fn observe_probe(&mut self, ok: bool, probe: &ProbeSpec) {
        self.last_probe = Some(ProbeResult { ok, at: Utc::now() });
        if !matches!(self.phase, InstancePhase::Running | InstancePhase::Ready) {
            return;
        }
        if ok {
            self.consecutive_failures = 0;
            if self.phase == InstancePhase::Running {
                self.consecutive_successes += 1;
                if self.consecutive_successes >= probe.success_threshold {
                    self.phase = InstancePhase::Ready;
                }
            }
        } else {
            self.consecutive_successes = 0;
            self.consecutive_failures += 1;
            if self.consecutive_failures >= probe.failure_threshold {
                self.phase = InstancePhase::Failed;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_instance() -> PodInstance {
        let mut inst = PodInstance::new("inst-1".to_string(), "rs-1".to_string());
        inst.phase = InstancePhase::Running;
        inst
    }

    fn probe(success: u32, failure: u32) -> ProbeSpec {
        ProbeSpec {
            initial_delay_secs: 0,
            period_secs: 1,
            success_threshold: success,
            failure_threshold: failure,
        }
    }

    #[test]
    fn test_ready_after_consecutive_successes() {
        let mut inst = make_instance();
        let spec = probe(2, 3);

        inst.observe_probe(true, &spec);
        assert_eq!(inst.phase, InstancePhase::Running);
        inst.observe_probe(true, &spec);
        assert_eq!(inst.phase, InstancePhase::Ready);
    }

    #[test]
    fn test_failure_resets_success_streak() {
        let mut inst = make_instance();
        let spec = probe(2, 3);

        inst.observe_probe(true, &spec);
        inst.observe_probe(false, &spec);
        inst.observe_probe(true, &spec);
        assert_eq!(inst.phase, InstancePhase::Running);
        inst.observe_probe(true, &spec);
        assert_eq!(inst.phase, InstancePhase::Ready);
    }

    #[test]
    fn test_ready_survives_failures_below_threshold() {
        let mut inst = make_instance();
        let spec = probe(1, 3);

        inst.observe_probe(true, &spec);
        assert_eq!(inst.phase, InstancePhase::Ready);

        inst.observe_probe(false, &spec);
        inst.observe_probe(false, &spec);
        assert_eq!(inst.phase, InstancePhase::Ready);
        inst.observe_probe(false, &spec);
        assert_eq!(inst.phase, InstancePhase::Failed);
    }

    #[test]
    fn test_probe_ignored_while_pending() {
        let mut inst = PodInstance::new("inst-1".to_string(), "rs-1".to_string());
        let spec = probe(1, 1);
        inst.observe_probe(false, &spec);
        assert_eq!(inst.phase, InstancePhase::Pending);
        assert!(inst.last_probe.is_some());
    }
}
