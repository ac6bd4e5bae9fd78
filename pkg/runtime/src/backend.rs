use anyhow::Result;
use async_trait::async_trait;
use std::collections::BTreeMap;

use pkg_types::instance::{InstancePhase, ProbeResult};
use pkg_types::template::PodTemplate;

/// What the runtime knows about one instance right now. The runtime reports
/// raw lifecycle phase (Pending/Running/Terminated) and the latest probe
/// result; readiness policy is applied by the reconciler, not here.
#[derive(Debug, Clone)]
pub struct InstanceObservation {
    pub phase: InstancePhase,
    pub last_probe: Option<ProbeResult>,
}

/// Pluggable instance runtime trait.
/// Production backends launch real containers; tests use [`SimulatedRuntime`].
///
/// All calls may take seconds and may fail transiently. Callers track
/// in-flight requests and retry; the runtime itself keeps no reconciliation
/// state.
///
/// [`SimulatedRuntime`]: crate::simulated::SimulatedRuntime
#[async_trait]
pub trait InstanceRuntime: Send + Sync {
    /// Human-readable name of this runtime backend.
    fn name(&self) -> &str;

    /// Launch a new instance of `template` carrying `labels`.
    /// Returns the runtime-assigned instance id.
    async fn create_instance(
        &self,
        template: &PodTemplate,
        labels: &BTreeMap<String, String>,
    ) -> Result<String>;

    /// Terminate an instance. Acknowledging an unknown id is not an error;
    /// the instance may already be gone.
    async fn terminate_instance(&self, id: &str) -> Result<()>;

    /// Current phase and latest probe result for an instance.
    /// Unknown ids report `Terminated`.
    async fn get_status(&self, id: &str) -> Result<InstanceObservation>;

    /// Mean CPU utilization (percent of requested) across the given
    /// instances, or `None` when no samples are available.
    async fn mean_utilization(&self, ids: &[String]) -> Result<Option<f64>>;
}
