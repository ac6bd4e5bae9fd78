use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tracing::info;
use uuid::Uuid;

use crate::backend::{InstanceObservation, InstanceRuntime};
use pkg_types::instance::{InstancePhase, ProbeResult};
use pkg_types::template::PodTemplate;

struct SimInstance {
    image: String,
    started_at: Instant,
    terminated: bool,
    probe_failing: bool,
    utilization: Option<f64>,
}

struct SimState {
    instances: HashMap<String, SimInstance>,
    fail_next_creates: u32,
    create_calls: u64,
    terminate_calls: u64,
    default_utilization: f64,
}

/// In-process runtime backend. Instances move Pending → Running after a
/// configurable startup delay and then answer probes; tests steer lifecycles
/// through the `set_*` / `fail_*` knobs.
#[derive(Clone)]
pub struct SimulatedRuntime {
    inner: Arc<Mutex<SimState>>,
    startup_delay: Duration,
}

impl SimulatedRuntime {
    pub fn new() -> Self {
        Self::with_startup_delay(Duration::from_secs(2))
    }

    /// Instances report Pending until `startup_delay` has elapsed.
    pub fn with_startup_delay(startup_delay: Duration) -> Self {
        Self {
            inner: Arc::new(Mutex::new(SimState {
                instances: HashMap::new(),
                fail_next_creates: 0,
                create_calls: 0,
                terminate_calls: 0,
                default_utilization: 50.0,
            })),
            startup_delay,
        }
    }

    /// Make the next `n` create calls fail with a transient error.
    pub fn fail_next_creates(&self, n: u32) {
        self.inner.lock().unwrap().fail_next_creates = n;
    }

    /// Force an instance's probes to start failing (or recover).
    pub fn set_probe_failing(&self, id: &str, failing: bool) {
        if let Some(inst) = self.inner.lock().unwrap().instances.get_mut(id) {
            inst.probe_failing = failing;
        }
    }

    /// Drop an instance without a terminate call, as if its node vanished.
    pub fn remove_instance(&self, id: &str) {
        self.inner.lock().unwrap().instances.remove(id);
    }

    /// Utilization reported for instances without a per-instance override.
    pub fn set_default_utilization(&self, percent: f64) {
        self.inner.lock().unwrap().default_utilization = percent;
    }

    pub fn set_instance_utilization(&self, id: &str, percent: f64) {
        if let Some(inst) = self.inner.lock().unwrap().instances.get_mut(id) {
            inst.utilization = Some(percent);
        }
    }

    /// Total create calls issued, including failed ones.
    pub fn create_calls(&self) -> u64 {
        self.inner.lock().unwrap().create_calls
    }

    pub fn terminate_calls(&self) -> u64 {
        self.inner.lock().unwrap().terminate_calls
    }

    /// Ids of instances that exist and have not been terminated.
    pub fn live_instance_ids(&self) -> Vec<String> {
        let state = self.inner.lock().unwrap();
        state
            .instances
            .iter()
            .filter(|(_, inst)| !inst.terminated)
            .map(|(id, _)| id.clone())
            .collect()
    }
}

impl Default for SimulatedRuntime {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl InstanceRuntime for SimulatedRuntime {
    fn name(&self) -> &str {
        "simulated"
    }

    async fn create_instance(
        &self,
        template: &PodTemplate,
        _labels: &BTreeMap<String, String>,
    ) -> Result<String> {
        let mut state = self.inner.lock().unwrap();
        state.create_calls += 1;
        if state.fail_next_creates > 0 {
            state.fail_next_creates -= 1;
            anyhow::bail!("simulated creation failure for image {}", template.image);
        }
        let id = Uuid::new_v4().to_string();
        state.instances.insert(
            id.clone(),
            SimInstance {
                image: template.image.clone(),
                started_at: Instant::now(),
                terminated: false,
                probe_failing: false,
                utilization: None,
            },
        );
        info!("[simulated] created instance {} ({})", id, template.image);
        Ok(id)
    }

    async fn terminate_instance(&self, id: &str) -> Result<()> {
        let mut state = self.inner.lock().unwrap();
        state.terminate_calls += 1;
        if let Some(inst) = state.instances.get_mut(id) {
            inst.terminated = true;
            info!("[simulated] terminated instance {} ({})", id, inst.image);
        }
        Ok(())
    }

    async fn get_status(&self, id: &str) -> Result<InstanceObservation> {
        let state = self.inner.lock().unwrap();
        let Some(inst) = state.instances.get(id) else {
            return Ok(InstanceObservation {
                phase: InstancePhase::Terminated,
                last_probe: None,
            });
        };
        if inst.terminated {
            return Ok(InstanceObservation {
                phase: InstancePhase::Terminated,
                last_probe: None,
            });
        }
        if inst.started_at.elapsed() < self.startup_delay {
            return Ok(InstanceObservation {
                phase: InstancePhase::Pending,
                last_probe: None,
            });
        }
        Ok(InstanceObservation {
            phase: InstancePhase::Running,
            last_probe: Some(ProbeResult {
                ok: !inst.probe_failing,
                at: Utc::now(),
            }),
        })
    }

    async fn mean_utilization(&self, ids: &[String]) -> Result<Option<f64>> {
        let state = self.inner.lock().unwrap();
        let samples: Vec<f64> = ids
            .iter()
            .filter_map(|id| {
                let inst = state.instances.get(id)?;
                if inst.terminated {
                    return None;
                }
                Some(inst.utilization.unwrap_or(state.default_utilization))
            })
            .collect();
        if samples.is_empty() {
            return Ok(None);
        }
        Ok(Some(samples.iter().sum::<f64>() / samples.len() as f64))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_template() -> PodTemplate {
        PodTemplate {
            image: "iris-serve:v1".to_string(),
            resources: Default::default(),
            liveness_probe: Default::default(),
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    #[tokio::test]
    async fn test_instance_runs_after_startup_delay() {
        let runtime = SimulatedRuntime::with_startup_delay(Duration::ZERO);
        let id = runtime
            .create_instance(&make_template(), &BTreeMap::new())
            .await
            .unwrap();

        let obs = runtime.get_status(&id).await.unwrap();
        assert_eq!(obs.phase, InstancePhase::Running);
        assert!(obs.last_probe.unwrap().ok);
    }

    #[tokio::test]
    async fn test_unknown_instance_reports_terminated() {
        let runtime = SimulatedRuntime::with_startup_delay(Duration::ZERO);
        let obs = runtime.get_status("no-such-id").await.unwrap();
        assert_eq!(obs.phase, InstancePhase::Terminated);
    }

    #[tokio::test]
    async fn test_injected_create_failures() {
        let runtime = SimulatedRuntime::with_startup_delay(Duration::ZERO);
        runtime.fail_next_creates(1);

        assert!(
            runtime
                .create_instance(&make_template(), &BTreeMap::new())
                .await
                .is_err()
        );
        assert!(
            runtime
                .create_instance(&make_template(), &BTreeMap::new())
                .await
                .is_ok()
        );
        assert_eq!(runtime.create_calls(), 2);
    }

    #[tokio::test]
    async fn test_probe_failures_reported() {
        let runtime = SimulatedRuntime::with_startup_delay(Duration::ZERO);
        let id = runtime
            .create_instance(&make_template(), &BTreeMap::new())
            .await
            .unwrap();
        runtime.set_probe_failing(&id, true);

        let obs = runtime.get_status(&id).await.unwrap();
        assert!(!obs.last_probe.unwrap().ok);
    }

    #[tokio::test]
    async fn test_mean_utilization_averages_live_instances() {
        let runtime = SimulatedRuntime::with_startup_delay(Duration::ZERO);
        let a = runtime
            .create_instance(&make_template(), &BTreeMap::new())
            .await
            .unwrap();
        let b = runtime
            .create_instance(&make_template(), &BTreeMap::new())
            .await
            .unwrap();
        runtime.set_instance_utilization(&a, 80.0);
        runtime.set_instance_utilization(&b, 40.0);

        let mean = runtime
            .mean_utilization(&[a, b])
            .await
            .unwrap()
            .unwrap();
        assert!((mean - 60.0).abs() < f64::EPSILON);

        assert_eq!(runtime.mean_utilization(&[]).await.unwrap(), None);
    }
}
