use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use chrono::Utc;
use pkg_constants::controller::AUTOSCALE_INTERVAL_SECS;
use pkg_constants::state::{DEPLOYMENTS_PREFIX, INSTANCES_PREFIX};
use pkg_runtime::InstanceRuntime;
use pkg_state::client::StateStore;
use pkg_types::deployment::{AutoscalePolicy, Deployment};
use pkg_types::instance::{InstancePhase, PodInstance};

// --- Scaling math ---

/// Replica count that would bring mean utilization back to `target`,
/// before clamping. Rounds up, so the scaler prefers slack over overload.
pub fn desired_replicas(current: u32, utilization: f64, target_percent: u32) -> u32 {
    (current as f64 * utilization / target_percent as f64).ceil() as u32
}

// --- Controller ---

/// Controller that sizes Deployments from observed utilization. It only
/// writes `spec.replicas`; the rollout controller propagates the new count
/// to the active ReplicaSet.
pub struct AutoscaleController {
    store: StateStore,
    runtime: Arc<dyn InstanceRuntime>,
    check_interval: Duration,
}

impl AutoscaleController {
    pub fn new(store: StateStore, runtime: Arc<dyn InstanceRuntime>) -> Self {
        Self {
            store,
            runtime,
            check_interval: Duration::from_secs(AUTOSCALE_INTERVAL_SECS),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Start the controller loop as a background task. Purely tick-driven:
    /// utilization is a sample, not a store event.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "AutoscaleController started (interval={}s)",
                self.check_interval.as_secs()
            );
            let mut interval = tokio::time::interval(self.check_interval);
            loop {
                interval.tick().await;
                if let Err(e) = self.reconcile().await {
                    warn!("AutoscaleController reconcile error: {}", e);
                }
            }
        })
    }

    /// One pass over all Deployments that carry an autoscale policy.
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let deployments = self
            .store
            .list_prefix_json::<Deployment>(DEPLOYMENTS_PREFIX)
            .await?;
        for (key, deploy, _) in &deployments {
            let Some(policy) = &deploy.spec.autoscale else {
                continue;
            };
            if let Err(e) = self.scale_deployment(key, deploy, policy).await {
                warn!("Deployment {}: autoscale error: {}", deploy.name, e);
            }
        }
        Ok(())
    }

    async fn scale_deployment(
        &self,
        key: &str,
        deploy: &Deployment,
        policy: &AutoscalePolicy,
    ) -> anyhow::Result<()> {
        let Some(active_rs) = &deploy.active_replicaset else {
            // Nothing serving yet; let the first rollout finish.
            return Ok(());
        };

        let ready_ids: Vec<String> = self
            .store
            .list_prefix_json::<PodInstance>(INSTANCES_PREFIX)
            .await?
            .into_iter()
            .map(|(_, inst, _)| inst)
            .filter(|inst| inst.owner_ref == *active_rs && inst.phase == InstancePhase::Ready)
            .map(|inst| inst.id)
            .collect();

        let Some(utilization) = self.runtime.mean_utilization(&ready_ids).await? else {
            debug!("Deployment {}: no utilization samples, skipping", deploy.name);
            return Ok(());
        };

        let current = deploy.spec.replicas;
        let target = desired_replicas(current, utilization, policy.target_utilization_percent)
            .clamp(policy.min_replicas, policy.max_replicas);
        if target == current {
            return Ok(());
        }

        let cooldown = chrono::Duration::seconds(policy.cooldown_secs as i64);
        if let Some(last) = deploy.status.last_scale_time {
            if Utc::now() - last < cooldown {
                debug!(
                    "Deployment {}: in cooldown, holding at {} replicas",
                    deploy.name, current
                );
                return Ok(());
            }
        }

        info!(
            "Deployment {}: scaling {} → {} (utilization {:.1}%, target {}%)",
            deploy.name, current, target, utilization, policy.target_utilization_percent
        );
        self.store
            .update_json::<Deployment, _>(key, |d| {
                if d.spec.replicas != current {
                    // Someone scaled in between; re-sample next pass.
                    return false;
                }
                d.spec.replicas = target;
                d.generation += 1;
                d.status.last_scale_time = Some(Utc::now());
                true
            })
            .await?;
        Ok(())
    }
}
