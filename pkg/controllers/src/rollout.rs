use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use chrono::Utc;
use pkg_constants::controller::ROLLOUT_INTERVAL_SECS;
use pkg_constants::state::{DEPLOYMENTS_PREFIX, REPLICASETS_PREFIX};
use pkg_state::client::{CasOutcome, StateStore};
use pkg_types::deployment::{Deployment, RolloutRecord, RolloutStatus};
use pkg_types::replicaset::{ReplicaSet, ReplicaSetSpec};

fn deployment_key(id: &str) -> String {
    format!("{}{}", DEPLOYMENTS_PREFIX, id)
}

fn rs_key(id: &str) -> String {
    format!("{}{}", REPLICASETS_PREFIX, id)
}

// --- Step planning ---

/// Compute the next `(old, new)` desired counts for one rollout step.
///
/// The new ReplicaSet grows into whatever room the surge allowance leaves
/// above the old one, and never shrinks mid-rollout. The old ReplicaSet
/// gives up only as many replicas as keep total readiness at or above
/// `desired - budget`.
///
/// Scale-down victim selection is newest-first, not readiness-aware, so a
/// cut may land on a Ready instance even when a not-ready one exists.
/// Every cut is therefore budgeted as if it cost a ready replica; the one
/// exception is an old side with zero ready replicas (a drained or broken
/// revision), whose replicas are free to shed.
pub fn plan_rollout_step(
    desired: u32,
    surge: u32,
    budget: u32,
    old_desired: u32,
    old_ready: u32,
    new_desired: u32,
    new_ready: u32,
) -> (u32, u32) {
    let new_target = (desired + surge)
        .saturating_sub(old_desired)
        .min(desired)
        .max(new_desired.min(desired));

    let floor = desired.saturating_sub(budget);
    let ready_cut = (old_ready + new_ready).saturating_sub(floor).min(old_ready);
    let free_cut = if old_ready == 0 { old_desired } else { 0 };
    let cut = (free_cut + ready_cut).min(old_desired);

    (old_desired - cut, new_target)
}

// --- Controller ---

/// Controller that turns Deployment template changes into rolling updates
/// across ReplicaSets. It only ever writes desired replica counts; the
/// ReplicaSet reconciler does the actual instance work.
pub struct RolloutController {
    store: StateStore,
    check_interval: Duration,
}

impl RolloutController {
    pub fn new(store: StateStore) -> Self {
        Self {
            store,
            check_interval: Duration::from_secs(ROLLOUT_INTERVAL_SECS),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Start the controller loop as a background task. Woken by the periodic
    /// tick and by Deployment or ReplicaSet changes (ready counts climbing
    /// is what moves a rollout forward).
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "RolloutController started (interval={}s)",
                self.check_interval.as_secs()
            );
            let mut interval = tokio::time::interval(self.check_interval);
            let mut watch = self.store.subscribe();
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    event = watch.recv() => {
                        match event {
                            Ok(ev) if ev.key.starts_with(DEPLOYMENTS_PREFIX)
                                || ev.key.starts_with(REPLICASETS_PREFIX) =>
                            {
                                while watch.try_recv().is_ok() {}
                            }
                            Ok(_) => continue,
                            Err(RecvError::Lagged(_)) => {}
                            Err(RecvError::Closed) => {}
                        }
                    }
                }
                if let Err(e) = self.reconcile().await {
                    warn!("RolloutController reconcile error: {}", e);
                }
            }
        })
    }

    /// One full pass over all Deployments.
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let deployments = self
            .store
            .list_prefix_json::<Deployment>(DEPLOYMENTS_PREFIX)
            .await?;
        for (_, deploy, version) in &deployments {
            if let Err(e) = self.reconcile_deployment(deploy, *version).await {
                warn!("Deployment {}: reconcile error: {}", deploy.name, e);
            }
        }
        Ok(())
    }

    async fn reconcile_deployment(&self, stored: &Deployment, version: u64) -> anyhow::Result<()> {
        let mut deploy = stored.clone();

        // An undo request restores the last completed earlier template and
        // then runs as an ordinary rollout to a fresh revision.
        if deploy.spec.rollback_requested {
            deploy.spec.rollback_requested = false;
            match deploy.rollback_target().cloned() {
                Some(target) => {
                    info!(
                        "Deployment {}: rolling back to revision {} ({})",
                        deploy.name, target.revision, target.template.image
                    );
                    deploy.spec.template = target.template;
                    deploy.generation += 1;
                }
                None => warn!(
                    "Deployment {}: rollback requested but no completed earlier revision",
                    deploy.name
                ),
            }
        }

        // A template hash nobody has a record for starts a new revision.
        let hash = deploy.spec.template.template_hash();
        if deploy
            .history
            .last()
            .map(|r| r.template_hash != hash)
            .unwrap_or(true)
        {
            let initial = if deploy.history.is_empty() {
                deploy.spec.replicas
            } else {
                0
            };
            let rs_id = self.ensure_replicaset(&deploy, &hash, initial).await?;
            let old_rs_id = deploy
                .history
                .last()
                .map(|r| r.replicaset_id.clone())
                .filter(|id| *id != rs_id);
            let revision = deploy.latest_revision() + 1;
            let now = Utc::now();
            info!(
                "Deployment {}: starting rollout revision {} ({})",
                deploy.name, revision, deploy.spec.template.image
            );
            deploy.history.push(RolloutRecord {
                revision,
                template_hash: hash,
                template: deploy.spec.template.clone(),
                replicaset_id: rs_id,
                old_replicaset_id: old_rs_id,
                status: if deploy.spec.paused {
                    RolloutStatus::Paused
                } else {
                    RolloutStatus::Progressing
                },
                started_at: now,
                last_progress_at: now,
                observed_ready: 0,
            });
        }

        let owned: Vec<ReplicaSet> = self
            .store
            .list_prefix_json::<ReplicaSet>(REPLICASETS_PREFIX)
            .await?
            .into_iter()
            .map(|(_, rs, _)| rs)
            .filter(|rs| rs.owner_ref.as_deref() == Some(deploy.id.as_str()))
            .collect();

        let Some(mut record) = deploy.history.last().cloned() else {
            return Ok(());
        };
        let desired = deploy.spec.replicas;
        let strategy = deploy.spec.strategy.clone();
        let new_rs = owned.iter().find(|rs| rs.id == record.replicaset_id).cloned();
        let old_rs = record
            .old_replicaset_id
            .as_ref()
            .and_then(|id| owned.iter().find(|rs| rs.id == *id))
            .cloned();

        match record.status {
            RolloutStatus::Paused => {
                if !deploy.spec.paused {
                    info!(
                        "Deployment {}: rollout revision {} resumed",
                        deploy.name, record.revision
                    );
                    record.status = RolloutStatus::Progressing;
                    // Time spent paused does not count against the deadline.
                    record.last_progress_at = Utc::now();
                }
            }
            RolloutStatus::Progressing if deploy.spec.paused => {
                info!(
                    "Deployment {}: rollout revision {} paused",
                    deploy.name, record.revision
                );
                record.status = RolloutStatus::Paused;
            }
            RolloutStatus::Progressing => {
                let Some(new_rs) = &new_rs else {
                    warn!(
                        "Deployment {}: ReplicaSet {} missing from store",
                        deploy.name, record.replicaset_id
                    );
                    return Ok(());
                };
                let new_ready = new_rs.status.ready_replicas;
                let (old_desired, old_ready) = old_rs
                    .as_ref()
                    .map(|rs| (rs.spec.replicas, rs.status.ready_replicas))
                    .unwrap_or((0, 0));

                if new_ready > record.observed_ready {
                    record.observed_ready = new_ready;
                    record.last_progress_at = Utc::now();
                }

                let deadline = chrono::Duration::seconds(strategy.progress_deadline_secs as i64);
                if new_ready >= desired && old_desired == 0 {
                    info!(
                        "Deployment {}: rollout revision {} complete",
                        deploy.name, record.revision
                    );
                    record.status = RolloutStatus::Complete;
                    if deploy.active_replicaset.as_deref() != Some(record.replicaset_id.as_str()) {
                        deploy.previous_replicaset = deploy.active_replicaset.take();
                    }
                    deploy.active_replicaset = Some(record.replicaset_id.clone());
                    self.store
                        .update_json::<ReplicaSet, _>(&rs_key(&record.replicaset_id), |rs| {
                            if rs.spec.surge_ceiling.is_none() {
                                return false;
                            }
                            rs.spec.surge_ceiling = None;
                            true
                        })
                        .await?;
                } else if Utc::now() - record.last_progress_at > deadline {
                    // Freeze: neither ReplicaSet is touched until an operator
                    // intervenes (rollback or a new template).
                    warn!(
                        "Deployment {}: rollout revision {} made no progress for {}s, marking Failed",
                        deploy.name, record.revision, strategy.progress_deadline_secs
                    );
                    record.status = RolloutStatus::Failed;
                } else {
                    let surge = strategy.surge(desired);
                    let budget = strategy.unavailable_budget(desired);
                    let (old_target, new_target) = plan_rollout_step(
                        desired,
                        surge,
                        budget,
                        old_desired,
                        old_ready,
                        new_rs.spec.replicas,
                        new_ready,
                    );
                    // Cap the new ReplicaSet's live instances (in-flight
                    // creations included) so replacement churn cannot push
                    // the total past desired + surge.
                    let ceiling = (desired + surge).saturating_sub(old_target);
                    self.store
                        .update_json::<ReplicaSet, _>(&rs_key(&record.replicaset_id), |rs| {
                            if rs.spec.replicas == new_target
                                && rs.spec.surge_ceiling == Some(ceiling)
                            {
                                return false;
                            }
                            rs.spec.replicas = new_target;
                            rs.spec.surge_ceiling = Some(ceiling);
                            true
                        })
                        .await?;
                    if let Some(old_rs) = &old_rs {
                        if old_target != old_desired {
                            debug!(
                                "Deployment {}: scaling old ReplicaSet {} {} → {}",
                                deploy.name, old_rs.id, old_desired, old_target
                            );
                            self.store
                                .update_json::<ReplicaSet, _>(&rs_key(&old_rs.id), |rs| {
                                    if rs.spec.replicas == old_target {
                                        return false;
                                    }
                                    rs.spec.replicas = old_target;
                                    true
                                })
                                .await?;
                        }
                    }
                }
            }
            RolloutStatus::Complete => {
                // Steady state: the active ReplicaSet tracks the desired
                // count, which is how plain scaling (and the autoscaler)
                // takes effect without a rollout.
                self.store
                    .update_json::<ReplicaSet, _>(&rs_key(&record.replicaset_id), |rs| {
                        if rs.spec.replicas == desired && rs.spec.surge_ceiling.is_none() {
                            return false;
                        }
                        rs.spec.replicas = desired;
                        rs.spec.surge_ceiling = None;
                        true
                    })
                    .await?;
            }
            RolloutStatus::Failed => {}
        }

        // ReplicaSets from older revisions are kept (rollbacks reuse them)
        // but scaled to zero. A paused rollout issues no scale changes at
        // all, stale revisions included.
        if record.status != RolloutStatus::Paused {
            for rs in &owned {
                if rs.id == record.replicaset_id
                    || record.old_replicaset_id.as_deref() == Some(rs.id.as_str())
                {
                    continue;
                }
                if rs.spec.replicas != 0 {
                    self.store
                        .update_json::<ReplicaSet, _>(&rs_key(&rs.id), |stored| {
                            if stored.spec.replicas == 0 {
                                return false;
                            }
                            stored.spec.replicas = 0;
                            stored.spec.surge_ceiling = None;
                            true
                        })
                        .await?;
                }
            }
        }

        deploy.status.ready_replicas = owned.iter().map(|rs| rs.status.ready_replicas).sum();
        deploy.status.updated_replicas = new_rs.map(|rs| rs.status.ready_replicas).unwrap_or(0);
        deploy.observed_generation = deploy.generation;
        if let Some(last) = deploy.history.last_mut() {
            *last = record;
        }

        if serde_json::to_value(&deploy)? != serde_json::to_value(stored)? {
            match self
                .store
                .cas_json(&deployment_key(&deploy.id), version, &deploy)
                .await?
            {
                CasOutcome::Committed(_) => {}
                CasOutcome::Conflict { .. } => {
                    // Someone (operator, autoscaler) wrote in between; the
                    // next pass re-reads and re-plans.
                    debug!("Deployment {}: concurrent update, retrying next pass", deploy.name);
                }
            }
        }
        Ok(())
    }

    /// Find the owned ReplicaSet already running `hash`, or create one.
    /// Reuse is what makes rollbacks cheap: the old revision's ReplicaSet is
    /// still there at zero replicas.
    async fn ensure_replicaset(
        &self,
        deploy: &Deployment,
        hash: &str,
        initial_replicas: u32,
    ) -> anyhow::Result<String> {
        let owned = self
            .store
            .list_prefix_json::<ReplicaSet>(REPLICASETS_PREFIX)
            .await?;
        for (_, rs, _) in &owned {
            if rs.owner_ref.as_deref() == Some(deploy.id.as_str()) && rs.template_hash == hash {
                return Ok(rs.id.clone());
            }
        }

        let id = Uuid::new_v4().to_string();
        let rs = ReplicaSet {
            id: id.clone(),
            name: format!("{}-{}", deploy.name, &hash[..8]),
            spec: ReplicaSetSpec {
                replicas: initial_replicas,
                selector: deploy.spec.selector.clone(),
                template: deploy.spec.template.clone(),
                surge_ceiling: None,
            },
            status: Default::default(),
            owner_ref: Some(deploy.id.clone()),
            template_hash: hash.to_string(),
            created_at: Utc::now(),
        };
        match self.store.cas_json(&rs_key(&id), 0, &rs).await? {
            CasOutcome::Committed(_) => {
                info!(
                    "Deployment {}: created ReplicaSet {} for template {}",
                    deploy.name, rs.name, hash
                );
                Ok(id)
            }
            CasOutcome::Conflict { .. } => {
                anyhow::bail!("ReplicaSet id collision for {}", id)
            }
        }
    }
}
