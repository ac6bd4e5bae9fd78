use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

use pkg_constants::controller::{
    CREATE_BACKOFF_BASE_MS, CREATE_BACKOFF_MAX_MS, RECONCILE_INTERVAL_SECS,
};
use pkg_constants::state::{INSTANCES_PREFIX, REPLICASETS_PREFIX};
use pkg_runtime::InstanceRuntime;
use pkg_state::client::StateStore;
use pkg_types::instance::{InstancePhase, PodInstance};
use pkg_types::replicaset::{ReplicaSet, ReplicaSetSpec};

fn instance_key(id: &str) -> String {
    format!("{}{}", INSTANCES_PREFIX, id)
}

// --- Planning ---

/// The actions one reconcile pass decided on for a ReplicaSet.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct ReconcilePlan {
    pub create: u32,
    pub terminate: Vec<String>,
}

impl ReconcilePlan {
    pub fn is_empty(&self) -> bool {
        self.create == 0 && self.terminate.is_empty()
    }
}

/// Compute the minimal create/terminate set for one ReplicaSet.
///
/// Failed (and stuck Terminating) instances are always terminated and count
/// as deficit, so they get replaced. Scale-down terminates the newest
/// Running/Ready instances first, ties broken by id. In-flight work is
/// accounted for, so re-planning with unchanged inputs yields an empty plan.
pub fn plan(
    spec: &ReplicaSetSpec,
    instances: &[PodInstance],
    pending_creates: u32,
    pending_terminations: &HashSet<String>,
) -> ReconcilePlan {
    let mut terminate: Vec<String> = Vec::new();

    for inst in instances {
        let dying = matches!(inst.phase, InstancePhase::Failed | InstancePhase::Terminating);
        if dying && !pending_terminations.contains(&inst.id) {
            terminate.push(inst.id.clone());
        }
    }

    let mut active: Vec<&PodInstance> = instances
        .iter()
        .filter(|i| i.phase.counts_toward_desired() && !pending_terminations.contains(&i.id))
        .collect();

    let live = active.len() as u32 + pending_creates;
    let mut create = 0;
    if live < spec.replicas {
        let deficit = spec.replicas - live;
        // The surge ceiling caps total live instances, counting in-flight
        // creations. It never caps below the desired count itself.
        let ceiling = spec.surge_ceiling.unwrap_or(spec.replicas).max(spec.replicas);
        create = deficit.min(ceiling.saturating_sub(live));
    } else if live > spec.replicas {
        let excess = (live - spec.replicas) as usize;
        // Newest first, so warm long-lived instances survive scale-down.
        active.sort_by(|a, b| b.created_at.cmp(&a.created_at).then(a.id.cmp(&b.id)));
        for inst in active.into_iter().take(excess) {
            terminate.push(inst.id.clone());
        }
    }

    ReconcilePlan { create, terminate }
}

// --- Driver ---

struct CreateBackoff {
    failures: u32,
    retry_at: Instant,
}

#[derive(Default)]
struct InFlight {
    /// ReplicaSet id → number of creations currently in flight.
    pending_creates: HashMap<String, u32>,
    /// Instance ids with a termination in flight.
    pending_terminations: HashSet<String>,
    /// ReplicaSet id → backoff state after failed creations.
    backoff: HashMap<String, CreateBackoff>,
}

/// Controller that converges pod instances toward each ReplicaSet's desired
/// count. Runtime calls are issued asynchronously; the loop tracks in-flight
/// actions instead of blocking on them and re-runs when they settle.
pub struct ReplicaSetReconciler {
    store: StateStore,
    runtime: Arc<dyn InstanceRuntime>,
    check_interval: Duration,
    in_flight: Arc<Mutex<InFlight>>,
    wakeup: Arc<Notify>,
}

impl ReplicaSetReconciler {
    pub fn new(store: StateStore, runtime: Arc<dyn InstanceRuntime>) -> Self {
        Self {
            store,
            runtime,
            check_interval: Duration::from_secs(RECONCILE_INTERVAL_SECS),
            in_flight: Arc::new(Mutex::new(InFlight::default())),
            wakeup: Arc::new(Notify::new()),
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.check_interval = interval;
        self
    }

    /// Start the controller loop as a background task. Woken by the periodic
    /// tick, by ReplicaSet changes in the store, and by settling runtime
    /// calls; bursts of wakeups coalesce into a single pass.
    pub fn start(self) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "ReplicaSetReconciler started (interval={}s)",
                self.check_interval.as_secs()
            );
            let mut interval = tokio::time::interval(self.check_interval);
            let mut watch = self.store.subscribe();
            loop {
                tokio::select! {
                    _ = interval.tick() => {}
                    _ = self.wakeup.notified() => {}
                    event = watch.recv() => {
                        match event {
                            Ok(ev) if ev.key.starts_with(REPLICASETS_PREFIX) => {
                                while watch.try_recv().is_ok() {}
                            }
                            Ok(_) => continue,
                            Err(RecvError::Lagged(_)) => {}
                            Err(RecvError::Closed) => {}
                        }
                    }
                }
                if let Err(e) = self.reconcile().await {
                    warn!("ReplicaSetReconciler reconcile error: {}", e);
                }
            }
        })
    }

    /// One full pass over all ReplicaSets.
    pub async fn reconcile(&self) -> anyhow::Result<()> {
        let rs_entries = self
            .store
            .list_prefix_json::<ReplicaSet>(REPLICASETS_PREFIX)
            .await?;
        let instance_entries = self
            .store
            .list_prefix_json::<PodInstance>(INSTANCES_PREFIX)
            .await?;

        for (_, rs, _) in &rs_entries {
            let owned: Vec<PodInstance> = instance_entries
                .iter()
                .filter(|(_, inst, _)| inst.owner_ref == rs.id)
                .map(|(_, inst, _)| inst.clone())
                .collect();
            if let Err(e) = self.reconcile_replicaset(rs, owned).await {
                warn!("RS {}: reconcile error: {}", rs.name, e);
            }
        }
        Ok(())
    }

    async fn reconcile_replicaset(
        &self,
        rs: &ReplicaSet,
        owned: Vec<PodInstance>,
    ) -> anyhow::Result<()> {
        // Observe: poll the runtime for each owned instance, apply the probe
        // policy, and prune instances the runtime no longer knows about.
        let mut instances: Vec<PodInstance> = Vec::new();
        for mut inst in owned {
            let obs = match self.runtime.get_status(&inst.id).await {
                Ok(obs) => obs,
                Err(e) => {
                    warn!("RS {}: status poll failed for {}: {}", rs.name, inst.id, e);
                    instances.push(inst);
                    continue;
                }
            };

            if obs.phase == InstancePhase::Terminated {
                // Either our termination completed or the instance was lost
                // externally (node gone). Reconcile the record away; any
                // deficit is refilled below.
                self.store.delete(&instance_key(&inst.id)).await?;
                self.in_flight
                    .lock()
                    .unwrap()
                    .pending_terminations
                    .remove(&inst.id);
                if inst.phase != InstancePhase::Terminating {
                    info!("RS {}: instance {} vanished externally", rs.name, inst.id);
                }
                continue;
            }

            let before_phase = inst.phase;
            let before_counters = (inst.consecutive_successes, inst.consecutive_failures);
            if obs.phase == InstancePhase::Running && inst.phase == InstancePhase::Pending {
                inst.phase = InstancePhase::Running;
            }
            if let Some(probe) = obs.last_probe {
                inst.observe_probe(probe.ok, &rs.spec.template.liveness_probe);
            }
            if inst.phase != before_phase
                || (inst.consecutive_successes, inst.consecutive_failures) != before_counters
            {
                if inst.phase != before_phase {
                    info!(
                        "RS {}: instance {} {} → {}",
                        rs.name, inst.id, before_phase, inst.phase
                    );
                }
                self.store.put_json(&instance_key(&inst.id), &inst).await?;
            }
            instances.push(inst);
        }

        // Plan.
        let (pending_creates, pending_terminations, backoff_active) = {
            let in_flight = self.in_flight.lock().unwrap();
            (
                in_flight.pending_creates.get(&rs.id).copied().unwrap_or(0),
                in_flight.pending_terminations.clone(),
                in_flight
                    .backoff
                    .get(&rs.id)
                    .is_some_and(|b| b.retry_at > Instant::now()),
            )
        };
        let mut decided = plan(&rs.spec, &instances, pending_creates, &pending_terminations);
        if backoff_active && decided.create > 0 {
            // Still deficient; the next tick retries once the backoff expires.
            debug!("RS {}: deferring {} creations (backoff)", rs.name, decided.create);
            decided.create = 0;
        }

        // Apply, without blocking this pass on runtime calls.
        for _ in 0..decided.create {
            self.spawn_create(rs);
        }
        for id in &decided.terminate {
            let first = self
                .in_flight
                .lock()
                .unwrap()
                .pending_terminations
                .insert(id.clone());
            if !first {
                continue;
            }
            self.store
                .update_json::<PodInstance, _>(&instance_key(id), |inst| {
                    if inst.phase == InstancePhase::Terminating {
                        return false;
                    }
                    inst.phase = InstancePhase::Terminating;
                    true
                })
                .await?;
            self.spawn_terminate(rs, id.clone());
        }

        // Status.
        let counted = instances
            .iter()
            .filter(|i| i.phase.counts_toward_desired())
            .count() as u32;
        let ready = instances
            .iter()
            .filter(|i| i.phase == InstancePhase::Ready)
            .count() as u32;
        let failed = instances
            .iter()
            .filter(|i| i.phase == InstancePhase::Failed)
            .count() as u32;
        self.store
            .update_json::<ReplicaSet, _>(
                &format!("{}{}", REPLICASETS_PREFIX, rs.id),
                |stored| {
                    if stored.status.replicas == counted
                        && stored.status.ready_replicas == ready
                        && stored.status.failed_replicas == failed
                    {
                        return false;
                    }
                    stored.status.replicas = counted;
                    stored.status.ready_replicas = ready;
                    stored.status.failed_replicas = failed;
                    true
                },
            )
            .await?;

        Ok(())
    }

    fn spawn_create(&self, rs: &ReplicaSet) {
        {
            let mut in_flight = self.in_flight.lock().unwrap();
            *in_flight.pending_creates.entry(rs.id.clone()).or_insert(0) += 1;
        }
        let store = self.store.clone();
        let runtime = self.runtime.clone();
        let in_flight = self.in_flight.clone();
        let wakeup = self.wakeup.clone();
        let rs_id = rs.id.clone();
        let rs_name = rs.name.clone();
        let template = rs.spec.template.clone();
        let labels = rs.spec.selector.clone();

        tokio::spawn(async move {
            match runtime.create_instance(&template, &labels).await {
                Ok(id) => {
                    let inst = PodInstance::new(id.clone(), rs_id.clone());
                    match store.put_json(&instance_key(&id), &inst).await {
                        Ok(_) => info!("RS {}: created instance {}", rs_name, id),
                        Err(e) => warn!("RS {}: failed to record instance {}: {}", rs_name, id, e),
                    }
                    in_flight.lock().unwrap().backoff.remove(&rs_id);
                }
                Err(e) => {
                    warn!("RS {}: instance creation failed: {}", rs_name, e);
                    let mut guard = in_flight.lock().unwrap();
                    let backoff = guard.backoff.entry(rs_id.clone()).or_insert(CreateBackoff {
                        failures: 0,
                        retry_at: Instant::now(),
                    });
                    backoff.failures += 1;
                    let exp = (backoff.failures - 1).min(16);
                    let delay_ms = (CREATE_BACKOFF_BASE_MS << exp).min(CREATE_BACKOFF_MAX_MS);
                    backoff.retry_at = Instant::now() + Duration::from_millis(delay_ms);
                }
            }
            let mut guard = in_flight.lock().unwrap();
            if let Some(n) = guard.pending_creates.get_mut(&rs_id) {
                *n = n.saturating_sub(1);
            }
            drop(guard);
            wakeup.notify_one();
        });
    }

    fn spawn_terminate(&self, rs: &ReplicaSet, id: String) {
        let store = self.store.clone();
        let runtime = self.runtime.clone();
        let in_flight = self.in_flight.clone();
        let wakeup = self.wakeup.clone();
        let rs_name = rs.name.clone();

        tokio::spawn(async move {
            match runtime.terminate_instance(&id).await {
                Ok(()) => {
                    if let Err(e) = store.delete(&instance_key(&id)).await {
                        warn!("RS {}: failed to remove instance record {}: {}", rs_name, id, e);
                    } else {
                        info!("RS {}: terminated instance {}", rs_name, id);
                    }
                }
                Err(e) => {
                    // Left Terminating in the store; the next pass re-plans it.
                    warn!("RS {}: termination failed for {}: {}", rs_name, id, e);
                }
            }
            in_flight.lock().unwrap().pending_terminations.remove(&id);
            wakeup.notify_one();
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration as ChronoDuration, Utc};
    use pkg_runtime::SimulatedRuntime;
    use pkg_types::template::{PodTemplate, ProbeSpec};
    use std::collections::BTreeMap;

    fn make_template() -> PodTemplate {
        PodTemplate {
            image: "iris-serve:v1".to_string(),
            resources: Default::default(),
            liveness_probe: ProbeSpec {
                initial_delay_secs: 0,
                period_secs: 1,
                success_threshold: 1,
                failure_threshold: 1,
            },
            env: BTreeMap::new(),
            labels: BTreeMap::new(),
        }
    }

    fn make_spec(replicas: u32) -> ReplicaSetSpec {
        ReplicaSetSpec {
            replicas,
            selector: BTreeMap::from([("app".to_string(), "iris".to_string())]),
            template: make_template(),
            surge_ceiling: None,
        }
    }

    fn make_instance(id: &str, phase: InstancePhase, age_secs: i64) -> PodInstance {
        let mut inst = PodInstance::new(id.to_string(), "rs-1".to_string());
        inst.phase = phase;
        inst.created_at = Utc::now() - ChronoDuration::seconds(age_secs);
        inst
    }

    fn make_rs(replicas: u32) -> ReplicaSet {
        let template = make_template();
        ReplicaSet {
            id: "rs-1".to_string(),
            name: "iris-serve-rs".to_string(),
            template_hash: template.template_hash(),
            spec: make_spec(replicas),
            status: Default::default(),
            owner_ref: None,
            created_at: Utc::now(),
        }
    }

    // --- plan ---

    #[test]
    fn test_plan_creates_deficit() {
        let decided = plan(
            &make_spec(3),
            &[make_instance("a", InstancePhase::Ready, 30)],
            0,
            &HashSet::new(),
        );
        assert_eq!(decided.create, 2);
        assert!(decided.terminate.is_empty());
    }

    #[test]
    fn test_plan_accounts_for_in_flight_creates() {
        let decided = plan(
            &make_spec(3),
            &[make_instance("a", InstancePhase::Ready, 30)],
            2,
            &HashSet::new(),
        );
        assert!(decided.is_empty());
    }

    #[test]
    fn test_plan_scale_down_terminates_newest_first() {
        let instances = vec![
            make_instance("old", InstancePhase::Ready, 300),
            make_instance("mid", InstancePhase::Ready, 60),
            make_instance("new", InstancePhase::Ready, 5),
        ];
        let decided = plan(&make_spec(1), &instances, 0, &HashSet::new());
        assert_eq!(decided.create, 0);
        assert_eq!(decided.terminate, vec!["new".to_string(), "mid".to_string()]);
    }

    #[test]
    fn test_plan_terminates_failed_before_ready() {
        let instances = vec![
            make_instance("ready-a", InstancePhase::Ready, 60),
            make_instance("failed-b", InstancePhase::Failed, 30),
            make_instance("ready-c", InstancePhase::Ready, 5),
        ];
        // Scaling down to 1: the Failed instance goes first, then the
        // newest Ready one.
        let decided = plan(&make_spec(1), &instances, 0, &HashSet::new());
        assert_eq!(decided.terminate[0], "failed-b");
        assert_eq!(decided.terminate[1], "ready-c");
    }

    #[test]
    fn test_plan_replaces_failed_even_at_desired_count() {
        let instances = vec![
            make_instance("a", InstancePhase::Ready, 60),
            make_instance("b", InstancePhase::Failed, 30),
        ];
        let decided = plan(&make_spec(2), &instances, 0, &HashSet::new());
        assert_eq!(decided.terminate, vec!["b".to_string()]);
        assert_eq!(decided.create, 1);
    }

    #[test]
    fn test_plan_skips_terminations_already_in_flight() {
        let instances = vec![make_instance("b", InstancePhase::Failed, 30)];
        let in_flight = HashSet::from(["b".to_string()]);
        let decided = plan(&make_spec(0), &instances, 0, &in_flight);
        assert!(decided.terminate.is_empty());
    }

    #[test]
    fn test_plan_respects_surge_ceiling() {
        let mut spec = make_spec(4);
        spec.surge_ceiling = Some(5);
        // 3 in flight + 1 active = 4 live; ceiling 5 allows only 1 more
        // even though 3 are still missing from the desired count.
        let instances = vec![make_instance("a", InstancePhase::Ready, 30)];
        let decided = plan(&spec, &instances, 3, &HashSet::new());
        assert_eq!(decided.create, 0);

        let decided = plan(&spec, &instances, 2, &HashSet::new());
        assert_eq!(decided.create, 1);
    }

    #[test]
    fn test_plan_tie_break_by_id() {
        let mut a = make_instance("aaa", InstancePhase::Ready, 10);
        let b = make_instance("bbb", InstancePhase::Ready, 10);
        a.created_at = b.created_at;
        let decided = plan(&make_spec(1), &[a, b], 0, &HashSet::new());
        assert_eq!(decided.terminate, vec!["aaa".to_string()]);
    }

    // --- driver ---

    async fn setup(replicas: u32) -> (StateStore, SimulatedRuntime, ReplicaSetReconciler) {
        let store = StateStore::new_in_memory().await.unwrap();
        let runtime = SimulatedRuntime::with_startup_delay(Duration::ZERO);
        let rs = make_rs(replicas);
        store
            .put_json(&format!("{}{}", REPLICASETS_PREFIX, rs.id), &rs)
            .await
            .unwrap();
        let reconciler = ReplicaSetReconciler::new(store.clone(), Arc::new(runtime.clone()));
        (store, runtime, reconciler)
    }

    async fn ready_count(store: &StateStore) -> usize {
        store
            .list_prefix_json::<PodInstance>(INSTANCES_PREFIX)
            .await
            .unwrap()
            .iter()
            .filter(|(_, inst, _)| inst.phase == InstancePhase::Ready)
            .count()
    }

    async fn run_until_ready(reconciler: &ReplicaSetReconciler, store: &StateStore, want: usize) {
        for _ in 0..50 {
            reconciler.reconcile().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
            if ready_count(store).await == want {
                return;
            }
        }
        panic!("never reached {} ready instances", want);
    }

    #[tokio::test]
    async fn test_converges_to_desired_replicas() {
        let (store, runtime, reconciler) = setup(2).await;
        run_until_ready(&reconciler, &store, 2).await;
        assert_eq!(runtime.live_instance_ids().len(), 2);
    }

    #[tokio::test]
    async fn test_settled_state_issues_no_actions() {
        let (store, runtime, reconciler) = setup(2).await;
        run_until_ready(&reconciler, &store, 2).await;

        let creates = runtime.create_calls();
        let terminates = runtime.terminate_calls();
        for _ in 0..3 {
            reconciler.reconcile().await.unwrap();
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        assert_eq!(runtime.create_calls(), creates);
        assert_eq!(runtime.terminate_calls(), terminates);
    }

    #[tokio::test]
    async fn test_externally_deleted_instance_is_replaced() {
        let (store, runtime, reconciler) = setup(2).await;
        run_until_ready(&reconciler, &store, 2).await;
        let creates_before = runtime.create_calls();

        let victim = runtime.live_instance_ids().pop().unwrap();
        runtime.remove_instance(&victim);

        run_until_ready(&reconciler, &store, 2).await;
        // Exactly one replacement was requested.
        assert_eq!(runtime.create_calls(), creates_before + 1);
    }

    #[tokio::test]
    async fn test_scale_down_converges() {
        let (store, _runtime, reconciler) = setup(3).await;
        run_until_ready(&reconciler, &store, 3).await;

        store
            .update_json::<ReplicaSet, _>(&format!("{}rs-1", REPLICASETS_PREFIX), |rs| {
                rs.spec.replicas = 1;
                true
            })
            .await
            .unwrap();
        run_until_ready(&reconciler, &store, 1).await;

        let instances = store
            .list_prefix_json::<PodInstance>(INSTANCES_PREFIX)
            .await
            .unwrap();
        assert_eq!(instances.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_instance_is_replaced() {
        let (store, runtime, reconciler) = setup(2).await;
        run_until_ready(&reconciler, &store, 2).await;

        let victim = runtime.live_instance_ids().pop().unwrap();
        runtime.set_probe_failing(&victim, true);

        // failure_threshold is 1 in the test template: one bad probe fails
        // the instance, the next passes terminate and replace it.
        run_until_ready(&reconciler, &store, 2).await;
        let instances = store
            .list_prefix_json::<PodInstance>(INSTANCES_PREFIX)
            .await
            .unwrap();
        assert!(instances.iter().all(|(_, inst, _)| inst.id != victim));
    }

    #[tokio::test]
    async fn test_create_failures_back_off_and_retry() {
        let (store, runtime, reconciler) = setup(1).await;
        runtime.fail_next_creates(1);

        reconciler.reconcile().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runtime.create_calls(), 1);

        // Within the backoff window nothing new is issued.
        reconciler.reconcile().await.unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(runtime.create_calls(), 1);

        // After the first backoff delay the slot is retried and succeeds.
        tokio::time::sleep(Duration::from_millis(600)).await;
        run_until_ready(&reconciler, &store, 1).await;
        assert_eq!(runtime.create_calls(), 2);
    }
}
