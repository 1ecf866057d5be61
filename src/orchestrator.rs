//! Lifecycle orchestrator: the start and stop state machines.
//!
//! Steps execute in order; failures inside a step are recorded and the
//! machine moves on, so one wedged resource cannot strand the rest of the
//! app. The only cross-machine synchronization is the database lease taken
//! before a shared VM may be stopped.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use futures::future::join_all;
use serde::Serialize;
use tracing::{info, warn};

use crate::error::{OpsError, OpsResult};
use crate::lease::{AcquireOutcome, LeaseManager, ReleaseOutcome};
use crate::model::{
    ApplicationRecord, DbKind, DbRef, OperationLogEntry, OperationSource, app_key, oplog_key,
};
use crate::probes::{
    HttpProbe, InstanceProbe, InstanceState, NodePoolProbe, NodePoolStatus, WorkloadKind,
    WorkloadProbe, WorkloadView,
};
use crate::status::{HttpStatus, StatusAggregator};
use crate::store::{Store, get_typed, put_typed};

/* ============================= TUNING ============================= */

/// Poll cadence and deadlines for the waiting steps. Tests shrink these.
#[derive(Debug, Clone)]
pub struct PollTimings {
    pub db_poll_interval: Duration,
    pub db_poll_deadline: Duration,
    pub pool_poll_interval: Duration,
    pub pool_poll_deadline: Duration,
}

impl Default for PollTimings {
    fn default() -> Self {
        Self {
            db_poll_interval: Duration::from_secs(10),
            db_poll_deadline: Duration::from_secs(300),
            pool_poll_interval: Duration::from_secs(15),
            pool_poll_deadline: Duration::from_secs(600),
        }
    }
}

const OPLOG_RETENTION_SECS: i64 = 30 * 86_400;

/* ============================= RESULT TYPES ============================= */

#[derive(Debug, Clone, Serialize)]
pub struct DbStepResult {
    pub kind: DbKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub action: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkloadStepResult {
    pub kind: WorkloadKind,
    pub name: String,
    pub from: i32,
    pub to: i32,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStepResult {
    pub name: String,
    pub action: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct HttpStepResult {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    pub latency_ms: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct OperationSteps {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub databases: Vec<DbStepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_pool: Option<PoolStepResult>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub workloads: Vec<WorkloadStepResult>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http: Option<HttpStepResult>,
}

/// One planned mutation, reported by dry-run instead of being executed.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PlanAction {
    StartEc2 {
        instance_id: String,
        current_state: String,
        target_state: String,
    },
    StopEc2 {
        instance_id: String,
        current_state: String,
        target_state: String,
    },
    ScaleNodegroup {
        nodegroup: String,
        current_desired: i32,
        target_desired: i32,
        target_min: i32,
        target_max: i32,
    },
    ScaleDeployment {
        name: String,
        current: i32,
        target: i32,
    },
    ScaleStatefulset {
        name: String,
        current: i32,
        target: i32,
    },
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationSummary {
    pub app: String,
    pub action: String,
    pub dry_run: bool,
    pub success: bool,
    pub warnings: Vec<String>,
    pub steps: OperationSteps,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub actions: Option<Vec<PlanAction>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DbOpResult {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

/* ============================= ORCHESTRATOR ============================= */

pub struct Orchestrator {
    store: Arc<dyn Store>,
    instances: Arc<dyn InstanceProbe>,
    pools: Arc<dyn NodePoolProbe>,
    workloads: Arc<dyn WorkloadProbe>,
    http: Arc<dyn HttpProbe>,
    status: Arc<StatusAggregator>,
    lease: Arc<LeaseManager>,
    lease_ttl: Duration,
    quick_timeout: Duration,
    http_timeout: Duration,
    timings: PollTimings,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn Store>,
        instances: Arc<dyn InstanceProbe>,
        pools: Arc<dyn NodePoolProbe>,
        workloads: Arc<dyn WorkloadProbe>,
        http: Arc<dyn HttpProbe>,
        status: Arc<StatusAggregator>,
        lease: Arc<LeaseManager>,
        lease_ttl: Duration,
        quick_timeout: Duration,
        http_timeout: Duration,
    ) -> Self {
        Self {
            store,
            instances,
            pools,
            workloads,
            http,
            status,
            lease,
            lease_ttl,
            quick_timeout,
            http_timeout,
            timings: PollTimings::default(),
        }
    }

    pub fn with_timings(mut self, timings: PollTimings) -> Self {
        self.timings = timings;
        self
    }

    async fn load(&self, app_name: &str) -> OpsResult<ApplicationRecord> {
        get_typed(self.store.as_ref(), &app_key(app_name))
            .await?
            .ok_or_else(|| OpsError::not_found(format!("app {app_name}")))
    }

    /* ============================= START ============================= */

    pub async fn start_app(
        &self,
        app_name: &str,
        dry_run: bool,
        source: OperationSource,
        reason: Option<String>,
    ) -> OpsResult<OperationSummary> {
        let record = self.load(app_name).await?;
        let started_at = Utc::now().timestamp();

        info!(app = %app_name, dry_run, "start_machine_begin");

        if dry_run {
            let actions = self.plan_start(&record).await;
            return Ok(OperationSummary {
                app: app_name.to_string(),
                action: "start".to_string(),
                dry_run: true,
                success: true,
                warnings: Vec::new(),
                steps: OperationSteps::default(),
                actions: Some(actions),
            });
        }

        let mut warnings = Vec::new();
        let mut steps = OperationSteps::default();

        // ── DB-Start: all configured databases in parallel ──
        let db_futures = [DbKind::Postgres, DbKind::Neo4j]
            .into_iter()
            .filter_map(|kind| record.databases.get(kind).map(|db| (kind, db.clone())))
            .map(|(kind, db)| async move { self.start_db(kind, &db).await })
            .collect::<Vec<_>>();
        steps.databases = join_all(db_futures).await;
        for db in &steps.databases {
            if let Some(reason) = &db.reason {
                warnings.push(format!("{} {}", db.kind, reason));
            }
        }

        // ── NodePool-Scale: restore configured defaults, wait for capacity ──
        if let Some(pool) = &record.node_pool {
            let result = self.scale_pool_up(pool).await;
            if let Some(reason) = &result.reason {
                warnings.push(format!("node pool {}: {}", pool.name, reason));
            }
            steps.node_pool = Some(result);
        }

        // ── Workload-Scale: wake everything that is at zero ──
        steps.workloads = self.scale_workloads_up(&record, &mut warnings).await;

        // ── HTTP-Verify ──
        let outcome = self
            .http
            .head(record.primary_hostname(), self.http_timeout)
            .await;
        if outcome.code != Some(200) {
            warnings.push(format!(
                "http verify on {} returned {:?}",
                record.primary_hostname(),
                outcome.code
            ));
        }
        steps.http = Some(HttpStepResult { code: outcome.code, latency_ms: outcome.latency_ms });

        let success = steps_succeeded(&steps);
        self.append_oplog(app_name, "start", source, started_at, success, reason)
            .await;

        info!(app = %app_name, success, warnings = warnings.len(), "start_machine_done");

        Ok(OperationSummary {
            app: app_name.to_string(),
            action: "start".to_string(),
            dry_run: false,
            success,
            warnings,
            steps,
            actions: None,
        })
    }

    async fn plan_start(&self, record: &ApplicationRecord) -> Vec<PlanAction> {
        let mut actions = Vec::new();

        for kind in [DbKind::Postgres, DbKind::Neo4j] {
            let Some(db) = record.databases.get(kind) else { continue };
            let Some(id) = &db.instance_id else { continue };
            let state = self.describe_instance(id).await;
            if state != InstanceState::Running {
                actions.push(PlanAction::StartEc2 {
                    instance_id: id.clone(),
                    current_state: state.as_str().to_string(),
                    target_state: "running".to_string(),
                });
            }
        }

        if let Some(pool) = &record.node_pool {
            if let Ok(view) = self.pools.describe(&pool.name).await
                && view.desired != pool.default_desired
            {
                actions.push(PlanAction::ScaleNodegroup {
                    nodegroup: pool.name.clone(),
                    current_desired: view.desired,
                    target_desired: pool.default_desired,
                    target_min: pool.default_min,
                    target_max: pool.default_max,
                });
            }
        }

        for w in self.list_workloads(&record.namespace).await {
            if w.replicas == 0 {
                actions.push(match w.kind {
                    WorkloadKind::Deployment => {
                        PlanAction::ScaleDeployment { name: w.name, current: 0, target: 1 }
                    }
                    WorkloadKind::StatefulSet => {
                        PlanAction::ScaleStatefulset { name: w.name, current: 0, target: 1 }
                    }
                });
            }
        }

        actions
    }

    async fn start_db(&self, kind: DbKind, db: &DbRef) -> DbStepResult {
        let Some(id) = &db.instance_id else {
            return DbStepResult {
                kind,
                instance_id: None,
                action: "skip".to_string(),
                ok: true,
                reason: Some("no instance id, lifecycle not managed".to_string()),
            };
        };

        if self.describe_instance(id).await == InstanceState::Running {
            return DbStepResult {
                kind,
                instance_id: Some(id.clone()),
                action: "already_running".to_string(),
                ok: true,
                reason: None,
            };
        }

        if let Err(e) = self.instances.start(std::slice::from_ref(id)).await {
            return DbStepResult {
                kind,
                instance_id: Some(id.clone()),
                action: "start".to_string(),
                ok: false,
                reason: Some(format!("start failed: {e}")),
            };
        }
        info!(instance = %id, db = %kind, "db_start_issued");

        let reached = poll_until(
            self.timings.db_poll_interval,
            self.timings.db_poll_deadline,
            || async { self.describe_instance(id).await == InstanceState::Running },
        )
        .await;

        DbStepResult {
            kind,
            instance_id: Some(id.clone()),
            action: "start".to_string(),
            ok: true,
            reason: (!reached).then(|| {
                format!(
                    "{id} not running after {}s, continuing",
                    self.timings.db_poll_deadline.as_secs()
                )
            }),
        }
    }

    async fn scale_pool_up(&self, pool: &crate::model::NodePoolSpec) -> PoolStepResult {
        let current = match self.pools.describe(&pool.name).await {
            Ok(view) => view,
            Err(e) => {
                return PoolStepResult {
                    name: pool.name.clone(),
                    action: "describe".to_string(),
                    ok: false,
                    reason: Some(e.to_string()),
                };
            }
        };

        if current.status == NodePoolStatus::NotFound {
            return PoolStepResult {
                name: pool.name.clone(),
                action: "skip".to_string(),
                ok: false,
                reason: Some("nodegroup not found".to_string()),
            };
        }

        let mut action = "noop";
        if current.desired != pool.default_desired
            || current.min != pool.default_min
            || current.max != pool.default_max
        {
            if let Err(e) = self
                .pools
                .update_scaling(
                    &pool.name,
                    pool.default_desired,
                    pool.default_min,
                    pool.default_max,
                )
                .await
            {
                return PoolStepResult {
                    name: pool.name.clone(),
                    action: "scale_up".to_string(),
                    ok: false,
                    reason: Some(e.to_string()),
                };
            }
            action = "scale_up";
        }

        let target = pool.default_desired;
        let ready = poll_until(
            self.timings.pool_poll_interval,
            self.timings.pool_poll_deadline,
            || async {
                match self.pools.describe(&pool.name).await {
                    Ok(v) => v.status == NodePoolStatus::Active && v.current_nodes >= target,
                    Err(_) => false,
                }
            },
        )
        .await;

        PoolStepResult {
            name: pool.name.clone(),
            action: action.to_string(),
            ok: true,
            reason: (!ready).then(|| {
                format!(
                    "not at capacity after {}s, continuing",
                    self.timings.pool_poll_deadline.as_secs()
                )
            }),
        }
    }

    async fn scale_workloads_up(
        &self,
        record: &ApplicationRecord,
        warnings: &mut Vec<String>,
    ) -> Vec<WorkloadStepResult> {
        let asleep: Vec<WorkloadView> = self
            .list_workloads(&record.namespace)
            .await
            .into_iter()
            .filter(|w| w.replicas == 0)
            .collect();

        let ns = record.namespace.clone();
        let futures = asleep.into_iter().map(|w| {
            let ns = ns.clone();
            async move {
                // Historical replica counts are not persisted; waking to a
                // single replica and letting HPA take over is the contract.
                let target = 1;
                let result = match w.kind {
                    WorkloadKind::Deployment => {
                        self.workloads.scale_deployment(&ns, &w.name, target).await
                    }
                    WorkloadKind::StatefulSet => {
                        self.workloads.scale_stateful_set(&ns, &w.name, target).await
                    }
                };
                WorkloadStepResult {
                    kind: w.kind,
                    name: w.name,
                    from: 0,
                    to: target,
                    ok: result.is_ok(),
                    reason: result.err().map(|e| e.to_string()),
                }
            }
        });

        let results: Vec<WorkloadStepResult> = join_all(futures).await;
        for r in &results {
            if let Some(reason) = &r.reason {
                warnings.push(format!("{} {}: {}", r.kind, r.name, reason));
            }
        }
        results
    }

    /* ============================= STOP ============================= */

    pub async fn stop_app(
        &self,
        app_name: &str,
        source: OperationSource,
        reason: Option<String>,
    ) -> OpsResult<OperationSummary> {
        let record = self.load(app_name).await?;
        let started_at = Utc::now().timestamp();

        info!(app = %app_name, "stop_machine_begin");

        let mut warnings = Vec::new();
        let mut steps = OperationSteps::default();

        // ── Workload-Scale-Down: no waiting for pod termination ──
        let awake: Vec<WorkloadView> = self
            .list_workloads(&record.namespace)
            .await
            .into_iter()
            .filter(|w| w.replicas > 0)
            .collect();
        let ns = record.namespace.clone();
        let futures = awake.into_iter().map(|w| {
            let ns = ns.clone();
            async move {
                let result = match w.kind {
                    WorkloadKind::Deployment => {
                        self.workloads.scale_deployment(&ns, &w.name, 0).await
                    }
                    WorkloadKind::StatefulSet => {
                        self.workloads.scale_stateful_set(&ns, &w.name, 0).await
                    }
                };
                WorkloadStepResult {
                    kind: w.kind,
                    name: w.name,
                    from: w.replicas,
                    to: 0,
                    ok: result.is_ok(),
                    reason: result.err().map(|e| e.to_string()),
                }
            }
        });
        steps.workloads = join_all(futures).await;
        for r in &steps.workloads {
            if let Some(reason) = &r.reason {
                warnings.push(format!("{} {}: {}", r.kind, r.name, reason));
            }
        }

        // ── NodePool-Scale-Down: fire and move on ──
        if let Some(pool) = &record.node_pool {
            steps.node_pool = Some(self.scale_pool_down(pool).await);
            if let Some(reason) = steps.node_pool.as_ref().and_then(|p| p.reason.clone()) {
                warnings.push(format!("node pool {}: {}", pool.name, reason));
            }
        }

        // ── DB-Stop: independent per database, shared protocol applies ──
        for kind in [DbKind::Postgres, DbKind::Neo4j] {
            let Some(db) = record.databases.get(kind) else { continue };
            let result = self.stop_db_protected(&record, kind, db).await;
            if let Some(reason) = &result.reason {
                warnings.push(format!("{} {}", kind, reason));
            }
            steps.databases.push(result);
        }

        let success = steps_succeeded(&steps);
        self.append_oplog(app_name, "stop", source, started_at, success, reason)
            .await;

        info!(app = %app_name, success, warnings = warnings.len(), "stop_machine_done");

        Ok(OperationSummary {
            app: app_name.to_string(),
            action: "stop".to_string(),
            dry_run: false,
            success,
            warnings,
            steps,
            actions: None,
        })
    }

    async fn scale_pool_down(&self, pool: &crate::model::NodePoolSpec) -> PoolStepResult {
        let current = match self.pools.describe(&pool.name).await {
            Ok(view) => view,
            Err(e) => {
                return PoolStepResult {
                    name: pool.name.clone(),
                    action: "describe".to_string(),
                    ok: false,
                    reason: Some(e.to_string()),
                };
            }
        };

        if current.status == NodePoolStatus::NotFound || current.desired == 0 {
            return PoolStepResult {
                name: pool.name.clone(),
                action: "noop".to_string(),
                ok: true,
                reason: None,
            };
        }

        match self.pools.update_scaling(&pool.name, 0, 0, pool.default_max).await {
            Ok(()) => PoolStepResult {
                name: pool.name.clone(),
                action: "scale_down".to_string(),
                ok: true,
                reason: None,
            },
            Err(e) => PoolStepResult {
                name: pool.name.clone(),
                action: "scale_down".to_string(),
                ok: false,
                reason: Some(e.to_string()),
            },
        }
    }

    /// The shared-resource protocol of the stop machine.
    ///
    /// A shared database is stopped only while holding its lease and only
    /// after every co-tenant answered DOWN. The lease is released on every
    /// path out of this function.
    async fn stop_db_protected(
        &self,
        record: &ApplicationRecord,
        kind: DbKind,
        db: &DbRef,
    ) -> DbStepResult {
        let Some(id) = &db.instance_id else {
            return DbStepResult {
                kind,
                instance_id: None,
                action: "skip".to_string(),
                ok: true,
                reason: Some("no instance id, refusing lifecycle action".to_string()),
            };
        };

        if self.describe_instance(id).await == InstanceState::Stopped {
            return DbStepResult {
                kind,
                instance_id: Some(id.clone()),
                action: "already_stopped".to_string(),
                ok: true,
                reason: None,
            };
        }

        let shared = record.shared_resources.db_entry(kind, id).cloned();

        let Some(shared) = shared else {
            // Unshared: stop directly
            return match self.instances.stop(std::slice::from_ref(id)).await {
                Ok(()) => {
                    info!(instance = %id, db = %kind, "db_stop_issued");
                    DbStepResult {
                        kind,
                        instance_id: Some(id.clone()),
                        action: "stop".to_string(),
                        ok: true,
                        reason: None,
                    }
                }
                Err(e) => DbStepResult {
                    kind,
                    instance_id: Some(id.clone()),
                    action: "stop".to_string(),
                    ok: false,
                    reason: Some(format!("stop failed: {e}")),
                },
            };
        };

        let owner_id = LeaseManager::generate_owner_id();
        let acquired = match self.lease.acquire(id, &owner_id, self.lease_ttl).await {
            Ok(outcome) => outcome,
            Err(e) => {
                return DbStepResult {
                    kind,
                    instance_id: Some(id.clone()),
                    action: "skip".to_string(),
                    ok: false,
                    reason: Some(format!("lease error: {e}")),
                };
            }
        };

        let AcquireOutcome::Acquired { lease_key, .. } = acquired else {
            return DbStepResult {
                kind,
                instance_id: Some(id.clone()),
                action: "skip".to_string(),
                ok: true,
                reason: Some(format!("{id} lock contention, not stopping")),
            };
        };

        // From here on every exit must release the lease
        let result = self.decide_and_stop(record, kind, id, &shared.linked_apps).await;

        match self.lease.release(&lease_key, &owner_id).await {
            Ok(ReleaseOutcome::Released) => {}
            Ok(other) => warn!(key = %lease_key, outcome = ?other, "lease_release_unexpected"),
            Err(e) => warn!(key = %lease_key, error = %e, "lease_release_failed"),
        }

        result
    }

    /// With the lease held: verify every co-tenant is DOWN, then stop.
    async fn decide_and_stop(
        &self,
        record: &ApplicationRecord,
        kind: DbKind,
        id: &str,
        linked_apps: &[String],
    ) -> DbStepResult {
        let co_tenants: Vec<&String> = linked_apps
            .iter()
            .filter(|a| a.as_str() != record.app_name)
            .collect();

        let checks = co_tenants.iter().map(|app| async move {
            match self.status.quick_status(app).await {
                Ok(quick) => (app.to_string(), quick.status),
                // A co-tenant we cannot even look up is treated as alive
                Err(_) => (app.to_string(), HttpStatus::Unknown),
            }
        });
        let results = join_all(checks).await;

        let ups: Vec<String> = results
            .iter()
            .filter(|(_, s)| *s == HttpStatus::Up)
            .map(|(a, _)| a.clone())
            .collect();
        let unknowns: Vec<String> = results
            .iter()
            .filter(|(_, s)| *s == HttpStatus::Unknown)
            .map(|(a, _)| a.clone())
            .collect();

        if !ups.is_empty() {
            return DbStepResult {
                kind,
                instance_id: Some(id.to_string()),
                action: "skip".to_string(),
                ok: true,
                reason: Some(format!("{id} shared with active apps: {ups:?}")),
            };
        }
        if !unknowns.is_empty() {
            return DbStepResult {
                kind,
                instance_id: Some(id.to_string()),
                action: "skip".to_string(),
                ok: true,
                reason: Some(format!("{id} status unknown for {unknowns:?}, not stopping")),
            };
        }

        match self.instances.stop(&[id.to_string()]).await {
            Ok(()) => {
                info!(instance = %id, db = %kind, "shared_db_stop_issued");
                DbStepResult {
                    kind,
                    instance_id: Some(id.to_string()),
                    action: "stop".to_string(),
                    ok: true,
                    reason: None,
                }
            }
            Err(e) => DbStepResult {
                kind,
                instance_id: Some(id.to_string()),
                action: "stop".to_string(),
                ok: false,
                reason: Some(format!("stop failed: {e}")),
            },
        }
    }

    /* ============================= DB-ONLY OPS ============================= */

    /// Start one database VM. Starting is always safe; no lease is taken.
    pub async fn db_start(&self, app_name: &str, kind: DbKind) -> OpsResult<DbOpResult> {
        let record = self.load(app_name).await?;
        let Some(db) = record.databases.get(kind) else {
            return Ok(DbOpResult {
                success: false,
                reason: Some(format!("no {kind} configured for {app_name}")),
            });
        };

        let result = self.start_db(kind, db).await;
        Ok(DbOpResult { success: result.ok, reason: result.reason })
    }

    /// Stop one database VM under the shared-resource protocol.
    pub async fn db_stop(&self, app_name: &str, kind: DbKind) -> OpsResult<DbOpResult> {
        let record = self.load(app_name).await?;
        let Some(db) = record.databases.get(kind) else {
            return Ok(DbOpResult {
                success: false,
                reason: Some(format!("no {kind} configured for {app_name}")),
            });
        };

        let result = self.stop_db_protected(&record, kind, db).await;
        let stopped = result.action == "stop" && result.ok;
        Ok(DbOpResult {
            success: stopped || result.action == "already_stopped",
            reason: result.reason,
        })
    }

    /* ============================= SHARED HELPERS ============================= */

    async fn describe_instance(&self, id: &str) -> InstanceState {
        match self.instances.describe(&[id.to_string()]).await {
            Ok(views) => views
                .iter()
                .find(|v| v.id == id)
                .map(|v| v.state)
                .unwrap_or(InstanceState::Unknown),
            Err(e) => {
                warn!(instance = %id, error = %e, "instance_describe_failed");
                InstanceState::Unknown
            }
        }
    }

    async fn list_workloads(&self, namespace: &str) -> Vec<WorkloadView> {
        let (deployments, statefulsets) = tokio::join!(
            self.workloads.list_deployments(namespace),
            self.workloads.list_stateful_sets(namespace),
        );

        let mut all = Vec::new();
        match deployments {
            Ok(list) => all.extend(list),
            Err(e) => warn!(namespace = %namespace, error = %e, "deployment_list_failed"),
        }
        match statefulsets {
            Ok(list) => all.extend(list),
            Err(e) => warn!(namespace = %namespace, error = %e, "statefulset_list_failed"),
        }
        all
    }

    async fn append_oplog(
        &self,
        app: &str,
        action: &str,
        source: OperationSource,
        started_at: i64,
        success: bool,
        reason: Option<String>,
    ) {
        let now = Utc::now();
        let entry = OperationLogEntry {
            app: app.to_string(),
            action: action.to_string(),
            source,
            started_at,
            finished_at: now.timestamp(),
            result: if success { "success".to_string() } else { "partial".to_string() },
            reason,
            expires_at: now.timestamp() + OPLOG_RETENTION_SECS,
        };

        let key = oplog_key(app, now.timestamp_millis());
        if let Err(e) = put_typed(self.store.as_ref(), &key, &entry, None).await {
            warn!(app = %app, error = %e, "oplog_append_failed");
        }
    }
}

/// True iff no step reported a hard failure. Timeouts and skips carry
/// `ok: true` with a reason, so they stay warnings.
fn steps_succeeded(steps: &OperationSteps) -> bool {
    steps.databases.iter().all(|d| d.ok)
        && steps.node_pool.as_ref().is_none_or(|p| p.ok)
        && steps.workloads.iter().all(|w| w.ok)
}

/// Bounded poll: check immediately, then every `interval` until the
/// condition holds or `deadline` elapses.
async fn poll_until<F, Fut>(interval: Duration, deadline: Duration, mut check: F) -> bool
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    let started = tokio::time::Instant::now();
    loop {
        if check().await {
            return true;
        }
        if started.elapsed() + interval > deadline {
            return false;
        }
        tokio::time::sleep(interval).await;
    }
}

/* ============================= TESTS ============================= */
