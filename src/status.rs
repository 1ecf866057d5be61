//! Live status aggregation.
//!
//! Every call probes the external systems again; nothing is cached between
//! requests. The four probes of a composite view run concurrently under one
//! deadline, and a probe that misses the deadline degrades its own section
//! to `unknown` instead of failing the call.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::config::ProbeSettings;
use crate::error::{OpsError, OpsResult};
use crate::model::{ApplicationRecord, DbKind, DbRef, app_key};
use crate::probes::{
    HeadOutcome, HttpProbe, InstanceProbe, InstanceState, NodePoolProbe, NodePoolStatus,
    PodProbe, PodView,
};
use crate::store::{Store, get_typed};

/* ============================= VIEW TYPES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum HttpStatus {
    Up,
    Down,
    Unknown,
}

impl HttpStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "UP",
            Self::Down => "DOWN",
            Self::Unknown => "UNKNOWN",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HttpView {
    pub status: HttpStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    pub latency_ms: u64,
}

/// DB VM state as reported to clients; `pending` reads as `starting`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DbState {
    Running,
    Stopped,
    Starting,
    Stopping,
    Unknown,
}

impl From<InstanceState> for DbState {
    fn from(state: InstanceState) -> Self {
        match state {
            InstanceState::Running => Self::Running,
            InstanceState::Stopped => Self::Stopped,
            InstanceState::Pending => Self::Starting,
            InstanceState::Stopping => Self::Stopping,
            InstanceState::Unknown => Self::Unknown,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DbView {
    pub state: DbState,
    pub host: String,
    pub port: u16,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,
    pub is_shared: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_with: Vec<String>,
}

/// UI hint derived from the raw pool status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PoolPhase {
    Ready,
    Scaling,
    Stopped,
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroupStatusView {
    pub name: String,
    pub status: NodePoolStatus,
    pub phase: PoolPhase,
    pub desired: i32,
    pub min: i32,
    pub max: i32,
    pub current: i32,
    pub is_shared: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub shared_with: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodBuckets {
    pub running: u32,
    pub pending: u32,
    pub crashloop: u32,
    pub total: u32,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub running_list: Vec<PodView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub pending_list: Vec<PodView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub crashloop_list: Vec<PodView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ComposedView {
    pub name: String,
    pub hostnames: Vec<String>,
    pub namespace: String,
    pub http: HttpView,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub postgres: Option<DbView>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub neo4j: Option<DbView>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub nodegroups: Vec<NodeGroupStatusView>,
    pub pods: PodBuckets,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct QuickStatus {
    pub app: String,
    pub status: HttpStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    pub timestamp: String,
}

/* ============================= RULES ============================= */

/// The composite rule: 200 is UP, anything else that answered is DOWN,
/// transport failure is DOWN. Component states never change this.
pub fn http_view(outcome: &HeadOutcome) -> HttpView {
    let status = match outcome.code {
        Some(200) => HttpStatus::Up,
        Some(_) | None => HttpStatus::Down,
    };
    HttpView { status, code: outcome.code, latency_ms: outcome.latency_ms }
}

/// Quick-status is the stop protocol's liveness anchor and fails safe: a
/// timed-out probe is UNKNOWN (treated as alive), not DOWN.
pub fn quick_view(outcome: &HeadOutcome) -> (HttpStatus, Option<u16>) {
    match outcome.code {
        Some(200) => (HttpStatus::Up, outcome.code),
        Some(_) => (HttpStatus::Down, outcome.code),
        None if outcome.timed_out => (HttpStatus::Unknown, None),
        None => (HttpStatus::Down, None),
    }
}

pub fn pool_phase(status: NodePoolStatus, current_nodes: i32) -> PoolPhase {
    match status {
        NodePoolStatus::Active if current_nodes > 0 => PoolPhase::Ready,
        NodePoolStatus::Active | NodePoolStatus::Updating | NodePoolStatus::Creating => {
            PoolPhase::Scaling
        }
        NodePoolStatus::Degraded | NodePoolStatus::Deleting | NodePoolStatus::NotFound => {
            PoolPhase::Stopped
        }
    }
}

pub fn bucket_pods(pods: &[PodView]) -> PodBuckets {
    let mut buckets = PodBuckets { total: pods.len() as u32, ..Default::default() };

    for pod in pods {
        let crashlooping = pod.reason.as_deref() == Some("CrashLoopBackOff");
        if crashlooping {
            buckets.crashloop += 1;
            buckets.crashloop_list.push(pod.clone());
        } else if pod.phase == "Pending" {
            buckets.pending += 1;
            buckets.pending_list.push(pod.clone());
        } else if pod.phase == "Running" {
            buckets.running += 1;
            buckets.running_list.push(pod.clone());
        }
    }

    buckets
}

/* ============================= AGGREGATOR ============================= */

pub struct StatusAggregator {
    store: Arc<dyn Store>,
    instances: Arc<dyn InstanceProbe>,
    pools: Arc<dyn NodePoolProbe>,
    pods: Arc<dyn PodProbe>,
    http: Arc<dyn HttpProbe>,
    probe: ProbeSettings,
}

impl StatusAggregator {
    pub fn new(
        store: Arc<dyn Store>,
        instances: Arc<dyn InstanceProbe>,
        pools: Arc<dyn NodePoolProbe>,
        pods: Arc<dyn PodProbe>,
        http: Arc<dyn HttpProbe>,
        probe: ProbeSettings,
    ) -> Self {
        Self { store, instances, pools, pods, http, probe }
    }

    /// Compose the live view for a registered app.
    pub async fn compose(&self, app_name: &str) -> OpsResult<ComposedView> {
        let record: ApplicationRecord = get_typed(self.store.as_ref(), &app_key(app_name))
            .await?
            .ok_or_else(|| OpsError::not_found(format!("app {app_name}")))?;
        Ok(self.compose_record(&record).await)
    }

    /// Compose from an already-loaded record. Probe failures degrade their
    /// own section; this never fails as a whole.
    pub async fn compose_record(&self, record: &ApplicationRecord) -> ComposedView {
        let deadline = Duration::from_secs(self.probe.aggregator_timeout);
        let http_timeout = Duration::from_secs(self.probe.http_timeout);
        let host = record.primary_hostname().to_string();

        let db_ids: Vec<String> = [&record.databases.postgres, &record.databases.neo4j]
            .into_iter()
            .flatten()
            .filter_map(|db| db.instance_id.clone())
            .collect();

        let http_fut = tokio::time::timeout(deadline, self.http.head(&host, http_timeout));
        let instances_fut = tokio::time::timeout(deadline, async {
            if db_ids.is_empty() { Ok(Vec::new()) } else { self.instances.describe(&db_ids).await }
        });
        let pool_fut = tokio::time::timeout(deadline, async {
            match &record.node_pool {
                Some(pool) => Some(self.pools.describe(&pool.name).await),
                None => None,
            }
        });
        let pods_fut = tokio::time::timeout(deadline, self.pods.list_pods(&record.namespace));

        let (http_res, instances_res, pool_res, pods_res) =
            tokio::join!(http_fut, instances_fut, pool_fut, pods_fut);

        // HTTP section — a deadline miss at the aggregator level is UNKNOWN
        let http = match http_res {
            Ok(outcome) => http_view(&outcome),
            Err(_) => HttpView {
                status: HttpStatus::Unknown,
                code: None,
                latency_ms: deadline.as_millis() as u64,
            },
        };

        // DB sections
        let instance_states: Vec<(String, InstanceState)> = match instances_res {
            Ok(Ok(views)) => views.into_iter().map(|v| (v.id, v.state)).collect(),
            Ok(Err(e)) => {
                warn!(app = %record.app_name, error = %e, "db_describe_failed");
                Vec::new()
            }
            Err(_) => Vec::new(),
        };
        let postgres = record
            .databases
            .postgres
            .as_ref()
            .map(|db| self.db_view(record, DbKind::Postgres, db, &instance_states));
        let neo4j = record
            .databases
            .neo4j
            .as_ref()
            .map(|db| self.db_view(record, DbKind::Neo4j, db, &instance_states));

        // Node pool section
        let nodegroups = match pool_res {
            Ok(Some(Ok(view))) => {
                let shared = record
                    .shared_resources
                    .node_pool
                    .iter()
                    .find(|s| s.identifier == view.name);
                vec![NodeGroupStatusView {
                    phase: pool_phase(view.status, view.current_nodes),
                    name: view.name,
                    status: view.status,
                    desired: view.desired,
                    min: view.min,
                    max: view.max,
                    current: view.current_nodes,
                    is_shared: shared.is_some(),
                    shared_with: shared
                        .map(|s| linked_others(&s.linked_apps, &record.app_name))
                        .unwrap_or_default(),
                }]
            }
            Ok(Some(Err(e))) => {
                warn!(app = %record.app_name, error = %e, "nodepool_describe_failed");
                Vec::new()
            }
            Ok(None) | Err(_) => Vec::new(),
        };

        // Pod section — permission denied degrades to zero counts
        let pods = match pods_res {
            Ok(Ok(views)) => bucket_pods(&views),
            Ok(Err(e)) if e.is_permission_denied() => PodBuckets {
                warning: Some(format!("pod listing denied in {}: {e}", record.namespace)),
                ..Default::default()
            },
            Ok(Err(e)) => {
                warn!(app = %record.app_name, error = %e, "pod_list_failed");
                PodBuckets {
                    warning: Some(format!("pod listing failed: {e}")),
                    ..Default::default()
                }
            }
            Err(_) => PodBuckets {
                warning: Some("pod listing timed out".to_string()),
                ..Default::default()
            },
        };

        ComposedView {
            name: record.app_name.clone(),
            hostnames: record.hostnames.clone(),
            namespace: record.namespace.clone(),
            http,
            postgres,
            neo4j,
            nodegroups,
            pods,
        }
    }

    fn db_view(
        &self,
        record: &ApplicationRecord,
        kind: DbKind,
        db: &DbRef,
        states: &[(String, InstanceState)],
    ) -> DbView {
        let state = match &db.instance_id {
            Some(id) => states
                .iter()
                .find(|(sid, _)| sid == id)
                .map(|(_, s)| DbState::from(*s))
                .unwrap_or(DbState::Unknown),
            None => DbState::Unknown,
        };

        let shared = db
            .instance_id
            .as_deref()
            .and_then(|id| record.shared_resources.db_entry(kind, id));

        DbView {
            state,
            host: db.host.clone(),
            port: db.port,
            instance_id: db.instance_id.clone(),
            is_shared: shared.is_some(),
            shared_with: shared
                .map(|s| linked_others(&s.linked_apps, &record.app_name))
                .unwrap_or_default(),
        }
    }

    /// Minimal HEAD-only status used by the stop protocol and the scheduler.
    pub async fn quick_status(&self, app_name: &str) -> OpsResult<QuickStatus> {
        let record: ApplicationRecord = get_typed(self.store.as_ref(), &app_key(app_name))
            .await?
            .ok_or_else(|| OpsError::not_found(format!("app {app_name}")))?;
        Ok(self
            .quick_status_for_host(app_name, record.primary_hostname())
            .await)
    }

    pub async fn quick_status_for_host(&self, app_name: &str, host: &str) -> QuickStatus {
        let timeout = Duration::from_secs(self.probe.quick_timeout);
        let outcome = self.http.head(host, timeout).await;
        let (status, code) = quick_view(&outcome);
        QuickStatus {
            app: app_name.to_string(),
            status,
            code,
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

fn linked_others(linked: &[String], own: &str) -> Vec<String> {
    linked.iter().filter(|a| a.as_str() != own).cloned().collect()
}

/* ============================= TESTS ============================= */

#[cfg(test)]
mod tests {
    use super::*;

    fn head(code: Option<u16>, timed_out: bool) -> HeadOutcome {
        HeadOutcome { code, latency_ms: 12, error: None, timed_out }
    }

    #[test]
    fn test_http_rule_200_is_up() {
        assert_eq!(http_view(&head(Some(200), false)).status, HttpStatus::Up);
    }

    #[test]
    fn test_http_rule_non_200_is_down() {
        assert_eq!(http_view(&head(Some(503), false)).status, HttpStatus::Down);
        assert_eq!(http_view(&head(Some(301), false)).status, HttpStatus::Down);
    }

    #[test]
    fn test_http_rule_transport_failure_is_down() {
        assert_eq!(http_view(&head(None, false)).status, HttpStatus::Down);
        // Even a timeout is DOWN on the composite path
        assert_eq!(http_view(&head(None, true)).status, HttpStatus::Down);
    }

    #[test]
    fn test_quick_rule_timeout_is_unknown() {
        assert_eq!(quick_view(&head(None, true)).0, HttpStatus::Unknown);
        assert_eq!(quick_view(&head(None, false)).0, HttpStatus::Down);
        assert_eq!(quick_view(&head(Some(200), false)).0, HttpStatus::Up);
        assert_eq!(quick_view(&head(Some(503), false)).0, HttpStatus::Down);
    }

    #[test]
    fn test_pool_phase_derivation() {
        assert_eq!(pool_phase(NodePoolStatus::Active, 2), PoolPhase::Ready);
        assert_eq!(pool_phase(NodePoolStatus::Active, 0), PoolPhase::Scaling);
        assert_eq!(pool_phase(NodePoolStatus::Updating, 1), PoolPhase::Scaling);
        assert_eq!(pool_phase(NodePoolStatus::Creating, 0), PoolPhase::Scaling);
        assert_eq!(pool_phase(NodePoolStatus::Deleting, 1), PoolPhase::Stopped);
        assert_eq!(pool_phase(NodePoolStatus::Degraded, 0), PoolPhase::Stopped);
        assert_eq!(pool_phase(NodePoolStatus::NotFound, 0), PoolPhase::Stopped);
    }

    fn pod(name: &str, phase: &str, reason: Option<&str>) -> PodView {
        PodView {
            name: name.to_string(),
            phase: phase.to_string(),
            reason: reason.map(str::to_string),
            owner: None,
            restart_count: 0,
            created_at: None,
            ready: phase == "Running",
        }
    }

    #[test]
    fn test_bucket_pods_counts_and_lists() {
        let pods = vec![
            pod("a", "Running", None),
            pod("b", "Running", Some("CrashLoopBackOff")),
            pod("c", "Pending", None),
            pod("d", "Succeeded", None),
        ];
        let buckets = bucket_pods(&pods);
        assert_eq!(buckets.total, 4);
        assert_eq!(buckets.running, 1);
        assert_eq!(buckets.pending, 1);
        assert_eq!(buckets.crashloop, 1);
        assert_eq!(buckets.running_list[0].name, "a");
        assert_eq!(buckets.crashloop_list[0].name, "b");
        assert_eq!(buckets.pending_list[0].name, "c");
    }

    #[test]
    fn test_bucket_pods_empty() {
        let buckets = bucket_pods(&[]);
        assert_eq!(buckets.total, 0);
        assert!(buckets.warning.is_none());
    }

    #[test]
    fn test_db_state_from_instance_state() {
        assert_eq!(DbState::from(InstanceState::Pending), DbState::Starting);
        assert_eq!(DbState::from(InstanceState::Running), DbState::Running);
        assert_eq!(DbState::from(InstanceState::Unknown), DbState::Unknown);
    }

    #[test]
    fn test_http_status_serializes_uppercase() {
        assert_eq!(serde_json::to_string(&HttpStatus::Up).unwrap(), "\"UP\"");
        assert_eq!(serde_json::to_string(&HttpStatus::Unknown).unwrap(), "\"UNKNOWN\"");
    }
}
