#![allow(dead_code)]

//! Shared test doubles: call-recording probe clients over in-memory state,
//! plus builders for registry records. Everything is constructor-injected
//! exactly like the production clients.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;

use kube_lifecycle::config::{ProbeSettings, TagSettings};
use kube_lifecycle::error::{OpsError, OpsResult};
use kube_lifecycle::lease::LeaseManager;
use kube_lifecycle::model::{
    ApplicationRecord, Databases, DbRef, NodePoolSpec, SharedResource, app_key,
};
use kube_lifecycle::orchestrator::{Orchestrator, PollTimings};
use kube_lifecycle::probes::{
    ClusterTopologyProbe, HeadOutcome, HttpProbe, IngressView, InstanceProbe, InstanceState,
    InstanceView, NodePoolProbe, NodePoolStatus, NodePoolView, PodProbe, PodView, TaggedInstance,
    WorkloadKind, WorkloadProbe, WorkloadView,
};
use kube_lifecycle::status::StatusAggregator;
use kube_lifecycle::store::{MemoryStore, put_typed};

/* ============================= INSTANCES ============================= */

#[derive(Default)]
pub struct FakeInstances {
    pub states: Mutex<HashMap<String, InstanceState>>,
    pub tagged: Mutex<Vec<TaggedInstance>>,
    /// Shared journal: every fake appends here so tests can assert ordering
    /// across clients.
    pub calls: Arc<Mutex<Vec<String>>>,
    pub fail_stop: Mutex<bool>,
}

impl FakeInstances {
    pub async fn set_state(&self, id: &str, state: InstanceState) {
        self.states.lock().await.insert(id.to_string(), state);
    }

    pub async fn calls_matching(&self, prefix: &str) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.starts_with(prefix))
            .cloned()
            .collect()
    }

    pub async fn stop_count(&self, id: &str) -> usize {
        self.calls_matching(&format!("stop:{id}")).await.len()
    }

    pub async fn start_count(&self, id: &str) -> usize {
        self.calls_matching(&format!("start:{id}")).await.len()
    }
}

#[async_trait]
impl InstanceProbe for FakeInstances {
    async fn describe(&self, ids: &[String]) -> OpsResult<Vec<InstanceView>> {
        let states = self.states.lock().await;
        let mut calls = self.calls.lock().await;
        let mut views = Vec::new();
        for id in ids {
            calls.push(format!("describe:{id}"));
            views.push(InstanceView {
                id: id.clone(),
                state: states.get(id).copied().unwrap_or(InstanceState::Unknown),
                private_ip: None,
            });
        }
        Ok(views)
    }

    async fn start(&self, ids: &[String]) -> OpsResult<()> {
        let mut states = self.states.lock().await;
        let mut calls = self.calls.lock().await;
        for id in ids {
            calls.push(format!("start:{id}"));
            states.insert(id.clone(), InstanceState::Running);
        }
        Ok(())
    }

    async fn stop(&self, ids: &[String]) -> OpsResult<()> {
        if *self.fail_stop.lock().await {
            return Err(OpsError::Transient("api error: stop rejected".to_string()));
        }
        let mut states = self.states.lock().await;
        let mut calls = self.calls.lock().await;
        for id in ids {
            calls.push(format!("stop:{id}"));
            states.insert(id.clone(), InstanceState::Stopped);
        }
        Ok(())
    }

    async fn find_tagged(&self, _tags: &TagSettings) -> OpsResult<Vec<TaggedInstance>> {
        self.calls.lock().await.push("find_tagged".to_string());
        Ok(self.tagged.lock().await.clone())
    }
}

/* ============================= NODE POOLS ============================= */

#[derive(Default)]
pub struct FakeNodePools {
    pub pools: Mutex<HashMap<String, NodePoolView>>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl FakeNodePools {
    pub async fn set_pool(&self, name: &str, desired: i32, min: i32, max: i32, nodes: i32) {
        self.pools.lock().await.insert(
            name.to_string(),
            NodePoolView {
                name: name.to_string(),
                status: NodePoolStatus::Active,
                desired,
                min,
                max,
                current_nodes: nodes,
            },
        );
    }

    pub async fn update_count(&self, name: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.starts_with(&format!("update:{name}")))
            .count()
    }
}

#[async_trait]
impl NodePoolProbe for FakeNodePools {
    async fn describe(&self, pool: &str) -> OpsResult<NodePoolView> {
        self.calls.lock().await.push(format!("describe:{pool}"));
        Ok(self
            .pools
            .lock()
            .await
            .get(pool)
            .cloned()
            .unwrap_or(NodePoolView {
                name: pool.to_string(),
                status: NodePoolStatus::NotFound,
                desired: 0,
                min: 0,
                max: 0,
                current_nodes: 0,
            }))
    }

    async fn update_scaling(&self, pool: &str, desired: i32, min: i32, max: i32) -> OpsResult<()> {
        self.calls
            .lock()
            .await
            .push(format!("update:{pool}:{desired}:{min}:{max}"));
        let mut pools = self.pools.lock().await;
        let view = pools.entry(pool.to_string()).or_insert(NodePoolView {
            name: pool.to_string(),
            status: NodePoolStatus::Active,
            desired: 0,
            min: 0,
            max: 0,
            current_nodes: 0,
        });
        view.desired = desired;
        view.min = min;
        view.max = max;
        // Converges instantly: the fake cluster always delivers capacity
        view.current_nodes = desired;
        view.status = NodePoolStatus::Active;
        Ok(())
    }
}

/* ============================= WORKLOADS ============================= */

#[derive(Default)]
pub struct FakeWorkloads {
    pub by_namespace: Mutex<HashMap<String, Vec<WorkloadView>>>,
    pub calls: Arc<Mutex<Vec<String>>>,
}

impl FakeWorkloads {
    pub async fn add(&self, ns: &str, kind: WorkloadKind, name: &str, replicas: i32) {
        self.by_namespace
            .lock()
            .await
            .entry(ns.to_string())
            .or_default()
            .push(WorkloadView { kind, name: name.to_string(), replicas });
    }

    pub async fn replicas(&self, ns: &str, name: &str) -> Option<i32> {
        self.by_namespace
            .lock()
            .await
            .get(ns)?
            .iter()
            .find(|w| w.name == name)
            .map(|w| w.replicas)
    }

    pub async fn scale_calls(&self) -> Vec<String> {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|c| c.starts_with("scale:"))
            .cloned()
            .collect()
    }

    async fn scale(&self, ns: &str, name: &str, replicas: i32) -> OpsResult<()> {
        self.calls
            .lock()
            .await
            .push(format!("scale:{ns}:{name}:{replicas}"));
        let mut map = self.by_namespace.lock().await;
        if let Some(w) = map
            .get_mut(ns)
            .and_then(|list| list.iter_mut().find(|w| w.name == name))
        {
            w.replicas = replicas;
        }
        Ok(())
    }
}

#[async_trait]
impl WorkloadProbe for FakeWorkloads {
    async fn list_deployments(&self, namespace: &str) -> OpsResult<Vec<WorkloadView>> {
        Ok(self
            .by_namespace
            .lock()
            .await
            .get(namespace)
            .map(|list| {
                list.iter()
                    .filter(|w| w.kind == WorkloadKind::Deployment)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn list_stateful_sets(&self, namespace: &str) -> OpsResult<Vec<WorkloadView>> {
        Ok(self
            .by_namespace
            .lock()
            .await
            .get(namespace)
            .map(|list| {
                list.iter()
                    .filter(|w| w.kind == WorkloadKind::StatefulSet)
                    .cloned()
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> OpsResult<()> {
        self.scale(namespace, name, replicas).await
    }

    async fn scale_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> OpsResult<()> {
        self.scale(namespace, name, replicas).await
    }
}

/* ============================= PODS ============================= */

#[derive(Default)]
pub struct FakePods {
    pub by_namespace: Mutex<HashMap<String, Vec<PodView>>>,
    pub deny_namespaces: Mutex<Vec<String>>,
}

impl FakePods {
    pub async fn add(&self, ns: &str, pod: PodView) {
        self.by_namespace
            .lock()
            .await
            .entry(ns.to_string())
            .or_default()
            .push(pod);
    }

    pub async fn deny(&self, ns: &str) {
        self.deny_namespaces.lock().await.push(ns.to_string());
    }
}

pub fn pod_view(name: &str, phase: &str, reason: Option<&str>) -> PodView {
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

#[async_trait]
impl PodProbe for FakePods {
    async fn list_pods(&self, namespace: &str) -> OpsResult<Vec<PodView>> {
        if self
            .deny_namespaces
            .lock()
            .await
            .iter()
            .any(|ns| ns == namespace)
        {
            return Err(OpsError::PermissionDenied(format!(
                "pods is forbidden in {namespace}"
            )));
        }
        Ok(self
            .by_namespace
            .lock()
            .await
            .get(namespace)
            .cloned()
            .unwrap_or_default())
    }
}

/* ============================= HTTP ============================= */

#[derive(Default)]
pub struct FakeHttp {
    pub outcomes: Mutex<HashMap<String, HeadOutcome>>,
    pub hits: Mutex<HashMap<String, usize>>,
    /// Artificial latency applied to every probe.
    pub delay: Mutex<Option<Duration>>,
}

impl FakeHttp {
    pub async fn respond(&self, host: &str, code: u16) {
        self.outcomes.lock().await.insert(
            host.to_string(),
            HeadOutcome { code: Some(code), latency_ms: 7, error: None, timed_out: false },
        );
    }

    pub async fn time_out(&self, host: &str) {
        self.outcomes.lock().await.insert(
            host.to_string(),
            HeadOutcome {
                code: None,
                latency_ms: 3000,
                error: Some("timeout after 3000ms".to_string()),
                timed_out: true,
            },
        );
    }

    pub async fn refuse(&self, host: &str) {
        self.outcomes.lock().await.insert(
            host.to_string(),
            HeadOutcome {
                code: None,
                latency_ms: 2,
                error: Some("connection refused".to_string()),
                timed_out: false,
            },
        );
    }

    pub async fn hit_count(&self, host: &str) -> usize {
        self.hits.lock().await.get(host).copied().unwrap_or(0)
    }

    pub async fn set_delay(&self, delay: Duration) {
        *self.delay.lock().await = Some(delay);
    }
}

#[async_trait]
impl HttpProbe for FakeHttp {
    async fn head(&self, host: &str, _timeout: Duration) -> HeadOutcome {
        let delay = *self.delay.lock().await;
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        *self.hits.lock().await.entry(host.to_string()).or_insert(0) += 1;
        self.outcomes
            .lock()
            .await
            .get(host)
            .cloned()
            .unwrap_or(HeadOutcome {
                code: None,
                latency_ms: 1,
                error: Some("connection refused".to_string()),
                timed_out: false,
            })
    }
}

/* ============================= TOPOLOGY ============================= */

#[derive(Default)]
pub struct FakeTopology {
    pub ingresses: Mutex<Vec<IngressView>>,
    pub config_maps: Mutex<HashMap<(String, String), std::collections::BTreeMap<String, String>>>,
}

impl FakeTopology {
    pub async fn add_ingress(&self, ns: &str, hosts: &[&str]) {
        self.ingresses.lock().await.push(IngressView {
            name: format!("{}-ing", hosts.first().unwrap_or(&"x")),
            namespace: ns.to_string(),
            hosts: hosts.iter().map(|h| h.to_string()).collect(),
            tls_secret: None,
        });
    }

    pub async fn add_config_map(&self, ns: &str, name: &str, pairs: &[(&str, &str)]) {
        self.config_maps.lock().await.insert(
            (ns.to_string(), name.to_string()),
            pairs
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
    }
}

#[async_trait]
impl ClusterTopologyProbe for FakeTopology {
    async fn list_ingresses(&self) -> OpsResult<Vec<IngressView>> {
        Ok(self.ingresses.lock().await.clone())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> OpsResult<Option<std::collections::BTreeMap<String, String>>> {
        Ok(self
            .config_maps
            .lock()
            .await
            .get(&(namespace.to_string(), name.to_string()))
            .cloned())
    }
}

/* ============================= RECORD BUILDERS ============================= */

pub fn app_record(name: &str, namespace: &str) -> ApplicationRecord {
    ApplicationRecord {
        app_name: name.to_string(),
        namespace: namespace.to_string(),
        hostnames: vec![name.to_string()],
        node_pool: None,
        databases: Databases::default(),
        shared_resources: Default::default(),
        tls_secret: None,
        last_discovered_at: 1_750_000_000,
    }
}

pub fn db_ref(host: &str, instance_id: Option<&str>) -> DbRef {
    DbRef {
        host: host.to_string(),
        port: 5432,
        database: None,
        user: None,
        instance_id: instance_id.map(str::to_string),
    }
}

pub fn pool_spec(name: &str, desired: i32, min: i32, max: i32) -> NodePoolSpec {
    NodePoolSpec {
        name: name.to_string(),
        default_desired: desired,
        default_min: min,
        default_max: max,
    }
}

pub fn shared(identifier: &str, apps: &[&str]) -> SharedResource {
    SharedResource {
        identifier: identifier.to_string(),
        linked_apps: apps.iter().map(|a| a.to_string()).collect(),
    }
}

/* ============================= ENVIRONMENT ============================= */

pub struct TestEnv {
    pub store: Arc<MemoryStore>,
    pub instances: Arc<FakeInstances>,
    pub pools: Arc<FakeNodePools>,
    pub workloads: Arc<FakeWorkloads>,
    pub pods: Arc<FakePods>,
    pub http: Arc<FakeHttp>,
    pub status: Arc<StatusAggregator>,
    pub lease: Arc<LeaseManager>,
    pub orchestrator: Arc<Orchestrator>,
    /// Interleaved call log shared by the instance, pool, and workload fakes.
    pub journal: Arc<Mutex<Vec<String>>>,
}

impl TestEnv {
    /// Position of the first journal entry with this prefix.
    pub async fn journal_index(&self, prefix: &str) -> Option<usize> {
        self.journal
            .lock()
            .await
            .iter()
            .position(|c| c.starts_with(prefix))
    }
}

/// Fully wired environment over fakes, with poll timings shrunk so waiting
/// steps finish in milliseconds.
pub fn test_env() -> TestEnv {
    let store = Arc::new(MemoryStore::new());
    let journal: Arc<Mutex<Vec<String>>> = Arc::new(Mutex::new(Vec::new()));
    let instances = Arc::new(FakeInstances {
        calls: journal.clone(),
        ..Default::default()
    });
    let pools = Arc::new(FakeNodePools {
        calls: journal.clone(),
        ..Default::default()
    });
    let workloads = Arc::new(FakeWorkloads {
        calls: journal.clone(),
        ..Default::default()
    });
    let pods = Arc::new(FakePods::default());
    let http = Arc::new(FakeHttp::default());

    let probe = ProbeSettings { http_timeout: 1, quick_timeout: 1, aggregator_timeout: 2 };

    let status = Arc::new(StatusAggregator::new(
        store.clone(),
        instances.clone(),
        pools.clone(),
        pods.clone(),
        http.clone(),
        probe,
    ));
    let lease = Arc::new(LeaseManager::new(store.clone(), 2));
    let orchestrator = Arc::new(
        Orchestrator::new(
            store.clone(),
            instances.clone(),
            pools.clone(),
            workloads.clone(),
            http.clone(),
            status.clone(),
            lease.clone(),
            Duration::from_secs(60),
            Duration::from_secs(1),
            Duration::from_secs(1),
        )
        .with_timings(PollTimings {
            db_poll_interval: Duration::from_millis(5),
            db_poll_deadline: Duration::from_millis(50),
            pool_poll_interval: Duration::from_millis(5),
            pool_poll_deadline: Duration::from_millis(50),
        }),
    );

    TestEnv {
        store,
        instances,
        pools,
        workloads,
        pods,
        http,
        status,
        lease,
        orchestrator,
        journal,
    }
}

pub async fn seed_app(env: &TestEnv, record: &ApplicationRecord) {
    put_typed(env.store.as_ref(), &app_key(&record.app_name), record, None)
        .await
        .unwrap();
}
