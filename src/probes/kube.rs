//! Kubernetes-backed probes: workloads, pods, and the cluster topology reads
//! used by discovery.

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::apps::v1::{Deployment, StatefulSet};
use k8s_openapi::api::core::v1::{ConfigMap, Pod};
use k8s_openapi::api::networking::v1::Ingress;
use kube::api::{Api, ListParams, Patch, PatchParams};
use serde_json::json;

use crate::error::OpsResult;
use crate::probes::{
    ClusterTopologyProbe, IngressView, PodProbe, PodView, WorkloadKind, WorkloadProbe,
    WorkloadView,
};

/* ============================= WORKLOADS ============================= */

pub struct KubeWorkloads {
    client: kube::Client,
}

impl KubeWorkloads {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

fn scale_patch(replicas: i32) -> Patch<serde_json::Value> {
    Patch::Merge(json!({ "spec": { "replicas": replicas } }))
}

#[async_trait]
impl WorkloadProbe for KubeWorkloads {
    async fn list_deployments(&self, namespace: &str) -> OpsResult<Vec<WorkloadView>> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|d| {
                Some(WorkloadView {
                    kind: WorkloadKind::Deployment,
                    name: d.metadata.name?,
                    replicas: d.spec.and_then(|s| s.replicas).unwrap_or(0),
                })
            })
            .collect())
    }

    async fn list_stateful_sets(&self, namespace: &str) -> OpsResult<Vec<WorkloadView>> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list
            .items
            .into_iter()
            .filter_map(|s| {
                Some(WorkloadView {
                    kind: WorkloadKind::StatefulSet,
                    name: s.metadata.name?,
                    replicas: s.spec.and_then(|s| s.replicas).unwrap_or(0),
                })
            })
            .collect())
    }

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> OpsResult<()> {
        let api: Api<Deployment> = Api::namespaced(self.client.clone(), namespace);
        api.patch_scale(name, &PatchParams::default(), &scale_patch(replicas))
            .await?;
        Ok(())
    }

    async fn scale_stateful_set(
        &self,
        namespace: &str,
        name: &str,
        replicas: i32,
    ) -> OpsResult<()> {
        let api: Api<StatefulSet> = Api::namespaced(self.client.clone(), namespace);
        api.patch_scale(name, &PatchParams::default(), &scale_patch(replicas))
            .await?;
        Ok(())
    }
}

/* ============================= PODS ============================= */

pub struct KubePods {
    client: kube::Client,
}

impl KubePods {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

/// Project one pod into the view the aggregator buckets.
///
/// The reason prefers a waiting-container reason (`CrashLoopBackOff`,
/// `ImagePullBackOff`) over the pod-level reason, matching what operators
/// see in `kubectl get pods`.
pub fn pod_view(pod: &Pod) -> PodView {
    let statuses = pod
        .status
        .as_ref()
        .and_then(|s| s.container_statuses.as_ref());

    let waiting_reason = statuses.and_then(|cs| {
        cs.iter().find_map(|c| {
            c.state
                .as_ref()
                .and_then(|s| s.waiting.as_ref())
                .and_then(|w| w.reason.clone())
        })
    });

    let restart_count = statuses
        .map(|cs| cs.iter().map(|c| c.restart_count).sum())
        .unwrap_or(0);

    let ready = statuses.is_some_and(|cs| !cs.is_empty() && cs.iter().all(|c| c.ready));

    PodView {
        name: pod.metadata.name.clone().unwrap_or_default(),
        phase: pod
            .status
            .as_ref()
            .and_then(|s| s.phase.clone())
            .unwrap_or_else(|| "Unknown".to_string()),
        reason: waiting_reason.or_else(|| pod.status.as_ref().and_then(|s| s.reason.clone())),
        owner: pod
            .metadata
            .owner_references
            .as_ref()
            .and_then(|refs| refs.first())
            .map(|r| r.name.clone()),
        restart_count,
        created_at: pod
            .metadata
            .creation_timestamp
            .as_ref()
            .map(|t| t.0.to_rfc3339()),
        ready,
    }
}

#[async_trait]
impl PodProbe for KubePods {
    async fn list_pods(&self, namespace: &str) -> OpsResult<Vec<PodView>> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let list = api.list(&ListParams::default()).await?;
        Ok(list.items.iter().map(pod_view).collect())
    }
}

/* ============================= TOPOLOGY ============================= */

pub struct KubeTopology {
    client: kube::Client,
}

impl KubeTopology {
    pub fn new(client: kube::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ClusterTopologyProbe for KubeTopology {
    async fn list_ingresses(&self) -> OpsResult<Vec<IngressView>> {
        let api: Api<Ingress> = Api::all(self.client.clone());
        let list = api.list(&ListParams::default()).await?;

        Ok(list
            .items
            .into_iter()
            .filter_map(|ing| {
                let spec = ing.spec?;
                let hosts: Vec<String> = spec
                    .rules
                    .unwrap_or_default()
                    .into_iter()
                    .filter_map(|r| r.host)
                    .collect();
                Some(IngressView {
                    name: ing.metadata.name?,
                    namespace: ing.metadata.namespace.unwrap_or_default(),
                    hosts,
                    tls_secret: spec
                        .tls
                        .and_then(|tls| tls.into_iter().find_map(|t| t.secret_name)),
                })
            })
            .collect())
    }

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> OpsResult<Option<BTreeMap<String, String>>> {
        let api: Api<ConfigMap> = Api::namespaced(self.client.clone(), namespace);
        Ok(api.get_opt(name).await?.and_then(|cm| cm.data))
    }
}

/* ============================= TESTS ============================= */
