//! Typed probe clients over the external systems.
//!
//! Each trait is one adapter seam: the production impl wraps a single SDK
//! client, the test impls live with the integration tests. Everything is
//! constructor-injected; no process-global clients. Raw errors are
//! translated into [`crate::error::OpsError`] kinds at this boundary.

pub mod ec2;
pub mod eks;
pub mod http;
pub mod kube;

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::TagSettings;
use crate::error::OpsResult;

/* ============================= INSTANCES ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceState {
    Running,
    Stopped,
    Pending,
    Stopping,
    Unknown,
}

impl InstanceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Running => "running",
            Self::Stopped => "stopped",
            Self::Pending => "pending",
            Self::Stopping => "stopping",
            Self::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceView {
    pub id: String,
    pub state: InstanceState,
    pub private_ip: Option<String>,
}

/// A VM instance carrying the lifecycle tags.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaggedInstance {
    pub instance_id: String,
    pub private_ip: Option<String>,
    pub private_dns: Option<String>,
    /// Applications named in the app tag (comma-separated in the tag value).
    pub app_names: Vec<String>,
    /// `postgres`, `neo4j`, or `nodegroup`.
    pub component: Option<String>,
    pub shared: bool,
    pub state: InstanceState,
}

/// Compute instance lifecycle: describe, start, stop, plus the tag scan used
/// by discovery. Start/stop are asynchronous — the cloud has accepted the
/// request, nothing more.
#[async_trait]
pub trait InstanceProbe: Send + Sync + 'static {
    async fn describe(&self, ids: &[String]) -> OpsResult<Vec<InstanceView>>;

    async fn start(&self, ids: &[String]) -> OpsResult<()>;

    async fn stop(&self, ids: &[String]) -> OpsResult<()>;

    async fn find_tagged(&self, tags: &TagSettings) -> OpsResult<Vec<TaggedInstance>>;
}

/* ============================= NODE POOLS ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum NodePoolStatus {
    Active,
    Updating,
    Creating,
    Degraded,
    Deleting,
    NotFound,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodePoolView {
    pub name: String,
    pub status: NodePoolStatus,
    pub desired: i32,
    pub min: i32,
    pub max: i32,
    pub current_nodes: i32,
}

#[async_trait]
pub trait NodePoolProbe: Send + Sync + 'static {
    /// A missing pool reports `NOT_FOUND` status rather than an error.
    async fn describe(&self, pool: &str) -> OpsResult<NodePoolView>;

    /// Idempotent when the target already matches the current scaling config.
    async fn update_scaling(&self, pool: &str, desired: i32, min: i32, max: i32) -> OpsResult<()>;
}

/* ============================= WORKLOADS ============================= */

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkloadKind {
    Deployment,
    StatefulSet,
}

impl std::fmt::Display for WorkloadKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Deployment => f.write_str("deployment"),
            Self::StatefulSet => f.write_str("statefulset"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkloadView {
    pub kind: WorkloadKind,
    pub name: String,
    pub replicas: i32,
}

/// Replicas are a target; callers wait for convergence via pod listing.
#[async_trait]
pub trait WorkloadProbe: Send + Sync + 'static {
    async fn list_deployments(&self, namespace: &str) -> OpsResult<Vec<WorkloadView>>;

    async fn list_stateful_sets(&self, namespace: &str) -> OpsResult<Vec<WorkloadView>>;

    async fn scale_deployment(&self, namespace: &str, name: &str, replicas: i32) -> OpsResult<()>;

    async fn scale_stateful_set(&self, namespace: &str, name: &str, replicas: i32)
    -> OpsResult<()>;
}

/* ============================= PODS ============================= */

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PodView {
    pub name: String,
    pub phase: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,
    pub restart_count: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    pub ready: bool,
}

#[async_trait]
pub trait PodProbe: Send + Sync + 'static {
    async fn list_pods(&self, namespace: &str) -> OpsResult<Vec<PodView>>;
}

/* ============================= CLUSTER TOPOLOGY ============================= */

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngressView {
    pub name: String,
    pub namespace: String,
    pub hosts: Vec<String>,
    pub tls_secret: Option<String>,
}

/// Ingress and ConfigMap reads used only by the discovery reconciler.
#[async_trait]
pub trait ClusterTopologyProbe: Send + Sync + 'static {
    async fn list_ingresses(&self) -> OpsResult<Vec<IngressView>>;

    async fn get_config_map(
        &self,
        namespace: &str,
        name: &str,
    ) -> OpsResult<Option<BTreeMap<String, String>>>;
}

/* ============================= HTTP ============================= */

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeadOutcome {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<u16>,
    pub latency_ms: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// True when the request hit its deadline rather than failing outright.
    #[serde(default)]
    pub timed_out: bool,
}

/// One HEAD request against a hostname: HTTPS first, plain HTTP fallback on
/// transport failure. Never returns an error; failures land in the outcome.
#[async_trait]
pub trait HttpProbe: Send + Sync + 'static {
    async fn head(&self, host: &str, timeout: Duration) -> HeadOutcome;
}
