//! EKS-backed node pool probe.
//!
//! Scaling state comes from the EKS nodegroup API; the live node count comes
//! from the cluster itself, by counting Ready nodes carrying the nodegroup
//! label. Both handles are injected.

use async_trait::async_trait;
use aws_sdk_eks::types::{NodegroupScalingConfig, NodegroupStatus};
use k8s_openapi::api::core::v1::Node;
use kube::api::{Api, ListParams};
use tracing::info;

use crate::error::{OpsResult, classify_aws};
use crate::probes::{NodePoolProbe, NodePoolStatus, NodePoolView};

const NODEGROUP_LABEL: &str = "eks.amazonaws.com/nodegroup";

pub struct EksNodePools {
    eks: aws_sdk_eks::Client,
    kube: kube::Client,
    cluster: String,
}

impl EksNodePools {
    pub fn new(eks: aws_sdk_eks::Client, kube: kube::Client, cluster: impl Into<String>) -> Self {
        Self { eks, kube, cluster: cluster.into() }
    }

    async fn count_ready_nodes(&self, pool: &str) -> OpsResult<i32> {
        let nodes: Api<Node> = Api::all(self.kube.clone());
        let params = ListParams::default().labels(&format!("{NODEGROUP_LABEL}={pool}"));
        let list = nodes.list(&params).await?;

        let ready = list
            .items
            .iter()
            .filter(|n| {
                n.status
                    .as_ref()
                    .and_then(|s| s.conditions.as_ref())
                    .is_some_and(|conds| {
                        conds.iter().any(|c| c.type_ == "Ready" && c.status == "True")
                    })
            })
            .count();
        Ok(ready as i32)
    }
}

fn map_status(status: Option<&NodegroupStatus>) -> NodePoolStatus {
    match status {
        Some(NodegroupStatus::Active) => NodePoolStatus::Active,
        Some(NodegroupStatus::Updating) => NodePoolStatus::Updating,
        Some(NodegroupStatus::Creating) => NodePoolStatus::Creating,
        Some(NodegroupStatus::Deleting) => NodePoolStatus::Deleting,
        _ => NodePoolStatus::Degraded,
    }
}

#[async_trait]
impl NodePoolProbe for EksNodePools {
    async fn describe(&self, pool: &str) -> OpsResult<NodePoolView> {
        let out = match self
            .eks
            .describe_nodegroup()
            .cluster_name(&self.cluster)
            .nodegroup_name(pool)
            .send()
            .await
        {
            Ok(out) => out,
            Err(e) => {
                let service = e.into_service_error();
                if service.is_resource_not_found_exception() {
                    return Ok(NodePoolView {
                        name: pool.to_string(),
                        status: NodePoolStatus::NotFound,
                        desired: 0,
                        min: 0,
                        max: 0,
                        current_nodes: 0,
                    });
                }
                return Err(classify_aws(format!("eks describe {pool}: {service}")));
            }
        };

        let nodegroup = out.nodegroup();
        let scaling = nodegroup.and_then(|n| n.scaling_config());

        Ok(NodePoolView {
            name: pool.to_string(),
            status: map_status(nodegroup.and_then(|n| n.status())),
            desired: scaling.and_then(|s| s.desired_size()).unwrap_or(0),
            min: scaling.and_then(|s| s.min_size()).unwrap_or(0),
            max: scaling.and_then(|s| s.max_size()).unwrap_or(0),
            current_nodes: self.count_ready_nodes(pool).await.unwrap_or(0),
        })
    }

    async fn update_scaling(&self, pool: &str, desired: i32, min: i32, max: i32) -> OpsResult<()> {
        // No-op when the target already matches; avoids spurious UPDATING churn
        let current = self.describe(pool).await?;
        if current.desired == desired && current.min == min && current.max == max {
            info!(pool = %pool, desired, "nodegroup_scaling_already_matches");
            return Ok(());
        }

        self.eks
            .update_nodegroup_config()
            .cluster_name(&self.cluster)
            .nodegroup_name(pool)
            .scaling_config(
                NodegroupScalingConfig::builder()
                    .desired_size(desired)
                    .min_size(min)
                    .max_size(max)
                    .build(),
            )
            .send()
            .await
            .map_err(|e| classify_aws(format!("eks update {pool}: {e}")))?;

        info!(pool = %pool, desired, min, max, "nodegroup_scaling_updated");
        Ok(())
    }
}

/* ============================= TESTS ============================= */
