//! EC2-backed instance probe.

use async_trait::async_trait;
use aws_sdk_ec2::types::{Filter, InstanceStateName, Tag};
use tracing::warn;

use crate::config::TagSettings;
use crate::error::{OpsResult, classify_aws};
use crate::probes::{InstanceProbe, InstanceState, InstanceView, TaggedInstance};

pub struct Ec2Instances {
    client: aws_sdk_ec2::Client,
}

impl Ec2Instances {
    pub fn new(client: aws_sdk_ec2::Client) -> Self {
        Self { client }
    }
}

fn map_state(state: Option<&InstanceStateName>) -> InstanceState {
    match state {
        Some(InstanceStateName::Running) => InstanceState::Running,
        Some(InstanceStateName::Stopped) => InstanceState::Stopped,
        Some(InstanceStateName::Pending) => InstanceState::Pending,
        Some(InstanceStateName::Stopping) | Some(InstanceStateName::ShuttingDown) => {
            InstanceState::Stopping
        }
        _ => InstanceState::Unknown,
    }
}

fn tag_value<'a>(tags: &'a [Tag], key: &str) -> Option<&'a str> {
    tags.iter()
        .find(|t| t.key.as_deref() == Some(key))
        .and_then(|t| t.value.as_deref())
}

#[async_trait]
impl InstanceProbe for Ec2Instances {
    async fn describe(&self, ids: &[String]) -> OpsResult<Vec<InstanceView>> {
        let out = self
            .client
            .describe_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| classify_aws(format!("ec2 describe {ids:?}: {e}")))?;

        let mut views = Vec::new();
        for reservation in out.reservations() {
            for instance in reservation.instances() {
                let Some(id) = instance.instance_id() else { continue };
                views.push(InstanceView {
                    id: id.to_string(),
                    state: map_state(instance.state().and_then(|s| s.name())),
                    private_ip: instance.private_ip_address().map(str::to_string),
                });
            }
        }
        Ok(views)
    }

    async fn start(&self, ids: &[String]) -> OpsResult<()> {
        self.client
            .start_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| classify_aws(format!("ec2 start {ids:?}: {e}")))?;
        Ok(())
    }

    async fn stop(&self, ids: &[String]) -> OpsResult<()> {
        self.client
            .stop_instances()
            .set_instance_ids(Some(ids.to_vec()))
            .send()
            .await
            .map_err(|e| classify_aws(format!("ec2 stop {ids:?}: {e}")))?;
        Ok(())
    }

    async fn find_tagged(&self, tags: &TagSettings) -> OpsResult<Vec<TaggedInstance>> {
        let mut found = Vec::new();
        let mut next_token = None;

        loop {
            let out = self
                .client
                .describe_instances()
                .filters(
                    Filter::builder()
                        .name("tag-key")
                        .values(&tags.app_name_key)
                        .build(),
                )
                .set_next_token(next_token)
                .send()
                .await
                .map_err(|e| classify_aws(format!("ec2 tag scan: {e}")))?;

            for reservation in out.reservations() {
                for instance in reservation.instances() {
                    let Some(id) = instance.instance_id() else { continue };
                    let instance_tags = instance.tags();

                    let Some(app_tag) = tag_value(instance_tags, &tags.app_name_key) else {
                        warn!(instance = %id, "tagged_instance_missing_app_tag");
                        continue;
                    };

                    found.push(TaggedInstance {
                        instance_id: id.to_string(),
                        private_ip: instance.private_ip_address().map(str::to_string),
                        private_dns: instance.private_dns_name().map(str::to_string),
                        app_names: app_tag
                            .split(',')
                            .map(|a| a.trim().to_string())
                            .filter(|a| !a.is_empty())
                            .collect(),
                        component: tag_value(instance_tags, &tags.component_key)
                            .map(str::to_string),
                        shared: tag_value(instance_tags, &tags.shared_key)
                            .is_some_and(|v| v.eq_ignore_ascii_case("true")),
                        state: map_state(instance.state().and_then(|s| s.name())),
                    });
                }
            }

            next_token = out.next_token;
            if next_token.is_none() {
                break;
            }
        }

        Ok(found)
    }
}

/* ============================= TESTS ============================= */
