//! Auto-scaling group and target-tracking policy operations.
//!
//! Groups are addressed by name (their name is their identifier);
//! scaling policies by ARN.

use super::ec2::{collapse_ids, missing_field};
use super::error::classify_sdk;
use crate::error::ProviderError;
use crate::provider::{Probe, ResourceHandle};
use aws_sdk_autoscaling::types::{
    LaunchTemplateSpecification, MetricType, PredefinedMetricSpecification, Tag,
    TargetTrackingConfiguration,
};
use aws_sdk_autoscaling::Client;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub struct AsgOps {
    client: Client,
}

fn asg_tags(tags: &BTreeMap<String, String>) -> Vec<Tag> {
    tags.iter()
        .map(|(k, v)| {
            Tag::builder()
                .key(k)
                .value(v)
                .propagate_at_launch(true)
                .build()
        })
        .collect()
}

impl AsgOps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn probe_group(&self, cloud_name: &str) -> Result<Probe, ProviderError> {
        let resp = self
            .client
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(cloud_name)
            .send()
            .await
            .map_err(classify_sdk)?;

        let names: Vec<String> = resp
            .auto_scaling_groups()
            .iter()
            .map(|g| g.auto_scaling_group_name().to_string())
            .collect();
        Ok(collapse_ids(names))
    }

    #[allow(clippy::too_many_arguments)]
    pub async fn create_group(
        &self,
        cloud_name: &str,
        launch_template_id: &str,
        subnet_ids: &[String],
        target_group_arn: Option<&str>,
        min_size: u32,
        max_size: u32,
        desired_capacity: u32,
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle, ProviderError> {
        let mut req = self
            .client
            .create_auto_scaling_group()
            .auto_scaling_group_name(cloud_name)
            .launch_template(
                LaunchTemplateSpecification::builder()
                    .launch_template_id(launch_template_id)
                    .version("$Latest")
                    .build(),
            )
            .min_size(min_size as i32)
            .max_size(max_size as i32)
            .desired_capacity(desired_capacity as i32)
            .vpc_zone_identifier(subnet_ids.join(","))
            .set_tags(Some(asg_tags(tags)));

        if let Some(arn) = target_group_arn {
            req = req
                .target_group_arns(arn)
                .health_check_type("ELB")
                .health_check_grace_period(90);
        }

        req.send().await.map_err(classify_sdk)?;
        info!(group = %cloud_name, "Created auto-scaling group");
        Ok(ResourceHandle::new(cloud_name))
    }

    pub async fn delete_group(&self, cloud_name: &str) -> Result<(), ProviderError> {
        self.client
            .delete_auto_scaling_group()
            .auto_scaling_group_name(cloud_name)
            .force_delete(true)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }

    /// Scale the group to zero so its instances terminate.
    pub async fn drain(&self, cloud_name: &str) -> Result<(), ProviderError> {
        debug!(group = %cloud_name, "Scaling group to zero");
        self.client
            .update_auto_scaling_group()
            .auto_scaling_group_name(cloud_name)
            .min_size(0)
            .desired_capacity(0)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }

    pub async fn instance_count(&self, cloud_name: &str) -> Result<usize, ProviderError> {
        let resp = self
            .client
            .describe_auto_scaling_groups()
            .auto_scaling_group_names(cloud_name)
            .send()
            .await
            .map_err(classify_sdk)?;

        let group = resp
            .auto_scaling_groups()
            .first()
            .ok_or_else(|| ProviderError::NotFound(cloud_name.to_string()))?;
        Ok(group.instances().len())
    }

    // --- Scaling policies ---

    pub async fn probe_policy(
        &self,
        group_name: &str,
        cloud_name: &str,
    ) -> Result<Probe, ProviderError> {
        let resp = self
            .client
            .describe_policies()
            .auto_scaling_group_name(group_name)
            .policy_names(cloud_name)
            .send()
            .await;

        match resp {
            Ok(resp) => {
                let arns = resp
                    .scaling_policies()
                    .iter()
                    .filter_map(|p| p.policy_arn().map(str::to_string))
                    .collect();
                Ok(collapse_ids(arns))
            }
            Err(e) => {
                let classified = classify_sdk(e);
                if classified.is_not_found() {
                    Ok(Probe::Missing)
                } else {
                    Err(classified)
                }
            }
        }
    }

    pub async fn put_policy(
        &self,
        group_name: &str,
        cloud_name: &str,
        target_cpu_percent: f64,
    ) -> Result<ResourceHandle, ProviderError> {
        let tracking = TargetTrackingConfiguration::builder()
            .predefined_metric_specification(
                PredefinedMetricSpecification::builder()
                    .predefined_metric_type(MetricType::AsgAverageCpuUtilization)
                    .build()
                    .map_err(|e| ProviderError::Api {
                        code: None,
                        message: format!("invalid metric specification: {e}"),
                    })?,
            )
            .target_value(target_cpu_percent)
            .build()
            .map_err(|e| ProviderError::Api {
                code: None,
                message: format!("invalid tracking configuration: {e}"),
            })?;

        let resp = self
            .client
            .put_scaling_policy()
            .auto_scaling_group_name(group_name)
            .policy_name(cloud_name)
            .policy_type("TargetTrackingScaling")
            .target_tracking_configuration(tracking)
            .send()
            .await
            .map_err(classify_sdk)?;

        let arn = resp
            .policy_arn()
            .ok_or_else(|| missing_field("PolicyARN"))?
            .to_string();
        Ok(ResourceHandle::new(arn))
    }

    /// `DeletePolicy` accepts the policy ARN, so the group name is not
    /// needed here.
    pub async fn delete_policy(&self, arn: &str) -> Result<(), ProviderError> {
        self.client
            .delete_policy()
            .policy_name(arn)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }
}
