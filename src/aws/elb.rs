//! Target group, load balancer, and listener operations.

use super::ec2::{collapse_ids, missing_field};
use super::error::classify_sdk;
use crate::error::ProviderError;
use crate::provider::{Probe, ResourceHandle};
use crate::wait::{wait_until, PollConfig};
use aws_sdk_elasticloadbalancingv2::types::{
    Action, ActionTypeEnum, LoadBalancerSchemeEnum, LoadBalancerStateEnum, LoadBalancerTypeEnum,
    ProtocolEnum, Tag, TargetTypeEnum,
};
use aws_sdk_elasticloadbalancingv2::Client;
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::info;

pub struct ElbOps {
    client: Client,
}

fn elb_tags(tags: &BTreeMap<String, String>) -> Result<Vec<Tag>, ProviderError> {
    tags.iter()
        .map(|(k, v)| {
            Tag::builder()
                .key(k)
                .value(v)
                .build()
                .map_err(|e| ProviderError::Api {
                    code: None,
                    message: format!("invalid tag: {e}"),
                })
        })
        .collect()
}

fn as_missing(e: ProviderError) -> Result<Probe, ProviderError> {
    if e.is_not_found() {
        Ok(Probe::Missing)
    } else {
        Err(e)
    }
}

impl ElbOps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    // --- Target groups ---

    pub async fn probe_target_group(&self, cloud_name: &str) -> Result<Probe, ProviderError> {
        match self
            .client
            .describe_target_groups()
            .names(cloud_name)
            .send()
            .await
        {
            Ok(resp) => {
                let arns = resp
                    .target_groups()
                    .iter()
                    .filter_map(|t| t.target_group_arn().map(str::to_string))
                    .collect();
                Ok(collapse_ids(arns))
            }
            Err(e) => as_missing(classify_sdk(e)),
        }
    }

    pub async fn create_target_group(
        &self,
        cloud_name: &str,
        vpc_id: &str,
        port: u16,
        protocol: &str,
        health_check_path: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle, ProviderError> {
        let resp = self
            .client
            .create_target_group()
            .name(cloud_name)
            .vpc_id(vpc_id)
            .port(i32::from(port))
            .protocol(ProtocolEnum::from(protocol))
            .target_type(TargetTypeEnum::Instance)
            .health_check_path(health_check_path)
            .set_tags(Some(elb_tags(tags)?))
            .send()
            .await
            .map_err(classify_sdk)?;

        let arn = resp
            .target_groups()
            .first()
            .and_then(|t| t.target_group_arn())
            .ok_or_else(|| missing_field("TargetGroupArn"))?
            .to_string();
        Ok(ResourceHandle::new(arn))
    }

    pub async fn delete_target_group(&self, arn: &str) -> Result<(), ProviderError> {
        self.client
            .delete_target_group()
            .target_group_arn(arn)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }

    // --- Load balancers ---

    pub async fn probe_load_balancer(&self, cloud_name: &str) -> Result<Probe, ProviderError> {
        match self
            .client
            .describe_load_balancers()
            .names(cloud_name)
            .send()
            .await
        {
            Ok(resp) => {
                let balancers = resp.load_balancers();
                match balancers {
                    [] => Ok(Probe::Missing),
                    [one] => {
                        let arn = one
                            .load_balancer_arn()
                            .ok_or_else(|| missing_field("LoadBalancerArn"))?;
                        let mut handle = ResourceHandle::new(arn);
                        if let Some(dns) = one.dns_name() {
                            handle
                                .attributes
                                .insert("dns_name".to_string(), dns.to_string());
                        }
                        Ok(Probe::One(handle))
                    }
                    many => Ok(Probe::Many(
                        many.iter()
                            .filter_map(|b| b.load_balancer_arn().map(str::to_string))
                            .collect(),
                    )),
                }
            }
            Err(e) => as_missing(classify_sdk(e)),
        }
    }

    pub async fn create_load_balancer(
        &self,
        cloud_name: &str,
        subnet_ids: &[String],
        security_group_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle, ProviderError> {
        let resp = self
            .client
            .create_load_balancer()
            .name(cloud_name)
            .set_subnets(Some(subnet_ids.to_vec()))
            .security_groups(security_group_id)
            .scheme(LoadBalancerSchemeEnum::InternetFacing)
            .r#type(LoadBalancerTypeEnum::Application)
            .set_tags(Some(elb_tags(tags)?))
            .send()
            .await
            .map_err(classify_sdk)?;

        let balancer = resp
            .load_balancers()
            .first()
            .ok_or_else(|| missing_field("LoadBalancers"))?;
        let arn = balancer
            .load_balancer_arn()
            .ok_or_else(|| missing_field("LoadBalancerArn"))?
            .to_string();
        let mut handle = ResourceHandle::new(&arn);
        if let Some(dns) = balancer.dns_name() {
            handle
                .attributes
                .insert("dns_name".to_string(), dns.to_string());
        }

        // Listeners cannot attach until the balancer leaves "provisioning".
        self.wait_until_active(&arn).await?;
        Ok(handle)
    }

    async fn wait_until_active(&self, arn: &str) -> Result<(), ProviderError> {
        wait_until(
            PollConfig::with_timeout(Duration::from_secs(300)),
            None,
            || async {
                let resp = self
                    .client
                    .describe_load_balancers()
                    .load_balancer_arns(arn)
                    .send()
                    .await
                    .map_err(classify_sdk)?;
                let state = resp
                    .load_balancers()
                    .first()
                    .and_then(|b| b.state())
                    .and_then(|s| s.code());
                Ok(state == Some(&LoadBalancerStateEnum::Active))
            },
            "load balancer to become active",
        )
        .await
        .map_err(|e| ProviderError::Api {
            code: None,
            message: e.to_string(),
        })?;
        info!(arn = %arn, "Load balancer active");
        Ok(())
    }

    pub async fn delete_load_balancer(&self, arn: &str) -> Result<(), ProviderError> {
        self.client
            .delete_load_balancer()
            .load_balancer_arn(arn)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }

    // --- Listeners ---

    /// Listeners have no name of their own; they are found through their
    /// load balancer and port.
    pub async fn probe_listener(
        &self,
        load_balancer_arn: &str,
        port: u16,
    ) -> Result<Probe, ProviderError> {
        match self
            .client
            .describe_listeners()
            .load_balancer_arn(load_balancer_arn)
            .send()
            .await
        {
            Ok(resp) => {
                let arns: Vec<String> = resp
                    .listeners()
                    .iter()
                    .filter(|l| l.port() == Some(i32::from(port)))
                    .filter_map(|l| l.listener_arn().map(str::to_string))
                    .collect();
                Ok(collapse_ids(arns))
            }
            Err(e) => as_missing(classify_sdk(e)),
        }
    }

    pub async fn create_listener(
        &self,
        load_balancer_arn: &str,
        target_group_arn: &str,
        port: u16,
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle, ProviderError> {
        let forward = Action::builder()
            .r#type(ActionTypeEnum::Forward)
            .target_group_arn(target_group_arn)
            .build()
            .map_err(|e| ProviderError::Api {
                code: None,
                message: format!("invalid listener action: {e}"),
            })?;

        let resp = self
            .client
            .create_listener()
            .load_balancer_arn(load_balancer_arn)
            .port(i32::from(port))
            .protocol(ProtocolEnum::Http)
            .default_actions(forward)
            .set_tags(Some(elb_tags(tags)?))
            .send()
            .await
            .map_err(classify_sdk)?;

        let arn = resp
            .listeners()
            .first()
            .and_then(|l| l.listener_arn())
            .ok_or_else(|| missing_field("ListenerArn"))?
            .to_string();
        Ok(ResourceHandle::new(arn))
    }

    pub async fn delete_listener(&self, arn: &str) -> Result<(), ProviderError> {
        self.client
            .delete_listener()
            .listener_arn(arn)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }
}
