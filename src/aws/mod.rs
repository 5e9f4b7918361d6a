//! AWS implementation of the provider seam.
//!
//! `AwsProvider` maps logical spec names onto stack-prefixed cloud names,
//! dispatches each resource kind to its service module, and classifies
//! every SDK failure through [`error::classify_sdk`].

pub mod account;
pub mod autoscaling;
pub mod context;
pub mod ec2;
pub mod elb;
pub mod error;
pub mod iam;

use crate::error::ProviderError;
use crate::provider::{CloudProvider, Probe, ResourceHandle};
use crate::spec::{AccessRule, ResourceKind, ResourceParams, ValueRef};
use crate::tags::cloud_name;
use autoscaling::AsgOps;
use context::AwsContext;
use ec2::Ec2Ops;
use elb::ElbOps;
use iam::IamOps;
use std::collections::BTreeMap;

/// Extract a bound literal from a resolved parameter.
fn lit(value: &ValueRef) -> Result<&str, ProviderError> {
    value.as_literal().ok_or_else(|| ProviderError::Api {
        code: None,
        message: "parameter reference was never resolved".to_string(),
    })
}

fn lits(values: &[ValueRef]) -> Result<Vec<String>, ProviderError> {
    values
        .iter()
        .map(|v| lit(v).map(str::to_string))
        .collect()
}

pub struct AwsProvider {
    stack: String,
    ec2: Ec2Ops,
    iam: IamOps,
    elb: ElbOps,
    asg: AsgOps,
}

impl AwsProvider {
    pub fn new(ctx: &AwsContext, stack: impl Into<String>) -> Self {
        Self {
            stack: stack.into(),
            ec2: Ec2Ops::new(ctx.ec2_client()),
            iam: IamOps::new(ctx.iam_client()),
            elb: ElbOps::new(ctx.elb_client()),
            asg: AsgOps::new(ctx.autoscaling_client()),
        }
    }

    pub fn ec2(&self) -> &Ec2Ops {
        &self.ec2
    }

    fn cloud(&self, logical_name: &str) -> String {
        cloud_name(&self.stack, logical_name)
    }
}

impl CloudProvider for AwsProvider {
    async fn probe(
        &self,
        kind: ResourceKind,
        name: &str,
        params: &ResourceParams,
    ) -> Result<Probe, ProviderError> {
        let cloud = self.cloud(name);
        match kind {
            ResourceKind::Vpc => self.ec2.probe_vpc(&cloud, &self.stack).await,
            ResourceKind::Subnet => self.ec2.probe_subnet(&cloud, &self.stack).await,
            ResourceKind::InternetGateway => {
                self.ec2.probe_internet_gateway(&cloud, &self.stack).await
            }
            ResourceKind::RouteTable => self.ec2.probe_route_table(&cloud, &self.stack).await,
            ResourceKind::SecurityGroup => {
                self.ec2.probe_security_group(&cloud, &self.stack).await
            }
            ResourceKind::IamRole => self.iam.probe_role(&cloud).await,
            ResourceKind::InstanceProfile => self.iam.probe_instance_profile(&cloud).await,
            ResourceKind::LaunchTemplate => self.ec2.probe_launch_template(&cloud).await,
            ResourceKind::TargetGroup => self.elb.probe_target_group(&cloud).await,
            ResourceKind::LoadBalancer => self.elb.probe_load_balancer(&cloud).await,
            ResourceKind::Listener => {
                let ResourceParams::Listener {
                    load_balancer,
                    port,
                    ..
                } = params
                else {
                    return Err(mismatched(kind));
                };
                self.elb.probe_listener(lit(load_balancer)?, *port).await
            }
            ResourceKind::AutoScalingGroup => self.asg.probe_group(&cloud).await,
            ResourceKind::ScalingPolicy => {
                let ResourceParams::ScalingPolicy { group, .. } = params else {
                    return Err(mismatched(kind));
                };
                self.asg.probe_policy(lit(group)?, &cloud).await
            }
        }
    }

    async fn create(
        &self,
        name: &str,
        params: &ResourceParams,
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle, ProviderError> {
        let cloud = self.cloud(name);
        match params {
            ResourceParams::Vpc { cidr_block } => self.ec2.create_vpc(cidr_block, tags).await,
            ResourceParams::Subnet {
                vpc,
                cidr_block,
                availability_zone,
                map_public_ip,
            } => {
                self.ec2
                    .create_subnet(lit(vpc)?, cidr_block, availability_zone, *map_public_ip, tags)
                    .await
            }
            ResourceParams::InternetGateway { vpc } => {
                self.ec2.create_internet_gateway(lit(vpc)?, tags).await
            }
            ResourceParams::RouteTable {
                vpc,
                gateway,
                destination,
                subnets,
            } => {
                self.ec2
                    .create_route_table(
                        lit(vpc)?,
                        lit(gateway)?,
                        destination,
                        &lits(subnets)?,
                        tags,
                    )
                    .await
            }
            ResourceParams::SecurityGroup { vpc, description } => {
                self.ec2
                    .create_security_group(&cloud, lit(vpc)?, description, tags)
                    .await
            }
            ResourceParams::IamRole {
                managed_policy_arns,
            } => self.iam.create_role(&cloud, managed_policy_arns, tags).await,
            ResourceParams::InstanceProfile { role } => {
                self.iam
                    .create_instance_profile(&cloud, lit(role)?, tags)
                    .await
            }
            ResourceParams::LaunchTemplate {
                image_id,
                instance_type,
                key_name,
                security_group,
                instance_profile,
                user_data,
            } => {
                let profile = instance_profile.as_ref().map(lit).transpose()?;
                self.ec2
                    .create_launch_template(
                        &cloud,
                        image_id,
                        instance_type,
                        key_name.as_deref(),
                        lit(security_group)?,
                        profile,
                        user_data.as_deref(),
                        tags,
                    )
                    .await
            }
            ResourceParams::TargetGroup {
                vpc,
                port,
                protocol,
                health_check_path,
            } => {
                self.elb
                    .create_target_group(
                        &cloud,
                        lit(vpc)?,
                        *port,
                        protocol,
                        health_check_path,
                        tags,
                    )
                    .await
            }
            ResourceParams::LoadBalancer {
                subnets,
                security_group,
            } => {
                self.elb
                    .create_load_balancer(&cloud, &lits(subnets)?, lit(security_group)?, tags)
                    .await
            }
            ResourceParams::Listener {
                load_balancer,
                target_group,
                port,
            } => {
                self.elb
                    .create_listener(lit(load_balancer)?, lit(target_group)?, *port, tags)
                    .await
            }
            ResourceParams::AutoScalingGroup {
                launch_template,
                subnets,
                target_group,
                min_size,
                max_size,
                desired_capacity,
            } => {
                let target = target_group.as_ref().map(lit).transpose()?;
                self.asg
                    .create_group(
                        &cloud,
                        lit(launch_template)?,
                        &lits(subnets)?,
                        target,
                        *min_size,
                        *max_size,
                        *desired_capacity,
                        tags,
                    )
                    .await
            }
            ResourceParams::ScalingPolicy {
                group,
                target_cpu_percent,
            } => {
                self.asg
                    .put_policy(lit(group)?, &cloud, *target_cpu_percent)
                    .await
            }
        }
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), ProviderError> {
        match kind {
            ResourceKind::Vpc => self.ec2.delete_vpc(id).await,
            ResourceKind::Subnet => self.ec2.delete_subnet(id).await,
            ResourceKind::InternetGateway => self.ec2.delete_internet_gateway(id).await,
            ResourceKind::RouteTable => self.ec2.delete_route_table(id).await,
            ResourceKind::SecurityGroup => self.ec2.delete_security_group(id).await,
            ResourceKind::IamRole => self.iam.delete_role(id).await,
            ResourceKind::InstanceProfile => self.iam.delete_instance_profile(id).await,
            ResourceKind::LaunchTemplate => self.ec2.delete_launch_template(id).await,
            ResourceKind::TargetGroup => self.elb.delete_target_group(id).await,
            ResourceKind::LoadBalancer => self.elb.delete_load_balancer(id).await,
            ResourceKind::Listener => self.elb.delete_listener(id).await,
            ResourceKind::AutoScalingGroup => self.asg.delete_group(id).await,
            ResourceKind::ScalingPolicy => self.asg.delete_policy(id).await,
        }
    }

    async fn ingress_rules(&self, group_id: &str) -> Result<Vec<AccessRule>, ProviderError> {
        self.ec2.ingress_rules(group_id).await
    }

    async fn authorize_ingress(
        &self,
        group_id: &str,
        rule: &AccessRule,
    ) -> Result<(), ProviderError> {
        self.ec2.authorize_ingress(group_id, rule).await
    }

    async fn drain_group(&self, name: &str) -> Result<(), ProviderError> {
        self.asg.drain(&self.cloud(name)).await
    }

    async fn group_instance_count(&self, name: &str) -> Result<usize, ProviderError> {
        self.asg.instance_count(&self.cloud(name)).await
    }
}

fn mismatched(kind: ResourceKind) -> ProviderError {
    ProviderError::Api {
        code: None,
        message: format!("parameters do not match resource kind {kind}"),
    }
}
