//! EC2 network and launch-template operations.
//!
//! Route tables get their default route and subnet associations at
//! creation time only; a table adopted on a later run keeps whatever
//! routes and associations it already carries.

use super::error::classify_sdk;
use crate::error::ProviderError;
use crate::provider::{Probe, ResourceHandle};
use crate::spec::AccessRule;
use crate::tags::STACK_TAG;
use aws_sdk_ec2::types::{
    AttributeBooleanValue, Filter, InstanceType, IpPermission, IpRange,
    LaunchTemplateIamInstanceProfileSpecificationRequest, RequestLaunchTemplateData, ResourceType,
    Tag, TagSpecification,
};
use aws_sdk_ec2::Client;
use base64::Engine;
use std::collections::BTreeMap;
use tracing::{debug, info};

pub struct Ec2Ops {
    client: Client,
}

pub(super) fn missing_field(what: &str) -> ProviderError {
    ProviderError::Api {
        code: None,
        message: format!("response missing {what}"),
    }
}

pub(super) fn collapse_ids(ids: Vec<String>) -> Probe {
    match ids.as_slice() {
        [] => Probe::Missing,
        [one] => Probe::One(ResourceHandle::new(one.clone())),
        _ => Probe::Many(ids),
    }
}

fn tag_spec(resource_type: ResourceType, tags: &BTreeMap<String, String>) -> TagSpecification {
    let mut builder = TagSpecification::builder().resource_type(resource_type);
    for (key, value) in tags {
        builder = builder.tags(Tag::builder().key(key).value(value).build());
    }
    builder.build()
}

fn name_filters(cloud_name: &str, stack: &str) -> Vec<Filter> {
    vec![
        Filter::builder().name("tag:Name").values(cloud_name).build(),
        Filter::builder()
            .name(format!("tag:{STACK_TAG}"))
            .values(stack)
            .build(),
    ]
}

impl Ec2Ops {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    // --- VPC ---

    pub async fn probe_vpc(&self, cloud_name: &str, stack: &str) -> Result<Probe, ProviderError> {
        let resp = self
            .client
            .describe_vpcs()
            .set_filters(Some(name_filters(cloud_name, stack)))
            .send()
            .await
            .map_err(classify_sdk)?;
        let ids = resp
            .vpcs()
            .iter()
            .filter_map(|v| v.vpc_id().map(str::to_string))
            .collect();
        Ok(collapse_ids(ids))
    }

    pub async fn create_vpc(
        &self,
        cidr_block: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle, ProviderError> {
        let resp = self
            .client
            .create_vpc()
            .cidr_block(cidr_block)
            .tag_specifications(tag_spec(ResourceType::Vpc, tags))
            .send()
            .await
            .map_err(classify_sdk)?;
        let id = resp
            .vpc()
            .and_then(|v| v.vpc_id())
            .ok_or_else(|| missing_field("VpcId"))?
            .to_string();

        // Instances need resolvable hostnames for target registration.
        self.client
            .modify_vpc_attribute()
            .vpc_id(&id)
            .enable_dns_hostnames(AttributeBooleanValue::builder().value(true).build())
            .send()
            .await
            .map_err(classify_sdk)?;

        Ok(ResourceHandle::new(id))
    }

    pub async fn delete_vpc(&self, id: &str) -> Result<(), ProviderError> {
        self.client
            .delete_vpc()
            .vpc_id(id)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }

    // --- Subnets ---

    pub async fn probe_subnet(
        &self,
        cloud_name: &str,
        stack: &str,
    ) -> Result<Probe, ProviderError> {
        let resp = self
            .client
            .describe_subnets()
            .set_filters(Some(name_filters(cloud_name, stack)))
            .send()
            .await
            .map_err(classify_sdk)?;
        let ids = resp
            .subnets()
            .iter()
            .filter_map(|s| s.subnet_id().map(str::to_string))
            .collect();
        Ok(collapse_ids(ids))
    }

    pub async fn create_subnet(
        &self,
        vpc_id: &str,
        cidr_block: &str,
        availability_zone: &str,
        map_public_ip: bool,
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle, ProviderError> {
        let resp = self
            .client
            .create_subnet()
            .vpc_id(vpc_id)
            .cidr_block(cidr_block)
            .availability_zone(availability_zone)
            .tag_specifications(tag_spec(ResourceType::Subnet, tags))
            .send()
            .await
            .map_err(classify_sdk)?;
        let id = resp
            .subnet()
            .and_then(|s| s.subnet_id())
            .ok_or_else(|| missing_field("SubnetId"))?
            .to_string();

        if map_public_ip {
            self.client
                .modify_subnet_attribute()
                .subnet_id(&id)
                .map_public_ip_on_launch(AttributeBooleanValue::builder().value(true).build())
                .send()
                .await
                .map_err(classify_sdk)?;
        }

        Ok(ResourceHandle::new(id))
    }

    pub async fn delete_subnet(&self, id: &str) -> Result<(), ProviderError> {
        self.client
            .delete_subnet()
            .subnet_id(id)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }

    // --- Internet gateway ---

    pub async fn probe_internet_gateway(
        &self,
        cloud_name: &str,
        stack: &str,
    ) -> Result<Probe, ProviderError> {
        let resp = self
            .client
            .describe_internet_gateways()
            .set_filters(Some(name_filters(cloud_name, stack)))
            .send()
            .await
            .map_err(classify_sdk)?;
        let ids = resp
            .internet_gateways()
            .iter()
            .filter_map(|g| g.internet_gateway_id().map(str::to_string))
            .collect();
        Ok(collapse_ids(ids))
    }

    pub async fn create_internet_gateway(
        &self,
        vpc_id: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle, ProviderError> {
        let resp = self
            .client
            .create_internet_gateway()
            .tag_specifications(tag_spec(ResourceType::InternetGateway, tags))
            .send()
            .await
            .map_err(classify_sdk)?;
        let id = resp
            .internet_gateway()
            .and_then(|g| g.internet_gateway_id())
            .ok_or_else(|| missing_field("InternetGatewayId"))?
            .to_string();

        self.client
            .attach_internet_gateway()
            .internet_gateway_id(&id)
            .vpc_id(vpc_id)
            .send()
            .await
            .map_err(classify_sdk)?;

        Ok(ResourceHandle::new(id))
    }

    pub async fn delete_internet_gateway(&self, id: &str) -> Result<(), ProviderError> {
        let resp = self
            .client
            .describe_internet_gateways()
            .internet_gateway_ids(id)
            .send()
            .await
            .map_err(classify_sdk)?;

        for gateway in resp.internet_gateways() {
            for attachment in gateway.attachments() {
                if let Some(vpc_id) = attachment.vpc_id() {
                    debug!(gateway = %id, vpc = %vpc_id, "Detaching internet gateway");
                    self.client
                        .detach_internet_gateway()
                        .internet_gateway_id(id)
                        .vpc_id(vpc_id)
                        .send()
                        .await
                        .map_err(classify_sdk)?;
                }
            }
        }

        self.client
            .delete_internet_gateway()
            .internet_gateway_id(id)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }

    // --- Route tables ---

    pub async fn probe_route_table(
        &self,
        cloud_name: &str,
        stack: &str,
    ) -> Result<Probe, ProviderError> {
        let resp = self
            .client
            .describe_route_tables()
            .set_filters(Some(name_filters(cloud_name, stack)))
            .send()
            .await
            .map_err(classify_sdk)?;
        let ids = resp
            .route_tables()
            .iter()
            .filter_map(|t| t.route_table_id().map(str::to_string))
            .collect();
        Ok(collapse_ids(ids))
    }

    pub async fn create_route_table(
        &self,
        vpc_id: &str,
        gateway_id: &str,
        destination: &str,
        subnet_ids: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle, ProviderError> {
        let resp = self
            .client
            .create_route_table()
            .vpc_id(vpc_id)
            .tag_specifications(tag_spec(ResourceType::RouteTable, tags))
            .send()
            .await
            .map_err(classify_sdk)?;
        let id = resp
            .route_table()
            .and_then(|t| t.route_table_id())
            .ok_or_else(|| missing_field("RouteTableId"))?
            .to_string();

        self.client
            .create_route()
            .route_table_id(&id)
            .destination_cidr_block(destination)
            .gateway_id(gateway_id)
            .send()
            .await
            .map_err(classify_sdk)?;

        for subnet_id in subnet_ids {
            self.client
                .associate_route_table()
                .route_table_id(&id)
                .subnet_id(subnet_id)
                .send()
                .await
                .map_err(classify_sdk)?;
        }

        Ok(ResourceHandle::new(id))
    }

    pub async fn delete_route_table(&self, id: &str) -> Result<(), ProviderError> {
        let resp = self
            .client
            .describe_route_tables()
            .route_table_ids(id)
            .send()
            .await
            .map_err(classify_sdk)?;

        for table in resp.route_tables() {
            for association in table.associations() {
                if association.main() == Some(true) {
                    continue;
                }
                if let Some(assoc_id) = association.route_table_association_id() {
                    self.client
                        .disassociate_route_table()
                        .association_id(assoc_id)
                        .send()
                        .await
                        .map_err(classify_sdk)?;
                }
            }
        }

        self.client
            .delete_route_table()
            .route_table_id(id)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }

    // --- Security groups ---

    pub async fn probe_security_group(
        &self,
        cloud_name: &str,
        stack: &str,
    ) -> Result<Probe, ProviderError> {
        let resp = self
            .client
            .describe_security_groups()
            .set_filters(Some(name_filters(cloud_name, stack)))
            .send()
            .await
            .map_err(classify_sdk)?;
        let ids = resp
            .security_groups()
            .iter()
            .filter_map(|g| g.group_id().map(str::to_string))
            .collect();
        Ok(collapse_ids(ids))
    }

    pub async fn create_security_group(
        &self,
        cloud_name: &str,
        vpc_id: &str,
        description: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle, ProviderError> {
        let resp = self
            .client
            .create_security_group()
            .group_name(cloud_name)
            .description(description)
            .vpc_id(vpc_id)
            .tag_specifications(tag_spec(ResourceType::SecurityGroup, tags))
            .send()
            .await
            .map_err(classify_sdk)?;
        let id = resp
            .group_id()
            .ok_or_else(|| missing_field("GroupId"))?
            .to_string();
        Ok(ResourceHandle::new(id))
    }

    pub async fn delete_security_group(&self, id: &str) -> Result<(), ProviderError> {
        self.client
            .delete_security_group()
            .group_id(id)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }

    pub async fn ingress_rules(&self, group_id: &str) -> Result<Vec<AccessRule>, ProviderError> {
        let resp = self
            .client
            .describe_security_groups()
            .group_ids(group_id)
            .send()
            .await
            .map_err(classify_sdk)?;

        let group = resp
            .security_groups()
            .first()
            .ok_or_else(|| ProviderError::NotFound(group_id.to_string()))?;

        let mut rules = Vec::new();
        for permission in group.ip_permissions() {
            let (Some(protocol), Some(from), Some(to)) = (
                permission.ip_protocol(),
                permission.from_port(),
                permission.to_port(),
            ) else {
                continue;
            };
            let (Ok(from), Ok(to)) = (u16::try_from(from), u16::try_from(to)) else {
                continue;
            };
            for range in permission.ip_ranges() {
                if let Some(cidr) = range.cidr_ip() {
                    rules.push(AccessRule {
                        protocol: protocol.to_string(),
                        from_port: from,
                        to_port: to,
                        source: cidr.to_string(),
                    });
                }
            }
        }
        Ok(rules)
    }

    pub async fn authorize_ingress(
        &self,
        group_id: &str,
        rule: &AccessRule,
    ) -> Result<(), ProviderError> {
        let permission = IpPermission::builder()
            .ip_protocol(&rule.protocol)
            .from_port(i32::from(rule.from_port))
            .to_port(i32::from(rule.to_port))
            .ip_ranges(IpRange::builder().cidr_ip(&rule.source).build())
            .build();

        self.client
            .authorize_security_group_ingress()
            .group_id(group_id)
            .ip_permissions(permission)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }

    // --- Launch templates ---

    pub async fn probe_launch_template(&self, cloud_name: &str) -> Result<Probe, ProviderError> {
        let resp = self
            .client
            .describe_launch_templates()
            .launch_template_names(cloud_name)
            .send()
            .await;

        match resp {
            Ok(resp) => {
                let ids = resp
                    .launch_templates()
                    .iter()
                    .filter_map(|t| t.launch_template_id().map(str::to_string))
                    .collect();
                Ok(collapse_ids(ids))
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

    #[allow(clippy::too_many_arguments)]
    pub async fn create_launch_template(
        &self,
        cloud_name: &str,
        image_id: &str,
        instance_type: &str,
        key_name: Option<&str>,
        security_group_id: &str,
        instance_profile: Option<&str>,
        user_data: Option<&str>,
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle, ProviderError> {
        let mut data = RequestLaunchTemplateData::builder()
            .image_id(image_id)
            .instance_type(InstanceType::from(instance_type))
            .security_group_ids(security_group_id);

        if let Some(key) = key_name {
            data = data.key_name(key);
        }
        if let Some(profile) = instance_profile {
            data = data.iam_instance_profile(
                LaunchTemplateIamInstanceProfileSpecificationRequest::builder()
                    .name(profile)
                    .build(),
            );
        }
        if let Some(script) = user_data {
            data = data.user_data(base64::engine::general_purpose::STANDARD.encode(script));
        }

        let resp = self
            .client
            .create_launch_template()
            .launch_template_name(cloud_name)
            .launch_template_data(data.build())
            .tag_specifications(tag_spec(ResourceType::LaunchTemplate, tags))
            .send()
            .await
            .map_err(classify_sdk)?;

        let id = resp
            .launch_template()
            .and_then(|t| t.launch_template_id())
            .ok_or_else(|| missing_field("LaunchTemplateId"))?
            .to_string();
        Ok(ResourceHandle::new(id))
    }

    pub async fn delete_launch_template(&self, id: &str) -> Result<(), ProviderError> {
        self.client
            .delete_launch_template()
            .launch_template_id(id)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }

    // --- AMI resolution ---

    /// Latest Amazon Linux 2023 AMI for `arch` in the region.
    pub async fn latest_al2023_ami(&self, arch: &str) -> Result<String, ProviderError> {
        let resp = self
            .client
            .describe_images()
            .owners("amazon")
            .filters(
                Filter::builder()
                    .name("name")
                    .values(format!("al2023-ami-2023*-{arch}"))
                    .build(),
            )
            .filters(Filter::builder().name("state").values("available").build())
            .filters(
                Filter::builder()
                    .name("architecture")
                    .values(arch)
                    .build(),
            )
            .send()
            .await
            .map_err(classify_sdk)?;

        let image = resp
            .images()
            .iter()
            .max_by(|a, b| a.creation_date().cmp(&b.creation_date()))
            .ok_or_else(|| missing_field("a matching AL2023 image"))?;
        let id = image
            .image_id()
            .ok_or_else(|| missing_field("ImageId"))?
            .to_string();
        info!(image = %id, name = image.name().unwrap_or("unknown"), "Resolved AL2023 AMI");
        Ok(id)
    }
}

/// CPU architecture implied by an instance type. Graviton families carry
/// a `g` after the generation digit, e.g. `t4g` or `m6gd`.
pub fn instance_architecture(instance_type: &str) -> &'static str {
    let family = instance_type.split('.').next().unwrap_or(instance_type);
    let variant: String = family
        .chars()
        .skip_while(|c| !c.is_ascii_digit())
        .skip_while(char::is_ascii_digit)
        .collect();
    if variant.contains('g') {
        "arm64"
    } else {
        "x86_64"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn graviton_families_are_arm64() {
        assert_eq!(instance_architecture("t4g.small"), "arm64");
        assert_eq!(instance_architecture("m6gd.large"), "arm64");
        assert_eq!(instance_architecture("im4gn.xlarge"), "arm64");
    }

    #[test]
    fn other_families_are_x86_64() {
        assert_eq!(instance_architecture("t3.small"), "x86_64");
        assert_eq!(instance_architecture("c5n.xlarge"), "x86_64");
        // GPU families prefix the g before the generation digit.
        assert_eq!(instance_architecture("g4dn.xlarge"), "x86_64");
    }
}
