//! IAM role and instance-profile operations.
//!
//! IAM names are globally unique per account, so roles and profiles are
//! identified by name rather than by a generated id.

use super::error::classify_sdk;
use crate::error::ProviderError;
use crate::provider::{Probe, ResourceHandle};
use aws_sdk_iam::types::Tag;
use aws_sdk_iam::Client;
use std::collections::BTreeMap;
use tracing::debug;

/// Trust policy letting EC2 instances assume the role.
const EC2_ASSUME_ROLE_POLICY: &str = r#"{
  "Version": "2012-10-17",
  "Statement": [
    {
      "Effect": "Allow",
      "Principal": {"Service": "ec2.amazonaws.com"},
      "Action": "sts:AssumeRole"
    }
  ]
}"#;

pub struct IamOps {
    client: Client,
}

fn iam_tags(tags: &BTreeMap<String, String>) -> Result<Vec<Tag>, ProviderError> {
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

impl IamOps {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    pub async fn probe_role(&self, cloud_name: &str) -> Result<Probe, ProviderError> {
        match self.client.get_role().role_name(cloud_name).send().await {
            Ok(resp) => {
                let id = resp
                    .role()
                    .map(|r| r.role_name().to_string())
                    .unwrap_or_else(|| cloud_name.to_string());
                Ok(Probe::One(ResourceHandle::new(id)))
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

    pub async fn create_role(
        &self,
        cloud_name: &str,
        managed_policy_arns: &[String],
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle, ProviderError> {
        self.client
            .create_role()
            .role_name(cloud_name)
            .assume_role_policy_document(EC2_ASSUME_ROLE_POLICY)
            .set_tags(Some(iam_tags(tags)?))
            .send()
            .await
            .map_err(classify_sdk)?;

        for arn in managed_policy_arns {
            self.client
                .attach_role_policy()
                .role_name(cloud_name)
                .policy_arn(arn)
                .send()
                .await
                .map_err(classify_sdk)?;
        }

        Ok(ResourceHandle::new(cloud_name))
    }

    pub async fn delete_role(&self, role_name: &str) -> Result<(), ProviderError> {
        let attached = self
            .client
            .list_attached_role_policies()
            .role_name(role_name)
            .send()
            .await
            .map_err(classify_sdk)?;

        for policy in attached.attached_policies() {
            if let Some(arn) = policy.policy_arn() {
                debug!(role = %role_name, policy = %arn, "Detaching role policy");
                self.client
                    .detach_role_policy()
                    .role_name(role_name)
                    .policy_arn(arn)
                    .send()
                    .await
                    .map_err(classify_sdk)?;
            }
        }

        self.client
            .delete_role()
            .role_name(role_name)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }

    pub async fn probe_instance_profile(&self, cloud_name: &str) -> Result<Probe, ProviderError> {
        match self
            .client
            .get_instance_profile()
            .instance_profile_name(cloud_name)
            .send()
            .await
        {
            Ok(resp) => {
                let id = resp
                    .instance_profile()
                    .map(|p| p.instance_profile_name().to_string())
                    .unwrap_or_else(|| cloud_name.to_string());
                Ok(Probe::One(ResourceHandle::new(id)))
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

    pub async fn create_instance_profile(
        &self,
        cloud_name: &str,
        role_name: &str,
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle, ProviderError> {
        self.client
            .create_instance_profile()
            .instance_profile_name(cloud_name)
            .set_tags(Some(iam_tags(tags)?))
            .send()
            .await
            .map_err(classify_sdk)?;

        self.client
            .add_role_to_instance_profile()
            .instance_profile_name(cloud_name)
            .role_name(role_name)
            .send()
            .await
            .map_err(classify_sdk)?;

        Ok(ResourceHandle::new(cloud_name))
    }

    pub async fn delete_instance_profile(&self, profile_name: &str) -> Result<(), ProviderError> {
        let resp = self
            .client
            .get_instance_profile()
            .instance_profile_name(profile_name)
            .send()
            .await
            .map_err(classify_sdk)?;

        if let Some(profile) = resp.instance_profile() {
            for role in profile.roles() {
                self.client
                    .remove_role_from_instance_profile()
                    .instance_profile_name(profile_name)
                    .role_name(role.role_name())
                    .send()
                    .await
                    .map_err(classify_sdk)?;
            }
        }

        self.client
            .delete_instance_profile()
            .instance_profile_name(profile_name)
            .send()
            .await
            .map_err(classify_sdk)?;
        Ok(())
    }
}
