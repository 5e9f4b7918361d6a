//! The seam between reconciliation logic and the cloud.
//!
//! Everything above this trait is provider-agnostic; the AWS implementation
//! lives in `aws::AwsProvider` and tests substitute an in-memory provider.

use crate::error::ProviderError;
use crate::spec::{AccessRule, ResourceKind, ResourceParams};
use std::collections::BTreeMap;
use std::future::Future;

/// An existing cloud resource, as seen by a probe or create call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceHandle {
    pub id: String,
    /// Secondary outputs (e.g. `dns_name` for a load balancer)
    pub attributes: BTreeMap<String, String>,
}

impl ResourceHandle {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            attributes: BTreeMap::new(),
        }
    }
}

/// Result of probing for a resource by name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Probe {
    /// No resource matched the filter
    Missing,
    /// Exactly one match
    One(ResourceHandle),
    /// More than one match; carries the candidate identifiers
    Many(Vec<String>),
}

/// Cloud operations the reconciler needs.
///
/// Implementations classify their failures into [`ProviderError`] so the
/// materializer can retry transients and recover from creation races.
/// `probe` and `create` receive resolved parameters because some lookups
/// need a dependency identifier (a listener is found via its load
/// balancer's ARN, not by name).
pub trait CloudProvider: Send + Sync {
    /// Look up the resource `name` would have created.
    fn probe(
        &self,
        kind: ResourceKind,
        name: &str,
        params: &ResourceParams,
    ) -> impl Future<Output = Result<Probe, ProviderError>> + Send;

    /// Create the resource. Must fail with [`ProviderError::AlreadyExists`]
    /// when the name is already taken.
    fn create(
        &self,
        name: &str,
        params: &ResourceParams,
        tags: &BTreeMap<String, String>,
    ) -> impl Future<Output = Result<ResourceHandle, ProviderError>> + Send;

    /// Delete by identifier. Deleting an absent resource must fail with
    /// [`ProviderError::NotFound`].
    fn delete(
        &self,
        kind: ResourceKind,
        id: &str,
    ) -> impl Future<Output = Result<(), ProviderError>> + Send;

    /// Current ingress rules of a security group.
    fn ingress_rules(
        &self,
        group_id: &str,
    ) -> impl Future<Output = Result<Vec<AccessRule>, ProviderError>> + Send;

    /// Add one ingress rule. Must fail with
    /// [`ProviderError::AlreadyExists`] when an equivalent rule is present.
    fn authorize_ingress(
        &self,
        group_id: &str,
        rule: &AccessRule,
    ) -> impl Future<Output = Result<(), ProviderError>> + Send;

    /// Scale an auto-scaling group to zero so its instances terminate.
    fn drain_group(&self, name: &str) -> impl Future<Output = Result<(), ProviderError>> + Send;

    /// Number of instances still attached to an auto-scaling group.
    fn group_instance_count(
        &self,
        name: &str,
    ) -> impl Future<Output = Result<usize, ProviderError>> + Send;
}
