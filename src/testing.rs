//! In-memory cloud used by unit and integration tests.
//!
//! `MockCloud` implements [`CloudProvider`] over a mutex-guarded state map
//! and records every mutating call so tests can assert on idempotence and
//! ordering. Failure injection knobs simulate ambiguous probes, creation
//! races, and per-resource API failures.

use crate::error::ProviderError;
use crate::provider::{CloudProvider, Probe, ResourceHandle};
use crate::spec::{AccessRule, ResourceKind, ResourceParams};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone)]
struct MockResource {
    kind: ResourceKind,
    name: String,
    id: String,
    attributes: BTreeMap<String, String>,
    #[allow(dead_code)]
    tags: BTreeMap<String, String>,
}

#[derive(Debug, Default)]
struct Inner {
    resources: Vec<MockResource>,
    rules: HashMap<String, Vec<AccessRule>>,
    next_id: HashMap<ResourceKind, u32>,
    /// Mutating calls in order, e.g. `("create", "vpc", "vpc")`
    calls: Vec<(&'static str, ResourceKind, String)>,
    fail_creates: HashSet<String>,
    ambiguous: HashMap<String, Vec<String>>,
    race_creates: HashSet<String>,
    fail_authorize_ports: HashSet<u16>,
    dependency_violations: HashSet<String>,
    group_instances: HashMap<String, usize>,
    created_params: HashMap<String, ResourceParams>,
    cancel_on_create: Option<(String, CancellationToken)>,
}

/// Deterministic in-memory [`CloudProvider`].
#[derive(Debug, Default)]
pub struct MockCloud {
    inner: Mutex<Inner>,
}

impl MockCloud {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every probe for `name` return multiple candidates.
    pub fn make_ambiguous(&self, name: &str, candidates: &[&str]) {
        let mut inner = self.inner.lock().unwrap();
        inner.ambiguous.insert(
            name.to_string(),
            candidates.iter().map(|s| s.to_string()).collect(),
        );
    }

    /// Fail creation of `name` with a generic API error.
    pub fn fail_creates_of(&self, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .fail_creates
            .insert(name.to_string());
    }

    /// Simulate losing the creation race for `name`: the create call
    /// inserts the resource (as the winner would have) but reports a
    /// duplicate, so only a re-probe can recover the identifier.
    pub fn race_on_create(&self, name: &str) {
        self.inner
            .lock()
            .unwrap()
            .race_creates
            .insert(name.to_string());
    }

    /// Fail `authorize_ingress` for rules targeting `port`.
    pub fn fail_authorize_port(&self, port: u16) {
        self.inner
            .lock()
            .unwrap()
            .fail_authorize_ports
            .insert(port);
    }

    /// Make the first deletion of `id` fail with a dependency violation.
    pub fn dependency_violation_once(&self, id: &str) {
        self.inner
            .lock()
            .unwrap()
            .dependency_violations
            .insert(id.to_string());
    }

    /// Fire `token` as a side effect of creating `name`, simulating an
    /// interrupt arriving while sibling operations are still queued.
    pub fn cancel_on_create(&self, name: &str, token: CancellationToken) {
        self.inner.lock().unwrap().cancel_on_create = Some((name.to_string(), token));
    }

    /// Pretend `name` currently runs `count` instances. Each instance-count
    /// query after a drain terminates one of them.
    pub fn set_group_instances(&self, name: &str, count: usize) {
        self.inner
            .lock()
            .unwrap()
            .group_instances
            .insert(name.to_string(), count);
    }

    pub fn create_calls(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(op, _, _)| *op == "create")
            .count()
    }

    /// Kinds deleted, in call order.
    pub fn deletions(&self) -> Vec<ResourceKind> {
        self.inner
            .lock()
            .unwrap()
            .calls
            .iter()
            .filter(|(op, _, _)| *op == "delete")
            .map(|(_, kind, _)| *kind)
            .collect()
    }

    /// Parameters the most recent successful create of `name` carried.
    pub fn created_with(&self, name: &str) -> Option<ResourceParams> {
        self.inner
            .lock()
            .unwrap()
            .created_params
            .get(name)
            .cloned()
    }

    pub fn has_resource(&self, kind: ResourceKind, name: &str) -> bool {
        self.inner
            .lock()
            .unwrap()
            .resources
            .iter()
            .any(|r| r.kind == kind && r.name == name)
    }

    /// Test-only creation bypassing the materializer.
    pub async fn create_direct(
        &self,
        name: &str,
        params: &ResourceParams,
        tags: &BTreeMap<String, String>,
    ) -> String {
        self.create(name, params, tags)
            .await
            .expect("direct create failed")
            .id
    }

    fn mint_id(inner: &mut Inner, kind: ResourceKind) -> String {
        let counter = inner.next_id.entry(kind).or_insert(0);
        *counter += 1;
        let prefix = match kind {
            ResourceKind::Vpc => "vpc",
            ResourceKind::Subnet => "subnet",
            ResourceKind::InternetGateway => "igw",
            ResourceKind::RouteTable => "rtb",
            ResourceKind::SecurityGroup => "sg",
            ResourceKind::IamRole => "role",
            ResourceKind::InstanceProfile => "profile",
            ResourceKind::LaunchTemplate => "lt",
            ResourceKind::TargetGroup => "tg",
            ResourceKind::LoadBalancer => "lb",
            ResourceKind::Listener => "listener",
            ResourceKind::AutoScalingGroup => "asg",
            ResourceKind::ScalingPolicy => "policy",
        };
        format!("{prefix}-{counter:04}")
    }

    fn insert(inner: &mut Inner, kind: ResourceKind, name: &str, tags: &BTreeMap<String, String>) -> ResourceHandle {
        let id = Self::mint_id(inner, kind);
        let mut attributes = BTreeMap::new();
        if kind == ResourceKind::LoadBalancer {
            attributes.insert("dns_name".to_string(), format!("{name}.elb.local"));
        }
        inner.resources.push(MockResource {
            kind,
            name: name.to_string(),
            id: id.clone(),
            attributes: attributes.clone(),
            tags: tags.clone(),
        });
        if kind == ResourceKind::SecurityGroup {
            inner.rules.entry(id.clone()).or_default();
        }
        ResourceHandle { id, attributes }
    }
}

impl CloudProvider for MockCloud {
    async fn probe(
        &self,
        kind: ResourceKind,
        name: &str,
        _params: &ResourceParams,
    ) -> Result<Probe, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(("probe", kind, name.to_string()));

        if let Some(candidates) = inner.ambiguous.get(name) {
            return Ok(Probe::Many(candidates.clone()));
        }

        let matches: Vec<&MockResource> = inner
            .resources
            .iter()
            .filter(|r| r.kind == kind && r.name == name)
            .collect();
        match matches.as_slice() {
            [] => Ok(Probe::Missing),
            [one] => Ok(Probe::One(ResourceHandle {
                id: one.id.clone(),
                attributes: one.attributes.clone(),
            })),
            many => Ok(Probe::Many(many.iter().map(|r| r.id.clone()).collect())),
        }
    }

    async fn create(
        &self,
        name: &str,
        params: &ResourceParams,
        tags: &BTreeMap<String, String>,
    ) -> Result<ResourceHandle, ProviderError> {
        let kind = params.kind();
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(("create", kind, name.to_string()));

        if inner.fail_creates.contains(name) {
            return Err(ProviderError::Api {
                code: Some("InternalError".into()),
                message: format!("injected create failure for '{name}'"),
            });
        }

        if inner.race_creates.remove(name) {
            Self::insert(&mut inner, kind, name, tags);
            return Err(ProviderError::AlreadyExists);
        }

        if inner
            .resources
            .iter()
            .any(|r| r.kind == kind && r.name == name)
        {
            return Err(ProviderError::AlreadyExists);
        }

        inner
            .created_params
            .insert(name.to_string(), params.clone());
        let handle = Self::insert(&mut inner, kind, name, tags);
        if let Some((trigger, token)) = &inner.cancel_on_create {
            if trigger == name {
                token.cancel();
            }
        }
        Ok(handle)
    }

    async fn delete(&self, kind: ResourceKind, id: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner.calls.push(("delete", kind, id.to_string()));

        if inner.dependency_violations.remove(id) {
            return Err(ProviderError::DependencyViolation(format!(
                "{id} has dependent objects"
            )));
        }

        let before = inner.resources.len();
        inner.resources.retain(|r| !(r.kind == kind && r.id == id));
        if inner.resources.len() == before {
            return Err(ProviderError::NotFound(id.to_string()));
        }
        inner.rules.remove(id);
        Ok(())
    }

    async fn ingress_rules(&self, group_id: &str) -> Result<Vec<AccessRule>, ProviderError> {
        let inner = self.inner.lock().unwrap();
        inner
            .rules
            .get(group_id)
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(group_id.to_string()))
    }

    async fn authorize_ingress(
        &self,
        group_id: &str,
        rule: &AccessRule,
    ) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .calls
            .push(("authorize", ResourceKind::SecurityGroup, group_id.to_string()));

        if inner.fail_authorize_ports.contains(&rule.to_port) {
            return Err(ProviderError::Api {
                code: Some("InternalError".into()),
                message: format!("injected authorize failure for port {}", rule.to_port),
            });
        }

        let rules = inner
            .rules
            .get_mut(group_id)
            .ok_or_else(|| ProviderError::NotFound(group_id.to_string()))?;
        if rules.contains(rule) {
            return Err(ProviderError::AlreadyExists);
        }
        rules.push(rule.clone());
        Ok(())
    }

    async fn drain_group(&self, name: &str) -> Result<(), ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        inner
            .calls
            .push(("drain", ResourceKind::AutoScalingGroup, name.to_string()));
        if !inner
            .resources
            .iter()
            .any(|r| r.kind == ResourceKind::AutoScalingGroup && r.name == name)
        {
            return Err(ProviderError::NotFound(name.to_string()));
        }
        Ok(())
    }

    async fn group_instance_count(&self, name: &str) -> Result<usize, ProviderError> {
        let mut inner = self.inner.lock().unwrap();
        let count = inner.group_instances.entry(name.to_string()).or_insert(0);
        let current = *count;
        *count = count.saturating_sub(1);
        Ok(current)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn probe_distinguishes_missing_one_many() {
        let cloud = MockCloud::new();
        let params = ResourceParams::Vpc {
            cidr_block: "10.0.0.0/16".into(),
        };

        let probe = cloud.probe(ResourceKind::Vpc, "vpc", &params).await.unwrap();
        assert_eq!(probe, Probe::Missing);

        cloud.create("vpc", &params, &BTreeMap::new()).await.unwrap();
        let probe = cloud.probe(ResourceKind::Vpc, "vpc", &params).await.unwrap();
        assert!(matches!(probe, Probe::One(_)));

        cloud.make_ambiguous("vpc", &["vpc-1", "vpc-2"]);
        let probe = cloud.probe(ResourceKind::Vpc, "vpc", &params).await.unwrap();
        assert!(matches!(probe, Probe::Many(_)));
    }

    #[tokio::test]
    async fn duplicate_create_reports_already_exists() {
        let cloud = MockCloud::new();
        let params = ResourceParams::Vpc {
            cidr_block: "10.0.0.0/16".into(),
        };
        cloud.create("vpc", &params, &BTreeMap::new()).await.unwrap();
        let err = cloud
            .create("vpc", &params, &BTreeMap::new())
            .await
            .unwrap_err();
        assert!(err.is_already_exists());
    }

    #[tokio::test]
    async fn delete_of_absent_resource_is_not_found() {
        let cloud = MockCloud::new();
        let err = cloud
            .delete(ResourceKind::Vpc, "vpc-9999")
            .await
            .unwrap_err();
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn drained_group_counts_down() {
        let cloud = MockCloud::new();
        let params = ResourceParams::AutoScalingGroup {
            launch_template: crate::spec::ValueRef::literal("lt-1"),
            subnets: vec![],
            target_group: None,
            min_size: 1,
            max_size: 3,
            desired_capacity: 2,
        };
        cloud.create("asg", &params, &BTreeMap::new()).await.unwrap();
        cloud.set_group_instances("asg", 2);
        cloud.drain_group("asg").await.unwrap();

        assert_eq!(cloud.group_instance_count("asg").await.unwrap(), 2);
        assert_eq!(cloud.group_instance_count("asg").await.unwrap(), 1);
        assert_eq!(cloud.group_instance_count("asg").await.unwrap(), 0);
    }
}
