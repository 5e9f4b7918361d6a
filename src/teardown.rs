//! Reverse-order stack teardown.
//!
//! A read-only forward pass resolves current identifiers, then resources
//! are deleted dependents-first. Auto-scaling groups are drained to zero
//! and their instances awaited before deletion; a group that will not
//! drain within the poll budget is force-deleted anyway.

use crate::error::{ProviderError, ReconcileError};
use crate::provider::{CloudProvider, Probe};
use crate::retry::with_retry;
use crate::spec::{ResourceKind, Topology};
use crate::wait::{wait_until, PollConfig};
use std::collections::HashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Which resources a teardown touches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TeardownScope {
    /// Only kinds rebuilt by a force-recreate run
    Recreatable,
    /// The whole stack
    Full,
}

impl TeardownScope {
    fn includes(self, kind: ResourceKind) -> bool {
        match self {
            TeardownScope::Recreatable => kind.in_teardown_scope(),
            TeardownScope::Full => true,
        }
    }
}

/// What a teardown pass did, per logical name.
#[derive(Debug, Default)]
pub struct TeardownOutcome {
    pub deleted: Vec<(ResourceKind, String)>,
    /// Resources that were already gone
    pub absent: Vec<String>,
    pub failed: Vec<(String, String)>,
}

/// Delete the topology's resources in reverse dependency order.
pub async fn run_teardown<P: CloudProvider>(
    provider: &P,
    topology: &Topology,
    scope: TeardownScope,
    drain_poll: PollConfig,
    cancel: &CancellationToken,
) -> Result<TeardownOutcome, ReconcileError> {
    topology.validate()?;
    let mut outcome = TeardownOutcome::default();

    // Forward discovery pass: bind identifiers without mutating anything.
    // A spec whose dependency is absent cannot exist either; it is skipped.
    let mut ids: HashMap<String, String> = HashMap::new();
    for layer in topology.layers()? {
        for idx in layer {
            let spec = &topology.specs[idx];
            let lookup = |dep: &str| ids.get(dep).cloned();
            let params = match spec.params.resolve(&lookup) {
                Ok(p) => p,
                Err(dep) => {
                    debug!(spec = %spec.name, dependency = %dep, "Dependency absent, skipping probe");
                    continue;
                }
            };

            let probed = with_retry(
                || provider.probe(spec.kind(), &spec.name, &params),
                &format!("probe {} '{}'", spec.kind(), spec.name),
            )
            .await;

            match probed {
                Ok(Probe::One(handle)) => {
                    ids.insert(spec.name.clone(), handle.id);
                }
                Ok(Probe::Missing) => {}
                Ok(Probe::Many(candidates)) => {
                    warn!(
                        spec = %spec.name,
                        candidates = candidates.len(),
                        "Ambiguous match during teardown, leaving resources in place"
                    );
                    outcome.failed.push((
                        spec.name.clone(),
                        format!("ambiguous match: {} candidates", candidates.len()),
                    ));
                }
                Err(e) => {
                    outcome
                        .failed
                        .push((spec.name.clone(), format!("probe failed: {e}")));
                }
            }
        }
    }

    for idx in topology.reverse_order()? {
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }

        let spec = &topology.specs[idx];
        let kind = spec.kind();
        if !scope.includes(kind) {
            continue;
        }

        let Some(id) = ids.get(&spec.name).cloned() else {
            // A failed probe (ambiguity included) bound no id; the spec is
            // already in `failed` and must not also count as absent.
            if outcome.failed.iter().any(|(name, _)| name == &spec.name) {
                continue;
            }
            debug!(spec = %spec.name, "Already absent");
            outcome.absent.push(spec.name.clone());
            continue;
        };

        if kind == ResourceKind::AutoScalingGroup {
            drain(provider, &spec.name, drain_poll.clone(), cancel).await?;
        }

        info!(kind = %kind, name = %spec.name, id = %id, "Deleting resource");
        match delete_with_recovery(provider, kind, &spec.name, &id, &drain_poll).await {
            Ok(true) => outcome.deleted.push((kind, spec.name.clone())),
            Ok(false) => outcome.absent.push(spec.name.clone()),
            Err(e) => {
                warn!(kind = %kind, name = %spec.name, error = %e, "Deletion failed");
                outcome.failed.push((spec.name.clone(), e.to_string()));
            }
        }
    }

    Ok(outcome)
}

/// Scale the group to zero and wait for its instances to terminate.
/// A timeout is logged and tolerated; cancellation is not.
async fn drain<P: CloudProvider>(
    provider: &P,
    name: &str,
    poll: PollConfig,
    cancel: &CancellationToken,
) -> Result<(), ReconcileError> {
    match with_retry(|| provider.drain_group(name), &format!("drain '{name}'")).await {
        Ok(()) => {}
        Err(e) if e.is_not_found() => return Ok(()),
        Err(e) => {
            warn!(group = %name, error = %e, "Drain request failed, deleting anyway");
            return Ok(());
        }
    }

    let waited = wait_until(
        poll,
        Some(cancel),
        || async {
            let count = provider.group_instance_count(name).await?;
            Ok(count == 0)
        },
        &format!("instances of '{name}' to terminate"),
    )
    .await;

    if let Err(e) = waited {
        if cancel.is_cancelled() {
            return Err(ReconcileError::Cancelled);
        }
        warn!(group = %name, error = %e, "Instances did not drain in time, deleting anyway");
    }
    Ok(())
}

/// Delete `id`, tolerating the already-gone case and retrying once after a
/// short pause when dependents are still detaching.
async fn delete_with_recovery<P: CloudProvider>(
    provider: &P,
    kind: ResourceKind,
    name: &str,
    id: &str,
    poll: &PollConfig,
) -> Result<bool, ProviderError> {
    let attempt = with_retry(
        || provider.delete(kind, id),
        &format!("delete {kind} '{name}'"),
    )
    .await;

    match attempt {
        Ok(()) => Ok(true),
        Err(e) if e.is_not_found() => {
            debug!(kind = %kind, name = %name, "Already deleted");
            Ok(false)
        }
        Err(e) if e.is_dependency_violation() => {
            debug!(kind = %kind, name = %name, "Dependents still attached, retrying once");
            tokio::time::sleep(poll.initial_delay).await;
            match provider.delete(kind, id).await {
                Ok(()) => Ok(true),
                Err(e) if e.is_not_found() => Ok(false),
                Err(e) => Err(e),
            }
        }
        Err(e) => Err(e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ResourceParams, ResourceSpec, ValueRef};
    use crate::testing::MockCloud;
    use std::collections::BTreeMap;
    use std::time::Duration;

    fn scaling_topology() -> Topology {
        Topology::new(
            "test",
            vec![
                ResourceSpec::new(
                    "vpc",
                    ResourceParams::Vpc {
                        cidr_block: "10.0.0.0/16".into(),
                    },
                ),
                ResourceSpec::new(
                    "launch-template",
                    ResourceParams::LaunchTemplate {
                        image_id: "ami-123".into(),
                        instance_type: "t3.small".into(),
                        key_name: None,
                        security_group: ValueRef::literal("sg-1"),
                        instance_profile: None,
                        user_data: None,
                    },
                ),
                ResourceSpec::new(
                    "target-group",
                    ResourceParams::TargetGroup {
                        vpc: ValueRef::to("vpc"),
                        port: 8501,
                        protocol: "HTTP".into(),
                        health_check_path: "/".into(),
                    },
                )
                .depends_on(["vpc"]),
                ResourceSpec::new(
                    "asg",
                    ResourceParams::AutoScalingGroup {
                        launch_template: ValueRef::to("launch-template"),
                        subnets: vec![],
                        target_group: Some(ValueRef::to("target-group")),
                        min_size: 1,
                        max_size: 3,
                        desired_capacity: 2,
                    },
                )
                .depends_on(["launch-template", "target-group"]),
            ],
        )
    }

    async fn populate(cloud: &MockCloud, topology: &Topology) {
        let mut ids: HashMap<String, String> = HashMap::new();
        for layer in topology.layers().unwrap() {
            for idx in layer {
                let spec = &topology.specs[idx];
                let params = spec
                    .params
                    .resolve(&|dep: &str| ids.get(dep).cloned())
                    .unwrap();
                let id = cloud
                    .create_direct(&spec.name, &params, &BTreeMap::new())
                    .await;
                ids.insert(spec.name.clone(), id);
            }
        }
    }

    fn fast_poll() -> PollConfig {
        PollConfig {
            initial_delay: Duration::from_millis(5),
            max_delay: Duration::from_millis(20),
            timeout: Duration::from_millis(500),
            jitter: 0.0,
        }
    }

    #[tokio::test]
    async fn deletes_group_before_launch_template() {
        let cloud = MockCloud::new();
        let topology = scaling_topology();
        populate(&cloud, &topology).await;

        let outcome = run_teardown(
            &cloud,
            &topology,
            TeardownScope::Full,
            fast_poll(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome.failed.is_empty());
        let deletions = cloud.deletions();
        let asg = deletions
            .iter()
            .position(|k| *k == ResourceKind::AutoScalingGroup)
            .unwrap();
        let lt = deletions
            .iter()
            .position(|k| *k == ResourceKind::LaunchTemplate)
            .unwrap();
        assert!(asg < lt);
    }

    #[tokio::test]
    async fn drains_instances_before_deleting_group() {
        let cloud = MockCloud::new();
        let topology = scaling_topology();
        populate(&cloud, &topology).await;
        cloud.set_group_instances("asg", 2);

        let outcome = run_teardown(
            &cloud,
            &topology,
            TeardownScope::Full,
            fast_poll(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome
            .deleted
            .iter()
            .any(|(k, _)| *k == ResourceKind::AutoScalingGroup));
        assert!(!cloud.has_resource(ResourceKind::AutoScalingGroup, "asg"));
    }

    #[tokio::test]
    async fn empty_cloud_is_all_absent() {
        let cloud = MockCloud::new();
        let topology = scaling_topology();

        let outcome = run_teardown(
            &cloud,
            &topology,
            TeardownScope::Full,
            fast_poll(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome.deleted.is_empty());
        assert!(outcome.failed.is_empty());
        assert_eq!(outcome.absent.len(), topology.specs.len());
    }

    #[tokio::test]
    async fn recreatable_scope_leaves_network_alone() {
        let cloud = MockCloud::new();
        let topology = scaling_topology();
        populate(&cloud, &topology).await;

        run_teardown(
            &cloud,
            &topology,
            TeardownScope::Recreatable,
            fast_poll(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(cloud.has_resource(ResourceKind::Vpc, "vpc"));
        assert!(!cloud.has_resource(ResourceKind::LaunchTemplate, "launch-template"));
        assert!(!cloud.has_resource(ResourceKind::AutoScalingGroup, "asg"));
    }

    #[tokio::test]
    async fn ambiguous_probe_is_reported_as_failed_only() {
        let cloud = MockCloud::new();
        let topology = scaling_topology();
        populate(&cloud, &topology).await;
        cloud.make_ambiguous("vpc", &["vpc-1", "vpc-2"]);

        let outcome = run_teardown(
            &cloud,
            &topology,
            TeardownScope::Full,
            fast_poll(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(
            outcome
                .failed
                .iter()
                .filter(|(name, _)| name == "vpc")
                .count(),
            1
        );
        assert!(!outcome.absent.contains(&"vpc".to_string()));
        assert!(cloud.has_resource(ResourceKind::Vpc, "vpc"));
    }

    #[tokio::test]
    async fn dependency_violation_is_retried() {
        let cloud = MockCloud::new();
        let topology = scaling_topology();
        populate(&cloud, &topology).await;

        // First delete of the target group reports attached dependents.
        let probe = cloud
            .probe(
                ResourceKind::TargetGroup,
                "target-group",
                &topology.spec("target-group").unwrap().params,
            )
            .await
            .unwrap();
        let Probe::One(handle) = probe else {
            panic!("target group missing")
        };
        cloud.dependency_violation_once(&handle.id);

        let outcome = run_teardown(
            &cloud,
            &topology,
            TeardownScope::Full,
            fast_poll(),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(outcome.failed.is_empty());
        assert!(!cloud.has_resource(ResourceKind::TargetGroup, "target-group"));
    }
}
