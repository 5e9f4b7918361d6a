//! Topology-wide reconciliation.
//!
//! Specs run layer by layer in topological order; siblings within a layer
//! run concurrently under a semaphore. Identifiers resolved in earlier
//! layers are bound into dependents' parameters before their tasks spawn.

use crate::config::{FailurePolicy, RunConfig};
use crate::error::ReconcileError;
use crate::materialize::materialize;
use crate::outcome::{sentinel_id, ResourceState, ResourceStatus, RunOutcome};
use crate::provider::CloudProvider;
use crate::rules::synchronize_rules;
use crate::spec::Topology;
use crate::tags::standard_tags;
use crate::teardown::{run_teardown, TeardownScope};
use crate::wait::PollConfig;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

pub struct Orchestrator<P> {
    provider: Arc<P>,
    config: RunConfig,
    cancel: CancellationToken,
}

impl<P: CloudProvider + 'static> Orchestrator<P> {
    pub fn new(provider: Arc<P>, config: RunConfig) -> Self {
        Self {
            provider,
            config,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Converge the whole topology. Returns `Err` only for malformed
    /// topologies; per-resource failures are reported in the outcome.
    pub async fn run(&self, topology: &Topology) -> Result<RunOutcome, ReconcileError> {
        topology.validate()?;
        let layers = topology.layers()?;

        if self.config.force_recreate {
            info!(stack = %topology.stack, "Force recreate: tearing down replaceable resources");
            let teardown = run_teardown(
                self.provider.as_ref(),
                topology,
                TeardownScope::Recreatable,
                PollConfig::with_timeout(Duration::from_secs(300)),
                &self.cancel,
            )
            .await?;
            if !teardown.failed.is_empty() && self.config.policy == FailurePolicy::Strict {
                let (name, reason) = &teardown.failed[0];
                return Ok(RunOutcome {
                    states: topology
                        .specs
                        .iter()
                        .map(|s| ResourceState::skipped(s.kind(), &s.name))
                        .collect(),
                    fatal_error: Some(format!("teardown of '{name}' failed: {reason}")),
                });
            }
        }

        let semaphore = Arc::new(Semaphore::new(self.config.concurrency.max(1)));
        let mut states: HashMap<String, ResourceState> = HashMap::new();
        let mut fatal: Option<String> = None;

        'layers: for layer in layers {
            if self.cancel.is_cancelled() {
                fatal = Some(ReconcileError::Cancelled.to_string());
                break;
            }

            let mut tasks: JoinSet<ResourceState> = JoinSet::new();

            for idx in layer {
                let spec = &topology.specs[idx];

                // Bind dependency identifiers. In strict mode an unresolved
                // dependency skips the spec outright; best-effort substitutes
                // a sentinel and lets the attempt proceed.
                let lookup_strict = |dep: &str| -> Option<String> {
                    states
                        .get(dep)
                        .filter(|s| s.is_resolved())
                        .and_then(|s| s.id.clone())
                };

                let params = match self.config.policy {
                    FailurePolicy::Strict => match spec.params.resolve(&lookup_strict) {
                        Ok(p) => p,
                        Err(dep) => {
                            let err = ReconcileError::DependencyUnresolved {
                                spec: spec.name.clone(),
                                dependency: dep,
                            };
                            warn!(spec = %spec.name, error = %err, "Skipping");
                            states.insert(
                                spec.name.clone(),
                                ResourceState::skipped(spec.kind(), &spec.name),
                            );
                            continue;
                        }
                    },
                    FailurePolicy::BestEffort => {
                        let lookup = |dep: &str| -> Option<String> {
                            Some(lookup_strict(dep).unwrap_or_else(|| {
                                warn!(
                                    spec = %spec.name,
                                    dependency = %dep,
                                    "Dependency unresolved, substituting sentinel"
                                );
                                sentinel_id(dep)
                            }))
                        };
                        spec.params
                            .resolve(&lookup)
                            .unwrap_or_else(|_| spec.params.clone())
                    }
                };

                let provider = self.provider.clone();
                let semaphore = semaphore.clone();
                let cancel = self.cancel.clone();
                let spec = spec.clone();
                let policy = self.config.policy;
                let mut tags = standard_tags(&topology.stack, &spec.name);
                tags.extend(spec.tags.clone());

                tasks.spawn(async move {
                    let _permit = semaphore
                        .acquire_owned()
                        .await
                        .expect("semaphore closed during run");

                    // The token may fire while a task is queued behind the
                    // semaphore; a cancelled task must not probe or create.
                    if cancel.is_cancelled() {
                        return ResourceState::skipped(spec.kind(), &spec.name);
                    }

                    let mut state =
                        materialize(provider.as_ref(), &spec, &params, &tags, policy).await;

                    if state.is_resolved() && !spec.rules.is_empty() {
                        let group_id = state.id.as_deref().unwrap_or_default().to_string();
                        match synchronize_rules(provider.as_ref(), &group_id, &spec.rules).await {
                            Ok(sync) => {
                                info!(
                                    spec = %spec.name,
                                    added = sync.added,
                                    present = sync.already_present,
                                    failed = sync.failed,
                                    "Synchronized ingress rules"
                                );
                            }
                            Err(e) => {
                                if policy == FailurePolicy::Strict {
                                    state = ResourceState::failed(
                                        spec.kind(),
                                        &spec.name,
                                        format!("rule synchronization failed: {e}"),
                                    );
                                } else {
                                    warn!(
                                        spec = %spec.name,
                                        error = %e,
                                        "Rule synchronization failed, continuing"
                                    );
                                }
                            }
                        }
                    }

                    state
                });
            }

            while let Some(joined) = tasks.join_next().await {
                let state = joined.map_err(|e| {
                    ReconcileError::Config(format!("reconciliation task panicked: {e}"))
                })?;

                if state.status == ResourceStatus::Failed {
                    error!(
                        spec = %state.name,
                        error = state.error.as_deref().unwrap_or("unknown"),
                        "Resource failed"
                    );
                    if self.config.policy == FailurePolicy::Strict && fatal.is_none() {
                        fatal = Some(format!(
                            "{} '{}' failed: {}",
                            state.kind,
                            state.name,
                            state.error.as_deref().unwrap_or("unknown error")
                        ));
                    }
                }
                states.insert(state.name.clone(), state);
            }

            if fatal.is_some() {
                break 'layers;
            }
        }

        if fatal.is_none() && self.cancel.is_cancelled() {
            fatal = Some(ReconcileError::Cancelled.to_string());
        }

        // Spec order, with anything never attempted marked skipped.
        let outcome_states = topology
            .specs
            .iter()
            .map(|spec| {
                states
                    .remove(&spec.name)
                    .unwrap_or_else(|| ResourceState::skipped(spec.kind(), &spec.name))
            })
            .collect();

        Ok(RunOutcome {
            states: outcome_states,
            fatal_error: fatal,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ResourceParams, ResourceSpec, ValueRef};
    use crate::testing::MockCloud;

    fn three_spec_topology() -> Topology {
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
                    "subnet-a",
                    ResourceParams::Subnet {
                        vpc: ValueRef::to("vpc"),
                        cidr_block: "10.0.1.0/24".into(),
                        availability_zone: "us-east-1a".into(),
                        map_public_ip: true,
                    },
                )
                .depends_on(["vpc"]),
                ResourceSpec::new(
                    "security-group",
                    ResourceParams::SecurityGroup {
                        vpc: ValueRef::to("vpc"),
                        description: "app traffic".into(),
                    },
                )
                .depends_on(["vpc"]),
            ],
        )
    }

    fn orchestrator(cloud: Arc<MockCloud>, policy: FailurePolicy) -> Orchestrator<MockCloud> {
        let mut config = RunConfig::new("test", "us-east-1");
        config.policy = policy;
        Orchestrator::new(cloud, config)
    }

    #[tokio::test]
    async fn creates_all_and_propagates_identifiers() {
        let cloud = Arc::new(MockCloud::new());
        let topology = three_spec_topology();

        let outcome = orchestrator(cloud.clone(), FailurePolicy::Strict)
            .run(&topology)
            .await
            .unwrap();

        assert!(outcome.converged());
        assert_eq!(outcome.count(ResourceStatus::Created), 3);

        let vpc_id = outcome.state("vpc").unwrap().id.clone().unwrap();
        match cloud.created_with("subnet-a").unwrap() {
            ResourceParams::Subnet { vpc, .. } => {
                assert_eq!(vpc.as_literal(), Some(vpc_id.as_str()));
            }
            other => panic!("unexpected params: {other:?}"),
        }
    }

    #[tokio::test]
    async fn rerun_finds_everything_without_creating() {
        let cloud = Arc::new(MockCloud::new());
        let topology = three_spec_topology();

        orchestrator(cloud.clone(), FailurePolicy::Strict)
            .run(&topology)
            .await
            .unwrap();
        let creates_after_first = cloud.create_calls();

        let second = orchestrator(cloud.clone(), FailurePolicy::Strict)
            .run(&topology)
            .await
            .unwrap();

        assert!(second.converged());
        assert_eq!(second.count(ResourceStatus::Found), 3);
        assert_eq!(cloud.create_calls(), creates_after_first);
    }

    #[tokio::test]
    async fn strict_mode_aborts_and_skips_dependents() {
        let cloud = Arc::new(MockCloud::new());
        cloud.fail_creates_of("vpc");
        let topology = three_spec_topology();

        let outcome = orchestrator(cloud.clone(), FailurePolicy::Strict)
            .run(&topology)
            .await
            .unwrap();

        assert!(outcome.fatal_error.is_some());
        assert_eq!(outcome.state("vpc").unwrap().status, ResourceStatus::Failed);
        assert_eq!(
            outcome.state("subnet-a").unwrap().status,
            ResourceStatus::Skipped
        );
        assert_eq!(
            outcome.state("security-group").unwrap().status,
            ResourceStatus::Skipped
        );
    }

    #[tokio::test]
    async fn best_effort_substitutes_sentinel_and_continues() {
        let cloud = Arc::new(MockCloud::new());
        cloud.fail_creates_of("vpc");
        let topology = three_spec_topology();

        let outcome = orchestrator(cloud.clone(), FailurePolicy::BestEffort)
            .run(&topology)
            .await
            .unwrap();

        assert!(outcome.fatal_error.is_none());
        assert_eq!(outcome.state("vpc").unwrap().status, ResourceStatus::Failed);

        // Dependents still ran, carrying the sentinel identifier.
        assert_eq!(
            outcome.state("subnet-a").unwrap().status,
            ResourceStatus::Created
        );
        match cloud.created_with("subnet-a").unwrap() {
            ResourceParams::Subnet { vpc, .. } => {
                assert_eq!(vpc.as_literal(), Some("unresolved-vpc"));
            }
            other => panic!("unexpected params: {other:?}"),
        }
    }

    #[tokio::test]
    async fn best_effort_sibling_failure_does_not_stop_others() {
        let cloud = Arc::new(MockCloud::new());
        cloud.fail_creates_of("subnet-a");
        let topology = three_spec_topology();

        let outcome = orchestrator(cloud.clone(), FailurePolicy::BestEffort)
            .run(&topology)
            .await
            .unwrap();

        assert_eq!(
            outcome.state("subnet-a").unwrap().status,
            ResourceStatus::Failed
        );
        assert_eq!(
            outcome.state("security-group").unwrap().status,
            ResourceStatus::Created
        );
    }

    #[tokio::test]
    async fn cancellation_skips_remaining_layers() {
        let cloud = Arc::new(MockCloud::new());
        let topology = three_spec_topology();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let outcome = orchestrator(cloud.clone(), FailurePolicy::Strict)
            .with_cancellation(cancel)
            .run(&topology)
            .await
            .unwrap();

        assert!(outcome
            .fatal_error
            .as_deref()
            .unwrap()
            .contains("cancelled"));
        assert_eq!(outcome.count(ResourceStatus::Skipped), 3);
        assert_eq!(cloud.create_calls(), 0);
    }

    #[tokio::test]
    async fn cancellation_mid_layer_skips_queued_siblings() {
        let cloud = Arc::new(MockCloud::new());
        let topology = Topology::new(
            "test",
            vec![
                ResourceSpec::new(
                    "vpc",
                    ResourceParams::Vpc {
                        cidr_block: "10.0.0.0/16".into(),
                    },
                ),
                ResourceSpec::new(
                    "iam-role",
                    ResourceParams::IamRole {
                        managed_policy_arns: vec![],
                    },
                ),
            ],
        );

        // The token fires while the sibling is still queued behind the
        // single permit.
        let cancel = CancellationToken::new();
        cloud.cancel_on_create("vpc", cancel.clone());

        let mut config = RunConfig::new("test", "us-east-1");
        config.policy = FailurePolicy::Strict;
        config.concurrency = 1;
        let outcome = Orchestrator::new(cloud.clone(), config)
            .with_cancellation(cancel)
            .run(&topology)
            .await
            .unwrap();

        assert_eq!(outcome.state("vpc").unwrap().status, ResourceStatus::Created);
        assert_eq!(
            outcome.state("iam-role").unwrap().status,
            ResourceStatus::Skipped
        );
        assert_eq!(cloud.create_calls(), 1);
        assert!(outcome
            .fatal_error
            .as_deref()
            .unwrap()
            .contains("cancelled"));
    }

    #[tokio::test]
    async fn rules_are_synchronized_after_materialization() {
        let cloud = Arc::new(MockCloud::new());
        let mut topology = three_spec_topology();
        topology.specs[2] = topology.specs[2]
            .clone()
            .with_rules([crate::spec::AccessRule::tcp(80, "0.0.0.0/0")]);

        let outcome = orchestrator(cloud.clone(), FailurePolicy::Strict)
            .run(&topology)
            .await
            .unwrap();

        assert!(outcome.converged());
        let group_id = outcome
            .state("security-group")
            .unwrap()
            .id
            .clone()
            .unwrap();
        let rules = cloud.ingress_rules(&group_id).await.unwrap();
        assert_eq!(rules, vec![crate::spec::AccessRule::tcp(80, "0.0.0.0/0")]);
    }
}
