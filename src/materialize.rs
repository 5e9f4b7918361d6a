//! Probe-then-create convergence for a single resource.
//!
//! The contract: probe first, create only on a definitive miss, and treat
//! an "already exists" failure during creation as someone else winning the
//! race (re-probe and adopt their resource).

use crate::config::FailurePolicy;
use crate::error::ReconcileError;
use crate::outcome::{ResourceState, ResourceStatus};
use crate::provider::{CloudProvider, Probe, ResourceHandle};
use crate::retry::with_retry;
use crate::spec::{ResourceParams, ResourceSpec};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};

/// Converge one spec: adopt the existing resource or create it.
///
/// `params` must already be resolved; `tags` is the full tag set to stamp
/// on anything created. Failures are captured in the returned state rather
/// than propagated, except that the ambiguity decision respects `policy`.
pub async fn materialize<P: CloudProvider>(
    provider: &P,
    spec: &ResourceSpec,
    params: &ResourceParams,
    tags: &BTreeMap<String, String>,
    policy: FailurePolicy,
) -> ResourceState {
    let kind = spec.kind();

    let probed = with_retry(
        || provider.probe(kind, &spec.name, params),
        &format!("probe {kind} '{}'", spec.name),
    )
    .await;

    match probed {
        Ok(Probe::One(handle)) => {
            info!(kind = %kind, name = %spec.name, id = %handle.id, "Found existing resource");
            return resolved(spec, handle, ResourceStatus::Found);
        }
        Ok(Probe::Many(candidates)) => {
            let err = ReconcileError::AmbiguousMatch {
                kind: kind.as_str(),
                name: spec.name.clone(),
                candidates: candidates.clone(),
            };
            match policy {
                FailurePolicy::Strict => {
                    return ResourceState::failed(kind, &spec.name, err);
                }
                FailurePolicy::BestEffort => {
                    // Deterministic pick so repeated runs adopt the same one.
                    let mut sorted = candidates;
                    sorted.sort();
                    let picked = sorted[0].clone();
                    warn!(
                        kind = %kind,
                        name = %spec.name,
                        picked = %picked,
                        others = sorted.len() - 1,
                        "Ambiguous match, adopting first candidate"
                    );
                    return resolved(spec, ResourceHandle::new(picked), ResourceStatus::Found);
                }
            }
        }
        Ok(Probe::Missing) => {}
        Err(e) => {
            return ResourceState::failed(kind, &spec.name, e);
        }
    }

    debug!(kind = %kind, name = %spec.name, "Absent, creating");
    let created = with_retry(
        || provider.create(&spec.name, params, tags),
        &format!("create {kind} '{}'", spec.name),
    )
    .await;

    match created {
        Ok(handle) => {
            info!(kind = %kind, name = %spec.name, id = %handle.id, "Created resource");
            resolved(spec, handle, ResourceStatus::Created)
        }
        Err(e) if e.is_already_exists() => {
            // Lost a creation race; whoever won owns a resource we can adopt.
            debug!(kind = %kind, name = %spec.name, "Creation raced, re-probing");
            match with_retry(
                || provider.probe(kind, &spec.name, params),
                &format!("re-probe {kind} '{}'", spec.name),
            )
            .await
            {
                Ok(Probe::One(handle)) => {
                    info!(kind = %kind, name = %spec.name, id = %handle.id, "Adopted raced resource");
                    resolved(spec, handle, ResourceStatus::Found)
                }
                Ok(Probe::Many(candidates)) => ResourceState::failed(
                    kind,
                    &spec.name,
                    ReconcileError::AmbiguousMatch {
                        kind: kind.as_str(),
                        name: spec.name.clone(),
                        candidates,
                    },
                ),
                Ok(Probe::Missing) => ResourceState::failed(
                    kind,
                    &spec.name,
                    "creation reported a duplicate but re-probe found nothing",
                ),
                Err(e) => ResourceState::failed(kind, &spec.name, e),
            }
        }
        Err(e) => ResourceState::failed(kind, &spec.name, e),
    }
}

fn resolved(spec: &ResourceSpec, handle: ResourceHandle, status: ResourceStatus) -> ResourceState {
    ResourceState {
        kind: spec.kind(),
        name: spec.name.clone(),
        status,
        id: Some(handle.id),
        attributes: handle.attributes,
        error: None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::ResourceParams;
    use crate::testing::MockCloud;

    fn vpc_spec() -> ResourceSpec {
        ResourceSpec::new(
            "vpc",
            ResourceParams::Vpc {
                cidr_block: "10.0.0.0/16".into(),
            },
        )
    }

    #[tokio::test]
    async fn creates_when_absent_then_finds_on_rerun() {
        let cloud = MockCloud::new();
        let spec = vpc_spec();
        let tags = BTreeMap::new();

        let first =
            materialize(&cloud, &spec, &spec.params, &tags, FailurePolicy::Strict).await;
        assert_eq!(first.status, ResourceStatus::Created);
        let id = first.id.clone().unwrap();

        let second =
            materialize(&cloud, &spec, &spec.params, &tags, FailurePolicy::Strict).await;
        assert_eq!(second.status, ResourceStatus::Found);
        assert_eq!(second.id.as_deref(), Some(id.as_str()));
        assert_eq!(cloud.create_calls(), 1);
    }

    #[tokio::test]
    async fn creation_race_recovers_by_reprobe() {
        let cloud = MockCloud::new();
        cloud.race_on_create("vpc");
        let spec = vpc_spec();

        let state = materialize(
            &cloud,
            &spec,
            &spec.params,
            &BTreeMap::new(),
            FailurePolicy::Strict,
        )
        .await;

        assert_eq!(state.status, ResourceStatus::Found);
        assert!(state.id.is_some());
    }

    #[tokio::test]
    async fn ambiguity_fails_in_strict_mode() {
        let cloud = MockCloud::new();
        cloud.make_ambiguous("vpc", &["vpc-1", "vpc-2"]);
        let spec = vpc_spec();

        let state = materialize(
            &cloud,
            &spec,
            &spec.params,
            &BTreeMap::new(),
            FailurePolicy::Strict,
        )
        .await;

        assert_eq!(state.status, ResourceStatus::Failed);
        assert!(state.error.unwrap().contains("ambiguous"));
    }

    #[tokio::test]
    async fn ambiguity_adopts_first_in_best_effort_mode() {
        let cloud = MockCloud::new();
        cloud.make_ambiguous("vpc", &["vpc-2", "vpc-1"]);
        let spec = vpc_spec();

        let state = materialize(
            &cloud,
            &spec,
            &spec.params,
            &BTreeMap::new(),
            FailurePolicy::BestEffort,
        )
        .await;

        assert_eq!(state.status, ResourceStatus::Found);
        assert_eq!(state.id.as_deref(), Some("vpc-1"));
    }

    #[tokio::test]
    async fn create_failure_is_captured() {
        let cloud = MockCloud::new();
        cloud.fail_creates_of("vpc");
        let spec = vpc_spec();

        let state = materialize(
            &cloud,
            &spec,
            &spec.params,
            &BTreeMap::new(),
            FailurePolicy::Strict,
        )
        .await;

        assert_eq!(state.status, ResourceStatus::Failed);
        assert!(state.error.is_some());
    }
}
