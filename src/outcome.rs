//! Per-resource reconciliation outcomes and the run-level report.

use crate::spec::ResourceKind;
use std::collections::BTreeMap;
use std::fmt;

/// Terminal state of one spec after a reconciliation pass.
#[derive(Debug, Clone, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceStatus {
    /// Did not exist; created during this pass
    Created,
    /// Already existed; adopted as-is
    Found,
    /// Creation or probing failed
    Failed,
    /// Never attempted because a dependency failed or the run aborted
    Skipped,
}

impl fmt::Display for ResourceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ResourceStatus::Created => "created",
            ResourceStatus::Found => "found-existing",
            ResourceStatus::Failed => "failed",
            ResourceStatus::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// What one spec resolved to.
#[derive(Debug, Clone, serde::Serialize)]
pub struct ResourceState {
    pub kind: ResourceKind,
    pub name: String,
    pub status: ResourceStatus,
    /// Cloud identifier, when one was resolved (or a sentinel in
    /// best-effort mode)
    pub id: Option<String>,
    /// Extra provider attributes, e.g. the DNS name of a load balancer
    pub attributes: BTreeMap<String, String>,
    /// Failure detail for `Failed` states
    pub error: Option<String>,
}

impl ResourceState {
    pub fn skipped(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self {
            kind,
            name: name.into(),
            status: ResourceStatus::Skipped,
            id: None,
            attributes: BTreeMap::new(),
            error: None,
        }
    }

    pub fn failed(kind: ResourceKind, name: impl Into<String>, error: impl fmt::Display) -> Self {
        Self {
            kind,
            name: name.into(),
            status: ResourceStatus::Failed,
            id: None,
            attributes: BTreeMap::new(),
            error: Some(error.to_string()),
        }
    }

    /// Whether the spec resolved to a usable identifier.
    pub fn is_resolved(&self) -> bool {
        matches!(
            self.status,
            ResourceStatus::Created | ResourceStatus::Found
        ) && self.id.is_some()
    }
}

/// Placeholder identifier recorded for a spec whose dependency failed in
/// best-effort mode.
pub fn sentinel_id(dependency: &str) -> String {
    format!("unresolved-{dependency}")
}

/// Aggregate result of one reconciliation or teardown pass.
#[derive(Debug, Default, serde::Serialize)]
pub struct RunOutcome {
    pub states: Vec<ResourceState>,
    /// Set when a strict-mode run aborted; names the cause
    pub fatal_error: Option<String>,
}

impl RunOutcome {
    pub fn state(&self, name: &str) -> Option<&ResourceState> {
        self.states.iter().find(|s| s.name == name)
    }

    pub fn count(&self, status: ResourceStatus) -> usize {
        self.states.iter().filter(|s| s.status == status).count()
    }

    /// Whether every spec resolved (the pass fully converged).
    pub fn converged(&self) -> bool {
        self.fatal_error.is_none() && self.states.iter().all(ResourceState::is_resolved)
    }

    /// One line per resource, in spec order.
    pub fn report(&self) -> String {
        let mut out = String::new();
        for state in &self.states {
            let line = match state.status {
                ResourceStatus::Created | ResourceStatus::Found => format!(
                    "{:<24} {:<18} {} {}",
                    state.name,
                    state.kind,
                    state.status,
                    state.id.as_deref().unwrap_or("-")
                ),
                ResourceStatus::Skipped => format!(
                    "{:<24} {:<18} skipped (dependency failed)",
                    state.name, state.kind
                ),
                ResourceStatus::Failed => format!(
                    "{:<24} {:<18} failed: {}",
                    state.name,
                    state.kind,
                    state.error.as_deref().unwrap_or("unknown error")
                ),
            };
            out.push_str(&line);
            out.push('\n');
        }
        if let Some(fatal) = &self.fatal_error {
            out.push_str(&format!("\naborted: {fatal}\n"));
        }
        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converged_requires_all_resolved() {
        let mut outcome = RunOutcome::default();
        outcome.states.push(ResourceState {
            kind: ResourceKind::Vpc,
            name: "vpc".into(),
            status: ResourceStatus::Created,
            id: Some("vpc-1".into()),
            attributes: BTreeMap::new(),
            error: None,
        });
        assert!(outcome.converged());

        outcome
            .states
            .push(ResourceState::skipped(ResourceKind::Subnet, "subnet-a"));
        assert!(!outcome.converged());
    }

    #[test]
    fn report_includes_failure_reason() {
        let mut outcome = RunOutcome::default();
        outcome.states.push(ResourceState::failed(
            ResourceKind::LoadBalancer,
            "load-balancer",
            "API error (none): boom",
        ));
        let report = outcome.report();
        assert!(report.contains("failed: API error"));
    }

    #[test]
    fn sentinel_names_the_dependency() {
        assert_eq!(sentinel_id("vpc"), "unresolved-vpc");
    }
}
