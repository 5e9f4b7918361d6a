//! The resolved-identifier artifact consumed by later pipeline stages.
//!
//! One `KEY=value` line per resolved resource, in spec order, so the file
//! is byte-stable across idempotent re-runs apart from the header.

use crate::outcome::RunOutcome;
use anyhow::{Context, Result};
use chrono::Utc;
use std::fmt::Write as _;
use std::path::Path;
use tracing::info;

/// `subnet-a` becomes `SUBNET_A`.
fn env_key(logical_name: &str) -> String {
    logical_name
        .chars()
        .map(|c| match c {
            'a'..='z' => c.to_ascii_uppercase(),
            'A'..='Z' | '0'..='9' => c,
            _ => '_',
        })
        .collect()
}

/// Render the outcome as an env file.
pub fn render_env(stack: &str, region: &str, outcome: &RunOutcome) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "# Generated by converge at {}", Utc::now().to_rfc3339());
    let _ = writeln!(out, "STACK_NAME={stack}");
    let _ = writeln!(out, "AWS_REGION={region}");

    for state in &outcome.states {
        if !state.is_resolved() {
            continue;
        }
        let key = env_key(&state.name);
        if let Some(id) = &state.id {
            let _ = writeln!(out, "{key}_ID={id}");
        }
        for (attr, value) in &state.attributes {
            let _ = writeln!(out, "{key}_{}={value}", env_key(attr));
        }
    }
    out
}

/// Write the artifact to `path`.
pub fn write_env_file(path: &Path, stack: &str, region: &str, outcome: &RunOutcome) -> Result<()> {
    let contents = render_env(stack, region, outcome);
    std::fs::write(path, contents)
        .with_context(|| format!("Failed to write output file {}", path.display()))?;
    info!(path = %path.display(), "Wrote infrastructure outputs");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::outcome::{ResourceState, ResourceStatus};
    use crate::spec::ResourceKind;
    use std::collections::BTreeMap;

    fn outcome() -> RunOutcome {
        let mut lb_attrs = BTreeMap::new();
        lb_attrs.insert("dns_name".to_string(), "app.elb.local".to_string());
        RunOutcome {
            states: vec![
                ResourceState {
                    kind: ResourceKind::Subnet,
                    name: "subnet-a".into(),
                    status: ResourceStatus::Created,
                    id: Some("subnet-0a1b".into()),
                    attributes: BTreeMap::new(),
                    error: None,
                },
                ResourceState {
                    kind: ResourceKind::LoadBalancer,
                    name: "load-balancer".into(),
                    status: ResourceStatus::Found,
                    id: Some("arn:lb".into()),
                    attributes: lb_attrs,
                    error: None,
                },
                ResourceState::failed(ResourceKind::Listener, "listener", "boom"),
            ],
            fatal_error: None,
        }
    }

    #[test]
    fn renders_resolved_resources_only() {
        let env = render_env("prod", "us-east-1", &outcome());
        assert!(env.contains("STACK_NAME=prod\n"));
        assert!(env.contains("AWS_REGION=us-east-1\n"));
        assert!(env.contains("SUBNET_A_ID=subnet-0a1b\n"));
        assert!(env.contains("LOAD_BALANCER_ID=arn:lb\n"));
        assert!(env.contains("LOAD_BALANCER_DNS_NAME=app.elb.local\n"));
        assert!(!env.contains("LISTENER"));
    }

    #[test]
    fn writes_to_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("infrastructure-output.env");
        write_env_file(&path, "prod", "us-east-1", &outcome()).unwrap();
        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.contains("SUBNET_A_ID=subnet-0a1b"));
    }
}
