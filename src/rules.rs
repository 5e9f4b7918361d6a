//! Additive ingress-rule synchronization.
//!
//! The desired rule set is treated as a lower bound: missing rules are
//! added, rules present on the group but not in the spec are left alone.
//! Removal is deliberately out of scope; operators may have added rules
//! by hand and the reconciler must not strip them.

use crate::error::ProviderError;
use crate::provider::CloudProvider;
use crate::retry::with_retry;
use crate::spec::AccessRule;
use std::collections::HashSet;
use tracing::{debug, info, warn};

/// Summary of one synchronization pass over a security group.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct RuleSyncOutcome {
    pub added: usize,
    pub already_present: usize,
    /// Rules that could not be added; the pass continues past them
    pub failed: usize,
}

/// Ensure every rule in `desired` exists on `group_id`.
///
/// Per-rule failures are logged and counted but do not abort the pass;
/// only a failure to list the current rules is fatal.
pub async fn synchronize_rules<P: CloudProvider>(
    provider: &P,
    group_id: &str,
    desired: &[AccessRule],
) -> Result<RuleSyncOutcome, ProviderError> {
    let current = with_retry(
        || provider.ingress_rules(group_id),
        &format!("list ingress rules of {group_id}"),
    )
    .await?;
    let current: HashSet<&AccessRule> = current.iter().collect();

    let mut outcome = RuleSyncOutcome::default();
    for rule in desired {
        if current.contains(rule) {
            debug!(group = %group_id, rule = %rule, "Rule already present");
            outcome.already_present += 1;
            continue;
        }

        let added = with_retry(
            || provider.authorize_ingress(group_id, rule),
            &format!("authorize {rule} on {group_id}"),
        )
        .await;

        match added {
            Ok(()) => {
                info!(group = %group_id, rule = %rule, "Added ingress rule");
                outcome.added += 1;
            }
            Err(e) if e.is_already_exists() => {
                // Raced with a concurrent authorization; the rule is there.
                debug!(group = %group_id, rule = %rule, "Rule appeared concurrently");
                outcome.already_present += 1;
            }
            Err(e) => {
                warn!(group = %group_id, rule = %rule, error = %e, "Failed to add ingress rule");
                outcome.failed += 1;
            }
        }
    }

    Ok(outcome)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spec::{ResourceParams, ValueRef};
    use crate::testing::MockCloud;
    use std::collections::BTreeMap;

    async fn security_group(cloud: &MockCloud) -> String {
        let params = ResourceParams::SecurityGroup {
            vpc: ValueRef::literal("vpc-1"),
            description: "app traffic".into(),
        };
        cloud
            .create_direct("security-group", &params, &BTreeMap::new())
            .await
    }

    #[tokio::test]
    async fn adds_only_missing_rules() {
        let cloud = MockCloud::new();
        let group = security_group(&cloud).await;

        // {A, B} already present; desired {B, C} must yield {A, B, C}.
        let rule_a = AccessRule::tcp(22, "0.0.0.0/0");
        let rule_b = AccessRule::tcp(80, "0.0.0.0/0");
        let rule_c = AccessRule::tcp(8501, "0.0.0.0/0");
        cloud.authorize_ingress(&group, &rule_a).await.unwrap();
        cloud.authorize_ingress(&group, &rule_b).await.unwrap();

        let outcome = synchronize_rules(&cloud, &group, &[rule_b.clone(), rule_c.clone()])
            .await
            .unwrap();

        assert_eq!(outcome.added, 1);
        assert_eq!(outcome.already_present, 1);
        assert_eq!(outcome.failed, 0);

        let rules = cloud.ingress_rules(&group).await.unwrap();
        assert_eq!(rules.len(), 3);
        assert!(rules.contains(&rule_a));
        assert!(rules.contains(&rule_b));
        assert!(rules.contains(&rule_c));
    }

    #[tokio::test]
    async fn rerun_adds_nothing() {
        let cloud = MockCloud::new();
        let group = security_group(&cloud).await;
        let desired = vec![AccessRule::tcp(22, "0.0.0.0/0"), AccessRule::tcp(80, "0.0.0.0/0")];

        synchronize_rules(&cloud, &group, &desired).await.unwrap();
        let second = synchronize_rules(&cloud, &group, &desired).await.unwrap();

        assert_eq!(second.added, 0);
        assert_eq!(second.already_present, 2);
    }

    #[tokio::test]
    async fn per_rule_failure_does_not_abort() {
        let cloud = MockCloud::new();
        let group = security_group(&cloud).await;
        cloud.fail_authorize_port(443);

        let desired = vec![AccessRule::tcp(443, "0.0.0.0/0"), AccessRule::tcp(80, "0.0.0.0/0")];
        let outcome = synchronize_rules(&cloud, &group, &desired).await.unwrap();

        assert_eq!(outcome.failed, 1);
        assert_eq!(outcome.added, 1);
    }
}
