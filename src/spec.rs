//! Declarative resource specs and the topology they form.
//!
//! A [`Topology`] is an ordered set of [`ResourceSpec`]s whose `depends_on`
//! edges form a DAG. Parameters reference the outputs of dependency specs
//! through [`ValueRef::Ref`] and are bound to concrete identifiers during
//! the reconciliation pass.

use crate::error::ReconcileError;
use std::collections::{BTreeMap, HashMap};
use std::fmt;

/// Kinds of cloud resources the reconciler can converge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ResourceKind {
    Vpc,
    Subnet,
    InternetGateway,
    RouteTable,
    SecurityGroup,
    IamRole,
    InstanceProfile,
    LaunchTemplate,
    TargetGroup,
    LoadBalancer,
    Listener,
    AutoScalingGroup,
    ScalingPolicy,
}

impl ResourceKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ResourceKind::Vpc => "vpc",
            ResourceKind::Subnet => "subnet",
            ResourceKind::InternetGateway => "internet-gateway",
            ResourceKind::RouteTable => "route-table",
            ResourceKind::SecurityGroup => "security-group",
            ResourceKind::IamRole => "iam-role",
            ResourceKind::InstanceProfile => "instance-profile",
            ResourceKind::LaunchTemplate => "launch-template",
            ResourceKind::TargetGroup => "target-group",
            ResourceKind::LoadBalancer => "load-balancer",
            ResourceKind::Listener => "listener",
            ResourceKind::AutoScalingGroup => "autoscaling-group",
            ResourceKind::ScalingPolicy => "scaling-policy",
        }
    }

    /// Kinds removed (and later recreated) by a force-recreate teardown.
    ///
    /// The network layer stays in place; scaling policies are deleted
    /// implicitly with their auto-scaling group.
    pub fn in_teardown_scope(self) -> bool {
        matches!(
            self,
            ResourceKind::AutoScalingGroup
                | ResourceKind::Listener
                | ResourceKind::LoadBalancer
                | ResourceKind::TargetGroup
                | ResourceKind::LaunchTemplate
        )
    }
}

impl fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A parameter value: either a literal, or a deferred reference to the
/// identifier another spec resolves to during the same pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValueRef {
    Literal(String),
    Ref(String),
}

impl ValueRef {
    pub fn literal(value: impl Into<String>) -> Self {
        ValueRef::Literal(value.into())
    }

    /// Reference the resolved identifier of the spec named `spec`.
    pub fn to(spec: impl Into<String>) -> Self {
        ValueRef::Ref(spec.into())
    }

    /// The literal value, if already bound.
    pub fn as_literal(&self) -> Option<&str> {
        match self {
            ValueRef::Literal(s) => Some(s),
            ValueRef::Ref(_) => None,
        }
    }

    fn referenced_spec(&self) -> Option<&str> {
        match self {
            ValueRef::Ref(name) => Some(name),
            ValueRef::Literal(_) => None,
        }
    }

    fn resolve(&self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<ValueRef, String> {
        match self {
            ValueRef::Literal(s) => Ok(ValueRef::Literal(s.clone())),
            ValueRef::Ref(name) => lookup(name)
                .map(ValueRef::Literal)
                .ok_or_else(|| name.clone()),
        }
    }
}

/// One ingress rule that must be present on a security-group-like resource.
///
/// Two rules are equivalent when protocol, port range, and source match;
/// that equivalence is what the synchronizer deduplicates on.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct AccessRule {
    pub protocol: String,
    pub from_port: u16,
    pub to_port: u16,
    /// Source CIDR, e.g. "0.0.0.0/0"
    pub source: String,
}

impl AccessRule {
    /// Single-port TCP rule.
    pub fn tcp(port: u16, source: impl Into<String>) -> Self {
        Self {
            protocol: "tcp".to_string(),
            from_port: port,
            to_port: port,
            source: source.into(),
        }
    }
}

impl fmt::Display for AccessRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {}-{} from {}",
            self.protocol, self.from_port, self.to_port, self.source
        )
    }
}

/// Typed creation parameters, one variant per resource kind.
///
/// Replaces the shell-interpolated JSON of the original deployment scripts;
/// dependency identifiers are carried as [`ValueRef`]s until resolution.
#[derive(Debug, Clone, PartialEq)]
pub enum ResourceParams {
    Vpc {
        cidr_block: String,
    },
    Subnet {
        vpc: ValueRef,
        cidr_block: String,
        availability_zone: String,
        map_public_ip: bool,
    },
    InternetGateway {
        vpc: ValueRef,
    },
    RouteTable {
        vpc: ValueRef,
        gateway: ValueRef,
        /// Destination CIDR routed through the gateway
        destination: String,
        /// Subnets associated with this route table
        subnets: Vec<ValueRef>,
    },
    SecurityGroup {
        vpc: ValueRef,
        description: String,
    },
    IamRole {
        managed_policy_arns: Vec<String>,
    },
    InstanceProfile {
        role: ValueRef,
    },
    LaunchTemplate {
        image_id: String,
        instance_type: String,
        key_name: Option<String>,
        security_group: ValueRef,
        instance_profile: Option<ValueRef>,
        user_data: Option<String>,
    },
    TargetGroup {
        vpc: ValueRef,
        port: u16,
        protocol: String,
        health_check_path: String,
    },
    LoadBalancer {
        subnets: Vec<ValueRef>,
        security_group: ValueRef,
    },
    Listener {
        load_balancer: ValueRef,
        target_group: ValueRef,
        port: u16,
    },
    AutoScalingGroup {
        launch_template: ValueRef,
        subnets: Vec<ValueRef>,
        target_group: Option<ValueRef>,
        min_size: u32,
        max_size: u32,
        desired_capacity: u32,
    },
    ScalingPolicy {
        group: ValueRef,
        target_cpu_percent: f64,
    },
}

impl ResourceParams {
    pub fn kind(&self) -> ResourceKind {
        match self {
            ResourceParams::Vpc { .. } => ResourceKind::Vpc,
            ResourceParams::Subnet { .. } => ResourceKind::Subnet,
            ResourceParams::InternetGateway { .. } => ResourceKind::InternetGateway,
            ResourceParams::RouteTable { .. } => ResourceKind::RouteTable,
            ResourceParams::SecurityGroup { .. } => ResourceKind::SecurityGroup,
            ResourceParams::IamRole { .. } => ResourceKind::IamRole,
            ResourceParams::InstanceProfile { .. } => ResourceKind::InstanceProfile,
            ResourceParams::LaunchTemplate { .. } => ResourceKind::LaunchTemplate,
            ResourceParams::TargetGroup { .. } => ResourceKind::TargetGroup,
            ResourceParams::LoadBalancer { .. } => ResourceKind::LoadBalancer,
            ResourceParams::Listener { .. } => ResourceKind::Listener,
            ResourceParams::AutoScalingGroup { .. } => ResourceKind::AutoScalingGroup,
            ResourceParams::ScalingPolicy { .. } => ResourceKind::ScalingPolicy,
        }
    }

    /// All deferred references carried by these parameters.
    pub fn references(&self) -> Vec<String> {
        let mut refs = Vec::new();
        let mut copy = self.clone();
        copy.visit_refs_mut(&mut |v| {
            if let Some(name) = v.referenced_spec() {
                refs.push(name.to_string());
            }
        });
        refs
    }

    /// Bind every [`ValueRef::Ref`] to the identifier `lookup` supplies.
    ///
    /// On failure returns the name of the first dependency `lookup` could
    /// not resolve.
    pub fn resolve(&self, lookup: &dyn Fn(&str) -> Option<String>) -> Result<Self, String> {
        let mut resolved = self.clone();
        let mut missing: Option<String> = None;
        resolved.visit_refs_mut(&mut |v| {
            if missing.is_some() {
                return;
            }
            match v.resolve(lookup) {
                Ok(bound) => *v = bound,
                Err(dep) => missing = Some(dep),
            }
        });
        match missing {
            Some(dep) => Err(dep),
            None => Ok(resolved),
        }
    }

    fn visit_refs_mut(&mut self, visit: &mut dyn FnMut(&mut ValueRef)) {
        match self {
            ResourceParams::Vpc { .. } | ResourceParams::IamRole { .. } => {}
            ResourceParams::Subnet { vpc, .. }
            | ResourceParams::InternetGateway { vpc }
            | ResourceParams::SecurityGroup { vpc, .. }
            | ResourceParams::TargetGroup { vpc, .. } => visit(vpc),
            ResourceParams::RouteTable {
                vpc,
                gateway,
                subnets,
                ..
            } => {
                visit(vpc);
                visit(gateway);
                subnets.iter_mut().for_each(&mut *visit);
            }
            ResourceParams::InstanceProfile { role } => visit(role),
            ResourceParams::LaunchTemplate {
                security_group,
                instance_profile,
                ..
            } => {
                visit(security_group);
                if let Some(profile) = instance_profile {
                    visit(profile);
                }
            }
            ResourceParams::LoadBalancer {
                subnets,
                security_group,
            } => {
                subnets.iter_mut().for_each(&mut *visit);
                visit(security_group);
            }
            ResourceParams::Listener {
                load_balancer,
                target_group,
                ..
            } => {
                visit(load_balancer);
                visit(target_group);
            }
            ResourceParams::AutoScalingGroup {
                launch_template,
                subnets,
                target_group,
                ..
            } => {
                visit(launch_template);
                subnets.iter_mut().for_each(&mut *visit);
                if let Some(tg) = target_group {
                    visit(tg);
                }
            }
            ResourceParams::ScalingPolicy { group, .. } => visit(group),
        }
    }
}

/// A named, typed declaration of one cloud resource to converge.
#[derive(Debug, Clone)]
pub struct ResourceSpec {
    /// Logical name, unique within the topology (e.g. "subnet-a")
    pub name: String,
    pub params: ResourceParams,
    /// Ingress rules to synchronize after the resource resolves
    pub rules: Vec<AccessRule>,
    /// Names of specs that must resolve before this one
    pub depends_on: Vec<String>,
    /// Extra tags beyond the standard reconciler tags
    pub tags: BTreeMap<String, String>,
}

impl ResourceSpec {
    pub fn new(name: impl Into<String>, params: ResourceParams) -> Self {
        Self {
            name: name.into(),
            params,
            rules: Vec::new(),
            depends_on: Vec::new(),
            tags: BTreeMap::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, deps: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.depends_on = deps.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_rules(mut self, rules: impl IntoIterator<Item = AccessRule>) -> Self {
        self.rules = rules.into_iter().collect();
        self
    }

    pub fn kind(&self) -> ResourceKind {
        self.params.kind()
    }
}

/// An ordered list of specs whose dependency edges form a DAG.
#[derive(Debug, Clone)]
pub struct Topology {
    /// Stack name; prefixes cloud-side resource names and tags
    pub stack: String,
    pub specs: Vec<ResourceSpec>,
}

impl Topology {
    pub fn new(stack: impl Into<String>, specs: Vec<ResourceSpec>) -> Self {
        Self {
            stack: stack.into(),
            specs,
        }
    }

    pub fn spec(&self, name: &str) -> Option<&ResourceSpec> {
        self.specs.iter().find(|s| s.name == name)
    }

    /// Check structural invariants: unique names, known dependencies,
    /// declared references, and acyclicity.
    pub fn validate(&self) -> Result<(), ReconcileError> {
        let mut seen = HashMap::new();
        for (idx, spec) in self.specs.iter().enumerate() {
            if let Some(prev) = seen.insert(spec.name.as_str(), idx) {
                return Err(ReconcileError::Config(format!(
                    "duplicate spec name '{}' (positions {prev} and {idx})",
                    spec.name
                )));
            }
        }

        for spec in &self.specs {
            for dep in &spec.depends_on {
                if dep == &spec.name {
                    return Err(ReconcileError::Config(format!(
                        "spec '{}' depends on itself",
                        spec.name
                    )));
                }
                if !seen.contains_key(dep.as_str()) {
                    return Err(ReconcileError::Config(format!(
                        "spec '{}' depends on unknown spec '{dep}'",
                        spec.name
                    )));
                }
            }
            // Every parameter reference must be a declared dependency so
            // the orchestrator has sequenced it before binding.
            for referenced in spec.params.references() {
                if !spec.depends_on.iter().any(|d| *d == referenced) {
                    return Err(ReconcileError::Config(format!(
                        "spec '{}' references '{referenced}' without depending on it",
                        spec.name
                    )));
                }
            }
        }

        self.layers().map(|_| ())
    }

    /// Group spec indices into topological layers: every spec appears in a
    /// later layer than all of its dependencies. Siblings within a layer
    /// are independent of each other.
    pub fn layers(&self) -> Result<Vec<Vec<usize>>, ReconcileError> {
        let index_of: HashMap<&str, usize> = self
            .specs
            .iter()
            .enumerate()
            .map(|(i, s)| (s.name.as_str(), i))
            .collect();

        let mut indegree = vec![0usize; self.specs.len()];
        let mut dependents: Vec<Vec<usize>> = vec![Vec::new(); self.specs.len()];
        for (i, spec) in self.specs.iter().enumerate() {
            for dep in &spec.depends_on {
                let d = *index_of.get(dep.as_str()).ok_or_else(|| {
                    ReconcileError::Config(format!(
                        "spec '{}' depends on unknown spec '{dep}'",
                        spec.name
                    ))
                })?;
                indegree[i] += 1;
                dependents[d].push(i);
            }
        }

        let mut layers = Vec::new();
        let mut current: Vec<usize> = (0..self.specs.len())
            .filter(|&i| indegree[i] == 0)
            .collect();
        let mut placed = 0usize;

        while !current.is_empty() {
            placed += current.len();
            let mut next = Vec::new();
            for &i in &current {
                for &dep in &dependents[i] {
                    indegree[dep] -= 1;
                    if indegree[dep] == 0 {
                        next.push(dep);
                    }
                }
            }
            next.sort_unstable();
            layers.push(std::mem::replace(&mut current, next));
        }

        if placed != self.specs.len() {
            let stuck: Vec<&str> = (0..self.specs.len())
                .filter(|&i| indegree[i] > 0)
                .map(|i| self.specs[i].name.as_str())
                .collect();
            return Err(ReconcileError::Config(format!(
                "dependency cycle involving: {}",
                stuck.join(", ")
            )));
        }

        Ok(layers)
    }

    /// Spec indices in reverse topological order (dependents first), as
    /// teardown must visit them.
    pub fn reverse_order(&self) -> Result<Vec<usize>, ReconcileError> {
        let mut order: Vec<usize> = self.layers()?.into_iter().flatten().collect();
        order.reverse();
        Ok(order)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vpc_spec() -> ResourceSpec {
        ResourceSpec::new(
            "vpc",
            ResourceParams::Vpc {
                cidr_block: "10.0.0.0/16".into(),
            },
        )
    }

    fn subnet_spec(name: &str) -> ResourceSpec {
        ResourceSpec::new(
            name,
            ResourceParams::Subnet {
                vpc: ValueRef::to("vpc"),
                cidr_block: "10.0.1.0/24".into(),
                availability_zone: "us-east-1a".into(),
                map_public_ip: true,
            },
        )
        .depends_on(["vpc"])
    }

    #[test]
    fn valid_topology_layers() {
        let topology = Topology::new(
            "test",
            vec![vpc_spec(), subnet_spec("subnet-a"), subnet_spec("subnet-b")],
        );
        topology.validate().unwrap();

        let layers = topology.layers().unwrap();
        assert_eq!(layers, vec![vec![0], vec![1, 2]]);
    }

    #[test]
    fn duplicate_names_rejected() {
        let topology = Topology::new("test", vec![vpc_spec(), vpc_spec()]);
        let err = topology.validate().unwrap_err();
        assert!(err.to_string().contains("duplicate"));
    }

    #[test]
    fn unknown_dependency_rejected() {
        let orphan = subnet_spec("subnet-a").depends_on(["no-such-spec"]);
        let topology = Topology::new("test", vec![orphan]);
        let err = topology.validate().unwrap_err();
        assert!(err.to_string().contains("no-such-spec"));
    }

    #[test]
    fn undeclared_reference_rejected() {
        // References "vpc" in params but never declares the dependency.
        let mut spec = subnet_spec("subnet-a");
        spec.depends_on.clear();
        let topology = Topology::new("test", vec![vpc_spec(), spec]);
        let err = topology.validate().unwrap_err();
        assert!(err.to_string().contains("without depending on it"));
    }

    #[test]
    fn cycle_rejected() {
        let a = ResourceSpec::new(
            "a",
            ResourceParams::Vpc {
                cidr_block: "10.0.0.0/16".into(),
            },
        )
        .depends_on(["b"]);
        let b = ResourceSpec::new(
            "b",
            ResourceParams::Vpc {
                cidr_block: "10.1.0.0/16".into(),
            },
        )
        .depends_on(["a"]);

        let topology = Topology::new("test", vec![a, b]);
        let err = topology.validate().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn resolve_binds_references() {
        let params = ResourceParams::Subnet {
            vpc: ValueRef::to("vpc"),
            cidr_block: "10.0.1.0/24".into(),
            availability_zone: "us-east-1a".into(),
            map_public_ip: true,
        };

        let resolved = params
            .resolve(&|name| (name == "vpc").then(|| "vpc-0a1b".to_string()))
            .unwrap();

        match resolved {
            ResourceParams::Subnet { vpc, .. } => {
                assert_eq!(vpc.as_literal(), Some("vpc-0a1b"));
            }
            other => panic!("unexpected params: {other:?}"),
        }
    }

    #[test]
    fn resolve_reports_missing_dependency() {
        let params = ResourceParams::Listener {
            load_balancer: ValueRef::to("load-balancer"),
            target_group: ValueRef::to("target-group"),
            port: 80,
        };

        let missing = params.resolve(&|_| None).unwrap_err();
        assert_eq!(missing, "load-balancer");
    }

    #[test]
    fn references_cover_nested_lists() {
        let params = ResourceParams::LoadBalancer {
            subnets: vec![ValueRef::to("subnet-a"), ValueRef::to("subnet-b")],
            security_group: ValueRef::to("security-group"),
        };
        let refs = params.references();
        assert_eq!(refs, ["subnet-a", "subnet-b", "security-group"]);
    }

    #[test]
    fn reverse_order_puts_dependents_first() {
        let topology = Topology::new("test", vec![vpc_spec(), subnet_spec("subnet-a")]);
        let order = topology.reverse_order().unwrap();
        assert_eq!(order, vec![1, 0]);
    }

    #[test]
    fn access_rule_equivalence() {
        assert_eq!(AccessRule::tcp(22, "0.0.0.0/0"), AccessRule::tcp(22, "0.0.0.0/0"));
        assert_ne!(AccessRule::tcp(22, "0.0.0.0/0"), AccessRule::tcp(22, "10.0.0.0/8"));
    }
}
