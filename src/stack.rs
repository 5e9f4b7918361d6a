//! The built-in single-service stack topology.
//!
//! One VPC with two public subnets, an internet-facing load balancer, and
//! an auto-scaling group of instances serving the application port behind
//! a target group. This mirrors the fixed resource graph the deployment
//! pipeline provisions on every run.

use crate::config::StackConfig;
use crate::spec::{AccessRule, ResourceParams, ResourceSpec, Topology, ValueRef};

const VPC_CIDR: &str = "10.0.0.0/16";
const SUBNET_A_CIDR: &str = "10.0.1.0/24";
const SUBNET_B_CIDR: &str = "10.0.2.0/24";
const ANYWHERE: &str = "0.0.0.0/0";

/// Instances register with SSM so no inbound SSH key is strictly needed.
const INSTANCE_POLICY_ARNS: &[&str] =
    &["arn:aws:iam::aws:policy/AmazonSSMManagedInstanceCore"];

fn startup_script(app_port: u16) -> String {
    format!(
        "#!/bin/bash\nset -euo pipefail\ndnf install -y docker\nsystemctl enable --now docker\n\
         docker run -d --restart unless-stopped -p {app_port}:{app_port} \
         --name app \"$(cat /etc/app-image 2>/dev/null || echo public.ecr.aws/docker/library/nginx:latest)\"\n"
    )
}

/// Build the standard topology for `stack` in `region`, launching
/// `image_id` instances.
pub fn standard_topology(
    stack: &str,
    region: &str,
    cfg: &StackConfig,
    image_id: String,
) -> Topology {
    let subnets = || vec![ValueRef::to("subnet-a"), ValueRef::to("subnet-b")];

    let specs = vec![
        ResourceSpec::new(
            "vpc",
            ResourceParams::Vpc {
                cidr_block: VPC_CIDR.into(),
            },
        ),
        ResourceSpec::new(
            "subnet-a",
            ResourceParams::Subnet {
                vpc: ValueRef::to("vpc"),
                cidr_block: SUBNET_A_CIDR.into(),
                availability_zone: format!("{region}a"),
                map_public_ip: true,
            },
        )
        .depends_on(["vpc"]),
        ResourceSpec::new(
            "subnet-b",
            ResourceParams::Subnet {
                vpc: ValueRef::to("vpc"),
                cidr_block: SUBNET_B_CIDR.into(),
                availability_zone: format!("{region}b"),
                map_public_ip: true,
            },
        )
        .depends_on(["vpc"]),
        ResourceSpec::new(
            "internet-gateway",
            ResourceParams::InternetGateway {
                vpc: ValueRef::to("vpc"),
            },
        )
        .depends_on(["vpc"]),
        ResourceSpec::new(
            "route-table",
            ResourceParams::RouteTable {
                vpc: ValueRef::to("vpc"),
                gateway: ValueRef::to("internet-gateway"),
                destination: ANYWHERE.into(),
                subnets: subnets(),
            },
        )
        .depends_on(["vpc", "internet-gateway", "subnet-a", "subnet-b"]),
        ResourceSpec::new(
            "security-group",
            ResourceParams::SecurityGroup {
                vpc: ValueRef::to("vpc"),
                description: format!("{stack} application traffic"),
            },
        )
        .depends_on(["vpc"])
        .with_rules([
            AccessRule::tcp(22, ANYWHERE),
            AccessRule::tcp(80, ANYWHERE),
            AccessRule::tcp(cfg.app_port, ANYWHERE),
        ]),
        ResourceSpec::new(
            "iam-role",
            ResourceParams::IamRole {
                managed_policy_arns: INSTANCE_POLICY_ARNS
                    .iter()
                    .map(|s| s.to_string())
                    .collect(),
            },
        ),
        ResourceSpec::new(
            "instance-profile",
            ResourceParams::InstanceProfile {
                role: ValueRef::to("iam-role"),
            },
        )
        .depends_on(["iam-role"]),
        ResourceSpec::new(
            "launch-template",
            ResourceParams::LaunchTemplate {
                image_id,
                instance_type: cfg.instance_type.clone(),
                key_name: cfg.key_name.clone(),
                security_group: ValueRef::to("security-group"),
                instance_profile: Some(ValueRef::to("instance-profile")),
                user_data: Some(startup_script(cfg.app_port)),
            },
        )
        .depends_on(["security-group", "instance-profile"]),
        ResourceSpec::new(
            "target-group",
            ResourceParams::TargetGroup {
                vpc: ValueRef::to("vpc"),
                port: cfg.app_port,
                protocol: "HTTP".into(),
                health_check_path: "/".into(),
            },
        )
        .depends_on(["vpc"]),
        ResourceSpec::new(
            "load-balancer",
            ResourceParams::LoadBalancer {
                subnets: subnets(),
                security_group: ValueRef::to("security-group"),
            },
        )
        .depends_on(["subnet-a", "subnet-b", "security-group"]),
        ResourceSpec::new(
            "listener",
            ResourceParams::Listener {
                load_balancer: ValueRef::to("load-balancer"),
                target_group: ValueRef::to("target-group"),
                port: 80,
            },
        )
        .depends_on(["load-balancer", "target-group"]),
        ResourceSpec::new(
            "autoscaling-group",
            ResourceParams::AutoScalingGroup {
                launch_template: ValueRef::to("launch-template"),
                subnets: subnets(),
                target_group: Some(ValueRef::to("target-group")),
                min_size: cfg.min_size,
                max_size: cfg.max_size,
                desired_capacity: cfg.desired_capacity,
            },
        )
        .depends_on(["launch-template", "subnet-a", "subnet-b", "target-group"]),
        ResourceSpec::new(
            "scaling-policy",
            ResourceParams::ScalingPolicy {
                group: ValueRef::to("autoscaling-group"),
                target_cpu_percent: 50.0,
            },
        )
        .depends_on(["autoscaling-group"]),
    ];

    Topology::new(stack, specs)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StackConfig;

    #[test]
    fn standard_topology_is_valid() {
        let topology = standard_topology(
            "prod",
            "us-east-1",
            &StackConfig::default(),
            "ami-123".into(),
        );
        topology.validate().unwrap();
        assert_eq!(topology.specs.len(), 14);
    }

    #[test]
    fn network_and_iam_are_roots() {
        let topology = standard_topology(
            "prod",
            "us-east-1",
            &StackConfig::default(),
            "ami-123".into(),
        );
        let layers = topology.layers().unwrap();
        let roots: Vec<&str> = layers[0]
            .iter()
            .map(|&i| topology.specs[i].name.as_str())
            .collect();
        assert_eq!(roots, vec!["vpc", "iam-role"]);
    }

    #[test]
    fn security_group_opens_the_app_port() {
        let mut cfg = StackConfig::default();
        cfg.app_port = 9000;
        let topology = standard_topology("prod", "us-east-1", &cfg, "ami-123".into());
        let sg = topology.spec("security-group").unwrap();
        assert!(sg.rules.contains(&AccessRule::tcp(9000, ANYWHERE)));
    }

    #[test]
    fn scaling_group_comes_after_launch_template() {
        let topology = standard_topology(
            "prod",
            "us-east-1",
            &StackConfig::default(),
            "ami-123".into(),
        );
        let order = topology.reverse_order().unwrap();
        let pos = |name: &str| {
            order
                .iter()
                .position(|&i| topology.specs[i].name == name)
                .unwrap()
        };
        assert!(pos("autoscaling-group") < pos("launch-template"));
        assert!(pos("listener") < pos("load-balancer"));
    }
}
