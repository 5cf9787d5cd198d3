//! The web-tier stack: one VPC, a public subnet, two web servers behind an
//! internet-facing load balancer.

use serde_json::json;
use stackflow_config::TopologySettings;
use stackflow_engine::{Declaration, OutputSpec, PropValue, ResourceType, Stack};

pub const STACK_NAME: &str = "web-tier";

pub const VPC: &str = "EngineeringVpc";
pub const SUBNET: &str = "PublicSubnet";
pub const SECURITY_GROUP: &str = "WebserversSG";
pub const WEB1: &str = "web1";
pub const WEB2: &str = "web2";
pub const TARGET_GROUP: &str = "EngineeringWebservers";
pub const LOAD_BALANCER: &str = "EngineerLB";
pub const LISTENER: &str = "Listener";
pub const WEB_URL: &str = "WebUrl";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopologyOptions {
    pub vpc_cidr: String,
    pub max_azs: u32,
    /// Only this address may reach port 22
    pub ssh_source_cidr: String,
    pub key_name: String,
    pub instance_type: String,
    pub machine_image: String,
}

impl Default for TopologyOptions {
    fn default() -> Self {
        Self {
            vpc_cidr: "10.0.0.0/18".to_string(),
            max_azs: 2,
            ssh_source_cidr: "71.193.75.29/32".to_string(),
            key_name: "my-key-pair".to_string(),
            instance_type: "t2.micro".to_string(),
            machine_image: "amazon-linux".to_string(),
        }
    }
}

impl TopologyOptions {
    /// Defaults overridden by whatever the settings file sets
    pub fn from_settings(settings: &TopologySettings) -> Self {
        let defaults = Self::default();
        Self {
            vpc_cidr: settings.vpc_cidr.clone().unwrap_or(defaults.vpc_cidr),
            ssh_source_cidr: settings
                .ssh_source_cidr
                .clone()
                .unwrap_or(defaults.ssh_source_cidr),
            key_name: settings.key_name.clone().unwrap_or(defaults.key_name),
            instance_type: settings
                .instance_type
                .clone()
                .unwrap_or(defaults.instance_type),
            ..defaults
        }
    }

    /// First /24 of the VPC range
    fn public_subnet_cidr(&self) -> String {
        let base = self
            .vpc_cidr
            .split_once('/')
            .map_or(self.vpc_cidr.as_str(), |(address, _)| address);
        format!("{}/24", base)
    }
}

fn web_server(id: &str, options: &TopologyOptions) -> Declaration {
    Declaration::new(id, ResourceType::Instance)
        .with_prop("name", id)
        .with_prop("instanceType", options.instance_type.as_str())
        .with_prop("machineImage", options.machine_image.as_str())
        .with_prop("keyName", options.key_name.as_str())
        .with_ref("subnetId", SUBNET, "subnetId")
        .with_prop(
            "securityGroupIds",
            vec![PropValue::reference(SECURITY_GROUP, "groupId")],
        )
}

/// Build the web-tier stack
pub fn web_tier(options: &TopologyOptions) -> Stack {
    Stack::new(STACK_NAME)
        .resource(
            Declaration::new(VPC, ResourceType::Network)
                .with_prop("name", VPC)
                .with_prop("cidr", options.vpc_cidr.as_str())
                .with_prop("maxAzs", i64::from(options.max_azs)),
        )
        .resource(
            Declaration::new(SUBNET, ResourceType::Subnet)
                .with_prop("name", SUBNET)
                .with_prop("cidr", options.public_subnet_cidr())
                .with_prop("mapPublicIpOnLaunch", true)
                .with_ref("vpcId", VPC, "vpcId"),
        )
        .resource(
            Declaration::new(SECURITY_GROUP, ResourceType::SecurityGroup)
                .with_prop("name", SECURITY_GROUP)
                .with_prop("description", "Allow HTTP and SSH")
                .with_prop("allowAllOutbound", true)
                .with_prop(
                    "ingress",
                    PropValue::literal(json!([
                        {
                            "protocol": "tcp",
                            "port": 80,
                            "source": "0.0.0.0/0",
                            "description": "Allow HTTP from anywhere"
                        },
                        {
                            "protocol": "tcp",
                            "port": 22,
                            "source": options.ssh_source_cidr,
                            "description": "Allow SSH from admin address"
                        },
                    ])),
                )
                .with_ref("vpcId", VPC, "vpcId")
                // Rules are attached once the public subnet exists
                .depends_on(SUBNET),
        )
        .resource(web_server(WEB1, options))
        .resource(web_server(WEB2, options))
        .resource(
            Declaration::new(TARGET_GROUP, ResourceType::TargetGroup)
                .with_prop("name", TARGET_GROUP)
                .with_prop("port", 80i64)
                .with_prop("protocol", "HTTP")
                .with_prop("targetType", "instance")
                .with_ref("vpcId", VPC, "vpcId")
                .with_prop(
                    "targets",
                    vec![
                        PropValue::reference(WEB1, "instanceId"),
                        PropValue::reference(WEB2, "instanceId"),
                    ],
                ),
        )
        .resource(
            Declaration::new(LOAD_BALANCER, ResourceType::LoadBalancer)
                .with_prop("name", LOAD_BALANCER)
                .with_prop("internetFacing", true)
                .with_prop("subnets", vec![PropValue::reference(SUBNET, "subnetId")])
                .with_prop(
                    "securityGroups",
                    vec![PropValue::reference(SECURITY_GROUP, "groupId")],
                )
                .depends_on(TARGET_GROUP),
        )
        .resource(
            Declaration::new(LISTENER, ResourceType::Listener)
                .with_prop("name", LISTENER)
                .with_prop("port", 80i64)
                .with_prop("protocol", "HTTP")
                .with_prop("defaultAction", "forward")
                .with_ref("loadBalancerArn", LOAD_BALANCER, "loadBalancerArn")
                .with_ref("targetGroupArn", TARGET_GROUP, "targetGroupArn"),
        )
        .output(
            WEB_URL,
            OutputSpec::new(LOAD_BALANCER, "dnsName")
                .with_description("The URL of the load balancer"),
        )
}
