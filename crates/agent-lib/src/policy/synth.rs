//! Endpoint graph to per-endpoint network policies
//!
//! Each live endpoint gets one default-deny policy selecting it by its
//! address label. Allow rules come from graph edges:
//! - ingress: one rule per predecessor address, any port
//! - egress: one rule per successor (address, port)
//!
//! followed by two fixed egress exceptions, cluster DNS over UDP 53 and the
//! internal service CIDR.

use crate::error::{Result, TopologyError};
use crate::instances::EndpointGraph;
use crate::models::Endpoint;
use k8s_openapi::api::networking::v1::{
    IPBlock, NetworkPolicy, NetworkPolicyEgressRule, NetworkPolicyIngressRule, NetworkPolicyPeer,
    NetworkPolicyPort, NetworkPolicySpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use std::collections::{BTreeMap, BTreeSet};
use tracing::{debug, warn};

pub const DNS_PORT: i32 = 53;

/// Cluster-specific constants baked into every policy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SynthesizerConfig {
    pub namespace: String,
    /// Pod label carrying the pod address, e.g. `ip`
    pub address_label_key: String,
    pub service_cidr: String,
    /// Namespace of the cluster DNS, matched by its `name` label
    pub dns_namespace: String,
    /// Label selecting the DNS pods, as `key=value`
    pub dns_selector: (String, String),
}

impl Default for SynthesizerConfig {
    fn default() -> Self {
        Self {
            namespace: "default".to_string(),
            address_label_key: "ip".to_string(),
            service_cidr: "10.152.183.0/24".to_string(),
            dns_namespace: "kube-system".to_string(),
            dns_selector: ("k8s-app".to_string(), "kube-dns".to_string()),
        }
    }
}

/// Split a `key=value` label selector
pub fn parse_selector(selector: &str) -> Result<(String, String)> {
    match selector.split_once('=') {
        Some((key, value)) if !key.trim().is_empty() && !value.trim().is_empty() => {
            Ok((key.trim().to_string(), value.trim().to_string()))
        }
        _ => Err(TopologyError::parse(
            "label selector",
            format!("expected key=value, got '{}'", selector),
        )),
    }
}

/// One synthesized policy and where it goes
#[derive(Debug, Clone, PartialEq)]
pub struct PolicyDocument {
    pub target: Endpoint,
    pub policy: NetworkPolicy,
    pub file_name: String,
    /// Targets the discovery service; never submitted automatically
    pub is_discovery: bool,
}

impl PolicyDocument {
    pub fn name(&self) -> &str {
        self.policy.metadata.name.as_deref().unwrap_or_default()
    }
}

/// `<address>-<port>-<service>` reduced to characters valid in object names
fn base_name(endpoint: &Endpoint) -> String {
    let raw = format!("{}-{}-{}", endpoint.address, endpoint.port_label(), endpoint.service);
    raw.chars()
        .map(|c| match c {
            'a'..='z' | '0'..='9' | '-' | '.' => c,
            'A'..='Z' => c.to_ascii_lowercase(),
            _ => '-',
        })
        .collect()
}

pub fn policy_name(endpoint: &Endpoint) -> String {
    format!("{}-policy", base_name(endpoint))
}

pub fn policy_file_name(endpoint: &Endpoint) -> String {
    format!("{}-network_policy.yaml", base_name(endpoint))
}

#[derive(Debug, Clone, Default)]
pub struct PolicySynthesizer {
    config: SynthesizerConfig,
}

impl PolicySynthesizer {
    pub fn new(config: SynthesizerConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &SynthesizerConfig {
        &self.config
    }

    /// One document per endpoint graph node, in node order
    pub fn synthesize(
        &self,
        graph: &EndpointGraph,
        discovery_service: &str,
    ) -> Vec<PolicyDocument> {
        let documents: Vec<PolicyDocument> = graph
            .nodes()
            .map(|endpoint| {
                let ingress: BTreeSet<&str> =
                    graph.predecessors(endpoint).map(|p| p.address.as_str()).collect();

                let mut egress: BTreeSet<(&str, u16)> = BTreeSet::new();
                for peer in graph.successors(endpoint) {
                    match peer.port {
                        Some(port) => {
                            egress.insert((peer.address.as_str(), port));
                        }
                        None => warn!(
                            source = %endpoint,
                            peer = %peer,
                            "Peer port disabled, no egress rule can be written"
                        ),
                    }
                }

                PolicyDocument {
                    target: endpoint.clone(),
                    policy: self.policy_for(endpoint, &ingress, &egress),
                    file_name: policy_file_name(endpoint),
                    is_discovery: endpoint.service.eq_ignore_ascii_case(discovery_service),
                }
            })
            .collect();

        debug!(documents = documents.len(), "Synthesized network policies");
        documents
    }

    fn address_selector(&self, address: &str) -> LabelSelector {
        LabelSelector {
            match_labels: Some(BTreeMap::from([(
                self.config.address_label_key.clone(),
                address.to_string(),
            )])),
            ..Default::default()
        }
    }

    fn policy_for(
        &self,
        target: &Endpoint,
        ingress: &BTreeSet<&str>,
        egress: &BTreeSet<(&str, u16)>,
    ) -> NetworkPolicy {
        let ingress_rules = ingress
            .iter()
            .map(|address| NetworkPolicyIngressRule {
                from: Some(vec![NetworkPolicyPeer {
                    pod_selector: Some(self.address_selector(address)),
                    ..Default::default()
                }]),
                ports: None,
            })
            .collect();

        let mut egress_rules: Vec<NetworkPolicyEgressRule> = egress
            .iter()
            .map(|(address, port)| NetworkPolicyEgressRule {
                to: Some(vec![NetworkPolicyPeer {
                    pod_selector: Some(self.address_selector(address)),
                    ..Default::default()
                }]),
                ports: Some(vec![NetworkPolicyPort {
                    port: Some(IntOrString::Int(i32::from(*port))),
                    ..Default::default()
                }]),
            })
            .collect();
        egress_rules.push(self.dns_rule());
        egress_rules.push(self.service_cidr_rule());

        NetworkPolicy {
            metadata: ObjectMeta {
                name: Some(policy_name(target)),
                namespace: Some(self.config.namespace.clone()),
                ..Default::default()
            },
            spec: Some(NetworkPolicySpec {
                pod_selector: self.address_selector(&target.address),
                policy_types: Some(vec!["Ingress".to_string(), "Egress".to_string()]),
                ingress: Some(ingress_rules),
                egress: Some(egress_rules),
            }),
            ..Default::default()
        }
    }

    fn dns_rule(&self) -> NetworkPolicyEgressRule {
        let (key, value) = &self.config.dns_selector;
        NetworkPolicyEgressRule {
            to: Some(vec![NetworkPolicyPeer {
                namespace_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([(
                        "name".to_string(),
                        self.config.dns_namespace.clone(),
                    )])),
                    ..Default::default()
                }),
                pod_selector: Some(LabelSelector {
                    match_labels: Some(BTreeMap::from([(key.clone(), value.clone())])),
                    ..Default::default()
                }),
                ..Default::default()
            }]),
            ports: Some(vec![NetworkPolicyPort {
                port: Some(IntOrString::Int(DNS_PORT)),
                protocol: Some("UDP".to_string()),
                ..Default::default()
            }]),
        }
    }

    fn service_cidr_rule(&self) -> NetworkPolicyEgressRule {
        NetworkPolicyEgressRule {
            to: Some(vec![NetworkPolicyPeer {
                ip_block: Some(IPBlock {
                    cidr: self.config.service_cidr.clone(),
                    except: None,
                }),
                ..Default::default()
            }]),
            ports: None,
        }
    }
}
