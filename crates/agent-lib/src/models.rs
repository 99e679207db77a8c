//! Core data models shared across the pipeline stages

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// A live instance of a service, valid for one reconciliation cycle
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Endpoint {
    pub address: String,
    /// `None` when the registry reports the port as disabled
    pub port: Option<u16>,
    /// Owning service name, always lowercase
    pub service: String,
}

impl Endpoint {
    pub fn new(service: &str, address: impl Into<String>, port: Option<u16>) -> Self {
        Self {
            address: address.into(),
            port,
            service: service.to_lowercase(),
        }
    }

    /// Port as used in object and file names
    pub fn port_label(&self) -> String {
        match self.port {
            Some(port) => port.to_string(),
            None => "na".to_string(),
        }
    }

    /// Stable node label, e.g. `10.0.0.5:8080 - orders`
    pub fn node_label(&self) -> String {
        format!("{}:{} - {}", self.address, self.port_label(), self.service)
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.node_label())
    }
}

/// Where live instances are read from
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InstanceSource {
    /// Service registry listing, plus a scheduler lookup for the registry itself
    #[default]
    Registry,
    /// Scheduler pod listing per workload label
    Cluster,
}

impl fmt::Display for InstanceSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstanceSource::Registry => write!(f, "registry"),
            InstanceSource::Cluster => write!(f, "cluster"),
        }
    }
}

impl FromStr for InstanceSource {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "registry" | "eureka" => Ok(InstanceSource::Registry),
            "cluster" | "k8s" => Ok(InstanceSource::Cluster),
            other => Err(format!("unknown instance source '{}'", other)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_endpoint_lowercases_service() {
        let ep = Endpoint::new("ORDERS", "10.0.0.5", Some(8080));
        assert_eq!(ep.service, "orders");
        assert_eq!(ep.node_label(), "10.0.0.5:8080 - orders");
    }

    #[test]
    fn test_endpoint_disabled_port_label() {
        let ep = Endpoint::new("payments", "10.0.0.9", None);
        assert_eq!(ep.port_label(), "na");
        assert_eq!(ep.to_string(), "10.0.0.9:na - payments");
    }

    #[test]
    fn test_instance_source_parse() {
        assert_eq!("registry".parse::<InstanceSource>(), Ok(InstanceSource::Registry));
        assert_eq!("Cluster".parse::<InstanceSource>(), Ok(InstanceSource::Cluster));
        assert!("dns".parse::<InstanceSource>().is_err());
    }
}
