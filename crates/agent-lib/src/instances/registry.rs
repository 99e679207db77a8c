//! Live service registry client
//!
//! The registry lists every application and its registered instances as an
//! XML document:
//!
//! ```xml
//! <applications>
//!   <application>
//!     <name>ORDERS</name>
//!     <instance>
//!       <instanceId>orders-7d9f:orders:8080</instanceId>
//!       <app>ORDERS</app>
//!       <ipAddr>10.0.0.5</ipAddr>
//!       <port enabled="true">8080</port>
//!     </instance>
//!   </application>
//! </applications>
//! ```

use crate::error::{Result, TopologyError};
use crate::models::Endpoint;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

/// Default registry listing endpoint
pub const DEFAULT_REGISTRY_URL: &str = "http://localhost:8761/eureka/apps";

/// Source of registry-reported instances
#[async_trait]
pub trait ServiceRegistry: Send + Sync {
    /// All registered instances. The registry's own instances are not included.
    async fn instances(&self) -> Result<Vec<Endpoint>>;
}

#[derive(Debug, Deserialize)]
struct Applications {
    #[serde(rename = "application", default)]
    applications: Vec<Application>,
}

#[derive(Debug, Deserialize)]
struct Application {
    #[serde(rename = "instance", default)]
    instances: Vec<Instance>,
}

#[derive(Debug, Deserialize)]
struct Instance {
    #[serde(rename = "instanceId", default)]
    instance_id: Option<String>,
    #[serde(default)]
    app: Option<String>,
    #[serde(rename = "ipAddr", default)]
    ip_addr: Option<String>,
    #[serde(default)]
    port: Option<PortElement>,
}

#[derive(Debug, Deserialize)]
struct PortElement {
    #[serde(rename = "@enabled", default)]
    enabled: Option<String>,
    #[serde(rename = "$text", default)]
    value: Option<String>,
}

impl PortElement {
    /// Port number, or `None` when the registry marks it disabled
    fn resolve(&self) -> Option<u16> {
        let enabled = self.enabled.as_deref().map_or(true, |v| v.trim() == "true");
        if !enabled {
            return None;
        }
        self.value.as_deref().and_then(|v| v.trim().parse().ok())
    }
}

/// Decode a registry listing into endpoints
///
/// Instances without a port element are skipped with a warning; a disabled
/// port yields an endpoint without a port.
pub fn parse_applications(xml: &str) -> Result<Vec<Endpoint>> {
    let doc: Applications =
        quick_xml::de::from_str(xml).map_err(|e| TopologyError::parse("registry listing", e))?;

    let mut endpoints = Vec::new();
    for instance in doc.applications.into_iter().flat_map(|a| a.instances) {
        let instance_id = instance.instance_id.as_deref().unwrap_or("<unknown>").trim();
        let (Some(app), Some(address)) = (instance.app.as_deref(), instance.ip_addr.as_deref())
        else {
            warn!(
                instance_id = %instance_id,
                "Registry instance without app name or address, skipping"
            );
            continue;
        };
        let Some(port) = instance.port.as_ref() else {
            warn!(instance_id = %instance_id, "No port element for registry instance, skipping");
            continue;
        };

        let endpoint = Endpoint::new(app.trim(), address.trim(), port.resolve());
        debug!(
            instance_id = %instance_id,
            service = %endpoint.service,
            address = %endpoint.address,
            port = %endpoint.port_label(),
            "Registry instance"
        );
        endpoints.push(endpoint);
    }

    Ok(endpoints)
}

/// HTTP client for the registry listing endpoint
#[derive(Debug, Clone)]
pub struct EurekaRegistry {
    client: reqwest::Client,
    url: String,
}

impl EurekaRegistry {
    pub fn new(url: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| TopologyError::RegistryUnavailable(e.to_string()))?;
        Ok(Self {
            client,
            url: url.into(),
        })
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl ServiceRegistry for EurekaRegistry {
    async fn instances(&self) -> Result<Vec<Endpoint>> {
        let response = self
            .client
            .get(&self.url)
            .header(reqwest::header::ACCEPT, "application/xml")
            .send()
            .await
            .map_err(|e| TopologyError::RegistryUnavailable(e.to_string()))?;

        let status = response.status();
        if !status.is_success() {
            return Err(TopologyError::RegistryUnavailable(format!(
                "{} returned {}",
                self.url, status
            )));
        }

        let body = response
            .text()
            .await
            .map_err(|e| TopologyError::RegistryUnavailable(e.to_string()))?;
        parse_applications(&body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LISTING: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<applications>
  <versions__delta>1</versions__delta>
  <apps__hashcode>UP_3_</apps__hashcode>
  <application>
    <name>ORDERS</name>
    <instance>
      <instanceId>orders-1</instanceId>
      <hostName>orders-1.shop</hostName>
      <app>ORDERS</app>
      <ipAddr>10.0.0.5</ipAddr>
      <status>UP</status>
      <port enabled="true">8080</port>
      <securePort enabled="false">443</securePort>
      <metadata>
        <management.port>8080</management.port>
      </metadata>
    </instance>
    <instance>
      <instanceId>orders-2</instanceId>
      <app>ORDERS</app>
      <ipAddr>10.0.0.6</ipAddr>
      <port enabled="false">8080</port>
    </instance>
  </application>
  <application>
    <name>PAYMENTS</name>
    <instance>
      <instanceId>payments-1</instanceId>
      <app>PAYMENTS</app>
      <ipAddr>10.0.0.9</ipAddr>
      <port>9090</port>
    </instance>
    <instance>
      <instanceId>payments-2</instanceId>
      <app>PAYMENTS</app>
      <ipAddr>10.0.0.10</ipAddr>
    </instance>
  </application>
</applications>"#;

    #[test]
    fn test_parse_registry_listing() {
        let endpoints = parse_applications(LISTING).unwrap();

        assert_eq!(
            endpoints,
            vec![
                Endpoint::new("orders", "10.0.0.5", Some(8080)),
                Endpoint::new("orders", "10.0.0.6", None),
                Endpoint::new("payments", "10.0.0.9", Some(9090)),
            ]
        );
    }

    #[test]
    fn test_parse_empty_listing() {
        let endpoints = parse_applications("<applications></applications>").unwrap();
        assert!(endpoints.is_empty());
    }

    #[test]
    fn test_parse_malformed_listing() {
        let err = parse_applications("<applications><application></applications>").unwrap_err();
        assert!(matches!(err, TopologyError::Parse { .. }));
    }

    #[tokio::test]
    async fn test_eureka_registry_fetches_listing() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("GET", "/eureka/apps")
            .with_status(200)
            .with_header("content-type", "application/xml")
            .with_body(LISTING)
            .create_async()
            .await;

        let registry = EurekaRegistry::new(
            format!("{}/eureka/apps", server.url()),
            Duration::from_secs(5),
        )
        .unwrap();
        let endpoints = registry.instances().await.unwrap();

        mock.assert_async().await;
        assert_eq!(endpoints.len(), 3);
    }

    #[tokio::test]
    async fn test_eureka_registry_non_success_is_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/eureka/apps")
            .with_status(503)
            .create_async()
            .await;

        let registry = EurekaRegistry::new(
            format!("{}/eureka/apps", server.url()),
            Duration::from_secs(5),
        )
        .unwrap();
        let err = registry.instances().await.unwrap_err();
        assert!(matches!(err, TopologyError::RegistryUnavailable(_)));
    }
}
