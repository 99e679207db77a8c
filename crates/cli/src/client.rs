//! API client for the topoguard agent control surface

use anyhow::{Context, Result};
use reqwest::{Client, Response};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::collections::BTreeMap;
use url::Url;

/// API client for the agent
pub struct ApiClient {
    client: Client,
    base_url: Url,
}

impl ApiClient {
    /// Create a new API client
    pub fn new(base_url: &str) -> Result<Self> {
        // Policy cycles can take a while on large namespaces
        let client = Client::builder()
            .timeout(std::time::Duration::from_secs(300))
            .build()
            .context("Failed to create HTTP client")?;

        let base_url = Url::parse(base_url).context("Invalid agent URL")?;

        Ok(Self { client, base_url })
    }

    fn url(&self, path: &str, query: &[(&str, String)]) -> Result<Url> {
        let mut url = self.base_url.join(path).context("Invalid path")?;
        if !query.is_empty() {
            url.query_pairs_mut()
                .extend_pairs(query.iter().map(|(k, v)| (*k, v.as_str())));
        }
        Ok(url)
    }

    /// Fail on any non-2xx status, surfacing the agent's error message
    async fn check(response: Response) -> Result<Response> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let body = response.text().await.unwrap_or_default();
        let message = serde_json::from_str::<ErrorResponse>(&body)
            .map(|e| e.error)
            .unwrap_or(body);
        anyhow::bail!("API error ({}): {}", status, message);
    }

    /// Make a GET request and decode the JSON body
    pub async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.url(path, query)?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", url))?;

        Self::check(response)
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }

    /// Make a GET request and return the raw body
    pub async fn get_text(&self, path: &str, query: &[(&str, String)]) -> Result<String> {
        let url = self.url(path, query)?;

        let response = self
            .client
            .get(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", url))?;

        Self::check(response)
            .await?
            .text()
            .await
            .context("Failed to read response")
    }

    /// Make a POST request; parameters travel in the query string
    pub async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> Result<T> {
        let url = self.url(path, query)?;

        let response = self
            .client
            .post(url.clone())
            .send()
            .await
            .with_context(|| format!("Failed to send request to {}", url))?;

        Self::check(response)
            .await?
            .json()
            .await
            .context("Failed to parse response")
    }
}

// API response types

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailedTarget {
    pub target: String,
    pub error: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CycleReport {
    pub kind: String,
    pub state: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    pub namespace: String,
    pub dry_run: bool,
    pub generated: Vec<String>,
    pub applied: Vec<String>,
    pub skipped: Vec<String>,
    pub failed: Vec<FailedTarget>,
    pub unpolicied: Vec<String>,
    pub unscheduled: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_error: Option<String>,
    pub cancelled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<String>,
    pub started_at: String,
    pub duration_ms: u64,
}

impl CycleReport {
    /// Every policy that should be enforced was
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty() && !self.cancelled && self.rollback_error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentStatus {
    pub state: String,
    pub namespace: String,
    pub cycle_in_progress: bool,
    pub last_cycle: Option<CycleReport>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyList {
    pub namespace: String,
    pub policies: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CancelResponse {
    pub cancelled: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiscoveryIdentity {
    pub service: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceNode {
    pub label: String,
    pub service: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Edge {
    pub from: String,
    pub to: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UnresolvedReference {
    pub origin: String,
    pub referrer: String,
    pub reference: String,
    pub kind: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceGraph {
    pub discovery: DiscoveryIdentity,
    pub nodes: Vec<ServiceNode>,
    pub edges: Vec<Edge>,
    pub unresolved: Vec<UnresolvedReference>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointNode {
    pub label: String,
    pub group: String,
    pub address: String,
    pub port: Option<u16>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EndpointGraph {
    pub source: String,
    pub nodes: Vec<EndpointNode>,
    pub edges: Vec<Edge>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub instance_counts: BTreeMap<String, usize>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub registry_error: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_url_with_query() {
        let client = ApiClient::new("http://agent:8080/").unwrap();
        let url = client
            .url("apply", &[("source", "cluster".to_string()), ("dry_run", "true".to_string())])
            .unwrap();
        assert_eq!(url.as_str(), "http://agent:8080/apply?source=cluster&dry_run=true");

        let url = client.url("status", &[]).unwrap();
        assert_eq!(url.as_str(), "http://agent:8080/status");
    }

    #[test]
    fn test_invalid_base_url() {
        assert!(ApiClient::new("not a url").is_err());
    }

    #[test]
    fn test_decode_cycle_report() {
        let body = r#"{
            "kind": "apply",
            "state": "enforced",
            "source": "registry",
            "namespace": "default",
            "dry_run": false,
            "generated": ["10.0.0.5-8080-orders-policy"],
            "applied": ["10.0.0.5-8080-orders-policy"],
            "skipped": [],
            "failed": [],
            "unpolicied": [],
            "unscheduled": ["k8n-payments"],
            "cancelled": false,
            "started_at": "2024-05-01T12:00:00Z",
            "duration_ms": 42
        }"#;

        let report: CycleReport = serde_json::from_str(body).unwrap();
        assert_eq!(report.state, "enforced");
        assert!(report.registry_error.is_none());
        assert!(report.rollback_error.is_none());
        assert!(report.is_clean());
        assert_eq!(report.unscheduled, vec!["k8n-payments"]);
    }
}
