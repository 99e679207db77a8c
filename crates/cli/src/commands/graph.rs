//! Graph view commands

use anyhow::Result;
use std::collections::BTreeMap;
use tabled::Tabled;

use super::{source_query, Source};
use crate::client::{ApiClient, EndpointGraph, ServiceGraph};
use crate::output::{format_port, print_info, print_json, print_table, print_warning, OutputFormat};

#[derive(Tabled)]
struct ServiceRow {
    #[tabled(rename = "Label")]
    label: String,
    #[tabled(rename = "Service")]
    service: String,
    #[tabled(rename = "Calls")]
    calls: String,
}

#[derive(Tabled)]
struct EndpointRow {
    #[tabled(rename = "Service")]
    service: String,
    #[tabled(rename = "Address")]
    address: String,
    #[tabled(rename = "Port")]
    port: String,
    #[tabled(rename = "Egress To")]
    egress: String,
}

/// Group edge targets by their source node
fn callees(edges: &[crate::client::Edge]) -> BTreeMap<&str, Vec<&str>> {
    let mut out: BTreeMap<&str, Vec<&str>> = BTreeMap::new();
    for edge in edges {
        out.entry(edge.from.as_str()).or_default().push(edge.to.as_str());
    }
    out
}

fn service_rows(graph: &ServiceGraph) -> Vec<ServiceRow> {
    let calls = callees(&graph.edges);
    graph
        .nodes
        .iter()
        .map(|node| {
            let mut label = node.label.clone();
            if node.label == graph.discovery.label {
                label.push_str(" *");
            }
            ServiceRow {
                label,
                service: node.service.clone().unwrap_or_else(|| "-".to_string()),
                calls: calls
                    .get(node.label.as_str())
                    .map(|c| c.join(", "))
                    .unwrap_or_default(),
            }
        })
        .collect()
}

fn endpoint_rows(graph: &EndpointGraph) -> Vec<EndpointRow> {
    let calls = callees(&graph.edges);
    graph
        .nodes
        .iter()
        .map(|node| EndpointRow {
            service: node.group.clone(),
            address: node.address.clone(),
            port: format_port(node.port),
            egress: calls
                .get(node.label.as_str())
                .map(|c| c.join("\n"))
                .unwrap_or_default(),
        })
        .collect()
}

/// Show the static service dependency graph
pub async fn services(client: &ApiClient, dot: bool, format: OutputFormat) -> Result<()> {
    if dot {
        let body = client
            .get_text("graph/services", &[("format", "dot".to_string())])
            .await?;
        print!("{}", body);
        return Ok(());
    }

    let graph: ServiceGraph = client.get("graph/services", &[]).await?;

    match format {
        OutputFormat::Json => print_json(&graph)?,
        OutputFormat::Table => {
            print_table(service_rows(&graph), "No services discovered");
            println!(
                "\n* discovery service {} ({})",
                graph.discovery.service, graph.discovery.label
            );
            for unresolved in &graph.unresolved {
                print_warning(&format!(
                    "{}: {} references unknown service {}",
                    unresolved.origin, unresolved.referrer, unresolved.reference
                ));
            }
        }
    }

    Ok(())
}

/// Show the address-level graph for the current live instances
pub async fn endpoints(
    client: &ApiClient,
    source: Option<Source>,
    dot: bool,
    format: OutputFormat,
) -> Result<()> {
    let mut query = source_query(source);

    if dot {
        query.push(("format", "dot".to_string()));
        let body = client.get_text("graph/endpoints", &query).await?;
        print!("{}", body);
        return Ok(());
    }

    let graph: EndpointGraph = client.get("graph/endpoints", &query).await?;

    match format {
        OutputFormat::Json => print_json(&graph)?,
        OutputFormat::Table => {
            print_table(endpoint_rows(&graph), "No live instances");
            if let Some(error) = &graph.registry_error {
                print_warning(&format!("Registry unavailable: {}", error));
            }
            for (label, count) in &graph.instance_counts {
                print_info(&format!("{}: {} pods", label, count));
            }
        }
    }

    Ok(())
}
