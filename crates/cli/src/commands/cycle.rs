//! Reconciliation cycle commands

use anyhow::Result;
use tabled::Tabled;

use super::{source_query, Source};
use crate::client::{AgentStatus, ApiClient, CancelResponse, CycleReport, PolicyList};
use crate::output::{
    color_state, format_duration, format_timestamp, print_info, print_json, print_success,
    print_table, print_warning, OutputFormat,
};
use colored::Colorize;

/// Row for the per-target outcome table
#[derive(Tabled)]
struct TargetRow {
    #[tabled(rename = "Policy")]
    policy: String,
    #[tabled(rename = "Outcome")]
    outcome: String,
    #[tabled(rename = "Detail")]
    detail: String,
}

fn target_rows(report: &CycleReport) -> Vec<TargetRow> {
    let mut rows = Vec::new();
    for name in &report.applied {
        rows.push(TargetRow {
            policy: name.clone(),
            outcome: "applied".green().to_string(),
            detail: String::new(),
        });
    }
    for name in &report.skipped {
        rows.push(TargetRow {
            policy: name.clone(),
            outcome: "skipped".blue().to_string(),
            detail: "discovery service".to_string(),
        });
    }
    for failed in &report.failed {
        rows.push(TargetRow {
            policy: failed.target.clone(),
            outcome: "failed".red().to_string(),
            detail: failed.error.clone(),
        });
    }
    if report.dry_run {
        for name in &report.generated {
            rows.push(TargetRow {
                policy: name.clone(),
                outcome: "generated".yellow().to_string(),
                detail: String::new(),
            });
        }
    }
    rows
}

fn print_report(report: &CycleReport) {
    println!("Kind:      {}", report.kind);
    println!("State:     {}", color_state(&report.state));
    println!("Namespace: {}", report.namespace);
    if let Some(source) = &report.source {
        println!("Source:    {}", source);
    }
    println!("Started:   {}", format_timestamp(&report.started_at));
    println!("Duration:  {}", format_duration(report.duration_ms));

    if let Some(error) = &report.registry_error {
        print_warning(&format!("Registry unavailable: {}", error));
    }
    if let Some(error) = &report.rollback_error {
        print_warning(&format!("Rollback failed: {}", error));
    }
    if !report.unscheduled.is_empty() {
        print_info(&format!(
            "No live instances for: {}",
            report.unscheduled.join(", ")
        ));
    }

    let rows = target_rows(report);
    if !rows.is_empty() {
        println!();
        print_table(rows, "No policies");
    }
}

/// Fail the command when any target was left without its policy
fn check_report(report: &CycleReport) -> Result<()> {
    if let Some(error) = &report.rollback_error {
        anyhow::bail!(
            "cycle cancelled but rollback failed, {} policies still enforced: {}",
            report.applied.len(),
            error
        );
    }
    if report.cancelled {
        anyhow::bail!(
            "cycle cancelled, {} targets left unpolicied",
            report.unpolicied.len()
        );
    }
    if !report.failed.is_empty() {
        anyhow::bail!(
            "{} of {} policies failed to apply",
            report.failed.len(),
            report.generated.len().saturating_sub(report.skipped.len())
        );
    }
    Ok(())
}

/// Run an apply cycle
pub async fn apply(
    client: &ApiClient,
    source: Option<Source>,
    dry_run: bool,
    format: OutputFormat,
) -> Result<()> {
    let mut query = source_query(source);
    if dry_run {
        query.push(("dry_run", "true".to_string()));
    }

    let report: CycleReport = client.post("apply", &query).await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            print_report(&report);
            if report.dry_run {
                print_warning("Dry-run mode - nothing was enforced");
            } else if report.is_clean() {
                print_success(&format!(
                    "{} policies enforced in namespace {}",
                    report.applied.len(),
                    report.namespace
                ));
            }
        }
    }

    check_report(&report)
}

/// Remove every enforced policy
pub async fn delete(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let report: CycleReport = client.post("delete", &[]).await?;

    match format {
        OutputFormat::Json => print_json(&report)?,
        OutputFormat::Table => {
            print_success(&format!("Policies removed from namespace {}", report.namespace));
            println!("State: {}", color_state(&report.state));
        }
    }

    Ok(())
}

/// Cancel the in-flight cycle
pub async fn cancel(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let response: CancelResponse = client.post("cancel", &[]).await?;

    match format {
        OutputFormat::Json => print_json(&response)?,
        OutputFormat::Table => {
            if response.cancelled {
                print_success("Cancellation requested");
            } else {
                print_warning("No cycle is running");
            }
        }
    }

    Ok(())
}

/// Show reconciler state and the last cycle
pub async fn status(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let status: AgentStatus = client.get("status", &[]).await?;

    match format {
        OutputFormat::Json => print_json(&status)?,
        OutputFormat::Table => {
            println!("State:     {}", color_state(&status.state));
            println!("Namespace: {}", status.namespace);
            if status.cycle_in_progress {
                print_info("A cycle is in progress");
            }
            match &status.last_cycle {
                Some(report) => {
                    println!("\nLast cycle:");
                    print_report(report);
                }
                None => print_info("No cycle has run yet"),
            }
        }
    }

    Ok(())
}

#[derive(Tabled)]
struct PolicyRow {
    #[tabled(rename = "Policy")]
    name: String,
}

/// List the policies the cluster currently enforces
pub async fn policies(client: &ApiClient, format: OutputFormat) -> Result<()> {
    let list: PolicyList = client.get("policies", &[]).await?;

    match format {
        OutputFormat::Json => print_json(&list)?,
        OutputFormat::Table => {
            let total = list.policies.len();
            let rows: Vec<PolicyRow> = list
                .policies
                .into_iter()
                .map(|name| PolicyRow { name })
                .collect();
            print_table(rows, &format!("No policies enforced in namespace {}", list.namespace));
            if total > 0 {
                println!("\nTotal: {} policies in namespace {}", total, list.namespace);
            }
        }
    }

    Ok(())
}
