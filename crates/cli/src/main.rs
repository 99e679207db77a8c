//! topoguard CLI
//!
//! Drives the agent's control surface: run and cancel policy cycles,
//! inspect reconciler state, and render the discovered topology.

mod client;
mod commands;
mod config;
mod output;

use anyhow::Result;
use clap::{Parser, Subcommand};
use commands::{cycle, graph, Source};

/// topoguard CLI
#[derive(Parser)]
#[command(name = "tg")]
#[command(author, version, about = "CLI for the topoguard network policy agent", long_about = None)]
pub struct Cli {
    /// Agent URL (falls back to ~/.config/topoguard/config.json, then http://localhost:8080)
    #[arg(long, env = "TOPOGUARD_AGENT_URL")]
    pub agent_url: Option<String>,

    /// Output format
    #[arg(long, short, default_value = "table")]
    pub format: output::OutputFormat,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Synthesize and enforce policies for every live endpoint
    Apply {
        /// Instance source (agent default if not specified)
        #[arg(long, value_enum)]
        source: Option<Source>,

        /// Write policy documents without enforcing them
        #[arg(long)]
        dry_run: bool,
    },

    /// Remove every enforced policy from the namespace
    Delete,

    /// Cancel the running cycle
    Cancel,

    /// Show reconciler state and the last cycle report
    Status,

    /// List the policies enforced in the namespace
    Policies,

    /// Inspect the discovered topology
    #[command(subcommand)]
    Graph(GraphCommands),
}

#[derive(Subcommand)]
pub enum GraphCommands {
    /// Static service dependency graph
    Services {
        /// Print Graphviz DOT instead
        #[arg(long)]
        dot: bool,
    },

    /// Address-level graph over live instances
    Endpoints {
        /// Instance source (agent default if not specified)
        #[arg(long, value_enum)]
        source: Option<Source>,

        /// Print Graphviz DOT instead
        #[arg(long)]
        dot: bool,
    },
}

async fn run(cli: Cli) -> Result<()> {
    let agent_url = config::resolve_agent_url(cli.agent_url)?;
    let client = client::ApiClient::new(&agent_url)?;

    match cli.command {
        Commands::Apply { source, dry_run } => {
            cycle::apply(&client, source, dry_run, cli.format).await?;
        }
        Commands::Delete => cycle::delete(&client, cli.format).await?,
        Commands::Cancel => cycle::cancel(&client, cli.format).await?,
        Commands::Status => cycle::status(&client, cli.format).await?,
        Commands::Policies => cycle::policies(&client, cli.format).await?,
        Commands::Graph(graph_cmd) => match graph_cmd {
            GraphCommands::Services { dot } => graph::services(&client, dot, cli.format).await?,
            GraphCommands::Endpoints { source, dot } => {
                graph::endpoints(&client, source, dot, cli.format).await?;
            }
        },
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    if let Err(e) = run(cli).await {
        output::print_error(&format!("{:#}", e));
        std::process::exit(1);
    }
}
