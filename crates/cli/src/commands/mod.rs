pub mod cycle;
pub mod graph;

use clap::ValueEnum;

/// Where the agent looks up live instances
#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum Source {
    /// Service registry listing
    Registry,
    /// Scheduler pods per workload label
    Cluster,
}

impl Source {
    pub fn as_str(&self) -> &'static str {
        match self {
            Source::Registry => "registry",
            Source::Cluster => "cluster",
        }
    }
}

/// Query pair for an optional source
pub(crate) fn source_query(source: Option<Source>) -> Vec<(&'static str, String)> {
    source
        .map(|s| vec![("source", s.as_str().to_string())])
        .unwrap_or_default()
}
