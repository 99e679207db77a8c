//! Error taxonomy for topology discovery and policy enforcement

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised by the discovery, resolution and reconciliation stages
#[derive(Debug, Error)]
pub enum TopologyError {
    /// A configured archive directory or decompiler path does not exist
    #[error("required artifact path does not exist: {}", path.display())]
    MissingArtifact { path: PathBuf },

    /// A route or client-binding target names a service absent from the identity mapping
    #[error("service '{reference}' referenced by '{referrer}' has no workload label")]
    UnresolvedIdentity { referrer: String, reference: String },

    /// The live service registry could not be queried
    #[error("service registry unavailable: {0}")]
    RegistryUnavailable(String),

    /// A scheduler query failed
    #[error("cluster query failed: {0}")]
    Cluster(String),

    /// The cluster rejected a policy submission
    #[error("failed to apply policy for {target}: {reason}")]
    ApplyFailure { target: String, reason: String },

    /// A configuration, registry or scheduler document could not be decoded
    #[error("failed to parse {what}: {reason}")]
    Parse { what: String, reason: String },

    #[error("I/O error on {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Another reconciliation cycle is already running
    #[error("a reconciliation cycle is already in progress")]
    CycleInProgress,

    /// The task driving a cycle panicked or was aborted
    #[error("reconciliation task ended abnormally: {0}")]
    CycleAborted(String),
}

impl TopologyError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub(crate) fn parse(what: impl Into<String>, reason: impl ToString) -> Self {
        Self::Parse {
            what: what.into(),
            reason: reason.to_string(),
        }
    }
}

impl From<serde_yaml::Error> for TopologyError {
    fn from(e: serde_yaml::Error) -> Self {
        TopologyError::parse("YAML document", e)
    }
}

pub type Result<T, E = TopologyError> = std::result::Result<T, E>;
