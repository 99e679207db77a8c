//! On-disk policy output directory
//!
//! The directory is cleared at the start of every cycle and holds one YAML
//! document per synthesized policy.

use super::synth::PolicyDocument;
use crate::error::{Result, TopologyError};
use k8s_openapi::api::networking::v1::NetworkPolicy;
use std::path::{Path, PathBuf};
use tracing::debug;

#[derive(Debug, Clone)]
pub struct PolicyStore {
    dir: PathBuf,
}

impl PolicyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Create the directory if needed and remove every file in it
    pub fn clear(&self) -> Result<usize> {
        std::fs::create_dir_all(&self.dir).map_err(|e| TopologyError::io(&self.dir, e))?;

        let mut removed = 0;
        for entry in std::fs::read_dir(&self.dir).map_err(|e| TopologyError::io(&self.dir, e))? {
            let path = entry.map_err(|e| TopologyError::io(&self.dir, e))?.path();
            if path.is_file() {
                std::fs::remove_file(&path).map_err(|e| TopologyError::io(&path, e))?;
                removed += 1;
            }
        }
        debug!(dir = %self.dir.display(), removed = removed, "Cleared policy directory");
        Ok(removed)
    }

    /// Replace the document for this target
    pub fn write(&self, document: &PolicyDocument) -> Result<PathBuf> {
        let path = self.dir.join(&document.file_name);
        if path.exists() {
            std::fs::remove_file(&path).map_err(|e| TopologyError::io(&path, e))?;
        }

        let yaml = serde_yaml::to_string(&document.policy)?;
        std::fs::write(&path, yaml).map_err(|e| TopologyError::io(&path, e))?;
        Ok(path)
    }

    /// Policy files currently in the directory, sorted
    pub fn list(&self) -> Result<Vec<PathBuf>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut files: Vec<PathBuf> = std::fs::read_dir(&self.dir)
            .map_err(|e| TopologyError::io(&self.dir, e))?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.extension().is_some_and(|ext| ext == "yaml"))
            .collect();
        files.sort();
        Ok(files)
    }

    pub fn read(&self, path: &Path) -> Result<NetworkPolicy> {
        let text = std::fs::read_to_string(path).map_err(|e| TopologyError::io(path, e))?;
        Ok(serde_yaml::from_str(&text)?)
    }
}
