//! Artifact documents and the on-disk layout of extracted artifacts
//!
//! Extraction and decompilation happen outside this crate. What lands here is
//! a tree of already-unpacked artifacts:
//!
//! ```text
//! <work_dir>/<image>/jars_decompiled/<jar>/unpacked/**/application.yml
//! <work_dir>/<image>/jars_decompiled/<jar>/decompiled/**/*.java
//! ```
//!
//! with one `<image>` per archive file found in the archive directory.

use crate::error::{Result, TopologyError};
use serde::Deserialize;
use serde_yaml::Value;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Configuration file name inside an unpacked artifact
pub const CONFIG_FILE_NAME: &str = "application.yml";

/// Deployment manifest file name inside a service's `k8s` directory
pub const DEPLOYMENT_FILE_NAME: &str = "deployment.yml";

/// A service configuration document (may hold several YAML documents)
#[derive(Debug, Clone, Default)]
pub struct ConfigDocument {
    docs: Vec<Value>,
}

impl ConfigDocument {
    /// Parse all YAML documents in `text`
    pub fn parse(text: &str) -> Result<Self> {
        let mut docs = Vec::new();
        for document in serde_yaml::Deserializer::from_str(text) {
            let value = Value::deserialize(document)?;
            if !value.is_null() {
                docs.push(value);
            }
        }
        Ok(Self { docs })
    }

    /// `spring.application.name` from the first document declaring it
    pub fn service_name(&self) -> Option<String> {
        self.docs.iter().find_map(|doc| {
            lookup(doc, &["spring", "application", "name"])
                .and_then(Value::as_str)
                .map(|name| name.trim().to_lowercase())
                .filter(|name| !name.is_empty())
        })
    }

    /// Route target ids from `spring.cloud.gateway.routes`, lowercased
    pub fn gateway_routes(&self) -> Vec<String> {
        let mut routes = Vec::new();
        for doc in &self.docs {
            let Some(entries) =
                lookup(doc, &["spring", "cloud", "gateway", "routes"]).and_then(Value::as_sequence)
            else {
                continue;
            };
            for entry in entries {
                if let Some(id) = entry.get("id").and_then(Value::as_str) {
                    routes.push(id.trim().to_lowercase());
                }
            }
        }
        routes
    }
}

/// A deployment manifest paired with a service configuration
#[derive(Debug, Clone)]
pub struct DeploymentManifest {
    doc: Value,
}

impl DeploymentManifest {
    pub fn parse(text: &str) -> Result<Self> {
        let doc = serde_yaml::from_str(text)
            .map_err(|e| TopologyError::parse("deployment manifest", e))?;
        Ok(Self { doc })
    }

    /// Workload label `metadata.labels.<key>`
    pub fn workload_label(&self, key: &str) -> Option<String> {
        lookup(&self.doc, &["metadata", "labels", key])
            .and_then(Value::as_str)
            .map(|label| label.trim().to_string())
            .filter(|label| !label.is_empty())
    }
}

fn lookup<'a>(value: &'a Value, path: &[&str]) -> Option<&'a Value> {
    path.iter().try_fold(value, |current, key| current.get(*key))
}

/// Decompiled source text, read lazily when backed by a file
#[derive(Debug, Clone)]
pub enum SourceText {
    File(PathBuf),
    Inline { name: String, text: String },
}

impl SourceText {
    pub fn name(&self) -> String {
        match self {
            SourceText::File(path) => path.display().to_string(),
            SourceText::Inline { name, .. } => name.clone(),
        }
    }

    pub fn read(&self) -> Result<String> {
        match self {
            SourceText::File(path) => {
                let bytes = std::fs::read(path).map_err(|e| TopologyError::io(path, e))?;
                Ok(String::from_utf8_lossy(&bytes).into_owned())
            }
            SourceText::Inline { text, .. } => Ok(text.clone()),
        }
    }
}

/// One decompiled artifact carrying a configuration document
#[derive(Debug, Clone)]
pub struct ArtifactUnit {
    /// Where the unit came from, e.g. `orders/orders-1.0.jar`
    pub origin: String,
    pub config: ConfigDocument,
    pub sources: Vec<SourceText>,
}

/// Supplier of artifact units to the graph builder
pub trait ArtifactSource: Send + Sync {
    fn units(&self) -> Result<Vec<ArtifactUnit>>;
}

impl ArtifactSource for Vec<ArtifactUnit> {
    fn units(&self) -> Result<Vec<ArtifactUnit>> {
        Ok(self.clone())
    }
}

/// Reads artifact units from the extraction work directory
#[derive(Debug, Clone)]
pub struct DirectoryArtifacts {
    archive_dir: PathBuf,
    work_dir: PathBuf,
}

impl DirectoryArtifacts {
    pub fn new(archive_dir: impl Into<PathBuf>, work_dir: impl Into<PathBuf>) -> Self {
        Self {
            archive_dir: archive_dir.into(),
            work_dir: work_dir.into(),
        }
    }

    /// Image names derived from archive file names (`orders.tar` -> `orders`)
    pub fn image_names(&self) -> Result<Vec<String>> {
        let mut names = Vec::new();
        let entries = std::fs::read_dir(&self.archive_dir)
            .map_err(|e| TopologyError::io(&self.archive_dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| TopologyError::io(&self.archive_dir, e))?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if let Some(stem) = file_name.split('.').next().filter(|s| !s.is_empty()) {
                names.push(stem.to_string());
            }
        }
        names.sort();
        names.dedup();
        Ok(names)
    }

    fn read_jar(&self, image: &str, jar_dir: &Path) -> Result<Option<ArtifactUnit>> {
        let jar_name = jar_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        let unpacked = jar_dir.join("unpacked");
        let config_path = walk_files(&unpacked)?
            .into_iter()
            .find(|p| p.file_name().is_some_and(|n| n == CONFIG_FILE_NAME));
        let Some(config_path) = config_path else {
            debug!(image = %image, jar = %jar_name, "No application.yml in artifact, skipping");
            return Ok(None);
        };

        let text = std::fs::read_to_string(&config_path)
            .map_err(|e| TopologyError::io(&config_path, e))?;
        let config = ConfigDocument::parse(&text)?;

        let sources = walk_files(&jar_dir.join("decompiled"))?
            .into_iter()
            .filter(|p| p.extension().is_some_and(|ext| ext == "java"))
            .map(SourceText::File)
            .collect();

        Ok(Some(ArtifactUnit {
            origin: format!("{}/{}", image, jar_name),
            config,
            sources,
        }))
    }
}

impl ArtifactSource for DirectoryArtifacts {
    fn units(&self) -> Result<Vec<ArtifactUnit>> {
        let mut units = Vec::new();

        for image in self.image_names()? {
            let jars_root = self.work_dir.join(&image).join("jars_decompiled");
            if !jars_root.is_dir() {
                warn!(
                    image = %image,
                    path = %jars_root.display(),
                    "Image has not been extracted, skipping"
                );
                continue;
            }

            let mut jar_dirs: Vec<PathBuf> = std::fs::read_dir(&jars_root)
                .map_err(|e| TopologyError::io(&jars_root, e))?
                .filter_map(|entry| entry.ok().map(|e| e.path()))
                .filter(|p| p.is_dir())
                .collect();
            jar_dirs.sort();

            for jar_dir in jar_dirs {
                match self.read_jar(&image, &jar_dir) {
                    Ok(Some(unit)) => units.push(unit),
                    Ok(None) => {}
                    Err(e) => {
                        warn!(
                            image = %image,
                            path = %jar_dir.display(),
                            error = %e,
                            "Failed to read artifact"
                        );
                    }
                }
            }
        }

        info!(count = units.len(), "Loaded artifact units");
        Ok(units)
    }
}

/// All regular files under `root`, sorted; a missing root yields nothing
pub(crate) fn walk_files(root: &Path) -> Result<Vec<PathBuf>> {
    let mut files = Vec::new();
    if !root.is_dir() {
        return Ok(files);
    }

    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| TopologyError::io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| TopologyError::io(&dir, e))?;
            let file_type = entry.file_type().map_err(|e| TopologyError::io(entry.path(), e))?;
            if file_type.is_dir() {
                pending.push(entry.path());
            } else if file_type.is_file() {
                files.push(entry.path());
            }
        }
    }

    files.sort();
    Ok(files)
}
