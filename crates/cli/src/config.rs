//! Configuration management for the CLI

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const DEFAULT_AGENT_URL: &str = "http://localhost:8080";

/// CLI configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    /// Agent control surface URL
    pub agent_url: Option<String>,
}

impl Config {
    /// Load configuration from the default file, if present
    pub fn load() -> Result<Self> {
        Self::load_from_home(dirs_next::home_dir().as_deref())
    }

    /// Defaults when there is no home directory to read from
    fn load_from_home(home: Option<&Path>) -> Result<Self> {
        match home {
            Some(home) => Self::load_from(&Self::config_path(home)),
            None => Ok(Self::default()),
        }
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).context("Failed to read config file")?;

        serde_json::from_str(&content).context("Failed to parse config file")
    }

    fn config_path(home: &Path) -> PathBuf {
        home.join(".config").join("topoguard").join("config.json")
    }
}

/// Flag (or `TOPOGUARD_AGENT_URL`), then the config file, then the default
pub fn resolve_agent_url(flag: Option<String>) -> Result<String> {
    resolve_with(flag, Config::load)
}

fn resolve_with(flag: Option<String>, load: impl FnOnce() -> Result<Config>) -> Result<String> {
    if let Some(url) = flag {
        return Ok(url);
    }
    Ok(load()?
        .agent_url
        .unwrap_or_else(|| DEFAULT_AGENT_URL.to_string()))
}
