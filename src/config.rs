use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::profile::ModelProfile;
use crate::rag::RetrievalConfig;

pub const DEFAULT_RELAY_BASE: &str = "http://127.0.0.1:3001";

/// On-disk configuration: the model registry plus retrieval settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub models: Vec<ModelProfile>,
    pub retrieval: RetrievalConfig,
    pub relay_base: String,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            models: Vec::new(),
            retrieval: RetrievalConfig::default(),
            relay_base: DEFAULT_RELAY_BASE.to_owned(),
        }
    }
}

/// Load the configuration file, failing with the offending path in context.
pub fn load(path: &Path) -> Result<AppConfig> {
    let raw = fs::read_to_string(path)
        .with_context(|| format!("reading config file {}", path.display()))?;
    let config: AppConfig = serde_json::from_str(&raw)
        .with_context(|| format!("parsing config file {}", path.display()))?;
    Ok(config)
}
