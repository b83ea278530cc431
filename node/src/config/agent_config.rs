use super::NodeConfig;
use crate::error::{NodeError, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// Log level: trace, debug, info, warn, error
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Log directory for file-based logging, stdout when absent
    #[serde(default)]
    pub log_dir: Option<String>,

    #[serde(default = "default_log_file")]
    pub log_file: String,

    /// tokio-console port, only honoured with the `console` feature
    #[serde(default)]
    pub console_port: Option<u16>,

    #[serde(default)]
    pub nodes: Vec<NodeConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_file() -> String {
    "node.log".to_string()
}

impl AgentConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: AgentConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(NodeError::Configuration(
                "at least one [[nodes]] entry is required".to_string(),
            ));
        }
        for node in &self.nodes {
            node.validate()?;
        }
        Ok(())
    }
}
