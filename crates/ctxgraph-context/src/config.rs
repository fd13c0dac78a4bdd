use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{CoordinatorError, CoordinatorResult};

/// Configuration for the [`StoreCoordinator`](crate::StoreCoordinator).
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct CoordinatorConfig {
    /// When `true`, the master context saves its own pending edits right
    /// after applying a merge that originated in another context.
    pub auto_save_master_after_merge: bool,
    /// Validate every change set against the schema before committing it.
    pub validate_on_save: bool,
    /// Label attached to the coordinator's log lines.
    pub node_label: String,
}

impl Default for CoordinatorConfig {
    fn default() -> Self {
        Self {
            auto_save_master_after_merge: false,
            validate_on_save: true,
            node_label: "ctxgraph".to_string(),
        }
    }
}

impl CoordinatorConfig {
    /// Parse a configuration from TOML. Missing keys take their defaults.
    pub fn from_toml_str(s: &str) -> CoordinatorResult<Self> {
        toml::from_str(s).map_err(|e| CoordinatorError::Config(e.to_string()))
    }

    /// Load a configuration file.
    pub fn load(path: &Path) -> CoordinatorResult<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| CoordinatorError::Config(format!("{}: {e}", path.display())))?;
        Self::from_toml_str(&text)
    }
}
