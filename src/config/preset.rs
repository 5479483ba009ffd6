//! Parameter presets
//!
//! A preset is a set of parameter values (and optionally an operator choice)
//! saved from one node and applied to another. Applying a preset does not
//! cook by itself; the values are pushed on the node's next pipeline run.

use super::PRESET_FILE_EXTENSION;
use crate::engine::ParmValue;
use crate::error::{CookError, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Saved parameter values for a node
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Preset {
    /// Operator the values were captured from
    #[serde(default)]
    pub operator: Option<String>,

    /// Parameter values by name
    #[serde(default)]
    pub values: BTreeMap<String, ParmValue>,
}

impl Preset {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_value(mut self, name: impl Into<String>, value: ParmValue) -> Self {
        self.values.insert(name.into(), value);
        self
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty() && self.operator.is_none()
    }

    /// File name used for a node's preset inside `dir`
    pub fn path_for(dir: impl AsRef<Path>, node_name: &str) -> PathBuf {
        dir.as_ref()
            .join(format!("{}.{}", node_name, PRESET_FILE_EXTENSION))
    }

    /// Load a preset from disk
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| {
            CookError::Configuration(format!("Failed to read preset {:?}: {}", path, e))
        })?;
        serde_json::from_str(&content).map_err(|e| {
            CookError::Serialization(format!("Failed to parse preset {:?}: {}", path, e))
        })
    }

    /// Save a preset to disk as JSON
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }
}
