use std::{fs, path::Path};

use serde::{Deserialize, Serialize};

use crate::errors::LoadError;

/// Decimal places used for derived prices such as the mid.
pub const DEFAULT_PRICE_SCALE: u32 = 4;
/// Levels per side in a published snapshot.
pub const DEFAULT_SNAPSHOT_DEPTH: usize = 10;

/// Engine tunables. Missing fields in a config file fall back to the defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub price_scale: u32,
    pub snapshot_depth: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            price_scale: DEFAULT_PRICE_SCALE,
            snapshot_depth: DEFAULT_SNAPSHOT_DEPTH,
        }
    }
}

impl EngineConfig {
    /// Reads a JSON config file.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, LoadError> {
        let raw = fs::read_to_string(path)?;
        serde_json::from_str(&raw).map_err(|source| LoadError::Parse { line: 1, source })
    }
}
