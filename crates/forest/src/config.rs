use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ForestError, Result};

/// Smallest usable branching factor.
pub const MIN_FACTOR: usize = 3;

/// Forest configuration.
///
/// Every field has a default, so a configuration document only needs to list
/// what it changes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ForestConfig {
    /// Branching factor of the registry tree that maps tree names to files.
    pub root_factor: usize,

    /// Branching factor of trees created without an explicit one.
    pub default_factor: usize,

    /// How many unpinned internal nodes stay cached.
    pub intr_cache_length: usize,

    /// How many unpinned leaf nodes stay cached.
    pub leaf_cache_length: usize,

    /// How many unpinned tree handles stay cached.
    pub tree_cache_length: usize,

    /// Pending saves beyond this are dispatched without waiting for the timer.
    pub savior_queue_length: usize,

    /// Period of the savior's timer sweep, in milliseconds.
    pub savior_delay_ms: u64,

    /// Ceiling on simultaneously open leaf files.
    pub open_files_limit: usize,
}

impl Default for ForestConfig {
    fn default() -> Self {
        Self {
            root_factor: 3,
            default_factor: 3,
            intr_cache_length: 3,
            leaf_cache_length: 3,
            tree_cache_length: 100,
            savior_queue_length: 100,
            savior_delay_ms: 5,
            open_files_limit: 256,
        }
    }
}

impl ForestConfig {
    /// Parses a YAML configuration document.
    pub fn from_yaml(yaml: &str) -> Result<Self> {
        let config: Self = serde_yaml::from_str(yaml)
            .map_err(|error| ForestError::InvalidInput(format!("bad configuration: {error}")))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        check_factor(self.root_factor)?;
        check_factor(self.default_factor)?;
        for (name, value) in [
            ("intr_cache_length", self.intr_cache_length),
            ("leaf_cache_length", self.leaf_cache_length),
            ("tree_cache_length", self.tree_cache_length),
            ("savior_queue_length", self.savior_queue_length),
            ("open_files_limit", self.open_files_limit),
        ] {
            if value == 0 {
                return Err(ForestError::InvalidInput(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn savior_delay(&self) -> Duration {
        Duration::from_millis(self.savior_delay_ms)
    }
}

pub(crate) fn check_factor(factor: usize) -> Result<()> {
    if factor < MIN_FACTOR {
        return Err(ForestError::InvalidInput(format!(
            "factor {factor} is below the minimum of {MIN_FACTOR}"
        )));
    }
    Ok(())
}
