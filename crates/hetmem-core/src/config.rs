//! Runtime configuration.
//!
//! Configuration can be built in code with [`RuntimeConfigBuilder`] or
//! loaded from a TOML file layered with `HETMEM_*` environment variables.
//!
//! # Example
//!
//! ```ignore
//! use hetmem_core::config::{load_config, RuntimeConfigBuilder};
//!
//! let config = RuntimeConfigBuilder::new().with_alignment(256).build()?;
//! let from_file = load_config("config/hetmem.toml")?;
//! ```

use std::path::Path;

use config::{Config, Environment, File, FileFormat};
use serde::{Deserialize, Serialize};

use crate::error::{HetmemError, Result};
use crate::memory::align;

/// Configuration for a memory runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeConfig {
    /// Alignment of owned device allocations in bytes.
    #[serde(default = "default_alignment")]
    pub alignment: usize,

    /// Zero-fill owned allocations when they are materialized.
    #[serde(default)]
    pub zero_fill: bool,

    /// Submit migrations and writebacks as soon as their predecessors
    /// are submitted, instead of when a dependent is submitted.
    #[serde(default = "default_eager_submission")]
    pub eager_submission: bool,

    /// Reclaim released arrays on every access request.
    #[serde(default = "default_collect_on_request")]
    pub collect_on_request: bool,
}

fn default_alignment() -> usize {
    align::GPU_CACHE_LINE_SIZE
}

fn default_eager_submission() -> bool {
    true
}

fn default_collect_on_request() -> bool {
    true
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            alignment: default_alignment(),
            zero_fill: false,
            eager_submission: default_eager_submission(),
            collect_on_request: default_collect_on_request(),
        }
    }
}

impl RuntimeConfig {
    /// Creates a configuration for deterministic tests: zero-filled
    /// allocations, everything else default.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            zero_fill: true,
            ..Self::default()
        }
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<()> {
        if !align::is_valid_alignment(self.alignment) {
            return Err(HetmemError::InvalidConfig(format!(
                "alignment must be a power of two, got {}",
                self.alignment
            )));
        }
        Ok(())
    }
}

/// Builder for RuntimeConfig.
#[derive(Debug, Default)]
pub struct RuntimeConfigBuilder {
    config: RuntimeConfig,
}

impl RuntimeConfigBuilder {
    /// Creates a new builder with default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the allocation alignment.
    #[must_use]
    pub fn with_alignment(mut self, alignment: usize) -> Self {
        self.config.alignment = alignment;
        self
    }

    /// Enables or disables zero-filling of owned allocations.
    #[must_use]
    pub fn with_zero_fill(mut self, enabled: bool) -> Self {
        self.config.zero_fill = enabled;
        self
    }

    /// Enables or disables eager submission of internal operations.
    #[must_use]
    pub fn with_eager_submission(mut self, enabled: bool) -> Self {
        self.config.eager_submission = enabled;
        self
    }

    /// Enables or disables garbage collection on access requests.
    #[must_use]
    pub fn with_collect_on_request(mut self, enabled: bool) -> Self {
        self.config.collect_on_request = enabled;
        self
    }

    /// Builds and validates the configuration.
    pub fn build(self) -> Result<RuntimeConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

/// Load configuration from a TOML file, overridden by `HETMEM_*` variables.
pub fn load_config(path: impl AsRef<Path>) -> Result<RuntimeConfig> {
    let path = path.as_ref();
    let config: RuntimeConfig = Config::builder()
        .add_source(File::from(path).format(FileFormat::Toml).required(false))
        .add_source(Environment::with_prefix("HETMEM"))
        .build()?
        .try_deserialize()?;
    config.validate()?;
    Ok(config)
}

/// Parse configuration from a TOML string.
pub fn parse_config(toml: &str) -> Result<RuntimeConfig> {
    let config: RuntimeConfig = Config::builder()
        .add_source(File::from_str(toml, FileFormat::Toml))
        .build()?
        .try_deserialize()?;
    config.validate()?;
    Ok(config)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = RuntimeConfig::default();
        assert_eq!(config.alignment, 128);
        assert!(!config.zero_fill);
        assert!(config.eager_submission);
        assert!(config.collect_on_request);
    }

    #[test]
    fn test_config_builder() {
        let config = RuntimeConfigBuilder::new()
            .with_alignment(256)
            .with_zero_fill(true)
            .with_eager_submission(false)
            .build()
            .unwrap();

        assert_eq!(config.alignment, 256);
        assert!(config.zero_fill);
        assert!(!config.eager_submission);
    }

    #[test]
    fn test_invalid_alignment() {
        let result = RuntimeConfigBuilder::new().with_alignment(48).build();
        assert!(matches!(result, Err(HetmemError::InvalidConfig(_))));
    }

    #[test]
    fn test_parse_config() {
        let config = parse_config("alignment = 64\nzero_fill = true\n").unwrap();
        assert_eq!(config.alignment, 64);
        assert!(config.zero_fill);
        assert!(config.eager_submission);
    }

    #[test]
    fn test_load_missing_file_uses_defaults() {
        let config = load_config("does/not/exist.toml").unwrap();
        assert_eq!(config.alignment, 128);
    }
}
