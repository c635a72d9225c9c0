use std::fs;
use std::path::Path;

use tracing::{debug, info};

use super::PipelineConfig;
use crate::error::{PipelineError, Result};

impl PipelineConfig {
    /// Load configuration from a TOML file. Missing keys take their defaults.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path).map_err(|e| {
            PipelineError::Config(format!("Failed to read {}: {}", path.display(), e))
        })?;
        let config: PipelineConfig = toml::from_str(&text).map_err(|e| {
            PipelineError::Config(format!("Failed to parse {}: {}", path.display(), e))
        })?;
        info!("Loaded configuration from {}", path.display());
        debug!("Configuration: {:?}", config);
        Ok(config)
    }

    /// Write configuration as TOML
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let text = toml::to_string_pretty(self)
            .map_err(|e| PipelineError::Config(format!("Failed to serialize config: {}", e)))?;
        fs::write(path, text)?;
        Ok(())
    }
}
