//! Configuration models that aggregate all settings.

use ak_protocol::config_models::GlobalConfig;
use ak_protocol::pipeline_models::PipelineDefinition;

/// Unified application configuration loaded from the `.airway/` directory.
///
/// - `config.toml`: Global settings
/// - `pipelines/*.yaml`: Pipeline definitions
///
/// # Example
///
/// ```rust,no_run
/// use ak_core::config::loader::load_config;
/// use std::path::Path;
///
/// # async fn example() -> Result<(), Box<dyn std::error::Error>> {
/// let config = load_config(Path::new(".")).await?;
/// println!("Loaded {} pipelines", config.pipelines.len());
/// # Ok(())
/// # }
/// ```
#[derive(Debug, Clone, Default)]
pub struct AppConfig {
    /// Global settings from `config.toml`.
    pub global: GlobalConfig,

    /// Pipeline definitions from `pipelines/*.yaml`, sorted by file name.
    pub pipelines: Vec<PipelineDefinition>,
}

impl AppConfig {
    pub fn pipeline(&self, name: &str) -> Option<&PipelineDefinition> {
        self.pipelines.iter().find(|p| p.name == name)
    }

    /// The pipeline to use when none is named: the only one, or the one
    /// called `airway-cfd`.
    pub fn default_pipeline(&self) -> Option<&PipelineDefinition> {
        match self.pipelines.as_slice() {
            [only] => Some(only),
            _ => self.pipeline(DEFAULT_PIPELINE),
        }
    }
}

/// Name of the pipeline written by `airway init`.
pub const DEFAULT_PIPELINE: &str = "airway-cfd";
