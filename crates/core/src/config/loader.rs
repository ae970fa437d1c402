//! Reads `.airway/config.toml` and `.airway/pipelines/*.yaml`.
//!
//! Missing files fall back to defaults; files that exist must parse.

use crate::config::error::{ConfigError, ConfigResult};
use crate::config::models::AppConfig;
use ak_protocol::config_models::GlobalConfig;
use ak_protocol::pipeline_models::PipelineDefinition;
use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use walkdir::WalkDir;

/// Name of the workspace directory.
pub const AIRWAY_DIR: &str = ".airway";

/// Load settings and pipeline definitions below `root/.airway`.
///
/// # Errors
///
/// Fails when a file exists but cannot be read or parsed, when a setting is
/// out of range, or when two files define a pipeline with the same name.
pub async fn load_config(root: &Path) -> ConfigResult<AppConfig> {
    let airway_dir = root.join(AIRWAY_DIR);
    if !airway_dir.is_dir() {
        return Ok(AppConfig::default());
    }

    Ok(AppConfig {
        global: load_settings(&airway_dir.join("config.toml"))?,
        pipelines: load_pipelines(&airway_dir.join("pipelines"))?,
    })
}

fn read(path: &Path) -> ConfigResult<String> {
    std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn load_settings(path: &Path) -> ConfigResult<GlobalConfig> {
    if !path.exists() {
        return Ok(GlobalConfig::default());
    }

    let settings: GlobalConfig =
        toml::from_str(&read(path)?).map_err(|source| ConfigError::Settings {
            path: path.to_path_buf(),
            source,
        })?;

    let out_of_range = |key, reason| ConfigError::SettingOutOfRange {
        path: path.to_path_buf(),
        key,
        reason,
    };
    if settings.event_buffer == 0 {
        return Err(out_of_range("event-buffer", "must be at least 1"));
    }
    if settings.monitor_interval_ms == 0 {
        return Err(out_of_range("monitor-interval-ms", "must be at least 1"));
    }
    Ok(settings)
}

fn load_pipelines(dir: &Path) -> ConfigResult<Vec<PipelineDefinition>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut pipelines = Vec::new();
    let mut sources: HashMap<String, PathBuf> = HashMap::new();

    let files = WalkDir::new(dir).min_depth(1).max_depth(1).sort_by_file_name();
    for entry in files {
        let entry = entry.map_err(|source| ConfigError::Listing {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        if !matches!(
            path.extension().and_then(|ext| ext.to_str()),
            Some("yaml" | "yml")
        ) {
            continue;
        }

        let pipeline: PipelineDefinition =
            serde_yaml::from_str(&read(path)?).map_err(|source| ConfigError::PipelineSyntax {
                path: path.to_path_buf(),
                source,
            })?;
        check_shape(path, &pipeline)?;

        if let Some(first) = sources.get(&pipeline.name) {
            return Err(ConfigError::DuplicatePipeline {
                path: path.to_path_buf(),
                first: first.clone(),
                name: pipeline.name,
            });
        }
        sources.insert(pipeline.name.clone(), path.to_path_buf());

        tracing::debug!(pipeline = %pipeline.name, path = %path.display(), "loaded pipeline");
        pipelines.push(pipeline);
    }

    Ok(pipelines)
}

/// Name-level checks. Progress ranges and dependency order are checked when
/// the pipeline is built.
fn check_shape(path: &Path, pipeline: &PipelineDefinition) -> ConfigResult<()> {
    let shape = |reason: String| ConfigError::PipelineShape {
        path: path.to_path_buf(),
        name: pipeline.name.clone(),
        reason,
    };

    if pipeline.stages.is_empty() {
        return Err(shape("no stages".to_string()));
    }
    let mut names = HashSet::new();
    for stage in &pipeline.stages {
        if !names.insert(stage.name.as_str()) {
            return Err(shape(format!("stage '{}' appears twice", stage.name)));
        }
        if stage.monitor.as_ref().is_some_and(|m| m.interval_ms == Some(0)) {
            return Err(shape(format!(
                "stage '{}' has monitor interval-ms 0, must be at least 1",
                stage.name
            )));
        }
    }
    Ok(())
}
