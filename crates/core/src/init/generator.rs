//! Directory structure and file generation for `.airway` initialization.

use super::error::{InitError, InitResult};
use super::templates::{get_template, list_templates};
use crate::config::loader::AIRWAY_DIR;
use crate::config::models::DEFAULT_PIPELINE;
use std::fs;
use std::path::{Path, PathBuf};

/// Options for initializing a `.airway` directory.
#[derive(Debug, Clone)]
pub struct InitOptions {
    /// Target directory where `.airway` will be created.
    pub target_dir: PathBuf,

    /// Overwrite template files in an existing `.airway` directory.
    pub force: bool,

    /// Only write the default pipeline.
    pub minimal: bool,
}

impl Default for InitOptions {
    fn default() -> Self {
        Self {
            target_dir: std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")),
            force: false,
            minimal: false,
        }
    }
}

/// Generate a `.airway` directory structure with templates.
///
/// ```text
/// .airway/
/// ├── config.toml
/// └── pipelines/
///     ├── airway-cfd.yaml
///     └── segmentation-only.yaml (unless minimal)
/// ```
///
/// Returns the paths written.
///
/// With `force`, templates are rewritten in place and `.airway/state/` is
/// left alone.
pub async fn generate_workspace(options: InitOptions) -> InitResult<Vec<PathBuf>> {
    let airway_dir = options.target_dir.join(AIRWAY_DIR);

    if airway_dir.exists() && !options.force {
        return Err(InitError::AlreadyInitialized(airway_dir));
    }

    let pipelines_dir = airway_dir.join("pipelines");
    fs::create_dir_all(&pipelines_dir).map_err(InitError::write(&pipelines_dir))?;

    let mut written = vec![write_template_file(&airway_dir, "config.toml")?];

    if options.minimal {
        let path = format!("pipelines/{DEFAULT_PIPELINE}.yaml");
        written.push(write_template_file(&airway_dir, &path)?);
    } else {
        for pipeline_path in list_templates("pipelines/") {
            written.push(write_template_file(&airway_dir, &pipeline_path)?);
        }
    }

    tracing::info!(dir = %airway_dir.display(), files = written.len(), "workspace initialized");
    Ok(written)
}

/// Write one embedded template below `airway_dir`.
fn write_template_file(airway_dir: &Path, template_path: &str) -> InitResult<PathBuf> {
    let content = get_template(template_path)
        .ok_or_else(|| InitError::MissingTemplate(template_path.to_string()))?;

    let target_path = airway_dir.join(template_path);

    if let Some(parent) = target_path.parent() {
        fs::create_dir_all(parent).map_err(InitError::write(parent))?;
    }

    fs::write(&target_path, content).map_err(InitError::write(&target_path))?;

    Ok(target_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::loader::load_config;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_generate_workspace_loads_back() {
        let dir = tempdir().unwrap();
        let options = InitOptions {
            target_dir: dir.path().to_path_buf(),
            force: false,
            minimal: false,
        };

        let written = generate_workspace(options).await.unwrap();
        assert_eq!(written.len(), 3);

        let airway_dir = dir.path().join(".airway");
        assert!(airway_dir.join("config.toml").exists());
        assert!(airway_dir.join("pipelines/airway-cfd.yaml").exists());
        assert!(airway_dir.join("pipelines/segmentation-only.yaml").exists());

        let config = load_config(dir.path()).await.unwrap();
        assert_eq!(config.pipelines.len(), 2);
        assert_eq!(config.default_pipeline().unwrap().name, "airway-cfd");
    }

    #[tokio::test]
    async fn test_generate_workspace_minimal() {
        let dir = tempdir().unwrap();
        let options = InitOptions {
            target_dir: dir.path().to_path_buf(),
            force: false,
            minimal: true,
        };

        generate_workspace(options).await.unwrap();

        let airway_dir = dir.path().join(".airway");
        assert!(airway_dir.join("pipelines/airway-cfd.yaml").exists());
        assert!(!airway_dir.join("pipelines/segmentation-only.yaml").exists());
    }

    #[tokio::test]
    async fn test_generate_workspace_exists_without_force() {
        let dir = tempdir().unwrap();
        fs::create_dir_all(dir.path().join(".airway")).unwrap();

        let options = InitOptions {
            target_dir: dir.path().to_path_buf(),
            force: false,
            minimal: false,
        };

        let result = generate_workspace(options).await;
        assert!(matches!(result, Err(InitError::AlreadyInitialized(_))));
    }

    #[tokio::test]
    async fn test_generate_workspace_force_keeps_state() {
        let dir = tempdir().unwrap();
        let state = dir.path().join(".airway/state");
        fs::create_dir_all(&state).unwrap();
        fs::write(state.join("segmentation.complete"), "x").unwrap();

        let options = InitOptions {
            target_dir: dir.path().to_path_buf(),
            force: true,
            minimal: true,
        };

        generate_workspace(options).await.unwrap();
        assert!(dir.path().join(".airway/config.toml").exists());
        assert!(state.join("segmentation.complete").exists());
    }

    #[test]
    fn test_default_init_options() {
        let options = InitOptions::default();
        assert!(!options.force);
        assert!(!options.minimal);
    }
}
