//! Errors raised while reading `.airway/`.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Cannot read {path}: {source}")]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    /// `config.toml` is not valid TOML or has fields of the wrong type.
    #[error("Bad settings in {path}: {source}")]
    Settings {
        path: PathBuf,
        source: toml::de::Error,
    },

    /// A setting parsed but its value cannot be used.
    #[error("Setting '{key}' in {path} {reason}")]
    SettingOutOfRange {
        path: PathBuf,
        key: &'static str,
        reason: &'static str,
    },

    /// A pipeline file is not a valid pipeline definition.
    #[error("Bad pipeline file {path}: {source}")]
    PipelineSyntax {
        path: PathBuf,
        source: serde_yaml::Error,
    },

    /// A pipeline parsed but its stage list is unusable.
    #[error("Pipeline '{name}' in {path}: {reason}")]
    PipelineShape {
        path: PathBuf,
        name: String,
        reason: String,
    },

    /// Two files declare pipelines with the same name.
    #[error("Pipeline '{name}' in {path} is already defined in {first}")]
    DuplicatePipeline {
        path: PathBuf,
        first: PathBuf,
        name: String,
    },

    #[error("Cannot list pipelines in {path}: {source}")]
    Listing {
        path: PathBuf,
        source: walkdir::Error,
    },
}

pub type ConfigResult<T> = Result<T, ConfigError>;
