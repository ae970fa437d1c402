//! Initialization module for creating `.airway` directory structures.
//!
//! This module provides functionality to initialize a new airway workspace
//! by generating a `.airway/` directory with pre-configured templates for:
//! - Global configuration (`config.toml`)
//! - Pipeline definitions (`pipelines/*.yaml`)
//!
//! # Example
//!
//! ```no_run
//! use ak_core::init::{InitOptions, generate_workspace};
//! use std::path::PathBuf;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let options = InitOptions {
//!     target_dir: PathBuf::from("."),
//!     force: false,
//!     minimal: false,
//! };
//!
//! generate_workspace(options).await?;
//! # Ok(())
//! # }
//! ```

pub mod error;
pub mod generator;
pub mod templates;

pub use error::{InitError, InitResult};
pub use generator::{generate_workspace, InitOptions};
pub use templates::{get_template, list_templates};
