//! Configuration loading and management.
//!
//! This module provides functionality to load and parse all configuration files
//! from the `.airway/` directory structure.

pub mod error;
pub mod loader;
pub mod models;
