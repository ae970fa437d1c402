//! # ak-protocol
//!
//! Core protocol definitions and data models for airway-kit.
//!
//! This crate defines all shared data structures used for:
//! - Configuration file parsing (YAML pipeline definitions, TOML config)
//! - Runtime run and stage state
//! - Communication between a front end and the orchestration core
//!
//! ## Modules
//!
//! - [`config_models`]: Global configuration from config.toml
//! - [`pipeline_models`]: Pipeline and stage definitions
//! - [`run_models`]: Runtime run state, stage outcomes and progress events
//! - [`ipc`]: Operations and Events exchanged with the core
//!
//! ## Design Principles
//!
//! - Minimal dependencies: Only serde, ts-rs, uuid and chrono
//! - TypeScript generation: All types derive `TS` for desktop front ends
//! - Independent compilation: No dependencies on other airway-kit crates

pub mod config_models;
pub mod ipc;
pub mod pipeline_models;
pub mod run_models;

// Re-export all public types for convenience
pub use config_models::*;
pub use ipc::*;
pub use pipeline_models::*;
pub use run_models::*;
