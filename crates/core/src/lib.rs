//! # ak-core
//!
//! Pipeline orchestration and cancellation engine for airway-kit.
//!
//! This crate provides:
//! - Sequencing of the stages of one clinical case
//! - Skip/resume decisions based on artifacts already on disk
//! - A single progress stream fed by heterogeneous subprocess output
//! - Cancellation that tears down every live process group and monitor
//!
//! ## Modules
//!
//! - [`config`]: Configuration loading from the `.airway/` directory
//! - [`cancel`]: Shared cancel flag and registry of live subprocesses
//! - [`artifacts`]: Artifact validity checks, markers and cleanup
//! - [`progress`]: Mapping of stage-local progress to global progress
//! - [`runner`]: Subprocess execution with streamed output
//! - [`stage`]: Stage model and pipeline assembly
//! - [`monitor`]: Background residual monitor
//! - [`engine`]: Pipeline run worker and run handle
//! - [`state`]: Run state machine and run manager
//! - [`init`]: Workspace initialization from embedded templates

pub mod artifacts;
pub mod cancel;
pub mod config;
pub mod engine;
pub mod error;
pub mod init;
pub mod monitor;
pub mod paths;
pub mod progress;
pub mod runner;
pub mod stage;
pub mod state;

pub use error::{PipelineError, PipelineResult};
