//! Global configuration models for `.airway/config.toml`.
//!
//! This module defines the structure of the global configuration file that
//! controls engine-wide timing and buffering for every pipeline run.

use serde::Deserialize;
use serde::Serialize;
use ts_rs::TS;

/// Represents global settings from `.airway/config.toml`.
///
/// Every field has a default, so an empty or missing file is valid.
///
/// # Example
///
/// ```toml
/// # .airway/config.toml
/// kill-grace-ms = 3000
/// monitor-interval-ms = 2000
/// ```
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq, TS)]
#[serde(rename_all = "kebab-case", default)]
pub struct GlobalConfig {
    /// Time a process group gets between SIGTERM and SIGKILL.
    pub kill_grace_ms: u64,

    /// Poll interval of background residual monitors.
    pub monitor_interval_ms: u64,

    /// Number of stderr lines kept for failure reports.
    pub stderr_tail_lines: usize,

    /// Capacity of the event channel handed to a run.
    pub event_buffer: usize,
}

impl Default for GlobalConfig {
    fn default() -> Self {
        Self {
            kill_grace_ms: 3000,
            monitor_interval_ms: 2000,
            stderr_tail_lines: 40,
            event_buffer: 256,
        }
    }
}
