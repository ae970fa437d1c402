//! State management for pipeline runs.
//!
//! This module provides:
//! - Run and stage state machine logic
//! - RunManager for coordinating multiple runs

pub mod manager;
pub mod run;
