//! Artifact conventions and skip/resume decisions.
//!
//! This module provides:
//! - [`resolver`]: the skip predicate and cleanup for stage output
//! - [`markers`]: partial-write and completion markers
//! - [`steps`]: numbered result-step directory scanning

pub mod markers;
pub mod resolver;
pub mod steps;

pub use markers::StageMarkers;
pub use resolver::{ArtifactRecord, ArtifactResolver, Resolution, Validity};
pub use steps::StepScan;
