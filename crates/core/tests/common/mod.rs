//! Shared helpers for the integration tests.
//!
//! - Fixtures: a case directory and shell stand-ins for the external tools
//! - Assertions over the emitted event stream

#![allow(dead_code)]

pub mod assertions;
pub mod fixtures;

pub use assertions::*;
pub use fixtures::*;
