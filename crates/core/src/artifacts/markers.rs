//! Partial-write and completion markers.
//!
//! Before a stage executes, a `.partial` marker is written; after a clean
//! exit with verified outputs it is replaced by a `.complete` marker. A
//! cancellation or crash mid-write therefore always leaves the `.partial`
//! marker behind, and the resolver refuses to adopt that output.

use ak_protocol::run_models::RunParams;
use chrono::Utc;
use std::io;
use std::path::{Path, PathBuf};

/// Directory inside the case holding engine bookkeeping.
pub const STATE_DIR: &str = ".airway/state";

/// Marker files of one stage for one parameter set.
#[derive(Debug, Clone)]
pub struct StageMarkers {
    dir: PathBuf,
    key: String,
}

impl StageMarkers {
    /// Markers of `stage` inside `case_dir`.
    ///
    /// Parameterized stages get one marker pair per parameter set.
    pub fn new(case_dir: &Path, stage: &str, params: Option<&RunParams>) -> Self {
        let key = match params {
            Some(params) => format!("{stage}@{}", params.key()),
            None => stage.to_string(),
        };
        Self {
            dir: case_dir.join(STATE_DIR),
            key,
        }
    }

    pub fn partial_path(&self) -> PathBuf {
        self.dir.join(format!("{}.partial", self.key))
    }

    pub fn complete_path(&self) -> PathBuf {
        self.dir.join(format!("{}.complete", self.key))
    }

    pub fn is_partial(&self) -> bool {
        self.partial_path().exists()
    }

    pub fn is_complete(&self) -> bool {
        self.complete_path().exists()
    }

    /// Mark the stage as being written.
    pub fn begin(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        remove_if_exists(&self.complete_path())?;
        std::fs::write(self.partial_path(), Utc::now().to_rfc3339())
    }

    /// Mark the stage as cleanly finished.
    pub fn finish(&self) -> io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        std::fs::write(self.complete_path(), Utc::now().to_rfc3339())?;
        remove_if_exists(&self.partial_path())?;
        Ok(())
    }

    /// Remove both markers. Returns whether anything was removed.
    pub fn clear(&self) -> io::Result<bool> {
        let partial = remove_if_exists(&self.partial_path())?;
        let complete = remove_if_exists(&self.complete_path())?;
        Ok(partial || complete)
    }
}

pub(crate) fn remove_if_exists(path: &Path) -> io::Result<bool> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}
