//! Scanning of numbered result-step directories.

use std::io;
use std::path::Path;
use walkdir::WalkDir;

/// Numbered step directories found under a solver output directory.
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct StepScan {
    /// Highest step, `None` when there are no step directories.
    pub highest: Option<f64>,

    /// Number of step directories.
    pub count: usize,
}

impl StepScan {
    /// Whether the highest step reaches `min_step`.
    pub fn reaches(&self, min_step: f64) -> bool {
        self.highest.is_some_and(|step| step >= min_step)
    }
}

/// Parse a directory name as a result step (`20`, `0.005`, `1e-3`).
pub fn parse_step(name: &str) -> Option<f64> {
    name.parse::<f64>().ok().filter(|v| v.is_finite() && *v >= 0.0)
}

/// Scan the direct children of `dir` for numbered step directories.
///
/// A missing directory yields an empty scan.
pub fn scan_steps(dir: &Path) -> io::Result<StepScan> {
    if !dir.is_dir() {
        return Ok(StepScan::default());
    }

    let mut scan = StepScan::default();
    for entry in WalkDir::new(dir).min_depth(1).max_depth(1) {
        let entry = entry.map_err(io::Error::other)?;
        if !entry.file_type().is_dir() {
            continue;
        }
        let Some(step) = entry.file_name().to_str().and_then(parse_step) else {
            continue;
        };
        scan.count += 1;
        scan.highest = Some(scan.highest.map_or(step, |h| h.max(step)));
    }
    Ok(scan)
}
