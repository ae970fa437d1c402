//! Filesystem check deciding whether a stage's output is already valid.

use super::markers::StageMarkers;
use super::steps::{scan_steps, StepScan};
use crate::error::{PipelineError, PipelineResult};
use crate::paths::Placeholders;
use ak_protocol::pipeline_models::ArtifactDefinition;
use ak_protocol::run_models::RunParams;
use std::path::{Path, PathBuf};

/// Verdict of the validity heuristic.
#[derive(Debug, Clone, PartialEq)]
pub enum Validity {
    /// Every check passed, the stage may be skipped.
    Complete,

    /// At least one declared pattern matched nothing.
    Missing,

    /// Output exists but fails a completeness check.
    Incomplete { reason: String },

    /// A write was interrupted: the partial marker is still present.
    PartialWrite,
}

impl Validity {
    pub fn is_complete(&self) -> bool {
        matches!(self, Validity::Complete)
    }
}

/// Result of probing one stage's artifacts.
#[derive(Debug, Clone)]
pub struct ArtifactRecord {
    pub stage: String,

    /// Directory the patterns were resolved against.
    pub root: PathBuf,

    /// Expanded patterns that were checked.
    pub patterns: Vec<String>,

    /// Entries matched by the patterns.
    pub matched: Vec<PathBuf>,

    /// Patterns that matched nothing.
    pub missing: Vec<String>,

    /// Numbered step directories, for stages with a completion proxy.
    pub steps: Option<StepScan>,

    pub validity: Validity,
}

impl ArtifactRecord {
    /// Whether the stage left anything on disk.
    pub fn has_output(&self) -> bool {
        !self.matched.is_empty() || self.steps.is_some_and(|s| s.count > 0)
    }
}

/// Skip decision for a stage.
#[derive(Debug, Clone)]
pub struct Resolution {
    pub skip: bool,
    pub record: ArtifactRecord,
}

/// Stateless artifact checker.
///
/// Partial output is never treated as complete: any missing pattern, an empty
/// file, a completion proxy below threshold, a leftover partial marker or a
/// missing completion marker all yield `skip = false`.
pub struct ArtifactResolver;

impl ArtifactResolver {
    /// Directory a stage's artifacts live in.
    pub fn stage_root(
        stage: &str,
        artifacts: &ArtifactDefinition,
        case_dir: &Path,
        params: &RunParams,
    ) -> PipelineResult<PathBuf> {
        match &artifacts.dir {
            Some(dir) => {
                let expanded = Placeholders::new(case_dir, params).expand_for(stage, dir)?;
                Ok(case_dir.join(expanded))
            }
            None => Ok(case_dir.to_path_buf()),
        }
    }

    /// Completion markers of a stage.
    pub fn markers(
        stage: &str,
        artifacts: &ArtifactDefinition,
        case_dir: &Path,
        params: &RunParams,
    ) -> StageMarkers {
        let params = artifacts.is_parameterized().then_some(params);
        StageMarkers::new(case_dir, stage, params)
    }

    /// Decide whether a stage can be skipped.
    pub fn resolve(
        stage: &str,
        artifacts: &ArtifactDefinition,
        case_dir: &Path,
        params: &RunParams,
    ) -> PipelineResult<Resolution> {
        let record = Self::inspect(stage, artifacts, case_dir, params, true)?;
        let skip = record.validity.is_complete();
        tracing::debug!(stage, skip, validity = ?record.validity, "resolved artifacts");
        Ok(Resolution { skip, record })
    }

    /// Run every check. `check_marker = false` ignores both markers, which is
    /// used to verify fresh output before the completion marker is written.
    pub fn inspect(
        stage: &str,
        artifacts: &ArtifactDefinition,
        case_dir: &Path,
        params: &RunParams,
        check_marker: bool,
    ) -> PipelineResult<ArtifactRecord> {
        let root = Self::stage_root(stage, artifacts, case_dir, params)?;
        let placeholders = Placeholders::new(case_dir, params).with_stage_dir(&root);
        let patterns = artifacts
            .patterns
            .iter()
            .map(|p| placeholders.expand_for(stage, p))
            .collect::<PipelineResult<Vec<_>>>()?;

        let mut record = ArtifactRecord {
            stage: stage.to_string(),
            root: root.clone(),
            patterns: patterns.clone(),
            matched: Vec::new(),
            missing: Vec::new(),
            steps: None,
            validity: Validity::Complete,
        };

        let mut empty = None;
        for pattern in &patterns {
            let hits = glob_entries(stage, &root, pattern)?;
            if hits.is_empty() {
                record.missing.push(pattern.clone());
            }
            if empty.is_none() {
                empty = hits.iter().find(|p| is_empty_file(p)).cloned();
            }
            record.matched.extend(hits);
        }

        if let Some(proxy) = &artifacts.completion {
            let dir = root.join(&proxy.steps_dir);
            let scan = scan_steps(&dir).map_err(|e| PipelineError::io(&dir, e))?;
            record.steps = Some(scan);
        }

        let markers = Self::markers(stage, artifacts, case_dir, params);
        record.validity = if check_marker && markers.is_partial() {
            Validity::PartialWrite
        } else if !record.missing.is_empty() {
            Validity::Missing
        } else if let Some(path) = empty {
            Validity::Incomplete {
                reason: format!("{} is empty", path.display()),
            }
        } else if let Some(reason) = proxy_shortfall(artifacts, record.steps) {
            if record.has_output() {
                Validity::Incomplete { reason }
            } else {
                Validity::Missing
            }
        } else if patterns.is_empty() && artifacts.completion.is_none() && !artifacts.require_marker
        {
            Validity::Incomplete {
                reason: "stage declares no artifacts".to_string(),
            }
        } else if check_marker && artifacts.require_marker && !markers.is_complete() {
            Validity::Incomplete {
                reason: "completion marker absent".to_string(),
            }
        } else {
            Validity::Complete
        };

        Ok(record)
    }

    /// Delete a stage's output and markers.
    ///
    /// A stage that owns a directory loses the whole directory; otherwise
    /// only the entries matched by its patterns are removed. Returns whether
    /// anything was deleted, so a second call returns `Ok(false)`.
    pub fn cleanup(
        stage: &str,
        artifacts: &ArtifactDefinition,
        case_dir: &Path,
        params: &RunParams,
    ) -> PipelineResult<bool> {
        let root = Self::stage_root(stage, artifacts, case_dir, params)?;
        let mut removed = false;

        if artifacts.dir.is_some() {
            if root.exists() && root != case_dir {
                std::fs::remove_dir_all(&root).map_err(|e| PipelineError::io(&root, e))?;
                removed = true;
            }
        } else {
            let placeholders = Placeholders::new(case_dir, params).with_stage_dir(&root);
            for pattern in &artifacts.patterns {
                let pattern = placeholders.expand_for(stage, pattern)?;
                for path in glob_entries(stage, &root, &pattern)? {
                    remove_entry(&path)?;
                    removed = true;
                }
            }
        }

        let markers = Self::markers(stage, artifacts, case_dir, params);
        removed |= markers
            .clear()
            .map_err(|e| PipelineError::io(markers.partial_path(), e))?;

        if removed {
            tracing::info!(stage, root = %root.display(), "removed stage output");
        }
        Ok(removed)
    }
}

fn glob_entries(stage: &str, root: &Path, pattern: &str) -> PipelineResult<Vec<PathBuf>> {
    let full = format!(
        "{}/{}",
        glob::Pattern::escape(&root.to_string_lossy()),
        pattern
    );
    let paths = glob::glob(&full).map_err(|e| PipelineError::InvalidPipeline {
        pipeline: stage.to_string(),
        reason: format!("bad artifact pattern '{pattern}': {e}"),
    })?;
    Ok(paths.filter_map(Result::ok).collect())
}

fn is_empty_file(path: &Path) -> bool {
    std::fs::metadata(path).is_ok_and(|m| m.is_file() && m.len() == 0)
}

fn proxy_shortfall(artifacts: &ArtifactDefinition, steps: Option<StepScan>) -> Option<String> {
    let proxy = artifacts.completion.as_ref()?;
    let scan = steps.unwrap_or_default();
    if !scan.reaches(proxy.min_step) {
        return Some(match scan.highest {
            Some(highest) => format!("highest result step {highest} is below {}", proxy.min_step),
            None => "no result steps written".to_string(),
        });
    }
    if scan.count < proxy.min_count {
        return Some(format!(
            "{} result steps present, {} required",
            scan.count, proxy.min_count
        ));
    }
    None
}

fn remove_entry(path: &Path) -> PipelineResult<()> {
    let result = if path.is_dir() {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(PipelineError::io(path, e)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ak_protocol::pipeline_models::CompletionProxy;

    fn segmentation() -> ArtifactDefinition {
        ArtifactDefinition {
            dir: None,
            patterns: vec![
                "segmentation/*.stl".to_string(),
                "segmentation/preview.png".to_string(),
            ],
            completion: None,
            require_marker: false,
        }
    }

    fn solver() -> ArtifactDefinition {
        ArtifactDefinition {
            dir: Some("cfd/{flow_rate}LPM".to_string()),
            patterns: vec!["system/controlDict".to_string()],
            completion: Some(CompletionProxy::default()),
            require_marker: false,
        }
    }

    fn write(path: &Path, content: &str) {
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, content).unwrap();
    }

    #[test]
    fn test_empty_case_is_missing() {
        let case = tempfile::tempdir().unwrap();
        let resolution =
            ArtifactResolver::resolve("segmentation", &segmentation(), case.path(), &RunParams::default())
                .unwrap();

        assert!(!resolution.skip);
        assert_eq!(resolution.record.validity, Validity::Missing);
        assert_eq!(resolution.record.missing.len(), 2);
    }

    #[test]
    fn test_complete_segmentation_is_skipped() {
        let case = tempfile::tempdir().unwrap();
        write(&case.path().join("segmentation/airway.stl"), "solid airway");
        write(&case.path().join("segmentation/preview.png"), "png");

        let resolution =
            ArtifactResolver::resolve("segmentation", &segmentation(), case.path(), &RunParams::default())
                .unwrap();
        assert!(resolution.skip);
        assert_eq!(resolution.record.matched.len(), 2);
    }

    #[test]
    fn test_partial_output_is_never_complete() {
        let case = tempfile::tempdir().unwrap();
        write(&case.path().join("segmentation/airway.stl"), "solid airway");

        let resolution =
            ArtifactResolver::resolve("segmentation", &segmentation(), case.path(), &RunParams::default())
                .unwrap();
        assert!(!resolution.skip);
        assert_eq!(resolution.record.missing, vec!["segmentation/preview.png".to_string()]);
    }

    #[test]
    fn test_empty_file_is_incomplete() {
        let case = tempfile::tempdir().unwrap();
        write(&case.path().join("segmentation/airway.stl"), "");
        write(&case.path().join("segmentation/preview.png"), "png");

        let resolution =
            ArtifactResolver::resolve("segmentation", &segmentation(), case.path(), &RunParams::default())
                .unwrap();
        assert!(!resolution.skip);
        assert!(matches!(resolution.record.validity, Validity::Incomplete { .. }));
    }

    #[test]
    fn test_partial_marker_blocks_skip() {
        let case = tempfile::tempdir().unwrap();
        write(&case.path().join("segmentation/airway.stl"), "solid airway");
        write(&case.path().join("segmentation/preview.png"), "png");
        let markers = ArtifactResolver::markers(
            "segmentation",
            &segmentation(),
            case.path(),
            &RunParams::default(),
        );
        markers.begin().unwrap();

        let resolution =
            ArtifactResolver::resolve("segmentation", &segmentation(), case.path(), &RunParams::default())
                .unwrap();
        assert!(!resolution.skip);
        assert_eq!(resolution.record.validity, Validity::PartialWrite);
    }

    #[test]
    fn test_required_marker() {
        let case = tempfile::tempdir().unwrap();
        write(&case.path().join("segmentation/airway.stl"), "solid airway");
        write(&case.path().join("segmentation/preview.png"), "png");
        let artifacts = ArtifactDefinition {
            require_marker: true,
            ..segmentation()
        };
        let params = RunParams::default();

        let before = ArtifactResolver::resolve("segmentation", &artifacts, case.path(), &params).unwrap();
        assert!(!before.skip);

        ArtifactResolver::markers("segmentation", &artifacts, case.path(), &params)
            .finish()
            .unwrap();
        let after = ArtifactResolver::resolve("segmentation", &artifacts, case.path(), &params).unwrap();
        assert!(after.skip);
    }

    #[test]
    fn test_solver_threshold() {
        let case = tempfile::tempdir().unwrap();
        let params = RunParams::with_flow_rate(10.0);
        let root = case.path().join("cfd/10LPM");
        write(&root.join("system/controlDict"), "FoamFile {}");
        for step in ["0", "5", "15"] {
            std::fs::create_dir_all(root.join(step)).unwrap();
        }

        let below = ArtifactResolver::resolve("solver", &solver(), case.path(), &params).unwrap();
        assert!(!below.skip);
        assert!(matches!(below.record.validity, Validity::Incomplete { .. }));

        std::fs::create_dir_all(root.join("20")).unwrap();
        let reached = ArtifactResolver::resolve("solver", &solver(), case.path(), &params).unwrap();
        assert!(reached.skip);
        assert_eq!(reached.record.steps.and_then(|s| s.highest), Some(20.0));
    }

    #[test]
    fn test_parameter_values_are_independent() {
        let case = tempfile::tempdir().unwrap();
        let root = case.path().join("cfd/10LPM");
        write(&root.join("system/controlDict"), "FoamFile {}");
        std::fs::create_dir_all(root.join("20")).unwrap();

        let low =
            ArtifactResolver::resolve("solver", &solver(), case.path(), &RunParams::with_flow_rate(10.0))
                .unwrap();
        let high =
            ArtifactResolver::resolve("solver", &solver(), case.path(), &RunParams::with_flow_rate(40.0))
                .unwrap();

        assert!(low.skip);
        assert!(!high.skip);
        assert_eq!(high.record.root, case.path().join("cfd/40LPM"));
    }

    #[test]
    fn test_parameterized_stage_needs_flow_rate() {
        let case = tempfile::tempdir().unwrap();
        let result = ArtifactResolver::resolve("solver", &solver(), case.path(), &RunParams::default());
        assert!(matches!(result, Err(PipelineError::StageSetup { .. })));
    }

    #[test]
    fn test_cleanup_is_idempotent() {
        let case = tempfile::tempdir().unwrap();
        let params = RunParams::with_flow_rate(10.0);
        let low = case.path().join("cfd/10LPM");
        let high = case.path().join("cfd/40LPM");
        write(&low.join("system/controlDict"), "FoamFile {}");
        write(&high.join("system/controlDict"), "FoamFile {}");

        assert!(ArtifactResolver::cleanup("solver", &solver(), case.path(), &params).unwrap());
        assert!(!low.exists());
        assert!(high.exists());

        assert!(!ArtifactResolver::cleanup("solver", &solver(), case.path(), &params).unwrap());
    }

    #[test]
    fn test_cleanup_removes_matched_files_only() {
        let case = tempfile::tempdir().unwrap();
        write(&case.path().join("segmentation/airway.stl"), "solid airway");
        write(&case.path().join("segmentation/notes.txt"), "keep me");

        let removed = ArtifactResolver::cleanup(
            "segmentation",
            &segmentation(),
            case.path(),
            &RunParams::default(),
        )
        .unwrap();

        assert!(removed);
        assert!(!case.path().join("segmentation/airway.stl").exists());
        assert!(case.path().join("segmentation/notes.txt").exists());
    }
}
