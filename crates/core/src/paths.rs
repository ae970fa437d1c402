//! Placeholder expansion for stage paths and command lines.

use crate::error::{PipelineError, PipelineResult};
use ak_protocol::run_models::RunParams;
use std::path::{Path, PathBuf};

/// Values substituted into `{case_dir}`, `{stage_dir}` and `{flow_rate}`.
#[derive(Debug, Clone)]
pub struct Placeholders {
    pub case_dir: PathBuf,
    pub stage_dir: Option<PathBuf>,
    pub flow_rate: Option<String>,
}

impl Placeholders {
    pub fn new(case_dir: &Path, params: &RunParams) -> Self {
        Self {
            case_dir: case_dir.to_path_buf(),
            stage_dir: None,
            flow_rate: params.flow_rate_label(),
        }
    }

    pub fn with_stage_dir(mut self, stage_dir: &Path) -> Self {
        self.stage_dir = Some(stage_dir.to_path_buf());
        self
    }

    /// Expand every placeholder in `template`.
    ///
    /// Returns the name of the first placeholder that has no value.
    pub fn expand(&self, template: &str) -> Result<String, &'static str> {
        let mut out = template.replace("{case_dir}", &self.case_dir.to_string_lossy());

        if out.contains("{stage_dir}") {
            let stage_dir = self.stage_dir.as_deref().ok_or("stage_dir")?;
            out = out.replace("{stage_dir}", &stage_dir.to_string_lossy());
        }
        if out.contains("{flow_rate}") {
            let rate = self.flow_rate.as_deref().ok_or("flow_rate")?;
            out = out.replace("{flow_rate}", rate);
        }
        Ok(out)
    }

    /// Expand `template` for `stage`, reporting a missing value as a setup
    /// error of that stage.
    pub fn expand_for(&self, stage: &str, template: &str) -> PipelineResult<String> {
        self.expand(template)
            .map_err(|missing| PipelineError::StageSetup {
                stage: stage.to_string(),
                reason: format!("'{template}' needs a value for {{{missing}}}"),
            })
    }
}
