//! Terminal output for core events and command results.
//!
//! Human readable text goes to stdout; with `--json` every event or result
//! is printed as one JSON object per line instead.

use ak_core::artifacts::{ArtifactRecord, Validity};
use ak_protocol::ipc::Event;
use ak_protocol::pipeline_models::PipelineDefinition;
use ak_protocol::run_models::{RunReport, RunStatus, StageStatus};
use colored::Colorize;
use serde_json::json;
use std::path::PathBuf;

#[derive(Debug, Clone, Copy)]
pub struct Renderer {
    json: bool,
    verbose: bool,
}

impl Renderer {
    pub fn new(json: bool) -> Self {
        Self {
            json,
            verbose: false,
        }
    }

    pub fn verbose(mut self, verbose: bool) -> Self {
        self.verbose = verbose;
        self
    }

    pub fn event(&self, event: &Event) {
        if self.json {
            if let Ok(line) = serde_json::to_string(event) {
                println!("{line}");
            }
        } else if let Some(line) = format_event(event, self.verbose) {
            println!("{line}");
        }
    }

    pub fn summary(&self, report: &RunReport) {
        if self.json {
            print_json(&json!({ "report": report }));
            return;
        }
        let reused = report.stages.iter().filter(|s| s.skipped).count();
        let line = format!(
            "{} stages, {reused} reused, {:.1}% done",
            report.stages.len(),
            report.progress
        );
        println!("{} {line}", status_label(report.status));
    }

    pub fn artifact(&self, record: &ArtifactRecord) {
        if self.json {
            print_json(&json!({
                "stage": record.stage,
                "root": record.root,
                "validity": validity_label(&record.validity),
                "missing": record.missing,
                "highest_step": record.steps.and_then(|s| s.highest),
            }));
        } else {
            println!("{}", format_artifact(record));
        }
    }

    pub fn cleanup(&self, stage: &str, removed: bool) {
        if self.json {
            print_json(&json!({ "stage": stage, "removed": removed }));
        } else if removed {
            println!("{} removed output of {stage}", "✓".green());
        } else {
            println!("nothing to remove for {stage}");
        }
    }

    pub fn pipelines(&self, pipelines: &[PipelineDefinition]) {
        if self.json {
            print_json(&json!({ "pipelines": pipelines }));
            return;
        }
        if pipelines.is_empty() {
            println!("no pipelines configured; run `airway init`");
        }
        for pipeline in pipelines {
            println!("{}", pipeline.name.bold());
            for stage in &pipeline.stages {
                println!(
                    "  {:<20} {:>5.1}% .. {:>5.1}%",
                    stage.name,
                    stage.progress.base,
                    stage.progress.end()
                );
            }
        }
    }

    pub fn written(&self, paths: &[PathBuf]) {
        if self.json {
            print_json(&json!({ "written": paths }));
            return;
        }
        for path in paths {
            println!("{} {}", "created".green(), path.display());
        }
    }
}

fn print_json(value: &serde_json::Value) {
    println!("{value}");
}

/// Text line for an event, `None` when the event is not shown.
pub fn format_event(event: &Event, verbose: bool) -> Option<String> {
    match event {
        Event::RunStarted {
            pipeline_name,
            case_dir,
            params,
            ..
        } => Some(format!(
            "{} {pipeline_name} on {} ({})",
            "▶".cyan(),
            case_dir.display(),
            params.key()
        )),
        Event::RunStatusUpdate { status, .. } => {
            (*status == RunStatus::Cancelling).then(|| format!("{}", "cancelling…".yellow()))
        }
        Event::StageStatusUpdate {
            stage,
            status,
            skipped,
            ..
        } => match status {
            StageStatus::Pending => None,
            StageStatus::Running => Some(format!("{} {stage}", "→".cyan())),
            StageStatus::Completed if *skipped => {
                Some(format!("{} {stage} (reused)", "✓".dimmed()))
            }
            StageStatus::Completed => Some(format!("{} {stage}", "✓".green())),
            StageStatus::Failed => Some(format!("{} {stage}", "✗".red())),
            StageStatus::Cancelled => Some(format!("{} {stage}", "■".yellow())),
        },
        Event::Progress { event, .. } => match &event.raw_line {
            Some(raw) if verbose => Some(format!("  {}", raw.dimmed())),
            Some(_) => None,
            None => Some(format!(
                "[{:>5.1}%] {}: {}",
                event.percent, event.stage, event.message
            )),
        },
        Event::RunCompleted { .. } => None,
        Event::RunFailed {
            stage,
            error,
            stderr_tail,
            ..
        } => {
            let mut text = format!("{} {stage}: {error}", "error".red().bold());
            if !stderr_tail.is_empty() {
                text.push('\n');
                text.push_str(stderr_tail.trim_end());
            }
            Some(text)
        }
        Event::RunCancelled { stage, .. } => Some(match stage {
            Some(stage) => format!("{} during {stage}", "cancelled".yellow()),
            None => format!("{}", "cancelled".yellow()),
        }),
        Event::CleanupFinished { stage, removed, .. } => {
            Some(format!("cleanup {stage}: removed={removed}"))
        }
    }
}

pub fn validity_label(validity: &Validity) -> String {
    match validity {
        Validity::Complete => "complete".to_string(),
        Validity::Missing => "missing".to_string(),
        Validity::Incomplete { reason } => format!("incomplete: {reason}"),
        Validity::PartialWrite => "interrupted".to_string(),
    }
}

fn format_artifact(record: &ArtifactRecord) -> String {
    let label = validity_label(&record.validity);
    let label = match record.validity {
        Validity::Complete => label.green(),
        Validity::Missing => label.dimmed(),
        Validity::Incomplete { .. } | Validity::PartialWrite => label.yellow(),
    };
    format!("{:<20} {label}  {}", record.stage, record.root.display())
}

fn status_label(status: RunStatus) -> colored::ColoredString {
    match status {
        RunStatus::Completed => "completed".green().bold(),
        RunStatus::Failed => "failed".red().bold(),
        RunStatus::Cancelled | RunStatus::Cancelling => "cancelled".yellow().bold(),
        RunStatus::Pending | RunStatus::Running => "running".normal(),
    }
}
