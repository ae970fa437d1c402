//! `airway`: command line front end for airway-kit.
//!
//! Drives the orchestration core for one clinical case at a time. Progress
//! events are printed as they arrive; Ctrl-C requests cancellation and the
//! process exits once every stage subprocess has been torn down.

mod render;

use ak_core::artifacts::resolver::ArtifactResolver;
use ak_core::config::loader::load_config;
use ak_core::config::models::AppConfig;
use ak_core::init::{generate_workspace, InitOptions};
use ak_core::state::manager::RunManager;
use ak_protocol::pipeline_models::PipelineDefinition;
use ak_protocol::run_models::{ResumeMode, RunParams, RunStatus};
use clap::{Args, Parser, Subcommand};
use color_eyre::eyre::{bail, eyre};
use color_eyre::Result;
use render::Renderer;
use std::path::PathBuf;
use std::process::ExitCode;
use tokio::sync::mpsc;
use tracing_subscriber::EnvFilter;

/// Exit code used when a run ends because of Ctrl-C.
const EXIT_CANCELLED: u8 = 130;

#[derive(Parser)]
#[command(name = "airway", version, about = "Airway CFD pipeline runner")]
struct Cli {
    /// Directory containing the `.airway/` workspace.
    #[arg(long, global = true, default_value = ".")]
    root: PathBuf,

    /// Print events and results as JSON lines.
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a `.airway/` workspace from the built-in templates.
    Init {
        /// Overwrite template files in an existing workspace.
        #[arg(long)]
        force: bool,

        /// Only write the default pipeline.
        #[arg(long)]
        minimal: bool,
    },

    /// Process a case, reusing every stage whose artifacts are complete.
    Run(RunArgs),

    /// Show which stages of a case have valid artifacts.
    Status(CaseArgs),

    /// Delete the output of a stage that did not complete.
    Cleanup {
        #[command(flatten)]
        case: CaseArgs,

        /// Stage whose output is removed.
        #[arg(long)]
        stage: String,
    },

    /// List configured pipelines.
    Pipelines,
}

#[derive(Args)]
struct CaseArgs {
    /// Case directory.
    #[arg(long)]
    case: PathBuf,

    /// Pipeline to use; defaults to the only configured one or `airway-cfd`.
    #[arg(long)]
    pipeline: Option<String>,

    /// Inspiratory flow rate in L/min.
    #[arg(long, value_parser = parse_flow_rate)]
    flow_rate: Option<f64>,
}

fn parse_flow_rate(value: &str) -> std::result::Result<f64, String> {
    let rate: f64 = value.parse().map_err(|e| format!("{e}"))?;
    match RunParams::with_flow_rate(rate).invalid_reason() {
        Some(reason) => Err(reason),
        None => Ok(rate),
    }
}

impl CaseArgs {
    fn params(&self) -> RunParams {
        RunParams {
            flow_rate: self.flow_rate,
        }
    }

    fn pipeline<'a>(&self, config: &'a AppConfig) -> Result<&'a PipelineDefinition> {
        match &self.pipeline {
            Some(name) => config
                .pipeline(name)
                .ok_or_else(|| eyre!("no pipeline named '{name}' is configured")),
            None => config
                .default_pipeline()
                .ok_or_else(|| eyre!("no default pipeline; run `airway init` or pass --pipeline")),
        }
    }
}

#[derive(Args)]
struct RunArgs {
    #[command(flatten)]
    case: CaseArgs,

    /// Recompute this stage even if its artifacts are complete. Repeatable.
    #[arg(long = "rerun", value_name = "STAGE")]
    rerun: Vec<String>,

    /// Recompute every stage.
    #[arg(long, conflicts_with = "rerun")]
    rerun_all: bool,

    /// Also print raw tool output.
    #[arg(short, long)]
    verbose: bool,
}

impl RunArgs {
    fn resume(&self) -> ResumeMode {
        if self.rerun_all {
            ResumeMode::RerunAll
        } else if !self.rerun.is_empty() {
            ResumeMode::Rerun(self.rerun.clone())
        } else {
            ResumeMode::ReuseExisting
        }
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .try_init();
}

#[tokio::main]
async fn main() -> Result<ExitCode> {
    color_eyre::install()?;
    init_logging();

    let cli = Cli::parse();
    let renderer = Renderer::new(cli.json);

    match cli.command {
        Commands::Init { force, minimal } => {
            let written = generate_workspace(InitOptions {
                target_dir: cli.root,
                force,
                minimal,
            })
            .await?;
            renderer.written(&written);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Run(args) => run_case(cli.root, args, renderer).await,
        Commands::Status(case) => {
            let config = load_config(&cli.root).await?;
            let pipeline = case.pipeline(&config)?;
            let params = case.params();
            for stage in &pipeline.stages {
                let record =
                    ArtifactResolver::resolve(&stage.name, &stage.artifacts, &case.case, &params)?
                        .record;
                renderer.artifact(&record);
            }
            Ok(ExitCode::SUCCESS)
        }
        Commands::Cleanup { case, stage } => {
            let config = load_config(&cli.root).await?;
            let pipeline = case.pipeline(&config)?;
            let params = case.params();
            let definition = pipeline
                .stage(&stage)
                .ok_or_else(|| eyre!("pipeline '{}' has no stage '{stage}'", pipeline.name))?;

            let resolution =
                ArtifactResolver::resolve(&stage, &definition.artifacts, &case.case, &params)?;
            if resolution.skip {
                bail!("artifacts of stage '{stage}' are complete; use `run --rerun {stage}` to recompute them");
            }
            let removed =
                ArtifactResolver::cleanup(&stage, &definition.artifacts, &case.case, &params)?;
            renderer.cleanup(&stage, removed);
            Ok(ExitCode::SUCCESS)
        }
        Commands::Pipelines => {
            let config = load_config(&cli.root).await?;
            renderer.pipelines(&config.pipelines);
            Ok(ExitCode::SUCCESS)
        }
    }
}

async fn run_case(root: PathBuf, args: RunArgs, renderer: Renderer) -> Result<ExitCode> {
    let config = load_config(&root).await?;
    let pipeline_name = args.case.pipeline(&config)?.name.clone();
    let (events_tx, mut events_rx) = mpsc::channel(config.global.event_buffer);
    let manager = RunManager::new(config, events_tx);

    let handle = manager
        .start_run(
            &args.case.case,
            &pipeline_name,
            args.case.params(),
            args.resume(),
        )
        .await?;

    let interrupt = handle.clone();
    tokio::spawn(async move {
        while tokio::signal::ctrl_c().await.is_ok() {
            if interrupt.cancel() {
                tracing::warn!("cancellation requested, stopping the current stage");
            }
        }
    });

    let renderer = renderer.verbose(args.verbose);
    let wait = handle.wait();
    tokio::pin!(wait);
    let report = loop {
        tokio::select! {
            Some(event) = events_rx.recv() => renderer.event(&event),
            report = &mut wait => break report,
        }
    };
    while let Ok(event) = events_rx.try_recv() {
        renderer.event(&event);
    }
    renderer.summary(&report);

    Ok(match report.status {
        RunStatus::Completed => ExitCode::SUCCESS,
        RunStatus::Cancelled | RunStatus::Cancelling => ExitCode::from(EXIT_CANCELLED),
        _ => ExitCode::FAILURE,
    })
}
