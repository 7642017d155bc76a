//! MIDT CLI - Command-line interface for the MID task pipeline
//!
//! Commands:
//! - run: Execute the extraction stages of a configured pipeline run
//! - events: Decode one behavioral timing file into a BIDS events table
//! - motion: Extract motion regressors and QC summary from one confounds file
//! - check-config: Validate a configuration file and report the derived layout
//!
//! First-level model fitting requires an embedded GLM engine and is only
//! available through the library API; `run` executes timing and motion
//! extraction and reports the ledger.

use clap::{Parser, Subcommand};
use std::fs;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::warn;
use tracing_subscriber::EnvFilter;

use midt_pipeline::config::PipelineConfig;
use midt_pipeline::error::PipelineError;
use midt_pipeline::events::{decode_timing_file, EventTimingParams};
use midt_pipeline::first_level::{
    ConfoundsMatrix, FirstLevelSpec, FittedModel, ModelFitEngine,
};
use midt_pipeline::motion::{run_motion_extraction, write_qc_report};
use midt_pipeline::pipeline::Pipeline;
use midt_pipeline::PIPELINE_VERSION;

/// MIDT - First-level analysis pipeline for the monetary incentive delay task
#[derive(Parser)]
#[command(name = "midt")]
#[command(version = PIPELINE_VERSION)]
#[command(about = "Behavioral event extraction, motion QC, and run orchestration", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Execute the extraction stages of a configured run
    Run {
        /// Configuration file (JSON)
        #[arg(short, long)]
        config: PathBuf,

        /// Worker pool size for per-subject fan-out
        #[arg(short = 'j', long, default_value = "1")]
        jobs: usize,

        /// Write the run summary as JSON to this path
        #[arg(long)]
        summary: Option<PathBuf>,
    },

    /// Decode one behavioral timing file into a BIDS events table
    Events {
        /// Raw timing log
        #[arg(short, long)]
        input: PathBuf,

        /// Directory for the events table
        #[arg(short, long)]
        output_dir: PathBuf,

        /// Session identifier
        #[arg(long, default_value = "1")]
        session: String,

        /// Subject ID override (otherwise resolved from the filename)
        #[arg(long)]
        subject: Option<String>,

        /// Repetition time in seconds
        #[arg(long, default_value = "1.6")]
        tr: f64,

        /// Leading dummy volumes removed from the functional series
        #[arg(long, default_value = "5")]
        dummy_scans: usize,

        /// Task label for output naming
        #[arg(long, default_value = "MIDT")]
        task: String,
    },

    /// Extract motion regressors and a QC summary from one confounds file
    Motion {
        /// fMRIPrep confounds time series (TSV)
        #[arg(short, long)]
        input: PathBuf,

        /// Path for the motion regressor matrix
        #[arg(short, long)]
        output: PathBuf,

        /// Subject identifier for the QC record
        #[arg(long)]
        subject: String,

        /// Session identifier
        #[arg(long, default_value = "1")]
        session: String,

        /// Leading dummy volumes to drop
        #[arg(long, default_value = "5")]
        dummy_scans: usize,

        /// Directory for the aggregate QC report (skipped when absent)
        #[arg(long)]
        qc_dir: Option<PathBuf>,
    },

    /// Validate a configuration file and report the derived output layout
    CheckConfig {
        /// Configuration file (JSON)
        #[arg(short, long)]
        config: PathBuf,
    },
}

/// Placeholder engine for extraction-only CLI runs. Model fitting is
/// library-only; reaching this engine is a usage error.
struct UnavailableEngine;

impl ModelFitEngine for UnavailableEngine {
    fn volume_count(&self, _functional: &Path) -> Result<usize, PipelineError> {
        Err(PipelineError::ModelFit(
            "no model-fit engine linked into this binary".to_string(),
        ))
    }

    fn fit(
        &self,
        _spec: &FirstLevelSpec,
        _functional: &Path,
        _events: &Path,
        _confounds: &ConfoundsMatrix,
    ) -> Result<Box<dyn FittedModel>, PipelineError> {
        Err(PipelineError::ModelFit(
            "no model-fit engine linked into this binary".to_string(),
        ))
    }
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match run_command(cli.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("error: {e}");
            ExitCode::FAILURE
        }
    }
}

fn run_command(command: Commands) -> Result<(), PipelineError> {
    match command {
        Commands::Run {
            config,
            jobs,
            summary,
        } => {
            let mut config = PipelineConfig::from_json_file(&config)?;
            if config.run_first_level {
                warn!("first-level analysis requires an embedded model-fit engine; running extraction stages only");
                config.run_first_level = false;
            }

            let engine = UnavailableEngine;
            let result = Pipeline::new(config, &engine)
                .with_parallelism(jobs)
                .run()?;

            println!(
                "run {} completed: {}/{} subjects succeeded across {} session(s)",
                result.run_id,
                result.successful_subjects,
                result.total_subjects,
                result.sessions.len(),
            );
            for failed in &result.failed_subjects {
                println!("  failed: {failed}");
            }
            if let Some(path) = summary {
                fs::write(&path, serde_json::to_string_pretty(&result)?)?;
                println!("summary written to {}", path.display());
            }
            Ok(())
        }

        Commands::Events {
            input,
            output_dir,
            session,
            subject,
            tr,
            dummy_scans,
            task,
        } => {
            let params = EventTimingParams {
                tr,
                dummy_scans,
                task,
            };
            let decoded =
                decode_timing_file(&input, &output_dir, &session, &params, subject.as_deref())?;
            println!(
                "{}: {} events written to {}",
                decoded.subject_id,
                decoded.events.len(),
                decoded.output_file.display(),
            );
            Ok(())
        }

        Commands::Motion {
            input,
            output,
            subject,
            session,
            dummy_scans,
            qc_dir,
        } => {
            let params: Vec<String> =
                ["trans_x", "trans_y", "trans_z", "rot_x", "rot_y", "rot_z"]
                    .iter()
                    .map(|s| s.to_string())
                    .collect();
            let qc = run_motion_extraction(
                &input,
                &output,
                &subject,
                &session,
                &params,
                dummy_scans,
            )?;
            println!(
                "{}: {} volumes, max motion {:.4} mm, regressors written to {}",
                qc.subject_id,
                qc.n_volumes,
                qc.max_motion_mm,
                output.display(),
            );
            if let Some(dir) = qc_dir {
                let report = write_qc_report(&[qc], &dir)?;
                println!("QC report written to {}", report.display());
            }
            Ok(())
        }

        Commands::CheckConfig { config } => {
            let config = PipelineConfig::from_json_file(&config)?;
            println!("configuration is valid");
            println!("  subjects:    {}", config.subject_ids.len());
            println!("  sessions:    {}", config.sessions_to_process.join(", "));
            println!("  exclusions:  {}", config.excluded_subjects.len());
            println!("  timing out:  {}", config.timing_dir().display());
            println!("  motion out:  {}", config.motion_regressor_dir().display());
            println!("  model out:   {}", config.first_level_dir().display());
            println!("  qc out:      {}", config.qc_dir().display());
            Ok(())
        }
    }
}
