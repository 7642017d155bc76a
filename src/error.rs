//! Error types for the MID task pipeline

use std::path::PathBuf;
use thiserror::Error;

/// Errors that can occur during pipeline processing
#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("Could not resolve subject ID from filename: {0}")]
    SubjectIdentification(String),

    #[error("Timing file has no data rows after header parsing: {0}")]
    EmptyTimingFile(PathBuf),

    #[error("No valid trials found in timing file: {0}")]
    NoValidTrials(PathBuf),

    #[error("No configured motion parameters found in confounds file: {0}")]
    NoMotionParameters(PathBuf),

    #[error("Required input file not found: {0}")]
    MissingInputFile(PathBuf),

    #[error("Timepoint mismatch: functional has {functional} volumes, confounds have {confounds} rows (dummy scans: {dummy_scans})")]
    TimepointMismatch {
        functional: usize,
        confounds: usize,
        dummy_scans: usize,
    },

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid events table: {0}")]
    InvalidEvents(String),

    #[error("Invalid JSON: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("I/O error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Model fit failed: {0}")]
    ModelFit(String),
}
