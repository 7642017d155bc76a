//! MIDT Pipeline - First-level analysis core for the monetary incentive delay task
//!
//! Transforms raw study data into per-subject statistical results through a
//! staged pipeline: behavioral timing decoding → motion quality control →
//! first-level GLM analysis with symbolic contrast resolution.
//!
//! ## Modules
//!
//! - **events**: Decode raw behavioral timing logs into BIDS event tables
//! - **motion**: Extract motion regressors and QC summaries from fMRIPrep confounds
//! - **contrasts**: Resolve the symbolic contrast catalogue against realized designs
//! - **first_level**: Drive one subject/session through the external GLM engine
//! - **pipeline**: Orchestrate sessions and subjects with failure isolation

pub mod config;
pub mod contrasts;
pub mod error;
pub mod events;
pub mod first_level;
pub mod motion;
pub mod pipeline;
pub mod types;

pub use config::{PipelineConfig, SessionView};
pub use error::PipelineError;
pub use first_level::{ModelFitEngine, SubjectAnalysis};
pub use pipeline::Pipeline;
pub use types::{Event, MotionQcRecord, PipelineSummary, SubjectOutcome, TrialType};

/// Crate version reported by the CLI
pub const PIPELINE_VERSION: &str = env!("CARGO_PKG_VERSION");
