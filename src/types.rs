//! Core types for the MID task pipeline
//!
//! This module defines the data structures that flow through each stage of the
//! pipeline: task events, motion traces and QC records, and the per-run
//! success/failure ledger.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Trial-type classification for a task event.
///
/// Closed set: two anticipation conditions plus four feedback conditions
/// split by reward/neutral cue and by response accuracy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TrialType {
    #[serde(rename = "anticipation-reward")]
    AnticipationReward,
    #[serde(rename = "anticipation-neutral")]
    AnticipationNeutral,
    #[serde(rename = "feedback-reward-success")]
    FeedbackRewardSuccess,
    #[serde(rename = "feedback-reward-failure")]
    FeedbackRewardFailure,
    #[serde(rename = "feedback-neutral-success")]
    FeedbackNeutralSuccess,
    #[serde(rename = "feedback-neutral-failure")]
    FeedbackNeutralFailure,
}

impl TrialType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrialType::AnticipationReward => "anticipation-reward",
            TrialType::AnticipationNeutral => "anticipation-neutral",
            TrialType::FeedbackRewardSuccess => "feedback-reward-success",
            TrialType::FeedbackRewardFailure => "feedback-reward-failure",
            TrialType::FeedbackNeutralSuccess => "feedback-neutral-success",
            TrialType::FeedbackNeutralFailure => "feedback-neutral-failure",
        }
    }

    /// All six labels in canonical order (anticipation first, then feedback).
    pub const ALL: [TrialType; 6] = [
        TrialType::AnticipationReward,
        TrialType::AnticipationNeutral,
        TrialType::FeedbackRewardSuccess,
        TrialType::FeedbackRewardFailure,
        TrialType::FeedbackNeutralSuccess,
        TrialType::FeedbackNeutralFailure,
    ];
}

impl std::fmt::Display for TrialType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One scanner-clock-aligned task event, as written to the BIDS events table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    /// Onset in seconds, relative to the first retained functional volume
    pub onset: f64,
    /// Duration in seconds
    pub duration: f64,
    /// Trial-type label
    pub trial_type: TrialType,
    /// Accuracy flag from the behavioral log (1 = correct)
    pub accuracy: Option<i64>,
    /// Response time in seconds, when the log provides one
    pub response_time: Option<f64>,
}

/// Motion parameter matrix for one subject/session, post dummy-scan removal.
///
/// Columns hold only the parameters actually present in the source confounds
/// table; absent parameters are omitted, never zero-filled.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionTrace {
    /// Parameter names, in the order the columns were extracted
    pub parameters: Vec<String>,
    /// Column-major data: `columns[i]` holds all volumes for `parameters[i]`
    pub columns: Vec<Vec<f64>>,
}

impl MotionTrace {
    /// Number of retained volumes (rows)
    pub fn n_volumes(&self) -> usize {
        self.columns.first().map_or(0, |c| c.len())
    }

    /// Number of available parameters (columns)
    pub fn n_parameters(&self) -> usize {
        self.columns.len()
    }

    /// One volume's values across all available parameters
    pub fn row(&self, volume: usize) -> Vec<f64> {
        self.columns.iter().map(|c| c[volume]).collect()
    }
}

/// Per-subject/session motion quality-control aggregate.
///
/// Magnitude fields are NaN when the corresponding parameter class
/// (translation or rotation) was absent from the source confounds; NaN means
/// "unavailable", which is distinct from zero motion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MotionQcRecord {
    pub subject_id: String,
    pub session: String,
    /// Maximum per-volume Euclidean translation displacement (mm)
    pub max_motion_mm: f64,
    /// Mean per-volume Euclidean translation displacement (mm)
    pub mean_motion_mm: f64,
    /// Standard deviation of the Euclidean displacement (mm)
    pub std_motion_mm: f64,
    /// Maximum absolute single-axis displacement (mm)
    pub max_abs_displacement_mm: f64,
    /// Mean absolute single-axis displacement (mm)
    pub mean_abs_displacement_mm: f64,
    /// Maximum absolute rotation, pooled across axes (degrees)
    pub max_rotation_deg: f64,
    /// Mean absolute rotation, pooled across axes (degrees)
    pub mean_rotation_deg: f64,
    /// Retained volume count after dummy-scan removal
    pub n_volumes: usize,
    /// Motion parameters actually found in the confounds table
    pub available_params: Vec<String>,
}

/// Pipeline stage identifiers, used for status logging and ledger tags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    NotStarted,
    TimingExtraction,
    MotionExtraction,
    PerSubjectAnalysis,
    Done,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::NotStarted => "not_started",
            Stage::TimingExtraction => "timing_extraction",
            Stage::MotionExtraction => "motion_extraction",
            Stage::PerSubjectAnalysis => "first_level_analysis",
            Stage::Done => "done",
        }
    }
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome status for one unit of per-subject work
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum OutcomeStatus {
    Success,
    Failed { reason: String },
}

impl OutcomeStatus {
    pub fn is_success(&self) -> bool {
        matches!(self, OutcomeStatus::Success)
    }
}

/// Ledger entry for one subject at one stage of one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubjectOutcome {
    pub subject_id: String,
    pub session: String,
    pub stage: Stage,
    #[serde(flatten)]
    pub status: OutcomeStatus,
}

/// Accumulated success/failure counts for one session
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionSummary {
    pub session: String,
    pub total_subjects: usize,
    pub successful_subjects: usize,
    pub failed_subjects: Vec<String>,
    /// True when an entire stage yielded zero successes and the session was
    /// abandoned before per-subject analysis
    pub abandoned: bool,
}

impl SessionSummary {
    pub fn new(session: &str, total_subjects: usize) -> Self {
        Self {
            session: session.to_string(),
            total_subjects,
            successful_subjects: 0,
            failed_subjects: Vec::new(),
            abandoned: false,
        }
    }
}

/// Whole-run summary, finalized once at the end of a pipeline run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub sessions_processed: Vec<String>,
    pub sessions: Vec<SessionSummary>,
    pub total_subjects: usize,
    pub successful_subjects: usize,
    pub failed_subjects: Vec<String>,
    /// Full per-subject/per-stage ledger
    pub outcomes: Vec<SubjectOutcome>,
}

impl PipelineSummary {
    /// Fraction of subjects that succeeded, or None for an empty run
    pub fn success_rate(&self) -> Option<f64> {
        if self.total_subjects == 0 {
            None
        } else {
            Some(self.successful_subjects as f64 / self.total_subjects as f64)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn trial_type_labels_are_the_closed_six() {
        let labels: Vec<&str> = TrialType::ALL.iter().map(|t| t.as_str()).collect();
        assert_eq!(
            labels,
            vec![
                "anticipation-reward",
                "anticipation-neutral",
                "feedback-reward-success",
                "feedback-reward-failure",
                "feedback-neutral-success",
                "feedback-neutral-failure",
            ]
        );
    }

    #[test]
    fn trial_type_serializes_to_label() {
        let json = serde_json::to_string(&TrialType::FeedbackRewardFailure).unwrap();
        assert_eq!(json, "\"feedback-reward-failure\"");
    }

    #[test]
    fn motion_trace_shape() {
        let trace = MotionTrace {
            parameters: vec!["trans_x".into(), "trans_y".into()],
            columns: vec![vec![0.1, 0.2, 0.3], vec![0.0, -0.1, 0.05]],
        };
        assert_eq!(trace.n_volumes(), 3);
        assert_eq!(trace.n_parameters(), 2);
        assert_eq!(trace.row(1), vec![0.2, -0.1]);
    }

    #[test]
    fn summary_success_rate() {
        let summary = PipelineSummary {
            run_id: Uuid::new_v4(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            sessions_processed: vec!["1".into()],
            sessions: vec![],
            total_subjects: 4,
            successful_subjects: 3,
            failed_subjects: vec!["sub-004".into()],
            outcomes: vec![],
        };
        assert_eq!(summary.success_rate(), Some(0.75));
    }
}
