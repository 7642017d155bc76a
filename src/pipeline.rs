//! Pipeline orchestration
//!
//! Sequences timing extraction, motion extraction, and per-subject
//! first-level analysis across sessions. Failures are isolated at the
//! subject boundary and recorded in a ledger; a session is abandoned only
//! when an entire stage yields zero successes. Per-subject analysis can fan
//! out over a fixed-size worker pool; subjects are stateless with respect to
//! each other, so the pool needs no coordination beyond a shared work queue.

use std::collections::VecDeque;
use std::fs;
use std::path::PathBuf;
use std::sync::{mpsc, Mutex};
use std::thread;
use chrono::Utc;
use tracing::{info, warn};
use uuid::Uuid;

use crate::config::{PipelineConfig, SessionView};
use crate::error::PipelineError;
use crate::events::{decode_timing_file, EventTimingParams};
use crate::first_level::{run_first_level, ModelFitEngine, SubjectAnalysis};
use crate::motion::{run_motion_extraction, write_qc_report};
use crate::types::{
    MotionQcRecord, OutcomeStatus, PipelineSummary, SessionSummary, Stage, SubjectOutcome,
};

/// Drives one complete pipeline run against an external model-fit engine.
pub struct Pipeline<'e> {
    config: PipelineConfig,
    engine: &'e dyn ModelFitEngine,
    n_jobs: usize,
}

impl<'e> Pipeline<'e> {
    pub fn new(config: PipelineConfig, engine: &'e dyn ModelFitEngine) -> Self {
        Self {
            config,
            engine,
            n_jobs: 1,
        }
    }

    /// Size of the per-subject analysis worker pool. 1 runs inline.
    pub fn with_parallelism(mut self, n_jobs: usize) -> Self {
        self.n_jobs = n_jobs.max(1);
        self
    }

    /// Execute every configured session and finalize the run summary.
    pub fn run(&self) -> Result<PipelineSummary, PipelineError> {
        let run_id = Uuid::new_v4();
        let started_at = Utc::now();
        info!(%run_id, "starting MID task pipeline");

        self.config.create_output_directories()?;

        let mut sessions = Vec::new();
        let mut outcomes = Vec::new();

        for session in &self.config.sessions_to_process {
            let view = self.config.session_view(session);
            if view.subjects.is_empty() {
                warn!(session = %session, "no eligible subjects, skipping session");
                continue;
            }

            info!(
                session = %session,
                subjects = view.subjects.len(),
                "processing session"
            );
            let (summary, session_outcomes) = self.process_session(&view);
            info!(
                session = %session,
                succeeded = summary.successful_subjects,
                total = summary.total_subjects,
                abandoned = summary.abandoned,
                "session completed"
            );
            sessions.push(summary);
            outcomes.extend(session_outcomes);
        }

        // Finalized once; session summaries are never recomputed mid-run.
        let total_subjects = sessions.iter().map(|s| s.total_subjects).sum();
        let successful_subjects = sessions.iter().map(|s| s.successful_subjects).sum();
        let failed_subjects: Vec<String> = sessions
            .iter()
            .flat_map(|s| s.failed_subjects.iter().cloned())
            .collect();

        let summary = PipelineSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            sessions_processed: sessions.iter().map(|s| s.session.clone()).collect(),
            sessions,
            total_subjects,
            successful_subjects,
            failed_subjects,
            outcomes,
        };

        info!(
            total = summary.total_subjects,
            succeeded = summary.successful_subjects,
            failed = summary.failed_subjects.len(),
            "pipeline finished"
        );
        Ok(summary)
    }

    /// Run the three stages for one session. Stage gates: zero successes in
    /// timing or motion extraction abandon the session before any subject
    /// reaches analysis.
    fn process_session(&self, view: &SessionView) -> (SessionSummary, Vec<SubjectOutcome>) {
        let mut summary = SessionSummary::new(&view.session, view.subjects.len());
        let mut outcomes = Vec::new();

        if self.config.run_timing_extraction {
            let timing_outcomes = self.extract_timing_for_session(&view.session);
            let successes = timing_outcomes.iter().filter(|o| o.status.is_success()).count();
            outcomes.extend(timing_outcomes);
            if successes == 0 {
                warn!(session = %view.session, "timing extraction yielded no successes, abandoning session");
                summary.abandoned = true;
                return (summary, outcomes);
            }
        }

        if self.config.run_motion_extraction {
            let motion_outcomes = self.extract_motion_for_session(view);
            let successes = motion_outcomes.iter().filter(|o| o.status.is_success()).count();
            outcomes.extend(motion_outcomes);
            if successes == 0 {
                warn!(session = %view.session, "motion extraction yielded no successes, abandoning session");
                summary.abandoned = true;
                return (summary, outcomes);
            }
        }

        if self.config.run_first_level {
            for (subject, result) in self.fan_out_analysis(view) {
                let status = match result {
                    Ok(_) => {
                        summary.successful_subjects += 1;
                        OutcomeStatus::Success
                    }
                    Err(e) => {
                        summary.failed_subjects.push(subject.clone());
                        OutcomeStatus::Failed {
                            reason: e.to_string(),
                        }
                    }
                };
                log_status(Stage::PerSubjectAnalysis, &subject, &status);
                outcomes.push(SubjectOutcome {
                    subject_id: subject,
                    session: view.session.clone(),
                    stage: Stage::PerSubjectAnalysis,
                    status,
                });
            }
        }

        (summary, outcomes)
    }

    /// Decode every discovered timing file once for this session.
    fn extract_timing_for_session(&self, session: &str) -> Vec<SubjectOutcome> {
        let mut outcomes = Vec::new();
        let files = match discover_timing_files(&self.config.behavioral_dir) {
            Ok(files) => files,
            Err(e) => {
                warn!(error = %e, "could not scan behavioral directory");
                return outcomes;
            }
        };
        if files.is_empty() {
            warn!(
                dir = %self.config.behavioral_dir.display(),
                "no timing files found"
            );
            return outcomes;
        }
        info!(count = files.len(), "found timing files");

        let output_dir = self.config.timing_dir().join(format!("ses-{session}"));
        let params = EventTimingParams {
            tr: self.config.tr,
            dummy_scans: self.config.dummy_scans,
            task: self.config.task.clone(),
        };

        for file in files {
            let stem = file
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            let (subject, status) =
                match decode_timing_file(&file, &output_dir, session, &params, None) {
                    Ok(decoded) => (decoded.subject_id, OutcomeStatus::Success),
                    Err(e) => (
                        stem,
                        OutcomeStatus::Failed {
                            reason: e.to_string(),
                        },
                    ),
                };
            log_status(Stage::TimingExtraction, &subject, &status);
            outcomes.push(SubjectOutcome {
                subject_id: subject,
                session: session.to_string(),
                stage: Stage::TimingExtraction,
                status,
            });
        }
        outcomes
    }

    /// Extract motion regressors for every eligible subject and write the
    /// aggregate QC table.
    fn extract_motion_for_session(&self, view: &SessionView) -> Vec<SubjectOutcome> {
        let mut outcomes = Vec::new();
        let mut qc_records: Vec<MotionQcRecord> = Vec::new();

        for subject in &view.subjects {
            let confounds = self.confounds_file(subject, &view.session);
            let output = self.motion_output_file(subject, &view.session);
            let result = if confounds.is_file() {
                run_motion_extraction(
                    &confounds,
                    &output,
                    subject,
                    &view.session,
                    &self.config.motion_params,
                    self.config.dummy_scans,
                )
            } else {
                Err(PipelineError::MissingInputFile(confounds))
            };

            let status = match result {
                Ok(qc) => {
                    info!(
                        subject = %subject,
                        max_motion_mm = qc.max_motion_mm,
                        "motion extraction succeeded"
                    );
                    qc_records.push(qc);
                    OutcomeStatus::Success
                }
                Err(e) => OutcomeStatus::Failed {
                    reason: e.to_string(),
                },
            };
            log_status(Stage::MotionExtraction, subject, &status);
            outcomes.push(SubjectOutcome {
                subject_id: subject.clone(),
                session: view.session.clone(),
                stage: Stage::MotionExtraction,
                status,
            });
        }

        if !qc_records.is_empty() {
            if let Err(e) = write_qc_report(&qc_records, &self.config.motion_regressor_dir()) {
                warn!(error = %e, "could not write motion QC report");
            }
        }
        outcomes
    }

    /// Per-subject analysis, sequentially or through a fixed-size worker
    /// pool. Results carry no ordering guarantee under parallel execution;
    /// every subject appears exactly once.
    fn fan_out_analysis(
        &self,
        view: &SessionView,
    ) -> Vec<(String, Result<SubjectAnalysis, PipelineError>)> {
        let workers = self.n_jobs.min(view.subjects.len());
        if workers <= 1 {
            return view
                .subjects
                .iter()
                .map(|s| {
                    (
                        s.clone(),
                        run_first_level(&self.config, self.engine, s, &view.session),
                    )
                })
                .collect();
        }

        info!(
            subjects = view.subjects.len(),
            workers, "running per-subject analysis in parallel"
        );
        let queue = Mutex::new(VecDeque::from(view.subjects.clone()));
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for _ in 0..workers {
                let tx = tx.clone();
                let queue = &queue;
                scope.spawn(move || loop {
                    let subject = queue.lock().unwrap().pop_front();
                    let Some(subject) = subject else { break };
                    let result =
                        run_first_level(&self.config, self.engine, &subject, &view.session);
                    if tx.send((subject, result)).is_err() {
                        break;
                    }
                });
            }
            drop(tx);
            rx.iter().collect()
        })
    }

    fn confounds_file(&self, subject: &str, session: &str) -> PathBuf {
        self.config
            .fmriprep_dir
            .join(subject)
            .join(format!("ses-{session}"))
            .join("func")
            .join(format!(
                "{subject}_ses-{session}_task-{task}_desc-confounds_timeseries.tsv",
                task = self.config.task
            ))
    }

    fn motion_output_file(&self, subject: &str, session: &str) -> PathBuf {
        self.config
            .motion_regressor_dir()
            .join(format!("ses-{session}"))
            .join(subject)
            .join(format!(
                "{subject}_ses-{session}_task-{task}_Regressors.txt",
                task = self.config.task
            ))
    }
}

/// One status line per stage/subject transition.
fn log_status(stage: Stage, subject: &str, status: &OutcomeStatus) {
    match status {
        OutcomeStatus::Success => info!(stage = %stage, subject = %subject, status = "success"),
        OutcomeStatus::Failed { reason } => {
            warn!(stage = %stage, subject = %subject, status = "failed", reason = %reason)
        }
    }
}

/// Timing files in the behavioral directory. Glob classes tried in order:
/// `*task*.txt`, `Reward_task*.txt`, any `*.txt`; the first non-empty class
/// wins.
fn discover_timing_files(dir: &std::path::Path) -> Result<Vec<PathBuf>, PipelineError> {
    let mut txt_files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| {
            p.is_file() && p.extension().map_or(false, |ext| ext == "txt")
        })
        .collect();
    txt_files.sort();

    let name_of = |p: &PathBuf| {
        p.file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    };

    let task_files: Vec<PathBuf> = txt_files
        .iter()
        .filter(|p| name_of(p).contains("task"))
        .cloned()
        .collect();
    if !task_files.is_empty() {
        return Ok(task_files);
    }

    let reward_files: Vec<PathBuf> = txt_files
        .iter()
        .filter(|p| name_of(p).starts_with("Reward_task"))
        .cloned()
        .collect();
    if !reward_files.is_empty() {
        return Ok(reward_files);
    }

    Ok(txt_files)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::first_level::test_support::MockEngine;
    use pretty_assertions::assert_eq;
    use std::path::Path;

    const ALL_CONDITIONS: [&str; 6] = [
        "anticipation-reward",
        "anticipation-neutral",
        "feedback-reward-success",
        "feedback-reward-failure",
        "feedback-neutral-success",
        "feedback-neutral-failure",
    ];

    const HEADER: &str = "trial_number\tblock\tcue_type\tacc\trt\tmin\tcti_duration\ttarget_duration\titi_duration\tonsettime_cue\tonsettime_target\tonsettime_feedback";

    fn write_timing_log(dir: &Path, subject_num: u32) {
        let mut out = String::from(HEADER);
        out.push('\n');
        for trial in 0..80 {
            let cue = if trial % 2 == 0 { "reward" } else { "neutral" };
            let base = 10_000 + trial * 8_000;
            out.push_str(&format!(
                "{}\t1\t{cue}\t{}\t400\t0\t2000\t300\t4000\t{base}\t{}\t{}\n",
                trial + 1,
                trial % 2,
                base + 2_000,
                base + 4_000,
            ));
        }
        fs::write(
            dir.join(format!("Reward_task_sub{subject_num:03}_reward.txt")),
            out,
        )
        .unwrap();
    }

    fn write_confounds(config: &PipelineConfig, subject: &str, session: &str, n_rows: usize) {
        let func_dir = config
            .fmriprep_dir
            .join(subject)
            .join(format!("ses-{session}"))
            .join("func");
        fs::create_dir_all(&func_dir).unwrap();
        let mut out = String::from("trans_x\ttrans_y\ttrans_z\trot_x\trot_y\trot_z\n");
        for _ in 0..n_rows {
            out.push_str("0.01\t0.02\t0.01\t0.0001\t0.0002\t0.0001\n");
        }
        fs::write(
            func_dir.join(format!(
                "{subject}_ses-{session}_task-MIDT_desc-confounds_timeseries.tsv"
            )),
            out,
        )
        .unwrap();
    }

    fn write_functional(config: &PipelineConfig, subject: &str, session: &str) {
        let func_dir = config
            .fmriprep_dir
            .join(subject)
            .join(format!("ses-{session}"))
            .join("func");
        fs::create_dir_all(&func_dir).unwrap();
        fs::write(
            func_dir.join(format!(
                "{subject}_ses-{session}_task-MIDT_space-MNI152NLin2009cAsym_desc-preproc_bold.nii.gz"
            )),
            b"nifti",
        )
        .unwrap();
    }

    fn test_config(base: &Path, subjects: &[&str]) -> PipelineConfig {
        let behavioral = base.join("behavioral");
        let fmriprep = base.join("fmriprep");
        fs::create_dir_all(&behavioral).unwrap();
        fs::create_dir_all(&fmriprep).unwrap();
        let json = format!(
            r#"{{
                "base_dir": "{0}/analysis",
                "behavioral_dir": "{1}",
                "fmriprep_dir": "{2}",
                "subject_ids": {3},
                "n_volumes": 372,
                "dummy_scans": 5
            }}"#,
            base.display(),
            behavioral.display(),
            fmriprep.display(),
            serde_json::to_string(subjects).unwrap(),
        );
        serde_json::from_str(&json).unwrap()
    }

    #[test]
    fn parallel_run_isolates_single_subject_failure() {
        let tmp = tempfile::tempdir().unwrap();
        let subjects = ["sub-001", "sub-002", "sub-003"];
        let config = test_config(tmp.path(), &subjects);

        for (i, subject) in subjects.iter().enumerate() {
            write_timing_log(&config.behavioral_dir, (i + 1) as u32);
            write_confounds(&config, subject, "1", 372);
        }
        // sub-002 has no functional image: its analysis fails with a
        // missing-input error while the siblings succeed.
        write_functional(&config, "sub-001", "1");
        write_functional(&config, "sub-003", "1");

        let engine = MockEngine::new(372, &ALL_CONDITIONS);
        let summary = Pipeline::new(config, &engine)
            .with_parallelism(3)
            .run()
            .unwrap();

        assert_eq!(summary.total_subjects, 3);
        assert_eq!(summary.successful_subjects, 2);
        assert_eq!(summary.failed_subjects, vec!["sub-002".to_string()]);

        // Every subject appears exactly once in the analysis ledger.
        let mut analyzed: Vec<String> = summary
            .outcomes
            .iter()
            .filter(|o| o.stage == Stage::PerSubjectAnalysis)
            .map(|o| o.subject_id.clone())
            .collect();
        analyzed.sort();
        assert_eq!(analyzed, vec!["sub-001", "sub-002", "sub-003"]);
    }

    #[test]
    fn sequential_run_produces_same_ledger() {
        let tmp = tempfile::tempdir().unwrap();
        let subjects = ["sub-001", "sub-002"];
        let config = test_config(tmp.path(), &subjects);
        for (i, subject) in subjects.iter().enumerate() {
            write_timing_log(&config.behavioral_dir, (i + 1) as u32);
            write_confounds(&config, subject, "1", 372);
            write_functional(&config, subject, "1");
        }

        let engine = MockEngine::new(372, &ALL_CONDITIONS);
        let summary = Pipeline::new(config, &engine).run().unwrap();
        assert_eq!(summary.successful_subjects, 2);
        assert!(summary.failed_subjects.is_empty());
        assert_eq!(summary.sessions.len(), 1);
        assert!(!summary.sessions[0].abandoned);
    }

    #[test]
    fn session_abandoned_when_timing_extraction_fails_entirely() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), &["sub-001"]);
        // A timing file whose cues never classify: zero timing successes.
        let mut out = String::from(HEADER);
        out.push('\n');
        for trial in 0..80 {
            out.push_str(&format!(
                "{}\t1\tscrambled\t1\t400\t0\t0\t0\t0\t10000\t12000\t14000\n",
                trial + 1
            ));
        }
        fs::write(config.behavioral_dir.join("Reward_task_sub001_reward.txt"), out).unwrap();
        write_confounds(&config, "sub-001", "1", 372);
        write_functional(&config, "sub-001", "1");

        let engine = MockEngine::new(372, &ALL_CONDITIONS);
        let summary = Pipeline::new(config, &engine).run().unwrap();

        assert!(summary.sessions[0].abandoned);
        assert_eq!(summary.successful_subjects, 0);
        // No subject reached analysis.
        assert!(summary
            .outcomes
            .iter()
            .all(|o| o.stage != Stage::PerSubjectAnalysis));
    }

    #[test]
    fn session_abandoned_when_no_motion_successes() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), &["sub-001"]);
        write_timing_log(&config.behavioral_dir, 1);
        // No confounds file at all: motion stage has zero successes.
        write_functional(&config, "sub-001", "1");

        let engine = MockEngine::new(372, &ALL_CONDITIONS);
        let summary = Pipeline::new(config, &engine).run().unwrap();

        assert!(summary.sessions[0].abandoned);
        assert!(summary
            .outcomes
            .iter()
            .any(|o| o.stage == Stage::MotionExtraction && !o.status.is_success()));
    }

    #[test]
    fn excluded_subject_never_enters_session() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path(), &["sub-001", "sub-002"]);
        config.excluded_subjects = vec![crate::config::Exclusion {
            subject_id: "sub-002".into(),
            reason: "scanner artifact".into(),
            sessions: crate::config::ExclusionScope::One("all".into()),
        }];
        write_timing_log(&config.behavioral_dir, 1);
        write_confounds(&config, "sub-001", "1", 372);
        write_functional(&config, "sub-001", "1");

        let engine = MockEngine::new(372, &ALL_CONDITIONS);
        let summary = Pipeline::new(config, &engine).run().unwrap();

        assert_eq!(summary.total_subjects, 1);
        assert!(summary
            .outcomes
            .iter()
            .filter(|o| o.stage != Stage::TimingExtraction)
            .all(|o| o.subject_id == "sub-001"));
    }

    #[test]
    fn stage_flags_disable_stages() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path(), &["sub-001"]);
        config.run_timing_extraction = false;
        config.run_motion_extraction = false;
        config.run_first_level = false;

        let engine = MockEngine::new(372, &ALL_CONDITIONS);
        let summary = Pipeline::new(config, &engine).run().unwrap();
        assert!(summary.outcomes.is_empty());
        assert_eq!(summary.sessions.len(), 1);
        assert_eq!(*engine.fits.lock().unwrap(), 0);
    }

    #[test]
    fn qc_report_is_written_for_the_session() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), &["sub-001"]);
        write_timing_log(&config.behavioral_dir, 1);
        write_confounds(&config, "sub-001", "1", 372);
        write_functional(&config, "sub-001", "1");

        let qc_path = config.motion_regressor_dir().join("motion_qc_report.csv");
        let engine = MockEngine::new(372, &ALL_CONDITIONS);
        Pipeline::new(config, &engine).run().unwrap();
        assert!(qc_path.is_file());
    }

    #[test]
    fn summary_round_trips_through_json() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path(), &["sub-001"]);
        write_timing_log(&config.behavioral_dir, 1);
        write_confounds(&config, "sub-001", "1", 372);
        write_functional(&config, "sub-001", "1");

        let engine = MockEngine::new(372, &ALL_CONDITIONS);
        let summary = Pipeline::new(config, &engine).run().unwrap();

        let json = serde_json::to_string(&summary).unwrap();
        let back: PipelineSummary = serde_json::from_str(&json).unwrap();
        assert_eq!(back.run_id, summary.run_id);
        assert_eq!(back.successful_subjects, summary.successful_subjects);
        assert_eq!(back.outcomes.len(), summary.outcomes.len());
    }

    #[test]
    fn discovery_prefers_task_named_files() {
        let tmp = tempfile::tempdir().unwrap();
        fs::write(tmp.path().join("notes.txt"), "x").unwrap();
        fs::write(tmp.path().join("some_task_01_log.txt"), "x").unwrap();
        let files = discover_timing_files(tmp.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("some_task_01_log.txt"));

        fs::remove_file(tmp.path().join("some_task_01_log.txt")).unwrap();
        let files = discover_timing_files(tmp.path()).unwrap();
        assert_eq!(files.len(), 1);
        assert!(files[0].ends_with("notes.txt"));
    }
}
