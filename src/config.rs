//! Pipeline configuration
//!
//! The configuration object is immutable for the lifetime of a run. Session
//! iteration never mutates it; per-session subject lists come from
//! [`PipelineConfig::session_view`], which derives an independent
//! [`SessionView`] after applying the exclusion list.

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::PipelineError;

fn default_sessions() -> Vec<String> {
    vec!["1".to_string()]
}

fn default_tr() -> f64 {
    1.6
}

fn default_n_volumes() -> usize {
    367
}

fn default_dummy_scans() -> usize {
    5
}

fn default_smooth_fwhm() -> u32 {
    6
}

fn default_hpf() -> f64 {
    128.0
}

fn default_true() -> bool {
    true
}

fn default_motion_params() -> Vec<String> {
    ["trans_x", "trans_y", "trans_z", "rot_x", "rot_y", "rot_z"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_task() -> String {
    "MIDT".to_string()
}

/// Which sessions an exclusion entry applies to: every session, or a
/// specific list of session identifiers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExclusionScope {
    One(String),
    Many(Vec<String>),
}

impl ExclusionScope {
    /// True when this scope covers `session`. Accepts the `all` wildcard and
    /// both bare (`"2"`) and prefixed (`"ses-2"`) session tags.
    pub fn applies_to(&self, session: &str) -> bool {
        let matches_tag = |tag: &str| {
            tag == "all" || tag == session || tag == format!("ses-{session}")
        };
        match self {
            ExclusionScope::One(tag) => matches_tag(tag),
            ExclusionScope::Many(tags) => tags.iter().any(|t| matches_tag(t)),
        }
    }
}

/// One excluded subject: who, why, and which sessions the exclusion covers
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Exclusion {
    pub subject_id: String,
    pub reason: String,
    pub sessions: ExclusionScope,
}

/// Configuration for a MID task analysis run.
///
/// Deserialized from JSON; unspecified acquisition parameters fall back to
/// the study defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineConfig {
    /// Analysis root; all outputs land underneath
    pub base_dir: PathBuf,
    /// Directory holding raw behavioral timing files
    pub behavioral_dir: PathBuf,
    /// fMRIPrep derivatives directory
    pub fmriprep_dir: PathBuf,

    /// Subjects to process (canonical `sub-NNN` form)
    pub subject_ids: Vec<String>,
    #[serde(default = "default_sessions")]
    pub sessions_to_process: Vec<String>,
    #[serde(default)]
    pub excluded_subjects: Vec<Exclusion>,

    /// Repetition time in seconds
    #[serde(default = "default_tr")]
    pub tr: f64,
    /// Expected functional volume count, before dummy-scan removal
    #[serde(default = "default_n_volumes")]
    pub n_volumes: usize,
    /// Leading volumes discarded for scanner stabilization
    #[serde(default = "default_dummy_scans")]
    pub dummy_scans: usize,
    /// Smoothing kernel FWHM in mm (applied upstream; used for file lookup)
    #[serde(default = "default_smooth_fwhm")]
    pub smooth_fwhm: u32,
    /// High-pass filter period in seconds
    #[serde(default = "default_hpf")]
    pub hpf: f64,

    #[serde(default = "default_true")]
    pub run_timing_extraction: bool,
    #[serde(default = "default_true")]
    pub run_motion_extraction: bool,
    #[serde(default = "default_true")]
    pub run_first_level: bool,

    /// Motion parameter columns to extract from the confounds table
    #[serde(default = "default_motion_params")]
    pub motion_params: Vec<String>,

    #[serde(default = "default_task")]
    pub task: String,
}

impl PipelineConfig {
    /// Load a configuration from a JSON file and validate it.
    pub fn from_json_file(path: &Path) -> Result<Self, PipelineError> {
        let raw = fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String, PipelineError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Reject placeholder paths and missing input directories.
    pub fn validate(&self) -> Result<(), PipelineError> {
        const PLACEHOLDERS: [&str; 3] = ["/path/to/", "CHANGE_THIS", "UPDATE_ME"];
        for dir in [&self.base_dir, &self.behavioral_dir, &self.fmriprep_dir] {
            let text = dir.to_string_lossy();
            if PLACEHOLDERS.iter().any(|p| text.contains(p)) {
                return Err(PipelineError::InvalidConfig(format!(
                    "configuration contains placeholder path: {text}"
                )));
            }
        }
        if !self.behavioral_dir.is_dir() {
            return Err(PipelineError::InvalidConfig(format!(
                "behavioral directory not found: {}",
                self.behavioral_dir.display()
            )));
        }
        if !self.fmriprep_dir.is_dir() {
            return Err(PipelineError::InvalidConfig(format!(
                "fMRIPrep directory not found: {}",
                self.fmriprep_dir.display()
            )));
        }
        if self.tr <= 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "repetition time must be positive, got {}",
                self.tr
            )));
        }
        if self.hpf <= 0.0 {
            return Err(PipelineError::InvalidConfig(format!(
                "high-pass filter period must be positive, got {}",
                self.hpf
            )));
        }
        Ok(())
    }

    pub fn timing_dir(&self) -> PathBuf {
        self.base_dir.join("timing_files")
    }

    pub fn motion_regressor_dir(&self) -> PathBuf {
        self.base_dir.join("motion_regressors")
    }

    pub fn first_level_dir(&self) -> PathBuf {
        self.base_dir.join("first_level_results")
    }

    pub fn qc_dir(&self) -> PathBuf {
        self.base_dir.join("quality_control")
    }

    /// Create the output tree, including per-session subdirectories.
    pub fn create_output_directories(&self) -> Result<(), PipelineError> {
        let roots = [
            self.timing_dir(),
            self.motion_regressor_dir(),
            self.first_level_dir(),
            self.qc_dir(),
        ];
        for root in &roots {
            fs::create_dir_all(root)?;
            for session in &self.sessions_to_process {
                fs::create_dir_all(root.join(format!("ses-{session}")))?;
            }
        }
        Ok(())
    }

    /// Derive the eligible subject set for one session.
    ///
    /// The base configuration is left untouched; exclusions tagged `all`
    /// remove a subject everywhere, session-tagged exclusions only in that
    /// session.
    pub fn session_view(&self, session: &str) -> SessionView {
        let mut subjects = self.subject_ids.clone();
        for exclusion in &self.excluded_subjects {
            if exclusion.sessions.applies_to(session) {
                if let Some(pos) = subjects.iter().position(|s| s == &exclusion.subject_id) {
                    subjects.remove(pos);
                    info!(
                        subject = %exclusion.subject_id,
                        session = %session,
                        reason = %exclusion.reason,
                        "excluding subject from session"
                    );
                }
            }
        }
        SessionView {
            session: session.to_string(),
            subjects,
        }
    }
}

/// Immutable per-session derivation of the base configuration: the session
/// tag plus the eligible subject list after exclusions.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionView {
    pub session: String,
    pub subjects: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn test_config(base: &Path) -> PipelineConfig {
        PipelineConfig {
            base_dir: base.join("analysis"),
            behavioral_dir: base.to_path_buf(),
            fmriprep_dir: base.to_path_buf(),
            subject_ids: vec!["sub-001".into(), "sub-002".into(), "sub-003".into()],
            sessions_to_process: vec!["1".into(), "2".into()],
            excluded_subjects: vec![
                Exclusion {
                    subject_id: "sub-002".into(),
                    reason: "motion artifacts".into(),
                    sessions: ExclusionScope::One("all".into()),
                },
                Exclusion {
                    subject_id: "sub-003".into(),
                    reason: "timing file issues".into(),
                    sessions: ExclusionScope::One("ses-1".into()),
                },
            ],
            tr: 1.6,
            n_volumes: 372,
            dummy_scans: 5,
            smooth_fwhm: 6,
            hpf: 128.0,
            run_timing_extraction: true,
            run_motion_extraction: true,
            run_first_level: true,
            motion_params: default_motion_params(),
            task: "MIDT".into(),
        }
    }

    #[test]
    fn exclusion_all_applies_to_every_session() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        let ses1 = config.session_view("1");
        let ses2 = config.session_view("2");
        assert!(!ses1.subjects.contains(&"sub-002".to_string()));
        assert!(!ses2.subjects.contains(&"sub-002".to_string()));
    }

    #[test]
    fn session_tagged_exclusion_applies_only_there() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());

        let ses1 = config.session_view("1");
        let ses2 = config.session_view("2");
        assert!(!ses1.subjects.contains(&"sub-003".to_string()));
        assert!(ses2.subjects.contains(&"sub-003".to_string()));
    }

    #[test]
    fn session_view_leaves_base_config_untouched() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        let _ = config.session_view("1");
        assert_eq!(config.subject_ids.len(), 3);
    }

    #[test]
    fn scope_accepts_bare_and_prefixed_tags() {
        let scope = ExclusionScope::Many(vec!["ses-2".into(), "3".into()]);
        assert!(scope.applies_to("2"));
        assert!(scope.applies_to("3"));
        assert!(!scope.applies_to("1"));
    }

    #[test]
    fn placeholder_paths_rejected() {
        let tmp = tempfile::tempdir().unwrap();
        let mut config = test_config(tmp.path());
        config.behavioral_dir = PathBuf::from("/path/to/behavioral");
        assert!(matches!(
            config.validate(),
            Err(PipelineError::InvalidConfig(_))
        ));
    }

    #[test]
    fn json_round_trip_with_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let json = format!(
            r#"{{
                "base_dir": "{0}/analysis",
                "behavioral_dir": "{0}",
                "fmriprep_dir": "{0}",
                "subject_ids": ["sub-001"]
            }}"#,
            tmp.path().display()
        );
        let config: PipelineConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(config.tr, 1.6);
        assert_eq!(config.dummy_scans, 5);
        assert_eq!(config.sessions_to_process, vec!["1".to_string()]);
        assert_eq!(config.motion_params.len(), 6);
        assert!(config.run_first_level);

        let back = config.to_json().unwrap();
        let reparsed: PipelineConfig = serde_json::from_str(&back).unwrap();
        assert_eq!(reparsed.subject_ids, config.subject_ids);
    }

    #[test]
    fn create_output_directories_builds_session_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let config = test_config(tmp.path());
        config.create_output_directories().unwrap();
        assert!(config.timing_dir().join("ses-1").is_dir());
        assert!(config.motion_regressor_dir().join("ses-2").is_dir());
        assert!(config.qc_dir().is_dir());
    }
}
