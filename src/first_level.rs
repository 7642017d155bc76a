//! First-level analysis driver
//!
//! Sequences one subject/session through the statistical analysis stage:
//! input resolution, confound preparation, dummy-scan alignment checks, the
//! external model fit, and contrast computation against the realized design.
//! The GLM itself lives behind [`ModelFitEngine`]; this module owns the
//! contract at that boundary, not the numerics.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

use crate::config::PipelineConfig;
use crate::contrasts::{resolve_catalogue, ContrastDefinition};
use crate::error::PipelineError;
use crate::motion::{load_confounds_table, load_motion_regressors};

/// Hemodynamic response function model requested from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HrfModel {
    /// SPM canonical HRF
    SpmCanonical,
}

/// Serial-correlation model requested from the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoiseModel {
    /// First-order autoregressive
    Ar1,
}

/// Model-fit parameters handed to the external GLM engine.
///
/// The functional series arrives already smoothed and with dummy volumes
/// removed, so no additional smoothing is requested and the high-pass
/// cutoff is derived from the configured filter period.
#[derive(Debug, Clone)]
pub struct FirstLevelSpec {
    pub t_r: f64,
    pub hrf_model: HrfModel,
    /// Always None: data are smoothed upstream
    pub smoothing_fwhm: Option<f64>,
    /// Cutoff frequency in Hz, `1 / hpf_period_seconds`
    pub high_pass_hz: f64,
    pub noise_model: NoiseModel,
    pub standardize: bool,
}

impl FirstLevelSpec {
    pub fn from_config(config: &PipelineConfig) -> Self {
        Self {
            t_r: config.tr,
            hrf_model: HrfModel::SpmCanonical,
            smoothing_fwhm: None,
            high_pass_hz: 1.0 / config.hpf,
            noise_model: NoiseModel::Ar1,
            standardize: false,
        }
    }
}

/// Named nuisance-regressor matrix passed to the fit, one row per retained
/// volume.
#[derive(Debug, Clone)]
pub struct ConfoundsMatrix {
    pub columns: Vec<String>,
    pub rows: Vec<Vec<f64>>,
}

/// Paths of the two maps written for one computed contrast
#[derive(Debug, Clone)]
pub struct ContrastMaps {
    pub effect_map: PathBuf,
    pub stat_map: PathBuf,
}

/// A fitted first-level model returned by the engine
pub trait FittedModel {
    /// Realized design matrix column names, in design order (conditions,
    /// nuisance regressors, drift terms, intercept)
    fn design_columns(&self) -> &[String];

    /// Compute one contrast and write its effect-size and statistic maps
    /// under `output_dir`
    fn compute_contrast(
        &self,
        name: &str,
        definition: &ContrastDefinition,
        output_dir: &Path,
    ) -> Result<ContrastMaps, PipelineError>;

    /// Persist the realized design matrix as a TSV
    fn save_design_matrix(&self, path: &Path) -> Result<(), PipelineError>;
}

/// External GLM collaborator boundary.
///
/// Implementations wrap a third-party general linear model library; the
/// pipeline only depends on this contract.
pub trait ModelFitEngine: Send + Sync {
    /// Volume count of a functional image series (before dummy removal)
    fn volume_count(&self, functional: &Path) -> Result<usize, PipelineError>;

    /// Fit the model for one subject/session
    fn fit(
        &self,
        spec: &FirstLevelSpec,
        functional: &Path,
        events: &Path,
        confounds: &ConfoundsMatrix,
    ) -> Result<Box<dyn FittedModel>, PipelineError>;
}

/// Per-subject analysis result
#[derive(Debug, Clone)]
pub struct SubjectAnalysis {
    pub subject_id: String,
    pub session: String,
    pub computed_contrasts: Vec<String>,
    pub design_matrix: PathBuf,
    pub output_dir: PathBuf,
}

/// Run the first-level analysis for one subject/session.
pub fn run_first_level(
    config: &PipelineConfig,
    engine: &dyn ModelFitEngine,
    subject_id: &str,
    session: &str,
) -> Result<SubjectAnalysis, PipelineError> {
    let output_dir = config
        .first_level_dir()
        .join(format!("ses-{session}"))
        .join(subject_id);
    fs::create_dir_all(&output_dir)?;

    let events_file = config
        .timing_dir()
        .join(format!("ses-{session}"))
        .join(format!(
            "{subject_id}_ses-{session}_task-{task}_events.tsv",
            task = config.task
        ));
    if !events_file.is_file() {
        return Err(PipelineError::MissingInputFile(events_file));
    }

    let functional = find_functional_file(config, subject_id, session)
        .ok_or_else(|| PipelineError::MissingInputFile(functional_candidates(config, subject_id, session)[0].clone()))?;
    let confounds_file = find_confounds_file(config, subject_id, session)
        .ok_or_else(|| PipelineError::MissingInputFile(confounds_path(config, subject_id, session)))?;

    // Align volume counts: the fit consumes the series with dummy volumes
    // removed, so the confounds must match that length exactly.
    let n_func_raw = engine.volume_count(&functional)?;
    let n_func = if n_func_raw > config.dummy_scans {
        n_func_raw - config.dummy_scans
    } else {
        warn!(
            volumes = n_func_raw,
            dummy_scans = config.dummy_scans,
            "not enough volumes to remove dummy scans"
        );
        n_func_raw
    };

    let confounds = load_fit_confounds(config, subject_id, session, &confounds_file)?;
    if confounds.rows.len() != n_func {
        return Err(PipelineError::TimepointMismatch {
            functional: n_func,
            confounds: confounds.rows.len(),
            dummy_scans: config.dummy_scans,
        });
    }

    debug!(
        subject = subject_id,
        session = session,
        volumes = n_func,
        confound_columns = confounds.columns.len(),
        "fitting first-level model"
    );

    let spec = FirstLevelSpec::from_config(config);
    let fitted = engine.fit(&spec, &functional, &events_file, &confounds)?;

    let conditions = realized_conditions(fitted.design_columns());
    let resolved = resolve_catalogue(&conditions);

    let mut computed = Vec::new();
    for contrast in &resolved {
        match fitted.compute_contrast(&contrast.name, &contrast.definition, &output_dir) {
            Ok(_) => computed.push(contrast.name.clone()),
            Err(e) => {
                warn!(
                    subject = subject_id,
                    contrast = %contrast.name,
                    error = %e,
                    "failed to compute contrast"
                );
            }
        }
    }

    let design_matrix = output_dir.join(format!(
        "{subject_id}_ses-{session}_task-{task}_design-matrix.tsv",
        task = config.task
    ));
    fitted.save_design_matrix(&design_matrix)?;

    info!(
        subject = subject_id,
        session = session,
        contrasts = computed.len(),
        "first-level analysis completed"
    );

    Ok(SubjectAnalysis {
        subject_id: subject_id.to_string(),
        session: session.to_string(),
        computed_contrasts: computed,
        design_matrix,
        output_dir,
    })
}

/// Condition columns of a realized design: everything that is not a drift
/// term or the intercept.
pub fn realized_conditions(design_columns: &[String]) -> Vec<String> {
    design_columns
        .iter()
        .filter(|c| !c.starts_with("drift") && !c.starts_with("constant"))
        .cloned()
        .collect()
}

/// Confounds for the fit: prefer the extracted motion-regressor file (dummy
/// scans already removed during extraction); fall back to pulling the
/// configured motion parameters straight from the fMRIPrep confounds.
fn load_fit_confounds(
    config: &PipelineConfig,
    subject_id: &str,
    session: &str,
    confounds_file: &Path,
) -> Result<ConfoundsMatrix, PipelineError> {
    let regressor_file = config
        .motion_regressor_dir()
        .join(format!("ses-{session}"))
        .join(subject_id)
        .join(format!(
            "{subject_id}_ses-{session}_task-{task}_Regressors.txt",
            task = config.task
        ));

    if regressor_file.is_file() {
        let rows = load_motion_regressors(&regressor_file, 0)?;
        let n_cols = rows.first().map_or(0, |r| r.len());
        let columns: Vec<String> = config.motion_params.iter().take(n_cols).cloned().collect();
        debug!(
            file = %regressor_file.display(),
            parameters = columns.len(),
            "loaded extracted motion regressors"
        );
        return Ok(ConfoundsMatrix { columns, rows });
    }

    let table = load_confounds_table(confounds_file)?;
    let mut columns = Vec::new();
    let mut extracted: Vec<&[f64]> = Vec::new();
    for name in &config.motion_params {
        if let Some(col) = table.column(name) {
            columns.push(name.clone());
            extracted.push(col);
        }
    }
    if extracted.is_empty() {
        return Err(PipelineError::NoMotionParameters(
            confounds_file.to_path_buf(),
        ));
    }

    let n_rows = extracted[0].len().saturating_sub(config.dummy_scans);
    let rows: Vec<Vec<f64>> = (0..n_rows)
        .map(|r| {
            extracted
                .iter()
                .map(|col| col[r + config.dummy_scans])
                .collect()
        })
        .collect();

    Ok(ConfoundsMatrix { columns, rows })
}

fn functional_candidates(
    config: &PipelineConfig,
    subject_id: &str,
    session: &str,
) -> Vec<PathBuf> {
    let func_dir = config
        .fmriprep_dir
        .join(subject_id)
        .join(format!("ses-{session}"))
        .join("func");
    let task = &config.task;
    let fwhm = config.smooth_fwhm;
    [
        format!("{subject_id}_ses-{session}_task-{task}_space-MNI152NLin2009cAsym_res-2_desc-preproc_bold_{fwhm}mm_blur.nii"),
        format!("{subject_id}_ses-{session}_task-{task}_space-MNI152NLin2009cAsym_res-2_desc-preproc_bold_{fwhm}mm_blur.nii.gz"),
        format!("{subject_id}_ses-{session}_task-{task}_space-MNI152NLin2009cAsym_desc-preproc_bold.nii.gz"),
        format!("{subject_id}_ses-{session}_task-{task}_space-MNI152NLin2009cAsym_desc-preproc_bold.nii"),
    ]
    .into_iter()
    .map(|name| func_dir.join(name))
    .collect()
}

/// Locate the preprocessed functional series, trying the smoothed variants
/// first.
pub fn find_functional_file(
    config: &PipelineConfig,
    subject_id: &str,
    session: &str,
) -> Option<PathBuf> {
    functional_candidates(config, subject_id, session)
        .into_iter()
        .find(|p| p.is_file())
}

fn confounds_path(config: &PipelineConfig, subject_id: &str, session: &str) -> PathBuf {
    config
        .fmriprep_dir
        .join(subject_id)
        .join(format!("ses-{session}"))
        .join("func")
        .join(format!(
            "{subject_id}_ses-{session}_task-{task}_desc-confounds_timeseries.tsv",
            task = config.task
        ))
}

/// Locate the fMRIPrep confounds time series for one subject/session.
pub fn find_confounds_file(
    config: &PipelineConfig,
    subject_id: &str,
    session: &str,
) -> Option<PathBuf> {
    let path = confounds_path(config, subject_id, session);
    path.is_file().then_some(path)
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use std::sync::Mutex;

    /// Engine stub: reports a fixed raw volume count and realizes a fixed
    /// design column set.
    pub struct MockEngine {
        pub raw_volumes: usize,
        pub design_columns: Vec<String>,
        pub fits: Mutex<usize>,
    }

    impl MockEngine {
        pub fn new(raw_volumes: usize, conditions: &[&str]) -> Self {
            let mut design_columns: Vec<String> =
                conditions.iter().map(|s| s.to_string()).collect();
            design_columns.push("trans_x".to_string());
            design_columns.push("drift_1".to_string());
            design_columns.push("constant".to_string());
            Self {
                raw_volumes,
                design_columns,
                fits: Mutex::new(0),
            }
        }
    }

    pub struct MockFitted {
        pub design_columns: Vec<String>,
    }

    impl FittedModel for MockFitted {
        fn design_columns(&self) -> &[String] {
            &self.design_columns
        }

        fn compute_contrast(
            &self,
            name: &str,
            _definition: &ContrastDefinition,
            output_dir: &Path,
        ) -> Result<ContrastMaps, PipelineError> {
            let effect_map = output_dir.join(format!("contrast-{name}_stat-effect.nii.gz"));
            let stat_map = output_dir.join(format!("contrast-{name}_stat-t.nii.gz"));
            fs::write(&effect_map, b"effect")?;
            fs::write(&stat_map, b"stat")?;
            Ok(ContrastMaps {
                effect_map,
                stat_map,
            })
        }

        fn save_design_matrix(&self, path: &Path) -> Result<(), PipelineError> {
            fs::write(path, self.design_columns.join("\t"))?;
            Ok(())
        }
    }

    impl ModelFitEngine for MockEngine {
        fn volume_count(&self, functional: &Path) -> Result<usize, PipelineError> {
            if !functional.is_file() {
                return Err(PipelineError::MissingInputFile(functional.to_path_buf()));
            }
            Ok(self.raw_volumes)
        }

        fn fit(
            &self,
            _spec: &FirstLevelSpec,
            _functional: &Path,
            _events: &Path,
            _confounds: &ConfoundsMatrix,
        ) -> Result<Box<dyn FittedModel>, PipelineError> {
            *self.fits.lock().unwrap() += 1;
            Ok(Box::new(MockFitted {
                design_columns: self.design_columns.clone(),
            }))
        }
    }
}
