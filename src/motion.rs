//! Motion quality control
//!
//! Extracts the configured motion parameters from an fMRIPrep confounds
//! table, drops the leading dummy volumes, reduces the six-degree-of-freedom
//! trace to summary displacement and rotation statistics, and aggregates a
//! QC table across subjects. Absent parameters are omitted from the trace
//! with a warning, never zero-filled: a NaN summary field means the
//! parameter class was unavailable, which is distinct from zero motion.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::error::PipelineError;
use crate::types::{MotionQcRecord, MotionTrace};

/// Maximum-displacement threshold (mm) used for the descriptive high-motion
/// proportion in the aggregate report. Reporting only; exclusion is a
/// configuration-level decision made outside this engine.
pub const HIGH_MOTION_THRESHOLD_MM: f64 = 2.0;

/// A parsed tab-delimited confounds table, column-major. Non-numeric cells
/// (fMRIPrep writes `n/a` where a derivative is undefined) become NaN.
#[derive(Debug, Clone)]
pub struct ConfoundsTable {
    pub header: Vec<String>,
    pub columns: Vec<Vec<f64>>,
}

impl ConfoundsTable {
    pub fn n_rows(&self) -> usize {
        self.columns.first().map_or(0, |c| c.len())
    }

    pub fn column(&self, name: &str) -> Option<&[f64]> {
        self.header
            .iter()
            .position(|h| h == name)
            .map(|i| self.columns[i].as_slice())
    }
}

/// Parse a confounds time series: first line is the header, one row per
/// scan volume.
pub fn load_confounds_table(path: &Path) -> Result<ConfoundsTable, PipelineError> {
    if !path.is_file() {
        return Err(PipelineError::MissingInputFile(path.to_path_buf()));
    }
    let raw = fs::read_to_string(path)?;
    let mut lines = raw.lines().filter(|l| !l.trim().is_empty());

    let header: Vec<String> = lines
        .next()
        .map(|l| l.trim_end().split('\t').map(|s| s.to_string()).collect())
        .unwrap_or_default();

    let mut columns: Vec<Vec<f64>> = vec![Vec::new(); header.len()];
    for line in lines {
        for (i, cell) in line.trim_end().split('\t').enumerate() {
            if i < columns.len() {
                columns[i].push(cell.trim().parse::<f64>().unwrap_or(f64::NAN));
            }
        }
        // Short rows leave trailing columns ragged; pad with NaN.
        let longest = columns.iter().map(|c| c.len()).max().unwrap_or(0);
        for col in &mut columns {
            col.resize(longest, f64::NAN);
        }
    }

    Ok(ConfoundsTable { header, columns })
}

/// Extract the configured motion parameters from a confounds table,
/// dropping the first `dummy_scans` rows of each.
///
/// Parameters missing from the table are skipped with a warning. Fails only
/// when none of the configured parameters are present.
pub fn extract_motion_trace(
    confounds: &ConfoundsTable,
    motion_params: &[String],
    dummy_scans: usize,
    source: &Path,
) -> Result<MotionTrace, PipelineError> {
    let mut parameters = Vec::new();
    let mut columns = Vec::new();

    for name in motion_params {
        match confounds.column(name) {
            Some(values) => {
                let retained: Vec<f64> =
                    values.iter().skip(dummy_scans).copied().collect();
                parameters.push(name.clone());
                columns.push(retained);
            }
            None => {
                warn!(
                    parameter = %name,
                    file = %source.display(),
                    "motion parameter not found in confounds file"
                );
            }
        }
    }

    if columns.is_empty() {
        return Err(PipelineError::NoMotionParameters(source.to_path_buf()));
    }

    Ok(MotionTrace {
        parameters,
        columns,
    })
}

/// Reduce a motion trace to its QC summary.
///
/// Translation statistics come from the per-volume Euclidean norm over all
/// `trans*` columns; rotation statistics pool absolute per-sample values
/// across all `rot*` columns, converted radians to degrees.
pub fn compute_motion_qc(trace: &MotionTrace, subject_id: &str, session: &str) -> MotionQcRecord {
    let trans: Vec<&Vec<f64>> = trace
        .parameters
        .iter()
        .zip(&trace.columns)
        .filter(|(name, _)| name.contains("trans"))
        .map(|(_, col)| col)
        .collect();

    let (max_motion, mean_motion, std_motion, max_abs, mean_abs) = if trans.is_empty() {
        (f64::NAN, f64::NAN, f64::NAN, f64::NAN, f64::NAN)
    } else {
        let n = trace.n_volumes();
        let euclidean: Vec<f64> = (0..n)
            .map(|v| trans.iter().map(|c| c[v] * c[v]).sum::<f64>().sqrt())
            .collect();
        let abs_all: Vec<f64> = trans.iter().flat_map(|c| c.iter().map(|x| x.abs())).collect();
        (
            max_of(&euclidean),
            mean_of(&euclidean),
            std_of(&euclidean),
            max_of(&abs_all),
            mean_of(&abs_all),
        )
    };

    let rot_deg: Vec<f64> = trace
        .parameters
        .iter()
        .zip(&trace.columns)
        .filter(|(name, _)| name.contains("rot"))
        .flat_map(|(_, col)| col.iter().map(|x| x.abs().to_degrees()))
        .collect();

    let (max_rot, mean_rot) = if rot_deg.is_empty() {
        (f64::NAN, f64::NAN)
    } else {
        (max_of(&rot_deg), mean_of(&rot_deg))
    };

    MotionQcRecord {
        subject_id: subject_id.to_string(),
        session: session.to_string(),
        max_motion_mm: max_motion,
        mean_motion_mm: mean_motion,
        std_motion_mm: std_motion,
        max_abs_displacement_mm: max_abs,
        mean_abs_displacement_mm: mean_abs,
        max_rotation_deg: max_rot,
        mean_rotation_deg: mean_rot,
        n_volumes: trace.n_volumes(),
        available_params: trace.parameters.clone(),
    }
}

/// Extract, summarize, and persist motion regressors for one
/// subject/session.
pub fn run_motion_extraction(
    confounds_file: &Path,
    output_file: &Path,
    subject_id: &str,
    session: &str,
    motion_params: &[String],
    dummy_scans: usize,
) -> Result<MotionQcRecord, PipelineError> {
    let confounds = load_confounds_table(confounds_file)?;
    let trace = extract_motion_trace(&confounds, motion_params, dummy_scans, confounds_file)?;
    write_motion_regressors(&trace, output_file)?;
    Ok(compute_motion_qc(&trace, subject_id, session))
}

/// Persist a motion trace as a space-delimited numeric matrix, one row per
/// retained volume, 6-decimal precision.
pub fn write_motion_regressors(trace: &MotionTrace, path: &Path) -> Result<(), PipelineError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut out = String::new();
    for volume in 0..trace.n_volumes() {
        let row: Vec<String> = trace
            .columns
            .iter()
            .map(|c| format!("{:.6}", c[volume]))
            .collect();
        out.push_str(&row.join(" "));
        out.push('\n');
    }
    fs::write(path, out)?;
    Ok(())
}

/// Load a persisted motion regressor matrix, optionally trimming dummy
/// scans when the file still carries them. Rows are volumes.
pub fn load_motion_regressors(
    path: &Path,
    dummy_scans: usize,
) -> Result<Vec<Vec<f64>>, PipelineError> {
    if !path.is_file() {
        return Err(PipelineError::MissingInputFile(path.to_path_buf()));
    }
    let raw = fs::read_to_string(path)?;
    let rows: Vec<Vec<f64>> = raw
        .lines()
        .filter(|l| !l.trim().is_empty())
        .skip(dummy_scans)
        .map(|line| {
            line.split_whitespace()
                .map(|cell| cell.parse::<f64>().unwrap_or(f64::NAN))
                .collect()
        })
        .collect();
    Ok(rows)
}

/// Sanity-check a loaded regressor matrix against the expected volume count.
/// NaN cells and extreme translations warn rather than fail.
pub fn validate_motion_regressors(
    rows: &[Vec<f64>],
    expected_volumes: usize,
) -> Result<(), PipelineError> {
    if rows.len() != expected_volumes {
        return Err(PipelineError::TimepointMismatch {
            functional: expected_volumes,
            confounds: rows.len(),
            dummy_scans: 0,
        });
    }
    if rows.iter().flatten().any(|v| v.is_nan()) {
        warn!("motion regressors contain NaN values");
    }
    let max_trans = rows
        .iter()
        .flat_map(|r| r.iter().take(3))
        .fold(0.0_f64, |acc, v| acc.max(v.abs()));
    if max_trans > 20.0 {
        warn!(max_trans_mm = max_trans, "extreme translation values detected");
    }
    Ok(())
}

/// Fraction of records whose maximum displacement exceeds
/// [`HIGH_MOTION_THRESHOLD_MM`]. None when no record carries a valid
/// translation summary.
pub fn high_motion_proportion(records: &[MotionQcRecord]) -> Option<f64> {
    let valid: Vec<&MotionQcRecord> = records
        .iter()
        .filter(|r| !r.max_motion_mm.is_nan())
        .collect();
    if valid.is_empty() {
        return None;
    }
    let high = valid
        .iter()
        .filter(|r| r.max_motion_mm > HIGH_MOTION_THRESHOLD_MM)
        .count();
    Some(high as f64 / valid.len() as f64)
}

/// Write the aggregate QC table (comma-separated, 4-decimal precision, one
/// row per subject/session) and log the descriptive high-motion proportion.
pub fn write_qc_report(
    records: &[MotionQcRecord],
    output_dir: &Path,
) -> Result<PathBuf, PipelineError> {
    fs::create_dir_all(output_dir)?;
    let path = output_dir.join("motion_qc_report.csv");

    let mut out = String::from(
        "subject_id,session,max_motion_mm,mean_motion_mm,std_motion_mm,\
         max_abs_displacement_mm,mean_abs_displacement_mm,max_rotation_deg,\
         mean_rotation_deg,n_volumes,available_params\n",
    );
    for r in records {
        out.push_str(&format!(
            "{},{},{},{},{},{},{},{},{},{},{}\n",
            r.subject_id,
            r.session,
            fmt4(r.max_motion_mm),
            fmt4(r.mean_motion_mm),
            fmt4(r.std_motion_mm),
            fmt4(r.max_abs_displacement_mm),
            fmt4(r.mean_abs_displacement_mm),
            fmt4(r.max_rotation_deg),
            fmt4(r.mean_rotation_deg),
            r.n_volumes,
            r.available_params.join(";"),
        ));
    }
    fs::write(&path, out)?;

    if let Some(proportion) = high_motion_proportion(records) {
        info!(
            threshold_mm = HIGH_MOTION_THRESHOLD_MM,
            proportion = format!("{:.1}%", proportion * 100.0).as_str(),
            n_records = records.len(),
            "high-motion proportion (descriptive only)"
        );
    }

    Ok(path)
}

fn fmt4(value: f64) -> String {
    if value.is_nan() {
        "n/a".to_string()
    } else {
        format!("{value:.4}")
    }
}

fn max_of(values: &[f64]) -> f64 {
    values.iter().fold(f64::NEG_INFINITY, |a, &b| a.max(b))
}

fn mean_of(values: &[f64]) -> f64 {
    values.iter().sum::<f64>() / values.len() as f64
}

fn std_of(values: &[f64]) -> f64 {
    let mean = mean_of(values);
    let var = values.iter().map(|v| (v - mean) * (v - mean)).sum::<f64>() / values.len() as f64;
    var.sqrt()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn confounds_text(columns: &[&str], n_rows: usize, scale: f64) -> String {
        let mut out = columns.join("\t");
        out.push('\n');
        for row in 0..n_rows {
            let cells: Vec<String> = (0..columns.len())
                .map(|c| format!("{:.6}", scale * (row as f64 * 0.001 + c as f64 * 0.01)))
                .collect();
            out.push_str(&cells.join("\t"));
            out.push('\n');
        }
        out
    }

    fn all_params() -> Vec<String> {
        ["trans_x", "trans_y", "trans_z", "rot_x", "rot_y", "rot_z"]
            .iter()
            .map(|s| s.to_string())
            .collect()
    }

    #[test]
    fn translation_only_trace_has_sentinel_rotation() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("confounds.tsv");
        fs::write(
            &file,
            confounds_text(&["trans_x", "trans_y", "trans_z"], 372, 1.0),
        )
        .unwrap();

        let confounds = load_confounds_table(&file).unwrap();
        let trace = extract_motion_trace(&confounds, &all_params(), 5, &file).unwrap();

        assert_eq!(trace.n_volumes(), 367);
        assert_eq!(trace.n_parameters(), 3);

        let qc = compute_motion_qc(&trace, "sub-001", "1");
        assert!(!qc.max_motion_mm.is_nan());
        assert!(!qc.mean_motion_mm.is_nan());
        assert!(qc.max_rotation_deg.is_nan());
        assert!(qc.mean_rotation_deg.is_nan());
        assert_eq!(qc.n_volumes, 367);
        assert_eq!(qc.available_params.len(), 3);
    }

    #[test]
    fn rotation_only_trace_has_sentinel_translation() {
        let trace = MotionTrace {
            parameters: vec!["rot_x".into(), "rot_y".into()],
            columns: vec![vec![0.01, -0.02], vec![0.0, 0.005]],
        };
        let qc = compute_motion_qc(&trace, "sub-002", "1");
        assert!(qc.max_motion_mm.is_nan());
        assert!(qc.max_abs_displacement_mm.is_nan());
        assert!(!qc.max_rotation_deg.is_nan());
        // 0.02 rad = 1.1459 deg
        assert!((qc.max_rotation_deg - 0.02_f64.to_degrees()).abs() < 1e-9);
    }

    #[test]
    fn euclidean_displacement_statistics() {
        let trace = MotionTrace {
            parameters: vec!["trans_x".into(), "trans_y".into(), "trans_z".into()],
            columns: vec![
                vec![3.0, 0.0],
                vec![4.0, 0.0],
                vec![0.0, 0.0],
            ],
        };
        let qc = compute_motion_qc(&trace, "sub-003", "1");
        assert_eq!(qc.max_motion_mm, 5.0);
        assert_eq!(qc.mean_motion_mm, 2.5);
        assert_eq!(qc.std_motion_mm, 2.5);
        assert_eq!(qc.max_abs_displacement_mm, 4.0);
    }

    #[test]
    fn missing_parameters_are_omitted_not_zero_filled() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("confounds.tsv");
        fs::write(&file, confounds_text(&["trans_x", "rot_z"], 20, 1.0)).unwrap();

        let confounds = load_confounds_table(&file).unwrap();
        let trace = extract_motion_trace(&confounds, &all_params(), 2, &file).unwrap();
        assert_eq!(trace.parameters, vec!["trans_x", "rot_z"]);
        assert_eq!(trace.n_volumes(), 18);
    }

    #[test]
    fn no_motion_parameters_is_an_error() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("confounds.tsv");
        fs::write(&file, confounds_text(&["csf", "white_matter"], 10, 1.0)).unwrap();

        let confounds = load_confounds_table(&file).unwrap();
        let err = extract_motion_trace(&confounds, &all_params(), 0, &file).unwrap_err();
        assert!(matches!(err, PipelineError::NoMotionParameters(_)));
    }

    #[test]
    fn non_numeric_cells_become_nan() {
        let tmp = tempfile::tempdir().unwrap();
        let file = tmp.path().join("confounds.tsv");
        fs::write(&file, "trans_x\ttrans_y\nn/a\t0.5\n0.1\t0.2\n").unwrap();

        let confounds = load_confounds_table(&file).unwrap();
        assert!(confounds.column("trans_x").unwrap()[0].is_nan());
        assert_eq!(confounds.column("trans_y").unwrap()[0], 0.5);
    }

    #[test]
    fn regressor_round_trip() {
        let tmp = tempfile::tempdir().unwrap();
        let path = tmp.path().join("ses-1").join("sub-001_Regressors.txt");
        let trace = MotionTrace {
            parameters: vec!["trans_x".into(), "rot_x".into()],
            columns: vec![vec![0.123456, -0.5], vec![0.001, 0.002]],
        };
        write_motion_regressors(&trace, &path).unwrap();

        let rows = load_motion_regressors(&path, 0).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0], vec![0.123456, 0.001]);

        validate_motion_regressors(&rows, 2).unwrap();
        assert!(matches!(
            validate_motion_regressors(&rows, 5),
            Err(PipelineError::TimepointMismatch { .. })
        ));
    }

    #[test]
    fn high_motion_proportion_uses_fixed_threshold() {
        let mut low = compute_motion_qc(
            &MotionTrace {
                parameters: vec!["trans_x".into()],
                columns: vec![vec![0.1, 0.2]],
            },
            "sub-001",
            "1",
        );
        let mut high = low.clone();
        low.max_motion_mm = 0.4;
        high.subject_id = "sub-002".into();
        high.max_motion_mm = 3.1;

        let proportion = high_motion_proportion(&[low, high]).unwrap();
        assert_eq!(proportion, 0.5);
    }

    #[test]
    fn qc_report_written_with_four_decimals() {
        let tmp = tempfile::tempdir().unwrap();
        let trace = MotionTrace {
            parameters: vec!["trans_x".into()],
            columns: vec![vec![0.25, 0.75]],
        };
        let qc = compute_motion_qc(&trace, "sub-001", "1");
        let path = write_qc_report(&[qc], tmp.path()).unwrap();

        let written = fs::read_to_string(path).unwrap();
        let data_line = written.lines().nth(1).unwrap();
        assert!(data_line.starts_with("sub-001,1,0.7500,0.5000,"));
        // rotation fields are sentinels for a translation-only trace
        assert!(data_line.contains(",n/a,n/a,"));
    }
}
