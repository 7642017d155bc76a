//! Event decoding
//!
//! Converts one subject's raw behavioral timing log into a time-ordered,
//! scanner-clock-aligned event sequence and persists it as a BIDS events
//! table. The raw logs are ragged tab-delimited text from the task
//! presentation software: rows are reconciled to the header's column count,
//! unparseable numbers become missing values, and unrecognized cue types are
//! skipped rather than raised.

use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::PipelineError;
use crate::types::{Event, TrialType};

/// Fixed 2.0 s feedback presentation window in the task design
const FEEDBACK_DURATION_S: f64 = 2.0;

/// 0-based bounds of the scored trial window: the task runs practice trials
/// before row 20 and filler after row 79, neither of which is modeled.
const TRIAL_WINDOW_START: usize = 20;
const TRIAL_WINDOW_END: usize = 79;

/// Timing parameters needed to align behavioral clocks to the retained
/// functional volume series.
#[derive(Debug, Clone)]
pub struct EventTimingParams {
    /// Repetition time in seconds
    pub tr: f64,
    /// Leading volumes removed from the functional series
    pub dummy_scans: usize,
    /// Task label used in output file names
    pub task: String,
}

/// One tokenized row of the raw timing log, reduced to the fields the
/// decoder consumes. Missing or unparseable numeric cells are `None`.
#[derive(Debug, Clone)]
pub struct TimingRecord {
    pub trial: usize,
    pub cue_type: String,
    pub accuracy: Option<i64>,
    /// Cue onset, scanner clock, milliseconds
    pub cue_onset_ms: Option<f64>,
    /// Cue offset (= target onset), milliseconds
    pub cue_offset_ms: Option<f64>,
    /// Feedback onset, milliseconds
    pub feedback_onset_ms: Option<f64>,
    /// Reaction time, milliseconds
    pub response_time_ms: Option<f64>,
}

/// Result of decoding one timing file
#[derive(Debug, Clone)]
pub struct DecodedEvents {
    /// Canonical `sub-NNN` subject identifier
    pub subject_id: String,
    pub events: Vec<Event>,
    /// Path of the written events table
    pub output_file: PathBuf,
}

/// Decode a raw timing file and write the BIDS events table.
///
/// The subject is resolved from the filename unless `subject_id` is given.
/// Onsets are shifted by `dummy_scans * tr` seconds to match a functional
/// series with its leading dummy volumes removed; events landing before the
/// corrected zero point are dropped.
pub fn decode_timing_file(
    timing_file: &Path,
    output_dir: &Path,
    session: &str,
    params: &EventTimingParams,
    subject_id: Option<&str>,
) -> Result<DecodedEvents, PipelineError> {
    let raw_id = match subject_id {
        Some(id) => id.to_string(),
        None => resolve_subject_from_filename(timing_file)?,
    };
    let subject = canonical_subject_id(&raw_id);

    let table = parse_timing_table(timing_file)?;
    let records = table.records();

    let last = records.len().saturating_sub(1);
    let window_end = TRIAL_WINDOW_END.min(last);

    let mut events = Vec::new();
    for record in records
        .iter()
        .take(window_end + 1)
        .skip(TRIAL_WINDOW_START)
    {
        events.extend(events_for_trial(record));
    }

    if events.is_empty() {
        return Err(PipelineError::NoValidTrials(timing_file.to_path_buf()));
    }

    // Align to the retained volume series and drop pre-zero events.
    let shift = params.dummy_scans as f64 * params.tr;
    for event in &mut events {
        event.onset -= shift;
    }
    events.retain(|e| e.onset >= 0.0);
    events.sort_by(|a, b| a.onset.partial_cmp(&b.onset).unwrap_or(std::cmp::Ordering::Equal));

    debug!(
        subject = %subject,
        shift_s = shift,
        n_events = events.len(),
        "adjusted onsets for dummy scans"
    );

    fs::create_dir_all(output_dir)?;
    let output_file = output_dir.join(format!(
        "{subject}_ses-{session}_task-{task}_events.tsv",
        task = params.task
    ));
    write_events_tsv(&events, &output_file)?;

    Ok(DecodedEvents {
        subject_id: subject,
        events,
        output_file,
    })
}

/// Check decoder invariants over an event set: non-negative onsets and
/// durations. Decoded output satisfies these by construction; the check
/// exists for tables read back from disk.
pub fn validate_events(events: &[Event]) -> Result<(), PipelineError> {
    if let Some(bad) = events.iter().find(|e| e.onset < 0.0) {
        return Err(PipelineError::InvalidEvents(format!(
            "negative onset {:.3} for {}",
            bad.onset, bad.trial_type
        )));
    }
    if let Some(bad) = events.iter().find(|e| e.duration < 0.0) {
        return Err(PipelineError::InvalidEvents(format!(
            "negative duration {:.3} for {}",
            bad.duration, bad.trial_type
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Raw table parsing

/// Header-indexed raw timing table
struct TimingTable {
    header: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TimingTable {
    /// Column index by header name, with the task file's fixed positional
    /// layout as fallback for headerless exports.
    fn column(&self, name: &str, fallback: usize) -> Option<usize> {
        if let Some(idx) = self.header.iter().position(|h| h == name) {
            return Some(idx);
        }
        (fallback < self.header.len()).then_some(fallback)
    }

    fn numeric(&self, row: &[String], name: &str, fallback: usize) -> Option<f64> {
        let idx = self.column(name, fallback)?;
        parse_number(&row[idx])
    }

    fn records(&self) -> Vec<TimingRecord> {
        let cue_col = self.column("cue_type", 2);
        self.rows
            .iter()
            .enumerate()
            .map(|(trial, row)| TimingRecord {
                trial,
                cue_type: cue_col.map(|c| row[c].clone()).unwrap_or_default(),
                accuracy: self.numeric(row, "acc", 3).map(|v| v as i64),
                cue_onset_ms: self.numeric(row, "onsettime_cue", 9),
                cue_offset_ms: self.numeric(row, "onsettime_target", 10),
                feedback_onset_ms: self.numeric(row, "onsettime_feedback", 11),
                response_time_ms: self.numeric(row, "rt", 4),
            })
            .collect()
    }
}

fn parse_timing_table(path: &Path) -> Result<TimingTable, PipelineError> {
    let raw = fs::read_to_string(path)?;
    let mut lines = raw.lines();

    let header: Vec<String> = match lines.next() {
        Some(line) if !line.trim().is_empty() => {
            line.trim_end().split('\t').map(|s| s.to_string()).collect()
        }
        _ => return Err(PipelineError::EmptyTimingFile(path.to_path_buf())),
    };

    let mut rows = Vec::new();
    for line in lines {
        if line.trim().is_empty() {
            continue;
        }
        let mut cells: Vec<String> = line.trim_end().split('\t').map(|s| s.to_string()).collect();
        // Reconcile ragged rows to the header width.
        if cells.len() < header.len() {
            cells.resize(header.len(), String::new());
        } else {
            cells.truncate(header.len());
        }
        rows.push(cells);
    }

    if rows.is_empty() {
        return Err(PipelineError::EmptyTimingFile(path.to_path_buf()));
    }

    Ok(TimingTable { header, rows })
}

fn parse_number(cell: &str) -> Option<f64> {
    let trimmed = cell.trim();
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse::<f64>().ok().filter(|v| v.is_finite())
}

// ---------------------------------------------------------------------------
// Trial classification

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CueClass {
    Reward,
    Neutral,
}

/// Case-insensitive keyword classification. The reward cue is rendered as a
/// smiley in some site exports, so "smile" counts as reward.
fn classify_cue(cue_type: &str) -> Option<CueClass> {
    let lower = cue_type.to_lowercase();
    if lower.contains("reward") || lower.contains("smile") {
        Some(CueClass::Reward)
    } else if lower.contains("neutral") {
        Some(CueClass::Neutral)
    } else {
        None
    }
}

/// Emit the anticipation and feedback events for one trial. Trials with an
/// unrecognized cue type or missing timestamps produce no events.
fn events_for_trial(record: &TimingRecord) -> Vec<Event> {
    let mut events = Vec::new();

    let Some(class) = classify_cue(&record.cue_type) else {
        if !record.cue_type.trim().is_empty() {
            warn!(
                trial = record.trial,
                cue_type = %record.cue_type,
                "unrecognized cue type, skipping trial"
            );
        }
        return events;
    };

    let correct = record.accuracy == Some(1);
    let response_time = record.response_time_ms.map(|ms| ms / 1000.0);

    if let (Some(onset_ms), Some(offset_ms)) = (record.cue_onset_ms, record.cue_offset_ms) {
        let onset = onset_ms / 1000.0;
        let duration = offset_ms / 1000.0 - onset;
        if duration >= 0.0 {
            events.push(Event {
                onset,
                duration,
                trial_type: match class {
                    CueClass::Reward => TrialType::AnticipationReward,
                    CueClass::Neutral => TrialType::AnticipationNeutral,
                },
                accuracy: record.accuracy,
                response_time,
            });
        } else {
            warn!(
                trial = record.trial,
                "cue offset precedes cue onset, skipping anticipation event"
            );
        }
    }

    if let Some(feedback_ms) = record.feedback_onset_ms {
        events.push(Event {
            onset: feedback_ms / 1000.0,
            duration: FEEDBACK_DURATION_S,
            trial_type: match (class, correct) {
                (CueClass::Reward, true) => TrialType::FeedbackRewardSuccess,
                (CueClass::Reward, false) => TrialType::FeedbackRewardFailure,
                (CueClass::Neutral, true) => TrialType::FeedbackNeutralSuccess,
                (CueClass::Neutral, false) => TrialType::FeedbackNeutralFailure,
            },
            accuracy: record.accuracy,
            response_time: None,
        });
    }

    events
}

// ---------------------------------------------------------------------------
// Subject identification

/// Resolve a raw subject identifier from a timing filename.
///
/// Pattern candidates, most specific first:
/// 1. `Reward_task_<id>_reward...`
/// 2. `...task_<id>_...`
/// 3. leading `<id>_` segment
/// 4. first run of ASCII digits anywhere in the stem
pub fn resolve_subject_from_filename(path: &Path) -> Result<String, PipelineError> {
    let stem = path
        .file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or_default();

    if let Some(pos) = stem.find("Reward_task_") {
        let rest = &stem[pos + "Reward_task_".len()..];
        if let Some(end) = rest.find('_') {
            if end > 0 && rest[end + 1..].starts_with("reward") {
                return Ok(rest[..end].to_string());
            }
        }
    }

    if let Some(pos) = stem.find("task_") {
        let rest = &stem[pos + "task_".len()..];
        if let Some(end) = rest.find('_') {
            if end > 0 {
                return Ok(rest[..end].to_string());
            }
        }
    }

    if let Some(end) = stem.find('_') {
        if end > 0 {
            return Ok(stem[..end].to_string());
        }
    }

    if let Some(run) = first_digit_run(stem) {
        return Ok(run);
    }

    Err(PipelineError::SubjectIdentification(
        path.display().to_string(),
    ))
}

fn first_digit_run(text: &str) -> Option<String> {
    let start = text.find(|c: char| c.is_ascii_digit())?;
    let run: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    Some(run)
}

/// Normalize a raw subject identifier to canonical `sub-NNN` form
/// (zero-padded to three digits). Already-canonical identifiers pass
/// through unchanged.
pub fn canonical_subject_id(raw: &str) -> String {
    if is_canonical(raw) {
        return raw.to_string();
    }

    // Site-specific "ld<num>s<run>" identifiers
    if let Some(num) = parse_ld_id(raw) {
        return format!("sub-{num:03}");
    }

    if let Some(rest) = raw.strip_prefix("sub") {
        if !rest.is_empty() && rest.chars().all(|c| c.is_ascii_digit()) {
            if let Ok(num) = rest.parse::<u64>() {
                return format!("sub-{num:03}");
            }
        }
    }

    if !raw.is_empty() && raw.chars().all(|c| c.is_ascii_digit()) {
        if let Ok(num) = raw.parse::<u64>() {
            return format!("sub-{num:03}");
        }
    }

    if let Some(run) = first_digit_run(raw) {
        if let Ok(num) = run.parse::<u64>() {
            return format!("sub-{num:03}");
        }
    }

    let clean: String = raw.chars().filter(|c| c.is_ascii_alphanumeric()).collect();
    format!("sub-{clean}")
}

fn is_canonical(id: &str) -> bool {
    match id.strip_prefix("sub-") {
        Some(digits) => digits.len() == 3 && digits.chars().all(|c| c.is_ascii_digit()),
        None => false,
    }
}

fn parse_ld_id(raw: &str) -> Option<u64> {
    let rest = raw.strip_prefix("ld")?;
    let digit_end = rest.find(|c: char| !c.is_ascii_digit())?;
    if digit_end == 0 {
        return None;
    }
    let (digits, tail) = rest.split_at(digit_end);
    let tail = tail.strip_prefix('s')?;
    if !tail.chars().all(|c| c.is_ascii_digit()) {
        return None;
    }
    digits.parse().ok()
}

// ---------------------------------------------------------------------------
// Output

fn write_events_tsv(events: &[Event], path: &Path) -> Result<(), PipelineError> {
    let mut out = String::from("onset\tduration\ttrial_type\taccuracy\tresponse_time\n");
    for event in events {
        let accuracy = event
            .accuracy
            .map_or_else(|| "n/a".to_string(), |a| a.to_string());
        let response_time = event
            .response_time
            .map_or_else(|| "n/a".to_string(), |rt| format!("{rt:.3}"));
        out.push_str(&format!(
            "{:.3}\t{:.3}\t{}\t{}\t{}\n",
            event.onset, event.duration, event.trial_type, accuracy, response_time
        ));
    }
    fs::write(path, out)?;
    Ok(())
}
