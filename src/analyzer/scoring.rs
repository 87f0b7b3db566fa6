//! Label files, species allow-lists and score-to-detection conversion

use std::path::Path;

use crate::error::{RunnerError, Result};
use crate::job::Detection;

/// Read a labels file, one `ScientificName_CommonName` per line.
pub fn read_labels<P: AsRef<Path>>(path: P) -> Result<Vec<String>> {
    let path = path.as_ref();
    let content = std::fs::read_to_string(path)
        .map_err(|e| {
            RunnerError::classification(format!("Cannot read labels {}: {}", path.display(), e))
        })?;

    let labels: Vec<String> = content
        .lines()
        .map(str::trim)
        .filter(|l| !l.is_empty())
        .map(str::to_string)
        .collect();

    if labels.is_empty() {
        return Err(RunnerError::classification(format!("Labels file {} is empty", path.display())));
    }
    Ok(labels)
}

/// Mask of labels allowed by `species_list`; an empty list allows everything.
///
/// Entries match the full label, the scientific name or the common name.
pub fn allow_mask(labels: &[String], species_list: &[String]) -> Vec<bool> {
    if species_list.is_empty() {
        return vec![true; labels.len()];
    }

    labels
        .iter()
        .map(|label| {
            let (sci, common) = label.split_once('_').unwrap_or((label.as_str(), label.as_str()));
            species_list
                .iter()
                .any(|s| s == label || s == sci || s == common)
        })
        .collect()
}

/// Start offsets (in samples) of fixed-length analysis windows.
///
/// The final partial window is kept so trailing audio is still classified.
pub fn window_starts(total: usize, window: usize, step: usize) -> Vec<usize> {
    if total == 0 || window == 0 || step == 0 {
        return Vec::new();
    }
    let mut starts = Vec::new();
    let mut start = 0;
    loop {
        starts.push(start);
        if start + window >= total {
            break;
        }
        start += step;
    }
    starts
}

/// Logistic activation with sensitivity, clamped like the reference classifier.
pub fn sigmoid(logit: f32, sensitivity: f32) -> f32 {
    let x = (-sensitivity * logit).clamp(-15.0, 15.0);
    1.0 / (1.0 + x.exp())
}

/// Turn one window's scores into detections.
pub fn detections_for_window(
    scores: &[f32],
    labels: &[String],
    allowed: &[bool],
    start_secs: f64,
    end_secs: f64,
    min_conf: f32,
) -> Vec<Detection> {
    let mut hits: Vec<Detection> = scores
        .iter()
        .zip(labels.iter().zip(allowed))
        .filter(|(score, (_, allowed))| **allowed && **score >= min_conf)
        .map(|(score, (label, _))| Detection::from_label(label, *score, start_secs, end_secs))
        .collect();
    hits.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));
    hits
}
