//! Audio clip and spectrogram extraction for detections above the configured thresholds

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use log::{debug, warn};

use crate::audio::{Spectrogram, SpectrogramConfig, WavAudio};
use crate::error::Result;
use crate::job::Detection;

/// Minimum confidences for each artifact kind.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Thresholds {
    pub audio: f32,
    pub spectrogram: f32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ExtractionSummary {
    pub clips: usize,
    pub spectrograms: usize,
}

#[derive(Debug, Clone)]
pub struct Extractor {
    clip_dir: PathBuf,
    spectrogram_dir: PathBuf,
    padding_secs: f64,
    spectrogram: SpectrogramConfig,
}

impl Extractor {
    pub fn new(
        clip_dir: impl Into<PathBuf>,
        spectrogram_dir: impl Into<PathBuf>,
        padding_secs: f64,
    ) -> Self {
        Self {
            clip_dir: clip_dir.into(),
            spectrogram_dir: spectrogram_dir.into(),
            padding_secs: padding_secs.max(0.0),
            spectrogram: SpectrogramConfig::default(),
        }
    }

    /// Write clips and spectrograms and record their paths on the detections.
    ///
    /// Detections sharing a time range share one file. Returns the number of files written.
    pub fn extract(
        &self,
        source: &Path,
        detections: &mut [Detection],
        thresholds: Thresholds,
    ) -> Result<ExtractionSummary> {
        let wants_clip = |d: &Detection| d.confidence >= thresholds.audio;
        let wants_spectrogram = |d: &Detection| d.confidence >= thresholds.spectrogram;

        if !detections.iter().any(|d| wants_clip(d) || wants_spectrogram(d)) {
            return Ok(ExtractionSummary::default());
        }

        let audio = WavAudio::from_file(source)?;
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "audio".to_string());

        let mut clips: HashMap<String, PathBuf> = HashMap::new();
        let mut spectrograms: HashMap<String, PathBuf> = HashMap::new();

        for detection in detections.iter_mut() {
            let (start, end) = self.padded_range(detection, audio.duration());
            let name = artifact_stem(&stem, start, end);

            if wants_clip(detection) {
                let path = match clips.get(&name) {
                    Some(path) => path.clone(),
                    None => {
                        let path = self.clip_dir.join(format!("{}.wav", name));
                        write_or_remove(&path, |p| audio.slice_secs(start, end).save_to_file(p))?;
                        clips.insert(name.clone(), path.clone());
                        path
                    }
                };
                detection.extracted_audio_path = Some(path);
            }

            if wants_spectrogram(detection) {
                let path = match spectrograms.get(&name) {
                    Some(path) => path.clone(),
                    None => {
                        let path = self.spectrogram_dir.join(format!("{}.png", name));
                        let samples = audio.slice_secs(start, end).data().to_mono().to_vec();
                        let spectrogram = Spectrogram::compute(&samples, &self.spectrogram);
                        let range_db = self.spectrogram.dynamic_range_db;
                        write_or_remove(&path, |p| spectrogram.save_png(p, range_db))?;
                        spectrograms.insert(name.clone(), path.clone());
                        path
                    }
                };
                detection.extracted_spectrogram_path = Some(path);
            }
        }

        let summary = ExtractionSummary { clips: clips.len(), spectrograms: spectrograms.len() };
        debug!(
            "Extracted {} clips and {} spectrograms from {}",
            summary.clips,
            summary.spectrograms,
            source.display()
        );
        Ok(summary)
    }

    fn padded_range(&self, detection: &Detection, duration: f64) -> (f64, f64) {
        let start = (detection.start_time - self.padding_secs).max(0.0);
        let end = (detection.end_time + self.padding_secs).min(duration).max(start);
        (start, end)
    }
}

/// Run `write`; a failed write leaves nothing behind at `path`.
fn write_or_remove(path: &Path, write: impl FnOnce(&Path) -> Result<()>) -> Result<()> {
    write(path).inspect_err(|_| {
        if let Err(e) = std::fs::remove_file(path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("Cannot remove partial artifact {}: {}", path.display(), e);
            }
        }
    })
}

fn artifact_stem(stem: &str, start: f64, end: f64) -> String {
    format!("{}_{:.1}s-{:.1}s", stem, start, end)
}
