//! ONNX Runtime classifier
//!
//! Runs a BirdNET-style model exported to ONNX: mono audio at the model rate, cut into
//! fixed windows, one row of logits per window. Each model gets its own inference thread
//! owning the session, and callers talk to it over a channel.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::mpsc::{Sender, channel};
use std::thread;

use log::{debug, info, warn};
use ndarray::{Array2, IxDyn, s};
use onnxruntime::environment::Environment;
use onnxruntime::session::Session;
use onnxruntime::tensor::OrtOwnedTensor;
use onnxruntime::{GraphOptimizationLevel, LoggingLevel};

use super::scoring::{allow_mask, detections_for_window, read_labels, sigmoid, window_starts};
use super::{Analysis, Analyzer, AnalyzerFactory, AnalyzerSpec};
use crate::audio::{AudioConverter, WavAudio};
use crate::config::ClassifierConfig;
use crate::error::{RunnerError, Result};

pub const MODEL_FILE: &str = "model.onnx";
pub const LABELS_FILE: &str = "labels.txt";

struct Request {
    input: Array2<f32>,
    reply: Sender<Result<Vec<f32>>>,
}

fn open_session(model_path: PathBuf, threads: i16) -> Result<Session<'static>> {
    if !model_path.exists() {
        return Err(RunnerError::classification(format!(
            "ONNX model file does not exist: {}",
            model_path.display()
        )));
    }

    // Sessions borrow their environment, so it lives as long as the process
    let env: &'static Environment = Box::leak(Box::new(
        Environment::builder()
            .with_name("birdnet-runner")
            .with_log_level(LoggingLevel::Warning)
            .build()?,
    ));

    let session = env
        .new_session_builder()?
        .with_optimization_level(GraphOptimizationLevel::All)?
        .with_number_threads(threads)?
        .with_model_from_file(model_path)?;

    debug!(
        "Model inputs: {:?}, outputs: {:?}",
        session.inputs.iter().map(|i| i.name.as_str()).collect::<Vec<_>>(),
        session.outputs.iter().map(|o| o.name.as_str()).collect::<Vec<_>>()
    );
    Ok(session)
}

fn run_session(session: &mut Session<'static>, input: Array2<f32>) -> Result<Vec<f32>> {
    let outputs: Vec<OrtOwnedTensor<f32, IxDyn>> = session.run(vec![input])?;
    let logits = outputs
        .first()
        .ok_or_else(|| RunnerError::classification("Model produced no outputs"))?;
    Ok(logits.iter().copied().collect())
}

/// Start the inference thread and wait until the model has loaded.
fn spawn_session(model_path: PathBuf, threads: i16) -> Result<Sender<Request>> {
    let (tx, rx) = channel::<Request>();
    let (ready_tx, ready_rx) = channel::<Result<()>>();

    thread::Builder::new()
        .name("onnx-inference".to_string())
        .spawn(move || {
            let mut session = match open_session(model_path, threads) {
                Ok(session) => {
                    let _ = ready_tx.send(Ok(()));
                    session
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            while let Ok(request) = rx.recv() {
                let _ = request.reply.send(run_session(&mut session, request.input));
            }
        })?;

    ready_rx
        .recv()
        .map_err(|_| RunnerError::classification("Inference thread exited during startup"))??;
    Ok(tx)
}

pub struct OnnxAnalyzer {
    tx: Sender<Request>,
    labels: Vec<String>,
    allowed: Vec<bool>,
    version: String,
    sample_rate: u32,
    segment_secs: f64,
    overlap_secs: f64,
    sensitivity: f32,
}

impl OnnxAnalyzer {
    fn infer(&self, input: Array2<f32>) -> Result<Vec<f32>> {
        let (reply_tx, reply_rx) = channel();
        self.tx
            .send(Request { input, reply: reply_tx })
            .map_err(|_| RunnerError::classification("Inference thread stopped"))?;
        reply_rx
            .recv()
            .map_err(|_| RunnerError::classification("Inference thread dropped the request"))?
    }
}

impl Analyzer for OnnxAnalyzer {
    fn analyze(&self, audio_path: &Path, min_conf: f32) -> Result<Analysis> {
        let audio = WavAudio::from_file(audio_path)?;
        let duration_secs = audio.duration();
        let mono = audio.data().to_mono();
        let samples = AudioConverter::resample(mono.view(), audio.sample_rate(), self.sample_rate);

        let rate = self.sample_rate as f64;
        let window = (self.segment_secs * rate).round() as usize;
        let step = (((self.segment_secs - self.overlap_secs) * rate).round() as usize).max(1);
        let n_labels = self.labels.len();

        let mut detections = Vec::new();
        for start in window_starts(samples.len(), window, step) {
            let end = (start + window).min(samples.len());
            let mut input = Array2::<f32>::zeros((1, window));
            input.slice_mut(s![0, ..end - start]).assign(&samples.slice(s![start..end]));

            let logits = self.infer(input)?;
            if logits.len() != n_labels {
                return Err(RunnerError::classification(format!(
                    "Model returned {} scores for {} labels",
                    logits.len(),
                    n_labels
                )));
            }

            let scores: Vec<f32> = logits.iter().map(|&x| sigmoid(x, self.sensitivity)).collect();
            let start_secs = start as f64 / rate;
            detections.extend(detections_for_window(
                &scores,
                &self.labels,
                &self.allowed,
                start_secs,
                start_secs + self.segment_secs,
                min_conf,
            ));
        }

        debug!(
            "{}: {} detections over {:.1}s",
            audio_path.display(),
            detections.len(),
            duration_secs
        );
        Ok(Analysis { detections, duration_secs })
    }

    fn version(&self) -> &str {
        &self.version
    }
}

/// Builds [`OnnxAnalyzer`]s from `{model_root}/{version}/model.onnx` and `labels.txt`,
/// or from custom artifacts when the job supplies them.
pub struct OnnxAnalyzerFactory {
    config: ClassifierConfig,
}

impl OnnxAnalyzerFactory {
    pub fn new(config: ClassifierConfig) -> Self {
        Self { config }
    }

    fn version_dir(&self, version: &str) -> PathBuf {
        self.config.model_root.join(version)
    }
}

impl AnalyzerFactory for OnnxAnalyzerFactory {
    fn build(&self, spec: &AnalyzerSpec) -> Result<Arc<dyn Analyzer>> {
        let version = spec.version.clone().unwrap_or_else(|| self.config.default_version.clone());
        let model_path = spec
            .model_path
            .clone()
            .unwrap_or_else(|| self.version_dir(&version).join(MODEL_FILE));
        let labels_path = spec
            .labels_path
            .clone()
            .unwrap_or_else(|| self.version_dir(&version).join(LABELS_FILE));

        let labels = read_labels(&labels_path)?;
        let allowed = allow_mask(&labels, &spec.species_list);
        if !spec.species_list.is_empty() && !allowed.iter().any(|a| *a) {
            warn!(
                "Species list matches none of the {} labels in {}",
                labels.len(),
                labels_path.display()
            );
        }

        let threads = self.config.inference_threads.min(i16::MAX as usize) as i16;
        let tx = spawn_session(model_path.clone(), threads)?;

        info!(
            "Loaded model {} ({} labels, {} allowed, {} threads)",
            model_path.display(),
            labels.len(),
            allowed.iter().filter(|a| **a).count(),
            threads
        );

        Ok(Arc::new(OnnxAnalyzer {
            tx,
            labels,
            allowed,
            version,
            sample_rate: self.config.sample_rate,
            segment_secs: self.config.segment_secs,
            overlap_secs: self.config.overlap_secs,
            sensitivity: self.config.sensitivity,
        }))
    }
}
