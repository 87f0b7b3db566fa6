//! Classifier Module
//!
//! The classifier is consumed through the [`Analyzer`] trait; instances are built by an
//! [`AnalyzerFactory`] and reused across jobs by the [`AnalyzerCache`].

pub mod artifacts;
pub mod cache;
pub mod scoring;
#[cfg(feature = "onnx")]
pub mod onnx;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::config::ClassifierConfig;
use crate::error::Result;
use crate::job::Detection;

pub use artifacts::{ArtifactFetcher, api_origin};
pub use cache::{AnalyzerCache, CacheEntry};

/// Output of one full-file classification.
#[derive(Debug, Clone, Default)]
pub struct Analysis {
    /// Ordered by start time.
    pub detections: Vec<Detection>,
    pub duration_secs: f64,
}

/// An initialized classifier.
pub trait Analyzer: Send + Sync {
    /// Classify the whole file, keeping hits at or above `min_conf`.
    fn analyze(&self, audio_path: &Path, min_conf: f32) -> Result<Analysis>;

    /// Version string reported with results.
    fn version(&self) -> &str;
}

/// Everything needed to construct a classifier, with remote artifacts already on local disk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AnalyzerSpec {
    pub version: Option<String>,
    pub model_path: Option<PathBuf>,
    pub labels_path: Option<PathBuf>,
    pub species_list: Vec<String>,
}

pub trait AnalyzerFactory: Send + Sync {
    fn build(&self, spec: &AnalyzerSpec) -> Result<Arc<dyn Analyzer>>;
}

/// Factory used by the binary.
#[cfg(feature = "onnx")]
pub fn default_factory(config: &ClassifierConfig) -> Result<Arc<dyn AnalyzerFactory>> {
    Ok(Arc::new(onnx::OnnxAnalyzerFactory::new(config.clone())))
}

/// Factory used by the binary.
#[cfg(not(feature = "onnx"))]
pub fn default_factory(_config: &ClassifierConfig) -> Result<Arc<dyn AnalyzerFactory>> {
    Err(crate::error::RunnerError::config(
        "birdnet-runner was built without the `onnx` feature; no classifier is available",
    ))
}
