//! Queue wire types
//!
//! Jobs handed out by the queue server, the analyzer configuration embedded in them,
//! the detections produced for them and the payload reported back.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::Result;

/// Sentinel reported when the worker identity is unknown.
pub const UNSPECIFIED: &str = "Not specified";

/// Detection threshold used when the configuration does not carry one.
pub const DEFAULT_MIN_CONFIDENCE: f32 = 0.1;

/// Suffix appended to the source object key for the results document.
pub const RESULTS_KEY_SUFFIX: &str = "_data.json";

/// A bucket reference as sent by the server (`{"s3_bucket": ..., "name": ..., ...}`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketRef {
    pub s3_bucket: String,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl BucketRef {
    pub fn new<S: Into<String>>(bucket: S) -> Self {
        Self { s3_bucket: bucket.into(), extra: BTreeMap::new() }
    }
}

/// Analyzer identity as registered on the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerDescriptor {
    pub id: i64,
    pub name: String,
}

/// Classifier tuning knobs nested under `analyzer_config.config`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerSettings {
    #[serde(
        default,
        alias = "minimum_detection_confidence",
        skip_serializing_if = "Option::is_none"
    )]
    pub min_conf: Option<f32>,
    #[serde(default, alias = "minimum_detection_clip_confidence")]
    pub min_conf_audio_extraction: f32,
    #[serde(default)]
    pub min_conf_spectrogram_extraction: f32,
    /// Labels the classifier is restricted to; empty means no restriction.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub species_list: Vec<String>,
    /// Server-relative path of a custom model file.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_model_path: Option<String>,
    /// Server-relative path of the labels file matching `custom_model_path`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub custom_labels_path: Option<String>,
    /// Base classifier version, e.g. `"2.4"`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

/// Full analyzer configuration; identical serializations share one classifier instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    pub id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analyzer: Option<AnalyzerDescriptor>,
    #[serde(default)]
    pub config: AnalyzerSettings,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_audio_file_destination: Option<BucketRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extraction_spectrogram_file_destination: Option<BucketRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis_json_file_destination: Option<BucketRef>,
    #[serde(flatten)]
    pub extra: BTreeMap<String, Value>,
}

impl AnalyzerConfig {
    pub fn new(id: i64) -> Self {
        Self {
            id,
            analyzer: None,
            config: AnalyzerSettings::default(),
            extraction_audio_file_destination: None,
            extraction_spectrogram_file_destination: None,
            analysis_json_file_destination: None,
            extra: BTreeMap::new(),
        }
    }

    /// Deterministic SHA-256 over the key-sorted JSON form of this configuration.
    pub fn fingerprint(&self) -> Result<String> {
        let canonical = canonicalize(serde_json::to_value(self)?);
        let bytes = serde_json::to_vec(&canonical)?;
        Ok(hex::encode(Sha256::digest(&bytes)))
    }

    pub fn min_conf(&self) -> f32 {
        self.config.min_conf.unwrap_or(DEFAULT_MIN_CONFIDENCE)
    }

    pub fn min_conf_audio_extraction(&self) -> f32 {
        self.config.min_conf_audio_extraction
    }

    pub fn min_conf_spectrogram_extraction(&self) -> f32 {
        self.config.min_conf_spectrogram_extraction
    }

    pub fn audio_bucket(&self) -> Option<&str> {
        self.extraction_audio_file_destination.as_ref().map(|b| b.s3_bucket.as_str())
    }

    pub fn spectrogram_bucket(&self) -> Option<&str> {
        self.extraction_spectrogram_file_destination.as_ref().map(|b| b.s3_bucket.as_str())
    }

    pub fn results_bucket(&self) -> Option<&str> {
        self.analysis_json_file_destination.as_ref().map(|b| b.s3_bucket.as_str())
    }
}

/// Rebuild every JSON object with sorted keys, independent of serde_json's map flavour.
fn canonicalize(value: Value) -> Value {
    match value {
        Value::Object(map) => {
            let sorted: BTreeMap<String, Value> = map
                .into_iter()
                .map(|(k, v)| (k, canonicalize(v)))
                .collect();
            Value::Object(sorted.into_iter().collect())
        }
        Value::Array(items) => Value::Array(items.into_iter().map(canonicalize).collect()),
        other => other,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub analyzer_config: AnalyzerConfig,
}

/// One queue item: a source object plus the configuration to analyze it with.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: i64,
    /// Object key of the source audio inside `file_source`.
    pub file_path: String,
    pub file_source: BucketRef,
    pub project: Project,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub status: Option<String>,
}

impl Job {
    pub fn analyzer_config(&self) -> &AnalyzerConfig {
        &self.project.analyzer_config
    }

    pub fn source_bucket(&self) -> &str {
        &self.file_source.s3_bucket
    }

    /// Base filename of the source object, used for the staged copy.
    pub fn source_filename(&self) -> &str {
        self.file_path.rsplit('/').next().unwrap_or(&self.file_path)
    }

    /// Parent "directory" of the source object key (empty at bucket root).
    pub fn source_dir(&self) -> &str {
        self.file_path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
    }

    /// Key for an extracted artifact, placed next to the source object.
    pub fn artifact_key(&self, artifact: &Path) -> String {
        let name = artifact
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        match self.source_dir() {
            "" => name,
            dir => format!("{}/{}", dir, name),
        }
    }

    pub fn results_key(&self) -> String {
        format!("{}{}", self.file_path, RESULTS_KEY_SUFFIX)
    }
}

/// One classifier hit, enriched with artifact paths and URLs as the pipeline advances.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Detection {
    pub common_name: String,
    pub scientific_name: String,
    pub label: String,
    pub confidence: f32,
    pub start_time: f64,
    pub end_time: f64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_audio_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_spectrogram_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_audio_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extracted_spectrogram_url: Option<String>,
}

impl Detection {
    /// Build a detection from a `ScientificName_CommonName` label.
    pub fn from_label(label: &str, confidence: f32, start_time: f64, end_time: f64) -> Self {
        let (scientific_name, common_name) = label.split_once('_').map_or_else(
            || (label.to_string(), label.to_string()),
            |(sci, common)| (sci.to_string(), common.to_string()),
        );

        Self {
            common_name,
            scientific_name,
            label: label.to_string(),
            confidence,
            start_time,
            end_time,
            extracted_audio_path: None,
            extracted_spectrogram_path: None,
            extracted_audio_url: None,
            extracted_spectrogram_url: None,
        }
    }

    /// Local files this detection currently references.
    pub fn artifact_paths(&self) -> impl Iterator<Item = &Path> {
        self.extracted_audio_path
            .as_deref()
            .into_iter()
            .chain(self.extracted_spectrogram_path.as_deref())
    }
}

/// Who is running the job, as reported to the server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WorkerIdentity {
    pub processor_id: Option<String>,
    pub processor_type: Option<String>,
    /// Sent with dequeue requests when several runners share one host.
    pub process_id: Option<u32>,
}

impl WorkerIdentity {
    pub fn instance_id(&self) -> &str {
        non_empty(self.processor_id.as_deref()).unwrap_or(UNSPECIFIED)
    }

    pub fn instance_type(&self) -> &str {
        non_empty(self.processor_type.as_deref()).unwrap_or(UNSPECIFIED)
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}

/// Body of the per-job results report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultPayload {
    pub detections: Vec<Detection>,
    pub config_id: i64,
    pub duration_seconds: f64,
    pub analyzer_instance_id: String,
    pub analyzer_instance_type: String,
    pub analyzer_duration_seconds: f64,
    pub analyzer_version: String,
    pub file_checksum: String,
}

/// Results document uploaded to storage: the payload plus the configuration it was produced with.
#[derive(Debug, Serialize)]
pub struct ResultsDocument<'a> {
    #[serde(flatten)]
    pub payload: &'a ResultPayload,
    pub analyzer_config: &'a AnalyzerConfig,
}

/// Round seconds to two decimals for reporting.
pub fn round_secs(secs: f64) -> f64 {
    (secs * 100.0).round() / 100.0
}
