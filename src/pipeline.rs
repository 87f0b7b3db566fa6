//! Per-job pipeline
//!
//! dequeue -> stage -> analyze -> extract -> upload -> report, strictly in order. A failure
//! at any stage abandons the job without a report; the staged file and every artifact are
//! released on all paths once staging has succeeded.

use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use serde_json::Value;

use crate::analyzer::AnalyzerCache;
use crate::config::Config;
use crate::error::{RunnerError, Result};
use crate::extract::{ExtractionSummary, Extractor, Thresholds};
use crate::job::{Detection, Job, ResultPayload, ResultsDocument, round_secs};
use crate::queue::{Dequeued, QueueClient};
use crate::stager::{FileStager, StagedFile, file_checksum};
use crate::storage::ObjectStorage;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Stage {
    Dequeue,
    Stage,
    Analyze,
    Extract,
    Upload,
    Report,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Dequeue => "dequeue",
            Stage::Stage => "stage",
            Stage::Analyze => "analyze",
            Stage::Extract => "extract",
            Stage::Upload => "upload",
            Stage::Report => "report",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a job was abandoned.
#[derive(Debug)]
pub struct PipelineFault {
    /// Absent when the failure happened before a job was obtained.
    pub job_id: Option<i64>,
    pub stage: Stage,
    pub error: RunnerError,
}

impl fmt::Display for PipelineFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.job_id {
            Some(id) => write!(f, "job {} failed at {}: {}", id, self.stage, self.error),
            None => write!(f, "{} failed: {}", self.stage, self.error),
        }
    }
}

/// Summary of a completed job.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobReport {
    pub job_id: i64,
    pub detections: usize,
    pub extracted: ExtractionSummary,
    pub uploaded: usize,
    /// Artifact uploads that failed or had no destination bucket.
    pub skipped_uploads: usize,
    pub results_url: String,
    pub files_removed: usize,
    pub acknowledgment: Option<Value>,
}

impl JobReport {
    /// Completed, but some artifacts never reached storage.
    pub fn is_degraded(&self) -> bool {
        self.skipped_uploads > 0
    }
}

#[derive(Debug)]
pub enum JobOutcome {
    /// Queue was empty.
    Idle,
    /// Queue was empty and the server allows this instance to shut down.
    SafeToShutdown,
    Completed(JobReport),
    Faulted(PipelineFault),
}

impl JobOutcome {
    /// Whether a job was taken off the queue this cycle.
    pub fn had_job(&self) -> bool {
        match self {
            JobOutcome::Completed(_) => true,
            JobOutcome::Faulted(fault) => fault.job_id.is_some(),
            JobOutcome::Idle | JobOutcome::SafeToShutdown => false,
        }
    }
}

/// Work done between staging and release, kept for the final report.
struct Processed {
    payload: ResultPayload,
    extracted: ExtractionSummary,
    uploaded: usize,
    skipped_uploads: usize,
    results_url: String,
}

fn at(stage: Stage) -> impl Fn(RunnerError) -> (Stage, RunnerError) {
    move |error| (stage, error)
}

pub struct Pipeline {
    queue: QueueClient,
    storage: Arc<dyn ObjectStorage>,
    cache: AnalyzerCache,
    stager: FileStager,
    extractor: Extractor,
}

impl Pipeline {
    pub fn new(
        queue: QueueClient,
        storage: Arc<dyn ObjectStorage>,
        cache: AnalyzerCache,
        config: &Config,
    ) -> Self {
        Self {
            stager: FileStager::new(Arc::clone(&storage), config.audio_dir()),
            extractor: Extractor::new(
                config.clip_dir(),
                config.spectrogram_dir(),
                config.worker.clip_padding_secs,
            ),
            queue,
            storage,
            cache,
        }
    }

    pub fn queue(&self) -> &QueueClient {
        &self.queue
    }

    pub fn cache(&self) -> &AnalyzerCache {
        &self.cache
    }

    /// Run one dequeue cycle. Job errors come back as [`JobOutcome::Faulted`].
    pub async fn run_once(&self) -> JobOutcome {
        let started = Instant::now();

        let job = match self.queue.dequeue().await {
            Ok(Dequeued::Job(job)) => job,
            Ok(Dequeued::Empty) => return JobOutcome::Idle,
            Ok(Dequeued::SafeToShutdown) => return JobOutcome::SafeToShutdown,
            Err(e) => {
                let fault = PipelineFault { job_id: None, stage: Stage::Dequeue, error: e };
                log_fault(&fault);
                return JobOutcome::Faulted(fault);
            }
        };

        info!("job={} processing s3://{}/{}", job.id, job.source_bucket(), job.file_path);
        match self.process(&job, started).await {
            Ok(report) => {
                info!(
                    "job={} completed: {} detections, {} uploads ({} skipped), {:.2}s",
                    report.job_id,
                    report.detections,
                    report.uploaded,
                    report.skipped_uploads,
                    started.elapsed().as_secs_f64()
                );
                JobOutcome::Completed(report)
            }
            Err((stage, error)) => {
                let fault = PipelineFault { job_id: Some(job.id), stage, error };
                log_fault(&fault);
                JobOutcome::Faulted(fault)
            }
        }
    }

    async fn process(
        &self,
        job: &Job,
        started: Instant,
    ) -> std::result::Result<JobReport, (Stage, RunnerError)> {
        debug!("job={} stage={}", job.id, Stage::Stage);
        let staged = self.stager.stage(job).await.map_err(at(Stage::Stage))?;

        let mut detections = Vec::new();
        let processed = self.process_staged(job, &staged, started, &mut detections).await;

        let files_removed = match &processed {
            Ok(p) => self.stager.release(staged, &p.payload.detections).await,
            Err(_) => self.stager.release(staged, &detections).await,
        };
        let processed = processed?;

        debug!("job={} stage={}", job.id, Stage::Report);
        let acknowledgment = self
            .queue
            .report(job.id, &processed.payload)
            .await
            .map_err(at(Stage::Report))?;

        Ok(JobReport {
            job_id: job.id,
            detections: processed.payload.detections.len(),
            extracted: processed.extracted,
            uploaded: processed.uploaded,
            skipped_uploads: processed.skipped_uploads,
            results_url: processed.results_url,
            files_removed,
            acknowledgment,
        })
    }

    /// Everything between staging and release. `detections` always holds the latest
    /// detections so their artifacts can be released even when a later step fails.
    async fn process_staged(
        &self,
        job: &Job,
        staged: &StagedFile,
        started: Instant,
        detections: &mut Vec<Detection>,
    ) -> std::result::Result<Processed, (Stage, RunnerError)> {
        let config = job.analyzer_config();

        debug!("job={} stage={}", job.id, Stage::Analyze);
        let entry = self.cache.get_or_create(config).await.map_err(at(Stage::Analyze))?;
        let analyzer = Arc::clone(&entry.analyzer);
        let audio_path = staged.path().to_path_buf();
        let min_conf = config.min_conf();
        let analysis = tokio::task::spawn_blocking(move || analyzer.analyze(&audio_path, min_conf))
            .await
            .map_err(RunnerError::from)
            .and_then(|r| r)
            .map_err(at(Stage::Analyze))?;
        let checksum = file_checksum(staged.path()).await.map_err(at(Stage::Analyze))?;
        *detections = analysis.detections;
        debug!("job={} analyzed: {} detections", job.id, detections.len());

        debug!("job={} stage={}", job.id, Stage::Extract);
        let thresholds = Thresholds {
            audio: config.min_conf_audio_extraction(),
            spectrogram: config.min_conf_spectrogram_extraction(),
        };
        let extracted = self
            .extract(staged.path(), detections, thresholds)
            .await
            .map_err(at(Stage::Extract))?;

        debug!("job={} stage={}", job.id, Stage::Upload);
        let (uploaded, skipped_uploads) = self.upload_artifacts(job, detections).await;

        let payload = ResultPayload {
            detections: detections.clone(),
            config_id: config.id,
            duration_seconds: analysis.duration_secs,
            analyzer_instance_id: self.queue.identity().instance_id().to_string(),
            analyzer_instance_type: self.queue.identity().instance_type().to_string(),
            analyzer_duration_seconds: round_secs(started.elapsed().as_secs_f64()),
            analyzer_version: entry.analyzer.version().to_string(),
            file_checksum: checksum,
        };
        let results_url = self.upload_results(job, &payload).await.map_err(at(Stage::Upload))?;

        Ok(Processed { payload, extracted, uploaded, skipped_uploads, results_url })
    }

    async fn extract(
        &self,
        source: &Path,
        detections: &mut Vec<Detection>,
        thresholds: Thresholds,
    ) -> Result<ExtractionSummary> {
        let extractor = self.extractor.clone();
        let source = source.to_path_buf();
        let mut owned = std::mem::take(detections);

        let (owned, summary) = tokio::task::spawn_blocking(move || {
            let summary = extractor.extract(&source, &mut owned, thresholds);
            (owned, summary)
        })
        .await?;

        *detections = owned;
        summary
    }

    /// Upload clips and spectrograms, attaching public URLs. Failures only degrade the job.
    async fn upload_artifacts(&self, job: &Job, detections: &mut [Detection]) -> (usize, usize) {
        let config = job.analyzer_config();
        let mut urls: HashMap<PathBuf, String> = HashMap::new();
        let mut uploaded = 0;
        let mut skipped = 0;

        for detection in detections.iter_mut() {
            if let Some(path) = detection.extracted_audio_path.clone() {
                let bucket = config.audio_bucket();
                match self.upload_artifact(job, bucket, &path, &mut urls).await {
                    Some(url) => {
                        detection.extracted_audio_url = Some(url);
                        uploaded += 1;
                    }
                    None => skipped += 1,
                }
            }
            if let Some(path) = detection.extracted_spectrogram_path.clone() {
                let bucket = config.spectrogram_bucket();
                match self.upload_artifact(job, bucket, &path, &mut urls).await {
                    Some(url) => {
                        detection.extracted_spectrogram_url = Some(url);
                        uploaded += 1;
                    }
                    None => skipped += 1,
                }
            }
        }
        (uploaded, skipped)
    }

    async fn upload_artifact(
        &self,
        job: &Job,
        bucket: Option<&str>,
        path: &Path,
        urls: &mut HashMap<PathBuf, String>,
    ) -> Option<String> {
        if let Some(url) = urls.get(path) {
            return Some(url.clone());
        }
        let Some(bucket) = bucket else {
            warn!("job={} no destination bucket for {}, not uploaded", job.id, path.display());
            return None;
        };

        let key = job.artifact_key(path);
        match self.storage.upload_file(bucket, &key, path).await {
            Ok(url) => {
                urls.insert(path.to_path_buf(), url.clone());
                Some(url)
            }
            Err(e) => {
                warn!("job={} stage={} kind={} {}", job.id, Stage::Upload, e.kind(), e);
                None
            }
        }
    }

    async fn upload_results(&self, job: &Job, payload: &ResultPayload) -> Result<String> {
        let config = job.analyzer_config();
        let bucket = config
            .results_bucket()
            .ok_or_else(|| {
                RunnerError::config(format!("Analyzer config {} has no results bucket", config.id))
            })?;

        let document = ResultsDocument { payload, analyzer_config: config };
        let body = serde_json::to_vec(&document)?;
        self.storage.put_bytes(bucket, &job.results_key(), body).await
    }
}

fn log_fault(fault: &PipelineFault) {
    let job = fault.job_id.map(|id| id.to_string()).unwrap_or_else(|| "-".to_string());
    error!(
        "job={} stage={} kind={} {}",
        job,
        fault.stage,
        fault.error.kind(),
        fault.error
    );
}
