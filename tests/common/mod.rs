//! Shared fixtures: an in-process queue server, in-memory buckets and a scripted classifier.

#![allow(dead_code)]

use std::collections::{HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::extract::{Form, Json, Path as UrlPath, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use axum::Router;
use object_store::ObjectStore;
use serde_json::{Value, json};
use tempfile::TempDir;

use birdnet_runner::analyzer::{Analysis, Analyzer, AnalyzerCache, AnalyzerFactory, AnalyzerSpec};
use birdnet_runner::audio::WavAudio;
use birdnet_runner::job::Detection;
use birdnet_runner::queue::{QueueClient, build_http_client};
use birdnet_runner::storage::{BucketStores, ObjectStorage};
use birdnet_runner::{Config, Pipeline, Result, RunnerError};

pub const FIXTURE_KEY: &str = "PROJECT_SLUG/GROUP/soundscape.wav";
pub const FIXTURE_MD5: &str = "c59bf4cc03069a1459df8490c6b30d8a";
pub const PROCESSOR_ID: &str = "i-test";
pub const API_KEY: &str = "test-key";

pub fn fixture_path() -> PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("tests/fixtures/soundscape.wav")
}

/// Everything the mock queue server saw and will answer.
pub struct MockState {
    pub dequeue_responses: Mutex<VecDeque<(StatusCode, String)>>,
    pub dequeue_forms: Mutex<Vec<HashMap<String, String>>>,
    pub api_keys: Mutex<Vec<String>>,
    pub reports: Mutex<Vec<(i64, Value)>>,
    pub report_status: Mutex<StatusCode>,
    pub shutdown_notices: Mutex<Vec<Value>>,
}

impl Default for MockState {
    fn default() -> Self {
        Self {
            dequeue_responses: Mutex::new(VecDeque::new()),
            dequeue_forms: Mutex::new(Vec::new()),
            api_keys: Mutex::new(Vec::new()),
            reports: Mutex::new(Vec::new()),
            report_status: Mutex::new(StatusCode::CREATED),
            shutdown_notices: Mutex::new(Vec::new()),
        }
    }
}

impl MockState {
    pub fn push_dequeue(&self, status: StatusCode, body: impl Into<String>) {
        self.dequeue_responses.lock().unwrap().push_back((status, body.into()));
    }

    pub fn push_job(&self, job: &Value) {
        self.push_dequeue(StatusCode::OK, job.to_string());
    }

    pub fn report_count(&self) -> usize {
        self.reports.lock().unwrap().len()
    }

    pub fn notice_count(&self) -> usize {
        self.shutdown_notices.lock().unwrap().len()
    }
}

async fn dequeue(
    State(state): State<Arc<MockState>>,
    headers: HeaderMap,
    Form(form): Form<HashMap<String, String>>,
) -> (StatusCode, String) {
    if let Some(key) = headers.get("BNL_APIKEY").and_then(|v| v.to_str().ok()) {
        state.api_keys.lock().unwrap().push(key.to_string());
    }
    state.dequeue_forms.lock().unwrap().push(form);
    state
        .dequeue_responses
        .lock()
        .unwrap()
        .pop_front()
        .unwrap_or((StatusCode::OK, "{}".to_string()))
}

async fn results(
    State(state): State<Arc<MockState>>,
    UrlPath(id): UrlPath<i64>,
    Json(body): Json<Value>,
) -> (StatusCode, String) {
    state.reports.lock().unwrap().push((id, body));
    let status = *state.report_status.lock().unwrap();
    (status, "{}".to_string())
}

async fn shutdown_instance(
    State(state): State<Arc<MockState>>,
    Json(body): Json<Value>,
) -> StatusCode {
    state.shutdown_notices.lock().unwrap().push(body);
    StatusCode::OK
}

/// Start the mock server; returns its state and the API endpoint (`http://127.0.0.1:PORT/api`).
pub async fn start_server() -> (Arc<MockState>, String) {
    let state = Arc::new(MockState::default());
    let router = Router::new()
        .route("/api/queues/audio/", post(dequeue))
        .route("/api/queues/audio/{id}/results/", post(results))
        .route("/api/shutdown-instance/", post(shutdown_instance))
        .with_state(Arc::clone(&state));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });
    (state, format!("http://{}/api", addr))
}

/// Returns a fixed set of detections filtered by `min_conf`; duration comes from the real file.
pub struct ScriptedAnalyzer {
    detections: Vec<Detection>,
}

impl Analyzer for ScriptedAnalyzer {
    fn analyze(&self, audio_path: &Path, min_conf: f32) -> Result<Analysis> {
        let audio = WavAudio::from_file(audio_path)?;
        let detections = self
            .detections
            .iter()
            .filter(|d| d.confidence >= min_conf)
            .cloned()
            .collect();
        Ok(Analysis { detections, duration_secs: audio.duration() })
    }

    fn version(&self) -> &str {
        "scripted-1"
    }
}

#[derive(Default)]
pub struct ScriptedFactory {
    pub builds: AtomicUsize,
}

impl ScriptedFactory {
    pub fn build_count(&self) -> usize {
        self.builds.load(Ordering::SeqCst)
    }
}

impl AnalyzerFactory for ScriptedFactory {
    fn build(&self, _spec: &AnalyzerSpec) -> Result<Arc<dyn Analyzer>> {
        self.builds.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(ScriptedAnalyzer { detections: scripted_detections() }))
    }
}

/// Builds classifiers that fail on every file.
pub struct FailingFactory;

struct FailingAnalyzer;

impl Analyzer for FailingAnalyzer {
    fn analyze(&self, _audio_path: &Path, _min_conf: f32) -> Result<Analysis> {
        Err(RunnerError::classification("model produced no output"))
    }

    fn version(&self) -> &str {
        "failing-1"
    }
}

impl AnalyzerFactory for FailingFactory {
    fn build(&self, _spec: &AnalyzerSpec) -> Result<Arc<dyn Analyzer>> {
        Ok(Arc::new(FailingAnalyzer))
    }
}

/// Object storage whose file uploads to `broken_bucket` always fail; everything else is delegated.
pub struct BrokenUploads {
    pub inner: Arc<BucketStores>,
    pub broken_bucket: String,
}

#[async_trait]
impl ObjectStorage for BrokenUploads {
    async fn download_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        self.inner.download_to(bucket, key, dest).await
    }

    async fn upload_file(&self, bucket: &str, key: &str, src: &Path) -> Result<String> {
        if bucket == self.broken_bucket {
            return Err(RunnerError::transfer(bucket, key, "connection reset"));
        }
        self.inner.upload_file(bucket, key, src).await
    }

    async fn put_bytes(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<String> {
        self.inner.put_bytes(bucket, key, body).await
    }
}

/// 0-3 s at 0.3, two species at 3-6 s (0.9 and 0.6), 6-9 s at 0.2.
pub fn scripted_detections() -> Vec<Detection> {
    vec![
        Detection::from_label("Turdus migratorius_American Robin", 0.3, 0.0, 3.0),
        Detection::from_label("Cardinalis cardinalis_Northern Cardinal", 0.9, 3.0, 6.0),
        Detection::from_label("Zenaida macroura_Mourning Dove", 0.6, 3.0, 6.0),
        Detection::from_label("Corvus brachyrhynchos_American Crow", 0.2, 6.0, 9.0),
    ]
}

/// Queue item for the fixture. Detection threshold 0.25, clips at 0.5, spectrograms at 0.8.
pub fn job_json(id: i64, config_id: i64, file_path: &str) -> Value {
    json!({
        "id": id,
        "file_path": file_path,
        "file_source": {"id": 1, "name": "Main Bucket", "s3_bucket": "audio-raw"},
        "status": "in_progress",
        "project": {
            "id": 1,
            "name": "Main Project",
            "analyzer_config": {
                "id": config_id,
                "analyzer": {"id": 1, "name": "BirdNET-Analyzer"},
                "config": {
                    "min_conf": 0.25,
                    "min_conf_audio_extraction": 0.5,
                    "min_conf_spectrogram_extraction": 0.8
                },
                "extraction_audio_file_destination": {"s3_bucket": "extraction"},
                "extraction_spectrogram_file_destination": {"s3_bucket": "extraction"},
                "analysis_json_file_destination": {"s3_bucket": "data"}
            }
        }
    })
}

pub struct Harness {
    pub state: Arc<MockState>,
    pub stores: Arc<BucketStores>,
    pub factory: Arc<ScriptedFactory>,
    pub config: Config,
    pub scratch: TempDir,
}

impl Harness {
    pub async fn new() -> Self {
        let (state, endpoint) = start_server().await;
        let scratch = TempDir::new().unwrap();

        let mut config = Config::default();
        config.api.endpoint = endpoint;
        config.api.api_key = API_KEY.to_string();
        config.api.processor_id = Some(PROCESSOR_ID.to_string());
        config.api.processor_type = Some("c5.xlarge".to_string());
        config.worker.scratch_dir = scratch.path().to_path_buf();
        config.worker.runner_count = 4;

        let stores = Arc::new(BucketStores::in_memory());
        let fixture = std::fs::read(fixture_path()).unwrap();
        stores.put_bytes("audio-raw", FIXTURE_KEY, fixture).await.unwrap();

        Self {
            state,
            stores,
            factory: Arc::new(ScriptedFactory::default()),
            config,
            scratch,
        }
    }

    pub fn pipeline(&self) -> Pipeline {
        self.pipeline_with(self.stores.clone(), self.factory.clone())
    }

    /// Pipeline over substitute storage and classifier.
    pub fn pipeline_with(
        &self,
        storage: Arc<dyn ObjectStorage>,
        factory: Arc<dyn AnalyzerFactory>,
    ) -> Pipeline {
        let client = build_http_client(&self.config.api).unwrap();
        let queue = QueueClient::new(client, &self.config.api.endpoint, self.config.identity());
        let cache = AnalyzerCache::new(factory, None);
        Pipeline::new(queue, storage, cache, &self.config)
    }

    /// Files left anywhere under the scratch directory.
    pub fn scratch_files(&self) -> Vec<PathBuf> {
        fn walk(dir: &Path, out: &mut Vec<PathBuf>) {
            let Ok(entries) = std::fs::read_dir(dir) else { return };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.is_dir() {
                    walk(&path, out);
                } else {
                    out.push(path);
                }
            }
        }
        let mut files = Vec::new();
        walk(self.scratch.path(), &mut files);
        files
    }

    pub async fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
        let store = self.stores.store(bucket, true).unwrap();
        let result = store.get(&object_store::path::Path::from(key)).await.ok()?;
        Some(result.bytes().await.ok()?.to_vec())
    }
}
