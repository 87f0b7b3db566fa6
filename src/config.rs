//! Configuration management for the queue runner

use crate::error::{RunnerError, Result};
use crate::job::WorkerIdentity;
use clap::Parser;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub api: ApiConfig,
    pub storage: StorageConfig,
    pub worker: WorkerConfig,
    pub classifier: ClassifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub endpoint: String,
    pub api_key: String,
    pub processor_id: Option<String>,
    pub processor_type: Option<String>,
    /// Send this process's id along with dequeue requests.
    pub send_process_id: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub access_key_id: String,
    pub secret_access_key: String,
    pub region: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Root for staged audio, extracted artifacts and downloaded model files.
    pub scratch_dir: PathBuf,
    pub sleep_secs_on_empty_queue: u64,
    pub runner_count: u32,
    pub shutdown_on_empty_queue: bool,
    pub clip_padding_secs: f64,
    pub shutdown_command: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClassifierConfig {
    /// Directory holding `<version>/model.onnx` and `<version>/labels.txt`.
    pub model_root: PathBuf,
    pub default_version: String,
    pub inference_threads: usize,
    pub sample_rate: u32,
    pub segment_secs: f64,
    pub overlap_secs: f64,
    pub sensitivity: f32,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            endpoint: "http://localhost:8000/api".to_string(),
            api_key: String::new(),
            processor_id: None,
            processor_type: None,
            send_process_id: false,
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            access_key_id: String::new(),
            secret_access_key: String::new(),
            region: "us-west-1".to_string(),
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            scratch_dir: std::env::temp_dir().join("birdnet-runner"),
            sleep_secs_on_empty_queue: 3,
            runner_count: 1,
            shutdown_on_empty_queue: false,
            clip_padding_secs: 0.0,
            shutdown_command: ["sudo", "shutdown", "now", "-h"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for ClassifierConfig {
    fn default() -> Self {
        Self {
            model_root: PathBuf::from("./models"),
            default_version: "2.4".to_string(),
            inference_threads: num_cpus::get(),
            sample_rate: 48000,
            segment_secs: 3.0,
            overlap_secs: 0.0,
            sensitivity: 1.0,
        }
    }
}

impl Config {
    /// Directory the staged source audio is written to
    pub fn audio_dir(&self) -> PathBuf {
        self.worker.scratch_dir.join("audio")
    }

    /// Directory extracted clips are written to
    pub fn clip_dir(&self) -> PathBuf {
        self.worker.scratch_dir.join("clips")
    }

    /// Directory rendered spectrograms are written to
    pub fn spectrogram_dir(&self) -> PathBuf {
        self.worker.scratch_dir.join("spectrograms")
    }

    /// Directory custom model artifacts are cached in
    pub fn model_cache_dir(&self) -> PathBuf {
        self.worker.scratch_dir.join("models")
    }

    /// Identity reported to the queue server
    pub fn identity(&self) -> WorkerIdentity {
        WorkerIdentity {
            processor_id: self.api.processor_id.clone(),
            processor_type: self.api.processor_type.clone(),
            process_id: self.api.send_process_id.then(std::process::id),
        }
    }
}

#[derive(Debug, Clone, Parser)]
#[command(name = "birdnet-runner", about = "Acoustic analysis queue runner", version, author)]
pub struct Args {
    #[arg(
        short = 'c',
        long = "config",
        env = "RUNNER_CONFIG",
        help = "Config file path (TOML format)",
    )]
    pub config_file: Option<PathBuf>,

    #[arg(long = "api-endpoint", env = "API_ENDPOINT", help = "Queue API base URL")]
    pub api_endpoint: Option<String>,

    #[arg(long = "api-key", env = "API_KEY", hide_env_values = true, help = "Queue API key")]
    pub api_key: Option<String>,

    #[arg(long = "processor-id", env = "PROCESSOR_ID", help = "Instance id reported to the server")]
    pub processor_id: Option<String>,

    #[arg(
        long = "processor-type",
        env = "PROCESSOR_TYPE",
        help = "Instance type reported to the server",
    )]
    pub processor_type: Option<String>,

    #[arg(
        long = "instance-metadata",
        help = "Resolve processor id/type from the EC2 metadata service",
    )]
    pub instance_metadata: bool,

    #[arg(
        long = "s3-access-key",
        env = "S3_ACCESS_KEY",
        hide_env_values = true,
        help = "Object storage access key id",
    )]
    pub s3_access_key: Option<String>,

    #[arg(
        long = "s3-secret-key",
        env = "S3_SECRET_KEY",
        hide_env_values = true,
        help = "Object storage secret key",
    )]
    pub s3_secret_key: Option<String>,

    #[arg(long = "s3-region", env = "S3_REGION", help = "Object storage region")]
    pub s3_region: Option<String>,

    #[arg(long = "scratch-dir", env = "SCRATCH_DIR", help = "Local scratch directory")]
    pub scratch_dir: Option<PathBuf>,

    #[arg(
        long = "runner-count",
        env = "RUNNER_COUNT",
        help = "Runners on this host, reported on shutdown",
    )]
    pub runner_count: Option<u32>,

    #[arg(
        long = "sleep-secs",
        env = "SLEEP_AFTER_EMPTY_QUEUE_SECONDS",
        help = "Idle sleep after an empty dequeue",
    )]
    pub sleep_secs: Option<u64>,

    #[arg(
        long = "shutdown-on-empty",
        env = "SHUTDOWN_ON_EMPTY_QUEUE",
        help = "Power off when the server says it is safe",
    )]
    pub shutdown_on_empty: bool,

    #[arg(
        long = "model-root",
        env = "MODEL_ROOT",
        help = "Directory with versioned classifier models",
    )]
    pub model_root: Option<PathBuf>,

    #[arg(long = "inference-threads", help = "ONNX inference thread count")]
    pub inference_threads: Option<usize>,

    #[arg(short = 'v', long = "verbose", help = "Enable verbose output mode")]
    pub verbose: bool,

    #[arg(long = "check-config", help = "Validate configuration and exit")]
    pub check_config: bool,

    #[arg(long = "write-default-config", help = "Write the default configuration to PATH and exit")]
    pub write_default_config: Option<PathBuf>,
}

impl Config {
    /// Create config from command line arguments and config file
    pub fn from_args_and_config(args: &Args) -> Result<Self> {
        let mut config = if let Some(config_path) = &args.config_file {
            Self::from_file(config_path)?
        } else {
            Self::default()
        };

        // Command line arguments (and their environment fallbacks) override the file
        if let Some(endpoint) = &args.api_endpoint {
            config.api.endpoint = endpoint.trim_end_matches('/').to_string();
        }
        if let Some(key) = &args.api_key {
            config.api.api_key = key.clone();
        }
        if args.processor_id.is_some() {
            config.api.processor_id = args.processor_id.clone();
        }
        if args.processor_type.is_some() {
            config.api.processor_type = args.processor_type.clone();
        }
        if let Some(key) = &args.s3_access_key {
            config.storage.access_key_id = key.clone();
        }
        if let Some(secret) = &args.s3_secret_key {
            config.storage.secret_access_key = secret.clone();
        }
        if let Some(region) = &args.s3_region {
            config.storage.region = region.clone();
        }
        if let Some(dir) = &args.scratch_dir {
            config.worker.scratch_dir = dir.clone();
        }
        if let Some(count) = args.runner_count {
            config.worker.runner_count = count;
        }
        if let Some(secs) = args.sleep_secs {
            config.worker.sleep_secs_on_empty_queue = secs;
        }
        if args.shutdown_on_empty {
            config.worker.shutdown_on_empty_queue = true;
        }
        if let Some(root) = &args.model_root {
            config.classifier.model_root = root.clone();
        }
        if let Some(threads) = args.inference_threads {
            config.classifier.inference_threads = threads;
        }

        config.validate()?;

        Ok(config)
    }

    /// Load config from TOML config file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| RunnerError::config(format!("Failed to read config file: {}", e)))?;

        toml::from_str(&content)
            .map_err(|e| RunnerError::config(format!("Failed to parse config file: {}", e)))
    }

    /// Validate configuration parameter validity
    pub fn validate(&self) -> Result<()> {
        if self.api.endpoint.is_empty() {
            return Err(RunnerError::config("API endpoint must be set"));
        }
        if !self.api.endpoint.starts_with("http://") && !self.api.endpoint.starts_with("https://") {
            return Err(RunnerError::config(format!(
                "API endpoint must be an http(s) URL: {}", self.api.endpoint
            )));
        }

        if self.worker.runner_count == 0 {
            return Err(RunnerError::config("Runner count must be greater than 0"));
        }
        if self.worker.clip_padding_secs < 0.0 {
            return Err(RunnerError::config("Clip padding cannot be negative"));
        }
        if self.worker.shutdown_on_empty_queue && self.worker.shutdown_command.is_empty() {
            return Err(RunnerError::config(
                "Shutdown command must be set when shutdown-on-empty is enabled",
            ));
        }

        if self.classifier.sample_rate == 0 {
            return Err(RunnerError::config("Sample rate must be greater than 0"));
        }
        if self.classifier.segment_secs <= 0.0 {
            return Err(RunnerError::config("Segment length must be greater than 0"));
        }
        let overlap = self.classifier.overlap_secs;
        if overlap < 0.0 || overlap >= self.classifier.segment_secs {
            return Err(RunnerError::config("Overlap must be in range [0, segment length)"));
        }
        if self.classifier.sensitivity <= 0.0 || self.classifier.sensitivity > 2.0 {
            return Err(RunnerError::config("Sensitivity must be in range (0.0, 2.0]"));
        }
        if self.classifier.inference_threads == 0 {
            return Err(RunnerError::config("Inference thread count must be greater than 0"));
        }

        Ok(())
    }

    /// Save config to file
    pub fn save_to_file<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)
            .map_err(|e| RunnerError::config(format!("Failed to serialize config: {}", e)))?;

        std::fs::write(path, content)
            .map_err(|e| RunnerError::config(format!("Failed to write config file: {}", e)))
    }

    /// Create default config file
    pub fn create_default_config<P: AsRef<Path>>(path: P) -> Result<()> {
        Self::default().save_to_file(path)
    }
}
