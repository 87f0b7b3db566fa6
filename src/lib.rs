//! birdnet-runner - acoustic analysis queue worker
//!
//! Pulls audio jobs from the queue server, classifies them, publishes clips, spectrograms
//! and results documents to object storage and reports detections back.

pub mod analyzer;
pub mod audio;
pub mod config;
pub mod error;
pub mod extract;
pub mod job;
pub mod pipeline;
pub mod queue;
pub mod stager;
pub mod storage;
pub mod worker;

pub use config::{Args, Config};
pub use error::{Result, RunnerError};
pub use pipeline::{JobOutcome, Pipeline, PipelineFault, Stage};
pub use worker::Worker;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
pub const DESCRIPTION: &str = env!("CARGO_PKG_DESCRIPTION");

/// Initialise `env_logger`. `RUST_LOG` wins; otherwise `info`, or `debug` when verbose.
pub fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .format_timestamp_millis()
        .try_init()
        .ok();
}

pub fn get_library_info() -> LibraryInfo {
    LibraryInfo {
        name: NAME.to_string(),
        version: VERSION.to_string(),
        description: DESCRIPTION.to_string(),
        classifier: if cfg!(feature = "onnx") { "onnx" } else { "none" },
    }
}

#[derive(Debug, Clone)]
pub struct LibraryInfo {
    pub name: String,
    pub version: String,
    pub description: String,
    /// Classifier backend compiled in.
    pub classifier: &'static str,
}

impl std::fmt::Display for LibraryInfo {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} v{} - {} (classifier: {})",
            self.name, self.version, self.description, self.classifier
        )
    }
}
