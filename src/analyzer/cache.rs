//! Analyzer cache keyed by configuration fingerprint.
//!
//! Building a classifier loads a model from disk, so instances are kept for the life of the
//! process and shared between jobs that carry an identical analyzer configuration.
//! Construction is serialized per fingerprint: two callers asking for the same fingerprint at
//! once build it a single time, while misses on different fingerprints build independently.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use log::{debug, info};
use tokio::sync::{Mutex, RwLock};

use super::{Analyzer, AnalyzerFactory, AnalyzerSpec, ArtifactFetcher};
use crate::error::{RunnerError, Result};
use crate::job::AnalyzerConfig;

/// A cached classifier and the fingerprint it was built for.
pub struct CacheEntry {
    pub fingerprint: String,
    pub analyzer: Arc<dyn Analyzer>,
}

pub struct AnalyzerCache {
    factory: Arc<dyn AnalyzerFactory>,
    artifacts: Option<ArtifactFetcher>,
    entries: RwLock<HashMap<String, Arc<CacheEntry>>>,
    /// One lock per fingerprint, held while that fingerprint is built
    build_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    init_count: AtomicU64,
}

impl AnalyzerCache {
    pub fn new(factory: Arc<dyn AnalyzerFactory>, artifacts: Option<ArtifactFetcher>) -> Self {
        Self {
            factory,
            artifacts,
            entries: RwLock::new(HashMap::new()),
            build_locks: Mutex::new(HashMap::new()),
            init_count: AtomicU64::new(0),
        }
    }

    /// Return the classifier for `config`, building it on first use.
    pub async fn get_or_create(&self, config: &AnalyzerConfig) -> Result<Arc<CacheEntry>> {
        let fingerprint = config.fingerprint()?;

        if let Some(entry) = self.lookup(&fingerprint).await {
            debug!("Analyzer cache hit: {}", short(&fingerprint));
            return Ok(entry);
        }

        let build_lock = self.build_lock(&fingerprint).await;
        let _guard = build_lock.lock().await;
        if let Some(entry) = self.lookup(&fingerprint).await {
            return Ok(entry);
        }

        let spec = self.resolve_spec(config).await?;
        let factory = Arc::clone(&self.factory);
        let analyzer = tokio::task::spawn_blocking(move || factory.build(&spec)).await??;

        let entry = Arc::new(CacheEntry { fingerprint: fingerprint.clone(), analyzer });
        self.entries.write().await.insert(fingerprint.clone(), Arc::clone(&entry));
        let count = self.init_count.fetch_add(1, Ordering::SeqCst) + 1;

        info!(
            "Initialized analyzer {} (version {}, config {}, {} initializations)",
            short(&fingerprint),
            entry.analyzer.version(),
            config.id,
            count
        );
        Ok(entry)
    }

    async fn lookup(&self, fingerprint: &str) -> Option<Arc<CacheEntry>> {
        self.entries.read().await.get(fingerprint).cloned()
    }

    async fn build_lock(&self, fingerprint: &str) -> Arc<Mutex<()>> {
        let mut locks = self.build_locks.lock().await;
        Arc::clone(locks.entry(fingerprint.to_string()).or_default())
    }

    /// Map the job's configuration onto local paths, fetching custom artifacts if needed.
    async fn resolve_spec(&self, config: &AnalyzerConfig) -> Result<AnalyzerSpec> {
        let settings = &config.config;
        let mut spec = AnalyzerSpec {
            version: settings.version.clone(),
            species_list: settings.species_list.clone(),
            ..AnalyzerSpec::default()
        };

        let custom = [&settings.custom_model_path, &settings.custom_labels_path];
        if custom.iter().all(|p| p.is_none()) {
            return Ok(spec);
        }

        let fetcher = self
            .artifacts
            .as_ref()
            .ok_or_else(|| {
                RunnerError::config("Custom model requested but artifact download is off")
            })?;

        if let Some(path) = &settings.custom_model_path {
            spec.model_path = Some(fetcher.fetch(path).await?);
        }
        if let Some(path) = &settings.custom_labels_path {
            spec.labels_path = Some(fetcher.fetch(path).await?);
        }
        Ok(spec)
    }

    pub async fn len(&self) -> usize {
        self.entries.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Number of classifiers built so far.
    pub fn init_count(&self) -> u64 {
        self.init_count.load(Ordering::SeqCst)
    }
}

fn short(fingerprint: &str) -> &str {
    &fingerprint[..fingerprint.len().min(12)]
}
