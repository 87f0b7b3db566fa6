//! Object storage access for source audio, extracted artifacts and results documents.
//!
//! Jobs name their buckets at runtime, so stores are created lazily per bucket and kept for
//! the life of the process. Uploads go through a separate store per bucket that marks every
//! object public-read, since the server hands the resulting URLs straight to browsers.

use std::collections::HashMap;
use std::path::Path;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use log::debug;
use object_store::aws::AmazonS3Builder;
use object_store::memory::InMemory;
use object_store::path::Path as ObjectPath;
use object_store::{BackoffConfig, ClientOptions, ObjectStore, PutPayload, RetryConfig};
use reqwest::header::{HeaderMap, HeaderValue};

use crate::config::StorageConfig;
use crate::error::{RunnerError, Result};

/// Browser-reachable URL of an uploaded object.
pub fn public_url(bucket: &str, key: &str) -> String {
    format!("https://{}.s3.amazonaws.com/{}", bucket, key)
}

#[async_trait]
pub trait ObjectStorage: Send + Sync {
    /// Copy `bucket/key` to `dest`. Nothing is written unless the whole object was read.
    async fn download_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<()>;

    /// Upload a local file as a public object and return its URL.
    async fn upload_file(&self, bucket: &str, key: &str, src: &Path) -> Result<String>;

    /// Upload an in-memory body as a public object and return its URL.
    async fn put_bytes(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<String>;
}

type StoreFactory = Box<dyn Fn(&str, bool) -> Result<Arc<dyn ObjectStore>> + Send + Sync>;

/// [`ObjectStorage`] over `object_store`, one store per (bucket, access mode).
pub struct BucketStores {
    factory: StoreFactory,
    stores: RwLock<HashMap<(String, bool), Arc<dyn ObjectStore>>>,
}

impl BucketStores {
    /// `factory` receives the bucket name and whether uploads must be public-read.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str, bool) -> Result<Arc<dyn ObjectStore>> + Send + Sync + 'static,
    {
        Self {
            factory: Box::new(factory),
            stores: RwLock::new(HashMap::new()),
        }
    }

    /// Amazon S3 with the configured credentials and region.
    pub fn s3(config: &StorageConfig) -> Self {
        let config = config.clone();
        Self::new(move |bucket, public_read| create_s3_store(&config, bucket, public_read))
    }

    /// Process-local buckets, each backed by one [`InMemory`] store for both access modes.
    pub fn in_memory() -> Self {
        let buckets: RwLock<HashMap<String, Arc<dyn ObjectStore>>> = RwLock::new(HashMap::new());
        Self::new(move |bucket, _| {
            let mut buckets = buckets.write().unwrap_or_else(|e| e.into_inner());
            let store = buckets
                .entry(bucket.to_string())
                .or_insert_with(|| Arc::new(InMemory::new()) as Arc<dyn ObjectStore>);
            Ok(Arc::clone(store))
        })
    }

    /// Store for `bucket`, created on first use.
    pub fn store(&self, bucket: &str, public_read: bool) -> Result<Arc<dyn ObjectStore>> {
        let key = (bucket.to_string(), public_read);
        if let Some(store) = self.stores.read().unwrap_or_else(|e| e.into_inner()).get(&key) {
            return Ok(Arc::clone(store));
        }

        let mut stores = self.stores.write().unwrap_or_else(|e| e.into_inner());
        if let Some(store) = stores.get(&key) {
            return Ok(Arc::clone(store));
        }
        debug!("Creating object store for bucket {} (public_read={})", bucket, public_read);
        let store = (self.factory)(bucket, public_read)?;
        stores.insert(key, Arc::clone(&store));
        Ok(store)
    }
}

#[async_trait]
impl ObjectStorage for BucketStores {
    async fn download_to(&self, bucket: &str, key: &str, dest: &Path) -> Result<()> {
        let store = self.store(bucket, false)?;
        let location = object_path(bucket, key)?;

        let body = async { store.get(&location).await?.bytes().await }
            .await
            .map_err(|e| transfer_error(bucket, key, e))?;

        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(dest, &body).await?;
        debug!("Downloaded s3://{}/{} ({} bytes) to {}", bucket, key, body.len(), dest.display());
        Ok(())
    }

    async fn upload_file(&self, bucket: &str, key: &str, src: &Path) -> Result<String> {
        let body = tokio::fs::read(src)
            .await
            .map_err(|e| {
                RunnerError::io(format!("Cannot read {} for upload: {}", src.display(), e))
            })?;
        self.put_bytes(bucket, key, body).await
    }

    async fn put_bytes(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<String> {
        let store = self.store(bucket, true)?;
        let location = object_path(bucket, key)?;
        let size = body.len();
        store
            .put(&location, PutPayload::from(body))
            .await
            .map_err(|e| transfer_error(bucket, key, e))?;
        debug!("Uploaded s3://{}/{} ({} bytes)", bucket, key, size);
        Ok(public_url(bucket, key))
    }
}

/// Keys are used verbatim. `ObjectPath::from` would percent-encode characters like `#` or `[`.
fn object_path(bucket: &str, key: &str) -> Result<ObjectPath> {
    ObjectPath::parse(key)
        .map_err(|e| RunnerError::transfer(bucket, key, format!("invalid object key: {}", e)))
}

fn transfer_error(bucket: &str, key: &str, err: object_store::Error) -> RunnerError {
    let message = match &err {
        object_store::Error::NotFound { .. } => "object not found".to_string(),
        other => other.to_string(),
    };
    RunnerError::transfer(bucket, key, message)
}

fn client_options(public_read: bool) -> ClientOptions {
    let options = ClientOptions::new()
        .with_connect_timeout(Duration::from_secs(10))
        .with_timeout(Duration::from_secs(300))
        .with_pool_idle_timeout(Duration::from_secs(90));

    if public_read {
        let mut headers = HeaderMap::new();
        headers.insert("x-amz-acl", HeaderValue::from_static("public-read"));
        options.with_default_headers(headers)
    } else {
        options
    }
}

fn retry_config() -> RetryConfig {
    RetryConfig {
        max_retries: 3,
        backoff: BackoffConfig {
            init_backoff: Duration::from_millis(200),
            max_backoff: Duration::from_secs(10),
            base: 2.0,
        },
        retry_timeout: Duration::from_secs(120),
    }
}

fn create_s3_store(
    config: &StorageConfig,
    bucket: &str,
    public_read: bool,
) -> Result<Arc<dyn ObjectStore>> {
    let mut builder = AmazonS3Builder::from_env()
        .with_bucket_name(bucket)
        .with_region(&config.region)
        .with_client_options(client_options(public_read))
        .with_retry(retry_config());

    if !config.access_key_id.is_empty() {
        builder = builder
            .with_access_key_id(&config.access_key_id)
            .with_secret_access_key(&config.secret_access_key);
    }

    let store = builder
        .build()
        .map_err(|e| RunnerError::config(format!("Cannot configure S3 bucket {}: {}", bucket, e)))?;
    Ok(Arc::new(store))
}
