//! Download of custom model and label files named by an analyzer configuration

use std::path::PathBuf;

use log::{debug, info};
use reqwest::{Client, Url};

use crate::error::{RunnerError, Result};

/// Scheme, host and port of the API endpoint, e.g. `https://api.example.org`.
pub fn api_origin(endpoint: &str) -> Result<String> {
    let url = Url::parse(endpoint)
        .map_err(|e| RunnerError::config(format!("Invalid API endpoint {}: {}", endpoint, e)))?;
    Ok(url.origin().ascii_serialization())
}

/// Fetches server-hosted artifacts into a local cache directory, once per filename.
#[derive(Debug, Clone)]
pub struct ArtifactFetcher {
    client: Client,
    origin: String,
    dir: PathBuf,
}

impl ArtifactFetcher {
    pub fn new(client: Client, api_endpoint: &str, dir: impl Into<PathBuf>) -> Result<Self> {
        Ok(Self {
            client,
            origin: api_origin(api_endpoint)?,
            dir: dir.into(),
        })
    }

    /// Resolve `server_path` against the API origin.
    ///
    /// Requests carry the API credentials, so absolute URLs must share the API's origin.
    pub fn url_for(&self, server_path: &str) -> Result<String> {
        if server_path.starts_with("http://") || server_path.starts_with("https://") {
            let origin = api_origin(server_path)?;
            if origin != self.origin {
                return Err(RunnerError::config(format!(
                    "Artifact {} is not hosted on the API origin {}",
                    server_path, self.origin
                )));
            }
            return Ok(server_path.to_string());
        }
        Ok(format!("{}/{}", self.origin, server_path.trim_start_matches('/')))
    }

    pub fn local_path(&self, server_path: &str) -> Result<PathBuf> {
        let name = server_path
            .split(['?', '#'])
            .next()
            .and_then(|p| p.rsplit('/').next())
            .filter(|n| !n.is_empty() && *n != "." && *n != "..")
            .ok_or_else(|| {
                RunnerError::config(format!("Artifact path has no filename: {}", server_path))
            })?;
        Ok(self.dir.join(name))
    }

    /// Download `server_path` unless a local copy already exists.
    ///
    /// The body lands in a `.part` file first, so an interrupted download never leaves a
    /// file that a later job would mistake for a complete artifact.
    pub async fn fetch(&self, server_path: &str) -> Result<PathBuf> {
        let url = self.url_for(server_path)?;
        let local = self.local_path(server_path)?;
        if local.exists() {
            debug!("Artifact cached: {}", local.display());
            return Ok(local);
        }

        info!("Downloading artifact {}", url);

        let response = self.client.get(&url).send().await?;
        let status = response.status();
        if !status.is_success() {
            return Err(RunnerError::protocol(status.as_u16()));
        }
        let body = response.bytes().await?;

        tokio::fs::create_dir_all(&self.dir).await?;
        let mut partial = local.clone().into_os_string();
        partial.push(".part");
        let partial = PathBuf::from(partial);

        tokio::fs::write(&partial, &body).await?;
        tokio::fs::rename(&partial, &local).await?;

        debug!("Artifact stored: {} ({} bytes)", local.display(), body.len());
        Ok(local)
    }
}
