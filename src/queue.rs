//! Queue server client: dequeue, results report, shutdown notice.

use std::time::Duration;

use log::{debug, info, warn};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use reqwest::{Client, StatusCode};
use serde::Serialize;
use serde_json::Value;

use crate::config::ApiConfig;
use crate::error::{RunnerError, Result};
use crate::job::{Job, ResultPayload, WorkerIdentity};

/// EC2 instance metadata service.
pub const INSTANCE_METADATA_URL: &str = "http://169.254.169.254/latest/meta-data";

/// TLS certificates are checked for everything but plaintext endpoints.
pub fn verify_tls(endpoint: &str) -> bool {
    !endpoint.starts_with("http://")
}

fn header(name: &'static str, value: &str) -> Result<(HeaderName, HeaderValue)> {
    let value = HeaderValue::from_str(value)
        .map_err(|e| RunnerError::config(format!("Invalid value for header {}: {}", name, e)))?;
    Ok((HeaderName::from_static(name), value))
}

/// Identity headers sent with every request: the API key and processor id, each under
/// both the current and the legacy header name.
pub fn identity_headers(api: &ApiConfig) -> Result<HeaderMap> {
    let mut headers = HeaderMap::new();
    for name in ["bnl_apikey", "apikey"] {
        let (name, value) = header(name, &api.api_key)?;
        headers.insert(name, value);
    }
    if let Some(processor_id) = api.processor_id.as_deref() {
        for name in ["bnl_processor_id", "processor"] {
            let (name, value) = header(name, processor_id)?;
            headers.insert(name, value);
        }
    }
    Ok(headers)
}

/// HTTP client shared by the queue client and the artifact fetcher.
pub fn build_http_client(api: &ApiConfig) -> Result<Client> {
    Client::builder()
        .default_headers(identity_headers(api)?)
        .danger_accept_invalid_certs(!verify_tls(&api.endpoint))
        .connect_timeout(Duration::from_secs(30))
        .build()
        .map_err(|e| RunnerError::config(format!("Failed to create HTTP client: {}", e)))
}

/// What the queue handed back.
#[derive(Debug, Clone, PartialEq)]
pub enum Dequeued {
    Job(Box<Job>),
    Empty,
    /// No work, and the server says this instance may be retired.
    SafeToShutdown,
}

#[derive(Debug, Serialize)]
struct ShutdownNotice<'a> {
    analyzer_instance_id: &'a str,
    number_of_runners: u32,
}

pub struct QueueClient {
    client: Client,
    endpoint: String,
    identity: WorkerIdentity,
}

impl QueueClient {
    pub fn new(client: Client, endpoint: &str, identity: WorkerIdentity) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            identity,
        }
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn identity(&self) -> &WorkerIdentity {
        &self.identity
    }

    /// Ask the server for the next job for this worker.
    pub async fn dequeue(&self) -> Result<Dequeued> {
        let url = format!("{}/queues/audio/", self.endpoint);
        let mut form: Vec<(&str, String)> = Vec::new();
        if let Some(server_id) = self.identity.processor_id.as_deref() {
            form.push(("server_id", server_id.to_string()));
        }
        if let Some(pid) = self.identity.process_id {
            form.push(("process_id", pid.to_string()));
        }

        let response = self.client.post(&url).form(&form).send().await?;
        if response.status() != StatusCode::OK {
            return Err(RunnerError::protocol(response.status().as_u16()));
        }

        let body = response.text().await?;
        parse_dequeue(&body)
    }

    /// Post results for `job_id`. Returns the server's acknowledgment, if it sent one.
    pub async fn report(&self, job_id: i64, payload: &ResultPayload) -> Result<Option<Value>> {
        let url = format!("{}/queues/audio/{}/results/", self.endpoint, job_id);
        let response = self.client.post(&url).json(payload).send().await?;
        if response.status() != StatusCode::CREATED {
            return Err(RunnerError::protocol(response.status().as_u16()));
        }

        let body = response.text().await?;
        parse_ack(&body)
    }

    /// Tell the server this instance is going away. The response is logged only.
    pub async fn notify_shutdown(&self, runner_count: u32) -> Result<u16> {
        let url = format!("{}/shutdown-instance/", self.endpoint);
        let notice = ShutdownNotice {
            analyzer_instance_id: self.identity.instance_id(),
            number_of_runners: runner_count,
        };
        let response = self.client.post(&url).json(&notice).send().await?;
        let status = response.status();
        info!(
            "Shutdown notice for {} answered with status {}",
            notice.analyzer_instance_id, status
        );
        Ok(status.as_u16())
    }
}

fn parse_dequeue(body: &str) -> Result<Dequeued> {
    if body.trim().is_empty() {
        return Ok(Dequeued::Empty);
    }

    let value: Value = serde_json::from_str(body)?;
    if value.get("id").is_some_and(|id| !id.is_null()) {
        let job: Job = serde_json::from_value(value)?;
        debug!("Dequeued job {} ({})", job.id, job.file_path);
        return Ok(Dequeued::Job(Box::new(job)));
    }

    let safe = value.get("safe_to_shutdown").and_then(Value::as_bool).unwrap_or(false);
    Ok(if safe { Dequeued::SafeToShutdown } else { Dequeued::Empty })
}

fn parse_ack(body: &str) -> Result<Option<Value>> {
    if body.trim().is_empty() {
        return Ok(None);
    }
    let value: Value = serde_json::from_str(body)?;
    Ok(match &value {
        Value::Object(map) if map.is_empty() => None,
        Value::Null => None,
        _ => Some(value),
    })
}

/// Instance id and type from the metadata service at `base_url`.
pub async fn fetch_instance_metadata(client: &Client, base_url: &str) -> Result<(String, String)> {
    let base = base_url.trim_end_matches('/');
    let mut values = Vec::with_capacity(2);
    for field in ["instance-id", "instance-type"] {
        let response = client.get(format!("{}/{}", base, field)).send().await?;
        if !response.status().is_success() {
            warn!("Instance metadata {} unavailable (status {})", field, response.status());
            return Err(RunnerError::protocol(response.status().as_u16()));
        }
        values.push(response.text().await?.trim().to_string());
    }
    let instance_type = values.pop().unwrap_or_default();
    let instance_id = values.pop().unwrap_or_default();
    Ok((instance_id, instance_type))
}
