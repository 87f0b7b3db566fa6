//! Error Types

use thiserror::Error;

/// Main error type
#[derive(Debug, Error)]
pub enum RunnerError {
    /// Queue, report or shutdown endpoint answered with an unexpected status.
    #[error("Remote could not connect to API endpoint (status {status}).")]
    Protocol { status: u16 },

    /// Object storage download or upload failed.
    #[error("Remote could not transfer s3://{bucket}/{key} (error: {message}).")]
    Transfer { bucket: String, key: String, message: String },

    #[error("Classification error: {message}")]
    Classification { message: String },

    #[error("Config error: {message}")]
    Config { message: String },

    /// The request never produced a status (DNS, connect, TLS, body decode).
    #[error("Network error: {message}")]
    Network { message: String },

    #[error("IO error: {message}")]
    Io { message: String },

    #[error("Serialization error: {message}")]
    Serialization { message: String },
}

impl RunnerError {
    pub fn protocol(status: u16) -> Self { Self::Protocol { status } }
    pub fn classification<S: Into<String>>(msg: S) -> Self {
        Self::Classification { message: msg.into() }
    }
    pub fn config<S: Into<String>>(msg: S) -> Self { Self::Config { message: msg.into() } }
    pub fn network<S: Into<String>>(msg: S) -> Self { Self::Network { message: msg.into() } }
    pub fn io<S: Into<String>>(msg: S) -> Self { Self::Io { message: msg.into() } }
    pub fn serialization<S: Into<String>>(msg: S) -> Self {
        Self::Serialization { message: msg.into() }
    }

    pub fn transfer<B, K, M>(bucket: B, key: K, msg: M) -> Self
    where
        B: Into<String>,
        K: Into<String>,
        M: Into<String>,
    {
        Self::Transfer { bucket: bucket.into(), key: key.into(), message: msg.into() }
    }

    /// Stable short name, logged as `kind=` so faults can be grouped without parsing messages.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Protocol { .. } => "protocol",
            Self::Transfer { .. } => "transfer",
            Self::Classification { .. } => "classification",
            Self::Config { .. } => "config",
            Self::Network { .. } => "network",
            Self::Io { .. } => "io",
            Self::Serialization { .. } => "serialization",
        }
    }

    /// HTTP status carried by a protocol failure.
    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Protocol { status } => Some(*status),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, RunnerError>;

impl From<std::io::Error> for RunnerError {
    fn from(err: std::io::Error) -> Self { Self::io(err.to_string()) }
}

impl From<serde_json::Error> for RunnerError {
    fn from(err: serde_json::Error) -> Self { Self::serialization(err.to_string()) }
}

impl From<reqwest::Error> for RunnerError {
    fn from(err: reqwest::Error) -> Self {
        match err.status() {
            Some(status) => Self::protocol(status.as_u16()),
            None => Self::network(err.to_string()),
        }
    }
}

impl From<tokio::task::JoinError> for RunnerError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::io(format!("Blocking task failed: {}", err))
    }
}

#[cfg(feature = "onnx")]
impl From<onnxruntime::OrtError> for RunnerError {
    fn from(err: onnxruntime::OrtError) -> Self { Self::classification(format!("ORT: {}", err)) }
}
