//! Error kinds of the ingestion pipeline.
//!
//! One enum per failure class so callers can tell "no model" from
//! "inference crashed" from "publish failed". None of them is fatal to the
//! process: each is caught at the boundary of the component that owns it.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("cannot read config file {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("invalid YAML config: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("invalid config value: {0}")]
    Invalid(String),
}

/// A single inbound message could not be turned into a reading.
#[derive(Debug, Error)]
pub enum PayloadError {
    #[error("payload is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
    #[error("payload is not a JSON object (got {0})")]
    NotAnObject(&'static str),
}

/// Loading a classifier, scaler or label-decoder artifact failed.
#[derive(Debug, Error)]
pub enum ModelError {
    #[error("model file not found: {path:?}")]
    NotFound { path: PathBuf },
    #[error("cannot read {path:?}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("cannot parse {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("model {path:?} is incompatible: format_version {found}, expected {expected}; re-export it with the current training pipeline")]
    Incompatible {
        path: PathBuf,
        found: u64,
        expected: u64,
    },
    #[error("model {path:?} is invalid: {reason}")]
    Invalid { path: PathBuf, reason: String },
}

impl ModelError {
    /// Short human-readable diagnostic shown next to "predictions unavailable".
    pub fn diagnostic(&self) -> String {
        match self {
            ModelError::NotFound { path } => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| path.display().to_string());
                format!("Model file not found: {name}")
            }
            ModelError::Incompatible { .. } => format!("Model incompatible! {self}"),
            other => format!("Failed to load model: {other}"),
        }
    }
}

/// Raised while classifying one feature vector.
#[derive(Debug, Error, PartialEq)]
pub enum InferenceError {
    #[error("expected {expected} features, got {found}")]
    FeatureCount { expected: usize, found: usize },
    #[error("feature {index} is not a finite number")]
    NonFiniteFeature { index: usize },
    #[error("classifier produced no score")]
    EmptyScores,
    #[error("class {0} has no decoded label")]
    UnknownClass(i64),
    #[error("classifier does not expose class probabilities")]
    ProbabilitiesUnsupported,
}

/// An outbound publish was not handed to the transport.
#[derive(Debug, Error)]
pub enum PublishError {
    #[error("cannot serialize payload: {0}")]
    Serialize(#[from] serde_json::Error),
    #[error("transport rejected publish: {0}")]
    Transport(#[from] rumqttc::ClientError),
    #[error("transport rejected publish: {0}")]
    Rejected(String),
}

/// Subscribing to a topic on the live session failed.
#[derive(Debug, Error)]
pub enum SubscribeError {
    #[error("transport rejected subscribe to {topic}: {reason}")]
    Rejected { topic: String, reason: String },
}
