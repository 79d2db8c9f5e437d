//! Inference Adapter: turns a (temperature, humidity, AQI) triple into a
//! safety classification.
//!
//! The classifier, optional feature scaler and optional label decoder are
//! exported by the training pipeline as JSON artifacts. A missing or
//! incompatible classifier makes the adapter unavailable for the whole
//! session; an error while classifying yields the `Error` label. Nothing
//! here ever fails the ingestion pipeline.

use crate::config::ModelConf;
use crate::error::{InferenceError, ModelError};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize, Serializer};
use std::fmt;
use std::path::Path;
use tracing::{info, warn};

/// Fixed feature order: temperature, humidity, AQI.
pub const FEATURE_COUNT: usize = 3;
pub const ARTIFACT_FORMAT_VERSION: u64 = 1;

pub trait Classifier: Send + Sync {
    fn kind(&self) -> &'static str;

    fn predict(&self, features: &[f64]) -> Result<i64, InferenceError>;

    fn supports_probabilities(&self) -> bool {
        false
    }

    fn predict_proba(&self, _features: &[f64]) -> Result<Vec<f64>, InferenceError> {
        Err(InferenceError::ProbabilitiesUnsupported)
    }

    /// Raw class of each `predict_proba` column; empty means column i is class i.
    fn classes(&self) -> &[i64] {
        &[]
    }
}

pub trait FeatureScaler: Send + Sync {
    fn transform(&self, features: &[f64]) -> Result<Vec<f64>, InferenceError>;
}

pub trait LabelDecoder: Send + Sync {
    fn decode(&self, class: i64) -> Result<String, InferenceError>;
}

// ---------------------------------------------------------------------------
// Artifacts
// ---------------------------------------------------------------------------

/// `(x - mean) / scale`, per feature. A zero scale leaves the centred value as is.
#[derive(Debug, Clone, Deserialize)]
pub struct StandardScaler {
    pub mean: Vec<f64>,
    pub scale: Vec<f64>,
}

impl FeatureScaler for StandardScaler {
    fn transform(&self, features: &[f64]) -> Result<Vec<f64>, InferenceError> {
        check_features(features, self.mean.len())?;
        Ok(features
            .iter()
            .zip(self.mean.iter().zip(&self.scale))
            .map(|(x, (m, s))| if *s == 0.0 { x - m } else { (x - m) / s })
            .collect())
    }
}

/// Class index -> label string.
#[derive(Debug, Clone, Deserialize)]
pub struct LabelEncoder {
    pub classes: Vec<String>,
}

impl LabelDecoder for LabelEncoder {
    fn decode(&self, class: i64) -> Result<String, InferenceError> {
        usize::try_from(class)
            .ok()
            .and_then(|i| self.classes.get(i))
            .cloned()
            .ok_or(InferenceError::UnknownClass(class))
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ModelArtifact {
    Logistic(LogisticModel),
    NearestCentroid(NearestCentroidModel),
}

/// Multinomial logistic regression, softmax probabilities.
#[derive(Debug, Clone, Deserialize)]
pub struct LogisticModel {
    pub weights: Vec<Vec<f64>>,
    pub intercepts: Vec<f64>,
    pub classes: Vec<i64>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NearestCentroidModel {
    pub centroids: Vec<Vec<f64>>,
    pub classes: Vec<i64>,
}

impl LogisticModel {
    fn scores(&self, features: &[f64]) -> Result<Vec<f64>, InferenceError> {
        check_features(features, FEATURE_COUNT)?;
        Ok(self
            .weights
            .iter()
            .zip(&self.intercepts)
            .map(|(row, b)| row.iter().zip(features).map(|(w, x)| w * x).sum::<f64>() + b)
            .collect())
    }
}

impl Classifier for LogisticModel {
    fn kind(&self) -> &'static str {
        "logistic"
    }

    fn predict(&self, features: &[f64]) -> Result<i64, InferenceError> {
        let scores = self.scores(features)?;
        let best = argmax(&scores).ok_or(InferenceError::EmptyScores)?;
        self.classes.get(best).copied().ok_or(InferenceError::EmptyScores)
    }

    fn supports_probabilities(&self) -> bool {
        true
    }

    fn predict_proba(&self, features: &[f64]) -> Result<Vec<f64>, InferenceError> {
        let scores = self.scores(features)?;
        let max = scores.iter().copied().fold(f64::NEG_INFINITY, f64::max);
        if !max.is_finite() {
            return Err(InferenceError::EmptyScores);
        }
        let exp: Vec<f64> = scores.iter().map(|s| (s - max).exp()).collect();
        let total: f64 = exp.iter().sum();
        let proba: Vec<f64> = exp.into_iter().map(|e| e / total).collect();
        if proba.iter().any(|p| !p.is_finite()) {
            return Err(InferenceError::EmptyScores);
        }
        Ok(proba)
    }

    fn classes(&self) -> &[i64] {
        &self.classes
    }
}

impl Classifier for NearestCentroidModel {
    fn kind(&self) -> &'static str {
        "nearest_centroid"
    }

    fn predict(&self, features: &[f64]) -> Result<i64, InferenceError> {
        check_features(features, FEATURE_COUNT)?;
        let neg_dist: Vec<f64> = self
            .centroids
            .iter()
            .map(|c| -c.iter().zip(features).map(|(a, b)| (a - b).powi(2)).sum::<f64>())
            .collect();
        let best = argmax(&neg_dist).ok_or(InferenceError::EmptyScores)?;
        self.classes.get(best).copied().ok_or(InferenceError::EmptyScores)
    }
}

impl ModelArtifact {
    fn validate(&self) -> Result<(), String> {
        let (rows, classes, intercepts) = match self {
            ModelArtifact::Logistic(m) => (&m.weights, &m.classes, Some(&m.intercepts)),
            ModelArtifact::NearestCentroid(m) => (&m.centroids, &m.classes, None),
        };
        if classes.is_empty() {
            return Err("no classes".into());
        }
        if rows.len() != classes.len() {
            return Err(format!("{} rows for {} classes", rows.len(), classes.len()));
        }
        if let Some(b) = intercepts {
            if b.len() != classes.len() {
                return Err(format!("{} intercepts for {} classes", b.len(), classes.len()));
            }
        }
        if let Some(row) = rows.iter().find(|r| r.len() != FEATURE_COUNT) {
            return Err(format!("row has {} features, expected {FEATURE_COUNT}", row.len()));
        }
        Ok(())
    }

    fn into_classifier(self) -> Box<dyn Classifier> {
        match self {
            ModelArtifact::Logistic(m) => Box::new(m),
            ModelArtifact::NearestCentroid(m) => Box::new(m),
        }
    }
}

fn check_features(features: &[f64], expected: usize) -> Result<(), InferenceError> {
    if features.len() != expected {
        return Err(InferenceError::FeatureCount { expected, found: features.len() });
    }
    if let Some(index) = features.iter().position(|f| !f.is_finite()) {
        return Err(InferenceError::NonFiniteFeature { index });
    }
    Ok(())
}

fn argmax(values: &[f64]) -> Option<usize> {
    values
        .iter()
        .enumerate()
        .filter(|(_, v)| !v.is_nan())
        .fold(None, |best: Option<(usize, f64)>, (i, &v)| match best {
            Some((_, bv)) if bv >= v => best,
            _ => Some((i, v)),
        })
        .map(|(i, _)| i)
}

fn read_artifact<T: DeserializeOwned>(path: &Path) -> Result<T, ModelError> {
    let value = read_json(path)?;
    serde_json::from_value(value).map_err(|source| ModelError::Parse { path: path.to_path_buf(), source })
}

fn read_json(path: &Path) -> Result<serde_json::Value, ModelError> {
    if !path.exists() {
        return Err(ModelError::NotFound { path: path.to_path_buf() });
    }
    let txt = std::fs::read_to_string(path).map_err(|source| ModelError::Io { path: path.to_path_buf(), source })?;
    serde_json::from_str(&txt).map_err(|source| ModelError::Parse { path: path.to_path_buf(), source })
}

pub fn load_classifier(path: &Path) -> Result<Box<dyn Classifier>, ModelError> {
    let value = read_json(path)?;
    let found = value.get("format_version").and_then(|v| v.as_u64()).unwrap_or(0);
    if found != ARTIFACT_FORMAT_VERSION {
        return Err(ModelError::Incompatible {
            path: path.to_path_buf(),
            found,
            expected: ARTIFACT_FORMAT_VERSION,
        });
    }
    let artifact: ModelArtifact = serde_json::from_value(value)
        .map_err(|source| ModelError::Parse { path: path.to_path_buf(), source })?;
    artifact
        .validate()
        .map_err(|reason| ModelError::Invalid { path: path.to_path_buf(), reason })?;
    Ok(artifact.into_classifier())
}

pub fn load_scaler(path: &Path) -> Result<StandardScaler, ModelError> {
    let scaler: StandardScaler = read_artifact(path)?;
    if scaler.mean.len() != FEATURE_COUNT || scaler.scale.len() != FEATURE_COUNT {
        return Err(ModelError::Invalid {
            path: path.to_path_buf(),
            reason: format!("scaler must have {FEATURE_COUNT} means and scales"),
        });
    }
    Ok(scaler)
}

pub fn load_label_encoder(path: &Path) -> Result<LabelEncoder, ModelError> {
    read_artifact(path)
}

// ---------------------------------------------------------------------------
// Labels and results
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SafetyLabel {
    Safe,
    Caution,
    Danger,
    Unknown,
    Error,
    /// A decoded label outside the display table, passed through verbatim.
    Other(String),
}

impl SafetyLabel {
    pub fn from_decoded(decoded: &str) -> Self {
        match decoded {
            "AMAN" => Self::Safe,
            "HATI-HATI" => Self::Caution,
            "BAHAYA" => Self::Danger,
            other => Self::Other(other.to_string()),
        }
    }

    pub fn from_ordinal(class: i64) -> Self {
        match class {
            0 => Self::Safe,
            1 => Self::Caution,
            2 => Self::Danger,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &str {
        match self {
            Self::Safe => "Safe",
            Self::Caution => "Caution",
            Self::Danger => "Danger",
            Self::Unknown => "Unknown",
            Self::Error => "Error",
            Self::Other(s) => s,
        }
    }

    /// Status word understood by the device firmware.
    pub fn device_status(&self) -> &str {
        match self {
            Self::Safe => "Aman",
            Self::Caution => "Waspada",
            Self::Danger => "Bahaya",
            other => other.as_str(),
        }
    }
}

impl fmt::Display for SafetyLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for SafetyLabel {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

/// Result of one classification: label, confidence in [0, 100] when the
/// classifier exposes probabilities, plus the raw class and probabilities.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Classification {
    pub label: SafetyLabel,
    pub confidence: Option<f64>,
    pub class: Option<i64>,
    pub probabilities: Vec<f64>,
    /// Label of each `probabilities` entry, same order.
    pub labels: Vec<SafetyLabel>,
}

impl Classification {
    pub fn error() -> Self {
        Self {
            label: SafetyLabel::Error,
            confidence: None,
            class: None,
            probabilities: Vec::new(),
            labels: Vec::new(),
        }
    }

    pub fn is_error(&self) -> bool {
        self.label == SafetyLabel::Error
    }
}

// ---------------------------------------------------------------------------
// Adapter
// ---------------------------------------------------------------------------

pub struct InferenceAdapter {
    classifier: Box<dyn Classifier>,
    scaler: Option<Box<dyn FeatureScaler>>,
    decoder: Option<Box<dyn LabelDecoder>>,
}

impl InferenceAdapter {
    pub fn new(classifier: Box<dyn Classifier>) -> Self {
        Self { classifier, scaler: None, decoder: None }
    }

    pub fn with_scaler(mut self, scaler: Box<dyn FeatureScaler>) -> Self {
        self.scaler = Some(scaler);
        self
    }

    pub fn with_decoder(mut self, decoder: Box<dyn LabelDecoder>) -> Self {
        self.decoder = Some(decoder);
        self
    }

    /// Loads the classifier; scaler and decoder are picked up when their
    /// files exist. A present but broken companion fails the whole load.
    pub fn load(cfg: &ModelConf) -> Result<Self, ModelError> {
        let mut adapter = Self::new(load_classifier(&cfg.model_path)?);
        if let Some(path) = cfg.scaler_path.as_deref().filter(|p| p.exists()) {
            adapter = adapter.with_scaler(Box::new(load_scaler(path)?));
        }
        if let Some(path) = cfg.label_encoder_path.as_deref().filter(|p| p.exists()) {
            adapter = adapter.with_decoder(Box::new(load_label_encoder(path)?));
        }
        Ok(adapter)
    }

    pub fn describe(&self) -> ModelStatus {
        ModelStatus {
            available: true,
            kind: Some(self.classifier.kind().to_string()),
            scaled: self.scaler.is_some(),
            decoded: self.decoder.is_some(),
            probabilities: self.classifier.supports_probabilities(),
            diagnostic: None,
        }
    }

    pub fn try_classify(&self, temperature: f64, humidity: f64, aqi: i64) -> Result<Classification, InferenceError> {
        let raw = [temperature, humidity, aqi as f64];
        check_features(&raw, FEATURE_COUNT)?;
        let features = match &self.scaler {
            Some(scaler) => scaler.transform(&raw)?,
            None => raw.to_vec(),
        };

        let class = self.classifier.predict(&features)?;
        let label = self.label_for(class)?;

        let probabilities = if self.classifier.supports_probabilities() {
            self.classifier.predict_proba(&features)?
        } else {
            Vec::new()
        };
        let classes = self.classifier.classes();
        let labels = (0..probabilities.len())
            .map(|i| self.label_for(classes.get(i).copied().unwrap_or(i as i64)))
            .collect::<Result<Vec<_>, _>>()?;
        let confidence = probabilities
            .iter()
            .copied()
            .fold(None, |best: Option<f64>, p| Some(best.map_or(p, |b| b.max(p))))
            .map(|p| p * 100.0);

        Ok(Classification { label, confidence, class: Some(class), probabilities, labels })
    }

    fn label_for(&self, class: i64) -> Result<SafetyLabel, InferenceError> {
        Ok(match &self.decoder {
            Some(decoder) => SafetyLabel::from_decoded(&decoder.decode(class)?),
            None => SafetyLabel::from_ordinal(class),
        })
    }

    /// Never fails: any inference error becomes the `Error` label.
    pub fn classify(&self, temperature: f64, humidity: f64, aqi: i64) -> Classification {
        match self.try_classify(temperature, humidity, aqi) {
            Ok(c) => c,
            Err(e) => {
                warn!(error = %e, temperature, humidity, aqi, "ML prediction error");
                Classification::error()
            }
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ModelStatus {
    pub available: bool,
    pub kind: Option<String>,
    pub scaled: bool,
    pub decoded: bool,
    pub probabilities: bool,
    pub diagnostic: Option<String>,
}

/// Outcome of the one-time model load at startup.
pub enum ModelAvailability {
    Ready(InferenceAdapter),
    Unavailable { diagnostic: String },
}

impl ModelAvailability {
    pub fn load(cfg: &ModelConf) -> Self {
        match InferenceAdapter::load(cfg) {
            Ok(adapter) => {
                let status = adapter.describe();
                info!(
                    path = %cfg.model_path.display(),
                    kind = status.kind.as_deref().unwrap_or("?"),
                    scaled = status.scaled,
                    decoded = status.decoded,
                    "ML model loaded"
                );
                Self::Ready(adapter)
            }
            Err(e) => {
                let diagnostic = e.diagnostic();
                warn!(error = %e, "ML model unavailable, predictions disabled for this session");
                Self::Unavailable { diagnostic }
            }
        }
    }

    pub fn adapter(&self) -> Option<&InferenceAdapter> {
        match self {
            Self::Ready(adapter) => Some(adapter),
            Self::Unavailable { .. } => None,
        }
    }

    pub fn status(&self) -> ModelStatus {
        match self {
            Self::Ready(adapter) => adapter.describe(),
            Self::Unavailable { diagnostic } => ModelStatus {
                available: false,
                kind: None,
                scaled: false,
                decoded: false,
                probabilities: false,
                diagnostic: Some(diagnostic.clone()),
            },
        }
    }
}

impl From<InferenceAdapter> for ModelAvailability {
    fn from(adapter: InferenceAdapter) -> Self {
        Self::Ready(adapter)
    }
}
