use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use time::UtcOffset;
use tokio::fs;
use tracing::{info, warn};

#[derive(Debug, Serialize, Deserialize, Clone, Default)]
#[serde(default)]
pub struct DashboardConfig {
    pub mqtt: MqttConf,
    pub topics: TopicsConf,
    pub model: ModelConf,
    pub pipeline: PipelineConf,
    pub alerts: AlertThresholds,
    pub http: HttpConf,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct MqttConf {
    pub host: String,
    pub port: u16,
    pub keep_alive_secs: u64,
    pub client_prefix: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct TopicsConf {
    pub data: String,
    pub response: String,
    pub command: String,
    pub prediction: String,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct ModelConf {
    pub model_path: PathBuf,
    pub scaler_path: Option<PathBuf>,
    pub label_encoder_path: Option<PathBuf>,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct PipelineConf {
    pub tick_interval_ms: u64,
    pub stale_after_secs: u64,
    pub reconnect_backoff_secs: u64,
    pub history_capacity: usize,
    pub utc_offset_hours: i8,
}

/// Alert rule thresholds; a rule fires when the value is strictly beyond it.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct AlertThresholds {
    pub aqi_danger: i64,
    pub aqi_warning: i64,
    pub weather_aqi_info: i64,
    pub temperature_high: f64,
    pub humidity_high: f64,
    pub humidity_low: f64,
}

#[derive(Debug, Serialize, Deserialize, Clone)]
#[serde(default)]
pub struct HttpConf {
    pub bind: String,
}

impl Default for MqttConf {
    fn default() -> Self {
        Self {
            host: "broker.emqx.io".into(),
            port: 1883,
            keep_alive_secs: 60,
            client_prefix: "airwatch".into(),
        }
    }
}

impl Default for TopicsConf {
    fn default() -> Self {
        Self {
            data: "projek/asma/data_sensor".into(),
            response: "projek/asma/response".into(),
            command: "projek/asma/command".into(),
            prediction: "projek/asma/prediction".into(),
        }
    }
}

impl Default for ModelConf {
    fn default() -> Self {
        Self {
            model_path: "model.json".into(),
            scaler_path: Some("scaler.json".into()),
            label_encoder_path: Some("label_encoder.json".into()),
        }
    }
}

impl Default for PipelineConf {
    fn default() -> Self {
        Self {
            tick_interval_ms: 2000,
            stale_after_secs: 30,
            reconnect_backoff_secs: 3,
            history_capacity: 100,
            utc_offset_hours: 7,
        }
    }
}

impl Default for AlertThresholds {
    fn default() -> Self {
        Self {
            aqi_danger: 200,
            aqi_warning: 100,
            weather_aqi_info: 100,
            temperature_high: 35.0,
            humidity_high: 80.0,
            humidity_low: 30.0,
        }
    }
}

impl Default for HttpConf {
    fn default() -> Self {
        Self { bind: "0.0.0.0:8080".into() }
    }
}

impl PipelineConf {
    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms.max(1))
    }

    pub fn stale_after(&self) -> Duration {
        Duration::from_secs(self.stale_after_secs)
    }

    pub fn reconnect_backoff(&self) -> Duration {
        Duration::from_secs(self.reconnect_backoff_secs)
    }

    /// Offset of the device's local clock; out-of-range values fall back to UTC.
    pub fn utc_offset(&self) -> UtcOffset {
        UtcOffset::from_hms(self.utc_offset_hours, 0, 0).unwrap_or(UtcOffset::UTC)
    }
}

impl DashboardConfig {
    pub fn from_yaml_str(txt: &str) -> Result<Self, ConfigError> {
        if txt.trim().is_empty() {
            return Ok(Self::default());
        }
        let cfg: Self = serde_yaml::from_str(txt)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub async fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let txt = fs::read_to_string(path).await.map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&txt)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.pipeline.history_capacity == 0 {
            return Err(ConfigError::Invalid("pipeline.history_capacity must be > 0".into()));
        }
        let topics = [&self.topics.data, &self.topics.response, &self.topics.command, &self.topics.prediction];
        if topics.iter().any(|t| t.trim().is_empty()) {
            return Err(ConfigError::Invalid("topic names must not be empty".into()));
        }
        if self.topics.data == self.topics.response {
            return Err(ConfigError::Invalid("data and response topics must differ".into()));
        }
        Ok(())
    }

    /// `AIRWATCH_BROKER_HOST`, `AIRWATCH_BROKER_PORT` and `AIRWATCH_MODEL_PATH`
    /// win over the file.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(host) = std::env::var("AIRWATCH_BROKER_HOST") {
            if !host.trim().is_empty() {
                self.mqtt.host = host;
            }
        }
        if let Ok(port) = std::env::var("AIRWATCH_BROKER_PORT") {
            match port.parse() {
                Ok(p) => self.mqtt.port = p,
                Err(_) => warn!(value = %port, "ignoring invalid AIRWATCH_BROKER_PORT"),
            }
        }
        if let Ok(path) = std::env::var("AIRWATCH_MODEL_PATH") {
            if !path.trim().is_empty() {
                self.model.model_path = path.into();
            }
        }
    }
}

/// Loads `airwatch.yaml` (or `$AIRWATCH_CONFIG`), falling back to defaults.
pub async fn load_config() -> DashboardConfig {
    let path = std::env::var("AIRWATCH_CONFIG").unwrap_or_else(|_| "airwatch.yaml".into());
    let path = PathBuf::from(path);
    let mut cfg = if path.exists() {
        match DashboardConfig::from_file(&path).await {
            Ok(cfg) => {
                info!(path = %path.display(), "config loaded");
                cfg
            }
            Err(e) => {
                warn!(error = %e, "invalid config, using defaults");
                DashboardConfig::default()
            }
        }
    } else {
        warn!(path = %path.display(), "no config file, using defaults");
        DashboardConfig::default()
    };
    cfg.apply_env_overrides();
    cfg
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_device_setup() {
        let cfg = DashboardConfig::default();
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.topics.data, "projek/asma/data_sensor");
        assert_eq!(cfg.pipeline.stale_after(), Duration::from_secs(30));
        assert_eq!(cfg.pipeline.history_capacity, 100);
        assert_eq!(cfg.pipeline.utc_offset().whole_hours(), 7);
    }

    #[test]
    fn test_partial_yaml_keeps_other_defaults() {
        let cfg = DashboardConfig::from_yaml_str(
            "mqtt:\n  host: 10.0.0.5\npipeline:\n  stale_after_secs: 45\n",
        )
        .unwrap();
        assert_eq!(cfg.mqtt.host, "10.0.0.5");
        assert_eq!(cfg.mqtt.port, 1883);
        assert_eq!(cfg.pipeline.stale_after_secs, 45);
        assert_eq!(cfg.pipeline.reconnect_backoff_secs, 3);
        assert_eq!(cfg.topics.command, "projek/asma/command");
    }

    #[test]
    fn test_empty_yaml_is_default() {
        let cfg = DashboardConfig::from_yaml_str("  \n").unwrap();
        assert_eq!(cfg.http.bind, "0.0.0.0:8080");
    }

    #[test]
    fn test_rejects_zero_capacity_and_shared_topics() {
        assert!(DashboardConfig::from_yaml_str("pipeline:\n  history_capacity: 0\n").is_err());
        assert!(DashboardConfig::from_yaml_str(
            "topics:\n  data: a/b\n  response: a/b\n"
        )
        .is_err());
    }

    #[test]
    fn test_bad_offset_falls_back_to_utc() {
        let conf = PipelineConf { utc_offset_hours: 99, ..PipelineConf::default() };
        assert_eq!(conf.utc_offset(), UtcOffset::UTC);
    }
}
