/**
 * COMMAND PUBLISHER - Fire-and-forget outbound messages
 *
 * ROLE: Device commands (`{cmd: ..}` on the command topic) and prediction
 * broadcasts, over a second broker connection owned by this component only.
 *
 * CONTRACT: `true` means "handed to the transport", not "received by the
 * broker". Publish failures are logged and turned into `false`; nothing is
 * ever raised into the Ingestion Loop. A stalled subscriber session cannot
 * delay a publish: the two connections share nothing.
 */

use crate::config::DashboardConfig;
use crate::error::PublishError;
use crate::inference::{Classification, SafetyLabel};
use crate::models::SensorValues;
use crate::mqtt::mqtt_options;
use rumqttc::{AsyncClient, QoS};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tracing::{error, info, warn};

/// Outbound side of a broker connection. Must not block.
pub trait MessagePublisher: Send + Sync {
    fn publish_bytes(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), PublishError>;
}

impl MessagePublisher for AsyncClient {
    fn publish_bytes(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), PublishError> {
        self.try_publish(topic, qos, false, payload)?;
        Ok(())
    }
}

/// Commands understood by the device firmware.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
pub enum DeviceCommand {
    Calibrate,
    SetBaseline { value: i64 },
    SetTempOffset { value: f64 },
    SetHumidOffset { value: f64 },
    GetCalibration,
    ResetCalibration,
    SetCity { city: String },
    GetWeather,
    Buzzer { on: bool },
    GetStatus,
    Restart,
    SetMood { mood: String },
    SetStatus { status: String, confidence: i64 },
}

impl DeviceCommand {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Calibrate => "calibrate",
            Self::SetBaseline { .. } => "set_baseline",
            Self::SetTempOffset { .. } => "set_temp_offset",
            Self::SetHumidOffset { .. } => "set_humid_offset",
            Self::GetCalibration => "get_calibration",
            Self::ResetCalibration => "reset_calibration",
            Self::SetCity { .. } => "set_city",
            Self::GetWeather => "get_weather",
            Self::Buzzer { .. } => "buzzer",
            Self::GetStatus => "get_status",
            Self::Restart => "restart",
            Self::SetMood { .. } => "set_mood",
            Self::SetStatus { .. } => "set_status",
        }
    }

    /// Builds a typed command from a name and loose parameters; `None` when
    /// the name is unknown or a parameter is missing or mistyped.
    pub fn from_parts(name: &str, params: serde_json::Map<String, serde_json::Value>) -> Option<Self> {
        serde_json::from_value(command_body(name, params)).ok()
    }

    /// Status update derived from a classification.
    pub fn status(label: &SafetyLabel, confidence: Option<f64>) -> Self {
        Self::SetStatus {
            status: label.device_status().to_string(),
            confidence: confidence.map_or(0, |c| c as i64),
        }
    }
}

fn command_body(name: &str, params: serde_json::Map<String, serde_json::Value>) -> serde_json::Value {
    let mut body = serde_json::Map::with_capacity(params.len() + 1);
    body.insert("cmd".into(), serde_json::Value::String(name.to_string()));
    for (k, v) in params {
        if k != "cmd" {
            body.insert(k, v);
        }
    }
    serde_json::Value::Object(body)
}

/// Payload of the prediction-broadcast topic.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PredictionBroadcast {
    pub timestamp: String,
    pub sensor_data: BroadcastSensorData,
    pub prediction: BroadcastPrediction,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BroadcastSensorData {
    pub temperature: f64,
    pub humidity: f64,
    pub local_aqi: i64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BroadcastPrediction {
    pub status: String,
    pub class: Option<i64>,
    pub confidence: Option<f64>,
    pub probabilities: BroadcastProbabilities,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct BroadcastProbabilities {
    pub aman: f64,
    pub waspada: f64,
    pub bahaya: f64,
}

impl PredictionBroadcast {
    pub fn new(at: OffsetDateTime, values: SensorValues, result: &Classification) -> Self {
        // columns are looked up by label; unlabelled results fall back to class order
        let pct = |label: SafetyLabel, column: usize| {
            let index = if result.labels.is_empty() {
                Some(column)
            } else {
                result.labels.iter().position(|l| *l == label)
            };
            index
                .and_then(|i| result.probabilities.get(i))
                .map_or(0.0, |p| round2(p * 100.0))
        };
        Self {
            timestamp: at.format(&Rfc3339).unwrap_or_default(),
            sensor_data: BroadcastSensorData {
                temperature: values.temperature,
                humidity: values.humidity,
                local_aqi: values.aqi,
            },
            prediction: BroadcastPrediction {
                status: result.label.device_status().to_uppercase(),
                class: result.class,
                confidence: result.confidence.map(round2),
                probabilities: BroadcastProbabilities {
                    aman: pct(SafetyLabel::Safe, 0),
                    waspada: pct(SafetyLabel::Caution, 1),
                    bahaya: pct(SafetyLabel::Danger, 2),
                },
            },
        }
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}

#[derive(Clone)]
pub struct CommandPublisher {
    sink: Arc<dyn MessagePublisher>,
    command_topic: String,
    prediction_topic: String,
}

impl CommandPublisher {
    pub fn new(sink: Arc<dyn MessagePublisher>, command_topic: impl Into<String>, prediction_topic: impl Into<String>) -> Self {
        Self {
            sink,
            command_topic: command_topic.into(),
            prediction_topic: prediction_topic.into(),
        }
    }

    /// Opens the long-lived publisher connection and spawns its event loop.
    /// Must be called from within the tokio runtime.
    pub fn connect(cfg: &DashboardConfig) -> Self {
        let (client, mut eventloop) = AsyncClient::new(mqtt_options(cfg, "publisher"), 10);
        let backoff = cfg.pipeline.reconnect_backoff();
        tokio::spawn(async move {
            let mut was_connected = false;
            loop {
                match eventloop.poll().await {
                    Ok(rumqttc::Event::Incoming(rumqttc::Incoming::ConnAck(_))) => {
                        if !was_connected {
                            info!("MQTT publisher connected");
                        }
                        was_connected = true;
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!(error = %e, "MQTT publisher connection error");
                        was_connected = false;
                        tokio::time::sleep(backoff.max(Duration::from_secs(1))).await;
                    }
                }
            }
        });
        Self::new(Arc::new(client), cfg.topics.command.clone(), cfg.topics.prediction.clone())
    }

    pub fn try_send(&self, command: &DeviceCommand) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(command)?;
        self.sink.publish_bytes(&self.command_topic, QoS::AtMostOnce, payload)
    }

    pub fn send(&self, command: &DeviceCommand) -> bool {
        match self.try_send(command) {
            Ok(()) => {
                info!(cmd = command.name(), ?command, "command sent");
                true
            }
            Err(e) => {
                warn!(cmd = command.name(), error = %e, "error sending command");
                false
            }
        }
    }

    /// Untyped entry point: publishes `{cmd: name, ..params}` as is.
    pub fn send_command(&self, name: &str, params: serde_json::Map<String, serde_json::Value>) -> bool {
        let body = command_body(name, params);
        let sent = serde_json::to_vec(&body)
            .map_err(PublishError::from)
            .and_then(|payload| self.sink.publish_bytes(&self.command_topic, QoS::AtMostOnce, payload));
        match sent {
            Ok(()) => {
                info!(cmd = name, %body, "command sent");
                true
            }
            Err(e) => {
                warn!(cmd = name, error = %e, "error sending command");
                false
            }
        }
    }

    pub fn send_prediction(&self, label: &SafetyLabel, confidence: Option<f64>) -> bool {
        self.send(&DeviceCommand::status(label, confidence))
    }

    pub fn publish_prediction(&self, broadcast: &PredictionBroadcast) -> bool {
        let sent = serde_json::to_vec(broadcast)
            .map_err(PublishError::from)
            .and_then(|payload| self.sink.publish_bytes(&self.prediction_topic, QoS::AtLeastOnce, payload));
        if let Err(e) = sent {
            warn!(error = %e, "error publishing prediction");
            return false;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::inference::{InferenceAdapter, LabelEncoder, LogisticModel};
    use parking_lot::Mutex;
    use serde_json::json;

    #[derive(Default)]
    struct Recorder {
        sent: Mutex<Vec<(String, QoS, serde_json::Value)>>,
        fail: bool,
    }

    impl MessagePublisher for Recorder {
        fn publish_bytes(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> Result<(), PublishError> {
            if self.fail {
                return Err(PublishError::Rejected("queue full".into()));
            }
            let value = serde_json::from_slice(&payload)?;
            self.sent.lock().push((topic.to_string(), qos, value));
            Ok(())
        }
    }

    fn publisher(fail: bool) -> (CommandPublisher, Arc<Recorder>) {
        let rec = Arc::new(Recorder { fail, ..Recorder::default() });
        (CommandPublisher::new(rec.clone(), "dev/cmd", "dev/pred"), rec)
    }

    #[test]
    fn test_typed_commands_serialize_with_cmd_tag() {
        let (p, rec) = publisher(false);
        assert!(p.send(&DeviceCommand::SetCity { city: "Cilegon".into() }));
        assert!(p.send(&DeviceCommand::Calibrate));
        assert!(p.send(&DeviceCommand::Buzzer { on: true }));
        let sent = rec.sent.lock();
        assert_eq!(sent[0].2, json!({"cmd": "set_city", "city": "Cilegon"}));
        assert_eq!(sent[1].2, json!({"cmd": "calibrate"}));
        assert_eq!(sent[2].2, json!({"cmd": "buzzer", "on": true}));
        assert!(sent.iter().all(|(topic, _, _)| topic == "dev/cmd"));
    }

    #[test]
    fn test_send_command_merges_extra_fields() {
        let (p, rec) = publisher(false);
        let params = json!({"value": 512, "cmd": "ignored"}).as_object().cloned().unwrap();
        assert!(p.send_command("set_baseline", params));
        assert_eq!(rec.sent.lock()[0].2, json!({"cmd": "set_baseline", "value": 512}));
    }

    #[test]
    fn test_prediction_status_payload() {
        let (p, rec) = publisher(false);
        assert!(p.send_prediction(&SafetyLabel::Caution, Some(87.9)));
        assert!(p.send_prediction(&SafetyLabel::Safe, None));
        let sent = rec.sent.lock();
        assert_eq!(sent[0].2, json!({"cmd": "set_status", "status": "Waspada", "confidence": 87}));
        assert_eq!(sent[1].2, json!({"cmd": "set_status", "status": "Aman", "confidence": 0}));
    }

    #[test]
    fn test_failures_become_false() {
        let (p, rec) = publisher(true);
        assert!(!p.send(&DeviceCommand::Restart));
        assert!(!p.send_command("get_status", serde_json::Map::new()));
        assert!(!p.send_prediction(&SafetyLabel::Danger, Some(99.0)));
        assert!(rec.sent.lock().is_empty());
    }

    #[test]
    fn test_from_parts_validates_known_commands() {
        let params = |v: serde_json::Value| v.as_object().cloned().unwrap();
        assert_eq!(
            DeviceCommand::from_parts("set_mood", params(json!({"mood": "happy"}))),
            Some(DeviceCommand::SetMood { mood: "happy".into() })
        );
        assert_eq!(DeviceCommand::from_parts("get_weather", params(json!({}))), Some(DeviceCommand::GetWeather));
        assert_eq!(DeviceCommand::from_parts("self_destruct", params(json!({}))), None);
        assert_eq!(DeviceCommand::from_parts("set_city", params(json!({}))), None);
    }

    #[test]
    fn test_broadcast_shape() {
        let (p, rec) = publisher(false);
        let result = Classification {
            label: SafetyLabel::Danger,
            confidence: Some(91.23456),
            class: Some(2),
            probabilities: vec![0.05, 0.0376544, 0.9123456],
            labels: Vec::new(),
        };
        let at = time::macros::datetime!(2025-03-01 10:15:00 +7);
        let values = SensorValues { temperature: 36.0, humidity: 85.0, aqi: 250 };
        assert!(p.publish_prediction(&PredictionBroadcast::new(at, values, &result)));

        let sent = rec.sent.lock();
        let (topic, qos, body) = &sent[0];
        assert_eq!(topic, "dev/pred");
        assert_eq!(*qos, QoS::AtLeastOnce);
        assert_eq!(body["timestamp"], "2025-03-01T10:15:00+07:00");
        assert_eq!(body["sensor_data"], json!({"temperature": 36.0, "humidity": 85.0, "local_aqi": 250}));
        assert_eq!(body["prediction"]["status"], "BAHAYA");
        assert_eq!(body["prediction"]["class"], 2);
        assert_eq!(body["prediction"]["confidence"], 91.23);
        assert_eq!(body["prediction"]["probabilities"], json!({"aman": 5.0, "waspada": 3.77, "bahaya": 91.23}));
    }

    #[test]
    fn test_broadcast_probabilities_follow_decoded_labels() {
        // alphabetical encoder: column 1 is BAHAYA, column 2 is HATI-HATI
        let model = LogisticModel {
            weights: vec![vec![0.0, 0.0, -0.05], vec![0.0, 0.0, 0.05], vec![0.0, 0.0, 0.0]],
            intercepts: vec![0.0, -5.0, 2.0],
            classes: vec![0, 1, 2],
        };
        let encoder = LabelEncoder { classes: vec!["AMAN".into(), "BAHAYA".into(), "HATI-HATI".into()] };
        let adapter = InferenceAdapter::new(Box::new(model)).with_decoder(Box::new(encoder));

        let result = adapter.classify(36.0, 85.0, 300);
        assert_eq!(result.label, SafetyLabel::Danger);
        assert_eq!(result.labels, vec![SafetyLabel::Safe, SafetyLabel::Danger, SafetyLabel::Caution]);

        let at = time::macros::datetime!(2025-03-01 10:15:00 +7);
        let values = SensorValues { temperature: 36.0, humidity: 85.0, aqi: 300 };
        let probs = PredictionBroadcast::new(at, values, &result).prediction.probabilities;
        assert!(probs.bahaya > probs.waspada);
        assert!(probs.bahaya > probs.aman);
        assert_eq!(Some(probs.bahaya), result.confidence.map(round2));

        // the middle band decodes to HATI-HATI and lands in `waspada`
        let result = adapter.classify(25.0, 50.0, 60);
        assert_eq!(result.label, SafetyLabel::Caution);
        let probs = PredictionBroadcast::new(at, values, &result).prediction.probabilities;
        assert!(probs.waspada > probs.bahaya);
        assert!(probs.waspada > probs.aman);
    }
}
