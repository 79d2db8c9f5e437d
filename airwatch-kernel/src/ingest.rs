/**
 * INGESTION LOOP - Per-tick reconciliation of queued messages
 *
 * ROLE: Sole owner of the dashboard state (history, current reading,
 * prediction, alerts, last device response). Each tick drains both channels
 * completely, runs inference and alerting per reading, forwards predictions
 * through the Command Publisher and applies the staleness rule.
 *
 * LIVENESS: data received this tick marks the link connected; a last
 * update older than `stale_after` marks it disconnected, whatever the
 * transport says. Without either, the flag is left untouched.
 *
 * Ticks are serialized by the caller (`&mut self`), never concurrent.
 */

use crate::alerts::{evaluate_with, Alert};
use crate::config::{AlertThresholds, DashboardConfig};
use crate::health::ConnectionStatus;
use crate::history::{HistorySnapshot, HistoryWindow};
use crate::inference::{Classification, ModelAvailability, ModelStatus};
use crate::models::{DeviceResponse, InboundMessage, Reading, ReadingCategories, SensorPayload};
use crate::mqtt::MessageReceiver;
use crate::publisher::{CommandPublisher, PredictionBroadcast};
use crate::state::Shared;
use serde::Serialize;
use std::time::{Duration, Instant};
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio::sync::mpsc::error::TryRecvError;
use tracing::{debug, info, warn};

/// Latest classification with the time of the reading it was made for.
#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct PredictionRecord {
    pub at: String,
    #[serde(flatten)]
    pub result: Classification,
}

/// What one tick did; handy for logs and tests.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    pub readings: usize,
    pub dropped: usize,
    pub predictions: usize,
    pub commands_failed: usize,
    pub responses: usize,
    pub connected: bool,
}

/// Immutable copy of the loop state, published after every tick.
#[derive(Debug, Clone, Serialize)]
pub struct DashboardSnapshot {
    pub connected: bool,
    pub last_update: Option<String>,
    pub reading: Option<Reading>,
    pub categories: Option<ReadingCategories>,
    pub prediction: Option<PredictionRecord>,
    pub alerts: Vec<Alert>,
    pub last_response: Option<DeviceResponse>,
    pub model: ModelStatus,
    pub history_len: usize,
    #[serde(skip)]
    pub history: HistorySnapshot,
}

pub struct IngestionLoop {
    data_rx: MessageReceiver,
    response_rx: MessageReceiver,
    model: ModelAvailability,
    publisher: CommandPublisher,
    status: ConnectionStatus,
    history: HistoryWindow,
    current: Option<Reading>,
    prediction: Option<PredictionRecord>,
    alerts: Vec<Alert>,
    last_update: Option<(Instant, OffsetDateTime)>,
    last_response: Option<DeviceResponse>,
    stale_after: Duration,
    thresholds: AlertThresholds,
}

impl IngestionLoop {
    pub fn new(
        data_rx: MessageReceiver,
        response_rx: MessageReceiver,
        model: ModelAvailability,
        publisher: CommandPublisher,
        status: ConnectionStatus,
        cfg: &DashboardConfig,
    ) -> Self {
        Self {
            data_rx,
            response_rx,
            model,
            publisher,
            status,
            history: HistoryWindow::new(cfg.pipeline.history_capacity),
            current: None,
            prediction: None,
            alerts: Vec::new(),
            last_update: None,
            last_response: None,
            stale_after: cfg.pipeline.stale_after(),
            thresholds: cfg.alerts.clone(),
        }
    }

    pub fn tick(&mut self) -> TickReport {
        self.tick_at(Instant::now())
    }

    /// One reconciliation pass, with `now` as the reference for staleness.
    pub fn tick_at(&mut self, now: Instant) -> TickReport {
        let mut report = TickReport::default();

        loop {
            match self.data_rx.try_recv() {
                Ok(msg) => self.ingest(msg, &mut report),
                Err(TryRecvError::Empty) | Err(TryRecvError::Disconnected) => break,
            }
        }

        self.apply_staleness(now, report.readings > 0);

        let mut latest = None;
        while let Ok(msg) = self.response_rx.try_recv() {
            report.responses += 1;
            latest = Some(msg);
        }
        if let Some(msg) = latest {
            self.last_response = Some(DeviceResponse {
                received_at: format_time(msg.received_at),
                payload: msg.payload,
            });
        }

        report.connected = self.status.is_connected();
        if report.readings > 0 || report.dropped > 0 {
            debug!(?report, "tick");
        }
        report
    }

    fn ingest(&mut self, msg: InboundMessage, report: &mut TickReport) {
        let payload = match SensorPayload::from_value(&msg.payload) {
            Ok(p) => p,
            Err(e) => {
                warn!(error = %e, "dropping sensor payload");
                self.status.record_dropped();
                report.dropped += 1;
                return;
            }
        };

        let reading = Reading::from_payload(&payload);
        let values = reading.values();
        let categories = reading.categories();
        info!(
            temperature = values.temperature,
            humidity = values.humidity,
            aqi = values.aqi,
            aqi_category = %reading.aqi_category,
            rssi = reading.rssi,
            ?categories,
            "sensor reading"
        );

        self.history.push(msg.received_at, values);

        if let Some(adapter) = self.model.adapter() {
            let result = adapter.classify(values.temperature, values.humidity, values.aqi);
            if !result.is_error() {
                info!(label = %result.label, confidence = ?result.confidence, "prediction");
                if !self.publisher.send_prediction(&result.label, result.confidence) {
                    report.commands_failed += 1;
                }
                let broadcast = PredictionBroadcast::new(msg.received_at, values, &result);
                if !self.publisher.publish_prediction(&broadcast) {
                    report.commands_failed += 1;
                }
            }
            self.prediction = Some(PredictionRecord { at: format_time(msg.received_at), result });
            report.predictions += 1;
        }

        self.alerts = evaluate_with(&reading, &self.thresholds);
        self.current = Some(reading);
        self.last_update = Some((msg.received, msg.received_at));
        self.status.mark_connected();
        report.readings += 1;
    }

    fn apply_staleness(&mut self, now: Instant, received: bool) {
        let stale = self
            .last_update
            .map(|(at, _)| now.saturating_duration_since(at) > self.stale_after)
            .unwrap_or(false);
        if stale {
            if self.status.is_connected() {
                warn!(stale_after = ?self.stale_after, "no sensor data, marking link disconnected");
            }
            self.status.mark_disconnected();
        } else if received {
            self.status.mark_connected();
        }
    }

    pub fn snapshot(&self) -> DashboardSnapshot {
        DashboardSnapshot {
            connected: self.status.is_connected(),
            last_update: self.last_update.map(|(_, at)| format_time(at)),
            reading: self.current.clone(),
            categories: self.current.as_ref().map(Reading::categories),
            prediction: self.prediction.clone(),
            alerts: self.alerts.clone(),
            last_response: self.last_response.clone(),
            model: self.model.status(),
            history_len: self.history.len(),
            history: self.history.snapshot(None),
        }
    }

    pub fn history(&self) -> &HistoryWindow {
        &self.history
    }

    pub fn current(&self) -> Option<&Reading> {
        self.current.as_ref()
    }

    pub fn prediction(&self) -> Option<&PredictionRecord> {
        self.prediction.as_ref()
    }

    pub fn alerts(&self) -> &[Alert] {
        &self.alerts
    }

    pub fn last_response(&self) -> Option<&DeviceResponse> {
        self.last_response.as_ref()
    }

    /// Ticks forever on `interval`, publishing a snapshot after each pass.
    pub async fn run(mut self, interval: Duration, out: Shared<DashboardSnapshot>) {
        let mut ticker = tokio::time::interval(interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            self.tick();
            *out.lock() = self.snapshot();
        }
    }
}

fn format_time(at: OffsetDateTime) -> String {
    at.format(&Rfc3339).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::PublishError;
    use crate::error::InferenceError;
    use crate::inference::{Classifier, InferenceAdapter, LogisticModel, SafetyLabel};
    use crate::mqtt::{message_channel, MessageSender};
    use crate::publisher::MessagePublisher;
    use parking_lot::Mutex;
    use rumqttc::QoS;
    use serde_json::json;
    use std::sync::Arc;
    use time::macros::datetime;

    #[derive(Default)]
    struct Outbox {
        sent: Mutex<Vec<(String, serde_json::Value)>>,
    }

    impl MessagePublisher for Outbox {
        fn publish_bytes(&self, topic: &str, _qos: QoS, payload: Vec<u8>) -> Result<(), PublishError> {
            self.sent.lock().push((topic.to_string(), serde_json::from_slice(&payload)?));
            Ok(())
        }
    }

    struct Fixture {
        data_tx: MessageSender,
        response_tx: MessageSender,
        outbox: Arc<Outbox>,
        status: ConnectionStatus,
        ingest: IngestionLoop,
    }

    fn model() -> ModelAvailability {
        // low AQI favours class 0, high AQI class 2
        let logistic = LogisticModel {
            weights: vec![vec![0.0, 0.0, -0.1], vec![0.0, 0.0, 0.0], vec![0.0, 0.0, 0.1]],
            intercepts: vec![5.0, 0.0, -15.0],
            classes: vec![0, 1, 2],
        };
        InferenceAdapter::new(Box::new(logistic)).into()
    }

    fn fixture(model: ModelAvailability) -> Fixture {
        let (data_tx, data_rx) = message_channel();
        let (response_tx, response_rx) = message_channel();
        let outbox = Arc::new(Outbox::default());
        let publisher = CommandPublisher::new(outbox.clone(), "cmd", "pred");
        let status = ConnectionStatus::new();
        let ingest = IngestionLoop::new(
            data_rx,
            response_rx,
            model,
            publisher,
            status.clone(),
            &DashboardConfig::default(),
        );
        Fixture { data_tx, response_tx, outbox, status, ingest }
    }

    fn message(at: Instant, payload: serde_json::Value) -> InboundMessage {
        InboundMessage { received_at: datetime!(2025-03-01 10:00 +7), received: at, payload }
    }

    #[test]
    fn test_sensor_message_flows_through_one_tick() {
        let mut f = fixture(model());
        let t0 = Instant::now();
        f.data_tx
            .send(message(t0, json!({"suhu": 28.5, "lembab": 60, "local_aqi": 45, "rssi": -55})))
            .unwrap();

        let report = f.ingest.tick_at(t0);
        assert_eq!(report.readings, 1);
        assert_eq!(report.predictions, 1);
        assert!(report.connected);

        let reading = f.ingest.current().unwrap();
        assert_eq!(reading.temperature, 28.5);
        assert_eq!(reading.humidity, 60.0);
        assert_eq!(reading.aqi, 45);
        assert_eq!(f.ingest.history().len(), 1);
        assert_eq!(f.ingest.prediction().unwrap().result.label, SafetyLabel::Safe);

        let sent = f.outbox.sent.lock();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0].0, "cmd");
        assert_eq!(sent[0].1["cmd"], "set_status");
        assert_eq!(sent[0].1["status"], "Aman");
        assert_eq!(sent[1].0, "pred");
        assert_eq!(sent[1].1["prediction"]["status"], "AMAN");
    }

    struct BrokenClassifier;

    impl Classifier for BrokenClassifier {
        fn kind(&self) -> &'static str {
            "broken"
        }
        fn predict(&self, _features: &[f64]) -> Result<i64, InferenceError> {
            Err(InferenceError::EmptyScores)
        }
    }

    #[test]
    fn test_error_label_is_stored_but_not_published() {
        let mut f = fixture(InferenceAdapter::new(Box::new(BrokenClassifier)).into());
        let t0 = Instant::now();
        f.data_tx.send(message(t0, json!({"suhu": 29.0, "lembab": 70, "local_aqi": 120}))).unwrap();

        let report = f.ingest.tick_at(t0);
        assert_eq!(report.readings, 1);
        assert_eq!(report.predictions, 1);
        assert_eq!(report.commands_failed, 0);

        let prediction = f.ingest.prediction().unwrap();
        assert_eq!(prediction.result.label, SafetyLabel::Error);
        assert_eq!(prediction.result.confidence, None);
        assert!(f.outbox.sent.lock().is_empty());

        // the rest of the pipeline is unaffected
        assert_eq!(f.ingest.history().len(), 1);
        assert_eq!(f.ingest.alerts().len(), 1);
        assert!(report.connected);
    }

    #[test]
    fn test_drains_everything_in_arrival_order() {
        let mut f = fixture(ModelAvailability::Unavailable { diagnostic: "Model file not found: model.json".into() });
        let t0 = Instant::now();
        for aqi in [10, 20, 30] {
            f.data_tx.send(message(t0, json!({"local_aqi": aqi}))).unwrap();
        }
        let report = f.ingest.tick_at(t0);
        assert_eq!(report.readings, 3);
        assert_eq!(report.predictions, 0);
        assert_eq!(f.ingest.history().snapshot(None).aqi, vec![10, 20, 30]);
        assert_eq!(f.ingest.current().unwrap().aqi, 30);
        assert!(f.ingest.prediction().is_none());
        assert!(f.outbox.sent.lock().is_empty());

        let snap = f.ingest.snapshot();
        assert!(!snap.model.available);
        assert_eq!(snap.model.diagnostic.as_deref(), Some("Model file not found: model.json"));
    }

    #[test]
    fn test_staleness_window() {
        let mut f = fixture(model());
        let t = Instant::now();
        f.data_tx.send(message(t, json!({"local_aqi": 40}))).unwrap();
        assert!(f.ingest.tick_at(t).connected);

        // T+29, no new data: unchanged
        assert!(f.ingest.tick_at(t + Duration::from_secs(29)).connected);
        f.status.mark_disconnected();
        assert!(!f.ingest.tick_at(t + Duration::from_secs(29)).connected);
        f.status.mark_connected();

        // T+31: stale even though the transport claims connected
        assert!(!f.ingest.tick_at(t + Duration::from_secs(31)).connected);

        // new data at any later time revives it
        let later = t + Duration::from_secs(600);
        f.data_tx.send(message(later, json!({"local_aqi": 41}))).unwrap();
        assert!(f.ingest.tick_at(later).connected);
    }

    #[test]
    fn test_no_data_ever_leaves_flag_alone() {
        let mut f = fixture(model());
        f.status.mark_connected();
        assert!(f.ingest.tick_at(Instant::now() + Duration::from_secs(3600)).connected);
    }

    #[test]
    fn test_non_object_payload_is_dropped() {
        let mut f = fixture(model());
        let t0 = Instant::now();
        f.data_tx.send(message(t0, json!([1, 2, 3]))).unwrap();
        f.data_tx.send(message(t0, json!({"suhu": 30.0}))).unwrap();
        let report = f.ingest.tick_at(t0);
        assert_eq!(report.dropped, 1);
        assert_eq!(report.readings, 1);
        assert_eq!(f.status.dropped(), 1);
        assert_eq!(f.ingest.history().len(), 1);
    }

    #[test]
    fn test_only_latest_device_response_is_kept() {
        let mut f = fixture(model());
        let t0 = Instant::now();
        f.response_tx.send(message(t0, json!({"status": "calibrating"}))).unwrap();
        f.response_tx.send(message(t0, json!({"status": "calibrated", "baseline": 812}))).unwrap();
        let report = f.ingest.tick_at(t0);
        assert_eq!(report.responses, 2);
        assert_eq!(f.ingest.last_response().unwrap().payload["status"], "calibrated");

        f.ingest.tick_at(t0);
        assert_eq!(f.ingest.last_response().unwrap().payload["baseline"], 812);
    }

    #[test]
    fn test_alerts_are_replaced_not_accumulated() {
        let mut f = fixture(model());
        let t0 = Instant::now();
        f.data_tx.send(message(t0, json!({"local_aqi": 250, "suhu": 36, "lembab": 85}))).unwrap();
        f.ingest.tick_at(t0);
        assert_eq!(f.ingest.alerts().len(), 3);

        f.data_tx.send(message(t0, json!({"local_aqi": 40, "suhu": 22, "lembab": 50}))).unwrap();
        f.ingest.tick_at(t0);
        assert!(f.ingest.alerts().is_empty());

        // an empty tick keeps the last set
        f.data_tx.send(message(t0, json!({"local_aqi": 150, "suhu": 22, "lembab": 50}))).unwrap();
        f.ingest.tick_at(t0);
        f.ingest.tick_at(t0);
        assert_eq!(f.ingest.alerts().len(), 1);
    }

    #[test]
    fn test_legacy_payload_shape_is_accepted() {
        let mut f = fixture(model());
        let t0 = Instant::now();
        f.data_tx
            .send(message(t0, json!({"environment": {"temp": 27.0, "humid": 65.0}, "local_aqi": 50})))
            .unwrap();
        f.ingest.tick_at(t0);
        let snap = f.ingest.snapshot();
        let reading = snap.reading.unwrap();
        assert_eq!((reading.temperature, reading.humidity), (27.0, 65.0));
        assert_eq!(snap.history.temperature, vec![27.0]);
        assert_eq!(snap.last_update.as_deref(), Some("2025-03-01T10:00:00+07:00"));
    }
}
