/*!
Test harness for the AirWatch pipeline

Wires a real `IngestionLoop` and `ConnectionManager` to a `MockMqttClient`:
- broker events go through the Connection Manager, as in production
- ticks are driven by hand, with an explicit clock for staleness checks
- outbound commands and predictions are read back from the mock
*/

use crate::mqtt_stub::MockMqttClient;
use airwatch_kernel::config::DashboardConfig;
use airwatch_kernel::health::ConnectionStatus;
use airwatch_kernel::inference::ModelAvailability;
use airwatch_kernel::ingest::{IngestionLoop, TickReport};
use airwatch_kernel::mqtt::{message_channel, ConnectionManager, MessageSender, Step, SubscriptionTopics};
use airwatch_kernel::publisher::CommandPublisher;
use airwatch_kernel::InboundMessage;
use anyhow::Result;
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};
use time::OffsetDateTime;

pub struct TestHarness {
    pub mqtt_client: MockMqttClient,
    pub config: DashboardConfig,
    pub status: ConnectionStatus,
    pub manager: ConnectionManager<MockMqttClient>,
    pub ingest: IngestionLoop,
    data_tx: MessageSender,
    response_tx: MessageSender,
    clock: Instant,
}

impl TestHarness {
    /// Harness with default config and no model.
    pub fn new() -> Self {
        Self::with_model(ModelAvailability::Unavailable { diagnostic: "Model file not found: model.json".into() })
    }

    pub fn with_model(model: ModelAvailability) -> Self {
        Self::with_config(DashboardConfig::default(), model)
    }

    pub fn with_config(config: DashboardConfig, model: ModelAvailability) -> Self {
        env_logger::try_init().ok();

        let mqtt_client = MockMqttClient::new();
        let status = ConnectionStatus::new();
        let (data_tx, data_rx) = message_channel();
        let (response_tx, response_rx) = message_channel();

        let manager = ConnectionManager::new(
            mqtt_client.clone(),
            SubscriptionTopics { data: config.topics.data.clone(), response: config.topics.response.clone() },
            data_tx.clone(),
            response_tx.clone(),
            status.clone(),
            config.pipeline.utc_offset(),
        );
        let publisher = CommandPublisher::new(
            Arc::new(mqtt_client.clone()),
            config.topics.command.clone(),
            config.topics.prediction.clone(),
        );
        let ingest = IngestionLoop::new(data_rx, response_rx, model, publisher, status.clone(), &config);

        Self {
            mqtt_client,
            config,
            status,
            manager,
            ingest,
            data_tx,
            response_tx,
            clock: Instant::now(),
        }
    }

    /// Connects the mocked session: Connecting, then a successful handshake.
    pub fn connect(&mut self) -> Step {
        self.manager.begin_connect();
        self.manager.on_event(MockMqttClient::connack())
    }

    pub fn drop_connection(&mut self) -> Step {
        self.manager.on_event(MockMqttClient::network_error())
    }

    /// Delivers a sensor payload through the Connection Manager.
    pub fn deliver_sensor(&mut self, payload: &Value) -> Step {
        let topic = self.config.topics.data.clone();
        self.manager.on_event(Ok(MockMqttClient::incoming(&topic, payload)))
    }

    pub fn deliver_response(&mut self, payload: &Value) -> Step {
        let topic = self.config.topics.response.clone();
        self.manager.on_event(Ok(MockMqttClient::incoming(&topic, payload)))
    }

    pub fn deliver_raw(&mut self, payload: &[u8]) -> Step {
        let topic = self.config.topics.data.clone();
        self.manager.on_event(Ok(MockMqttClient::incoming_raw(&topic, payload)))
    }

    /// Enqueues a sensor message stamped with the harness clock, bypassing the broker side.
    pub fn push_sensor(&self, payload: Value) -> Result<()> {
        let msg = InboundMessage {
            received_at: OffsetDateTime::now_utc(),
            received: self.clock,
            payload,
        };
        self.data_tx.send(msg).map_err(|e| anyhow::anyhow!("send error: {}", e))?;
        Ok(())
    }

    pub fn push_response(&self, payload: Value) -> Result<()> {
        self.response_tx
            .send(InboundMessage::new(OffsetDateTime::now_utc(), payload))
            .map_err(|e| anyhow::anyhow!("send error: {}", e))?;
        Ok(())
    }

    pub fn advance(&mut self, by: Duration) {
        self.clock += by;
    }

    pub fn now(&self) -> Instant {
        self.clock
    }

    /// Runs one tick at the harness clock.
    pub fn tick(&mut self) -> TickReport {
        let report = self.ingest.tick_at(self.clock);
        log::info!("tick: {:?}", report);
        report
    }

    /// Ticks at real time, for messages stamped by the Connection Manager.
    pub fn tick_now(&mut self) -> TickReport {
        self.clock = self.clock.max(Instant::now());
        self.tick()
    }

    pub fn commands(&self) -> Result<Vec<Value>> {
        self.mqtt_client.json_messages(&self.config.topics.command)
    }

    pub fn predictions(&self) -> Result<Vec<Value>> {
        self.mqtt_client.json_messages(&self.config.topics.prediction)
    }
}

impl Default for TestHarness {
    fn default() -> Self {
        Self::new()
    }
}
