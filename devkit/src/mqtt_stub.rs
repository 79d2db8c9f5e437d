/*!
Mock MQTT client for running the AirWatch pipeline without a broker

Records every subscription and publish, implements the kernel's
`TopicSubscriber` and `MessagePublisher` traits, and builds the rumqttc
events a real event loop would yield.
*/

use airwatch_kernel::error::{PublishError, SubscribeError};
use airwatch_kernel::mqtt::TopicSubscriber;
use airwatch_kernel::publisher::MessagePublisher;
use anyhow::Result;
use rumqttc::{ConnAck, ConnectReturnCode, ConnectionError, Event, Incoming, Publish, QoS};
use serde_json::Value;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

#[derive(Debug, Clone)]
pub struct MockMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
}

/// Stands in for `rumqttc::AsyncClient` on both connections.
#[derive(Clone)]
pub struct MockMqttClient {
    published_messages: Arc<Mutex<Vec<MockMessage>>>,
    subscriptions: Arc<Mutex<Vec<String>>>,
    failing: Arc<AtomicBool>,
}

impl MockMqttClient {
    pub fn new() -> Self {
        Self {
            published_messages: Arc::new(Mutex::new(Vec::new())),
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            failing: Arc::new(AtomicBool::new(false)),
        }
    }

    /// While set, every publish and subscribe is rejected like a full request queue.
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn get_published_messages(&self) -> Vec<MockMessage> {
        self.published_messages.lock().unwrap().clone()
    }

    pub fn get_subscriptions(&self) -> Vec<String> {
        self.subscriptions.lock().unwrap().clone()
    }

    pub fn find_messages_by_topic(&self, topic: &str) -> Vec<MockMessage> {
        self.published_messages
            .lock()
            .unwrap()
            .iter()
            .filter(|msg| msg.topic == topic)
            .cloned()
            .collect()
    }

    /// Every payload published on `topic`, decoded as JSON.
    pub fn json_messages(&self, topic: &str) -> Result<Vec<Value>> {
        self.find_messages_by_topic(topic)
            .iter()
            .map(|msg| Ok(serde_json::from_slice(&msg.payload)?))
            .collect()
    }

    pub fn get_last_json_message<T>(&self, topic: &str) -> Result<Option<T>>
    where
        T: for<'de> serde::Deserialize<'de>,
    {
        let messages = self.find_messages_by_topic(topic);
        if let Some(last_msg) = messages.last() {
            let parsed: T = serde_json::from_slice(&last_msg.payload)?;
            Ok(Some(parsed))
        } else {
            Ok(None)
        }
    }

    /// Event for a message arriving on `topic`.
    pub fn incoming(topic: &str, payload: &Value) -> Event {
        let bytes = serde_json::to_vec(payload).unwrap_or_default();
        Event::Incoming(Incoming::Publish(Publish::new(topic, QoS::AtLeastOnce, bytes)))
    }

    /// Event for a raw, possibly undecodable, payload.
    pub fn incoming_raw(topic: &str, payload: &[u8]) -> Event {
        Event::Incoming(Incoming::Publish(Publish::new(topic, QoS::AtLeastOnce, payload.to_vec())))
    }

    pub fn connack() -> std::result::Result<Event, ConnectionError> {
        Ok(Event::Incoming(Incoming::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        })))
    }

    pub fn network_error() -> std::result::Result<Event, ConnectionError> {
        Err(ConnectionError::Io(std::io::Error::new(
            std::io::ErrorKind::ConnectionReset,
            "mock connection reset",
        )))
    }
}

impl Default for MockMqttClient {
    fn default() -> Self {
        Self::new()
    }
}

impl TopicSubscriber for MockMqttClient {
    fn subscribe_topic(&self, topic: &str) -> std::result::Result<(), SubscribeError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SubscribeError::Rejected { topic: topic.to_string(), reason: "mock failure".into() });
        }
        self.subscriptions.lock().unwrap().push(topic.to_string());
        log::info!("[MOCK] subscribed to {}", topic);
        Ok(())
    }
}

impl MessagePublisher for MockMqttClient {
    fn publish_bytes(&self, topic: &str, qos: QoS, payload: Vec<u8>) -> std::result::Result<(), PublishError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(PublishError::Rejected("mock failure".into()));
        }
        log::info!("[MOCK] published to {}: {} bytes", topic, payload.len());
        self.published_messages.lock().unwrap().push(MockMessage { topic: topic.to_string(), payload, qos });
        Ok(())
    }
}

/// Device payloads as the sensor firmware publishes them.
#[derive(Debug, Clone)]
pub struct SensorMessageBuilder {
    body: serde_json::Map<String, Value>,
}

impl SensorMessageBuilder {
    /// Current flat shape with the three model features set.
    pub fn new(temperature: f64, humidity: f64, aqi: i64) -> Self {
        let mut body = serde_json::Map::new();
        body.insert("suhu".into(), temperature.into());
        body.insert("lembab".into(), humidity.into());
        body.insert("local_aqi".into(), aqi.into());
        Self { body }
    }

    /// A full message with the usual diagnostics fields filled in.
    pub fn typical(temperature: f64, humidity: f64, aqi: i64) -> Self {
        Self::new(temperature, humidity, aqi)
            .field("adc_raw", 1234)
            .field("adc_percent", 30)
            .field("aqi_category", "Baik")
            .field("baseline_adc", 1100)
            .field("ip", "192.168.1.42")
            .field("rssi", -58)
            .field("uptime", 3600)
    }

    pub fn field(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.body.insert(name.into(), value.into());
        self
    }

    pub fn weather(self, aqi: i64, temperature: f64, category: &str) -> Self {
        self.field("weather_aqi", aqi)
            .field("weather_temp", temperature)
            .field("weather_aqi_cat", category)
    }

    pub fn build(self) -> Value {
        Value::Object(self.body)
    }

    /// Older firmware: temperature and humidity nested under `environment`.
    pub fn legacy(self) -> Value {
        let mut body = self.body;
        let temp = body.remove("suhu").unwrap_or(Value::Null);
        let humid = body.remove("lembab").unwrap_or(Value::Null);
        body.insert("environment".into(), serde_json::json!({ "temp": temp, "humid": humid }));
        Value::Object(body)
    }

    /// Acknowledgement as sent on the response topic.
    pub fn response(status: &str) -> Value {
        serde_json::json!({ "status": status })
    }
}
