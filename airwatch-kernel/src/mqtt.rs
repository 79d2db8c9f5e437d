/**
 * CONNECTION MANAGER - Durable subscriber session to the broker
 *
 * ROLE: Keep one subscriber session alive for the whole process lifetime and
 * hand every decoded message to the Ingestion Loop through a channel.
 *
 * STATES: Disconnected -> Connecting -> Connected. Any transport error,
 * broker-initiated disconnect or refused handshake drops back to
 * Disconnected; after a fixed backoff the loop returns to Connecting. Both
 * topics are re-subscribed on every successful handshake.
 *
 * THREADING: the network task only enqueues immutable `InboundMessage`s.
 * It never touches loop-owned state (history, reading, alerts, prediction).
 */

use crate::config::DashboardConfig;
use crate::error::SubscribeError;
use crate::health::{ConnectionStatus, SessionPhase};
use crate::models::InboundMessage;
use rumqttc::{
    AsyncClient, ConnAck, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming,
    MqttOptions, QoS,
};
use std::future::Future;
use std::time::Duration;
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

pub type MessageSender = UnboundedSender<InboundMessage>;
pub type MessageReceiver = UnboundedReceiver<InboundMessage>;

/// One channel per topic class.
pub fn message_channel() -> (MessageSender, MessageReceiver) {
    tokio::sync::mpsc::unbounded_channel()
}

/// Subscribe side of a live session. Must not block: it is called from the
/// event-loop task itself.
pub trait TopicSubscriber: Send {
    fn subscribe_topic(&self, topic: &str) -> Result<(), SubscribeError>;
}

impl TopicSubscriber for AsyncClient {
    fn subscribe_topic(&self, topic: &str) -> Result<(), SubscribeError> {
        self.try_subscribe(topic, QoS::AtLeastOnce)
            .map_err(|e| SubscribeError::Rejected { topic: topic.to_string(), reason: e.to_string() })
    }
}

/// Where session events come from: the rumqttc event loop in production.
pub trait EventSource: Send {
    fn next_event(&mut self) -> impl Future<Output = Result<Event, ConnectionError>> + Send;
}

impl EventSource for EventLoop {
    async fn next_event(&mut self) -> Result<Event, ConnectionError> {
        self.poll().await
    }
}

#[derive(Debug, Clone)]
pub struct SubscriptionTopics {
    pub data: String,
    pub response: String,
}

/// What the run loop must do after an event has been handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    Continue,
    Backoff,
}

/// Where a message went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Routed {
    SensorData,
    DeviceResponse,
    Ignored,
    Dropped,
}

pub struct ConnectionManager<S: TopicSubscriber> {
    subscriber: S,
    topics: SubscriptionTopics,
    data_tx: MessageSender,
    response_tx: MessageSender,
    status: ConnectionStatus,
    offset: UtcOffset,
    phase: SessionPhase,
    attempts: u64,
}

impl<S: TopicSubscriber> ConnectionManager<S> {
    pub fn new(
        subscriber: S,
        topics: SubscriptionTopics,
        data_tx: MessageSender,
        response_tx: MessageSender,
        status: ConnectionStatus,
        offset: UtcOffset,
    ) -> Self {
        Self {
            subscriber,
            topics,
            data_tx,
            response_tx,
            status,
            offset,
            phase: SessionPhase::Disconnected,
            attempts: 0,
        }
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    fn transition(&mut self, phase: SessionPhase) {
        if self.phase != phase {
            debug!(from = ?self.phase, to = ?phase, "session transition");
        }
        self.phase = phase;
        self.status.set_phase(phase);
        match phase {
            SessionPhase::Connected => self.status.mark_connected(),
            SessionPhase::Disconnected => self.status.mark_disconnected(),
            SessionPhase::Connecting => {}
        }
    }

    /// Entered on loop start and after every backoff.
    pub fn begin_connect(&mut self) {
        self.attempts += 1;
        if self.attempts > 1 {
            self.status.increment_reconnects();
        }
        self.transition(SessionPhase::Connecting);
    }

    /// Handles one result of the transport's event loop.
    pub fn on_event(&mut self, event: Result<Event, ConnectionError>) -> Step {
        match event {
            Ok(Event::Incoming(Incoming::ConnAck(ack))) => self.on_connack(&ack),
            Ok(Event::Incoming(Incoming::Publish(p))) => {
                self.dispatch(&p.topic, &p.payload);
                Step::Continue
            }
            Ok(Event::Incoming(Incoming::Disconnect)) => {
                warn!("broker closed the session");
                self.fail()
            }
            Ok(_) => Step::Continue,
            Err(ConnectionError::ConnectionRefused(code)) => {
                error!(?code, "broker refused the handshake");
                self.fail()
            }
            Err(e) => {
                warn!(error = %e, "MQTT session error");
                self.fail()
            }
        }
    }

    fn on_connack(&mut self, ack: &ConnAck) -> Step {
        if ack.code != ConnectReturnCode::Success {
            error!(code = ?ack.code, "broker refused the handshake");
            return self.fail();
        }
        self.transition(SessionPhase::Connected);
        info!(data = %self.topics.data, response = %self.topics.response, "connected, subscribing");
        let failed = [&self.topics.data, &self.topics.response]
            .into_iter()
            .find_map(|topic| self.subscriber.subscribe_topic(topic).err());
        if let Some(e) = failed {
            error!(error = %e, "subscribe failed");
            return self.fail();
        }
        Step::Continue
    }

    fn fail(&mut self) -> Step {
        self.transition(SessionPhase::Disconnected);
        Step::Backoff
    }

    /// Decodes and routes one message. Undecodable payloads are dropped,
    /// unknown topics ignored.
    pub fn dispatch(&self, topic: &str, payload: &[u8]) -> Routed {
        let target = if topic == self.topics.data {
            &self.data_tx
        } else if topic == self.topics.response {
            &self.response_tx
        } else {
            debug!(topic, "ignoring message on unexpected topic");
            return Routed::Ignored;
        };

        let payload: serde_json::Value = match serde_json::from_slice(payload) {
            Ok(v) => v,
            Err(e) => {
                warn!(topic, error = %e, "dropping undecodable payload");
                self.status.record_dropped();
                return Routed::Dropped;
            }
        };

        let received_at = OffsetDateTime::now_utc().to_offset(self.offset);
        if topic == self.topics.response {
            info!(%payload, "device response");
        }
        if target.send(InboundMessage::new(received_at, payload)).is_err() {
            warn!(topic, "ingestion side is gone, message dropped");
            self.status.record_dropped();
            return Routed::Dropped;
        }
        if topic == self.topics.data {
            Routed::SensorData
        } else {
            Routed::DeviceResponse
        }
    }

    /// Drives the session forever. Never returns; the task ends with the process.
    pub async fn run<E: EventSource>(mut self, mut events: E, backoff: Duration) {
        self.begin_connect();
        loop {
            let event = events.next_event().await;
            if self.on_event(event) == Step::Backoff {
                tokio::time::sleep(backoff).await;
                info!("reconnecting to broker");
                self.begin_connect();
            }
        }
    }
}

pub fn mqtt_options(cfg: &DashboardConfig, role: &str) -> MqttOptions {
    let client_id = format!("{}-{}-{}", cfg.mqtt.client_prefix, role, Uuid::new_v4().simple());
    let mut opts = MqttOptions::new(client_id, cfg.mqtt.host.clone(), cfg.mqtt.port);
    opts.set_keep_alive(Duration::from_secs(cfg.mqtt.keep_alive_secs.max(5)));
    opts.set_clean_session(true);
    opts
}

/// Spawns the subscriber session on its own task.
pub fn spawn_mqtt_listener(
    cfg: &DashboardConfig,
    data_tx: MessageSender,
    response_tx: MessageSender,
    status: ConnectionStatus,
) -> JoinHandle<()> {
    let (client, eventloop) = AsyncClient::new(mqtt_options(cfg, "worker"), 10);
    let topics = SubscriptionTopics {
        data: cfg.topics.data.clone(),
        response: cfg.topics.response.clone(),
    };
    let manager = ConnectionManager::new(
        client,
        topics,
        data_tx,
        response_tx,
        status,
        cfg.pipeline.utc_offset(),
    );
    let backoff = cfg.pipeline.reconnect_backoff();
    info!(host = %cfg.mqtt.host, port = cfg.mqtt.port, "starting MQTT worker");
    tokio::spawn(manager.run(eventloop, backoff))
}
