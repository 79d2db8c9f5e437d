//! AirWatch kernel: MQTT ingestion, classification and alerting for an
//! air-quality sensor node.
//!
//! Data flows one way: the Connection Manager (`mqtt`) enqueues decoded
//! messages, the Ingestion Loop (`ingest`) drains them on a fixed tick and
//! owns every piece of dashboard state, the Command Publisher (`publisher`)
//! sends commands and predictions back out over its own connection.

pub mod alerts;
pub mod config;
pub mod error;
pub mod health;
pub mod history;
pub mod http;
pub mod inference;
pub mod ingest;
pub mod models;
pub mod mqtt;
pub mod publisher;
pub mod state;

pub use alerts::{evaluate, Alert, Severity};
pub use config::DashboardConfig;
pub use health::{ConnectionStatus, SessionPhase};
pub use inference::{Classification, InferenceAdapter, ModelAvailability, SafetyLabel};
pub use ingest::{DashboardSnapshot, IngestionLoop, TickReport};
pub use models::{InboundMessage, Reading, SensorPayload, SensorValues};
pub use publisher::{CommandPublisher, DeviceCommand, MessagePublisher};
