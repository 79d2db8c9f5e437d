/**
 * DASHBOARD API - Read-only view of the pipeline plus device commands
 *
 * ROUTES:
 * - GET  /health            liveness of this process
 * - GET  /system/health     link health (session phase, reconnects, drops)
 * - GET  /dashboard         latest snapshot published by the Ingestion Loop
 * - GET  /history?limit=N   parallel series, newest N when limited
 * - POST /commands          typed command body `{cmd: .., ..}`
 * - POST /commands/{name}   command name + optional JSON params
 *
 * Handlers only read the published snapshot; loop-owned state is never
 * touched from here. `ok` in command replies means "handed to the
 * transport", not "acknowledged by the device".
 */

use crate::health::{ConnectionStatus, LinkHealth};
use crate::history::HistorySnapshot;
use crate::ingest::DashboardSnapshot;
use crate::publisher::{CommandPublisher, DeviceCommand};
use crate::state::{read_state, Shared};
use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use tracing::warn;

#[derive(Clone)]
pub struct AppState {
    pub snapshot: Shared<DashboardSnapshot>,
    pub status: ConnectionStatus,
    pub publisher: CommandPublisher,
}

#[derive(Debug, Deserialize)]
pub struct HistoryParams {
    limit: Option<usize>,
}

#[derive(Debug, Serialize, PartialEq)]
pub struct CommandReply {
    pub ok: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl CommandReply {
    fn sent(ok: bool) -> Self {
        Self { ok, error: None }
    }

    fn rejected(error: impl Into<String>) -> Self {
        Self { ok: false, error: Some(error.into()) }
    }
}

pub fn build_router(app_state: AppState) -> Router {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/system/health", get(get_system_health))
        .route("/dashboard", get(get_dashboard))
        .route("/history", get(get_history))
        .route("/commands", post(post_command))
        .route("/commands/{name}", post(post_named_command))
        .with_state(app_state)
}

// GET /system/health
async fn get_system_health(State(app): State<AppState>) -> Json<LinkHealth> {
    Json(app.status.get_health())
}

// GET /dashboard
async fn get_dashboard(State(app): State<AppState>) -> Json<DashboardSnapshot> {
    Json(read_state(&app.snapshot))
}

// GET /history?limit=N
async fn get_history(
    State(app): State<AppState>,
    Query(params): Query<HistoryParams>,
) -> Json<HistorySnapshot> {
    let snap = app.snapshot.lock();
    let history = match params.limit {
        Some(n) => snap.history.tail(n),
        None => snap.history.clone(),
    };
    Json(history)
}

// POST /commands
async fn post_command(
    State(app): State<AppState>,
    Json(command): Json<DeviceCommand>,
) -> Json<CommandReply> {
    Json(CommandReply::sent(app.publisher.send(&command)))
}

// POST /commands/{name}
async fn post_named_command(
    State(app): State<AppState>,
    Path(name): Path<String>,
    body: Bytes,
) -> (StatusCode, Json<CommandReply>) {
    let params = if body.iter().all(u8::is_ascii_whitespace) {
        serde_json::Map::new()
    } else {
        match serde_json::from_slice::<serde_json::Map<String, serde_json::Value>>(&body) {
            Ok(map) => map,
            Err(e) => {
                return (StatusCode::BAD_REQUEST, Json(CommandReply::rejected(format!("invalid params: {e}"))));
            }
        }
    };

    if DeviceCommand::from_parts(&name, params.clone()).is_none() {
        warn!(cmd = %name, "rejected unknown or malformed command");
        return (
            StatusCode::BAD_REQUEST,
            Json(CommandReply::rejected(format!("unknown command or bad parameters: {name}"))),
        );
    }

    let ok = app.publisher.send_command(&name, params);
    (StatusCode::OK, Json(CommandReply::sent(ok)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DashboardConfig;
    use crate::error::PublishError;
    use crate::inference::ModelAvailability;
    use crate::ingest::IngestionLoop;
    use crate::models::InboundMessage;
    use crate::mqtt::message_channel;
    use crate::publisher::MessagePublisher;
    use crate::state::new_state;
    use parking_lot::Mutex;
    use rumqttc::QoS;
    use serde_json::json;
    use std::sync::Arc;

    #[derive(Default)]
    struct Outbox(Mutex<Vec<serde_json::Value>>);

    impl MessagePublisher for Outbox {
        fn publish_bytes(&self, _topic: &str, _qos: QoS, payload: Vec<u8>) -> Result<(), PublishError> {
            self.0.lock().push(serde_json::from_slice(&payload)?);
            Ok(())
        }
    }

    fn app_with_readings(aqis: &[i64]) -> (AppState, Arc<Outbox>) {
        let (data_tx, data_rx) = message_channel();
        let (_response_tx, response_rx) = message_channel();
        let outbox = Arc::new(Outbox::default());
        let publisher = CommandPublisher::new(outbox.clone(), "cmd", "pred");
        let status = ConnectionStatus::new();
        let mut ingest = IngestionLoop::new(
            data_rx,
            response_rx,
            ModelAvailability::Unavailable { diagnostic: "Model file not found: model.json".into() },
            publisher.clone(),
            status.clone(),
            &DashboardConfig::default(),
        );
        for aqi in aqis {
            let at = time::OffsetDateTime::now_utc();
            data_tx.send(InboundMessage::new(at, json!({"local_aqi": aqi}))).unwrap();
        }
        ingest.tick();
        let app = AppState { snapshot: new_state(ingest.snapshot()), status, publisher };
        (app, outbox)
    }

    #[tokio::test]
    async fn test_dashboard_and_history_read_the_snapshot() {
        let (app, _) = app_with_readings(&[10, 20, 30, 40]);

        let Json(dash) = get_dashboard(State(app.clone())).await;
        assert!(dash.connected);
        assert_eq!(dash.history_len, 4);
        assert_eq!(dash.reading.map(|r| r.aqi), Some(40));
        assert!(!dash.model.available);

        let Json(tail) = get_history(State(app.clone()), Query(HistoryParams { limit: Some(2) })).await;
        assert_eq!(tail.aqi, vec![30, 40]);
        let Json(all) = get_history(State(app), Query(HistoryParams { limit: None })).await;
        assert_eq!(all.aqi.len(), 4);
    }

    #[tokio::test]
    async fn test_named_command_is_validated() {
        let (app, outbox) = app_with_readings(&[]);

        let (code, Json(reply)) =
            post_named_command(State(app.clone()), Path("set_city".into()), Bytes::from_static(br#"{"city":"Serang"}"#)).await;
        assert_eq!(code, StatusCode::OK);
        assert!(reply.ok);

        let (code, Json(reply)) = post_named_command(State(app.clone()), Path("get_status".into()), Bytes::new()).await;
        assert_eq!(code, StatusCode::OK);
        assert!(reply.ok);

        let (code, Json(reply)) = post_named_command(State(app.clone()), Path("format_disk".into()), Bytes::new()).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);
        assert!(!reply.ok);

        let (code, _) = post_named_command(State(app), Path("set_city".into()), Bytes::from_static(b"not json")).await;
        assert_eq!(code, StatusCode::BAD_REQUEST);

        let sent = outbox.0.lock();
        assert_eq!(*sent, vec![json!({"cmd": "set_city", "city": "Serang"}), json!({"cmd": "get_status"})]);
    }

    #[tokio::test]
    async fn test_typed_command_and_link_health() {
        let (app, outbox) = app_with_readings(&[]);
        let Json(reply) = post_command(State(app.clone()), Json(DeviceCommand::Buzzer { on: false })).await;
        assert_eq!(reply, CommandReply { ok: true, error: None });
        assert_eq!(outbox.0.lock()[0], json!({"cmd": "buzzer", "on": false}));

        let Json(health) = get_system_health(State(app)).await;
        assert_eq!(health.reconnects, 0);
    }
}
