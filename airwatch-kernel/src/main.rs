/**
 * AIRWATCH KERNEL - Process entry point
 *
 * ROLE: Builds every component once at startup and wires them together:
 * config, subscriber task, model, publisher connection, tick task, HTTP.
 *
 * Nothing after startup is fatal: the broker may be down, the model may be
 * missing, the dashboard keeps serving whatever state it has.
 */

use airwatch_kernel::config::load_config;
use airwatch_kernel::http::{self, AppState};
use airwatch_kernel::mqtt::{message_channel, spawn_mqtt_listener};
use airwatch_kernel::state::new_state;
use airwatch_kernel::{CommandPublisher, ConnectionStatus, IngestionLoop, ModelAvailability};

use anyhow::Context;
use tokio::net::TcpListener;
use tracing::info;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // .env is optional
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("airwatch_kernel=info")),
        )
        .init();

    let cfg = load_config().await;
    let status = ConnectionStatus::new();

    // subscriber session -> channels
    let (data_tx, data_rx) = message_channel();
    let (response_tx, response_rx) = message_channel();
    spawn_mqtt_listener(&cfg, data_tx, response_tx, status.clone());

    // loaded once; a failure here disables predictions for the session
    let model = ModelAvailability::load(&cfg.model);

    let publisher = CommandPublisher::connect(&cfg);

    let ingest = IngestionLoop::new(data_rx, response_rx, model, publisher.clone(), status.clone(), &cfg);
    let snapshot = new_state(ingest.snapshot());
    tokio::spawn(ingest.run(cfg.pipeline.tick_interval(), snapshot.clone()));

    let app = http::build_router(AppState { snapshot, status, publisher });

    let listener = TcpListener::bind(&cfg.http.bind)
        .await
        .with_context(|| format!("failed to bind {}", cfg.http.bind))?;
    info!(addr = %cfg.http.bind, "dashboard API listening");
    axum::serve(listener, app).await.context("HTTP server stopped")?;
    Ok(())
}
