//! SMS gateway HTTP server crate.
//!
//! This crate provides an HTTP API to send messages through the SMS center
//! connectors and to control them.
//!
//! # HTTP API Routes
//!
//! ## List All Connectors
//! `GET /`
//!
//! Returns a debug representation of all connectors.
//!
//! ## Get Connector Details
//! `GET /{conn}`
//!
//! Returns details about the connector named `conn`.
//!
//! ## Fetch Inbound Messages
//! `GET /{conn}/inbound`
//!
//! Returns and removes the messages and delivery reports received so far.
//!
//! ## Send Message
//! `POST /{conn}/{receiver}`
//!
//! Queues a text message to `receiver`. The request body is the text, the
//! optional `X-Sender` header the sender. Returns the message id.
//!
//! ## Start and Stop
//! `POST /{conn}/start`, `POST /{conn}/stop`
//!
//! Resumes or suspends answering operations the SMS center sends.
//!
//! ## Shutdown
//! `POST /{conn}/shutdown`
//!
//! Shuts the connector down once its queue is sent.
//!
//! # Error Responses
//!
//! - `404 Not Found`: Returned when the specified connector does not exist
//! - `400 Bad Request`: Returned when the message text is not UTF-8
//! - `500 Internal Server Error`: Returned when a command cannot be sent to the connector

use std::{collections::HashMap, sync::Arc, time::Duration};

use axum::{
    Router,
    body::Bytes,
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
};
use smsc_core::{Config, ConnectorCommand, ConnectorConfig, ConnectorKind, EmiConfig, Sms};
use smsc_tokio::{ConnectorState, Daemon};
use tokio::{net::TcpListener, spawn, sync::Mutex};
use tracing::{error, info, level_filters::LevelFilter};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt as _, util::SubscriberInitExt as _};

#[derive(Clone)]
struct AppState {
    connectors: Arc<Mutex<HashMap<String, ConnectorState>>>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::ERROR.into())
                .with_env_var("SMSC_LOG")
                .from_env_lossy(),
        )
        .init();

    let mut emi = EmiConfig::new("127.0.0.1", 5000);
    emi.receive_port = Some(5001);
    emi.keepalive = Some(Duration::from_secs(120));
    emi.my_number = Some("4711".to_owned());
    let mut connector = ConnectorConfig::new(ConnectorKind::Emi(emi));
    connector.reconnect_delay = Duration::from_secs(5);

    let daemon = Daemon::new(Config {
        connectors: [("smsc".to_owned(), connector)].into(),
        dlr_storage: Default::default(),
    });
    let connectors = daemon.connectors();

    spawn(async move {
        match daemon.run().await {
            Ok(handles) => handles.join_all().await.iter().for_each(|res| {
                if let Err(e) = res {
                    error!("connector error: {e}");
                } else {
                    info!("handle finished");
                }
            }),
            Err(e) => error!("gateway error: {e}"),
        }
        info!("gateway finished");
    });

    let state = AppState { connectors };
    let app = Router::new()
        .route("/", get(get_all))
        .route("/{conn}", get(conn_get))
        .route("/{conn}/inbound", get(conn_inbound))
        .route("/{conn}/{receiver}", post(conn_send))
        .route("/{conn}/start", post(conn_start))
        .route("/{conn}/stop", post(conn_stop))
        .route("/{conn}/shutdown", post(conn_shutdown))
        .with_state(state);

    let listener = TcpListener::bind("127.0.0.1:8000").await?;
    axum::serve(listener, app).await?;

    Ok(())
}

async fn get_all(State(state): State<AppState>) -> String {
    format!("{:#?}", *(state.connectors.lock().await))
}

async fn conn_get(
    Path(conn_id): Path<String>,
    State(state): State<AppState>,
) -> Result<String, StatusCode> {
    if let Some(conn) = state.connectors.lock().await.get(&conn_id) {
        Ok(format!("{conn:#?}"))
    } else {
        Err(StatusCode::NOT_FOUND)
    }
}

async fn conn_inbound(
    Path(conn_id): Path<String>,
    State(state): State<AppState>,
) -> Result<String, StatusCode> {
    let mut connectors = state.connectors.lock().await;
    let conn = connectors.get_mut(&conn_id).ok_or(StatusCode::NOT_FOUND)?;
    let mut out = String::new();
    while let Ok(sms) = conn.inbound_rx.try_recv() {
        out.push_str(&format!("{} {} {}: {}\n", sms.id, sms.sender, sms.receiver, sms.text()));
    }
    Ok(out)
}

async fn command(
    state: &AppState,
    conn_id: &str,
    cmd: ConnectorCommand,
) -> Result<(), (StatusCode, String)> {
    if let Some(conn) = state.connectors.lock().await.get(conn_id) {
        conn.command_tx
            .send(cmd)
            .await
            .map_err(|e| (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

        Ok(())
    } else {
        Err((StatusCode::NOT_FOUND, String::new()))
    }
}

async fn conn_send(
    Path((conn_id, receiver)): Path<(String, String)>,
    State(state): State<AppState>,
    headers: HeaderMap,
    data: Bytes,
) -> Result<String, (StatusCode, String)> {
    let text = std::str::from_utf8(&data).map_err(|e| (StatusCode::BAD_REQUEST, e.to_string()))?;
    let sender = headers
        .get("x-sender")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default();
    let sms = Sms::mt(sender, receiver, text);
    let id = sms.id.to_string();
    command(&state, &conn_id, ConnectorCommand::Send(Box::new(sms))).await?;
    Ok(id)
}

async fn conn_start(
    Path(conn_id): Path<String>,
    State(state): State<AppState>,
) -> Result<(), (StatusCode, String)> {
    command(&state, &conn_id, ConnectorCommand::Start).await
}

async fn conn_stop(
    Path(conn_id): Path<String>,
    State(state): State<AppState>,
) -> Result<(), (StatusCode, String)> {
    command(&state, &conn_id, ConnectorCommand::Stop).await
}

async fn conn_shutdown(
    Path(conn_id): Path<String>,
    State(state): State<AppState>,
) -> Result<(), (StatusCode, String)> {
    command(&state, &conn_id, ConnectorCommand::Shutdown { finish: true }).await
}
