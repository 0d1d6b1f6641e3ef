use std::future::Future;
use std::net::SocketAddr;

use anyhow::{Context, Result};
use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    http::header,
    response::{IntoResponse, Response},
    routing::get,
    Json, Router,
};
use futures_util::{SinkExt, StreamExt};
use metrics_exporter_prometheus::PrometheusHandle;
use serde::Serialize;
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::config::RelayConfig;
use crate::registry::RegistryEntry;
use crate::relay::RelayState;

#[derive(Clone)]
pub struct AppState {
    pub relay: RelayState,
    pub metrics: Option<PrometheusHandle>,
}

#[derive(Debug, Serialize)]
pub struct HealthStatus {
    pub status: &'static str,
    pub registered: usize,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(websocket_handler))
        .route("/ws", get(websocket_handler))
        .route("/health", get(health_check))
        .route("/debug/peers", get(list_peers))
        .route("/metrics", get(render_metrics))
        .layer(CorsLayer::permissive())
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

pub async fn run(config: RelayConfig, metrics: PrometheusHandle) -> Result<()> {
    let state = AppState {
        relay: RelayState::from_config(&config),
        metrics: Some(metrics),
    };
    let listener = TcpListener::bind(config.listen_addr)
        .await
        .with_context(|| format!("failed to bind {}", config.listen_addr))?;
    info!(
        listen_addr = %config.listen_addr,
        collision_policy = ?config.collision_policy,
        max_message_bytes = config.max_message_bytes,
        "skiff relay listening"
    );
    serve(listener, state, shutdown_signal()).await?;
    info!("skiff relay stopped");
    Ok(())
}

/// Serve on an already-bound listener until `shutdown` resolves.
pub async fn serve<F>(listener: TcpListener, state: AppState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await
    .context("relay server exited with error")
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

pub async fn health_check(State(state): State<AppState>) -> Json<HealthStatus> {
    Json(HealthStatus {
        status: "ok",
        registered: state.relay.registry().len(),
    })
}

async fn list_peers(State(state): State<AppState>) -> Json<Vec<RegistryEntry>> {
    Json(state.relay.registry().snapshot())
}

async fn render_metrics(State(state): State<AppState>) -> Response {
    let body = state
        .metrics
        .as_ref()
        .map(PrometheusHandle::render)
        .unwrap_or_default();
    ([(header::CONTENT_TYPE, "text/plain; version=0.0.4")], body).into_response()
}

pub async fn websocket_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state.relay, remote_addr))
}

async fn handle_socket(socket: WebSocket, relay: RelayState, remote_addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (mut connection, mut outbound) = relay.open_connection(Some(remote_addr));
    let connection_id = connection.id();

    let writer = tokio::spawn(async move {
        while let Some(envelope) = outbound.recv().await {
            let text = match envelope.to_text() {
                Ok(text) => text,
                Err(err) => {
                    warn!(connection = %connection_id, error = %err, "failed to encode envelope");
                    continue;
                }
            };
            if sender.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        debug!(connection = %connection_id, "writer task ended");
    });

    while let Some(frame) = receiver.next().await {
        let frame = match frame {
            Ok(frame) => frame,
            Err(err) => {
                debug!(connection = %connection_id, error = %err, "websocket read failed");
                break;
            }
        };
        let result = match frame {
            Message::Text(text) => relay.handle_text(&mut connection, &text),
            Message::Binary(data) => relay.handle_binary(&mut connection, &data),
            Message::Close(_) => break,
            Message::Ping(_) | Message::Pong(_) => continue,
        };
        if let Err(err) = result {
            relay.record_drop(&connection, &err);
        }
    }

    let removed = relay.close_connection(connection);
    if !removed.is_empty() {
        info!(
            connection = %connection_id,
            %remote_addr,
            session_ids = ?removed,
            "unregistered on disconnect"
        );
    }
    writer.abort();
}
