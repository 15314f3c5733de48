use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Query, State,
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade, rejection::WebSocketUpgradeRejection},
    },
    http::{HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::get,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::mpsc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};

use crate::AppState;
use crate::config::AppConfig;
use crate::events::{InboundEvent, OutboundEvent, to_json};
use crate::relay::{ConnectionManager, Handshake, Identity, Session};

/// Build the HTTP router: `/ws` for relay sessions, `/health` for probes.
pub fn router(state: AppState) -> Router {
    let cors = cors_layer(&state.config.server.cors_origins);

    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

fn cors_layer(origins: &[String]) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods(Any).allow_headers(Any);
    if origins.is_empty() {
        return layer.allow_origin(Any);
    }

    let parsed: Vec<HeaderValue> = origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(e) => {
                warn!(origin = %origin, error = %e, "Ignoring invalid CORS origin");
                None
            }
        })
        .collect();
    layer.allow_origin(parsed)
}

/// Start the server and run until Ctrl-C / SIGTERM, then drain the relay.
pub async fn start_server(config: Arc<AppConfig>, manager: ConnectionManager) -> anyhow::Result<()> {
    let state = AppState {
        manager: manager.clone(),
        config: Arc::clone(&config),
    };
    let app = router(state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;

    info!(
        name: "server.started",
        address = %addr,
        "Server started"
    );

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!(name: "server.shutdown", "Shutdown signal received");
            manager.shutdown().await;
        })
        .await?;
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
struct HealthResponse {
    status: &'static str,
    sessions: usize,
}

/// GET /health
async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let status = if state.manager.is_shutting_down() {
        "draining"
    } else {
        "ok"
    };
    Json(HealthResponse {
        status,
        sessions: state.manager.session_count().await,
    })
}

/// GET /ws?identity=<token>
///
/// The identity is checked before upgrading so that rejected clients get a
/// plain 401 instead of a socket that closes immediately.
async fn ws_handler(
    State(state): State<AppState>,
    Query(handshake): Query<Handshake>,
    upgrade: Result<WebSocketUpgrade, WebSocketUpgradeRejection>,
) -> Response {
    if let Err(err) = Identity::parse(handshake.identity.as_deref()) {
        warn!(name: "relay.session.rejected", reason = %err, "Handshake without identity");
        return (StatusCode::UNAUTHORIZED, err.to_string()).into_response();
    }
    if state.manager.is_shutting_down() {
        return (StatusCode::SERVICE_UNAVAILABLE, "relay is shutting down").into_response();
    }

    match upgrade {
        Ok(ws) => ws
            .on_upgrade(move |socket| handle_socket(socket, state.manager, handshake))
            .into_response(),
        Err(rejection) => rejection.into_response(),
    }
}

/// Bridge one WebSocket to a relay session.
async fn handle_socket(socket: WebSocket, manager: ConnectionManager, handshake: Handshake) {
    let (outbound_tx, mut outbound_rx) =
        mpsc::channel::<OutboundEvent>(manager.settings().outbound_buffer.max(1));

    let session = match manager.connect(handshake, outbound_tx).await {
        Ok(session) => session,
        Err(err) => {
            debug!(error = %err, "Closing socket for rejected connection");
            let mut socket = socket;
            let _ = socket.send(WsMessage::Close(None)).await;
            return;
        }
    };

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Forward outbound events until the relay closes the session.
    let closing = session.clone();
    let send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                event = outbound_rx.recv() => {
                    let Some(event) = event else { break };
                    if ws_tx.send(WsMessage::Text(to_json(&event).into())).await.is_err() {
                        debug!("WebSocket send failed, client disconnected");
                        break;
                    }
                }
                () = closing.closed() => {
                    // Flush what was queued before the close.
                    while let Ok(event) = outbound_rx.try_recv() {
                        if ws_tx.send(WsMessage::Text(to_json(&event).into())).await.is_err() {
                            break;
                        }
                    }
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    break;
                }
            }
        }
    });

    loop {
        let frame = tokio::select! {
            frame = ws_rx.next() => frame,
            () = session.closed() => break,
        };

        let text = match frame {
            Some(Ok(WsMessage::Text(text))) => text,
            Some(Ok(WsMessage::Close(_))) | None => break,
            Some(Ok(_)) => continue,
            Some(Err(e)) => {
                warn!(error = %e, "WebSocket error");
                break;
            }
        };

        match serde_json::from_str::<InboundEvent>(text.as_str()) {
            Ok(event) => manager.dispatch(&session, event).await,
            Err(e) => {
                warn!(error = %e, "Failed to parse client event");
                session
                    .emit(OutboundEvent::error(format!("invalid event: {e}")))
                    .await;
            }
        }
    }

    manager.disconnect(&session).await;
    finish(send_task, &session).await;
}

async fn finish(send_task: tokio::task::JoinHandle<()>, session: &Session) {
    if let Err(e) = send_task.await {
        debug!(connection_id = %session.connection_id(), error = %e, "Send task ended abnormally");
    }
}
