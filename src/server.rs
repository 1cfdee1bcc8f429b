//! HTTP surface of the relay: the WebSocket endpoint, a liveness probe, a
//! service-info document and optional static assets.

use crate::config::{Config, CorsOrigins};
use crate::protocol::ClientMessage;
use crate::relay::Relay;
use axum::{
    Json, Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::{HeaderValue, Method},
    response::IntoResponse,
    routing::get,
};
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Serialize;
use std::time::Duration;
use tokio::time;
use tower_http::{
    cors::{AllowOrigin, Any, CorsLayer},
    services::ServeDir,
    trace::TraceLayer,
};
use tracing::{debug, error, info, warn};

#[derive(Clone)]
pub struct AppState {
    pub relay: Relay,
    pub ping_interval: Duration,
}

impl AppState {
    pub fn new(config: &Config) -> Self {
        Self {
            relay: Relay::new(),
            ping_interval: config.ping_interval,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub timestamp: String,
}

#[derive(Debug, Serialize)]
struct Endpoints {
    health: &'static str,
    socket: &'static str,
}

#[derive(Debug, Serialize)]
struct ServiceInfo {
    message: &'static str,
    version: &'static str,
    endpoints: Endpoints,
}

/// Builds the router:
/// - `/ws` relay WebSocket
/// - `/health` liveness probe
/// - `/` service info
/// - static assets from `STATIC_DIR` for every other path, if configured
pub fn build_router(state: AppState, config: &Config) -> Router {
    let mut router = Router::new()
        .route("/", get(service_info))
        .route("/health", get(health))
        .route("/ws", get(ws_handler))
        .with_state(state);

    if let Some(dir) = &config.static_dir {
        router = router.fallback_service(ServeDir::new(dir));
    }

    router
        .layer(cors_layer(&config.cors_origins))
        .layer(TraceLayer::new_for_http())
}

fn cors_layer(origins: &CorsOrigins) -> CorsLayer {
    let layer = CorsLayer::new().allow_methods([Method::GET, Method::POST]);
    match origins {
        CorsOrigins::Any => layer.allow_origin(Any),
        CorsOrigins::List(list) => {
            let values: Vec<HeaderValue> = list
                .iter()
                .filter_map(|origin| match origin.parse() {
                    Ok(value) => Some(value),
                    Err(_) => {
                        warn!(%origin, "ignoring unparsable CORS origin");
                        None
                    }
                })
                .collect();
            layer.allow_origin(AllowOrigin::list(values))
        }
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn service_info() -> impl IntoResponse {
    Json(ServiceInfo {
        message: "Call-code voice signaling relay",
        version: env!("CARGO_PKG_VERSION"),
        endpoints: Endpoints {
            health: "/health",
            socket: "/ws",
        },
    })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (id, mut rx) = state.relay.connect();
    let ping_period = state.ping_interval;

    // Drain this connection's queue to the socket; one writer per socket
    let send_task = tokio::spawn(async move {
        let mut ping_interval = time::interval_at(time::Instant::now() + ping_period, ping_period);
        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    let Some(msg) = outbound else { break };
                    let text = match serde_json::to_string(&msg) {
                        Ok(text) => text,
                        Err(err) => {
                            error!(%id, %err, "failed to encode frame");
                            continue;
                        }
                    };
                    if sender.send(Message::Text(text.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Vec::<u8>::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    while let Some(Ok(msg)) = receiver.next().await {
        match msg {
            Message::Text(text) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(frame) => state.relay.handle(id, frame),
                Err(err) => {
                    debug!(%id, %err, "malformed frame");
                    state.relay.reject(id, "MALFORMATTED_JSON");
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    state.relay.disconnect(id);
    info!(%id, "socket disconnected");
    send_task.abort();
}
