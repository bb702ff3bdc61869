use std::sync::Arc;

use axum::extract::ws::{WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use tokio::sync::{broadcast, mpsc};
use tower_http::cors::CorsLayer;

use lattice_core::{ActivityEvent, Envelope};

use crate::bridge;
use crate::client::{self, ClientId, WindowClientRegistry};
use crate::handlers::{self, HandlerState};
use crate::rpc::{RpcRequest, RpcResponse};

/// Server configuration.
pub struct ServerConfig {
    pub port: u16,
    pub max_send_queue: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 9180,
            max_send_queue: 256,
        }
    }
}

/// Shared application state passed to Axum handlers.
#[derive(Clone)]
pub struct AppState {
    pub handler_state: Arc<HandlerState>,
    pub client_registry: Arc<WindowClientRegistry>,
    pub message_tx: mpsc::Sender<(ClientId, String)>,
}

/// Build the Axum router with all routes.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .with_state(state)
        .layer(CorsLayer::permissive())
}

/// Create and start the server. Returns a handle that keeps the background
/// tasks alive.
pub async fn start(
    config: ServerConfig,
    handler_state: Arc<HandlerState>,
    envelope_rx: broadcast::Receiver<Envelope>,
    activity_rx: broadcast::Receiver<ActivityEvent>,
) -> Result<ServerHandle, std::io::Error> {
    let client_registry = Arc::clone(&handler_state.clients);

    // Delta bridge: store envelopes → subscribed window clients
    let bridge_handle = bridge::create_bridge(Arc::clone(&client_registry), envelope_rx);

    // Activity bridge: lifecycle events → every connected client
    let activity_handle = bridge::create_activity_bridge(Arc::clone(&client_registry), activity_rx);

    // Dead-client cleanup (every 60s)
    let cleanup_handle = client::start_cleanup_task(
        Arc::clone(&client_registry),
        std::time::Duration::from_secs(60),
    );

    // RPC message processing channel
    let (msg_tx, msg_rx) = mpsc::channel::<(ClientId, String)>(1024);
    let rpc_state = Arc::clone(&handler_state);
    let rpc_registry = Arc::clone(&client_registry);
    let rpc_handle = tokio::spawn(process_rpc_messages(msg_rx, rpc_state, rpc_registry));

    let app_state = AppState {
        handler_state,
        client_registry,
        message_tx: msg_tx,
    };

    let router = build_router(app_state);
    let addr = format!("0.0.0.0:{}", config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let local_addr = listener.local_addr()?;

    tracing::info!(port = local_addr.port(), "Lattice host started");

    let server_handle = tokio::spawn(async move {
        axum::serve(listener, router).await.ok();
    });

    Ok(ServerHandle {
        port: local_addr.port(),
        _server: server_handle,
        _bridge: bridge_handle,
        _activity_bridge: activity_handle,
        _rpc: rpc_handle,
        _cleanup: cleanup_handle,
    })
}

/// Handle returned by `start()` — keeps background tasks alive.
pub struct ServerHandle {
    pub port: u16,
    _server: tokio::task::JoinHandle<()>,
    _bridge: tokio::task::JoinHandle<()>,
    _activity_bridge: tokio::task::JoinHandle<()>,
    _rpc: tokio::task::JoinHandle<()>,
    _cleanup: tokio::task::JoinHandle<()>,
}

/// Read raw messages off the shared channel, dispatch them, and send the
/// responses back to the issuing client.
async fn process_rpc_messages(
    mut rx: mpsc::Receiver<(ClientId, String)>,
    state: Arc<HandlerState>,
    registry: Arc<WindowClientRegistry>,
) {
    while let Some((client_id, raw)) = rx.recv().await {
        let response = match serde_json::from_str::<RpcRequest>(&raw) {
            Ok(request) => {
                let params = request.params.unwrap_or(serde_json::Value::Null);
                handlers::dispatch(&state, &client_id, &request.method, &params, request.id).await
            }
            Err(_) => RpcResponse::parse_error(),
        };
        if let Ok(json) = serde_json::to_string(&response) {
            registry.send_to(&client_id, json).await;
        }
    }
}

/// WebSocket upgrade handler.
async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle a new WebSocket connection.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let (client_id, rx) = state.client_registry.register();
    tracing::info!(client_id = %client_id, "Window client connected");

    client::handle_ws_connection(
        socket,
        client_id,
        rx,
        state.client_registry,
        state.message_tx,
    )
    .await;
}

/// Health check HTTP endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    let system_client = ClientId::new();
    let resp = handlers::dispatch(
        &state.handler_state,
        &system_client,
        "health",
        &serde_json::json!({}),
        None,
    )
    .await;

    (
        axum::http::StatusCode::OK,
        axum::Json(resp.result.unwrap_or_default()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::windowing::HostWindowing;
    use lattice_activity::{ActivityRegistry, GroupCoordinator};
    use lattice_core::PeerId;
    use lattice_store::{ChannelRegistry, ContextStore};

    fn handler_state() -> (
        Arc<HandlerState>,
        broadcast::Receiver<Envelope>,
        broadcast::Receiver<ActivityEvent>,
    ) {
        let (envelope_tx, envelope_rx) = broadcast::channel(64);
        let (event_tx, activity_rx) = broadcast::channel(64);

        let clients = Arc::new(WindowClientRegistry::new(64));
        let store = Arc::new(ContextStore::new(PeerId::new(), envelope_tx));
        let windowing = Arc::new(HostWindowing::new(Arc::clone(&clients)));
        let activities = Arc::new(ActivityRegistry::new(Arc::clone(&store), windowing, event_tx));
        let coordinator = Arc::new(GroupCoordinator::new(Arc::clone(&activities)));
        let channels = Arc::new(ChannelRegistry::new(Arc::clone(&store)));

        (
            Arc::new(HandlerState::new(store, activities, coordinator, channels, clients)),
            envelope_rx,
            activity_rx,
        )
    }

    #[tokio::test]
    async fn rpc_processor_answers_on_client_queue() {
        let (state, _envelope_rx, _activity_rx) = handler_state();
        let registry = Arc::clone(&state.clients);
        let (client_id, mut client_rx) = registry.register();

        let (tx, rx) = mpsc::channel(16);
        let _processor = tokio::spawn(process_rpc_messages(rx, Arc::clone(&state), Arc::clone(&registry)));

        tx.send((
            client_id.clone(),
            r#"{"method":"context.update","params":{"name":"theme","value":{"font":10}},"id":7}"#.to_string(),
        ))
        .await
        .unwrap();

        let response = tokio::time::timeout(std::time::Duration::from_secs(1), client_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(response.contains("\"id\":7"));
        assert!(response.contains("\"success\":true"));
        assert!(response.contains("\"version\":1"));
    }

    #[tokio::test]
    async fn rpc_processor_reports_parse_errors() {
        let (state, _envelope_rx, _activity_rx) = handler_state();
        let registry = Arc::clone(&state.clients);
        let (client_id, mut client_rx) = registry.register();

        let (tx, rx) = mpsc::channel(16);
        let _processor = tokio::spawn(process_rpc_messages(rx, Arc::clone(&state), Arc::clone(&registry)));

        tx.send((client_id.clone(), "not json".to_string())).await.unwrap();

        let response = tokio::time::timeout(std::time::Duration::from_secs(1), client_rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert!(response.contains("PARSE_ERROR"));
    }

    #[tokio::test]
    async fn server_starts_and_stops() {
        let (state, envelope_rx, activity_rx) = handler_state();
        let config = ServerConfig {
            port: 0, // ephemeral
            max_send_queue: 64,
        };
        let handle = start(config, state, envelope_rx, activity_rx).await.unwrap();
        assert_ne!(handle.port, 0);
    }

    #[tokio::test]
    async fn subscribed_client_receives_bridged_delta() {
        let (state, envelope_rx, _activity_rx) = handler_state();
        let registry = Arc::clone(&state.clients);
        let (client_id, mut client_rx) = registry.register();

        let _bridge = bridge::create_bridge(Arc::clone(&registry), envelope_rx);

        // Subscribe over the dispatch surface, then mutate.
        let resp = handlers::dispatch(
            &state,
            &client_id,
            "context.update",
            &serde_json::json!({"name": "theme", "value": {"font": 10}}),
            None,
        )
        .await;
        assert!(resp.success);
        let resp = handlers::dispatch(
            &state,
            &client_id,
            "context.subscribe",
            &serde_json::json!({"name": "theme"}),
            None,
        )
        .await;
        assert!(resp.success);

        handlers::dispatch(
            &state,
            &client_id,
            "context.update",
            &serde_json::json!({"name": "theme", "value": {"font": 11}}),
            None,
        )
        .await;

        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        let msg = client_rx.try_recv().unwrap();
        assert!(msg.contains("context_delta"));
        assert!(msg.contains("\"version\":2"));
    }
}
