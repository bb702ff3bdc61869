//! RPC method handlers organized by domain.

use std::sync::Arc;
use std::time::Duration;

use lattice_activity::{ActivityRegistry, ActivityType, GroupCoordinator};
use lattice_core::{ActivityId, AttachmentId, ContextName, Envelope, WindowId};
use lattice_store::{ChannelRegistry, ContextStore};
use lattice_telemetry::MetricsRecorder;

use crate::bridge;
use crate::client::{ClientId, WindowClientRegistry};
use crate::rpc::{self, RpcResponse};

const DEFAULT_STACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Shared state available to all RPC handlers.
pub struct HandlerState {
    pub store: Arc<ContextStore>,
    pub activities: Arc<ActivityRegistry>,
    pub coordinator: Arc<GroupCoordinator>,
    pub channels: Arc<ChannelRegistry>,
    pub clients: Arc<WindowClientRegistry>,
    pub metrics: Option<Arc<MetricsRecorder>>,
}

impl HandlerState {
    pub fn new(
        store: Arc<ContextStore>,
        activities: Arc<ActivityRegistry>,
        coordinator: Arc<GroupCoordinator>,
        channels: Arc<ChannelRegistry>,
        clients: Arc<WindowClientRegistry>,
    ) -> Self {
        Self {
            store,
            activities,
            coordinator,
            channels,
            clients,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRecorder>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    fn count(&self, name: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.increment_counter(name, 1);
        }
    }
}

/// Dispatch an RPC method to the appropriate handler.
pub async fn dispatch(
    state: &Arc<HandlerState>,
    client: &ClientId,
    method: &str,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    match method {
        // Context
        "context.update" => context_update(state, params, id),
        "context.set" => context_set(state, params, id),
        "context.get" | "context.sync" => context_get(state, params, id),
        "context.list" => context_list(state, id),
        "context.subscribe" => context_subscribe(state, client, params, id).await,
        "context.unsubscribe" => context_unsubscribe(state, client, params, id).await,

        // Peer hosts
        "peer.delta" => peer_delta(state, params, id),

        // Window lifecycle
        "window.announce" => window_announce(state, client, params, id).await,
        "window.closed" => window_closed(state, params, id).await,

        // Channels
        "channel.join" => channel_join(state, client, params, id).await,
        "channel.leave" => channel_leave(state, client, id).await,
        "channel.publish" => channel_publish(state, client, params, id).await,
        "channel.current" => channel_current(state, client, id).await,

        // Activities
        "activity.registerType" => activity_register_type(state, params, id),
        "activity.unregisterType" => activity_unregister_type(state, params, id),
        "activity.types" => activity_types(state, id),
        "activity.initiate" => activity_initiate(state, params, id).await,
        "activity.createWindow" => activity_create_window(state, params, id).await,
        "activity.createStackedWindows" => activity_create_stacked(state, params, id).await,
        "activity.updateContext" => activity_update_context(state, params, id),
        "activity.setContext" => activity_set_context(state, params, id),
        "activity.get" => activity_get(state, params, id),
        "activity.list" => activity_list(state, id),
        "activity.attach" => activity_attach(state, params, id).await,
        "activity.detach" => activity_detach(state, params, id).await,
        "activity.clone" => activity_clone(state, params, id).await,

        // System
        "system.ping" | "health" => health(state, id),
        "telemetry.metrics" => telemetry_metrics(state, id),

        _ => RpcResponse::method_not_found(id, method),
    }
}

// ---- context ---------------------------------------------------------------

fn context_update(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let name = match rpc::require_str(params, "name") {
        Ok(name) => ContextName::from(name),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    let value = match rpc::require_object(params, "value") {
        Ok(value) => value,
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    state.count("context_updates");
    let result = match rpc::optional_u64(params, "expected_version") {
        Some(expected) => state.store.update_checked(&name, value, expected),
        None => state.store.update(&name, value),
    };
    match result {
        Ok(update) => RpcResponse::success(id, serde_json::json!({"version": update.version})),
        Err(err) => RpcResponse::from_store_error(id, &err),
    }
}

fn context_set(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let name = match rpc::require_str(params, "name") {
        Ok(name) => ContextName::from(name),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    let value = match rpc::require_object(params, "value") {
        Ok(value) => value.clone(),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    state.count("context_sets");
    let update = state.store.set(&name, value);
    RpcResponse::success(id, serde_json::json!({"version": update.version}))
}

fn context_get(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let name = match rpc::require_str(params, "name") {
        Ok(name) => ContextName::from(name),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    match state.store.get(&name) {
        Some((value, version)) => RpcResponse::success(
            id,
            serde_json::json!({"name": name, "version": version, "value": value}),
        ),
        None => RpcResponse::error(id, "CONTEXT_NOT_FOUND", format!("context not found: {name}")),
    }
}

fn context_list(state: &HandlerState, id: Option<serde_json::Value>) -> RpcResponse {
    let mut names: Vec<String> = state.store.all().iter().map(|n| n.to_string()).collect();
    names.sort();
    RpcResponse::success(id, serde_json::json!({"contexts": names}))
}

/// Subscribing returns the current snapshot as the reply — the synthetic
/// reset a late joiner starts from — and adds the client to the fan-out set
/// for subsequent deltas.
async fn context_subscribe(
    state: &HandlerState,
    client: &ClientId,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let name = match rpc::require_str(params, "name") {
        Ok(name) => ContextName::from(name),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    let Some((value, version)) = state.store.get(&name) else {
        return RpcResponse::error(id, "CONTEXT_NOT_FOUND", format!("context not found: {name}"));
    };
    state.clients.add_subscription(client, name.clone()).await;
    RpcResponse::success(
        id,
        serde_json::json!({"name": name, "version": version, "value": value}),
    )
}

async fn context_unsubscribe(
    state: &HandlerState,
    client: &ClientId,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let name = match rpc::require_str(params, "name") {
        Ok(name) => ContextName::from(name),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    // Unsubscribing twice is a no-op, not an error.
    let removed = state.clients.remove_subscription(client, &name).await;
    RpcResponse::success(id, serde_json::json!({"removed": removed}))
}

// ---- peer hosts ------------------------------------------------------------

fn peer_delta(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let envelope: Envelope = match serde_json::from_value(params.clone()) {
        Ok(envelope) => envelope,
        Err(err) => return RpcResponse::invalid_params(id, err.to_string()),
    };
    match bridge::ingest_remote(&state.store, &envelope) {
        Ok(applied) => RpcResponse::success(id, serde_json::json!({"applied": applied.is_some()})),
        Err(err) => {
            state.count("peer_resyncs");
            RpcResponse::from_store_error(id, &err)
        }
    }
}

// ---- window lifecycle ------------------------------------------------------

async fn window_announce(
    state: &HandlerState,
    client: &ClientId,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let window_id = match rpc::require_str(params, "window_id") {
        Ok(raw) => WindowId::from_raw(raw),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    state.clients.bind_window(client, window_id.clone()).await;
    let activity = state.activities.window_activity(&window_id);
    RpcResponse::success(id, serde_json::json!({"window_id": window_id, "activity_id": activity}))
}

async fn window_closed(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let window_id = match rpc::require_str(params, "window_id") {
        Ok(raw) => WindowId::from_raw(raw),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    state.channels.leave(&window_id);
    state.activities.handle_window_closed(&window_id).await;
    RpcResponse::success(id, serde_json::json!({}))
}

// ---- channels --------------------------------------------------------------

async fn announced_window(state: &HandlerState, client: &ClientId) -> Result<WindowId, String> {
    state
        .clients
        .window_of(client)
        .await
        .ok_or_else(|| "client has not announced a window (call window.announce first)".to_string())
}

async fn channel_join(
    state: &HandlerState,
    client: &ClientId,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let window = match announced_window(state, client).await {
        Ok(window) => window,
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    let channel = match rpc::require_str(params, "channel") {
        Ok(channel) => channel.to_string(),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };

    // Leaving the previous channel also drops its fan-out subscription.
    if let Some(previous) = state.channels.channel_of(&window) {
        state
            .clients
            .remove_subscription(client, &ContextName::for_channel(&previous))
            .await;
    }

    let name = state.channels.join(&window, &channel);
    state.clients.add_subscription(client, name.clone()).await;
    state.count("channel_joins");

    let (value, version) = state.store.get(&name).unwrap_or_default();
    RpcResponse::success(
        id,
        serde_json::json!({"channel": channel, "name": name, "version": version, "value": value}),
    )
}

async fn channel_leave(state: &HandlerState, client: &ClientId, id: Option<serde_json::Value>) -> RpcResponse {
    let window = match announced_window(state, client).await {
        Ok(window) => window,
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    let left = state.channels.leave(&window);
    if let Some(channel) = &left {
        state
            .clients
            .remove_subscription(client, &ContextName::for_channel(channel))
            .await;
    }
    RpcResponse::success(id, serde_json::json!({"left": left}))
}

async fn channel_publish(
    state: &HandlerState,
    client: &ClientId,
    params: &serde_json::Value,
    id: Option<serde_json::Value>,
) -> RpcResponse {
    let window = match announced_window(state, client).await {
        Ok(window) => window,
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    let data = match rpc::require_object(params, "data") {
        Ok(data) => data,
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    state.count("channel_publishes");
    match state.channels.publish(&window, data) {
        Ok(update) => RpcResponse::success(id, serde_json::json!({"version": update.version})),
        Err(err) => RpcResponse::from_store_error(id, &err),
    }
}

async fn channel_current(state: &HandlerState, client: &ClientId, id: Option<serde_json::Value>) -> RpcResponse {
    let window = match announced_window(state, client).await {
        Ok(window) => window,
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    match state.channels.current(&window) {
        Ok((value, version)) => {
            RpcResponse::success(id, serde_json::json!({"version": version, "value": value}))
        }
        Err(err) => RpcResponse::from_store_error(id, &err),
    }
}

// ---- activities ------------------------------------------------------------

fn activity_register_type(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let activity_type: ActivityType = match params
        .get("type")
        .cloned()
        .map(serde_json::from_value)
        .transpose()
    {
        Ok(Some(activity_type)) => activity_type,
        Ok(None) => return RpcResponse::invalid_params(id, "Missing required parameter: type"),
        Err(err) => return RpcResponse::invalid_params(id, err.to_string()),
    };
    let name = activity_type.name.clone();
    state.activities.register_type(activity_type);
    RpcResponse::success(id, serde_json::json!({"name": name}))
}

fn activity_unregister_type(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let name = match rpc::require_str(params, "name") {
        Ok(name) => name,
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    let removed = state.activities.unregister_type(name);
    RpcResponse::success(id, serde_json::json!({"removed": removed}))
}

fn activity_types(state: &HandlerState, id: Option<serde_json::Value>) -> RpcResponse {
    RpcResponse::success(id, serde_json::json!({"types": state.activities.type_names()}))
}

async fn activity_initiate(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let type_name = match rpc::require_str(params, "type") {
        Ok(type_name) => type_name,
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    let initial = params
        .get("context")
        .and_then(|v| v.as_object())
        .cloned()
        .unwrap_or_default();
    state.count("activity_initiations");
    match state.activities.initiate(type_name, initial).await {
        Ok(activity_id) => RpcResponse::success(id, serde_json::json!({"activity_id": activity_id})),
        Err(err) => RpcResponse::from_activity_error(id, &err),
    }
}

async fn activity_create_window(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let (activity_id, window_type) = match (rpc::require_str(params, "activity_id"), rpc::require_str(params, "window_type")) {
        (Ok(a), Ok(w)) => (ActivityId::from_raw(a), w),
        (Err(msg), _) | (_, Err(msg)) => return RpcResponse::invalid_params(id, msg),
    };
    match state.activities.create_window(&activity_id, window_type).await {
        Ok(window_id) => RpcResponse::success(id, serde_json::json!({"window_id": window_id})),
        Err(err) => RpcResponse::from_activity_error(id, &err),
    }
}

async fn activity_create_stacked(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let activity_id = match rpc::require_str(params, "activity_id") {
        Ok(raw) => ActivityId::from_raw(raw),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    let window_types: Vec<String> = match params.get("window_types").and_then(|v| v.as_array()) {
        Some(types) => types
            .iter()
            .filter_map(|v| v.as_str().map(String::from))
            .collect(),
        None => return RpcResponse::invalid_params(id, "Missing required parameter: window_types"),
    };
    let timeout = rpc::optional_u64(params, "timeout_ms")
        .map(Duration::from_millis)
        .unwrap_or(DEFAULT_STACK_TIMEOUT);
    match state
        .activities
        .create_stacked_windows(&activity_id, &window_types, timeout)
        .await
    {
        Ok(window_ids) => RpcResponse::success(id, serde_json::json!({"window_ids": window_ids})),
        Err(err) => RpcResponse::from_activity_error(id, &err),
    }
}

fn activity_update_context(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let activity_id = match rpc::require_str(params, "activity_id") {
        Ok(raw) => ActivityId::from_raw(raw),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    let value = match rpc::require_object(params, "value") {
        Ok(value) => value,
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    match state.activities.update_context(&activity_id, value) {
        Ok(update) => RpcResponse::success(id, serde_json::json!({"version": update.version})),
        Err(err) => RpcResponse::from_activity_error(id, &err),
    }
}

fn activity_set_context(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let activity_id = match rpc::require_str(params, "activity_id") {
        Ok(raw) => ActivityId::from_raw(raw),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    let value = match rpc::require_object(params, "value") {
        Ok(value) => value.clone(),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    match state.activities.set_context(&activity_id, value) {
        Ok(update) => RpcResponse::success(id, serde_json::json!({"version": update.version})),
        Err(err) => RpcResponse::from_activity_error(id, &err),
    }
}

fn activity_get(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let activity_id = match rpc::require_str(params, "activity_id") {
        Ok(raw) => ActivityId::from_raw(raw),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    match state.activities.snapshot(&activity_id) {
        Ok(snapshot) => match serde_json::to_value(&snapshot) {
            Ok(value) => RpcResponse::success(id, value),
            Err(err) => RpcResponse::error(id, "SERIALIZATION_ERROR", err.to_string()),
        },
        Err(err) => RpcResponse::from_activity_error(id, &err),
    }
}

fn activity_list(state: &HandlerState, id: Option<serde_json::Value>) -> RpcResponse {
    RpcResponse::success(id, serde_json::json!({"activities": state.activities.list()}))
}

async fn activity_attach(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let (source, target) = match (rpc::require_str(params, "source_id"), rpc::require_str(params, "target_id")) {
        (Ok(s), Ok(t)) => (ActivityId::from_raw(s), ActivityId::from_raw(t)),
        (Err(msg), _) | (_, Err(msg)) => return RpcResponse::invalid_params(id, msg),
    };
    let tag = params.get("tag").cloned().unwrap_or(serde_json::Value::Null);
    state.count("attaches");
    match state.coordinator.attach(&source, &target, tag).await {
        Ok(descriptor) => match serde_json::to_value(&descriptor) {
            Ok(value) => RpcResponse::success(id, value),
            Err(err) => RpcResponse::error(id, "SERIALIZATION_ERROR", err.to_string()),
        },
        Err(err) => RpcResponse::from_activity_error(id, &err),
    }
}

async fn activity_detach(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let attachment_id = match rpc::require_str(params, "attachment_id") {
        Ok(raw) => AttachmentId::from_raw(raw),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    state.count("detaches");
    match state.coordinator.detach(&attachment_id).await {
        Ok(activity_id) => RpcResponse::success(id, serde_json::json!({"activity_id": activity_id})),
        Err(err) => RpcResponse::from_activity_error(id, &err),
    }
}

async fn activity_clone(state: &HandlerState, params: &serde_json::Value, id: Option<serde_json::Value>) -> RpcResponse {
    let activity_id = match rpc::require_str(params, "activity_id") {
        Ok(raw) => ActivityId::from_raw(raw),
        Err(msg) => return RpcResponse::invalid_params(id, msg),
    };
    let dx = rpc::optional_i64(params, "dx").unwrap_or(0) as i32;
    let dy = rpc::optional_i64(params, "dy").unwrap_or(0) as i32;
    match state.coordinator.clone_activity(&activity_id, dx, dy).await {
        Ok(clone_id) => RpcResponse::success(id, serde_json::json!({"activity_id": clone_id})),
        Err(err) => RpcResponse::from_activity_error(id, &err),
    }
}

// ---- system ----------------------------------------------------------------

fn health(state: &HandlerState, id: Option<serde_json::Value>) -> RpcResponse {
    RpcResponse::success(
        id,
        serde_json::json!({
            "status": "healthy",
            "contexts": state.store.all().len(),
            "activities": state.activities.list().len(),
            "clients": state.clients.count(),
        }),
    )
}

fn telemetry_metrics(state: &HandlerState, id: Option<serde_json::Value>) -> RpcResponse {
    match &state.metrics {
        Some(metrics) => match serde_json::to_value(metrics.snapshot()) {
            Ok(value) => RpcResponse::success(id, value),
            Err(err) => RpcResponse::error(id, "SERIALIZATION_ERROR", err.to_string()),
        },
        None => RpcResponse::success(id, serde_json::json!({})),
    }
}
