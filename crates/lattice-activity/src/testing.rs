//! Shared test doubles for this crate's unit tests.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use lattice_core::{
    Bounds, ContextValue, PeerId, WindowDefinition, WindowHandle, WindowId, Windowing,
    WindowingError,
};
use lattice_store::ContextStore;

use crate::registry::ActivityRegistry;
use crate::types::ActivityType;

pub(crate) fn obj(v: serde_json::Value) -> ContextValue {
    match v {
        serde_json::Value::Object(m) => m,
        other => panic!("not an object: {other}"),
    }
}

pub(crate) struct MockWindowing {
    pub created: Mutex<Vec<WindowHandle>>,
    pub closed: Mutex<Vec<WindowId>>,
    pub fail_types: Mutex<HashSet<String>>,
    pub delay: Mutex<Option<Duration>>,
}

impl MockWindowing {
    pub(crate) fn new() -> Self {
        Self {
            created: Mutex::new(Vec::new()),
            closed: Mutex::new(Vec::new()),
            fail_types: Mutex::new(HashSet::new()),
            delay: Mutex::new(None),
        }
    }

    pub(crate) fn failing_on(self, window_type: &str) -> Self {
        self.fail_types.lock().insert(window_type.to_string());
        self
    }
}

#[async_trait]
impl Windowing for MockWindowing {
    async fn create_window(&self, definition: &WindowDefinition) -> Result<WindowHandle, WindowingError> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        if self.fail_types.lock().contains(&definition.window_type) {
            return Err(WindowingError::CreationFailed(definition.window_type.clone()));
        }
        let handle = WindowHandle {
            id: WindowId::new(),
            window_type: definition.window_type.clone(),
            bounds: definition.bounds,
        };
        self.created.lock().push(handle.clone());
        Ok(handle)
    }

    async fn close_window(&self, id: &WindowId) -> Result<(), WindowingError> {
        self.closed.lock().push(id.clone());
        Ok(())
    }
}

/// A registry over a fresh in-memory store with one "trade" activity type:
/// a "ticket" owner plus "chart" and "blotter" helpers.
pub(crate) fn registry_with(windowing: Arc<MockWindowing>) -> ActivityRegistry {
    let (envelope_tx, _) = tokio::sync::broadcast::channel(64);
    let (event_tx, _) = tokio::sync::broadcast::channel(64);
    let store = Arc::new(ContextStore::new(PeerId::new(), envelope_tx));
    let registry = ActivityRegistry::new(store, windowing, event_tx);
    registry.register_type(
        ActivityType::new(
            "trade",
            WindowDefinition::new("ticket").with_bounds(Bounds::new(0, 0, 600, 400)),
        )
        .with_helper(WindowDefinition::new("chart"))
        .with_helper(WindowDefinition::new("blotter")),
    );
    registry
}
