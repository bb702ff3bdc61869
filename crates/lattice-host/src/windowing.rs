use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;

use lattice_core::{WindowDefinition, WindowHandle, WindowId, Windowing, WindowingError};

use crate::client::WindowClientRegistry;

/// `Windowing` implementation that directs the connected shell clients to
/// materialize windows. The bus assigns the window id; placement and
/// rendering stay on the shell side.
pub struct HostWindowing {
    clients: Arc<WindowClientRegistry>,
}

#[derive(Serialize)]
struct WindowCreateDirective<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    window: &'a WindowHandle,
    definition: &'a WindowDefinition,
}

#[derive(Serialize)]
struct WindowCloseDirective<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    window_id: &'a WindowId,
}

impl HostWindowing {
    pub fn new(clients: Arc<WindowClientRegistry>) -> Self {
        Self { clients }
    }
}

#[async_trait]
impl Windowing for HostWindowing {
    async fn create_window(&self, definition: &WindowDefinition) -> Result<WindowHandle, WindowingError> {
        let handle = WindowHandle {
            id: WindowId::new(),
            window_type: definition.window_type.clone(),
            bounds: definition.bounds,
        };
        let directive = WindowCreateDirective {
            kind: "window_create",
            window: &handle,
            definition,
        };
        let json = serde_json::to_string(&directive)
            .map_err(|e| WindowingError::Transport(e.to_string()))?;
        if self.clients.broadcast_all(&json) == 0 {
            return Err(WindowingError::CreationFailed(
                "no connected shell to host the window".into(),
            ));
        }
        tracing::debug!(window = %handle.id, window_type = %handle.window_type, "Window create directive sent");
        Ok(handle)
    }

    async fn close_window(&self, id: &WindowId) -> Result<(), WindowingError> {
        let directive = WindowCloseDirective {
            kind: "window_close",
            window_id: id,
        };
        let json = serde_json::to_string(&directive)
            .map_err(|e| WindowingError::Transport(e.to_string()))?;
        self.clients.broadcast_all(&json);
        Ok(())
    }
}
