use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::ids::WindowId;

/// Screen-space rectangle of a window.
#[derive(Clone, Copy, Debug, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct Bounds {
    pub left: i32,
    pub top: i32,
    pub width: i32,
    pub height: i32,
}

impl Bounds {
    pub fn new(left: i32, top: i32, width: i32, height: i32) -> Self {
        Self { left, top, width, height }
    }

    /// The same rectangle shifted by (dx, dy). Size is unchanged.
    pub fn offset(&self, dx: i32, dy: i32) -> Self {
        Self {
            left: self.left + dx,
            top: self.top + dy,
            ..*self
        }
    }
}

/// Everything the windowing collaborator needs to materialize a window.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct WindowDefinition {
    pub window_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default)]
    pub bounds: Bounds,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_color: Option<String>,
}

impl WindowDefinition {
    pub fn new(window_type: impl Into<String>) -> Self {
        Self {
            window_type: window_type.into(),
            url: None,
            bounds: Bounds::default(),
            frame_color: None,
        }
    }

    pub fn with_bounds(mut self, bounds: Bounds) -> Self {
        self.bounds = bounds;
        self
    }

    pub fn with_frame_color(mut self, color: impl Into<String>) -> Self {
        self.frame_color = Some(color.into());
        self
    }
}

/// A live window as reported back by the windowing collaborator.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct WindowHandle {
    pub id: WindowId,
    pub window_type: String,
    pub bounds: Bounds,
}

#[derive(Clone, Debug, thiserror::Error)]
pub enum WindowingError {
    #[error("window creation failed: {0}")]
    CreationFailed(String),
    #[error("window not found: {0}")]
    NotFound(String),
    #[error("windowing transport error: {0}")]
    Transport(String),
}

/// Window creation/placement lives outside this core. The caller awaits
/// `create_window` until the window has signalled ready.
#[async_trait]
pub trait Windowing: Send + Sync {
    async fn create_window(&self, definition: &WindowDefinition) -> Result<WindowHandle, WindowingError>;
    async fn close_window(&self, id: &WindowId) -> Result<(), WindowingError>;
}

/// Application metadata lookup, used only to resolve a logical type name
/// into a window definition.
pub trait AppDirectory: Send + Sync {
    fn resolve(&self, window_type: &str) -> Option<WindowDefinition>;
}
