use std::time::Duration;

use lattice_core::WindowingError;
use lattice_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum ActivityError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    #[error("windowing error: {0}")]
    Windowing(#[from] WindowingError),

    #[error("activity not found: {0}")]
    ActivityNotFound(String),

    #[error("activity type not found: {0}")]
    TypeNotFound(String),

    #[error("unknown window type '{0}' for this activity")]
    UnknownWindowType(String),

    #[error("owner window creation failed: {0}")]
    OwnerCreationFailed(String),

    #[error("attach already in progress on {0}")]
    AttachInProgress(String),

    #[error("attach rejected: {0}")]
    AttachInvalid(String),

    #[error("detach rejected: {0}")]
    DetachInvalid(String),

    #[error("timed out after {0:?} creating stacked windows")]
    StackedWindowTimeout(Duration),
}

impl ActivityError {
    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::Store(_) => "store",
            Self::Windowing(_) => "windowing",
            Self::ActivityNotFound(_) => "activity_not_found",
            Self::TypeNotFound(_) => "type_not_found",
            Self::UnknownWindowType(_) => "unknown_window_type",
            Self::OwnerCreationFailed(_) => "owner_creation_failed",
            Self::AttachInProgress(_) => "attach_in_progress",
            Self::AttachInvalid(_) => "attach_invalid",
            Self::DetachInvalid(_) => "detach_invalid",
            Self::StackedWindowTimeout(_) => "stacked_window_timeout",
        }
    }
}
