use lattice_core::DeltaError;

#[derive(Debug, Clone, thiserror::Error)]
pub enum StoreError {
    #[error("context not found: {0}")]
    ContextNotFound(String),

    #[error("version conflict on '{name}': expected {expected}, current {current}")]
    VersionConflict {
        name: String,
        expected: u64,
        current: u64,
    },

    #[error("local view of '{name}' diverged, resync required: {reason}")]
    NeedsResync { name: String, reason: String },

    #[error("window {0} has not joined a channel")]
    NotJoined(String),

    #[error("serialization error: {0}")]
    Serialization(String),
}

impl StoreError {
    pub fn needs_resync(name: impl std::fmt::Display, reason: impl Into<String>) -> Self {
        Self::NeedsResync {
            name: name.to_string(),
            reason: reason.into(),
        }
    }

    /// Whether the caller should request a full snapshot before retrying.
    pub fn is_resync(&self) -> bool {
        matches!(self, Self::NeedsResync { .. })
    }

    /// Short classification string for logging/metrics.
    pub fn error_kind(&self) -> &'static str {
        match self {
            Self::ContextNotFound(_) => "context_not_found",
            Self::VersionConflict { .. } => "version_conflict",
            Self::NeedsResync { .. } => "needs_resync",
            Self::NotJoined(_) => "not_joined",
            Self::Serialization(_) => "serialization",
        }
    }
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl StoreError {
    pub fn from_delta(name: impl std::fmt::Display, e: DeltaError) -> Self {
        Self::needs_resync(name, e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resync_classification() {
        let err = StoreError::needs_resync("theme", "preimage mismatch");
        assert!(err.is_resync());
        assert_eq!(err.error_kind(), "needs_resync");

        let err = StoreError::ContextNotFound("theme".into());
        assert!(!err.is_resync());
        assert_eq!(err.error_kind(), "context_not_found");
    }

    #[test]
    fn conflict_message_carries_versions() {
        let err = StoreError::VersionConflict {
            name: "theme".into(),
            expected: 3,
            current: 5,
        };
        let msg = err.to_string();
        assert!(msg.contains("expected 3"));
        assert!(msg.contains("current 5"));
    }
}
