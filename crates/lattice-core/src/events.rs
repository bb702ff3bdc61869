use serde::{Deserialize, Serialize};

use crate::delta::ContextDelta;
use crate::ids::{ActivityId, AttachmentId, WindowId};

/// Lifecycle states of an activity.
///
/// Starting → Running → Stopping → Stopped, with Attaching/Detaching as
/// transient states that wrap Running during a coordinator operation and
/// resolve back to Running or to Stopped.
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ActivityStatus {
    Starting,
    Running,
    Attaching,
    Detaching,
    Stopping,
    Stopped,
}

impl ActivityStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Stopped)
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Attaching | Self::Detaching)
    }

    /// Whether context mutations are accepted in this state.
    pub fn accepts_mutations(&self) -> bool {
        matches!(self, Self::Running | Self::Attaching | Self::Detaching)
    }
}

impl std::fmt::Display for ActivityStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Starting => write!(f, "starting"),
            Self::Running => write!(f, "running"),
            Self::Attaching => write!(f, "attaching"),
            Self::Detaching => write!(f, "detaching"),
            Self::Stopping => write!(f, "stopping"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for ActivityStatus {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "starting" => Ok(Self::Starting),
            "running" => Ok(Self::Running),
            "attaching" => Ok(Self::Attaching),
            "detaching" => Ok(Self::Detaching),
            "stopping" => Ok(Self::Stopping),
            "stopped" => Ok(Self::Stopped),
            other => Err(format!("unknown activity status: {other}")),
        }
    }
}

/// Activity lifecycle events emitted by the registry and the coordinator.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ActivityEvent {
    #[serde(rename = "status_changed")]
    StatusChanged {
        activity_id: ActivityId,
        status: ActivityStatus,
    },

    #[serde(rename = "window_joined")]
    WindowJoined {
        activity_id: ActivityId,
        window_id: WindowId,
        is_owner: bool,
    },

    #[serde(rename = "window_left")]
    WindowLeft {
        activity_id: ActivityId,
        window_id: WindowId,
    },

    #[serde(rename = "context_changed")]
    ContextChanged {
        activity_id: ActivityId,
        version: u64,
        delta: ContextDelta,
    },

    #[serde(rename = "attached")]
    Attached {
        source_id: ActivityId,
        target_id: ActivityId,
        attachment_id: AttachmentId,
    },

    #[serde(rename = "detached")]
    Detached {
        activity_id: ActivityId,
        attachment_id: AttachmentId,
    },
}

impl ActivityEvent {
    /// The activity this event is about. For an attach, the surviving target.
    pub fn activity_id(&self) -> &ActivityId {
        match self {
            Self::StatusChanged { activity_id, .. }
            | Self::WindowJoined { activity_id, .. }
            | Self::WindowLeft { activity_id, .. }
            | Self::ContextChanged { activity_id, .. }
            | Self::Detached { activity_id, .. } => activity_id,
            Self::Attached { target_id, .. } => target_id,
        }
    }

    pub fn event_type(&self) -> &'static str {
        match self {
            Self::StatusChanged { .. } => "status_changed",
            Self::WindowJoined { .. } => "window_joined",
            Self::WindowLeft { .. } => "window_left",
            Self::ContextChanged { .. } => "context_changed",
            Self::Attached { .. } => "attached",
            Self::Detached { .. } => "detached",
        }
    }
}
