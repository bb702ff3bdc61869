use serde::{Deserialize, Serialize};

use lattice_core::{ActivityId, ActivityStatus, AttachmentId, ContextValue, WindowDefinition, WindowId};

/// Blueprint for a family of activities: the owner window that controls the
/// lifetime plus the helper windows that join it.
///
/// Registered types are immutable while instances exist — a running
/// activity keeps its own reference, not a live link to the table entry.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityType {
    pub name: String,
    pub owner_window: WindowDefinition,
    #[serde(default)]
    pub helper_windows: Vec<WindowDefinition>,
    #[serde(default)]
    pub layout: serde_json::Value,
}

impl ActivityType {
    pub fn new(name: impl Into<String>, owner_window: WindowDefinition) -> Self {
        Self {
            name: name.into(),
            owner_window,
            helper_windows: Vec::new(),
            layout: serde_json::Value::Null,
        }
    }

    pub fn with_helper(mut self, definition: WindowDefinition) -> Self {
        self.helper_windows.push(definition);
        self
    }

    /// The definition for a logical window type, if this activity type
    /// declares it.
    pub fn definition_of(&self, window_type: &str) -> Option<&WindowDefinition> {
        if self.owner_window.window_type == window_type {
            return Some(&self.owner_window);
        }
        self.helper_windows.iter().find(|d| d.window_type == window_type)
    }
}

/// A window participating in an activity. The `activity` field is a
/// back-reference by id — navigation goes through the registry, so window
/// and activity lifetimes stay independently managed.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivityWindow {
    pub id: WindowId,
    pub window_type: String,
    pub activity: ActivityId,
    pub is_owner: bool,
}

/// Read-only snapshot of one live activity, for surfaces that must not hold
/// registry locks.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ActivitySnapshot {
    pub id: ActivityId,
    pub type_name: String,
    pub status: ActivityStatus,
    pub windows: Vec<ActivityWindow>,
}

impl ActivitySnapshot {
    pub fn owner(&self) -> Option<&ActivityWindow> {
        self.windows.iter().find(|w| w.is_owner)
    }
}

/// Everything needed to reverse an attach: the absorbed windows, the
/// pre-merge source context and the source's type.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AttachedActivityDescriptor {
    pub id: AttachmentId,
    /// The surviving activity the source was merged into.
    pub owner_id: ActivityId,
    /// The source's full type, so detach works even after the type was
    /// unregistered.
    pub source_type: ActivityType,
    /// The source's windows as they were before the merge, owner flag
    /// included, so detach can restore the original membership.
    pub windows: Vec<ActivityWindow>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame_color: Option<String>,
    /// The source context value from before the merge.
    pub context: ContextValue,
    #[serde(default)]
    pub tag: serde_json::Value,
}

impl AttachedActivityDescriptor {
    pub fn window_ids(&self) -> Vec<WindowId> {
        self.windows.iter().map(|w| w.id.clone()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::Bounds;

    #[test]
    fn definition_lookup() {
        let ty = ActivityType::new("trade", WindowDefinition::new("ticket"))
            .with_helper(WindowDefinition::new("chart").with_bounds(Bounds::new(0, 0, 400, 300)))
            .with_helper(WindowDefinition::new("blotter"));

        assert!(ty.definition_of("ticket").is_some());
        assert_eq!(ty.definition_of("chart").unwrap().bounds.width, 400);
        assert!(ty.definition_of("news").is_none());
    }

    #[test]
    fn snapshot_owner_lookup() {
        let activity = ActivityId::new();
        let snapshot = ActivitySnapshot {
            id: activity.clone(),
            type_name: "trade".into(),
            status: ActivityStatus::Running,
            windows: vec![
                ActivityWindow {
                    id: WindowId::new(),
                    window_type: "chart".into(),
                    activity: activity.clone(),
                    is_owner: false,
                },
                ActivityWindow {
                    id: WindowId::new(),
                    window_type: "ticket".into(),
                    activity,
                    is_owner: true,
                },
            ],
        };
        assert_eq!(snapshot.owner().unwrap().window_type, "ticket");
    }

    #[test]
    fn descriptor_serde_roundtrip() {
        let activity = ActivityId::new();
        let descriptor = AttachedActivityDescriptor {
            id: AttachmentId::new(),
            owner_id: activity.clone(),
            source_type: ActivityType::new("news", WindowDefinition::new("headline")),
            windows: vec![ActivityWindow {
                id: WindowId::new(),
                window_type: "headline".into(),
                activity,
                is_owner: true,
            }],
            frame_color: Some("#00ff00".into()),
            context: ContextValue::new(),
            tag: serde_json::json!({"reason": "docked"}),
        };
        let json = serde_json::to_string(&descriptor).unwrap();
        let parsed: AttachedActivityDescriptor = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.id, descriptor.id);
        assert_eq!(parsed.windows.len(), 1);
        assert_eq!(parsed.tag, descriptor.tag);
    }
}
