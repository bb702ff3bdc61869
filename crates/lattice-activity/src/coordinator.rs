use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use parking_lot::Mutex;
use serde_json::Value;

use lattice_core::{ActivityEvent, ActivityId, ActivityStatus, AttachmentId, ContextValue, WindowDefinition};

use crate::error::ActivityError;
use crate::registry::ActivityRegistry;
use crate::types::{ActivityWindow, AttachedActivityDescriptor};

/// Implements attach/detach/clone between activities. Attach and detach
/// against the same target are serialized: one in-flight operation per
/// target, a second request fails with `AttachInProgress` rather than
/// interleaving merges. Operations either complete or roll back — membership
/// is never left half-merged.
pub struct GroupCoordinator {
    registry: Arc<ActivityRegistry>,
    in_flight: Mutex<HashSet<ActivityId>>,
    descriptors: Mutex<HashMap<AttachmentId, AttachedActivityDescriptor>>,
}

impl GroupCoordinator {
    pub fn new(registry: Arc<ActivityRegistry>) -> Self {
        Self {
            registry,
            in_flight: Mutex::new(HashSet::new()),
            descriptors: Mutex::new(HashMap::new()),
        }
    }

    pub fn registry(&self) -> &Arc<ActivityRegistry> {
        &self.registry
    }

    /// Merge `source` into `target`: target's context keys win, source's
    /// windows join target as helpers, source stops. The returned descriptor
    /// is what `detach` needs to reconstruct the source.
    pub async fn attach(
        &self,
        source_id: &ActivityId,
        target_id: &ActivityId,
        tag: Value,
    ) -> Result<AttachedActivityDescriptor, ActivityError> {
        if source_id == target_id {
            return Err(ActivityError::AttachInvalid(
                "cannot attach an activity to itself".into(),
            ));
        }
        self.begin(target_id)?;
        let result = self.attach_inner(source_id, target_id, tag).await;
        self.finish(target_id);
        result
    }

    async fn attach_inner(
        &self,
        source_id: &ActivityId,
        target_id: &ActivityId,
        tag: Value,
    ) -> Result<AttachedActivityDescriptor, ActivityError> {
        let registry = &self.registry;

        let source_status = registry.status_of(source_id)?;
        if source_status != ActivityStatus::Running {
            return Err(ActivityError::AttachInvalid(format!(
                "source {source_id} is {source_status}, not running"
            )));
        }
        let target_status = registry.status_of(target_id)?;
        if target_status != ActivityStatus::Running {
            return Err(ActivityError::AttachInvalid(format!(
                "target {target_id} is {target_status}, not running"
            )));
        }

        let source_type = registry.activity_type_of(source_id)?;
        let (source_context, _) = registry.context(source_id)?;

        registry.set_status(target_id, ActivityStatus::Attaching)?;

        let moved = match registry.transfer_windows(source_id, target_id) {
            Ok(moved) => moved,
            Err(err) => {
                let _ = registry.set_status(target_id, ActivityStatus::Running);
                return Err(err);
            }
        };

        // Target's conflicting keys win; only the source's non-conflicting
        // keys flow across, so attach never silently drops target state.
        let (target_context, _) = match registry.context(target_id) {
            Ok(found) => found,
            Err(err) => {
                registry.restore_windows(source_id, target_id, moved);
                let _ = registry.set_status(target_id, ActivityStatus::Running);
                return Err(err);
            }
        };
        let partial = non_conflicting(&source_context, &target_context);
        if !partial.is_empty() {
            if let Err(err) = registry.update_context(target_id, &partial) {
                registry.restore_windows(source_id, target_id, moved);
                let _ = registry.set_status(target_id, ActivityStatus::Running);
                return Err(err);
            }
        }

        if let Err(err) = registry.finalize_preserving_windows(source_id) {
            registry.restore_windows(source_id, target_id, moved);
            let _ = registry.set_status(target_id, ActivityStatus::Running);
            return Err(err);
        }

        registry.set_status(target_id, ActivityStatus::Running)?;

        let descriptor = AttachedActivityDescriptor {
            id: AttachmentId::new(),
            owner_id: target_id.clone(),
            source_type: (*source_type).clone(),
            windows: moved,
            frame_color: source_type.owner_window.frame_color.clone(),
            context: source_context,
            tag,
        };
        self.descriptors
            .lock()
            .insert(descriptor.id.clone(), descriptor.clone());
        registry.emit(ActivityEvent::Attached {
            source_id: source_id.clone(),
            target_id: target_id.clone(),
            attachment_id: descriptor.id.clone(),
        });
        tracing::info!(source = %source_id, target = %target_id, attachment = %descriptor.id, "Activities attached");
        Ok(descriptor)
    }

    /// Reverse an attach: pull the absorbed windows back out of the target
    /// and reconstruct an activity with the pre-merge context. A descriptor
    /// can be spent once; a second detach fails with `DetachInvalid`.
    pub async fn detach(&self, attachment_id: &AttachmentId) -> Result<ActivityId, ActivityError> {
        let descriptor = self
            .descriptors
            .lock()
            .get(attachment_id)
            .cloned()
            .ok_or_else(|| {
                ActivityError::DetachInvalid(format!("unknown or already-detached attachment {attachment_id}"))
            })?;

        self.begin(&descriptor.owner_id)?;
        let result = self.detach_inner(&descriptor).await;
        self.finish(&descriptor.owner_id);
        if result.is_ok() {
            self.descriptors.lock().remove(attachment_id);
        }
        result
    }

    async fn detach_inner(&self, descriptor: &AttachedActivityDescriptor) -> Result<ActivityId, ActivityError> {
        let registry = &self.registry;

        let target_status = registry
            .status_of(&descriptor.owner_id)
            .map_err(|_| ActivityError::DetachInvalid(format!("target {} is gone", descriptor.owner_id)))?;
        if target_status != ActivityStatus::Running {
            return Err(ActivityError::DetachInvalid(format!(
                "target {} is {target_status}, not running",
                descriptor.owner_id
            )));
        }

        registry.set_status(&descriptor.owner_id, ActivityStatus::Detaching)?;

        if let Err(err) = registry.remove_windows(&descriptor.owner_id, &descriptor.window_ids()) {
            let _ = registry.set_status(&descriptor.owner_id, ActivityStatus::Running);
            return Err(err);
        }

        // Original membership records carry the pre-attach owner flag.
        let new_id = registry.install_activity(
            Arc::new(descriptor.source_type.clone()),
            descriptor.windows.clone(),
            descriptor.context.clone(),
        )?;

        registry.set_status(&descriptor.owner_id, ActivityStatus::Running)?;
        registry.emit(ActivityEvent::Detached {
            activity_id: new_id.clone(),
            attachment_id: descriptor.id.clone(),
        });
        tracing::info!(target = %descriptor.owner_id, restored = %new_id, "Activity detached");
        Ok(new_id)
    }

    /// Create an independent activity of the same type, with a copy of the
    /// current context and every window of the type's definition recreated
    /// offset by (dx, dy).
    pub async fn clone_activity(&self, id: &ActivityId, dx: i32, dy: i32) -> Result<ActivityId, ActivityError> {
        let registry = &self.registry;
        let activity_type = registry.activity_type_of(id)?;
        let (context, _) = registry.context(id)?;

        let owner = registry
            .create_window_raw(&offset_definition(&activity_type.owner_window, dx, dy))
            .await
            .map_err(|e| ActivityError::OwnerCreationFailed(e.to_string()))?;

        let mut created = vec![owner.id.clone()];
        let mut windows = vec![ActivityWindow {
            id: owner.id.clone(),
            window_type: owner.window_type.clone(),
            activity: id.clone(), // re-tagged by install_activity
            is_owner: true,
        }];

        for definition in &activity_type.helper_windows {
            match registry.create_window_raw(&offset_definition(definition, dx, dy)).await {
                Ok(handle) => {
                    created.push(handle.id.clone());
                    windows.push(ActivityWindow {
                        id: handle.id,
                        window_type: handle.window_type,
                        activity: id.clone(),
                        is_owner: false,
                    });
                }
                Err(err) => {
                    for window_id in &created {
                        registry.close_window_raw(window_id).await;
                    }
                    return Err(err);
                }
            }
        }

        let new_id = registry.install_activity(activity_type, windows, context)?;
        tracing::info!(source = %id, clone = %new_id, "Activity cloned");
        Ok(new_id)
    }

    /// Descriptors of attaches that have not been detached yet.
    pub fn pending_attachments(&self) -> Vec<AttachmentId> {
        self.descriptors.lock().keys().cloned().collect()
    }

    pub(crate) fn begin(&self, target: &ActivityId) -> Result<(), ActivityError> {
        let mut in_flight = self.in_flight.lock();
        if !in_flight.insert(target.clone()) {
            return Err(ActivityError::AttachInProgress(target.to_string()));
        }
        Ok(())
    }

    pub(crate) fn finish(&self, target: &ActivityId) {
        self.in_flight.lock().remove(target);
    }
}

/// The source entries that survive a merge where the target wins every
/// conflict: keys absent from the target, recursively for nested objects.
fn non_conflicting(source: &ContextValue, target: &ContextValue) -> ContextValue {
    let mut partial = ContextValue::new();
    for (key, value) in source {
        match target.get(key) {
            None => {
                partial.insert(key.clone(), value.clone());
            }
            Some(existing) => {
                if let (Value::Object(source_map), Value::Object(target_map)) = (value, existing) {
                    let sub = non_conflicting(source_map, target_map);
                    if !sub.is_empty() {
                        partial.insert(key.clone(), Value::Object(sub));
                    }
                }
            }
        }
    }
    partial
}

fn offset_definition(definition: &WindowDefinition, dx: i32, dy: i32) -> WindowDefinition {
    let mut definition = definition.clone();
    definition.bounds = definition.bounds.offset(dx, dy);
    definition
}
