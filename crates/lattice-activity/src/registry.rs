use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::broadcast;

use lattice_core::{
    ActivityEvent, ActivityId, ActivityStatus, AppDirectory, ContextName, ContextValue,
    WindowDefinition, WindowHandle, WindowId, Windowing,
};
use lattice_store::{ContextStore, ContextUpdate, Subscription, UpdateHandler};

use crate::error::ActivityError;
use crate::types::{ActivitySnapshot, ActivityType, ActivityWindow};

struct ActivityEntry {
    activity_type: Arc<ActivityType>,
    status: ActivityStatus,
    windows: Vec<ActivityWindow>,
    context_name: ContextName,
    context_sub: Subscription,
}

/// Tracks live activities and drives their lifecycle. All context state
/// flows through the store; the registry only ever mutates context values by
/// calling into it.
pub struct ActivityRegistry {
    types: RwLock<HashMap<String, Arc<ActivityType>>>,
    activities: Mutex<HashMap<ActivityId, ActivityEntry>>,
    store: Arc<ContextStore>,
    windowing: Arc<dyn Windowing>,
    directory: Option<Arc<dyn AppDirectory>>,
    events: broadcast::Sender<ActivityEvent>,
}

impl ActivityRegistry {
    pub fn new(
        store: Arc<ContextStore>,
        windowing: Arc<dyn Windowing>,
        events: broadcast::Sender<ActivityEvent>,
    ) -> Self {
        Self {
            types: RwLock::new(HashMap::new()),
            activities: Mutex::new(HashMap::new()),
            store,
            windowing,
            directory: None,
            events,
        }
    }

    pub fn with_directory(mut self, directory: Arc<dyn AppDirectory>) -> Self {
        self.directory = Some(directory);
        self
    }

    pub fn store(&self) -> &Arc<ContextStore> {
        &self.store
    }

    /// Register an activity type. Replaces any previous registration of the
    /// same name; running instances keep the reference they started with.
    pub fn register_type(&self, activity_type: ActivityType) {
        self.types
            .write()
            .insert(activity_type.name.clone(), Arc::new(activity_type));
    }

    pub fn unregister_type(&self, name: &str) -> bool {
        self.types.write().remove(name).is_some()
    }

    pub fn type_of(&self, name: &str) -> Option<Arc<ActivityType>> {
        self.types.read().get(name).cloned()
    }

    pub fn type_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.types.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Start a new activity: owner window first, then the bound context
    /// seeded with `initial`, then Running. A failed owner creation leaves
    /// no activity behind.
    pub async fn initiate(&self, type_name: &str, initial: ContextValue) -> Result<ActivityId, ActivityError> {
        let activity_type = self
            .type_of(type_name)
            .ok_or_else(|| ActivityError::TypeNotFound(type_name.to_string()))?;

        let owner = self
            .windowing
            .create_window(&activity_type.owner_window)
            .await
            .map_err(|e| ActivityError::OwnerCreationFailed(e.to_string()))?;

        let id = ActivityId::new();
        let context_name = ContextName::for_activity(&id);
        self.store.set(&context_name, initial);
        let context_sub = self.watch_context(&id, &context_name)?;

        let owner_window = ActivityWindow {
            id: owner.id.clone(),
            window_type: owner.window_type.clone(),
            activity: id.clone(),
            is_owner: true,
        };
        self.activities.lock().insert(
            id.clone(),
            ActivityEntry {
                activity_type,
                status: ActivityStatus::Starting,
                windows: vec![owner_window],
                context_name,
                context_sub,
            },
        );
        self.emit(ActivityEvent::StatusChanged {
            activity_id: id.clone(),
            status: ActivityStatus::Starting,
        });
        self.emit(ActivityEvent::WindowJoined {
            activity_id: id.clone(),
            window_id: owner.id,
            is_owner: true,
        });

        // The owner handle coming back is the ready signal.
        self.set_status(&id, ActivityStatus::Running)?;
        tracing::info!(activity = %id, activity_type = type_name, "Activity started");
        Ok(id)
    }

    /// Add a helper window to a running activity. The joined window picks up
    /// the activity's current context through the subscribe snapshot rule.
    pub async fn create_window(&self, id: &ActivityId, window_type: &str) -> Result<WindowId, ActivityError> {
        let definition = self.resolve_definition(id, window_type)?;
        let handle = self.windowing.create_window(&definition).await?;

        if let Err(err) = self.join_window(id, &handle, false) {
            // The activity went away while the window was being created.
            if let Err(close_err) = self.windowing.close_window(&handle.id).await {
                tracing::warn!(window = %handle.id, error = %close_err, "Failed to close orphaned window");
            }
            return Err(err);
        }
        Ok(handle.id)
    }

    /// Create several helper windows as one stack. If the whole batch does
    /// not complete within `timeout`, windows already created are closed
    /// again and the call fails — no half-built stacks.
    pub async fn create_stacked_windows(
        &self,
        id: &ActivityId,
        window_types: &[String],
        timeout: Duration,
    ) -> Result<Vec<WindowId>, ActivityError> {
        let created: Arc<Mutex<Vec<WindowId>>> = Arc::new(Mutex::new(Vec::new()));
        let progress = Arc::clone(&created);
        let batch = async {
            let mut ids = Vec::new();
            for window_type in window_types {
                let window_id = self.create_window(id, window_type).await?;
                progress.lock().push(window_id.clone());
                ids.push(window_id);
            }
            Ok(ids)
        };

        match tokio::time::timeout(timeout, batch).await {
            Ok(Ok(ids)) => Ok(ids),
            Ok(Err(err)) => {
                let partial = created.lock().clone();
                self.rollback_windows(id, &partial).await;
                Err(err)
            }
            Err(_) => {
                let partial = created.lock().clone();
                self.rollback_windows(id, &partial).await;
                Err(ActivityError::StackedWindowTimeout(timeout))
            }
        }
    }

    async fn rollback_windows(&self, id: &ActivityId, windows: &[WindowId]) {
        for window_id in windows {
            {
                let mut activities = self.activities.lock();
                if let Some(entry) = activities.get_mut(id) {
                    entry.windows.retain(|w| &w.id != window_id);
                }
            }
            if let Err(err) = self.windowing.close_window(window_id).await {
                tracing::warn!(window = %window_id, error = %err, "Failed to close window during rollback");
            }
            self.emit(ActivityEvent::WindowLeft {
                activity_id: id.clone(),
                window_id: window_id.clone(),
            });
        }
    }

    /// React to a window-closed notification from the windowing
    /// collaborator. A helper leaving shrinks the membership; the owner
    /// leaving ends the activity.
    pub async fn handle_window_closed(&self, window_id: &WindowId) {
        let located = {
            let activities = self.activities.lock();
            activities.iter().find_map(|(id, entry)| {
                entry
                    .windows
                    .iter()
                    .find(|w| &w.id == window_id)
                    .map(|w| (id.clone(), w.is_owner))
            })
        };
        let Some((activity_id, is_owner)) = located else {
            return;
        };

        if !is_owner {
            {
                let mut activities = self.activities.lock();
                if let Some(entry) = activities.get_mut(&activity_id) {
                    entry.windows.retain(|w| &w.id != window_id);
                }
            }
            self.emit(ActivityEvent::WindowLeft {
                activity_id,
                window_id: window_id.clone(),
            });
            return;
        }

        tracing::info!(activity = %activity_id, window = %window_id, "Owner window closed");
        self.stop(&activity_id).await;
    }

    /// Stop an activity: Stopping, close every helper window, then Stopped
    /// and removal. Operations against the id fail with `ActivityNotFound`
    /// afterwards.
    pub async fn stop(&self, id: &ActivityId) {
        if self.set_status(id, ActivityStatus::Stopping).is_err() {
            return; // already gone
        }
        let helpers: Vec<WindowId> = {
            let activities = self.activities.lock();
            activities
                .get(id)
                .map(|entry| {
                    entry
                        .windows
                        .iter()
                        .filter(|w| !w.is_owner)
                        .map(|w| w.id.clone())
                        .collect()
                })
                .unwrap_or_default()
        };
        for window_id in &helpers {
            if let Err(err) = self.windowing.close_window(window_id).await {
                tracing::warn!(window = %window_id, error = %err, "Failed to close helper window");
            }
            self.emit(ActivityEvent::WindowLeft {
                activity_id: id.clone(),
                window_id: window_id.clone(),
            });
        }
        self.finalize(id);
        tracing::info!(activity = %id, "Activity stopped");
    }

    /// Merge a partial value into the activity's bound context.
    pub fn update_context(&self, id: &ActivityId, partial: &ContextValue) -> Result<ContextUpdate, ActivityError> {
        let name = self.context_name(id)?;
        Ok(self.store.update(&name, partial)?)
    }

    /// Replace the activity's bound context wholesale.
    pub fn set_context(&self, id: &ActivityId, full: ContextValue) -> Result<ContextUpdate, ActivityError> {
        let name = self.context_name(id)?;
        Ok(self.store.set(&name, full))
    }

    /// Current value and version of the activity's bound context.
    pub fn context(&self, id: &ActivityId) -> Result<(ContextValue, u64), ActivityError> {
        let name = self.context_name(id)?;
        self.store
            .get(&name)
            .ok_or_else(|| ActivityError::ActivityNotFound(id.to_string()))
    }

    /// A view filtered to this one activity's delta stream.
    pub fn on_context_changed(&self, id: &ActivityId, handler: UpdateHandler) -> Result<Subscription, ActivityError> {
        let name = self.context_name(id)?;
        Ok(self.store.subscribe(&name, handler)?)
    }

    /// Lifecycle, membership and context-change events for every activity.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ActivityEvent> {
        self.events.subscribe()
    }

    pub fn snapshot(&self, id: &ActivityId) -> Result<ActivitySnapshot, ActivityError> {
        let activities = self.activities.lock();
        let entry = activities
            .get(id)
            .ok_or_else(|| ActivityError::ActivityNotFound(id.to_string()))?;
        Ok(ActivitySnapshot {
            id: id.clone(),
            type_name: entry.activity_type.name.clone(),
            status: entry.status,
            windows: entry.windows.clone(),
        })
    }

    pub fn status_of(&self, id: &ActivityId) -> Result<ActivityStatus, ActivityError> {
        let activities = self.activities.lock();
        activities
            .get(id)
            .map(|e| e.status)
            .ok_or_else(|| ActivityError::ActivityNotFound(id.to_string()))
    }

    pub fn list(&self) -> Vec<ActivityId> {
        self.activities.lock().keys().cloned().collect()
    }

    /// The activity a live window currently belongs to.
    pub fn window_activity(&self, window_id: &WindowId) -> Option<ActivityId> {
        let activities = self.activities.lock();
        activities.iter().find_map(|(id, entry)| {
            entry
                .windows
                .iter()
                .any(|w| &w.id == window_id)
                .then(|| id.clone())
        })
    }

    // ---- coordinator support ----------------------------------------------

    pub(crate) fn set_status(&self, id: &ActivityId, status: ActivityStatus) -> Result<ActivityStatus, ActivityError> {
        let previous = {
            let mut activities = self.activities.lock();
            let entry = activities
                .get_mut(id)
                .ok_or_else(|| ActivityError::ActivityNotFound(id.to_string()))?;
            std::mem::replace(&mut entry.status, status)
        };
        self.emit(ActivityEvent::StatusChanged {
            activity_id: id.clone(),
            status,
        });
        Ok(previous)
    }

    pub(crate) fn activity_type_of(&self, id: &ActivityId) -> Result<Arc<ActivityType>, ActivityError> {
        let activities = self.activities.lock();
        activities
            .get(id)
            .map(|e| Arc::clone(&e.activity_type))
            .ok_or_else(|| ActivityError::ActivityNotFound(id.to_string()))
    }

    pub(crate) fn windows_of(&self, id: &ActivityId) -> Result<Vec<ActivityWindow>, ActivityError> {
        let activities = self.activities.lock();
        activities
            .get(id)
            .map(|e| e.windows.clone())
            .ok_or_else(|| ActivityError::ActivityNotFound(id.to_string()))
    }

    pub(crate) fn context_name(&self, id: &ActivityId) -> Result<ContextName, ActivityError> {
        let activities = self.activities.lock();
        activities
            .get(id)
            .map(|e| e.context_name.clone())
            .ok_or_else(|| ActivityError::ActivityNotFound(id.to_string()))
    }

    /// Move every window of `source` into `target` as helpers. Returns the
    /// source's windows as they were before the move, for descriptor
    /// building and rollback.
    pub(crate) fn transfer_windows(
        &self,
        source: &ActivityId,
        target: &ActivityId,
    ) -> Result<Vec<ActivityWindow>, ActivityError> {
        let moved = {
            let mut activities = self.activities.lock();
            if !activities.contains_key(target) {
                return Err(ActivityError::ActivityNotFound(target.to_string()));
            }
            let source_entry = activities
                .get_mut(source)
                .ok_or_else(|| ActivityError::ActivityNotFound(source.to_string()))?;
            let original = std::mem::take(&mut source_entry.windows);

            let retagged: Vec<ActivityWindow> = original
                .iter()
                .map(|w| ActivityWindow {
                    id: w.id.clone(),
                    window_type: w.window_type.clone(),
                    activity: target.clone(),
                    is_owner: false,
                })
                .collect();
            match activities.get_mut(target) {
                Some(target_entry) => {
                    target_entry.windows.extend(retagged);
                    original
                }
                None => {
                    // contains_key above makes this unreachable while the
                    // lock is held; restore membership rather than panic.
                    if let Some(source_entry) = activities.get_mut(source) {
                        source_entry.windows = original;
                    }
                    return Err(ActivityError::ActivityNotFound(target.to_string()));
                }
            }
        };
        for window in &moved {
            self.emit(ActivityEvent::WindowLeft {
                activity_id: source.clone(),
                window_id: window.id.clone(),
            });
            self.emit(ActivityEvent::WindowJoined {
                activity_id: target.clone(),
                window_id: window.id.clone(),
                is_owner: false,
            });
        }
        Ok(moved)
    }

    /// Undo a transfer: give `source` its windows back and drop them from
    /// `target`. Rollback only — emits no membership events.
    pub(crate) fn restore_windows(&self, source: &ActivityId, target: &ActivityId, windows: Vec<ActivityWindow>) {
        let mut activities = self.activities.lock();
        let ids: Vec<WindowId> = windows.iter().map(|w| w.id.clone()).collect();
        if let Some(target_entry) = activities.get_mut(target) {
            target_entry.windows.retain(|w| !ids.contains(&w.id));
        }
        if let Some(source_entry) = activities.get_mut(source) {
            source_entry.windows = windows;
        }
    }

    /// Remove specific windows from an activity, returning their records.
    /// Fails without touching anything when one of them is not a member.
    pub(crate) fn remove_windows(
        &self,
        id: &ActivityId,
        window_ids: &[WindowId],
    ) -> Result<Vec<ActivityWindow>, ActivityError> {
        let removed = {
            let mut activities = self.activities.lock();
            let entry = activities
                .get_mut(id)
                .ok_or_else(|| ActivityError::ActivityNotFound(id.to_string()))?;
            for window_id in window_ids {
                if !entry.windows.iter().any(|w| &w.id == window_id) {
                    return Err(ActivityError::DetachInvalid(format!(
                        "window {window_id} is no longer a member of {id}"
                    )));
                }
            }
            let (removed, kept): (Vec<_>, Vec<_>) = entry
                .windows
                .drain(..)
                .partition(|w| window_ids.contains(&w.id));
            entry.windows = kept;
            removed
        };
        for window in &removed {
            self.emit(ActivityEvent::WindowLeft {
                activity_id: id.clone(),
                window_id: window.id.clone(),
            });
        }
        Ok(removed)
    }

    /// Remove an attach source from the registry without closing its
    /// windows — they now belong to the target.
    pub(crate) fn finalize_preserving_windows(&self, id: &ActivityId) -> Result<(), ActivityError> {
        {
            let activities = self.activities.lock();
            if !activities.contains_key(id) {
                return Err(ActivityError::ActivityNotFound(id.to_string()));
            }
        }
        self.set_status(id, ActivityStatus::Stopping)?;
        self.finalize(id);
        Ok(())
    }

    /// Insert an already-materialized activity (detach restore, clone).
    /// Windows are re-tagged to the new id; owner flags are kept as given.
    pub(crate) fn install_activity(
        &self,
        activity_type: Arc<ActivityType>,
        windows: Vec<ActivityWindow>,
        context: ContextValue,
    ) -> Result<ActivityId, ActivityError> {
        let id = ActivityId::new();
        let context_name = ContextName::for_activity(&id);
        self.store.set(&context_name, context);
        let context_sub = self.watch_context(&id, &context_name)?;

        let windows: Vec<ActivityWindow> = windows
            .into_iter()
            .map(|w| ActivityWindow {
                activity: id.clone(),
                ..w
            })
            .collect();
        let joined: Vec<(WindowId, bool)> = windows.iter().map(|w| (w.id.clone(), w.is_owner)).collect();

        self.activities.lock().insert(
            id.clone(),
            ActivityEntry {
                activity_type,
                status: ActivityStatus::Running,
                windows,
                context_name,
                context_sub,
            },
        );
        self.emit(ActivityEvent::StatusChanged {
            activity_id: id.clone(),
            status: ActivityStatus::Running,
        });
        for (window_id, is_owner) in joined {
            self.emit(ActivityEvent::WindowJoined {
                activity_id: id.clone(),
                window_id,
                is_owner,
            });
        }
        Ok(id)
    }

    pub(crate) async fn create_window_raw(&self, definition: &WindowDefinition) -> Result<WindowHandle, ActivityError> {
        Ok(self.windowing.create_window(definition).await?)
    }

    pub(crate) async fn close_window_raw(&self, id: &WindowId) {
        if let Err(err) = self.windowing.close_window(id).await {
            tracing::warn!(window = %id, error = %err, "Failed to close window");
        }
    }

    // ---- internals --------------------------------------------------------

    fn resolve_definition(&self, id: &ActivityId, window_type: &str) -> Result<WindowDefinition, ActivityError> {
        let from_type = {
            let activities = self.activities.lock();
            let entry = activities
                .get(id)
                .ok_or_else(|| ActivityError::ActivityNotFound(id.to_string()))?;
            entry.activity_type.definition_of(window_type).cloned()
        };
        if let Some(definition) = from_type {
            return Ok(definition);
        }
        self.directory
            .as_ref()
            .and_then(|d| d.resolve(window_type))
            .ok_or_else(|| ActivityError::UnknownWindowType(window_type.to_string()))
    }

    fn join_window(&self, id: &ActivityId, handle: &WindowHandle, is_owner: bool) -> Result<(), ActivityError> {
        {
            let mut activities = self.activities.lock();
            let entry = activities
                .get_mut(id)
                .ok_or_else(|| ActivityError::ActivityNotFound(id.to_string()))?;
            entry.windows.push(ActivityWindow {
                id: handle.id.clone(),
                window_type: handle.window_type.clone(),
                activity: id.clone(),
                is_owner,
            });
        }
        self.emit(ActivityEvent::WindowJoined {
            activity_id: id.clone(),
            window_id: handle.id.clone(),
            is_owner,
        });
        Ok(())
    }

    fn watch_context(&self, id: &ActivityId, name: &ContextName) -> Result<Subscription, ActivityError> {
        let events = self.events.clone();
        let activity_id = id.clone();
        let handler: UpdateHandler = Arc::new(move |update: &ContextUpdate| {
            let _ = events.send(ActivityEvent::ContextChanged {
                activity_id: activity_id.clone(),
                version: update.version,
                delta: update.delta.clone(),
            });
            Ok(())
        });
        Ok(self.store.subscribe(name, handler)?)
    }

    fn finalize(&self, id: &ActivityId) {
        let entry = self.activities.lock().remove(id);
        if let Some(entry) = entry {
            entry.context_sub.unsubscribe();
            self.store.remove(&entry.context_name);
        }
        self.emit(ActivityEvent::StatusChanged {
            activity_id: id.clone(),
            status: ActivityStatus::Stopped,
        });
    }

    pub(crate) fn emit(&self, event: ActivityEvent) {
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{obj, registry_with, MockWindowing};
    use serde_json::json;

    #[tokio::test]
    async fn initiate_reaches_running_with_single_owner() {
        let windowing = Arc::new(MockWindowing::new());
        let registry = registry_with(Arc::clone(&windowing));

        let id = registry.initiate("trade", obj(json!({"ric": "VOD.L"}))).await.unwrap();
        let snapshot = registry.snapshot(&id).unwrap();

        assert_eq!(snapshot.status, ActivityStatus::Running);
        assert_eq!(snapshot.windows.len(), 1);
        assert_eq!(snapshot.windows.iter().filter(|w| w.is_owner).count(), 1);
        assert_eq!(snapshot.owner().unwrap().window_type, "ticket");

        let (value, version) = registry.context(&id).unwrap();
        assert_eq!(version, 1);
        assert_eq!(value, obj(json!({"ric": "VOD.L"})));
    }

    #[tokio::test]
    async fn initiate_unknown_type_fails() {
        let registry = registry_with(Arc::new(MockWindowing::new()));
        let err = registry.initiate("missing", ContextValue::new()).await.unwrap_err();
        assert!(matches!(err, ActivityError::TypeNotFound(_)));
    }

    #[tokio::test]
    async fn failed_owner_creation_leaves_no_activity() {
        let windowing = Arc::new(MockWindowing::new().failing_on("ticket"));
        let registry = registry_with(Arc::clone(&windowing));

        let err = registry.initiate("trade", ContextValue::new()).await.unwrap_err();
        assert!(matches!(err, ActivityError::OwnerCreationFailed(_)));
        assert!(registry.list().is_empty());
    }

    #[tokio::test]
    async fn helper_window_joins_and_leaves() {
        let windowing = Arc::new(MockWindowing::new());
        let registry = registry_with(Arc::clone(&windowing));
        let id = registry.initiate("trade", ContextValue::new()).await.unwrap();

        let chart = registry.create_window(&id, "chart").await.unwrap();
        assert_eq!(registry.snapshot(&id).unwrap().windows.len(), 2);
        assert_eq!(registry.window_activity(&chart), Some(id.clone()));

        registry.handle_window_closed(&chart).await;
        let snapshot = registry.snapshot(&id).unwrap();
        assert_eq!(snapshot.status, ActivityStatus::Running);
        assert_eq!(snapshot.windows.len(), 1);
    }

    #[tokio::test]
    async fn unknown_window_type_is_rejected() {
        let registry = registry_with(Arc::new(MockWindowing::new()));
        let id = registry.initiate("trade", ContextValue::new()).await.unwrap();
        let err = registry.create_window(&id, "news").await.unwrap_err();
        assert!(matches!(err, ActivityError::UnknownWindowType(_)));
    }

    #[tokio::test]
    async fn owner_close_stops_activity_and_closes_helpers() {
        let windowing = Arc::new(MockWindowing::new());
        let registry = registry_with(Arc::clone(&windowing));
        let id = registry.initiate("trade", ContextValue::new()).await.unwrap();
        let mut events = registry.subscribe_events();

        let chart = registry.create_window(&id, "chart").await.unwrap();
        let blotter = registry.create_window(&id, "blotter").await.unwrap();
        let owner = registry.snapshot(&id).unwrap().owner().unwrap().id.clone();

        registry.handle_window_closed(&owner).await;

        let closed = windowing.closed.lock().clone();
        assert!(closed.contains(&chart));
        assert!(closed.contains(&blotter));

        let err = registry.update_context(&id, &obj(json!({"x": 1}))).unwrap_err();
        assert!(matches!(err, ActivityError::ActivityNotFound(_)));
        assert!(registry.snapshot(&id).is_err());

        let mut saw_stopping = false;
        let mut saw_stopped = false;
        while let Ok(event) = events.try_recv() {
            if let ActivityEvent::StatusChanged { status, .. } = event {
                saw_stopping |= status == ActivityStatus::Stopping;
                saw_stopped |= status == ActivityStatus::Stopped;
            }
        }
        assert!(saw_stopping && saw_stopped);
    }

    #[tokio::test]
    async fn context_update_delegates_to_store() {
        let registry = registry_with(Arc::new(MockWindowing::new()));
        let id = registry.initiate("trade", obj(json!({"font": 10}))).await.unwrap();

        let update = registry.update_context(&id, &obj(json!({"font": 11}))).unwrap();
        assert_eq!(update.delta.updated, obj(json!({"font": 11})));

        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = registry
            .on_context_changed(
                &id,
                Arc::new(move |u| {
                    sink.lock().push(u.clone());
                    Ok(())
                }),
            )
            .unwrap();
        assert!(seen.lock()[0].delta.is_reset(), "late joiner gets snapshot");
    }

    #[tokio::test]
    async fn context_changed_events_flow_through_registry_stream() {
        let registry = registry_with(Arc::new(MockWindowing::new()));
        let id = registry.initiate("trade", obj(json!({"a": 1}))).await.unwrap();
        let mut events = registry.subscribe_events();

        registry.update_context(&id, &obj(json!({"a": 2}))).unwrap();

        let mut versions = Vec::new();
        while let Ok(event) = events.try_recv() {
            if let ActivityEvent::ContextChanged { activity_id, version, .. } = event {
                assert_eq!(activity_id, id);
                versions.push(version);
            }
        }
        assert_eq!(versions, vec![2]);
    }

    #[tokio::test(start_paused = true)]
    async fn stacked_windows_roll_back_on_timeout() {
        let windowing = Arc::new(MockWindowing::new());
        let registry = registry_with(Arc::clone(&windowing));
        let id = registry.initiate("trade", ContextValue::new()).await.unwrap();

        *windowing.delay.lock() = Some(Duration::from_secs(10));
        let err = registry
            .create_stacked_windows(
                &id,
                &["chart".to_string(), "blotter".to_string()],
                Duration::from_secs(15),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::StackedWindowTimeout(_)));

        // Only the owner window remains a member.
        let snapshot = registry.snapshot(&id).unwrap();
        assert_eq!(snapshot.windows.len(), 1);
        assert!(snapshot.windows[0].is_owner);
    }

    #[tokio::test]
    async fn stacked_windows_roll_back_on_failure() {
        let windowing = Arc::new(MockWindowing::new().failing_on("blotter"));
        let registry = registry_with(Arc::clone(&windowing));
        let id = registry.initiate("trade", ContextValue::new()).await.unwrap();

        let err = registry
            .create_stacked_windows(
                &id,
                &["chart".to_string(), "blotter".to_string()],
                Duration::from_secs(5),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ActivityError::Windowing(_)));

        let snapshot = registry.snapshot(&id).unwrap();
        assert_eq!(snapshot.windows.len(), 1, "chart was rolled back");
        assert_eq!(windowing.closed.lock().len(), 1);
    }

    #[tokio::test]
    async fn stacked_windows_succeed_within_timeout() {
        let windowing = Arc::new(MockWindowing::new());
        let registry = registry_with(Arc::clone(&windowing));
        let id = registry.initiate("trade", ContextValue::new()).await.unwrap();

        let ids = registry
            .create_stacked_windows(
                &id,
                &["chart".to_string(), "blotter".to_string()],
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(ids.len(), 2);
        assert_eq!(registry.snapshot(&id).unwrap().windows.len(), 3);
    }

    #[tokio::test]
    async fn directory_resolves_types_the_activity_does_not_declare() {
        struct Directory;
        impl AppDirectory for Directory {
            fn resolve(&self, window_type: &str) -> Option<WindowDefinition> {
                (window_type == "news").then(|| WindowDefinition::new("news"))
            }
        }

        let windowing = Arc::new(MockWindowing::new());
        let (envelope_tx, _) = tokio::sync::broadcast::channel(64);
        let (event_tx, _) = tokio::sync::broadcast::channel(64);
        let store = Arc::new(ContextStore::new(lattice_core::PeerId::new(), envelope_tx));
        let registry = ActivityRegistry::new(store, windowing, event_tx).with_directory(Arc::new(Directory));
        registry.register_type(ActivityType::new("trade", WindowDefinition::new("ticket")));

        let id = registry.initiate("trade", ContextValue::new()).await.unwrap();
        registry.create_window(&id, "news").await.unwrap();
        assert_eq!(registry.snapshot(&id).unwrap().windows.len(), 2);

        let err = registry.create_window(&id, "weather").await.unwrap_err();
        assert!(matches!(err, ActivityError::UnknownWindowType(_)));
    }

    #[tokio::test]
    async fn unregister_type_keeps_running_instances() {
        let registry = registry_with(Arc::new(MockWindowing::new()));
        let id = registry.initiate("trade", ContextValue::new()).await.unwrap();

        assert!(registry.unregister_type("trade"));
        assert!(registry.type_of("trade").is_none());

        // The live instance still works off its own reference.
        assert_eq!(registry.status_of(&id).unwrap(), ActivityStatus::Running);
        registry.create_window(&id, "chart").await.unwrap();
    }
}
