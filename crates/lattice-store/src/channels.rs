use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;

use lattice_core::{ContextName, ContextValue, WindowId};

use crate::error::StoreError;
use crate::router::UpdateHandler;
use crate::store::{ContextStore, Subscription};

/// Ad-hoc, user-selectable shared contexts. A window belongs to at most one
/// channel at a time; publishing updates the channel's context and fans out
/// to every window currently joined to it through the normal subscription
/// path.
pub struct ChannelRegistry {
    store: Arc<ContextStore>,
    members: Mutex<HashMap<WindowId, String>>,
}

impl ChannelRegistry {
    pub fn new(store: Arc<ContextStore>) -> Self {
        Self {
            store,
            members: Mutex::new(HashMap::new()),
        }
    }

    /// Join a channel, implicitly leaving the previous one. Creates the
    /// channel's context on first join.
    pub fn join(&self, window: &WindowId, channel: &str) -> ContextName {
        let name = ContextName::for_channel(channel);
        self.store.ensure(&name);
        let mut members = self.members.lock();
        let previous = members.insert(window.clone(), channel.to_string());
        if let Some(previous) = previous.filter(|p| p != channel) {
            tracing::debug!(window = %window, from = %previous, to = %channel, "Window switched channel");
        }
        name
    }

    /// Leave the current channel, if any. Returns the channel left.
    pub fn leave(&self, window: &WindowId) -> Option<String> {
        self.members.lock().remove(window)
    }

    /// The channel this window is currently joined to.
    pub fn channel_of(&self, window: &WindowId) -> Option<String> {
        self.members.lock().get(window).cloned()
    }

    /// Windows currently joined to a channel.
    pub fn members_of(&self, channel: &str) -> Vec<WindowId> {
        self.members
            .lock()
            .iter()
            .filter(|(_, c)| c.as_str() == channel)
            .map(|(w, _)| w.clone())
            .collect()
    }

    /// Publish data into the window's current channel.
    pub fn publish(
        &self,
        window: &WindowId,
        data: &ContextValue,
    ) -> Result<crate::router::ContextUpdate, StoreError> {
        let channel = self
            .channel_of(window)
            .ok_or_else(|| StoreError::NotJoined(window.to_string()))?;
        self.store.update(&ContextName::for_channel(&channel), data)
    }

    /// Snapshot of the current channel's value and version.
    pub fn current(&self, window: &WindowId) -> Result<(ContextValue, u64), StoreError> {
        let channel = self
            .channel_of(window)
            .ok_or_else(|| StoreError::NotJoined(window.to_string()))?;
        let name = ContextName::for_channel(&channel);
        self.store
            .get(&name)
            .ok_or_else(|| StoreError::ContextNotFound(name.to_string()))
    }

    /// Stream changes of the window's current channel. First delivery is the
    /// usual synthetic reset snapshot.
    pub fn changed(&self, window: &WindowId, handler: UpdateHandler) -> Result<Subscription, StoreError> {
        let channel = self
            .channel_of(window)
            .ok_or_else(|| StoreError::NotJoined(window.to_string()))?;
        self.store.subscribe(&ContextName::for_channel(&channel), handler)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use lattice_core::PeerId;
    use parking_lot::Mutex as PlMutex;
    use serde_json::json;
    use tokio::sync::broadcast;

    fn obj(v: serde_json::Value) -> ContextValue {
        match v {
            serde_json::Value::Object(m) => m,
            other => panic!("not an object: {other}"),
        }
    }

    fn registry() -> ChannelRegistry {
        let (tx, _) = broadcast::channel(64);
        ChannelRegistry::new(Arc::new(ContextStore::new(PeerId::new(), tx)))
    }

    #[test]
    fn join_creates_channel_context() {
        let channels = registry();
        let window = WindowId::new();
        let name = channels.join(&window, "red");
        assert_eq!(name.as_str(), "channel/red");
        assert_eq!(channels.channel_of(&window).as_deref(), Some("red"));
    }

    #[test]
    fn one_channel_per_window() {
        let channels = registry();
        let window = WindowId::new();
        channels.join(&window, "red");
        channels.join(&window, "blue");

        assert_eq!(channels.channel_of(&window).as_deref(), Some("blue"));
        assert!(channels.members_of("red").is_empty());
        assert_eq!(channels.members_of("blue"), vec![window]);
    }

    #[test]
    fn publish_requires_membership() {
        let channels = registry();
        let window = WindowId::new();
        let err = channels.publish(&window, &obj(json!({"x": 1}))).unwrap_err();
        assert!(matches!(err, StoreError::NotJoined(_)));
    }

    #[test]
    fn publish_fans_out_to_joined_windows() {
        let channels = registry();
        let publisher = WindowId::new();
        let listener = WindowId::new();
        channels.join(&publisher, "red");
        channels.join(&listener, "red");

        let seen = Arc::new(PlMutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let _sub = channels
            .changed(
                &listener,
                Arc::new(move |u| {
                    sink.lock().push(u.clone());
                    Ok(())
                }),
            )
            .unwrap();

        channels.publish(&publisher, &obj(json!({"ric": "VOD.L"}))).unwrap();

        let seen = seen.lock();
        assert_eq!(seen.len(), 2); // reset snapshot + published delta
        assert!(seen[0].delta.is_reset());
        assert_eq!(seen[1].delta.added, obj(json!({"ric": "VOD.L"})));
    }

    #[test]
    fn current_reflects_published_state() {
        let channels = registry();
        let window = WindowId::new();
        channels.join(&window, "red");
        channels.publish(&window, &obj(json!({"ric": "VOD.L"}))).unwrap();

        let (value, version) = channels.current(&window).unwrap();
        assert_eq!(version, 1);
        assert_eq!(value, obj(json!({"ric": "VOD.L"})));
    }

    #[test]
    fn leave_then_publish_fails() {
        let channels = registry();
        let window = WindowId::new();
        channels.join(&window, "red");
        assert_eq!(channels.leave(&window).as_deref(), Some("red"));
        assert!(channels.leave(&window).is_none());

        let err = channels.publish(&window, &obj(json!({"x": 1}))).unwrap_err();
        assert!(matches!(err, StoreError::NotJoined(_)));
    }

    #[test]
    fn channel_state_survives_members_leaving() {
        let channels = registry();
        let window = WindowId::new();
        channels.join(&window, "red");
        channels.publish(&window, &obj(json!({"ric": "VOD.L"}))).unwrap();
        channels.leave(&window);

        let rejoined = WindowId::new();
        channels.join(&rejoined, "red");
        let (value, _) = channels.current(&rejoined).unwrap();
        assert_eq!(value, obj(json!({"ric": "VOD.L"})));
    }
}
