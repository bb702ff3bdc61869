use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use lattice_core::{
    apply, diff, merge, ContextDelta, ContextName, ContextValue, Envelope, PeerId, Snapshot,
    SubscriberId,
};

use crate::error::StoreError;
use crate::router::{ContextUpdate, SubscriptionRouter, UpdateHandler};

struct ContextEntry {
    value: ContextValue,
    version: u64,
}

/// Process-wide table of named contexts. The sole mutator of authoritative
/// context values: every other component changes context state only by
/// calling in here, which is what keeps the version/delta invariant intact.
///
/// All mutations serialize through one lock, and fan-out happens before the
/// lock is released, so a given subscriber sees versions strictly in order.
pub struct ContextStore {
    peer: PeerId,
    state: Mutex<HashMap<ContextName, ContextEntry>>,
    router: Arc<SubscriptionRouter>,
    outbound: broadcast::Sender<Envelope>,
}

/// Token returned by `subscribe`. Calling `unsubscribe` twice is a no-op.
pub struct Subscription {
    name: ContextName,
    id: SubscriberId,
    router: Arc<SubscriptionRouter>,
    active: AtomicBool,
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("active", &self.active)
            .finish()
    }
}

impl Subscription {
    fn new(name: ContextName, id: SubscriberId, router: Arc<SubscriptionRouter>) -> Self {
        Self {
            name,
            id,
            router,
            active: AtomicBool::new(true),
        }
    }

    pub fn unsubscribe(&self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.router.unregister(&self.name, &self.id);
        }
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn subscriber_id(&self) -> &SubscriberId {
        &self.id
    }
}

impl ContextStore {
    pub fn new(peer: PeerId, outbound: broadcast::Sender<Envelope>) -> Self {
        Self {
            peer,
            state: Mutex::new(HashMap::new()),
            router: Arc::new(SubscriptionRouter::new()),
            outbound,
        }
    }

    pub fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub fn router(&self) -> &Arc<SubscriptionRouter> {
        &self.router
    }

    /// Merge `partial` into the named context, creating it when absent.
    /// Last-writer-wins; use `update_checked` for optimistic concurrency.
    pub fn update(&self, name: &ContextName, partial: &ContextValue) -> Result<ContextUpdate, StoreError> {
        self.mutate(name, None, partial)
    }

    /// Merge `partial` only if the current version matches `expected`.
    pub fn update_checked(
        &self,
        name: &ContextName,
        partial: &ContextValue,
        expected: u64,
    ) -> Result<ContextUpdate, StoreError> {
        self.mutate(name, Some(expected), partial)
    }

    fn mutate(
        &self,
        name: &ContextName,
        expected: Option<u64>,
        partial: &ContextValue,
    ) -> Result<ContextUpdate, StoreError> {
        let mut state = self.state.lock();
        if let Some(expected) = expected {
            // Check before the entry is created, so a lost race against a
            // name that does not exist yet leaves no empty context behind.
            let current = state.get(name).map_or(0, |e| e.version);
            if current != expected {
                return Err(StoreError::VersionConflict {
                    name: name.to_string(),
                    expected,
                    current,
                });
            }
        }
        let entry = state
            .entry(name.clone())
            .or_insert_with(|| ContextEntry { value: ContextValue::new(), version: 0 });

        let merged = merge(&entry.value, partial);
        let delta = diff(&entry.value, &merged);
        if delta.is_empty() {
            // Nothing changed; no version bump, no fan-out.
            return Ok(ContextUpdate {
                name: name.clone(),
                version: entry.version,
                delta,
            });
        }

        entry.version += 1;
        entry.value = merged;
        let update = ContextUpdate {
            name: name.clone(),
            version: entry.version,
            delta,
        };
        self.fan_out(&update);
        Ok(update)
    }

    /// Replace the entire value. Always succeeds; the delta carries `reset`.
    pub fn set(&self, name: &ContextName, full: ContextValue) -> ContextUpdate {
        let mut state = self.state.lock();
        let entry = state
            .entry(name.clone())
            .or_insert_with(|| ContextEntry { value: ContextValue::new(), version: 0 });
        entry.version += 1;
        entry.value = full.clone();
        let update = ContextUpdate {
            name: name.clone(),
            version: entry.version,
            delta: ContextDelta::reset_of(full),
        };
        self.fan_out(&update);
        update
    }

    /// Create the named context at version 0 when absent. No fan-out.
    pub fn ensure(&self, name: &ContextName) -> bool {
        let mut state = self.state.lock();
        match state.entry(name.clone()) {
            std::collections::hash_map::Entry::Vacant(slot) => {
                slot.insert(ContextEntry { value: ContextValue::new(), version: 0 });
                true
            }
            std::collections::hash_map::Entry::Occupied(_) => false,
        }
    }

    /// Drop the named context. Subscriptions to it stay registered until
    /// unsubscribed; they simply receive nothing further.
    pub fn remove(&self, name: &ContextName) -> bool {
        self.state.lock().remove(name).is_some()
    }

    /// Current value and version, if the context exists in this view.
    pub fn get(&self, name: &ContextName) -> Option<(ContextValue, u64)> {
        let state = self.state.lock();
        state.get(name).map(|e| (e.value.clone(), e.version))
    }

    /// Every context name this process has seen.
    pub fn all(&self) -> Vec<ContextName> {
        self.state.lock().keys().cloned().collect()
    }

    /// Register a handler for the named context. The first delivery is a
    /// synthetic reset carrying the current value, so late joiners never
    /// start from a stale empty view. Fails when the name has no record —
    /// `update` auto-creates, `subscribe` does not.
    pub fn subscribe(&self, name: &ContextName, handler: UpdateHandler) -> Result<Subscription, StoreError> {
        let state = self.state.lock();
        let entry = state
            .get(name)
            .ok_or_else(|| StoreError::ContextNotFound(name.to_string()))?;
        let snapshot = ContextUpdate {
            name: name.clone(),
            version: entry.version,
            delta: ContextDelta::reset_of(entry.value.clone()),
        };
        let id = self.router.register(name, Arc::clone(&handler));
        // Deliver the snapshot while still holding the state lock: a racing
        // mutation cannot slip its delta in ahead of the reset.
        self.router.deliver_to(&id, &handler, &snapshot);
        Ok(Subscription::new(name.clone(), id, Arc::clone(&self.router)))
    }

    /// Reconcile an envelope from another process. The local table is a
    /// cache of context truth: a higher-version remote delta is applied and
    /// fanned out; a stale or echoed one is ignored. A version gap or a
    /// preimage mismatch means this view has diverged and the caller must
    /// fetch a snapshot.
    pub fn apply_remote(&self, envelope: &Envelope) -> Result<Option<ContextUpdate>, StoreError> {
        if envelope.sender == self.peer {
            return Ok(None);
        }
        let mut state = self.state.lock();
        let entry = state
            .entry(envelope.name.clone())
            .or_insert_with(|| ContextEntry { value: ContextValue::new(), version: 0 });

        if envelope.version <= entry.version {
            tracing::trace!(
                context = %envelope.name,
                remote = envelope.version,
                local = entry.version,
                "Ignoring stale remote delta"
            );
            return Ok(None);
        }
        if envelope.version != entry.version + 1 && !envelope.delta.is_reset() {
            return Err(StoreError::needs_resync(
                &envelope.name,
                format!("version gap: local {} remote {}", entry.version, envelope.version),
            ));
        }

        let next = apply(&entry.value, &envelope.delta)
            .map_err(|e| StoreError::from_delta(&envelope.name, e))?;
        entry.value = next;
        entry.version = envelope.version;
        let update = ContextUpdate {
            name: envelope.name.clone(),
            version: envelope.version,
            delta: envelope.delta.clone(),
        };
        self.deliver_local(&update);
        Ok(Some(update))
    }

    /// Force this view to an authoritative snapshot. Subscribers receive it
    /// as a reset delta.
    pub fn resync(&self, snapshot: &Snapshot) -> ContextUpdate {
        let mut state = self.state.lock();
        let entry = state
            .entry(snapshot.name.clone())
            .or_insert_with(|| ContextEntry { value: ContextValue::new(), version: 0 });
        entry.value = snapshot.value.clone();
        entry.version = snapshot.version;
        let update = ContextUpdate {
            name: snapshot.name.clone(),
            version: snapshot.version,
            delta: ContextDelta::reset_of(snapshot.value.clone()),
        };
        tracing::info!(context = %snapshot.name, version = snapshot.version, "Context resynced from snapshot");
        self.deliver_local(&update);
        update
    }

    fn fan_out(&self, update: &ContextUpdate) {
        tracing::debug!(
            context = %update.name,
            version = update.version,
            "Context mutated"
        );
        self.deliver_local(update);
        let _ = self.outbound.send(Envelope {
            name: update.name.clone(),
            version: update.version,
            delta: update.delta.clone(),
            sender: self.peer.clone(),
        });
    }

    fn deliver_local(&self, update: &ContextUpdate) {
        self.router.deliver(update);
    }
}
