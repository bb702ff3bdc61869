use std::sync::Arc;

use serde::Serialize;
use tokio::sync::broadcast;

use lattice_core::{ActivityEvent, ContextDelta, ContextName, Envelope, PeerId};
use lattice_store::{ContextStore, ContextUpdate, StoreError};

use crate::client::WindowClientRegistry;

/// Subscribes to the store's envelope broadcast and forwards each delta to
/// the window clients subscribed to that context name.
pub struct DeltaBridge {
    registry: Arc<WindowClientRegistry>,
}

#[derive(Serialize)]
struct WireDelta<'a> {
    #[serde(rename = "type")]
    kind: &'static str,
    name: &'a ContextName,
    version: u64,
    delta: &'a ContextDelta,
    sender: &'a PeerId,
}

impl DeltaBridge {
    pub fn new(registry: Arc<WindowClientRegistry>) -> Self {
        Self { registry }
    }

    /// Start the bridge. Spawns a task that reads from the broadcast channel
    /// and fans serialized deltas out to subscribed clients.
    pub fn start(&self, mut rx: broadcast::Receiver<Envelope>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::clone(&self.registry);

        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(envelope) => {
                        if let Some(json) = serialize_envelope(&envelope) {
                            let reached = registry.broadcast_to_context(&envelope.name, &json);
                            tracing::trace!(
                                context = %envelope.name,
                                version = envelope.version,
                                reached = reached,
                                "Delta fanned out"
                            );
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!(skipped = n, "Delta bridge lagged, dropped envelopes");
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        tracing::info!("Delta bridge channel closed");
                        break;
                    }
                }
            }
        })
    }
}

/// Create a delta bridge wired to a broadcast channel.
pub fn create_bridge(
    registry: Arc<WindowClientRegistry>,
    rx: broadcast::Receiver<Envelope>,
) -> tokio::task::JoinHandle<()> {
    let bridge = DeltaBridge::new(registry);
    bridge.start(rx)
}

/// Serialize an envelope to its wire form.
pub fn serialize_envelope(envelope: &Envelope) -> Option<String> {
    serde_json::to_string(&WireDelta {
        kind: "context_delta",
        name: &envelope.name,
        version: envelope.version,
        delta: &envelope.delta,
        sender: &envelope.sender,
    })
    .ok()
}

/// Forward activity lifecycle events (status changes, membership, attach/
/// detach) to every connected client. Shells and interested windows filter
/// by activity id on their side.
pub fn create_activity_bridge(
    registry: Arc<WindowClientRegistry>,
    mut rx: broadcast::Receiver<ActivityEvent>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match rx.recv().await {
                Ok(event) => {
                    if let Ok(json) = serde_json::to_string(&event) {
                        registry.broadcast_all(&json);
                    }
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    tracing::warn!(skipped = n, "Activity bridge lagged, dropped events");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    })
}

/// Reconcile an envelope arriving from a peer host into the local store.
/// A diverged view surfaces as `NeedsResync`; the caller answers with a
/// snapshot request rather than guessing.
pub fn ingest_remote(store: &ContextStore, envelope: &Envelope) -> Result<Option<ContextUpdate>, StoreError> {
    match store.apply_remote(envelope) {
        Ok(applied) => Ok(applied),
        Err(err) if err.is_resync() => {
            tracing::warn!(
                context = %envelope.name,
                version = envelope.version,
                error = %err,
                "Remote delta rejected, snapshot needed"
            );
            Err(err)
        }
        Err(err) => Err(err),
    }
}
