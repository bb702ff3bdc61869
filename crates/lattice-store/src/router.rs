use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::broadcast;

use lattice_core::{ContextDelta, ContextName, SubscriberId};

/// One delivered change: the delta that moved the named context to `version`.
#[derive(Clone, Debug)]
pub struct ContextUpdate {
    pub name: ContextName,
    pub version: u64,
    pub delta: ContextDelta,
}

pub type HandlerResult = Result<(), Box<dyn std::error::Error + Send + Sync>>;

/// A subscriber callback. Invoked synchronously on the mutating call, so it
/// must not issue store mutations inline — spawn a task for follow-up writes.
pub type UpdateHandler = Arc<dyn Fn(&ContextUpdate) -> HandlerResult + Send + Sync>;

/// A handler failure, reported on the side error channel and never
/// propagated to the mutator or to other subscribers.
#[derive(Clone, Debug)]
pub struct SubscriberFailure {
    pub name: ContextName,
    pub subscriber: SubscriberId,
    pub version: u64,
    pub error: String,
}

struct SubscriberEntry {
    id: SubscriberId,
    handler: UpdateHandler,
}

/// Per-context ordered subscriber lists. Fan-out order is registration
/// order. Delivery iterates a snapshot of the list, so unsubscribing during
/// an in-flight delivery takes effect after the current fan-out — no skipped
/// or duplicated notifications.
pub struct SubscriptionRouter {
    subscribers: Mutex<HashMap<ContextName, Vec<SubscriberEntry>>>,
    failures: broadcast::Sender<SubscriberFailure>,
}

impl SubscriptionRouter {
    pub fn new() -> Self {
        let (failures, _) = broadcast::channel(256);
        Self {
            subscribers: Mutex::new(HashMap::new()),
            failures,
        }
    }

    /// Append a handler to the named context's list. FIFO position is final.
    pub fn register(&self, name: &ContextName, handler: UpdateHandler) -> SubscriberId {
        let id = SubscriberId::new();
        let mut subscribers = self.subscribers.lock();
        subscribers.entry(name.clone()).or_default().push(SubscriberEntry {
            id: id.clone(),
            handler,
        });
        id
    }

    /// Remove a handler. Returns false when it was already gone.
    pub fn unregister(&self, name: &ContextName, id: &SubscriberId) -> bool {
        let mut subscribers = self.subscribers.lock();
        match subscribers.get_mut(name) {
            Some(entries) => {
                let before = entries.len();
                entries.retain(|e| &e.id != id);
                before != entries.len()
            }
            None => false,
        }
    }

    /// Deliver one update to every current subscriber, in registration
    /// order, isolating handler failures.
    pub fn deliver(&self, update: &ContextUpdate) {
        let snapshot: Vec<(SubscriberId, UpdateHandler)> = {
            let subscribers = self.subscribers.lock();
            match subscribers.get(&update.name) {
                Some(entries) => entries
                    .iter()
                    .map(|e| (e.id.clone(), Arc::clone(&e.handler)))
                    .collect(),
                None => return,
            }
        };

        for (id, handler) in snapshot {
            if let Err(error) = handler(update) {
                self.report_failure(&update.name, &id, update.version, error.to_string());
            }
        }
    }

    /// Deliver to a single subscriber only — the synthetic snapshot a late
    /// joiner receives at subscribe time.
    pub fn deliver_to(&self, id: &SubscriberId, handler: &UpdateHandler, update: &ContextUpdate) {
        if let Err(error) = handler(update) {
            self.report_failure(&update.name, id, update.version, error.to_string());
        }
    }

    fn report_failure(&self, name: &ContextName, id: &SubscriberId, version: u64, error: String) {
        tracing::warn!(
            context = %name,
            subscriber = %id,
            version = version,
            error = %error,
            "Subscriber handler failed"
        );
        let _ = self.failures.send(SubscriberFailure {
            name: name.clone(),
            subscriber: id.clone(),
            version,
            error,
        });
    }

    /// Subscribe to handler-failure reports.
    pub fn failures(&self) -> broadcast::Receiver<SubscriberFailure> {
        self.failures.subscribe()
    }

    /// Number of subscribers for one context name.
    pub fn count(&self, name: &ContextName) -> usize {
        self.subscribers.lock().get(name).map_or(0, |e| e.len())
    }
}

impl Default for SubscriptionRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn update(name: &str, version: u64) -> ContextUpdate {
        ContextUpdate {
            name: ContextName::from(name),
            version,
            delta: ContextDelta::default(),
        }
    }

    fn counting_handler(counter: Arc<AtomicUsize>) -> UpdateHandler {
        Arc::new(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok(())
        })
    }

    #[test]
    fn delivers_in_registration_order() {
        let router = SubscriptionRouter::new();
        let name = ContextName::from("theme");
        let order = Arc::new(Mutex::new(Vec::new()));

        for tag in ["first", "second", "third"] {
            let order = Arc::clone(&order);
            router.register(
                &name,
                Arc::new(move |_| {
                    order.lock().push(tag);
                    Ok(())
                }),
            );
        }

        router.deliver(&update("theme", 1));
        assert_eq!(*order.lock(), vec!["first", "second", "third"]);
    }

    #[test]
    fn failing_handler_does_not_block_later_subscribers() {
        let router = SubscriptionRouter::new();
        let name = ContextName::from("theme");
        let mut failures = router.failures();

        let delivered = Arc::new(AtomicUsize::new(0));
        router.register(&name, Arc::new(|_| Err("boom".into())));
        router.register(&name, counting_handler(Arc::clone(&delivered)));

        router.deliver(&update("theme", 1));
        assert_eq!(delivered.load(Ordering::SeqCst), 1);

        let failure = failures.try_recv().unwrap();
        assert_eq!(failure.version, 1);
        assert!(failure.error.contains("boom"));
    }

    #[test]
    fn unregister_removes_handler() {
        let router = SubscriptionRouter::new();
        let name = ContextName::from("theme");
        let delivered = Arc::new(AtomicUsize::new(0));

        let id = router.register(&name, counting_handler(Arc::clone(&delivered)));
        router.deliver(&update("theme", 1));
        assert!(router.unregister(&name, &id));
        router.deliver(&update("theme", 2));

        assert_eq!(delivered.load(Ordering::SeqCst), 1);
        assert!(!router.unregister(&name, &id), "second unregister is a no-op");
    }

    #[test]
    fn unsubscribe_during_delivery_is_deferred() {
        let router = Arc::new(SubscriptionRouter::new());
        let name = ContextName::from("theme");
        let later = Arc::new(AtomicUsize::new(0));

        // First handler unregisters the second mid-fan-out; the snapshot
        // already taken must still deliver to it.
        let later_id = Arc::new(Mutex::new(None::<SubscriberId>));
        let handle = Arc::clone(&router);
        let target = name.clone();
        let victim = Arc::clone(&later_id);
        router.register(
            &name,
            Arc::new(move |_| {
                if let Some(id) = victim.lock().as_ref() {
                    handle.unregister(&target, id);
                }
                Ok(())
            }),
        );
        let id = router.register(&name, counting_handler(Arc::clone(&later)));
        *later_id.lock() = Some(id);

        router.deliver(&update("theme", 1));
        assert_eq!(later.load(Ordering::SeqCst), 1, "in-flight delivery still arrives");

        router.deliver(&update("theme", 2));
        assert_eq!(later.load(Ordering::SeqCst), 1, "removal applies to the next fan-out");
    }

    #[test]
    fn count_per_context() {
        let router = SubscriptionRouter::new();
        let theme = ContextName::from("theme");
        let prices = ContextName::from("prices");

        router.register(&theme, Arc::new(|_| Ok(())));
        router.register(&theme, Arc::new(|_| Ok(())));
        router.register(&prices, Arc::new(|_| Ok(())));

        assert_eq!(router.count(&theme), 2);
        assert_eq!(router.count(&prices), 1);
        assert_eq!(router.count(&ContextName::from("missing")), 0);
    }
}
