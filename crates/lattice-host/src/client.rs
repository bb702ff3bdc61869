use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message as WsMessage, WebSocket};
use dashmap::DashMap;
use futures::{SinkExt, StreamExt};
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use lattice_core::{ContextName, WindowId};

const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(30);
const CLIENT_TIMEOUT: Duration = Duration::from_secs(90);

/// Unique identifier of one connected window process.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ClientId(pub String);

impl Default for ClientId {
    fn default() -> Self {
        Self(format!("client_{}", Uuid::now_v7()))
    }
}

impl ClientId {
    pub fn new() -> Self {
        Self::default()
    }
}

impl std::fmt::Display for ClientId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A connected window client: its announced window, the context names it
/// subscribed to, and the send queue feeding its WebSocket.
pub struct Client {
    pub id: ClientId,
    pub window_id: Option<WindowId>,
    pub subscriptions: HashSet<ContextName>,
    pub tx: mpsc::Sender<String>,
    pub connected: AtomicBool,
    pub last_pong: AtomicU64,
}

impl Client {
    fn new(id: ClientId, tx: mpsc::Sender<String>) -> Self {
        Self {
            id,
            window_id: None,
            subscriptions: HashSet::new(),
            tx,
            connected: AtomicBool::new(true),
            last_pong: AtomicU64::new(now_secs()),
        }
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::Relaxed)
    }

    pub fn record_pong(&self) {
        self.last_pong.store(now_secs(), Ordering::Relaxed);
    }

    pub fn is_alive(&self) -> bool {
        let last = self.last_pong.load(Ordering::Relaxed);
        now_secs().saturating_sub(last) < CLIENT_TIMEOUT.as_secs()
    }
}

fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

/// Registry of every connected window client.
pub struct WindowClientRegistry {
    clients: DashMap<ClientId, Arc<Mutex<Client>>>,
    max_send_queue: usize,
}

impl WindowClientRegistry {
    pub fn new(max_send_queue: usize) -> Self {
        Self {
            clients: DashMap::new(),
            max_send_queue,
        }
    }

    /// Register a new client and return its ID + receive side of the queue.
    pub fn register(&self) -> (ClientId, mpsc::Receiver<String>) {
        let id = ClientId::new();
        let (tx, rx) = mpsc::channel(self.max_send_queue);
        let client = Arc::new(Mutex::new(Client::new(id.clone(), tx)));
        self.clients.insert(id.clone(), client);
        (id, rx)
    }

    /// Remove a client by ID.
    pub fn unregister(&self, id: &ClientId) {
        if let Some((_, client)) = self.clients.remove(id) {
            if let Ok(c) = client.try_lock() {
                c.connected.store(false, Ordering::Relaxed);
            }
        }
    }

    /// Record which window this client speaks for.
    pub async fn bind_window(&self, client_id: &ClientId, window_id: WindowId) {
        if let Some(client) = self.clients.get(client_id) {
            client.lock().await.window_id = Some(window_id);
        }
    }

    /// The window a client announced, if any.
    pub async fn window_of(&self, client_id: &ClientId) -> Option<WindowId> {
        match self.clients.get(client_id) {
            Some(client) => client.lock().await.window_id.clone(),
            None => None,
        }
    }

    /// Add a context name to the client's subscription set. Returns false
    /// when it was already subscribed.
    pub async fn add_subscription(&self, client_id: &ClientId, name: ContextName) -> bool {
        match self.clients.get(client_id) {
            Some(client) => client.lock().await.subscriptions.insert(name),
            None => false,
        }
    }

    /// Remove a context name from the subscription set. Idempotent.
    pub async fn remove_subscription(&self, client_id: &ClientId, name: &ContextName) -> bool {
        match self.clients.get(client_id) {
            Some(client) => client.lock().await.subscriptions.remove(name),
            None => false,
        }
    }

    /// Send a message to one client. A full queue drops the message with a
    /// warning rather than blocking the caller.
    pub async fn send_to(&self, client_id: &ClientId, message: String) -> bool {
        if let Some(client) = self.clients.get(client_id) {
            let tx = client.lock().await.tx.clone();
            match tx.try_send(message) {
                Ok(()) => true,
                Err(mpsc::error::TrySendError::Full(msg)) => {
                    tracing::warn!(
                        client_id = %client_id,
                        msg_len = msg.len(),
                        "Send queue full, dropping message"
                    );
                    false
                }
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        } else {
            false
        }
    }

    /// Fan a message out to every client subscribed to the context name.
    /// Returns the number of clients reached.
    pub fn broadcast_to_context(&self, name: &ContextName, message: &str) -> usize {
        let mut reached = 0;
        for entry in self.clients.iter() {
            if let Ok(client) = entry.value().try_lock() {
                if client.subscriptions.contains(name) && client.is_connected() {
                    if client.tx.try_send(message.to_string()).is_ok() {
                        reached += 1;
                    }
                }
            }
        }
        reached
    }

    /// Send a message to every connected client. Returns the number reached.
    pub fn broadcast_all(&self, message: &str) -> usize {
        let mut reached = 0;
        for entry in self.clients.iter() {
            if let Ok(client) = entry.value().try_lock() {
                if client.is_connected() && client.tx.try_send(message.to_string()).is_ok() {
                    reached += 1;
                }
            }
        }
        reached
    }

    /// Number of connected clients.
    pub fn count(&self) -> usize {
        self.clients.len()
    }

    /// Remove clients that haven't responded to pings within the timeout.
    pub fn cleanup_dead_clients(&self) -> usize {
        let dead: Vec<ClientId> = self
            .clients
            .iter()
            .filter_map(|entry| {
                if let Ok(client) = entry.value().try_lock() {
                    if !client.is_alive() {
                        return Some(client.id.clone());
                    }
                }
                None
            })
            .collect();

        let mut removed = 0;
        for id in dead {
            self.unregister(&id);
            removed += 1;
            tracing::info!(client_id = %id, "Cleaned up dead client");
        }
        removed
    }

    pub(crate) fn get(&self, id: &ClientId) -> Option<Arc<Mutex<Client>>> {
        self.clients.get(id).map(|e| Arc::clone(e.value()))
    }
}

/// Handle a WebSocket connection: split into reader/writer, manage lifecycle
/// with heartbeat pings.
pub async fn handle_ws_connection(
    socket: WebSocket,
    client_id: ClientId,
    mut rx: mpsc::Receiver<String>,
    registry: Arc<WindowClientRegistry>,
    on_message: mpsc::Sender<(ClientId, String)>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer task: forward queued messages + periodic ping
    let writer_cid = client_id.clone();
    let writer_registry = Arc::clone(&registry);
    let writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(HEARTBEAT_INTERVAL);
        ping_interval.tick().await; // consume first immediate tick

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(vec![].into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(client_id = %writer_cid, "Sent ping");
                }
            }
        }

        if let Some(client) = writer_registry.get(&writer_cid) {
            if let Ok(c) = client.try_lock() {
                c.connected.store(false, Ordering::Relaxed);
            }
        }
    });

    // Reader task: forward messages to the dispatcher, track pongs
    let reader_cid = client_id.clone();
    let reader_registry = Arc::clone(&registry);
    let reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Text(text) => {
                    let _ = on_message.send((reader_cid.clone(), text.to_string())).await;
                }
                WsMessage::Pong(_) => {
                    if let Some(client) = reader_registry.get(&reader_cid) {
                        if let Ok(c) = client.try_lock() {
                            c.record_pong();
                        }
                    }
                }
                WsMessage::Close(_) => break,
                WsMessage::Ping(_) => {} // axum answers pongs automatically
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = writer => {},
        _ = reader => {},
    }

    registry.unregister(&client_id);
}

/// Start a background task that periodically cleans up dead clients.
pub fn start_cleanup_task(
    registry: Arc<WindowClientRegistry>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let removed = registry.cleanup_dead_clients();
            if removed > 0 {
                tracing::info!(removed = removed, "Dead client cleanup");
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_id_unique() {
        let a = ClientId::new();
        let b = ClientId::new();
        assert_ne!(a, b);
        assert!(a.0.starts_with("client_"));
    }

    #[test]
    fn registry_register_and_unregister() {
        let registry = WindowClientRegistry::new(32);
        assert_eq!(registry.count(), 0);

        let (id1, _rx1) = registry.register();
        let (id2, _rx2) = registry.register();
        assert_eq!(registry.count(), 2);

        registry.unregister(&id1);
        assert_eq!(registry.count(), 1);
        registry.unregister(&id2);
        assert_eq!(registry.count(), 0);
    }

    #[tokio::test]
    async fn bind_and_lookup_window() {
        let registry = WindowClientRegistry::new(32);
        let (id, _rx) = registry.register();
        let window = WindowId::new();

        registry.bind_window(&id, window.clone()).await;
        assert_eq!(registry.window_of(&id).await, Some(window));
        assert_eq!(registry.window_of(&ClientId::new()).await, None);
    }

    #[tokio::test]
    async fn broadcast_reaches_only_subscribers() {
        let registry = WindowClientRegistry::new(32);
        let (id1, mut rx1) = registry.register();
        let (id2, mut rx2) = registry.register();
        let (_id3, mut rx3) = registry.register();

        let theme = ContextName::from("theme");
        assert!(registry.add_subscription(&id1, theme.clone()).await);
        assert!(registry.add_subscription(&id2, theme.clone()).await);

        let reached = registry.broadcast_to_context(&theme, "hello");
        assert_eq!(reached, 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
        assert!(rx3.try_recv().is_err());
    }

    #[tokio::test]
    async fn subscription_set_is_idempotent() {
        let registry = WindowClientRegistry::new(32);
        let (id, _rx) = registry.register();
        let theme = ContextName::from("theme");

        assert!(registry.add_subscription(&id, theme.clone()).await);
        assert!(!registry.add_subscription(&id, theme.clone()).await);
        assert!(registry.remove_subscription(&id, &theme).await);
        assert!(!registry.remove_subscription(&id, &theme).await);
    }

    #[tokio::test]
    async fn send_to_full_queue_drops() {
        let registry = WindowClientRegistry::new(2);
        let (id, _rx) = registry.register();

        assert!(registry.send_to(&id, "msg1".into()).await);
        assert!(registry.send_to(&id, "msg2".into()).await);
        assert!(!registry.send_to(&id, "msg3".into()).await);
    }

    #[tokio::test]
    async fn broadcast_all_counts_reached() {
        let registry = WindowClientRegistry::new(8);
        let (_id1, mut rx1) = registry.register();
        let (_id2, mut rx2) = registry.register();

        assert_eq!(registry.broadcast_all("shell directive"), 2);
        assert!(rx1.try_recv().is_ok());
        assert!(rx2.try_recv().is_ok());
    }

    #[test]
    fn cleanup_dead_clients_removes_expired() {
        let registry = WindowClientRegistry::new(32);
        let (id, _rx) = registry.register();

        if let Some(client) = registry.get(&id) {
            if let Ok(c) = client.try_lock() {
                c.last_pong.store(0, Ordering::Relaxed);
            }
        }

        assert_eq!(registry.cleanup_dead_clients(), 1);
        assert_eq!(registry.count(), 0);
    }
}
