use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::mpsc;

/// Outbound queue depth per socket. A slow viewer loses frames rather than
/// stalling ingest.
const QUEUE_CAPACITY: usize = 256;

/// A socket that overflows this many times in a row is evicted; its receiver
/// closes and the sender loop shuts the connection.
const MAX_CONSECUTIVE_OVERFLOWS: u32 = 32;

struct Client {
    tx: mpsc::Sender<String>,
    drop_id: i64,
    overflows: u32,
}

#[derive(Default)]
struct HubInner {
    next_id: u64,
    clients: HashMap<u64, Client>,
    /// drop_id → live subscriber count; ingest consults this to skip
    /// broadcast work entirely.
    subscribers: HashMap<i64, usize>,
}

/// Registry of live viewer sockets. Each connection subscribes to exactly one
/// drop (the default drop at connect) and can switch with a subscribe frame.
#[derive(Default)]
pub struct Hub {
    inner: Mutex<HubInner>,
}

impl Hub {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection subscribed to `drop_id`. The returned receiver
    /// feeds the socket's sender loop; when it closes the socket should too.
    pub fn register(&self, drop_id: i64) -> (u64, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(QUEUE_CAPACITY);
        let mut inner = self.inner.lock().unwrap();
        inner.next_id += 1;
        let id = inner.next_id;
        inner.clients.insert(
            id,
            Client {
                tx,
                drop_id,
                overflows: 0,
            },
        );
        *inner.subscribers.entry(drop_id).or_insert(0) += 1;
        (id, rx)
    }

    pub fn unregister(&self, client_id: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(client) = inner.clients.remove(&client_id) {
            decrement(&mut inner.subscribers, client.drop_id);
        }
    }

    /// Move a connection to another drop, swapping the refcounts.
    pub fn resubscribe(&self, client_id: u64, drop_id: i64) {
        let mut inner = self.inner.lock().unwrap();
        let Some(client) = inner.clients.get_mut(&client_id) else {
            return;
        };
        let old = client.drop_id;
        if old == drop_id {
            return;
        }
        client.drop_id = drop_id;
        decrement(&mut inner.subscribers, old);
        *inner.subscribers.entry(drop_id).or_insert(0) += 1;
    }

    pub fn has_subscribers(&self, drop_id: i64) -> bool {
        let inner = self.inner.lock().unwrap();
        inner.subscribers.get(&drop_id).copied().unwrap_or(0) > 0
    }

    pub fn subscriber_count(&self, drop_id: i64) -> usize {
        let inner = self.inner.lock().unwrap();
        inner.subscribers.get(&drop_id).copied().unwrap_or(0)
    }

    /// Queue a frame to one connection (connect/subscribe replies).
    pub fn send_to(&self, client_id: u64, message: &serde_json::Value) -> bool {
        let text = message.to_string();
        let inner = self.inner.lock().unwrap();
        match inner.clients.get(&client_id) {
            Some(client) => client.tx.try_send(text).is_ok(),
            None => false,
        }
    }

    /// Fan a frame out to every socket subscribed to `drop_id`, or to all
    /// sockets when no drop is given. Frames to a full queue are dropped;
    /// a persistently full queue evicts the socket.
    pub fn broadcast(&self, message: &serde_json::Value, drop_id: Option<i64>) {
        let text = message.to_string();
        let mut inner = self.inner.lock().unwrap();
        let mut evicted: Vec<u64> = Vec::new();

        for (id, client) in inner.clients.iter_mut() {
            if let Some(target) = drop_id {
                if client.drop_id != target {
                    continue;
                }
            }
            match client.tx.try_send(text.clone()) {
                Ok(()) => client.overflows = 0,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    client.overflows += 1;
                    if client.overflows >= MAX_CONSECUTIVE_OVERFLOWS {
                        evicted.push(*id);
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => evicted.push(*id),
            }
        }

        for id in evicted {
            if let Some(client) = inner.clients.remove(&id) {
                tracing::warn!("evicting slow or closed websocket subscriber {id}");
                decrement(&mut inner.subscribers, client.drop_id);
            }
        }
    }
}

fn decrement(subscribers: &mut HashMap<i64, usize>, drop_id: i64) {
    if let Some(count) = subscribers.get_mut(&drop_id) {
        *count = count.saturating_sub(1);
        if *count == 0 {
            subscribers.remove(&drop_id);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn refcounts_follow_register_and_unregister() {
        let hub = Hub::new();
        assert!(!hub.has_subscribers(1));

        let (a, _rx_a) = hub.register(1);
        let (b, _rx_b) = hub.register(1);
        assert_eq!(hub.subscriber_count(1), 2);

        hub.unregister(a);
        assert!(hub.has_subscribers(1));
        hub.unregister(b);
        assert!(!hub.has_subscribers(1));
    }

    #[test]
    fn resubscribe_swaps_refcounts() {
        let hub = Hub::new();
        let (id, _rx) = hub.register(1);
        hub.resubscribe(id, 2);
        assert!(!hub.has_subscribers(1));
        assert!(hub.has_subscribers(2));
        // No-op resubscribe leaves counts alone.
        hub.resubscribe(id, 2);
        assert_eq!(hub.subscriber_count(2), 1);
    }

    #[tokio::test]
    async fn broadcast_reaches_only_matching_subscription() {
        let hub = Hub::new();
        let (_a, mut rx_a) = hub.register(1);
        let (_b, mut rx_b) = hub.register(2);

        hub.broadcast(
            &serde_json::json!({"type": "wide_events", "drop_id": 2}),
            Some(2),
        );

        let frame = rx_b.try_recv().unwrap();
        assert!(frame.contains("wide_events"));
        assert!(rx_a.try_recv().is_err());
    }

    #[tokio::test]
    async fn unscoped_broadcast_reaches_everyone() {
        let hub = Hub::new();
        let (_a, mut rx_a) = hub.register(1);
        let (_b, mut rx_b) = hub.register(2);

        hub.broadcast(&serde_json::json!({"type": "connected"}), None);
        assert!(rx_a.try_recv().is_ok());
        assert!(rx_b.try_recv().is_ok());
    }

    #[tokio::test]
    async fn frames_arrive_in_enqueue_order() {
        let hub = Hub::new();
        let (_a, mut rx) = hub.register(1);
        for i in 0..5 {
            hub.broadcast(&serde_json::json!({"seq": i}), Some(1));
        }
        for i in 0..5 {
            let frame = rx.try_recv().unwrap();
            assert!(frame.contains(&format!("\"seq\":{i}")));
        }
    }

    #[tokio::test]
    async fn sustained_overflow_evicts_the_socket() {
        let hub = Hub::new();
        let (_id, rx) = hub.register(1);
        // Never drain: fill the queue, then overflow it repeatedly.
        for _ in 0..(QUEUE_CAPACITY as u32 + MAX_CONSECUTIVE_OVERFLOWS) {
            hub.broadcast(&serde_json::json!({"x": "y"}), Some(1));
        }
        assert!(!hub.has_subscribers(1));
        drop(rx);
    }

    #[tokio::test]
    async fn closed_receiver_is_evicted_on_next_broadcast() {
        let hub = Hub::new();
        let (_id, rx) = hub.register(1);
        drop(rx);
        hub.broadcast(&serde_json::json!({}), Some(1));
        assert!(!hub.has_subscribers(1));
    }
}
