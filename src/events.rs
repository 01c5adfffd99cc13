//! Server-sent event fan-out.
//!
//! Two hubs run in the process: one for scan events, one for transaction
//! events. Each connected client gets its own bounded channel (capacity
//! 100). Publishing never blocks: a full channel drops the event for that
//! client and logs a slow-consumer warning; a closed channel deregisters the
//! client. Keepalive comment frames are added at the HTTP layer via axum's
//! `KeepAlive` so intermediaries do not time idle streams out.

use axum::response::sse::Event;
use serde::Serialize;
use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::task::Poll;
use tokio::sync::mpsc;

/// Per-client buffer capacity.
const CLIENT_BUFFER: usize = 100;

pub const SCAN_PROGRESS: &str = "scan_progress";
pub const SCAN_COMPLETE: &str = "scan_complete";
pub const SCAN_ERROR: &str = "scan_error";
pub const SCAN_TOKEN_ERROR: &str = "scan_token_error";
pub const SCAN_STATE: &str = "scan_state";
pub const TX_STATUS: &str = "tx_status";
pub const TX_COMPLETE: &str = "tx_complete";

/// A named event with a pre-serialized JSON payload.
///
/// Channels carry this instead of `axum`'s `Event` so the payload is
/// serialized once per publish, not once per client.
#[derive(Clone, Debug)]
pub struct HubEvent {
    pub name: &'static str,
    pub data: String,
}

impl HubEvent {
    pub fn new(name: &'static str, payload: &impl Serialize) -> Self {
        let data = serde_json::to_string(payload)
            .unwrap_or_else(|e| format!("{{\"error\":\"unserializable payload: {e}\"}}"));
        Self { name, data }
    }

    pub fn to_sse(&self) -> Event {
        Event::default().event(self.name).data(&self.data)
    }
}

/// One SSE hub.
pub struct EventHub {
    name: &'static str,
    clients: RwLock<HashMap<u64, mpsc::Sender<HubEvent>>>,
    next_id: AtomicU64,
}

impl EventHub {
    pub fn new(name: &'static str) -> Arc<Self> {
        Arc::new(Self {
            name,
            clients: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    /// Registers a client. `resync` events are queued first so the client
    /// starts from current state rather than a blank stream.
    pub fn subscribe(self: &Arc<Self>, resync: Vec<HubEvent>) -> Subscription {
        let (tx, rx) = mpsc::channel(CLIENT_BUFFER);
        for event in resync {
            // Capacity far exceeds any resync set; a failure here means the
            // client is already gone.
            let _ = tx.try_send(event);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.clients.write().expect("hub lock").insert(id, tx);
        tracing::debug!(hub = self.name, client = id, "sse client connected");
        Subscription {
            id,
            hub: Arc::clone(self),
            rx,
        }
    }

    /// Fans an event out to every connected client without blocking.
    pub fn publish(&self, name: &'static str, payload: &impl Serialize) {
        self.publish_event(HubEvent::new(name, payload));
    }

    pub fn publish_event(&self, event: HubEvent) {
        let mut closed = Vec::new();
        {
            let clients = self.clients.read().expect("hub lock");
            for (id, tx) in clients.iter() {
                match tx.try_send(event.clone()) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(_)) => {
                        tracing::warn!(
                            hub = self.name,
                            client = id,
                            event = event.name,
                            "slow sse client, dropping event"
                        );
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => closed.push(*id),
                }
            }
        }
        if !closed.is_empty() {
            let mut clients = self.clients.write().expect("hub lock");
            for id in closed {
                clients.remove(&id);
            }
        }
    }

    pub fn client_count(&self) -> usize {
        self.clients.read().expect("hub lock").len()
    }

    fn deregister(&self, id: u64) {
        self.clients.write().expect("hub lock").remove(&id);
        tracing::debug!(hub = self.name, client = id, "sse client disconnected");
    }
}

/// A registered client; deregisters itself on drop.
pub struct Subscription {
    id: u64,
    hub: Arc<EventHub>,
    rx: mpsc::Receiver<HubEvent>,
}

impl Subscription {
    /// Turns the subscription into an SSE event stream. Dropping the stream
    /// (client disconnect) removes the registration.
    pub fn into_stream(mut self) -> impl futures_util::Stream<Item = Result<Event, Infallible>> {
        futures_util::stream::poll_fn(move |cx| match self.rx.poll_recv(cx) {
            Poll::Ready(Some(event)) => Poll::Ready(Some(Ok(event.to_sse()))),
            Poll::Ready(None) => Poll::Ready(None),
            Poll::Pending => Poll::Pending,
        })
    }

    #[cfg(test)]
    pub async fn recv(&mut self) -> Option<HubEvent> {
        self.rx.recv().await
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.deregister(self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn resync_events_arrive_before_published_ones() {
        let hub = EventHub::new("scan");
        let mut sub = hub.subscribe(vec![HubEvent::new(SCAN_STATE, &json!({"chain": "btc"}))]);
        hub.publish(SCAN_PROGRESS, &json!({"scanned": 10}));
        assert_eq!(sub.recv().await.unwrap().name, SCAN_STATE);
        assert_eq!(sub.recv().await.unwrap().name, SCAN_PROGRESS);
    }

    #[tokio::test]
    async fn slow_clients_lose_events_but_never_block_the_publisher() {
        let hub = EventHub::new("scan");
        let mut sub = hub.subscribe(vec![]);
        for i in 0..(CLIENT_BUFFER + 50) {
            hub.publish(SCAN_PROGRESS, &json!({"i": i}));
        }
        // The publisher survived; the client sees exactly the buffer's worth.
        let mut received = 0;
        while let Ok(event) = sub.rx.try_recv() {
            assert_eq!(event.name, SCAN_PROGRESS);
            received += 1;
        }
        assert_eq!(received, CLIENT_BUFFER);
    }

    #[tokio::test]
    async fn dropped_subscriptions_deregister() {
        let hub = EventHub::new("tx");
        let sub = hub.subscribe(vec![]);
        assert_eq!(hub.client_count(), 1);
        drop(sub);
        assert_eq!(hub.client_count(), 0);
    }

    #[tokio::test]
    async fn publish_prunes_closed_receivers() {
        let hub = EventHub::new("tx");
        let mut sub = hub.subscribe(vec![]);
        // Close the channel while the registration is still alive; the next
        // publish notices and prunes it.
        sub.rx.close();
        hub.publish(TX_STATUS, &json!({}));
        assert_eq!(hub.client_count(), 0);
        drop(sub);
    }
}
