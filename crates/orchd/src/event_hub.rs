//! Op Event Hub: an in-process publish/subscribe buffer keyed by op-id
//! (Section 4.6).
//!
//! Each op gets a replay buffer (bounded, default 256) plus a set of live
//! channels. Subscribers request replay from a last-event-id; slow live
//! subscribers drop events silently, the replay buffer is the durable record.

use orch_core::{EventKind, Id, OpEvent};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Mutex};

const LIVE_CHANNEL_CAPACITY: usize = 64;

struct OpBuffer {
    events: VecDeque<OpEvent>,
    capacity: usize,
    next_seq: u64,
    live: Vec<mpsc::Sender<OpEvent>>,
    subscriber_count: usize,
    idle_since: Option<Instant>,
}

impl OpBuffer {
    fn new(capacity: usize) -> Self {
        Self {
            events: VecDeque::with_capacity(capacity),
            capacity,
            next_seq: 1,
            live: Vec::new(),
            subscriber_count: 0,
            idle_since: None,
        }
    }

    fn push(&mut self, kind: EventKind, data: serde_json::Value, op_id: Id) -> OpEvent {
        let event = OpEvent {
            op_id,
            seq: self.next_seq,
            kind,
            data,
            emitted_at: chrono::Utc::now(),
        };
        self.next_seq += 1;
        self.events.push_back(event.clone());
        while self.events.len() > self.capacity {
            self.events.pop_front();
        }
        self.live.retain(|tx| tx.try_send(event.clone()).is_ok());
        event
    }
}

/// Result of subscribing to an op's event stream.
pub struct Subscription {
    /// Historical events to replay before switching to the live channel.
    pub replay: Vec<OpEvent>,
    /// True when `last_event_id` fell outside the retained window and the
    /// caller must emit a bootstrap/snapshot event itself (Section 4.6).
    pub needs_bootstrap: bool,
    pub receiver: mpsc::Receiver<OpEvent>,
}

/// In-process event hub, one buffer per op-id.
pub struct OpEventHub {
    buffers: Mutex<HashMap<Id, OpBuffer>>,
    capacity: usize,
    ttl: Duration,
}

impl OpEventHub {
    pub fn new(capacity: usize, ttl: Duration) -> Arc<Self> {
        Arc::new(Self {
            buffers: Mutex::new(HashMap::new()),
            capacity,
            ttl,
        })
    }

    /// Publish an event for `op_id`, fanning out to any live subscribers.
    pub async fn publish(&self, op_id: &Id, kind: EventKind, data: serde_json::Value) -> OpEvent {
        let mut buffers = self.buffers.lock().await;
        let buffer = buffers
            .entry(op_id.clone())
            .or_insert_with(|| OpBuffer::new(self.capacity));
        buffer.idle_since = None;
        buffer.push(kind, data, op_id.clone())
    }

    /// Subscribe to `op_id`'s stream, optionally resuming from `last_event_id`.
    pub async fn subscribe(&self, op_id: &Id, last_event_id: Option<u64>) -> Subscription {
        let mut buffers = self.buffers.lock().await;
        let buffer = buffers
            .entry(op_id.clone())
            .or_insert_with(|| OpBuffer::new(self.capacity));

        let (tx, rx) = mpsc::channel(LIVE_CHANNEL_CAPACITY);
        buffer.live.push(tx);
        buffer.subscriber_count += 1;
        buffer.idle_since = None;

        let (replay, needs_bootstrap) = match last_event_id {
            None => (Vec::new(), true),
            Some(last_id) => {
                let oldest = buffer.events.front().map(|e| e.seq);
                match oldest {
                    Some(oldest_seq) if last_id + 1 >= oldest_seq || buffer.events.is_empty() => {
                        let replay: Vec<OpEvent> = buffer
                            .events
                            .iter()
                            .filter(|e| e.seq > last_id)
                            .cloned()
                            .collect();
                        (replay, false)
                    }
                    _ => (Vec::new(), true),
                }
            }
        };

        Subscription {
            replay,
            needs_bootstrap,
            receiver: rx,
        }
    }

    /// Mark one subscriber of `op_id` as gone. Call when an SSE connection closes.
    pub async fn unsubscribe(&self, op_id: &Id) {
        let mut buffers = self.buffers.lock().await;
        if let Some(buffer) = buffers.get_mut(op_id) {
            buffer.subscriber_count = buffer.subscriber_count.saturating_sub(1);
            if buffer.subscriber_count == 0 {
                buffer.idle_since = Some(Instant::now());
            }
        }
    }

    /// Evict buffers whose subscriber count has been zero for longer than the
    /// configured TTL (Section 4.6 "retained ... for a configured TTL").
    pub async fn evict_expired(&self) {
        let mut buffers = self.buffers.lock().await;
        buffers.retain(|_, buffer| match buffer.idle_since {
            Some(since) => since.elapsed() < self.ttl,
            None => true,
        });
    }

    #[cfg(test)]
    async fn buffer_len(&self, op_id: &Id) -> usize {
        self.buffers
            .lock()
            .await
            .get(op_id)
            .map(|b| b.events.len())
            .unwrap_or(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn publish_assigns_monotonic_sequence() {
        let hub = OpEventHub::new(256, Duration::from_secs(600));
        let op_id = Id::new();
        let e1 = hub.publish(&op_id, EventKind::OpBootstrap, serde_json::json!({})).await;
        let e2 = hub.publish(&op_id, EventKind::OpStatus, serde_json::json!({})).await;
        assert_eq!(e1.seq, 1);
        assert_eq!(e2.seq, 2);
    }

    #[tokio::test]
    async fn subscribe_without_last_id_needs_bootstrap() {
        let hub = OpEventHub::new(256, Duration::from_secs(600));
        let op_id = Id::new();
        hub.publish(&op_id, EventKind::OpBootstrap, serde_json::json!({})).await;
        let sub = hub.subscribe(&op_id, None).await;
        assert!(sub.needs_bootstrap);
        assert!(sub.replay.is_empty());
    }

    #[tokio::test]
    async fn subscribe_with_last_id_in_range_replays_suffix() {
        let hub = OpEventHub::new(256, Duration::from_secs(600));
        let op_id = Id::new();
        hub.publish(&op_id, EventKind::OpBootstrap, serde_json::json!({})).await;
        hub.publish(&op_id, EventKind::OpStatus, serde_json::json!({})).await;
        hub.publish(&op_id, EventKind::StepStarted, serde_json::json!({})).await;

        let sub = hub.subscribe(&op_id, Some(1)).await;
        assert!(!sub.needs_bootstrap);
        assert_eq!(sub.replay.len(), 2);
        assert_eq!(sub.replay[0].seq, 2);
    }

    #[tokio::test]
    async fn subscribe_with_last_id_out_of_range_needs_bootstrap() {
        let hub = OpEventHub::new(2, Duration::from_secs(600));
        let op_id = Id::new();
        for _ in 0..5 {
            hub.publish(&op_id, EventKind::OpHeartbeat, serde_json::json!({})).await;
        }
        // Capacity 2 means sequence 1..=3 are evicted; asking for last_id=1 is out of range.
        let sub = hub.subscribe(&op_id, Some(1)).await;
        assert!(sub.needs_bootstrap);
    }

    #[tokio::test]
    async fn replay_buffer_is_capped() {
        let hub = OpEventHub::new(3, Duration::from_secs(600));
        let op_id = Id::new();
        for _ in 0..10 {
            hub.publish(&op_id, EventKind::OpHeartbeat, serde_json::json!({})).await;
        }
        assert_eq!(hub.buffer_len(&op_id).await, 3);
    }

    #[tokio::test]
    async fn live_channel_receives_published_events() {
        let hub = OpEventHub::new(256, Duration::from_secs(600));
        let op_id = Id::new();
        let mut sub = hub.subscribe(&op_id, None).await;
        hub.publish(&op_id, EventKind::OpStatus, serde_json::json!({"phase": "running"})).await;

        let event = sub.receiver.recv().await.unwrap();
        assert_eq!(event.kind, EventKind::OpStatus);
    }

    #[tokio::test]
    async fn evict_expired_removes_idle_buffers_past_ttl() {
        let hub = OpEventHub::new(256, Duration::from_millis(10));
        let op_id = Id::new();
        hub.publish(&op_id, EventKind::OpBootstrap, serde_json::json!({})).await;
        let _sub = hub.subscribe(&op_id, None).await;
        hub.unsubscribe(&op_id).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        hub.evict_expired().await;
        assert_eq!(hub.buffer_len(&op_id).await, 0);
    }

    #[tokio::test]
    async fn evict_expired_keeps_buffers_with_active_subscribers() {
        let hub = OpEventHub::new(256, Duration::from_millis(10));
        let op_id = Id::new();
        hub.publish(&op_id, EventKind::OpBootstrap, serde_json::json!({})).await;
        let _sub = hub.subscribe(&op_id, None).await;

        tokio::time::sleep(Duration::from_millis(30)).await;
        hub.evict_expired().await;
        assert_eq!(hub.buffer_len(&op_id).await, 1);
    }
}
