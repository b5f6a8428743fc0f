//! Session event multiplexer.
//!
//! This module routes output and exit notifications from each session's PTY
//! to whichever listeners are subscribed to that session. Every subscriber
//! owns a bounded queue; delivery order per subscriber matches emission order
//! and each chunk is delivered at most once.
//!
//! Publishing waits for queue space, so a slow subscriber slows down its own
//! session's reader and nothing else. A subscriber that stays full longer
//! than the send timeout is evicted: its receiver closes without a terminal
//! event.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::{mpsc, Mutex};

use super::pty::ExitStatus;
use super::state::{now_millis, SessionKey};

/// Unique identifier for a subscriber.
pub type SubscriberId = u64;

/// Default per-subscriber queue capacity, in events.
pub const DEFAULT_QUEUE_CAPACITY: usize = 256;

/// Default time a full subscriber may block publication before eviction.
pub const DEFAULT_SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Events delivered to subscribers of a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A chunk of terminal output.
    Output(Bytes),
    /// The shell exited on its own.
    Exit(ExitStatus),
    /// The session was force-terminated.
    Killed,
}

impl SessionEvent {
    /// Whether this event ends the session's stream.
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SessionEvent::Output(_))
    }
}

/// Statistics about a subscriber's deliveries.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubscriberStats {
    /// Events delivered to the subscriber's queue.
    pub events_delivered: u64,
    /// Output bytes delivered.
    pub bytes_delivered: u64,
    /// Last delivery time (Unix epoch milliseconds), 0 if none.
    pub last_activity: u64,
}

/// Receiving end of a subscription.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    key: SessionKey,
    rx: mpsc::Receiver<SessionEvent>,
}

impl Subscription {
    /// Returns the subscriber ID.
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    /// Returns the session incarnation this subscription follows.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    /// Receives the next event.
    ///
    /// Returns `None` once the stream ended: after a terminal event, or
    /// without one if the subscriber was evicted.
    pub async fn recv(&mut self) -> Option<SessionEvent> {
        self.rx.recv().await
    }

    /// Takes the next already-queued event without waiting.
    pub fn try_recv(&mut self) -> Option<SessionEvent> {
        self.rx.try_recv().ok()
    }
}

struct Subscriber {
    id: SubscriberId,
    tx: mpsc::Sender<SessionEvent>,
    stats: SubscriberStats,
}

#[derive(Default)]
struct Topic {
    subscribers: Vec<Subscriber>,
}

/// Fans out session events to subscribers.
pub struct EventMultiplexer {
    topics: DashMap<SessionKey, Arc<Mutex<Topic>>>,
    capacity: usize,
    send_timeout: Duration,
    next_id: AtomicU64,
}

impl EventMultiplexer {
    /// Creates a multiplexer with the given queue capacity and send timeout.
    pub fn new(capacity: usize, send_timeout: Duration) -> Self {
        Self {
            topics: DashMap::new(),
            capacity: capacity.max(1),
            send_timeout,
            next_id: AtomicU64::new(1),
        }
    }

    /// Opens the topic for a session incarnation. Idempotent.
    pub fn open(&self, key: &SessionKey) {
        self.topics.entry(key.clone()).or_default();
    }

    /// Returns whether a topic exists for `key`.
    pub fn is_open(&self, key: &SessionKey) -> bool {
        self.topics.contains_key(key)
    }

    fn topic(&self, key: &SessionKey) -> Option<Arc<Mutex<Topic>>> {
        self.topics.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Subscribes to a session incarnation.
    ///
    /// Returns `None` if the topic does not exist (the session is gone).
    pub async fn subscribe(&self, key: &SessionKey) -> Option<Subscription> {
        let topic = self.topic(key)?;
        let mut topic = topic.lock().await;

        // The topic may have been torn down while we waited for the lock.
        if !self.is_open(key) {
            return None;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::channel(self.capacity);
        topic.subscribers.push(Subscriber {
            id,
            tx,
            stats: SubscriberStats::default(),
        });

        tracing::debug!(session = %key, subscriber_id = id, "Added subscriber");

        Some(Subscription {
            id,
            key: key.clone(),
            rx,
        })
    }

    /// Returns statistics for every subscriber of a topic.
    pub async fn stats(&self, key: &SessionKey) -> Vec<(SubscriberId, SubscriberStats)> {
        match self.topic(key) {
            Some(topic) => topic
                .lock()
                .await
                .subscribers
                .iter()
                .map(|s| (s.id, s.stats.clone()))
                .collect(),
            None => Vec::new(),
        }
    }

    /// Publishes an event to every subscriber of a topic, in subscription
    /// order.
    ///
    /// Closed subscribers are pruned; subscribers full for longer than the
    /// send timeout are evicted. A terminal event tears the topic down after
    /// delivery.
    ///
    /// Returns the number of subscribers that received the event.
    pub async fn publish(&self, key: &SessionKey, event: SessionEvent) -> usize {
        let Some(topic) = self.topic(key) else {
            return 0;
        };
        let mut topic = topic.lock().await;

        let bytes = match &event {
            SessionEvent::Output(data) => data.len() as u64,
            _ => 0,
        };

        let mut delivered = 0;
        let mut dropped = Vec::new();

        for subscriber in topic.subscribers.iter_mut() {
            if subscriber.tx.is_closed() {
                tracing::debug!(
                    session = %key,
                    subscriber_id = subscriber.id,
                    events_delivered = subscriber.stats.events_delivered,
                    bytes_delivered = subscriber.stats.bytes_delivered,
                    "Pruned closed subscriber"
                );
                dropped.push(subscriber.id);
                continue;
            }

            match tokio::time::timeout(self.send_timeout, subscriber.tx.send(event.clone())).await {
                Ok(Ok(())) => {
                    subscriber.stats.events_delivered += 1;
                    subscriber.stats.bytes_delivered += bytes;
                    subscriber.stats.last_activity = now_millis();
                    delivered += 1;
                }
                Ok(Err(_)) => {
                    tracing::debug!(
                        session = %key,
                        subscriber_id = subscriber.id,
                        events_delivered = subscriber.stats.events_delivered,
                        bytes_delivered = subscriber.stats.bytes_delivered,
                        "Subscriber closed"
                    );
                    dropped.push(subscriber.id);
                }
                Err(_) => {
                    tracing::warn!(
                        session = %key,
                        subscriber_id = subscriber.id,
                        timeout_ms = self.send_timeout.as_millis() as u64,
                        events_delivered = subscriber.stats.events_delivered,
                        bytes_delivered = subscriber.stats.bytes_delivered,
                        "Subscriber queue full, evicting"
                    );
                    dropped.push(subscriber.id);
                }
            }
        }

        if !dropped.is_empty() {
            topic.subscribers.retain(|s| !dropped.contains(&s.id));
        }

        if event.is_terminal() {
            topic.subscribers.clear();
            self.topics.remove(key);
            tracing::debug!(session = %key, "Closed topic");
        }

        delivered
    }
}

impl Default for EventMultiplexer {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY, DEFAULT_SEND_TIMEOUT)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::time::timeout;

    fn key(id: &str, instance: u64) -> SessionKey {
        SessionKey {
            id: id.to_string(),
            instance,
        }
    }

    fn output(data: &'static str) -> SessionEvent {
        SessionEvent::Output(Bytes::from_static(data.as_bytes()))
    }

    #[tokio::test]
    async fn test_subscribe_requires_open_topic() {
        let mux = EventMultiplexer::default();
        assert!(mux.subscribe(&key("s1", 1)).await.is_none());

        mux.open(&key("s1", 1));
        assert!(mux.subscribe(&key("s1", 1)).await.is_some());
        assert!(mux.is_open(&key("s1", 1)));
    }

    #[tokio::test]
    async fn test_publish_preserves_order() {
        let mux = EventMultiplexer::default();
        let k = key("s1", 1);
        mux.open(&k);
        let mut sub = mux.subscribe(&k).await.unwrap();

        assert_eq!(mux.publish(&k, output("a")).await, 1);
        assert_eq!(mux.publish(&k, output("b")).await, 1);
        assert_eq!(mux.publish(&k, output("c")).await, 1);

        assert_eq!(sub.recv().await, Some(output("a")));
        assert_eq!(sub.recv().await, Some(output("b")));
        assert_eq!(sub.recv().await, Some(output("c")));
    }

    #[tokio::test]
    async fn test_fan_out_to_multiple_subscribers() {
        let mux = EventMultiplexer::default();
        let k = key("s1", 1);
        mux.open(&k);
        let mut first = mux.subscribe(&k).await.unwrap();
        let mut second = mux.subscribe(&k).await.unwrap();
        assert_ne!(first.id(), second.id());
        assert_eq!(mux.stats(&k).await.len(), 2);

        assert_eq!(mux.publish(&k, output("hello")).await, 2);
        assert_eq!(first.recv().await, Some(output("hello")));
        assert_eq!(second.recv().await, Some(output("hello")));
    }

    #[tokio::test]
    async fn test_terminal_event_tears_down_topic() {
        let mux = EventMultiplexer::default();
        let k = key("s1", 1);
        mux.open(&k);
        let mut sub = mux.subscribe(&k).await.unwrap();

        mux.publish(&k, output("last")).await;
        mux.publish(&k, SessionEvent::Killed).await;

        assert!(!mux.is_open(&k));
        assert_eq!(sub.recv().await, Some(output("last")));
        assert_eq!(sub.recv().await, Some(SessionEvent::Killed));
        assert_eq!(sub.recv().await, None);

        // Late publications go nowhere.
        assert_eq!(mux.publish(&k, output("late")).await, 0);
    }

    #[tokio::test]
    async fn test_exit_event_is_terminal() {
        let mux = EventMultiplexer::default();
        let k = key("s1", 1);
        mux.open(&k);
        let mut sub = mux.subscribe(&k).await.unwrap();

        let exit = SessionEvent::Exit(ExitStatus::code(0));
        assert!(exit.is_terminal());
        mux.publish(&k, exit.clone()).await;

        assert_eq!(sub.recv().await, Some(exit));
        assert_eq!(sub.recv().await, None);
    }

    #[tokio::test]
    async fn test_instances_are_isolated() {
        let mux = EventMultiplexer::default();
        let old = key("s1", 1);
        let new = key("s1", 2);
        mux.open(&old);
        mux.open(&new);
        let mut old_sub = mux.subscribe(&old).await.unwrap();
        let mut new_sub = mux.subscribe(&new).await.unwrap();

        mux.publish(&old, SessionEvent::Killed).await;
        mux.publish(&new, output("fresh")).await;

        assert_eq!(old_sub.recv().await, Some(SessionEvent::Killed));
        assert_eq!(old_sub.recv().await, None);
        assert_eq!(new_sub.recv().await, Some(output("fresh")));
        assert!(mux.is_open(&new));
    }

    #[tokio::test]
    async fn test_dropped_subscriber_is_pruned() {
        let mux = EventMultiplexer::default();
        let k = key("s1", 1);
        mux.open(&k);
        let sub = mux.subscribe(&k).await.unwrap();
        let mut kept = mux.subscribe(&k).await.unwrap();
        drop(sub);

        assert_eq!(mux.publish(&k, output("x")).await, 1);
        assert_eq!(mux.stats(&k).await.len(), 1);
        assert_eq!(kept.recv().await, Some(output("x")));
    }

    #[tokio::test]
    async fn test_slow_subscriber_is_evicted() {
        let mux = EventMultiplexer::new(1, Duration::from_millis(50));
        let k = key("s1", 1);
        mux.open(&k);
        let mut slow = mux.subscribe(&k).await.unwrap();

        assert_eq!(mux.publish(&k, output("one")).await, 1);
        // Queue is full and nobody reads: the second publish evicts.
        assert_eq!(mux.publish(&k, output("two")).await, 0);
        assert!(mux.stats(&k).await.is_empty());

        assert_eq!(slow.recv().await, Some(output("one")));
        assert_eq!(slow.recv().await, None);
    }

    #[tokio::test]
    async fn test_backpressure_waits_for_reader() {
        let mux = Arc::new(EventMultiplexer::new(1, Duration::from_secs(5)));
        let k = key("s1", 1);
        mux.open(&k);
        let mut sub = mux.subscribe(&k).await.unwrap();

        mux.publish(&k, output("one")).await;

        let publisher = {
            let mux = Arc::clone(&mux);
            let k = k.clone();
            tokio::spawn(async move { mux.publish(&k, output("two")).await })
        };

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(sub.recv().await, Some(output("one")));

        let delivered = timeout(Duration::from_secs(1), publisher)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(delivered, 1);
        assert_eq!(sub.recv().await, Some(output("two")));
    }

    #[tokio::test]
    async fn test_stats_track_deliveries() {
        let mux = EventMultiplexer::default();
        let k = key("s1", 1);
        mux.open(&k);
        let mut sub = mux.subscribe(&k).await.unwrap();

        mux.publish(&k, output("hello")).await;
        mux.publish(&k, output("!")).await;

        let stats = mux.stats(&k).await;
        assert_eq!(stats.len(), 1);
        assert_eq!(stats[0].0, sub.id());
        assert_eq!(stats[0].1.events_delivered, 2);
        assert_eq!(stats[0].1.bytes_delivered, 6);
        assert!(stats[0].1.last_activity > 0);

        assert_eq!(sub.try_recv(), Some(output("hello")));
        assert_eq!(sub.try_recv(), Some(output("!")));
        assert_eq!(sub.try_recv(), None);

        // Terminal events tear the topic down along with its statistics.
        mux.publish(&k, SessionEvent::Killed).await;
        assert!(mux.stats(&k).await.is_empty());
        assert!(!mux.is_open(&k));
        assert_eq!(sub.try_recv(), Some(SessionEvent::Killed));
    }
}
