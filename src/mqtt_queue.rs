//! Non-blocking MQTT publish queue.
//!
//! `publish_nowait` never blocks the event loop: messages land in a
//! bounded deque and a single background worker batches them out to the
//! broker. Overflow drops the oldest entry. QoS 0 publishes are
//! fire-and-forget; QoS 1+ are awaited in order within the batch.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::Serialize;
use tokio::task::JoinHandle;

pub const DEFAULT_MAX_QUEUE: usize = 1000;
pub const BATCH_WINDOW: Duration = Duration::from_millis(10);
pub const MAX_BATCH: usize = 50;

/// Where batches go. The MQTT service implements this over its client;
/// tests record messages.
#[async_trait]
pub trait PublishSink: Send + Sync {
    fn connected(&self) -> bool;
    async fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool)
        -> anyhow::Result<()>;
}

#[derive(Debug, Clone)]
struct QueuedMessage {
    topic: String,
    payload: Vec<u8>,
    qos: u8,
    retain: bool,
    queued_at: Instant,
}

#[derive(Debug, Default)]
struct QueueCounters {
    published: AtomicU64,
    dropped: AtomicU64,
    batches: AtomicU64,
    queue_full_events: AtomicU64,
    errors: AtomicU64,
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct QueueStats {
    pub queue_size: usize,
    pub queue_max: usize,
    pub published_total: u64,
    pub dropped_total: u64,
    pub batches_total: u64,
    pub queue_full_events: u64,
    pub errors_total: u64,
    pub running: bool,
}

struct QueueInner {
    queue: Mutex<VecDeque<QueuedMessage>>,
    max_size: usize,
    batch_window: Duration,
    counters: Arc<QueueCounters>,
    running: AtomicBool,
    worker: Mutex<Option<JoinHandle<()>>>,
}

#[derive(Clone)]
pub struct PublishQueue {
    inner: Arc<QueueInner>,
}

impl PublishQueue {
    pub fn new(max_size: usize, batch_window: Duration) -> Self {
        tracing::info!(
            "MQTT publish queue initialised: max_size={}, batch_window={:?}",
            max_size,
            batch_window
        );
        Self {
            inner: Arc::new(QueueInner {
                queue: Mutex::new(VecDeque::new()),
                max_size,
                batch_window,
                counters: Arc::new(QueueCounters::default()),
                running: AtomicBool::new(false),
                worker: Mutex::new(None),
            }),
        }
    }

    pub fn with_defaults() -> Self {
        Self::new(DEFAULT_MAX_QUEUE, BATCH_WINDOW)
    }

    /// Queue a message without blocking. When the queue is full the
    /// oldest message is dropped and counted.
    pub fn publish_nowait(
        &self,
        topic: &str,
        payload: impl Into<Vec<u8>>,
        qos: u8,
        retain: bool,
    ) -> bool {
        let message = QueuedMessage {
            topic: topic.to_string(),
            payload: payload.into(),
            qos,
            retain,
            queued_at: Instant::now(),
        };
        let mut queue = self.inner.queue.lock().expect("queue lock");
        if queue.len() >= self.inner.max_size {
            queue.pop_front();
            self.inner.counters.dropped.fetch_add(1, Ordering::Relaxed);
            self.inner.counters.queue_full_events.fetch_add(1, Ordering::Relaxed);
        }
        queue.push_back(message);
        true
    }

    pub fn start(&self, sink: Arc<dyn PublishSink>) {
        if self.inner.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Publish queue already running");
            return;
        }
        let inner = Arc::clone(&self.inner);
        let handle = tokio::spawn(async move {
            worker_loop(inner, sink).await;
        });
        *self.inner.worker.lock().expect("queue lock") = Some(handle);
        tracing::info!("MQTT publish queue worker started");
    }

    /// Stop the worker and flush whatever is still queued.
    pub async fn stop(&self, sink: Arc<dyn PublishSink>) {
        if !self.inner.running.swap(false, Ordering::SeqCst) {
            return;
        }
        let handle = self.inner.worker.lock().expect("queue lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        let remaining: Vec<QueuedMessage> =
            self.inner.queue.lock().expect("queue lock").drain(..).collect();
        if !remaining.is_empty() {
            tracing::info!("Flushing {} remaining messages", remaining.len());
            publish_batch(&self.inner, &sink, remaining).await;
        }
        tracing::info!("MQTT publish queue stopped. {:?}", self.stats());
    }

    pub fn stats(&self) -> QueueStats {
        QueueStats {
            queue_size: self.inner.queue.lock().expect("queue lock").len(),
            queue_max: self.inner.max_size,
            published_total: self.inner.counters.published.load(Ordering::Relaxed),
            dropped_total: self.inner.counters.dropped.load(Ordering::Relaxed),
            batches_total: self.inner.counters.batches.load(Ordering::Relaxed),
            queue_full_events: self.inner.counters.queue_full_events.load(Ordering::Relaxed),
            errors_total: self.inner.counters.errors.load(Ordering::Relaxed),
            running: self.inner.running.load(Ordering::SeqCst),
        }
    }

    #[cfg(test)]
    fn queued_topics(&self) -> Vec<String> {
        self.inner.queue.lock().unwrap().iter().map(|m| m.topic.clone()).collect()
    }

    #[cfg(test)]
    fn force_running(&self) {
        self.inner.running.store(true, Ordering::SeqCst);
    }
}

async fn worker_loop(inner: Arc<QueueInner>, sink: Arc<dyn PublishSink>) {
    while inner.running.load(Ordering::SeqCst) {
        let deadline = Instant::now() + inner.batch_window;
        let mut batch = Vec::new();

        while batch.len() < MAX_BATCH {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            let next = inner.queue.lock().expect("queue lock").pop_front();
            match next {
                Some(message) => batch.push(message),
                None => tokio::time::sleep(Duration::from_millis(1).min(remaining)).await,
            }
        }

        if batch.is_empty() {
            tokio::time::sleep(Duration::from_millis(10)).await;
            continue;
        }
        publish_batch(&inner, &sink, batch).await;
        inner.counters.batches.fetch_add(1, Ordering::Relaxed);
    }
    tracing::info!("MQTT publish worker stopped");
}

async fn publish_batch(inner: &QueueInner, sink: &Arc<dyn PublishSink>, batch: Vec<QueuedMessage>) {
    if !sink.connected() {
        tracing::debug!("Skipping batch of {}: MQTT not connected", batch.len());
        inner.counters.dropped.fetch_add(batch.len() as u64, Ordering::Relaxed);
        return;
    }

    let mut awaited = Vec::new();
    for message in batch {
        let age = message.queued_at.elapsed();
        if age > Duration::from_millis(50) {
            tracing::debug!("Publishing aged message {} ({:?} old)", message.topic, age);
        }
        if message.qos == 0 {
            // Fire-and-forget keeps motion latency flat.
            let sink = Arc::clone(sink);
            let counters = Arc::clone(&inner.counters);
            tokio::spawn(async move {
                match sink.publish(&message.topic, &message.payload, 0, message.retain).await {
                    Ok(()) => {
                        counters.published.fetch_add(1, Ordering::Relaxed);
                    }
                    Err(e) => {
                        tracing::debug!("Failed to publish {}: {}", message.topic, e);
                        counters.errors.fetch_add(1, Ordering::Relaxed);
                    }
                }
            });
        } else {
            awaited.push(message);
        }
    }

    for message in awaited {
        match sink.publish(&message.topic, &message.payload, message.qos, message.retain).await {
            Ok(()) => {
                inner.counters.published.fetch_add(1, Ordering::Relaxed);
            }
            Err(e) => {
                tracing::debug!("Failed to publish QoS{} {}: {}", message.qos, message.topic, e);
                inner.counters.errors.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
pub mod testing {
    use super::*;

    /// Records everything published; used across the test suite.
    #[derive(Default)]
    pub struct RecordingSink {
        pub messages: Mutex<Vec<(String, Vec<u8>, u8, bool)>>,
        pub offline: AtomicBool,
    }

    impl RecordingSink {
        pub fn topics(&self) -> Vec<String> {
            self.messages.lock().unwrap().iter().map(|m| m.0.clone()).collect()
        }

        pub fn payload_for(&self, topic: &str) -> Option<Vec<u8>> {
            self.messages
                .lock()
                .unwrap()
                .iter()
                .rev()
                .find(|m| m.0 == topic)
                .map(|m| m.1.clone())
        }
    }

    #[async_trait]
    impl PublishSink for RecordingSink {
        fn connected(&self) -> bool {
            !self.offline.load(Ordering::Relaxed)
        }

        async fn publish(&self, topic: &str, payload: &[u8], qos: u8, retain: bool)
            -> anyhow::Result<()>
        {
            self.messages.lock().unwrap().push((topic.to_string(), payload.to_vec(), qos, retain));
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::RecordingSink;
    use super::*;

    #[test]
    fn overflow_drops_oldest() {
        let queue = PublishQueue::new(3, BATCH_WINDOW);
        for i in 0..4 {
            queue.publish_nowait(&format!("t/{i}"), b"x".to_vec(), 0, true);
        }
        let stats = queue.stats();
        assert_eq!(stats.queue_size, 3);
        assert_eq!(stats.dropped_total, 1);
        assert_eq!(stats.queue_full_events, 1);

        // t/0 fell off the front.
        assert_eq!(queue.queued_topics(), vec!["t/1", "t/2", "t/3"]);
    }

    #[tokio::test]
    async fn worker_delivers_within_batch_window() {
        let queue = PublishQueue::new(100, Duration::from_millis(5));
        let sink = Arc::new(RecordingSink::default());
        queue.start(sink.clone());

        queue.publish_nowait("zigbee/lamp", br#"{"state":"ON"}"#.to_vec(), 1, true);
        tokio::time::sleep(Duration::from_millis(60)).await;

        assert_eq!(sink.topics(), vec!["zigbee/lamp"]);
        assert_eq!(queue.stats().published_total, 1);
        queue.stop(sink).await;
    }

    #[tokio::test]
    async fn qos0_is_fire_and_forget_but_counted() {
        let queue = PublishQueue::new(100, Duration::from_millis(5));
        let sink = Arc::new(RecordingSink::default());
        queue.start(sink.clone());

        for i in 0..5 {
            queue.publish_nowait(&format!("zigbee/s{i}"), b"1".to_vec(), 0, false);
        }
        tokio::time::sleep(Duration::from_millis(80)).await;
        assert_eq!(sink.topics().len(), 5);
        assert_eq!(queue.stats().published_total, 5);
        queue.stop(sink).await;
    }

    #[tokio::test]
    async fn stop_flushes_pending_messages() {
        let queue = PublishQueue::new(100, Duration::from_secs(10));
        let sink = Arc::new(RecordingSink::default());
        // Worker never started; everything flushes at stop.
        queue.force_running();
        queue.publish_nowait("a", b"1".to_vec(), 1, true);
        queue.publish_nowait("b", b"2".to_vec(), 1, true);
        queue.stop(sink.clone()).await;
        assert_eq!(sink.topics(), vec!["a", "b"]);
    }

    #[tokio::test]
    async fn disconnected_sink_drops_batch() {
        let queue = PublishQueue::new(100, Duration::from_millis(5));
        let sink = Arc::new(RecordingSink::default());
        sink.offline.store(true, Ordering::Relaxed);
        queue.start(sink.clone());

        queue.publish_nowait("zigbee/lamp", b"x".to_vec(), 1, true);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(sink.topics().is_empty());
        assert_eq!(queue.stats().dropped_total, 1);
        queue.stop(sink).await;
    }
}
