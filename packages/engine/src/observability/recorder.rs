// packages/engine/src/observability/recorder.rs
//! Audit event recorder
//!
//! `record` stamps the event with the instance's next sequence number and
//! pushes it onto the lock-free [`EventQueue`]. A background writer drains the
//! queue in batches into the configured [`EventSink`]. Audit events are best
//! effort: a full queue drops the event and counts the drop.

use super::event_queue::{EventQueue, QueueStats};
use super::events::{EventKind, EventSink, LifecycleEvent};
use crate::utils::clock::Clock;
use crate::utils::ids::InstanceId;
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Recorder configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RecorderConfig {
    /// Events published per sink call
    pub batch_size: usize,
    pub flush_interval_ms: u64,
    pub queue_capacity: usize,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            batch_size: 256,
            flush_interval_ms: 100,
            queue_capacity: 65_536,
        }
    }
}

impl RecorderConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }
}

/// Recorder counters
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RecorderStats {
    pub events_recorded: u64,
    pub events_published: u64,
    pub batches_published: u64,
    pub events_dropped: u64,
    pub publish_failures: u64,
}

#[derive(Debug, Default)]
struct Counters {
    recorded: AtomicU64,
    published: AtomicU64,
    batches: AtomicU64,
    publish_failures: AtomicU64,
}

#[derive(Debug)]
struct Shared {
    queue: EventQueue,
    sink: Arc<dyn EventSink>,
    counters: Counters,
    batch_size: usize,
    // Serializes publishers so batches reach the sink in queue order
    publish_lock: tokio::sync::Mutex<()>,
}

impl Shared {
    async fn drain(&self) {
        let _guard = self.publish_lock.lock().await;
        loop {
            let mut batch = Vec::with_capacity(self.batch_size);
            if self.queue.drain_into(&mut batch, self.batch_size) == 0 {
                return;
            }
            let size = batch.len() as u64;
            match self.sink.publish(batch).await {
                Ok(()) => {
                    self.counters.published.fetch_add(size, Ordering::Relaxed);
                    self.counters.batches.fetch_add(1, Ordering::Relaxed);
                    debug!("Published {} audit events", size);
                }
                Err(e) => {
                    self.counters.publish_failures.fetch_add(1, Ordering::Relaxed);
                    error!("Failed to publish {} audit events: {}", size, e);
                }
            }
        }
    }
}

/// Sequenced, batched audit event recorder
#[derive(Debug)]
pub struct EventRecorder {
    config: RecorderConfig,
    shared: Arc<Shared>,
    sequences: DashMap<InstanceId, u64>,
    clock: Arc<dyn Clock>,
    flush_notify: Arc<Notify>,
    shutdown: CancellationToken,
    writer: Mutex<Option<JoinHandle<()>>>,
}

impl EventRecorder {
    pub fn new(config: RecorderConfig, sink: Arc<dyn EventSink>, clock: Arc<dyn Clock>) -> Self {
        let shared = Arc::new(Shared {
            queue: EventQueue::new(config.queue_capacity),
            sink,
            counters: Counters::default(),
            batch_size: config.batch_size.max(1),
            publish_lock: tokio::sync::Mutex::new(()),
        });

        Self {
            config,
            shared,
            sequences: DashMap::new(),
            clock,
            flush_notify: Arc::new(Notify::new()),
            shutdown: CancellationToken::new(),
            writer: Mutex::new(None),
        }
    }

    /// Start the background writer; a second call is a no-op
    pub fn start(&self) {
        let mut writer = self.writer.lock();
        if writer.is_some() {
            return;
        }

        info!("Starting audit event writer");
        let shared = Arc::clone(&self.shared);
        let notify = Arc::clone(&self.flush_notify);
        let shutdown = self.shutdown.clone();
        let flush_interval = self.config.flush_interval();

        *writer = Some(tokio::spawn(async move {
            let mut interval = tokio::time::interval(flush_interval);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => {
                        shared.drain().await;
                        break;
                    }
                    _ = interval.tick() => {}
                    _ = notify.notified() => {}
                }
                shared.drain().await;
            }
        }));
    }

    /// Record an event, returning its per-instance sequence number
    pub fn record(&self, instance_id: &InstanceId, kind: EventKind) -> u64 {
        // The entry guard is held across the push so queue order matches
        // sequence order for each instance.
        let mut next = self.sequences.entry(instance_id.clone()).or_insert(0);
        *next += 1;
        let sequence = *next;

        let event = LifecycleEvent {
            instance_id: instance_id.clone(),
            sequence,
            timestamp: self.clock.now(),
            kind,
        };
        let name = event.kind.name();

        match self.shared.queue.push(event) {
            Ok(()) => {
                self.shared.counters.recorded.fetch_add(1, Ordering::Relaxed);
            }
            Err(_) => {
                metrics::counter!("agentcore_events_dropped_total").increment(1);
                warn!(instance_id = %instance_id, event = name, "Audit queue full, event dropped");
            }
        }
        drop(next);

        if self.shared.queue.len() >= self.shared.batch_size {
            self.flush_notify.notify_one();
        }
        sequence
    }

    /// Last sequence number handed out for an instance
    pub fn last_sequence(&self, instance_id: &InstanceId) -> u64 {
        self.sequences.get(instance_id).map(|s| *s).unwrap_or(0)
    }

    /// Publish everything queued so far
    pub async fn flush(&self) {
        self.shared.drain().await;
    }

    pub fn queue_stats(&self) -> QueueStats {
        self.shared.queue.stats()
    }

    pub fn stats(&self) -> RecorderStats {
        let counters = &self.shared.counters;
        RecorderStats {
            events_recorded: counters.recorded.load(Ordering::Relaxed),
            events_published: counters.published.load(Ordering::Relaxed),
            batches_published: counters.batches.load(Ordering::Relaxed),
            events_dropped: self.shared.queue.stats().dropped,
            publish_failures: counters.publish_failures.load(Ordering::Relaxed),
        }
    }

    /// Stop the writer after publishing whatever is still queued
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let handle = self.writer.lock().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                error!("Audit event writer ended abnormally: {}", e);
            }
        }
        self.flush().await;
        info!("Audit event recorder stopped");
    }
}

impl Drop for EventRecorder {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::observability::events::MemoryEventSink;
    use crate::utils::clock::SystemClock;

    fn recorder(config: RecorderConfig) -> (EventRecorder, Arc<MemoryEventSink>) {
        let sink = Arc::new(MemoryEventSink::new());
        let recorder = EventRecorder::new(config, sink.clone(), Arc::new(SystemClock));
        (recorder, sink)
    }

    #[tokio::test]
    async fn test_sequences_are_per_instance() {
        let (recorder, sink) = recorder(RecorderConfig::default());
        let a = InstanceId::new("inst_a");
        let b = InstanceId::new("inst_b");

        assert_eq!(recorder.record(&a, EventKind::Restarted { attempt: 1 }), 1);
        assert_eq!(recorder.record(&b, EventKind::Restarted { attempt: 1 }), 1);
        assert_eq!(recorder.record(&a, EventKind::Restarted { attempt: 2 }), 2);
        assert_eq!(recorder.last_sequence(&a), 2);

        recorder.flush().await;
        let sequences: Vec<u64> = sink.for_instance(&a).iter().map(|e| e.sequence).collect();
        assert_eq!(sequences, vec![1, 2]);
        assert_eq!(recorder.stats().events_published, 3);
    }

    #[tokio::test]
    async fn test_overflow_counts_drops() {
        let (recorder, sink) = recorder(RecorderConfig {
            queue_capacity: 2,
            ..RecorderConfig::default()
        });
        let id = InstanceId::new("inst_full");
        for attempt in 0..5 {
            recorder.record(&id, EventKind::Restarted { attempt });
        }

        let stats = recorder.stats();
        assert_eq!(stats.events_recorded, 2);
        assert_eq!(stats.events_dropped, 3);

        recorder.flush().await;
        assert_eq!(sink.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_writer_publishes_on_interval() {
        let (recorder, sink) = recorder(RecorderConfig {
            flush_interval_ms: 50,
            ..RecorderConfig::default()
        });
        recorder.start();
        recorder.record(&InstanceId::new("inst_w"), EventKind::Failed { reason: "x".into() });

        tokio::time::sleep(Duration::from_millis(120)).await;
        assert_eq!(sink.len(), 1);

        recorder.shutdown().await;
    }

    #[tokio::test]
    async fn test_shutdown_publishes_remaining() {
        let (recorder, sink) = recorder(RecorderConfig {
            flush_interval_ms: 60_000,
            ..RecorderConfig::default()
        });
        recorder.start();
        let id = InstanceId::new("inst_s");
        recorder.record(&id, EventKind::Resumed { checkpoint_id: None });
        recorder.record(&id, EventKind::Restarted { attempt: 1 });

        recorder.shutdown().await;
        assert_eq!(sink.names_for(&id), vec!["resumed", "restarted"]);
    }
}
