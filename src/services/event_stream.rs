//! Bounded, lossy event delivery.
//!
//! The pipeline never waits on an event consumer. Events are pushed into a
//! bounded channel with `try_send`; when the consumer falls behind the event
//! is dropped and counted. A detached task forwards queued events to the
//! downstream [`EventSink`].

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::domain::models::PipelineEvent;
use crate::domain::ports::EventSink;

/// Producer half. Cheap to share; implements [`EventSink`] itself so stages
/// can emit through it like any other sink.
pub struct EventQueue {
    sender: mpsc::Sender<PipelineEvent>,
    dropped: AtomicU64,
    delivered: Arc<AtomicU64>,
}

/// Consumer half. Must be finished to flush queued events.
pub struct EventPump {
    handle: JoinHandle<()>,
    shutdown: CancellationToken,
}

impl EventQueue {
    /// Start a queue of `capacity` events draining into `sink`.
    pub fn start(sink: Arc<dyn EventSink>, capacity: usize) -> (Arc<Self>, EventPump) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        let delivered = Arc::new(AtomicU64::new(0));
        let shutdown = CancellationToken::new();

        let handle = tokio::spawn(forward(receiver, sink, delivered.clone(), shutdown.clone()));

        let queue = Arc::new(Self {
            sender,
            dropped: AtomicU64::new(0),
            delivered,
        });
        (queue, EventPump { handle, shutdown })
    }

    /// Queue an event, dropping it if the queue is full or closed.
    /// Returns whether the event was queued.
    pub fn push(&self, event: PipelineEvent) -> bool {
        match self.sender.try_send(event) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(event)) => {
                let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                debug!(request_id = %event.request_id(), dropped, "event queue full, event dropped");
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
                false
            }
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn delivered(&self) -> u64 {
        self.delivered.load(Ordering::Relaxed)
    }
}

impl EventSink for EventQueue {
    fn emit(&self, event: PipelineEvent) {
        self.push(event);
    }
}

impl EventPump {
    /// Deliver everything already queued, then stop the consumer.
    pub async fn finish(self) {
        self.shutdown.cancel();
        if let Err(e) = self.handle.await {
            warn!(error = %e, "event consumer task failed");
        }
    }
}

async fn forward(
    mut receiver: mpsc::Receiver<PipelineEvent>,
    sink: Arc<dyn EventSink>,
    delivered: Arc<AtomicU64>,
    shutdown: CancellationToken,
) {
    loop {
        tokio::select! {
            biased;
            event = receiver.recv() => match event {
                Some(event) => {
                    sink.emit(event);
                    delivered.fetch_add(1, Ordering::Relaxed);
                }
                None => return,
            },
            () = shutdown.cancelled() => break,
        }
    }

    receiver.close();
    while let Ok(event) = receiver.try_recv() {
        sink.emit(event);
        delivered.fetch_add(1, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::sinks::RecordingEventSink;
    use uuid::Uuid;

    fn chunk_event(sequence: u64) -> PipelineEvent {
        PipelineEvent::ContentChunk {
            request_id: Uuid::nil(),
            step_id: "s1".into(),
            sequence,
            delta: format!("d{sequence}"),
        }
    }

    /// Sink that parks the consumer until released.
    struct GatedSink {
        gate: std::sync::Mutex<()>,
        inner: RecordingEventSink,
    }

    impl EventSink for GatedSink {
        fn emit(&self, event: PipelineEvent) {
            let _held = self.gate.lock().unwrap_or_else(|e| e.into_inner());
            self.inner.emit(event);
        }
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let sink = Arc::new(RecordingEventSink::new());
        let (queue, pump) = EventQueue::start(sink.clone(), 16);
        for i in 0..5 {
            assert!(queue.push(chunk_event(i)));
        }
        pump.finish().await;

        let sequences: Vec<u64> = sink
            .events()
            .iter()
            .filter_map(|e| match e {
                PipelineEvent::ContentChunk { sequence, .. } => Some(*sequence),
                _ => None,
            })
            .collect();
        assert_eq!(sequences, vec![0, 1, 2, 3, 4]);
        assert_eq!(queue.dropped(), 0);
        assert_eq!(queue.delivered(), 5);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_slow_consumer_drops_with_count() {
        let sink = Arc::new(GatedSink {
            gate: std::sync::Mutex::new(()),
            inner: RecordingEventSink::new(),
        });
        let guard = sink.gate.lock().unwrap();
        let (queue, pump) = EventQueue::start(sink.clone(), 2);

        let mut queued = 0;
        for i in 0..50 {
            if queue.push(chunk_event(i)) {
                queued += 1;
            }
        }
        drop(guard);
        pump.finish().await;

        assert!(queue.dropped() > 0);
        assert_eq!(queue.dropped() + queued, 50);
        assert_eq!(sink.inner.events().len() as u64, queued);
    }

    #[tokio::test]
    async fn test_push_after_finish_is_counted() {
        let sink = Arc::new(RecordingEventSink::new());
        let (queue, pump) = EventQueue::start(sink, 4);
        pump.finish().await;
        assert!(!queue.push(chunk_event(0)));
        assert_eq!(queue.dropped(), 1);
    }
}
