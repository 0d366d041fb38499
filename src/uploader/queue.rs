//! Size- and time-triggered batching of telemetry events.
//!
//! The [`BatchQueue`] buffers batchable events and hands them out in chunks
//! of at most `threshold` events:
//!
//! - when an enqueue brings the buffer to the threshold (returned to the
//!   caller as [`Enqueued::Flush`]), which also restarts the flush timer;
//! - when the periodic timer fires with a non-empty buffer (delivered
//!   through the [`BatchSink`]);
//! - on [`drain`](BatchQueue::drain) at shutdown.
//!
//! The buffer and the timer handle share one mutex. Deliveries never hold it.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

use crate::event::Event;

/// Receives batches flushed by the queue itself (timer and drain).
///
/// `tag` names the trigger and is included in failure logs.
#[async_trait]
pub trait BatchSink: Send + Sync + 'static {
    async fn deliver_batch(&self, batch: Vec<Event>, tag: &str);
}

/// What the caller must do with an event after [`BatchQueue::enqueue`].
#[derive(Debug)]
pub enum Enqueued {
    /// Held in the buffer; nothing to send now.
    Buffered,
    /// Not batchable; send it on its own.
    Immediate(Event),
    /// A lone screenshot; send it on the screenshot path.
    Screenshot(Event),
    /// The buffer reached the threshold; send this batch.
    Flush(Vec<Event>),
}

struct QueueState {
    buffer: Vec<Event>,
    timer: Option<JoinHandle<()>>,
}

/// Ordered event buffer with a periodic flush timer.
///
/// At most one timer task is alive at any time: resets abort the current
/// handle before spawning the next one.
pub struct BatchQueue<S: BatchSink> {
    sink: Arc<S>,
    threshold: usize,
    interval: Duration,
    state: Mutex<QueueState>,
}

impl<S: BatchSink> BatchQueue<S> {
    /// Creates a queue. The timer does not start until
    /// [`ensure_started`](Self::ensure_started) is called.
    ///
    /// `threshold` below 1 is clamped to 1.
    pub fn new(sink: Arc<S>, threshold: usize, interval: Duration) -> Arc<Self> {
        Arc::new(Self {
            sink,
            threshold: threshold.max(1),
            interval,
            state: Mutex::new(QueueState {
                buffer: Vec::new(),
                timer: None,
            }),
        })
    }

    /// Number of buffered events.
    pub async fn len(&self) -> usize {
        self.state.lock().await.buffer.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    /// Starts the periodic flush timer if it isn't running.
    pub async fn ensure_started(self: &Arc<Self>) {
        let mut state = self.state.lock().await;
        if state.timer.is_none() {
            state.timer = Some(self.spawn_timer());
        }
    }

    /// Classifies and (for batchable events) buffers `event`.
    pub async fn enqueue(self: &Arc<Self>, event: Event) -> Enqueued {
        if !event.kind().is_batchable() {
            return Enqueued::Immediate(event);
        }
        if event.is_screenshot() {
            return Enqueued::Screenshot(event);
        }

        let mut state = self.state.lock().await;
        state.buffer.push(event);

        if state.buffer.len() < self.threshold {
            return Enqueued::Buffered;
        }

        let batch = take_chunk(&mut state.buffer, self.threshold);
        if let Some(timer) = state.timer.take() {
            timer.abort();
        }
        state.timer = Some(self.spawn_timer());
        debug!("Size threshold reached, flushing {} events", batch.len());

        Enqueued::Flush(batch)
    }

    /// Stops the timer and flushes everything left, one chunk at a time.
    ///
    /// Returns the number of batches delivered.
    pub async fn drain(&self) -> usize {
        if let Some(timer) = self.state.lock().await.timer.take() {
            timer.abort();
        }

        let mut flushes = 0;
        loop {
            let chunk = {
                let mut state = self.state.lock().await;
                take_chunk(&mut state.buffer, self.threshold)
            };
            if chunk.is_empty() {
                break;
            }
            self.sink.deliver_batch(chunk, "drain").await;
            flushes += 1;
        }

        flushes
    }

    fn spawn_timer(self: &Arc<Self>) -> JoinHandle<()> {
        let queue: Weak<Self> = Arc::downgrade(self);
        let period = self.interval;

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                ticker.tick().await;
                let Some(queue) = queue.upgrade() else {
                    break;
                };
                queue.flush_tick().await;
            }
        })
    }

    async fn flush_tick(&self) {
        let chunk = {
            let mut state = self.state.lock().await;
            take_chunk(&mut state.buffer, self.threshold)
        };
        if chunk.is_empty() {
            return;
        }

        debug!("Flush timer fired, flushing {} events", chunk.len());

        // Delivered outside the timer task so a reset can't cancel it midway.
        let sink = self.sink.clone();
        tokio::spawn(async move {
            sink.deliver_batch(chunk, "interval").await;
        });
    }
}

impl<S: BatchSink> Drop for BatchQueue<S> {
    fn drop(&mut self) {
        if let Some(timer) = self.state.get_mut().timer.take() {
            timer.abort();
        }
    }
}

/// Removes and returns up to `n` events from the front of `buffer`.
fn take_chunk(buffer: &mut Vec<Event>, n: usize) -> Vec<Event> {
    let end = n.min(buffer.len());
    buffer.drain(..end).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{LogEntry, LogKind};
    use serde_json::{Value, json};
    use std::sync::Mutex as StdMutex;
    use uuid::Uuid;

    #[derive(Default)]
    struct RecordingSink {
        batches: StdMutex<Vec<(String, Vec<Event>)>>,
    }

    impl RecordingSink {
        fn batches(&self) -> Vec<(String, Vec<Event>)> {
            self.batches.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl BatchSink for RecordingSink {
        async fn deliver_batch(&self, batch: Vec<Event>, tag: &str) {
            self.batches.lock().unwrap().push((tag.to_string(), batch));
        }
    }

    fn log_event(n: usize) -> Event {
        Event::LogCreated {
            logs: vec![LogEntry::new(LogKind::TestLog, json!(n))],
        }
    }

    fn screenshot_event() -> Event {
        Event::LogCreated {
            logs: vec![LogEntry::new(LogKind::TestScreenshot, json!("iVBORw0KGgo="))],
        }
    }

    fn payload(event: &Event) -> Value {
        match event {
            Event::LogCreated { logs } => logs[0].payload.clone(),
            _ => Value::Null,
        }
    }

    fn make_queue(
        threshold: usize,
        interval_ms: u64,
    ) -> (Arc<RecordingSink>, Arc<BatchQueue<RecordingSink>>) {
        let sink = Arc::new(RecordingSink::default());
        let queue = BatchQueue::new(sink.clone(), threshold, Duration::from_millis(interval_ms));
        (sink, queue)
    }

    #[tokio::test]
    async fn test_below_threshold_buffers() {
        let (sink, queue) = make_queue(3, 1000);

        for i in 0..2 {
            assert!(matches!(queue.enqueue(log_event(i)).await, Enqueued::Buffered));
        }

        assert_eq!(queue.len().await, 2);
        assert!(sink.batches().is_empty());
    }

    #[tokio::test]
    async fn test_threshold_returns_one_batch_in_order() {
        let (_sink, queue) = make_queue(3, 1000);

        queue.enqueue(log_event(0)).await;
        queue.enqueue(log_event(1)).await;
        let flushed = queue.enqueue(log_event(2)).await;

        let Enqueued::Flush(batch) = flushed else {
            panic!("expected a flush");
        };
        assert_eq!(batch.len(), 3);
        let order: Vec<Value> = batch.iter().map(payload).collect();
        assert_eq!(order, vec![json!(0), json!(1), json!(2)]);
        assert!(queue.is_empty().await);
    }

    #[tokio::test(start_paused = true)]
    async fn test_size_flush_resets_timer() {
        let (sink, queue) = make_queue(3, 100);
        queue.ensure_started().await;

        // Just before the first tick, trigger a size flush
        tokio::time::sleep(Duration::from_millis(90)).await;
        for i in 0..3 {
            queue.enqueue(log_event(i)).await;
        }
        queue.enqueue(log_event(3)).await;

        // The original tick at 100ms must not fire
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(sink.batches().is_empty());
        assert_eq!(queue.len().await, 1);

        // The restarted timer fires at 190ms
        tokio::time::sleep(Duration::from_millis(90)).await;
        let batches = sink.batches();
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].0, "interval");
        assert_eq!(batches[0].1.len(), 1);
    }

    #[tokio::test]
    async fn test_screenshot_bypasses_buffer() {
        let (_sink, queue) = make_queue(3, 1000);

        queue.enqueue(log_event(0)).await;
        queue.enqueue(log_event(1)).await;

        let result = queue.enqueue(screenshot_event()).await;
        assert!(matches!(result, Enqueued::Screenshot(_)));
        assert_eq!(queue.len().await, 2);

        // Filling the buffer afterwards never includes the screenshot
        let Enqueued::Flush(batch) = queue.enqueue(log_event(2)).await else {
            panic!("expected a flush");
        };
        assert!(batch.iter().all(|e| !e.is_screenshot()));
    }

    #[tokio::test]
    async fn test_non_batchable_is_immediate() {
        let (_sink, queue) = make_queue(3, 1000);

        let event = Event::SessionCreated {
            test_run_uuid: Uuid::new_v4(),
            integration: json!({"session_id": "abc"}),
        };
        assert!(matches!(queue.enqueue(event).await, Enqueued::Immediate(_)));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_drain_flushes_in_threshold_chunks() {
        let (sink, queue) = make_queue(4, 1000);
        queue
            .state
            .lock()
            .await
            .buffer
            .extend((0..10).map(log_event));

        let flushes = queue.drain().await;

        assert_eq!(flushes, 3);
        let sizes: Vec<usize> = sink.batches().iter().map(|(_, b)| b.len()).collect();
        assert_eq!(sizes, vec![4, 4, 2]);
        assert!(sink.batches().iter().all(|(tag, _)| tag == "drain"));
        assert!(queue.is_empty().await);
    }

    #[tokio::test]
    async fn test_drain_empty_queue() {
        let (sink, queue) = make_queue(4, 1000);
        queue.ensure_started().await;

        assert_eq!(queue.drain().await, 0);
        assert!(sink.batches().is_empty());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_flushes_one_chunk_per_tick() {
        let (sink, queue) = make_queue(4, 100);
        queue
            .state
            .lock()
            .await
            .buffer
            .extend((0..10).map(log_event));
        queue.ensure_started().await;

        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(sink.batches()[0].1.len(), 4);
        assert_eq!(queue.len().await, 6);

        // Timer keeps running
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(sink.batches().len(), 2);
        assert_eq!(queue.len().await, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_started_is_idempotent() {
        let (sink, queue) = make_queue(2, 100);
        queue
            .state
            .lock()
            .await
            .buffer
            .extend((0..5).map(log_event));

        queue.ensure_started().await;
        queue.ensure_started().await;

        // A second live timer would flush a second chunk on the same tick
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(sink.batches().len(), 1);
        assert_eq!(queue.len().await, 3);
    }
}
