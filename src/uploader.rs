//! Event upload pipeline.
//!
//! # Architecture
//!
//! ```text
//!   LifecycleListener / caller
//!            │ upload(event)
//!            ▼
//!      EventUploader ── build not confirmed ──► dropped
//!            │
//!            │ counter += 1
//!            ▼
//!        BatchQueue ──┬── Buffered (timer / drain flush later)
//!            │        ├── Immediate  ──► POST /api/v1/event
//!            │        ├── Screenshot ──► POST /api/v1/screenshots (own pool)
//!            │        └── Flush      ──► POST /api/v1/batch
//!            ▼
//!        Dispatcher ── counter -= delivered count (success or failure)
//! ```
//!
//! Delivery is best-effort: failed payloads are logged and dropped, never
//! re-enqueued.

pub mod queue;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tracing::{debug, error, info};

use crate::config::CollectorConfig;
use crate::delivery::DeliveryCounter;
use crate::event::Event;
use crate::session::Session;
use crate::transport::{HttpTransport, Request, Transport, TransportError, TransportResult};

pub use queue::{BatchQueue, BatchSink, Enqueued};

pub const EVENT_PATH: &str = "/api/v1/event";
pub const BATCH_PATH: &str = "/api/v1/batch";
pub const SCREENSHOTS_PATH: &str = "/api/v1/screenshots";

/// Result type for upload operations.
pub type UploadResult<T> = Result<T, UploadError>;

/// Errors returned by [`EventUploader::upload`].
///
/// Every error has already been logged and the delivery counter settled by
/// the time it is returned.
#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    /// The build is confirmed but no telemetry token is available.
    #[error("Missing telemetry token; events cannot be sent")]
    MissingToken,

    /// The event could not be encoded as JSON.
    #[error("Failed to encode event: {0}")]
    Encode(#[from] serde_json::Error),

    /// The collector could not be reached or refused the payload.
    #[error("Failed to deliver {count} event(s) to {endpoint}: {source}")]
    Delivery {
        endpoint: &'static str,
        count: usize,
        #[source]
        source: TransportError,
    },
}

/// What happened to an uploaded event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadOutcome {
    /// No confirmed build; the event was discarded.
    Dropped,
    /// Held in the batching queue.
    Buffered,
    /// Sent on its own (single event or screenshot).
    Sent,
    /// Completed a batch of this many events, which was sent.
    BatchSent(usize),
}

/// Sends payloads and settles the delivery counter.
pub struct Dispatcher<T: Transport> {
    transport: Arc<T>,
    screenshot_transport: Arc<T>,
    session: Arc<Session>,
    counter: Arc<DeliveryCounter>,
}

impl<T: Transport> Dispatcher<T> {
    pub fn new(
        transport: Arc<T>,
        screenshot_transport: Arc<T>,
        session: Arc<Session>,
        counter: Arc<DeliveryCounter>,
    ) -> Self {
        Self {
            transport,
            screenshot_transport,
            session,
            counter,
        }
    }

    pub async fn send_single(&self, event: Event) -> UploadResult<()> {
        let body = serde_json::to_value(&event);
        self.post(&*self.transport, EVENT_PATH, body, 1, "single").await
    }

    pub async fn send_screenshot(&self, event: Event) -> UploadResult<()> {
        let body = serde_json::to_value(vec![event]);
        let transport = &*self.screenshot_transport;
        self.post(transport, SCREENSHOTS_PATH, body, 1, "screenshot").await
    }

    pub async fn send_batch(&self, batch: Vec<Event>, tag: &str) -> UploadResult<()> {
        let count = batch.len();
        if count == 0 {
            return Ok(());
        }
        let body = serde_json::to_value(&batch);
        self.post(&*self.transport, BATCH_PATH, body, count, tag).await
    }

    async fn post(
        &self,
        transport: &T,
        endpoint: &'static str,
        body: serde_json::Result<Value>,
        count: usize,
        tag: &str,
    ) -> UploadResult<()> {
        let result = self.try_post(transport, endpoint, body, count).await;
        self.counter.decrement(count as u64);

        match result {
            Ok(()) => {
                debug!(tag, endpoint, count, "Delivered events");
                Ok(())
            }
            Err(e @ UploadError::Delivery { .. }) => {
                if let UploadError::Delivery { source, .. } = &e {
                    log_delivery_failure(tag, endpoint, count, source);
                }
                Err(e)
            }
            Err(e) => {
                error!(tag, endpoint, count, "Dropping events: {}", e);
                Err(e)
            }
        }
    }

    async fn try_post(
        &self,
        transport: &T,
        endpoint: &'static str,
        body: serde_json::Result<Value>,
        count: usize,
    ) -> UploadResult<()> {
        let body = body?;
        let auth = self
            .session
            .telemetry_auth()
            .ok_or(UploadError::MissingToken)?;

        transport
            .send(Request::post(endpoint, body).auth(auth))
            .await
            .map(|_| ())
            .map_err(|source| UploadError::Delivery {
                endpoint,
                count,
                source,
            })
    }
}

#[async_trait]
impl<T: Transport + 'static> BatchSink for Dispatcher<T> {
    async fn deliver_batch(&self, batch: Vec<Event>, tag: &str) {
        // Failures are logged by send_batch.
        let _ = self.send_batch(batch, tag).await;
    }
}

fn log_delivery_failure(tag: &str, endpoint: &str, count: usize, err: &TransportError) {
    match err {
        TransportError::Unauthorized(body) => {
            error!(tag, endpoint, count, "Collector rejected credentials (401): {}", body);
        }
        TransportError::Status { status, body } => {
            error!(tag, endpoint, count, status, "Collector returned an error: {}", body);
        }
        e if e.is_transport_level() => {
            error!(tag, endpoint, count, "Could not reach collector: {}", e);
        }
        e => {
            error!(tag, endpoint, count, "Collector response unusable: {}", e);
        }
    }
}

/// Entry point for handing off telemetry events.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use testlens::config::CollectorConfig;
/// use testlens::delivery::DeliveryCounter;
/// use testlens::session::Session;
/// use testlens::uploader::EventUploader;
///
/// # async fn example() -> anyhow::Result<()> {
/// let session = Arc::new(Session::from_env());
/// let counter = Arc::new(DeliveryCounter::new());
/// let uploader = EventUploader::from_config(&CollectorConfig::default(), session, counter)?;
///
/// // ... uploader.upload(event).await ...
///
/// uploader.shutdown(std::time::Duration::from_secs(30)).await;
/// # Ok(())
/// # }
/// ```
pub struct EventUploader<T: Transport + 'static> {
    session: Arc<Session>,
    counter: Arc<DeliveryCounter>,
    dispatcher: Arc<Dispatcher<T>>,
    queue: Arc<BatchQueue<Dispatcher<T>>>,
}

impl EventUploader<HttpTransport> {
    /// Builds an uploader with two HTTP connection pools: one for events and
    /// batches, one for screenshots.
    pub fn from_config(
        config: &CollectorConfig,
        session: Arc<Session>,
        counter: Arc<DeliveryCounter>,
    ) -> TransportResult<Self> {
        let transport = HttpTransport::new(&config.base_url, config.request_timeout())?;
        let screenshots = HttpTransport::new(&config.base_url, config.request_timeout())?;

        Ok(Self::new(
            config,
            Arc::new(transport),
            Arc::new(screenshots),
            session,
            counter,
        ))
    }
}

impl<T: Transport + 'static> EventUploader<T> {
    pub fn new(
        config: &CollectorConfig,
        transport: Arc<T>,
        screenshot_transport: Arc<T>,
        session: Arc<Session>,
        counter: Arc<DeliveryCounter>,
    ) -> Self {
        let dispatcher = Arc::new(Dispatcher::new(
            transport,
            screenshot_transport,
            session.clone(),
            counter.clone(),
        ));
        let queue = BatchQueue::new(
            dispatcher.clone(),
            config.batch_size,
            config.flush_interval(),
        );

        Self {
            session,
            counter,
            dispatcher,
            queue,
        }
    }

    /// Hands one event to the pipeline.
    ///
    /// # Errors
    ///
    /// Returns [`UploadError::MissingToken`] when the build is confirmed but
    /// no token is available, or the delivery error of whatever payload this
    /// call ended up sending. Buffered events never error here; their
    /// failures are logged when the batch goes out.
    pub async fn upload(&self, event: Event) -> UploadResult<UploadOutcome> {
        if !self.session.build_confirmed() {
            debug!("No confirmed build, dropping {:?} event", event.kind());
            return Ok(UploadOutcome::Dropped);
        }
        if self.session.jwt().is_none() {
            error!(
                "Build is confirmed but no telemetry token is set; {:?} event not sent",
                event.kind()
            );
            return Err(UploadError::MissingToken);
        }

        self.queue.ensure_started().await;
        self.counter.increment(1);

        match self.queue.enqueue(event).await {
            Enqueued::Buffered => Ok(UploadOutcome::Buffered),
            Enqueued::Immediate(event) => self
                .dispatcher
                .send_single(event)
                .await
                .map(|_| UploadOutcome::Sent),
            Enqueued::Screenshot(event) => self
                .dispatcher
                .send_screenshot(event)
                .await
                .map(|_| UploadOutcome::Sent),
            Enqueued::Flush(batch) => {
                let count = batch.len();
                self.dispatcher
                    .send_batch(batch, "size")
                    .await
                    .map(|_| UploadOutcome::BatchSent(count))
            }
        }
    }

    /// Events accepted but not yet settled.
    pub fn pending(&self) -> u64 {
        self.counter.pending()
    }

    pub fn counter(&self) -> &Arc<DeliveryCounter> {
        &self.counter
    }

    /// Drains the queue and waits for in-flight deliveries to settle.
    ///
    /// Returns `true` if the counter reached zero within `timeout`.
    pub async fn shutdown(&self, timeout: Duration) -> bool {
        let flushes = self.queue.drain().await;
        debug!("Drained {} batches at shutdown", flushes);

        let idle = self.counter.wait_idle(timeout).await;
        if idle {
            info!("All telemetry events settled");
        } else {
            error!(
                "{} telemetry events still pending after {:?}",
                self.counter.pending(),
                timeout
            );
        }
        idle
    }
}
