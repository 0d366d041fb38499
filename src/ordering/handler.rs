//! Entry point for reordering a run's test files.

use std::collections::BTreeMap;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use futures::FutureExt;
use serde::Serialize;
use serde_json::Value;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use super::Strategy;
use super::client::{OrderingClient, RunMetadata};
use crate::config::OrchestrationConfig;
use crate::session::Session;
use crate::transport::{HttpTransport, Transport, TransportResult};

/// Diagnostics about one reordering attempt, keyed by stable names.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(transparent)]
pub struct Instrumentation {
    values: BTreeMap<String, Value>,
}

impl Instrumentation {
    pub fn record(&mut self, key: &str, value: impl Into<Value>) {
        self.values.insert(key.to_string(), value.into());
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.values.get(key)
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Value)> {
        self.values.iter()
    }
}

/// Submits file lists and waits for the remote order.
///
/// Callers always get either a new order or `None`, meaning "keep yours".
pub struct OrchestrationHandler<T: Transport> {
    client: OrderingClient<T>,
    config: OrchestrationConfig,
    metadata: RunMetadata,
    cancel: CancellationToken,
    instrumentation: Mutex<Instrumentation>,
}

impl OrchestrationHandler<HttpTransport> {
    /// Builds a handler backed by a dedicated HTTP pool.
    pub fn from_config(
        config: &OrchestrationConfig,
        session: Arc<Session>,
        metadata: RunMetadata,
    ) -> TransportResult<Self> {
        let transport = Arc::new(HttpTransport::new(
            config.base_url.clone(),
            config.request_timeout(),
        )?);
        let client = OrderingClient::new(transport, session, config);
        Ok(Self::new(client, config.clone(), metadata))
    }
}

impl<T: Transport> OrchestrationHandler<T> {
    pub fn new(client: OrderingClient<T>, config: OrchestrationConfig, metadata: RunMetadata) -> Self {
        Self {
            client,
            config,
            metadata,
            cancel: CancellationToken::new(),
            instrumentation: Mutex::new(Instrumentation::default()),
        }
    }

    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    /// Token that aborts an in-progress poll when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn strategy(&self) -> Strategy {
        Strategy::resolve(&self.config.strategy)
    }

    pub fn is_enabled(&self) -> bool {
        self.config.enabled && self.strategy().is_enabled()
    }

    /// Instrumentation from the most recent [`reorder`](Self::reorder).
    pub fn instrumentation(&self) -> Instrumentation {
        match self.instrumentation.lock() {
            Ok(data) => data.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Returns the remote order for `files`, or `None` to keep the original.
    ///
    /// Empty input, a disabled feature, or a `none` strategy short-circuit
    /// without touching the network. Failures and panics on the remote path
    /// are logged and swallowed.
    pub async fn reorder(&self, files: &[String]) -> Option<Vec<String>> {
        let start = Instant::now();
        let mut data = Instrumentation::default();
        data.record("enabled", false);
        data.record("uploadedTestFilesCount", 0);
        data.record("splitTestsAPICallCount", 0);
        data.record("nodeIndex", self.metadata.node_index);
        data.record("totalNodes", self.metadata.total_nodes);

        let ordered = if files.is_empty() {
            debug!("No test files to reorder");
            None
        } else if !self.is_enabled() {
            debug!(
                "Test reordering disabled (enabled: {}, strategy: {})",
                self.config.enabled,
                self.strategy()
            );
            None
        } else {
            data.record("enabled", true);
            data.record("uploadedTestFilesCount", files.len());

            match AssertUnwindSafe(self.apply(files, &mut data))
                .catch_unwind()
                .await
            {
                Ok(ordered) => ordered,
                Err(_) => {
                    error!("Test reordering panicked; keeping original order");
                    None
                }
            }
        };

        data.record("applied", ordered.is_some());
        data.record(
            "downloadedTestFilesCount",
            ordered.as_ref().map_or(0, Vec::len),
        );
        data.record("timeTakenToApplyMs", start.elapsed().as_millis() as u64);

        match self.instrumentation.lock() {
            Ok(mut slot) => *slot = data,
            Err(poisoned) => *poisoned.into_inner() = data,
        }

        ordered
    }

    async fn apply(&self, files: &[String], data: &mut Instrumentation) -> Option<Vec<String>> {
        let strategy = self.strategy();
        let descriptor = self.client.submit(files, strategy, &self.metadata).await?;

        let outcome = self
            .client
            .poller(descriptor)
            .with_cancellation_token(self.cancel.clone())
            .run()
            .await;
        data.record("splitTestsAPICallCount", outcome.api_calls);

        match outcome.files {
            Some(ordered) => {
                info!(
                    "Applied {} ordering to {} of {} files",
                    strategy,
                    ordered.len(),
                    files.len()
                );
                Some(ordered)
            }
            None => {
                info!("No ordering received; keeping original order");
                None
            }
        }
    }
}
