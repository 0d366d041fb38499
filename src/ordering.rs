//! Remote test-file ordering.
//!
//! Before a run starts, the file list is submitted to the ordering service,
//! which answers with polling endpoints. The poller then waits for the
//! computed order, falling back to the timeout endpoint when the budget runs
//! out.
//!
//! ```text
//!   files ──► OrchestrationHandler::reorder
//!                  │
//!                  │ submit()                        POST /{prefix}/split-tests
//!                  ▼
//!             OrderingClient ──────────────────────► PollingDescriptor
//!                  │
//!                  ▼
//!               Poller  Submitted ─► Polling ─┬─► Resolved(files)
//!                                       │     └─► FallbackPolling ─┬─► Resolved(files)
//!                                       │                          └─► Expired
//!                                       └─(no urls)─────────────────► Expired
//! ```
//!
//! Nothing here can fail the run: every error path ends in "keep the
//! original order".

pub mod client;
pub mod handler;
pub mod poller;

use std::fmt;

use tracing::warn;

use crate::transport::TransportError;

pub use client::{OrderingClient, PollingDescriptor, PrDetails, RunMetadata};
pub use handler::{Instrumentation, OrchestrationHandler};
pub use poller::{PollOutcome, PollState, Poller};

/// Result type for ordering operations.
pub type OrderingResult<T> = Result<T, OrderingError>;

/// Errors from the submission step.
#[derive(Debug, thiserror::Error)]
pub enum OrderingError {
    /// No orchestration bearer token is available.
    #[error("Missing orchestration token")]
    MissingToken,

    /// The submission payload could not be encoded.
    #[error("Failed to encode split-tests request: {0}")]
    Encode(#[from] serde_json::Error),

    /// The service could not be reached or rejected the request.
    #[error("split-tests request failed: {0}")]
    Transport(#[from] TransportError),

    /// The service answered with something that isn't a polling descriptor.
    #[error("Unexpected split-tests response: {0}")]
    InvalidResponse(String),
}

/// Ordering algorithm requested from the remote service.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    /// Reordering disabled.
    None,
    RelevantFirst,
    FailingFirst,
    SmartSelection,
}

impl Strategy {
    /// Resolves a configured strategy name.
    ///
    /// Empty strings and `none` disable reordering. Unknown names also
    /// disable it, with a warning.
    ///
    /// # Example
    ///
    /// ```
    /// use testlens::ordering::Strategy;
    ///
    /// assert_eq!(Strategy::resolve("failing-first"), Strategy::FailingFirst);
    /// assert_eq!(Strategy::resolve(""), Strategy::None);
    /// assert!(!Strategy::resolve("bogus").is_enabled());
    /// ```
    pub fn resolve(name: &str) -> Self {
        match name.trim().to_ascii_lowercase().as_str() {
            "" | "none" => Strategy::None,
            "relevant-first" | "relevant_first" => Strategy::RelevantFirst,
            "failing-first" | "failing_first" => Strategy::FailingFirst,
            "smart-selection" | "smart_selection" => Strategy::SmartSelection,
            other => {
                warn!("Unknown orchestration strategy '{}', reordering disabled", other);
                Strategy::None
            }
        }
    }

    pub fn is_enabled(self) -> bool {
        self != Strategy::None
    }

    /// Wire tag sent to the ordering service.
    pub fn as_str(self) -> &'static str {
        match self {
            Strategy::None => "none",
            Strategy::RelevantFirst => "relevant-first",
            Strategy::FailingFirst => "failing-first",
            Strategy::SmartSelection => "smart-selection",
        }
    }
}

impl fmt::Display for Strategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
