//! Polling for a computed test order.
//!
//! The poll loop is an explicit state machine so each transition can be
//! driven and checked on its own:
//!
//! | State             | Action                                   | Next                                   |
//! |-------------------|------------------------------------------|----------------------------------------|
//! | `Submitted`       | none                                     | `Polling`, `FallbackPolling`, `Expired` |
//! | `Polling`         | GET result url                           | `Resolved`, `Polling`, `FallbackPolling` |
//! | `FallbackPolling` | GET timeout url once                     | `Resolved`, `Expired`                  |
//! | `Resolved`        | terminal                                 |                                        |
//! | `Expired`         | terminal                                 |                                        |
//!
//! The result url is only polled while the elapsed time since submission is
//! under the timeout. Sleeps are capped at the remaining budget, so the
//! fallback request goes out at the deadline, not an interval after it.
//! Cancellation interrupts both in-flight requests and sleeps.

use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::client::PollingDescriptor;
use crate::transport::{Auth, Request, Transport};

/// Poll loop state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollState {
    Submitted,
    Polling,
    FallbackPolling,
    Resolved(Vec<String>),
    Expired,
}

impl PollState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, PollState::Resolved(_) | PollState::Expired)
    }
}

/// Result of a completed poll loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PollOutcome {
    /// Ordered file paths, or `None` when the original order should be kept.
    pub files: Option<Vec<String>>,
    /// Number of GET requests issued against either url.
    pub api_calls: usize,
}

#[derive(Deserialize)]
struct OrderedTests {
    #[serde(default)]
    tests: Vec<OrderedTest>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct OrderedTest {
    file_path: String,
}

/// Drives one [`PollingDescriptor`] to a terminal state.
pub struct Poller<'a, T: Transport> {
    transport: &'a T,
    auth: Auth,
    descriptor: PollingDescriptor,
    cancel: CancellationToken,
    api_calls: usize,
}

impl<'a, T: Transport> Poller<'a, T> {
    pub fn new(transport: &'a T, auth: Auth, descriptor: PollingDescriptor) -> Self {
        Self {
            transport,
            auth,
            descriptor,
            cancel: CancellationToken::new(),
            api_calls: 0,
        }
    }

    /// Ties the loop to an external cancellation token (run teardown).
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn api_calls(&self) -> usize {
        self.api_calls
    }

    /// Runs the state machine until it reaches a terminal state.
    pub async fn run(mut self) -> PollOutcome {
        let mut state = PollState::Submitted;

        while !state.is_terminal() {
            if self.cancel.is_cancelled() {
                info!("Test ordering poll cancelled");
                state = PollState::Expired;
                break;
            }
            state = self.step(state).await;
        }

        let files = match state {
            PollState::Resolved(files) => Some(files),
            _ => None,
        };

        PollOutcome {
            files,
            api_calls: self.api_calls,
        }
    }

    /// Performs the action of `state` and returns the next state.
    pub async fn step(&mut self, state: PollState) -> PollState {
        match state {
            PollState::Submitted => self.start(),
            PollState::Polling => self.poll_result().await,
            PollState::FallbackPolling => self.poll_fallback().await,
            terminal => terminal,
        }
    }

    fn start(&self) -> PollState {
        match (&self.descriptor.result_url, &self.descriptor.timeout_url) {
            (Some(_), _) => PollState::Polling,
            (None, Some(_)) => {
                debug!("No result url; going straight to the timeout url");
                PollState::FallbackPolling
            }
            (None, None) => {
                warn!("Ordering service returned no polling urls");
                PollState::Expired
            }
        }
    }

    async fn poll_result(&mut self) -> PollState {
        let Some(url) = self.descriptor.result_url.clone() else {
            return PollState::FallbackPolling;
        };

        if self.remaining_budget().is_zero() {
            info!(
                "Ordering not ready after {:?} ({} polls); trying fallback",
                self.descriptor.timeout, self.api_calls
            );
            return PollState::FallbackPolling;
        }

        if let Some(files) = self.fetch(&url).await {
            return PollState::Resolved(files);
        }

        let pause = self.descriptor.poll_interval.min(self.remaining_budget());
        tokio::select! {
            _ = self.cancel.cancelled() => PollState::Expired,
            _ = tokio::time::sleep(pause) => PollState::Polling,
        }
    }

    fn remaining_budget(&self) -> Duration {
        self.descriptor
            .timeout
            .saturating_sub(self.descriptor.submitted_at.elapsed())
    }

    async fn poll_fallback(&mut self) -> PollState {
        let Some(url) = self.descriptor.timeout_url.clone() else {
            return PollState::Expired;
        };

        match self.fetch(&url).await {
            Some(files) => PollState::Resolved(files),
            None => {
                info!("No ordering available from fallback; keeping original order");
                PollState::Expired
            }
        }
    }

    /// One GET. Errors and empty answers both mean "no result yet".
    async fn fetch(&mut self, url: &str) -> Option<Vec<String>> {
        self.api_calls += 1;
        let request = Request::get(url).auth(self.auth.clone());

        let response = tokio::select! {
            _ = self.cancel.cancelled() => return None,
            response = self.transport.send(request) => response,
        };

        let body = match response {
            Ok(Value::Null) => return None,
            Ok(body) => body,
            Err(e) => {
                warn!(url, attempt = self.api_calls, "Ordering poll failed: {}", e);
                return None;
            }
        };

        match serde_json::from_value::<OrderedTests>(body) {
            Ok(ordered) if !ordered.tests.is_empty() => {
                Some(ordered.tests.into_iter().map(|t| t.file_path).collect())
            }
            Ok(_) => {
                debug!(url, attempt = self.api_calls, "Ordering not ready yet");
                None
            }
            Err(e) => {
                warn!(url, "Malformed ordering response: {}", e);
                None
            }
        }
    }
}
