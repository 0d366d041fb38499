//! Submission of a file list to the ordering service.

use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, error, info, warn};

use super::poller::Poller;
use super::{OrderingError, OrderingResult, Strategy};
use crate::config::OrchestrationConfig;
use crate::session::Session;
use crate::transport::{Auth, Request, Transport, TransportError};

/// Used when the service omits `timeout`.
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

/// Used when the service omits `timeoutInterval`.
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 5;

pub const ENV_NODE_INDEX: &str = "TESTLENS_NODE_INDEX";
pub const ENV_TOTAL_NODES: &str = "TESTLENS_TOTAL_NODES";
pub const ENV_BUILD_RUN_ID: &str = "TESTLENS_BUILD_RUN_ID";

/// Pull-request context gathered by source-control collaborators.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PrDetails {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub number: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_branch: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub commit_sha: Option<String>,
}

/// Identity of the run a submission belongs to.
///
/// Sharded runs set `node_index`/`total_nodes` so the service can split the
/// files across nodes.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RunMetadata {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub project_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build_run_identifier: Option<String>,
    pub node_index: u32,
    pub total_nodes: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pr_details: Option<PrDetails>,
    /// Arbitrary extra metadata, merged into the request body.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl Default for RunMetadata {
    fn default() -> Self {
        Self {
            project_name: None,
            build_name: None,
            build_run_identifier: None,
            node_index: 0,
            total_nodes: 1,
            pr_details: None,
            extra: serde_json::Map::new(),
        }
    }
}

impl RunMetadata {
    /// Project/build names from config, node position and run id from the
    /// environment.
    pub fn from_env(config: &OrchestrationConfig) -> Self {
        let node_index = env_number(ENV_NODE_INDEX).unwrap_or(0);
        let total_nodes = env_number(ENV_TOTAL_NODES).unwrap_or(1).max(1);

        Self {
            project_name: config.project_name.clone(),
            build_name: config.build_name.clone(),
            build_run_identifier: std::env::var(ENV_BUILD_RUN_ID)
                .ok()
                .filter(|v| !v.is_empty()),
            node_index,
            total_nodes,
            ..Default::default()
        }
    }

    pub fn with_pr_details(mut self, pr: PrDetails) -> Self {
        self.pr_details = Some(pr);
        self
    }
}

fn env_number(key: &str) -> Option<u32> {
    let raw = std::env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(n) => Some(n),
        Err(_) => {
            warn!("Ignoring non-numeric {}={}", key, raw);
            None
        }
    }
}

/// Where and how long to poll for one submission.
#[derive(Debug, Clone)]
pub struct PollingDescriptor {
    pub result_url: Option<String>,
    pub timeout_url: Option<String>,
    /// Overall budget for polling `result_url`, measured from `submitted_at`.
    pub timeout: Duration,
    pub poll_interval: Duration,
    pub submitted_at: Instant,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct TestFile<'a> {
    file_path: &'a str,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct SplitTestsRequest<'a> {
    tests: Vec<TestFile<'a>>,
    orchestration_strategy: &'a str,
    /// Remote build the run belongs to.
    #[serde(skip_serializing_if = "Option::is_none")]
    build_hashed_id: Option<String>,
    #[serde(flatten)]
    metadata: &'a RunMetadata,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct SplitTestsResponse {
    result_url: Option<String>,
    timeout_url: Option<String>,
    timeout: Option<u64>,
    timeout_interval: Option<u64>,
}

/// Client for the `split-tests` endpoint.
pub struct OrderingClient<T: Transport> {
    transport: Arc<T>,
    session: Arc<Session>,
    base_url: String,
    split_tests_path: String,
}

impl<T: Transport> OrderingClient<T> {
    pub fn new(transport: Arc<T>, session: Arc<Session>, config: &OrchestrationConfig) -> Self {
        Self {
            transport,
            session,
            base_url: config.base_url.clone(),
            split_tests_path: config.split_tests_path(),
        }
    }

    /// Submits `files` and returns where to poll for the result.
    ///
    /// Returns `None` (after logging) on any failure; there is no retry.
    pub async fn submit(
        &self,
        files: &[String],
        strategy: Strategy,
        metadata: &RunMetadata,
    ) -> Option<PollingDescriptor> {
        match self.try_submit(files, strategy, metadata).await {
            Ok(descriptor) => Some(descriptor),
            Err(OrderingError::MissingToken) => {
                error!("No orchestration token available; skipping test reordering");
                None
            }
            Err(OrderingError::Transport(TransportError::Unauthorized(body))) => {
                error!("Ordering service rejected credentials (401): {}", body);
                None
            }
            Err(e) => {
                error!("Failed to submit files for ordering: {}", e);
                None
            }
        }
    }

    /// Like [`submit`](Self::submit) but returns the error.
    pub async fn try_submit(
        &self,
        files: &[String],
        strategy: Strategy,
        metadata: &RunMetadata,
    ) -> OrderingResult<PollingDescriptor> {
        let token = self
            .session
            .orchestration_token()
            .ok_or(OrderingError::MissingToken)?;

        let request = SplitTestsRequest {
            tests: files.iter().map(|f| TestFile { file_path: f }).collect(),
            orchestration_strategy: strategy.as_str(),
            build_hashed_id: self.session.build_hashed_id(),
            metadata,
        };
        let body = serde_json::to_value(&request)?;

        info!(
            "Submitting {} files for ordering (strategy: {}, node {}/{})",
            files.len(),
            strategy,
            metadata.node_index,
            metadata.total_nodes
        );

        let submitted_at = Instant::now();
        let response = self
            .transport
            .send(Request::post(&self.split_tests_path, body).auth(Auth::Bearer(token)))
            .await?;

        let parsed: SplitTestsResponse = serde_json::from_value(response)
            .map_err(|e| OrderingError::InvalidResponse(e.to_string()))?;

        let descriptor = PollingDescriptor {
            result_url: parsed.result_url.map(|u| strip_base_url(&u, &self.base_url)),
            timeout_url: parsed.timeout_url.map(|u| strip_base_url(&u, &self.base_url)),
            timeout: Duration::from_secs(parsed.timeout.unwrap_or(DEFAULT_TIMEOUT_SECS)),
            poll_interval: Duration::from_secs(
                parsed
                    .timeout_interval
                    .unwrap_or(DEFAULT_POLL_INTERVAL_SECS)
                    .max(1),
            ),
            submitted_at,
        };
        debug!("Polling descriptor: {:?}", descriptor);

        Ok(descriptor)
    }

    /// Builds the poller for a descriptor returned by this client.
    pub fn poller(&self, descriptor: PollingDescriptor) -> Poller<'_, T> {
        let auth = self
            .session
            .orchestration_token()
            .map(Auth::Bearer)
            .unwrap_or_default();
        Poller::new(&*self.transport, auth, descriptor)
    }
}

/// Makes `url` relative when it starts with `base`.
///
/// # Example
///
/// ```
/// use testlens::ordering::client::strip_base_url;
///
/// let base = "https://orchestrator.test";
/// assert_eq!(strip_base_url("https://orchestrator.test/results/7", base), "/results/7");
/// assert_eq!(strip_base_url("/results/7", base), "/results/7");
/// assert_eq!(strip_base_url("https://elsewhere.test/r", base), "https://elsewhere.test/r");
/// ```
pub fn strip_base_url(url: &str, base: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        return url.to_string();
    }

    match url.strip_prefix(base) {
        Some("") => "/".to_string(),
        Some(rest) if rest.starts_with('/') => rest.to_string(),
        _ => url.to_string(),
    }
}
