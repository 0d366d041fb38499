//! Configuration schema definitions for testlens.
//!
//! # Schema Overview
//!
//! ```text
//! Config (root)
//! ├── CollectorConfig        - Telemetry endpoint, batching and flush timing
//! └── OrchestrationConfig    - Test-ordering endpoint, strategy, build identity
//! ```
//!
//! Both sections are optional; every field has a default. Credentials and
//! sharded-run position are not part of the file and come from the
//! environment (see [`crate::session`] and [`crate::ordering::RunMetadata`]).

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Root configuration structure for testlens.
///
/// # Example
///
/// ```
/// use testlens::config::Config;
///
/// let config: Config = toml::from_str(r#"
///     [collector]
///     batch_size = 50
///
///     [orchestration]
///     enabled = true
///     strategy = "relevant-first"
/// "#).unwrap();
///
/// assert_eq!(config.collector.batch_size, 50);
/// assert!(config.orchestration.enabled);
/// ```
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Telemetry collector settings.
    #[serde(default)]
    pub collector: CollectorConfig,

    /// Remote test-ordering settings.
    #[serde(default)]
    pub orchestration: OrchestrationConfig,
}

/// Telemetry collector settings.
///
/// # Defaults
///
/// | Field | Default |
/// |-------|---------|
/// | `base_url` | `https://collector.testlens.dev` |
/// | `batch_size` | 1000 |
/// | `flush_interval_ms` | 2000 |
/// | `request_timeout_secs` | 30 |
/// | `shutdown_timeout_secs` | 60 |
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct CollectorConfig {
    /// Base URL the `/api/v1/*` event endpoints are resolved against.
    #[serde(default = "default_collector_url")]
    pub base_url: String,

    /// Number of buffered events that triggers an immediate batch flush.
    ///
    /// Values below 1 are treated as 1.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Period of the background flush timer in milliseconds.
    #[serde(default = "default_flush_interval")]
    pub flush_interval_ms: u64,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// How long shutdown waits for pending uploads, in seconds.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout_secs: u64,
}

impl CollectorConfig {
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn shutdown_timeout(&self) -> Duration {
        Duration::from_secs(self.shutdown_timeout_secs)
    }
}

impl Default for CollectorConfig {
    fn default() -> Self {
        Self {
            base_url: default_collector_url(),
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval(),
            request_timeout_secs: default_request_timeout(),
            shutdown_timeout_secs: default_shutdown_timeout(),
        }
    }
}

fn default_collector_url() -> String {
    "https://collector.testlens.dev".to_string()
}

fn default_batch_size() -> usize {
    1000
}

fn default_flush_interval() -> u64 {
    2000
}

fn default_request_timeout() -> u64 {
    30
}

fn default_shutdown_timeout() -> u64 {
    60
}

/// Remote test-ordering settings.
///
/// # Example
///
/// ```toml
/// [orchestration]
/// enabled = true
/// base_url = "https://orchestrator.testlens.dev"
/// prefix = "testorchestration/api/v1"
/// strategy = "failing-first"
/// project_name = "checkout"
/// build_name = "nightly"
/// ```
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct OrchestrationConfig {
    /// Turns reordering on. Off by default.
    #[serde(default)]
    pub enabled: bool,

    /// Base URL of the ordering service. Returned polling URLs that start
    /// with it are made relative again.
    #[serde(default = "default_orchestration_url")]
    pub base_url: String,

    /// Path prefix in front of `split-tests`.
    #[serde(default = "default_prefix")]
    pub prefix: String,

    /// Strategy name; empty or `none` disables reordering.
    #[serde(default)]
    pub strategy: String,

    /// Project the run belongs to.
    pub project_name: Option<String>,

    /// Build the run belongs to.
    pub build_name: Option<String>,

    /// Per-request timeout in seconds.
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

impl OrchestrationConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    /// Path of the submission endpoint, e.g. `/testorchestration/api/v1/split-tests`.
    pub fn split_tests_path(&self) -> String {
        let prefix = self.prefix.trim_matches('/');
        if prefix.is_empty() {
            "/split-tests".to_string()
        } else {
            format!("/{}/split-tests", prefix)
        }
    }
}

impl Default for OrchestrationConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            base_url: default_orchestration_url(),
            prefix: default_prefix(),
            strategy: String::new(),
            project_name: None,
            build_name: None,
            request_timeout_secs: default_request_timeout(),
        }
    }
}

fn default_orchestration_url() -> String {
    "https://orchestrator.testlens.dev".to_string()
}

fn default_prefix() -> String {
    "testorchestration/api/v1".to_string()
}
