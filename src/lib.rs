//! testlens: test-run telemetry and remote test ordering.
//!
//! This crate is the client side of a test analytics service. It collects
//! lifecycle events from a test runner and ships them to a collector, and it
//! can ask an ordering service to reorder the run's test files.
//!
//! # Architecture
//!
//! The main components are:
//!
//! - **Listener**: Turns runner signals into telemetry events
//! - **Uploader**: Batches events and delivers them (size and interval flushes)
//! - **Delivery**: Counts events accepted but not yet settled, for shutdown
//! - **Ordering**: Submits file lists and polls for the computed order
//! - **Transport**: The HTTP seam, faked in tests
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use testlens::config::load_config;
//! use testlens::ordering::{OrchestrationHandler, RunMetadata};
//! use testlens::session::Session;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = load_config(std::path::Path::new("testlens.toml"))?;
//!     let session = Arc::new(Session::from_env());
//!     let metadata = RunMetadata::from_env(&config.orchestration);
//!     let handler = OrchestrationHandler::from_config(&config.orchestration, session, metadata)?;
//!
//!     let files = vec!["tests/login.spec.ts".to_string()];
//!     let ordered = handler.reorder(&files).await.unwrap_or(files);
//!     println!("{:?}", ordered);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod delivery;
pub mod event;
pub mod listener;
pub mod ordering;
pub mod session;
pub mod transport;
pub mod uploader;

// Re-export commonly used types
pub use config::{Config, load_config};
pub use delivery::DeliveryCounter;
pub use event::Event;
pub use listener::{LifecycleListener, LifecycleSignal};
pub use ordering::{OrchestrationHandler, Strategy};
pub use session::Session;
pub use transport::{HttpTransport, Transport};
pub use uploader::EventUploader;
