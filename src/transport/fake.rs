//! In-memory transport for unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;
use serde_json::{Value, json};

use super::{Request, Transport, TransportResult};

/// Answers requests from per-path scripts and records everything it sees.
///
/// When a path's script is exhausted, the fallback response is returned.
pub(crate) struct FakeTransport {
    scripts: Mutex<HashMap<String, VecDeque<TransportResult<Value>>>>,
    fallback: TransportResult<Value>,
    requests: Mutex<Vec<Request>>,
}

impl FakeTransport {
    pub(crate) fn new() -> Self {
        Self::with_fallback(Ok(json!({})))
    }

    pub(crate) fn with_fallback(fallback: TransportResult<Value>) -> Self {
        Self {
            scripts: Mutex::new(HashMap::new()),
            fallback,
            requests: Mutex::new(Vec::new()),
        }
    }

    pub(crate) fn respond(self, path: &str, response: TransportResult<Value>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .entry(path.to_string())
            .or_default()
            .push_back(response);
        self
    }

    pub(crate) fn requests(&self) -> Vec<Request> {
        self.requests.lock().unwrap().clone()
    }

    pub(crate) fn count(&self, path: &str) -> usize {
        self.requests
            .lock()
            .unwrap()
            .iter()
            .filter(|r| r.path == path)
            .count()
    }
}

#[async_trait]
impl Transport for FakeTransport {
    async fn send(&self, request: Request) -> TransportResult<Value> {
        let path = request.path.clone();
        self.requests.lock().unwrap().push(request);

        let scripted = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&path)
            .and_then(|queue| queue.pop_front());

        scripted.unwrap_or_else(|| self.fallback.clone())
    }
}
