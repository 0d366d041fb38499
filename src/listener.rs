//! Adapter surface between a test runner and the upload pipeline.
//!
//! Runners report what happens through [`LifecycleSignal`]s keyed by their
//! own test/hook ids. The listener keeps the runs that are still open so a
//! finished event reuses its started event's UUID, durations can be computed
//! and logs attach to whatever is currently running.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use serde_json::json;
use tracing::{debug, warn};
use uuid::Uuid;

use crate::event::{Event, Failure, HookRun, LogEntry, LogKind, RunStatus, TestRun};
use crate::transport::Transport;
use crate::uploader::EventUploader;

/// How a test or hook ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Passed,
    Failed {
        message: String,
        backtrace: Option<String>,
    },
}

/// Identity of a test as the runner sees it.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct TestInfo {
    /// Runner-assigned id, stable between start and finish.
    pub id: String,
    pub name: String,
    pub scopes: Vec<String>,
    pub file_name: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HookInfo {
    pub id: String,
    /// e.g. `before_each`, `after_all`
    pub hook_type: String,
    pub name: String,
    pub scopes: Vec<String>,
}

/// Something the runner observed.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleSignal {
    TestStarted(TestInfo),
    TestFinished { id: String, outcome: Outcome },
    TestSkipped(TestInfo),
    HookStarted(HookInfo),
    HookFinished { id: String, outcome: Outcome },
    Log { level: String, message: String },
    Screenshot { name: String, image: String },
    HttpRequest {
        method: String,
        url: String,
        status: Option<u16>,
        duration_ms: u64,
    },
    /// A remote browser/device session opened for the running test.
    SessionCreated { integration: serde_json::Value },
}

#[derive(Default)]
struct ActiveRuns {
    tests: HashMap<String, TestRun>,
    hooks: HashMap<String, HookRun>,
    current_test: Option<String>,
    current_hook: Option<String>,
}

impl ActiveRuns {
    fn current_test_uuid(&self) -> Option<Uuid> {
        self.current_test
            .as_ref()
            .and_then(|id| self.tests.get(id))
            .map(|run| run.uuid)
    }

    fn current_hook_uuid(&self) -> Option<Uuid> {
        self.current_hook
            .as_ref()
            .and_then(|id| self.hooks.get(id))
            .map(|run| run.uuid)
    }
}

/// Turns runner signals into telemetry events and uploads them.
pub struct LifecycleListener<T: Transport + 'static> {
    uploader: Arc<EventUploader<T>>,
    active: Mutex<ActiveRuns>,
}

impl<T: Transport + 'static> LifecycleListener<T> {
    pub fn new(uploader: Arc<EventUploader<T>>) -> Self {
        Self {
            uploader,
            active: Mutex::new(ActiveRuns::default()),
        }
    }

    pub fn uploader(&self) -> &Arc<EventUploader<T>> {
        &self.uploader
    }

    /// Number of tests started but not finished.
    pub fn active_tests(&self) -> usize {
        self.active().tests.len()
    }

    /// Records one runner signal. Upload failures are logged, never returned.
    pub async fn on_lifecycle_event(&self, signal: LifecycleSignal) {
        let Some(event) = self.translate(signal) else {
            return;
        };

        let kind = event.kind();
        if let Err(e) = self.uploader.upload(event).await {
            debug!("{:?} event not delivered: {}", kind, e);
        }
    }

    /// Maps a signal to the event it produces, updating the open runs.
    pub fn translate(&self, signal: LifecycleSignal) -> Option<Event> {
        let now = Utc::now();
        let mut active = self.active();

        match signal {
            LifecycleSignal::TestStarted(info) => {
                let test_run = new_test_run(info.clone(), now, RunStatus::Pending);
                active.current_test = Some(info.id.clone());
                active.tests.insert(info.id, test_run.clone());
                Some(Event::TestRunStarted { test_run })
            }
            LifecycleSignal::TestFinished { id, outcome } => {
                let Some(mut test_run) = active.tests.remove(&id) else {
                    warn!("Finished test '{}' was never started", id);
                    return None;
                };
                if active.current_test.as_deref() == Some(id.as_str()) {
                    active.current_test = None;
                }
                let (result, failure) = settle(outcome);
                test_run.finished_at = Some(now);
                test_run.duration_ms = Some(elapsed_ms(test_run.started_at, now));
                test_run.result = result;
                test_run.failure = failure;
                Some(Event::TestRunFinished { test_run })
            }
            LifecycleSignal::TestSkipped(info) => {
                // a skip may arrive for a test that already started
                let mut test_run = match active.tests.remove(&info.id) {
                    Some(run) => run,
                    None => new_test_run(info.clone(), now, RunStatus::Skipped),
                };
                if active.current_test.as_deref() == Some(info.id.as_str()) {
                    active.current_test = None;
                }
                test_run.result = RunStatus::Skipped;
                test_run.finished_at = Some(now);
                test_run.duration_ms = Some(elapsed_ms(test_run.started_at, now));
                Some(Event::TestRunSkipped { test_run })
            }
            LifecycleSignal::HookStarted(info) => {
                let hook_run = HookRun {
                    uuid: Uuid::new_v4(),
                    hook_type: info.hook_type,
                    name: info.name,
                    scopes: info.scopes,
                    test_run_uuid: active.current_test_uuid(),
                    started_at: now,
                    finished_at: None,
                    duration_ms: None,
                    result: RunStatus::Pending,
                    failure: None,
                };
                active.current_hook = Some(info.id.clone());
                active.hooks.insert(info.id, hook_run.clone());
                Some(Event::HookRunStarted { hook_run })
            }
            LifecycleSignal::HookFinished { id, outcome } => {
                let Some(mut hook_run) = active.hooks.remove(&id) else {
                    warn!("Finished hook '{}' was never started", id);
                    return None;
                };
                if active.current_hook.as_deref() == Some(id.as_str()) {
                    active.current_hook = None;
                }
                let (result, failure) = settle(outcome);
                hook_run.finished_at = Some(now);
                hook_run.duration_ms = Some(elapsed_ms(hook_run.started_at, now));
                hook_run.result = result;
                hook_run.failure = failure;
                Some(Event::HookRunFinished { hook_run })
            }
            LifecycleSignal::Log { level, message } => Some(log_event(
                &active,
                LogKind::TestLog,
                json!({ "level": level, "message": message }),
            )),
            LifecycleSignal::Screenshot { name, image } => Some(log_event(
                &active,
                LogKind::TestScreenshot,
                json!({ "name": name, "image": image }),
            )),
            LifecycleSignal::HttpRequest {
                method,
                url,
                status,
                duration_ms,
            } => Some(log_event(
                &active,
                LogKind::Http,
                json!({
                    "method": method,
                    "url": url,
                    "status": status,
                    "durationMs": duration_ms,
                }),
            )),
            LifecycleSignal::SessionCreated { integration } => {
                let Some(test_run_uuid) = active.current_test_uuid() else {
                    warn!("Remote session opened outside of a test; not recorded");
                    return None;
                };
                Some(Event::SessionCreated {
                    test_run_uuid,
                    integration,
                })
            }
        }
    }

    fn active(&self) -> MutexGuard<'_, ActiveRuns> {
        match self.active.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }
}

fn new_test_run(info: TestInfo, now: DateTime<Utc>, result: RunStatus) -> TestRun {
    TestRun {
        uuid: Uuid::new_v4(),
        name: info.name,
        scopes: info.scopes,
        file_name: info.file_name,
        started_at: now,
        finished_at: None,
        duration_ms: None,
        result,
        failure: None,
    }
}

fn settle(outcome: Outcome) -> (RunStatus, Option<Failure>) {
    match outcome {
        Outcome::Passed => (RunStatus::Passed, None),
        Outcome::Failed { message, backtrace } => (
            RunStatus::Failed,
            Some(Failure::classify(message, backtrace)),
        ),
    }
}

fn elapsed_ms(started_at: DateTime<Utc>, finished_at: DateTime<Utc>) -> u64 {
    (finished_at - started_at).num_milliseconds().max(0) as u64
}

fn log_event(active: &ActiveRuns, kind: LogKind, payload: serde_json::Value) -> Event {
    let mut entry = LogEntry::new(kind, payload);
    entry.test_run_uuid = active.current_test_uuid();
    entry.hook_run_uuid = active.current_hook_uuid();
    Event::LogCreated { logs: vec![entry] }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CollectorConfig;
    use crate::delivery::DeliveryCounter;
    use crate::event::FailureType;
    use crate::session::Session;
    use crate::transport::fake::FakeTransport;
    use crate::uploader::{BATCH_PATH, EVENT_PATH, SCREENSHOTS_PATH};

    fn make_listener(
        session: Session,
    ) -> (
        Arc<FakeTransport>,
        Arc<FakeTransport>,
        LifecycleListener<FakeTransport>,
    ) {
        let transport = Arc::new(FakeTransport::new());
        let screenshots = Arc::new(FakeTransport::new());
        let config = CollectorConfig {
            batch_size: 100,
            ..Default::default()
        };
        let uploader = EventUploader::new(
            &config,
            transport.clone(),
            screenshots.clone(),
            Arc::new(session),
            Arc::new(DeliveryCounter::new()),
        );
        (transport, screenshots, LifecycleListener::new(Arc::new(uploader)))
    }

    fn test_info(id: &str) -> TestInfo {
        TestInfo {
            id: id.to_string(),
            name: format!("test {}", id),
            scopes: vec!["suite".to_string()],
            file_name: Some("tests/suite.spec.ts".to_string()),
        }
    }

    #[test]
    fn test_finished_reuses_started_uuid() {
        let (_, _, listener) = make_listener(Session::new());

        let Some(Event::TestRunStarted { test_run: started }) =
            listener.translate(LifecycleSignal::TestStarted(test_info("t1")))
        else {
            panic!("expected a started event");
        };
        assert_eq!(listener.active_tests(), 1);

        let Some(Event::TestRunFinished { test_run: finished }) =
            listener.translate(LifecycleSignal::TestFinished {
                id: "t1".to_string(),
                outcome: Outcome::Passed,
            })
        else {
            panic!("expected a finished event");
        };

        assert_eq!(finished.uuid, started.uuid);
        assert_eq!(finished.result, RunStatus::Passed);
        assert!(finished.duration_ms.is_some());
        assert_eq!(listener.active_tests(), 0);
    }

    #[test]
    fn test_failure_is_classified() {
        let (_, _, listener) = make_listener(Session::new());
        listener.translate(LifecycleSignal::TestStarted(test_info("t1")));

        let Some(Event::TestRunFinished { test_run }) =
            listener.translate(LifecycleSignal::TestFinished {
                id: "t1".to_string(),
                outcome: Outcome::Failed {
                    message: "AssertionError: expected 1 to equal 2".to_string(),
                    backtrace: None,
                },
            })
        else {
            panic!("expected a finished event");
        };

        assert_eq!(test_run.result, RunStatus::Failed);
        assert_eq!(
            test_run.failure.map(|f| f.failure_type),
            Some(FailureType::AssertionError)
        );
    }

    #[test]
    fn test_unknown_finish_is_ignored() {
        let (_, _, listener) = make_listener(Session::new());

        let event = listener.translate(LifecycleSignal::TestFinished {
            id: "ghost".to_string(),
            outcome: Outcome::Passed,
        });
        assert!(event.is_none());
    }

    #[test]
    fn test_skip_without_start() {
        let (_, _, listener) = make_listener(Session::new());

        let Some(Event::TestRunSkipped { test_run }) =
            listener.translate(LifecycleSignal::TestSkipped(test_info("t9")))
        else {
            panic!("expected a skipped event");
        };
        assert_eq!(test_run.result, RunStatus::Skipped);
        assert_eq!(test_run.name, "test t9");
    }

    #[test]
    fn test_logs_attach_to_running_test_and_hook() {
        let (_, _, listener) = make_listener(Session::new());
        let Some(Event::TestRunStarted { test_run }) =
            listener.translate(LifecycleSignal::TestStarted(test_info("t1")))
        else {
            panic!("expected a started event");
        };
        let Some(Event::HookRunStarted { hook_run }) =
            listener.translate(LifecycleSignal::HookStarted(HookInfo {
                id: "h1".to_string(),
                hook_type: "before_each".to_string(),
                name: "login".to_string(),
                scopes: vec![],
            }))
        else {
            panic!("expected a hook event");
        };
        assert_eq!(hook_run.test_run_uuid, Some(test_run.uuid));

        let Some(Event::LogCreated { logs }) = listener.translate(LifecycleSignal::Log {
            level: "info".to_string(),
            message: "logging in".to_string(),
        }) else {
            panic!("expected a log event");
        };
        assert_eq!(logs[0].test_run_uuid, Some(test_run.uuid));
        assert_eq!(logs[0].hook_run_uuid, Some(hook_run.uuid));

        listener.translate(LifecycleSignal::HookFinished {
            id: "h1".to_string(),
            outcome: Outcome::Passed,
        });
        let Some(Event::LogCreated { logs }) = listener.translate(LifecycleSignal::HttpRequest {
            method: "GET".to_string(),
            url: "https://app.test/".to_string(),
            status: Some(200),
            duration_ms: 12,
        }) else {
            panic!("expected a log event");
        };
        assert_eq!(logs[0].kind, LogKind::Http);
        assert_eq!(logs[0].hook_run_uuid, None);
        assert_eq!(logs[0].payload["durationMs"], 12);
    }

    #[tokio::test]
    async fn test_screenshot_takes_screenshot_pool() {
        let session = Session::new().with_build_confirmed(true).with_jwt("jwt");
        let (transport, screenshots, listener) = make_listener(session);

        listener
            .on_lifecycle_event(LifecycleSignal::Screenshot {
                name: "failure.png".to_string(),
                image: "aGVsbG8=".to_string(),
            })
            .await;

        assert_eq!(screenshots.count(SCREENSHOTS_PATH), 1);
        assert!(transport.requests().is_empty());
        assert_eq!(listener.uploader().pending(), 0);
    }

    #[tokio::test]
    async fn test_events_are_buffered_until_shutdown() {
        let session = Session::new().with_build_confirmed(true).with_jwt("jwt");
        let (transport, _, listener) = make_listener(session);

        listener
            .on_lifecycle_event(LifecycleSignal::TestStarted(test_info("t1")))
            .await;
        listener
            .on_lifecycle_event(LifecycleSignal::TestFinished {
                id: "t1".to_string(),
                outcome: Outcome::Passed,
            })
            .await;
        assert_eq!(listener.uploader().pending(), 2);
        assert_eq!(transport.count(EVENT_PATH), 0);

        assert!(listener.uploader().shutdown(std::time::Duration::from_secs(1)).await);
        assert_eq!(listener.uploader().pending(), 0);
        assert_eq!(transport.requests().len(), 1);
    }

    #[test]
    fn test_session_needs_running_test() {
        let (_, _, listener) = make_listener(Session::new());

        let event = listener.translate(LifecycleSignal::SessionCreated {
            integration: json!({"provider": "grid"}),
        });
        assert!(event.is_none());
    }

    #[tokio::test]
    async fn test_session_is_sent_unbatched() {
        let session = Session::new().with_build_confirmed(true).with_jwt("jwt");
        let (transport, _, listener) = make_listener(session);

        listener
            .on_lifecycle_event(LifecycleSignal::TestStarted(test_info("t1")))
            .await;
        let Some(Event::TestRunStarted { test_run }) = listener.translate(
            LifecycleSignal::TestStarted(test_info("t2")),
        ) else {
            panic!("expected a started event");
        };

        let Some(event) = listener.translate(LifecycleSignal::SessionCreated {
            integration: json!({"provider": "grid", "session_id": "abc"}),
        }) else {
            panic!("expected a session event");
        };
        assert_eq!(event.uuid(), Some(test_run.uuid));

        listener.uploader().upload(event).await.unwrap();

        let requests = transport.requests();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].path, EVENT_PATH);
        assert_eq!(
            requests[0].body.as_ref().unwrap()["integration"]["session_id"],
            "abc"
        );
        // the started event is still buffered
        assert_eq!(transport.count(BATCH_PATH), 0);
        assert_eq!(listener.uploader().pending(), 1);
    }
}
