mod common;

use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use axum::http::StatusCode;
use serde_json::json;

use birdnet_runner::{RunnerError, Worker};
use birdnet_runner::worker::{HostControl, Step};
use common::{FIXTURE_KEY, Harness, MockState, PROCESSOR_ID, job_json};

/// Records power-off calls together with how many shutdown notices the server had seen.
struct RecordingHost {
    state: Arc<MockState>,
    calls: Arc<Mutex<Vec<usize>>>,
    fails: bool,
}

#[async_trait]
impl HostControl for RecordingHost {
    async fn power_off(&self) -> birdnet_runner::Result<()> {
        self.calls.lock().unwrap().push(self.state.notice_count());
        if self.fails {
            return Err(RunnerError::io("Shutdown command exited with exit status: 1"));
        }
        Ok(())
    }
}

fn worker(harness: &Harness, shutdown_on_empty: bool) -> (Worker, Arc<Mutex<Vec<usize>>>) {
    worker_with_host(harness, shutdown_on_empty, false)
}

fn worker_with_host(
    harness: &Harness,
    shutdown_on_empty: bool,
    fails: bool,
) -> (Worker, Arc<Mutex<Vec<usize>>>) {
    let calls = Arc::new(Mutex::new(Vec::new()));
    let state = Arc::clone(&harness.state);
    let host = RecordingHost { state, calls: Arc::clone(&calls), fails };

    let mut config = harness.config.worker.clone();
    config.shutdown_on_empty_queue = shutdown_on_empty;
    config.sleep_secs_on_empty_queue = 0;
    (Worker::new(harness.pipeline(), Box::new(host), &config), calls)
}

#[tokio::test]
async fn test_safe_to_shutdown_sends_one_notice_then_powers_off() {
    let harness = Harness::new().await;
    harness.state.push_dequeue(StatusCode::OK, r#"{"safe_to_shutdown": true}"#);
    let (worker, calls) = worker(&harness, true);

    assert_eq!(worker.step().await, Step::Stop);

    assert_eq!(*calls.lock().unwrap(), vec![1]);
    let notices = harness.state.shutdown_notices.lock().unwrap().clone();
    let expected = json!({"analyzer_instance_id": PROCESSOR_ID, "number_of_runners": 4});
    assert_eq!(notices, vec![expected]);
}

#[tokio::test]
async fn test_run_returns_after_shutdown() {
    let harness = Harness::new().await;
    harness.state.push_dequeue(StatusCode::OK, "{}");
    harness.state.push_dequeue(StatusCode::OK, r#"{"safe_to_shutdown": true}"#);
    let (worker, calls) = worker(&harness, true);

    worker.run().await;
    assert_eq!(calls.lock().unwrap().len(), 1);
    assert_eq!(harness.state.notice_count(), 1);
}

#[tokio::test]
async fn test_failed_power_off_keeps_worker_alive() {
    let harness = Harness::new().await;
    harness.state.push_dequeue(StatusCode::OK, r#"{"safe_to_shutdown": true}"#);
    harness.state.push_job(&job_json(21, 2, FIXTURE_KEY));
    let (worker, calls) = worker_with_host(&harness, true, true);

    assert_eq!(worker.step().await, Step::Sleep);
    assert_eq!(*calls.lock().unwrap(), vec![1]);

    // The loop carries on with the next job
    assert_eq!(worker.step().await, Step::Continue);
    assert_eq!(harness.state.report_count(), 1);
}

#[tokio::test]
async fn test_shutdown_signal_ignored_when_disabled() {
    let harness = Harness::new().await;
    harness.state.push_dequeue(StatusCode::OK, r#"{"safe_to_shutdown": true}"#);
    let (worker, calls) = worker(&harness, false);

    assert_eq!(worker.step().await, Step::Sleep);
    assert!(calls.lock().unwrap().is_empty());
    assert_eq!(harness.state.notice_count(), 0);
}

#[tokio::test]
async fn test_loop_continues_after_job_and_sleeps_when_idle() {
    let harness = Harness::new().await;
    harness.state.push_job(&job_json(10, 2, FIXTURE_KEY));
    harness.state.push_job(&job_json(11, 2, "PROJECT_SLUG/GROUP/missing.wav"));
    harness.state.push_dequeue(StatusCode::INTERNAL_SERVER_ERROR, "");
    let (worker, _) = worker(&harness, true);

    assert_eq!(worker.step().await, Step::Continue);
    // A failed job is dropped and the loop moves on
    assert_eq!(worker.step().await, Step::Continue);
    // No job was obtained
    assert_eq!(worker.step().await, Step::Sleep);
    assert_eq!(worker.step().await, Step::Sleep);

    assert_eq!(harness.state.report_count(), 1);
    assert_eq!(harness.state.notice_count(), 0);
}
