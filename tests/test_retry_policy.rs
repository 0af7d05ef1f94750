//! Retry timing tests
//!
//! Uses paused tokio time so the delays between attempts can be measured
//! exactly without waiting for them.


use pipeline_plugin::runtime::{CycleOutcome, Handlers, PluginRuntime};
use pipeline_plugin::testing::mocks::{FnTaskHandler, MemoryBlobStore, MockController};
use pipeline_plugin::transport::{RetryPolicy, RetryingTransport, TransportError};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_helpers::{single_file_task, test_config};
use tokio::time::Instant;

/// Run `call` over a scripted sequence of failures; returns the gaps between attempts
async fn attempt_gaps(
    script: Vec<TransportError>,
) -> (Result<&'static str, TransportError>, Vec<Duration>) {
    let transport = RetryingTransport::new(RetryPolicy::default());
    let script = Mutex::new(VecDeque::from(script));
    let attempts = Mutex::new(Vec::new());

    let result = transport
        .call("scripted", Duration::ZERO, || {
            attempts.lock().unwrap().push(Instant::now());
            let next = script.lock().unwrap().pop_front();
            async move {
                match next {
                    Some(error) => Err(error),
                    None => Ok("done"),
                }
            }
        })
        .await;

    let attempts = attempts.into_inner().unwrap();
    let gaps = attempts.windows(2).map(|w| w[1] - w[0]).collect();
    (result, gaps)
}

fn assert_close(actual: Duration, expected: Duration) {
    assert!(
        actual + Duration::from_millis(1) >= expected
            && actual <= expected + Duration::from_millis(2),
        "expected ~{expected:?}, waited {actual:?}"
    );
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_backoff_grows_exponentially_to_cap() {
    let script = (0..26)
        .map(|_| TransportError::unavailable("connection refused"))
        .collect();

    let (result, gaps) = attempt_gaps(script).await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(gaps.len(), 26);
    let policy = RetryPolicy::default();
    for (n, gap) in gaps.iter().enumerate() {
        let expected = policy.backoff_delay(n as u32 + 1);
        assert_close(*gap, expected);
        assert!(*gap <= policy.backoff_cap + Duration::from_millis(2));
    }
    // 1.5^26 ms is the first delay past the cap
    assert_close(gaps[25], Duration::from_secs(30));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_use_steady_delay() {
    let script = vec![
        TransportError::transient("HTTP 500"),
        TransportError::transient("timeout"),
        TransportError::NotFound,
    ];

    let (result, gaps) = attempt_gaps(script).await;

    assert!(result.is_ok());
    for gap in gaps {
        assert_close(gap, Duration::from_secs(2));
    }
}

#[tokio::test(start_paused = true)]
async fn test_unavailable_after_transient_grows_from_steady_delay() {
    let script = vec![
        TransportError::transient("HTTP 500"),
        TransportError::unavailable("connection refused"),
    ];

    let (_, gaps) = attempt_gaps(script).await;

    assert_close(gaps[0], Duration::from_secs(2));
    assert_close(gaps[1], Duration::from_secs(3));
}

#[tokio::test(start_paused = true)]
async fn test_fatal_failure_is_not_retried() {
    let started = Instant::now();

    let (result, gaps) = attempt_gaps(vec![TransportError::fatal("invalid task body")]).await;

    assert!(result.unwrap_err().is_fatal());
    assert!(gaps.is_empty());
    assert_eq!(started.elapsed(), Duration::ZERO);
}

#[tokio::test(start_paused = true)]
async fn test_empty_acquisitions_wait_fixed_idle_delay() {
    let dir = tempfile::tempdir().unwrap();
    let controller = Arc::new(MockController::new());
    for _ in 0..5 {
        controller.push_empty();
    }
    controller.push_task(single_file_task("t-1", serde_json::json!({"@id": "x"}), "http://f"));
    let handlers = Handlers::new().with_task_handler(FnTaskHandler::new(|_, jsonld, _| Ok(jsonld)));
    let mut runtime = PluginRuntime::new(
        Arc::new(test_config("http://controller.local", dir.path())),
        controller.clone(),
        Arc::new(MemoryBlobStore::new("pipeline")),
        handlers,
    )
    .unwrap();

    for _ in 0..5 {
        let started = Instant::now();
        assert_eq!(runtime.run_once().await, CycleOutcome::Idle);
        assert_close(started.elapsed(), Duration::from_secs(1));
    }

    // a task after a run of empty polls is fetched without any backoff
    let started = Instant::now();
    let outcome = runtime.run_once().await;
    assert!(matches!(outcome, CycleOutcome::Reported { .. }));
    assert_eq!(started.elapsed(), Duration::ZERO);
    assert_eq!(controller.fetch_attempts(), 6);
}

#[tokio::test(start_paused = true)]
async fn test_acquisition_rides_out_controller_outage() {
    let dir = tempfile::tempdir().unwrap();
    let controller = Arc::new(MockController::new());
    for _ in 0..3 {
        controller.push_fetch_error(TransportError::unavailable("connection refused"));
    }
    controller.push_task(single_file_task("t-1", serde_json::json!({"@id": "x"}), "http://f"));
    let handlers = Handlers::new().with_task_handler(FnTaskHandler::new(|_, jsonld, _| Ok(jsonld)));
    let mut runtime = PluginRuntime::new(
        Arc::new(test_config("http://controller.local", dir.path())),
        controller.clone(),
        Arc::new(MemoryBlobStore::new("pipeline")),
        handlers,
    )
    .unwrap();

    let outcome = runtime.run_once().await;

    assert!(matches!(outcome, CycleOutcome::Reported { ref task_id, .. } if task_id == "t-1"));
    assert_eq!(controller.fetch_attempts(), 4);
    assert_eq!(controller.submissions().len(), 1);
}
