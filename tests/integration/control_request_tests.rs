//! Integration tests for correlated control requests.

use agent_tether::engine::interrupt::INTERRUPT_SUBTYPE;
use agent_tether::AppError;

use super::test_helpers::{spawn_engine, STEP};

#[tokio::test]
async fn control_request_is_acknowledged() {
    let temp = tempfile::tempdir().expect("tempdir");
    let engine = spawn_engine(&temp.path().join("spawns.log"));

    let response = tokio::time::timeout(STEP, engine.send_control(INTERRUPT_SUBTYPE))
        .await
        .expect("in time")
        .expect("response received");

    assert!(response.is_success());
    assert!(response.request_id.starts_with("req_1_"), "got {}", response.request_id);
}

/// Each request is matched to its own response.
#[tokio::test]
async fn responses_are_correlated_by_request_id() {
    let temp = tempfile::tempdir().expect("tempdir");
    let engine = spawn_engine(&temp.path().join("spawns.log"));

    let (first, second) = tokio::join!(engine.send_control("status"), engine.send_control("status"));
    let first = first.expect("first response");
    let second = second.expect("second response");

    assert_ne!(first.request_id, second.request_id);
}

#[tokio::test]
async fn request_interrupt_succeeds_without_killing_the_process() {
    let temp = tempfile::tempdir().expect("tempdir");
    let engine = spawn_engine(&temp.path().join("spawns.log"));
    let pid = engine.process_info().expect("live process").pid;

    engine.request_interrupt().await.expect("acknowledged");

    assert_eq!(engine.process_info().expect("still live").pid, pid);
    assert!(!engine.needs_recreation());
}

#[tokio::test]
async fn error_response_is_returned_to_caller() {
    let temp = tempfile::tempdir().expect("tempdir");
    let engine = spawn_engine(&temp.path().join("spawns.log"));

    let response = engine.send_control("reject").await.expect("response received");

    assert!(!response.is_success());
    assert_eq!(response.error.as_deref(), Some("rejected"));
}

#[tokio::test]
async fn unanswered_request_times_out() {
    let temp = tempfile::tempdir().expect("tempdir");
    let engine = spawn_engine(&temp.path().join("spawns.log"));

    let err = engine.send_control("ignore").await.expect_err("no reply");

    assert!(matches!(err, AppError::Timeout(_)), "got {err:?}");
    engine.query_once("ping").await.expect("engine still usable");
}

/// Control traffic during a query never shows up in the query's events.
#[tokio::test]
async fn control_response_during_query_is_not_an_event() {
    let temp = tempfile::tempdir().expect("tempdir");
    let engine = spawn_engine(&temp.path().join("spawns.log"));

    let stream = engine.query("ping").await.expect("query starts");
    let response = engine.send_control("status").await.expect("response");
    assert!(response.is_success());

    let outcome = stream.collect_result().await.expect("query completes");
    assert_eq!(
        outcome.events.iter().map(agent_tether::Event::kind).collect::<Vec<_>>(),
        vec!["init", "assistant"]
    );
}

#[tokio::test]
async fn control_without_process_is_closed() {
    let temp = tempfile::tempdir().expect("tempdir");
    let engine = spawn_engine(&temp.path().join("spawns.log"));
    engine.interrupt();

    let err = engine.send_control("status").await.expect_err("no process");

    assert!(matches!(err, AppError::Closed(_)), "got {err:?}");
}
