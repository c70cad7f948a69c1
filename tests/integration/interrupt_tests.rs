//! Integration tests for interrupt and lazy recreation.

use agent_tether::{AppError, EngineStatus, Event};

use super::test_helpers::{next_item, spawn_engine, spawn_log, wait_for_assistant, STEP};

/// Interrupting a running query fails it with "interrupted by user"; the
/// next query succeeds on a new process that resumes the conversation.
#[tokio::test]
async fn interrupt_then_next_query_resumes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("spawns.log");
    let engine = spawn_engine(&log);

    let mut stream = engine.query("long task").await.expect("query starts");
    wait_for_assistant(&mut stream).await;
    let continuation = engine.continuation_id();
    let first_pid = engine.process_info().expect("live process").pid;

    engine.interrupt();

    let err = loop {
        match next_item(&mut stream).await {
            Some(Ok(Event::Assistant(_))) => {}
            Some(Err(err)) => break err,
            other => panic!("expected interruption, got {other:?}"),
        }
    };
    assert_eq!(err, AppError::Interrupted);
    assert_eq!(err.to_string(), "interrupted by user");
    assert!(next_item(&mut stream).await.is_none(), "stream ends after the error");
    drop(stream);

    assert_eq!(engine.status(), EngineStatus::PendingRecreation);
    assert!(!engine.is_interrupted(), "flag clears when the query exits");

    let outcome = tokio::time::timeout(STEP, engine.query_once("ping"))
        .await
        .expect("in time")
        .expect("query after interrupt succeeds");
    assert!(outcome.result.is_success());

    let info = engine.process_info().expect("respawned process");
    assert_ne!(info.pid, first_pid);
    assert_eq!(info.generation, 2);
    assert_eq!(engine.continuation_id(), continuation);

    let spawns = spawn_log(&log);
    assert_eq!(spawns.len(), 2);
    assert!(!spawns[0].contains("--resume"));
    assert!(
        spawns[1].ends_with(&format!("--resume {continuation}")),
        "respawn resumes: {}",
        spawns[1]
    );
}

/// Interrupt with no active query still schedules recreation.
#[tokio::test]
async fn interrupt_while_idle_schedules_recreation() {
    let temp = tempfile::tempdir().expect("tempdir");
    let log = temp.path().join("spawns.log");
    let engine = spawn_engine(&log);
    engine.query_once("ping").await.expect("first query");

    engine.interrupt();

    assert_eq!(engine.status(), EngineStatus::PendingRecreation);
    assert!(engine.process_info().is_none(), "process released immediately");

    engine.query_once("ping").await.expect("query after idle interrupt");
    assert_eq!(spawn_log(&log).len(), 2);
    assert_eq!(engine.status(), EngineStatus::Ready);
}

/// Repeated interrupts are harmless and still lead to a single respawn.
#[tokio::test]
async fn repeated_interrupts_respawn_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let engine = spawn_engine(&temp.path().join("spawns.log"));

    engine.interrupt();
    engine.interrupt();
    engine.query_once("ping").await.expect("query");

    let info = engine.process_info().expect("live process");
    assert_eq!(info.generation, 2);
}

/// Stopping the engine ends the active query with `Closed` and rejects
/// later queries.
#[tokio::test]
async fn stop_closes_active_query() {
    let temp = tempfile::tempdir().expect("tempdir");
    let engine = spawn_engine(&temp.path().join("spawns.log"));

    let mut stream = engine.query("long task").await.expect("query starts");
    wait_for_assistant(&mut stream).await;

    tokio::time::timeout(STEP, engine.stop())
        .await
        .expect("stop completes in time");

    let err = loop {
        match next_item(&mut stream).await {
            Some(Ok(_)) => {}
            Some(Err(err)) => break err,
            None => panic!("expected Closed before the stream ended"),
        }
    };
    assert!(matches!(err, AppError::Closed(_)), "got {err:?}");
    drop(stream);

    assert_eq!(engine.status(), EngineStatus::Stopped);
    let err = engine.query("ping").await.expect_err("stopped engine");
    assert!(matches!(err, AppError::Closed(_)));

    engine.interrupt();
    assert_eq!(engine.status(), EngineStatus::Stopped, "interrupt after stop is a no-op");
}
