//! End-to-end tests for the fork lifecycle: spawn, message sequence, wait,
//! timeout escalation and kill.

use forkpool::channel::{Payload, Topic};
use forkpool::fork::{Fork, spawn_fork};
use forkpool::{ForkpoolError, TaskError};
use serde_json::{Value, json};
use std::time::{Duration, Instant};

#[test]
fn test_execute_message_sequence_on_success() {
    let mut fork = Fork::new(Box::new(|_| {
        // The test harness reroutes `println!` even in forked children;
        // write to the real handle so the capture sees it.
        use std::io::Write as _;
        writeln!(std::io::stdout(), "hello from the child").unwrap();
        Ok(json!({"answer": 42}))
    }));
    spawn_fork(&mut fork).expect("spawn must succeed");

    fork.wait_for_completion(Some(Duration::from_secs(10)))
        .expect("child must exit cleanly");

    let messages = fork.channel().unwrap().receive(true, None).unwrap();
    let topics: Vec<Topic> = messages.iter().map(|m| m.topic()).collect();
    assert_eq!(
        topics,
        vec![
            Topic::ForkStart,
            Topic::ForkOutput,
            Topic::ForkResult,
            Topic::ForkComplete
        ]
    );

    // Every message carries the fork id as its sender.
    assert!(messages.iter().all(|m| m.sender() == Some(fork.id())));

    match messages[1].payload() {
        Payload::Text { text } => assert!(text.contains("hello from the child")),
        other => panic!("expected captured output, got {other:?}"),
    }
    match messages[2].payload() {
        Payload::Value { value } => assert_eq!(value, &json!({"answer": 42})),
        other => panic!("expected result value, got {other:?}"),
    }
}

#[test]
fn test_execute_reports_body_error() {
    let mut fork = Fork::new(Box::new(|_| Err(TaskError::new("body failed on purpose"))));
    spawn_fork(&mut fork).expect("spawn must succeed");

    fork.wait_for_completion(Some(Duration::from_secs(10)))
        .expect("task-level failure must not change the exit status");

    let messages = fork.channel().unwrap().receive(true, None).unwrap();
    let topics: Vec<Topic> = messages.iter().map(|m| m.topic()).collect();
    assert_eq!(
        topics,
        vec![
            Topic::ForkStart,
            Topic::ForkError,
            Topic::ForkOutput,
            Topic::ForkResult,
            Topic::ForkComplete
        ]
    );

    match messages[1].payload() {
        Payload::Error { error } => assert_eq!(error.message(), "body failed on purpose"),
        other => panic!("expected error payload, got {other:?}"),
    }
    // No result value after a failure.
    assert_eq!(messages[3].payload(), &Payload::Empty);
}

#[test]
fn test_execute_contains_panics() {
    let mut fork = Fork::new(Box::new(|_| panic!("boom in the child")));
    spawn_fork(&mut fork).expect("spawn must succeed");

    fork.wait_for_completion(Some(Duration::from_secs(10)))
        .expect("a panicking body must still exit cleanly");

    let messages = fork.channel().unwrap().receive(true, Some(Topic::ForkError)).unwrap();
    assert_eq!(messages.len(), 1);
    match messages[0].payload() {
        Payload::Error { error } => assert!(error.message().contains("boom in the child")),
        other => panic!("expected error payload, got {other:?}"),
    }
}

#[test]
fn test_is_running_tracks_child_lifetime() {
    let mut fork = Fork::new(Box::new(|_| {
        std::thread::sleep(Duration::from_millis(400));
        Ok(Value::Null)
    }));
    spawn_fork(&mut fork).unwrap();

    assert!(fork.is_running().unwrap());
    fork.wait_for_completion(None).unwrap();
    assert!(!fork.is_running().unwrap());
}

#[test]
fn test_wait_timeout_kills_the_child() {
    let mut fork = Fork::new(Box::new(|_| {
        std::thread::sleep(Duration::from_secs(10));
        Ok(Value::Null)
    }));
    spawn_fork(&mut fork).unwrap();

    let start = Instant::now();
    let err = fork
        .wait_for_completion(Some(Duration::from_secs(1)))
        .expect_err("a sleeping child must trip the timeout");

    assert!(matches!(err, ForkpoolError::Timeout { .. }));
    // Timeout plus grace, nowhere near the child's 10 s sleep.
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(!fork.is_running().unwrap());
    assert!(fork.channel().unwrap().is_closed());
}

#[test]
fn test_kill_escalates_to_sigkill() {
    use nix::sys::signal::{SigHandler, Signal, signal};

    let mut fork = Fork::new(Box::new(|_| {
        // A child that shrugs off the polite signal.
        unsafe {
            signal(Signal::SIGTERM, SigHandler::SigIgn).ok();
        }
        std::thread::sleep(Duration::from_secs(30));
        Ok(Value::Null)
    }));
    spawn_fork(&mut fork).unwrap();

    // Give the child time to install its SIGTERM disposition.
    std::thread::sleep(Duration::from_millis(300));

    let start = Instant::now();
    fork.kill(Duration::from_millis(200)).unwrap();

    // SIGTERM was ignored, so the escalation path must have reaped it.
    assert!(start.elapsed() < Duration::from_secs(5));
    assert!(!fork.is_running().unwrap());
}

#[test]
fn test_kill_grace_is_floored() {
    let mut fork = Fork::new(Box::new(|_| {
        std::thread::sleep(Duration::from_secs(30));
        Ok(Value::Null)
    }));
    spawn_fork(&mut fork).unwrap();

    let start = Instant::now();
    fork.kill(Duration::ZERO).unwrap();
    // The 200 ms floor applies even when the caller asks for less.
    assert!(start.elapsed() >= Duration::from_millis(200));
    assert!(!fork.is_running().unwrap());
}

#[test]
fn test_spawned_fork_cannot_be_respawned() {
    let mut fork = Fork::new(Box::new(|_| Ok(Value::Null)));
    spawn_fork(&mut fork).unwrap();
    assert!(fork.is_started());

    let err = spawn_fork(&mut fork).expect_err("second spawn must fail");
    assert!(matches!(err, ForkpoolError::Contract(_)));

    fork.wait_for_completion(None).unwrap();
}
