//! Unit tests for `AppError` display prefixes and classification.

use agent_tether::AppError;

#[test]
fn display_prefixes_are_stable() {
    let cases = [
        (AppError::Config("x".into()), "config: x"),
        (AppError::Spawn("x".into()), "spawn: x"),
        (AppError::Protocol("x".into()), "protocol: x"),
        (AppError::Usage("x".into()), "usage: x"),
        (AppError::Closed("x".into()), "closed: x"),
        (AppError::Timeout("x".into()), "timeout: x"),
        (AppError::Io("x".into()), "io: x"),
    ];

    for (err, expected) in cases {
        assert_eq!(err.to_string(), expected);
    }
}

#[test]
fn interrupted_reads_as_user_cancellation() {
    assert_eq!(AppError::Interrupted.to_string(), "interrupted by user");
}

#[test]
fn exit_with_code_includes_stderr_tail() {
    let err = AppError::Exited {
        code: Some(3),
        stderr: "fatal: boom".into(),
    };
    assert_eq!(err.to_string(), "exited: process exited with code 3 (fatal: boom)");
}

#[test]
fn exit_by_signal_without_stderr() {
    let err = AppError::Exited {
        code: None,
        stderr: String::new(),
    };
    assert_eq!(err.to_string(), "exited: process terminated by signal");
}

#[test]
fn only_non_zero_exits_are_abnormal() {
    let clean = AppError::Exited {
        code: Some(0),
        stderr: String::new(),
    };
    let failed = AppError::Exited {
        code: Some(1),
        stderr: String::new(),
    };
    let signalled = AppError::Exited {
        code: None,
        stderr: String::new(),
    };

    assert!(!clean.is_abnormal_exit());
    assert!(failed.is_abnormal_exit());
    assert!(signalled.is_abnormal_exit());
    assert!(!AppError::Interrupted.is_abnormal_exit());
}

#[test]
fn messages_have_no_trailing_period() {
    let err = AppError::Timeout("no control_response for req_1_abcd1234".into());
    assert!(!err.to_string().ends_with('.'));
}

#[test]
fn io_errors_convert() {
    let io = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
    let err: AppError = io.into();
    assert_eq!(err, AppError::Io("pipe closed".into()));
}

#[test]
fn json_errors_convert_to_protocol() {
    let json_err = serde_json::from_str::<serde_json::Value>("{").expect_err("bad json");
    let err: AppError = json_err.into();
    assert!(matches!(err, AppError::Protocol(_)));
}
