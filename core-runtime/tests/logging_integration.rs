//! Integration tests for logging system

use bridge_traits::time::LogLevel;
use core_runtime::logging::{init_logging, read_log_tail, LogFormat, LoggingConfig};
use std::time::Duration;

// Logging can only be initialized once per process, so everything that needs
// a live subscriber lives in this one test.
#[test]
fn test_file_log_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let log_dir = dir.path().join("logs");

    let guard = init_logging(
        LoggingConfig::default()
            .with_format(LogFormat::Compact)
            .with_level(LogLevel::Debug)
            .with_filter("logging_integration=debug")
            .with_file_log(&log_dir),
    )
    .expect("first initialization succeeds");
    assert!(guard.has_file_log());

    tracing::info!(key = "abc123", "range written");
    tracing::debug!("trim pass finished");

    // Dropping the guard flushes the background writer.
    drop(guard);
    std::thread::sleep(Duration::from_millis(50));

    let tail = read_log_tail(&log_dir, 4096).unwrap();
    assert!(tail.contains("range written"));
    assert!(tail.contains("abc123"));
    assert!(tail.contains("trim pass finished"));

    let short = read_log_tail(&log_dir, 8).unwrap();
    assert!(short.len() <= 8);

    let second = init_logging(LoggingConfig::default());
    assert!(second.is_err());
}
