//! Integration tests for the subprocess stream
//!
//! Every test drives a real `/bin/sh` child.

use std::io;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use swu_common::{ExitOutcome, SwuError};
use swuagent::subprocess::{self, ChildProcess, PollEvent, StreamOptions};
use swuagent::LogSink;
use tracing::Level;

#[derive(Default)]
struct Collected {
    lines: Mutex<Vec<(Level, String)>>,
}

impl Collected {
    fn at(&self, level: Level) -> Vec<String> {
        self.lines
            .lock()
            .unwrap()
            .iter()
            .filter(|(l, _)| *l == level)
            .map(|(_, s)| s.clone())
            .collect()
    }
}

impl LogSink for Collected {
    fn log(&self, level: Level, line: &str) {
        self.lines.lock().unwrap().push((level, line.to_string()));
    }
}

fn options() -> (StreamOptions, Arc<Collected>) {
    let sink = Arc::new(Collected::default());
    let mut options = StreamOptions::default().with_sink(sink.clone());
    options.poll_interval = Duration::from_millis(50);
    (options, sink)
}

#[test]
fn test_cat_echoes_payload() {
    let (options, sink) = options();
    let payload = "first line\nsecond line\nno newline at end";
    let mut input = payload.as_bytes();

    let outcome = subprocess::run("cat", &mut input, &options).unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(0));
    assert_eq!(
        sink.at(Level::TRACE),
        vec!["first line", "second line", "no newline at end"]
    );
    assert!(sink.at(Level::ERROR).is_empty());
}

#[test]
fn test_large_payload_does_not_deadlock() {
    // far more than a pipe buffer in both directions
    let line = "0123456789abcdef0123456789abcdef0123456789abcdef012345678\n";
    let payload = line.repeat(40_000);
    let (options, sink) = options();

    let mut input = payload.as_bytes();
    subprocess::run("cat", &mut input, &options).unwrap();

    let out = sink.at(Level::TRACE);
    assert_eq!(out.len(), 40_000);
    assert_eq!(out.join("\n") + "\n", payload);
}

#[test]
fn test_exit_code_reported() {
    for code in [1, 2, 42, 255] {
        let (options, _) = options();
        let started = Instant::now();
        let err = subprocess::run(&format!("exit {}", code), &mut io::empty(), &options)
            .unwrap_err();
        match err {
            SwuError::ChildFailed { outcome, .. } => assert_eq!(outcome, ExitOutcome::Exited(code)),
            other => panic!("expected ChildFailed, got {:?}", other),
        }
        assert!(started.elapsed() < Duration::from_secs(5));
    }
}

#[test]
fn test_exit_without_reading_stdin() {
    let (options, _) = options();
    let payload = vec![b'x'; 1024 * 1024];
    let err = subprocess::run("exit 7", &mut payload.as_slice(), &options).unwrap_err();
    match err {
        SwuError::ChildFailed { outcome, .. } => assert_eq!(outcome, ExitOutcome::Exited(7)),
        other => panic!("expected ChildFailed, got {:?}", other),
    }
}

#[test]
fn test_killed_by_signal() {
    let (options, _) = options();
    let err = subprocess::run("kill -9 $$", &mut io::empty(), &options).unwrap_err();
    match err {
        SwuError::ChildFailed { outcome, .. } => {
            assert!(matches!(outcome, ExitOutcome::Killed(_)));
            assert_ne!(outcome, ExitOutcome::Exited(1));
        }
        other => panic!("expected ChildFailed, got {:?}", other),
    }
}

#[test]
fn test_stderr_routed_at_error_level() {
    let (options, sink) = options();
    subprocess::run("echo out; echo err >&2; printf tail >&2", &mut io::empty(), &options)
        .unwrap();
    assert_eq!(sink.at(Level::TRACE), vec!["out"]);
    assert_eq!(sink.at(Level::ERROR), vec!["err", "tail"]);
}

#[test]
fn test_unknown_command_fails_through_exit_path() {
    let (options, sink) = options();
    let err = subprocess::run("/nonexistent/handler-binary", &mut io::empty(), &options)
        .unwrap_err();
    match err {
        SwuError::ChildFailed { outcome, .. } => assert_eq!(outcome, ExitOutcome::Exited(127)),
        other => panic!("expected ChildFailed, got {:?}", other),
    }
    assert!(!sink.at(Level::ERROR).is_empty());
}

#[test]
fn test_output_after_stdin_closed_is_flushed() {
    let (options, sink) = options();
    let mut input: &[u8] = b"a\nb\n";
    subprocess::run("wc -l; sleep 0.2; printf done", &mut input, &options).unwrap();
    let out = sink.at(Level::TRACE);
    assert_eq!(out.len(), 2);
    assert_eq!(out[0].trim(), "2");
    assert_eq!(out[1], "done");
}

#[test]
fn test_pull_interface() {
    let (options, sink) = options();
    let mut child = ChildProcess::spawn("cat", &options).unwrap();

    assert_eq!(child.poll_process(true).unwrap(), PollEvent::Writable);
    child.write_chunk(b"pulled\n").unwrap();
    child.close_stdin();

    let outcome = child.wait_exit().unwrap();
    assert_eq!(outcome, ExitOutcome::Exited(0));
    child.finish();
    assert_eq!(sink.at(Level::TRACE), vec!["pulled"]);

    // once exited, polling reports the recorded outcome
    assert_eq!(child.poll_process(true).unwrap(), PollEvent::Exited(outcome));
}

#[test]
fn test_drop_flushes_partial_output() {
    let (options, sink) = options();
    {
        let mut child = ChildProcess::spawn("printf partial", &options).unwrap();
        child.close_stdin();
        child.wait_exit().unwrap();
    }
    assert_eq!(sink.at(Level::TRACE), vec!["partial"]);
}
