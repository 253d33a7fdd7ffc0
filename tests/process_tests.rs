//! Tests for launch descriptions and the child process handle

#![cfg(unix)]


use abcored::drain::{self, StreamKind};
use abcored::{ChildName, ChildProcess, ChildSpec, NodeVariant, SupervisorConfig};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use test_utils::*;
use tokio::sync::mpsc;

#[test]
fn test_core_node_command_line() {
    let spec = ChildSpec::node(
        Path::new("/data/app"),
        NodeVariant::Core,
        Path::new("/sdcard/bitcoin"),
        Path::new("/sdcard/bitcoin/bitcoin.conf"),
    );

    assert_eq!(
        spec.command_line(),
        vec![
            "/data/app/bitcoind",
            "--server=1",
            "--datadir=/sdcard/bitcoin",
            "--conf=/sdcard/bitcoin/bitcoin.conf",
        ]
    );
    assert_eq!(spec.working_dir, PathBuf::from("/data/app"));
}

#[test]
fn test_liquid_node_command_line() {
    let spec = ChildSpec::node(
        Path::new("/data/app"),
        NodeVariant::Liquid,
        Path::new("/sdcard/bitcoin"),
        Path::new("/sdcard/bitcoin/bitcoin.conf"),
    );

    assert_eq!(spec.command_line()[0], "/data/app/liquidd");
    assert_eq!(spec.args.len(), 3);
    assert_eq!(spec.args[0], "--server=1");
}

#[test]
fn test_tor_args_follow_base_dir() {
    let spec = ChildSpec::tor(Path::new("/srv/abcore"));

    assert_eq!(spec.program, PathBuf::from("/srv/abcore/tor"));
    let data_dir_pos = spec
        .args
        .iter()
        .position(|arg| arg == "DataDirectory")
        .expect("Should pass a DataDirectory");
    assert_eq!(spec.args[data_dir_pos + 1], "/srv/abcore/tordata");
    assert!(spec.args.windows(2).any(|pair| pair == ["CookieAuthentication", "1"]));
    assert!(spec.args.windows(2).any(|pair| pair == ["SocksPort", "auto"]));
}

#[test]
fn test_launch_plan_from_config() {
    let config = SupervisorConfig::new("/data/app");
    let plan = config.launch_plan();

    assert_eq!(plan.proxy.name, ChildName::Tor);
    assert_eq!(plan.node.name, ChildName::Node);
    assert_eq!(plan.node.program, PathBuf::from("/data/app/bitcoind"));
}

#[tokio::test]
async fn test_spawn_nonexistent_command() {
    let dir = temp_dir();
    let spec = missing_child(ChildName::Tor, dir.path());

    let err = ChildProcess::spawn(&spec)
        .err()
        .expect("Should fail to spawn nonexistent command");

    assert_eq!(err.name, ChildName::Tor);
    assert_eq!(err.kind(), ErrorKind::NotFound);
}

#[tokio::test]
async fn test_spawn_and_wait_for_exit_code() {
    let dir = temp_dir();
    let mut process = ChildProcess::spawn(&sh_child(ChildName::Node, "exit 3", dir.path()))
        .expect("Should spawn process");

    assert!(process.pid() > 0);
    let status = process.wait_for_exit().await.unwrap();
    assert_eq!(status.code(), Some(3));
}

#[tokio::test]
async fn test_spawn_uses_working_dir() {
    let dir = temp_dir();
    let mut process = ChildProcess::spawn(&sh_child(ChildName::Node, "pwd", dir.path()))
        .expect("Should spawn process");

    let stdout = process.take_stdout().expect("stdout is piped");
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink_seen = seen.clone();
    drain::attach(
        stdout,
        ChildName::Node,
        StreamKind::Stdout,
        move |line: &str| sink_seen.lock().unwrap().push(line.to_string()),
        None,
    )
    .await
    .unwrap();
    process.wait_for_exit().await.unwrap();

    let expected = std::fs::canonicalize(dir.path()).unwrap();
    let seen = seen.lock().unwrap();
    assert_eq!(seen.len(), 1);
    assert_eq!(std::fs::canonicalize(&seen[0]).unwrap(), expected);
}

#[tokio::test]
async fn test_streams_can_only_be_taken_once() {
    let dir = temp_dir();
    let mut process = ChildProcess::spawn(&sh_child(ChildName::Tor, "exit 0", dir.path()))
        .expect("Should spawn process");

    assert!(process.take_stdout().is_some());
    assert!(process.take_stderr().is_some());
    assert!(process.take_stdout().is_none());
    assert!(process.take_stderr().is_none());
    process.wait_for_exit().await.unwrap();
}

#[tokio::test]
async fn test_terminate_stops_process() {
    let dir = temp_dir();
    let mut process = ChildProcess::spawn(&sh_child(ChildName::Tor, "exec sleep 30", dir.path()))
        .expect("Should spawn process");
    let pid = process.pid();
    assert!(process_alive(pid));

    process.terminate();
    let status = tokio::time::timeout(Duration::from_secs(5), process.wait_for_exit())
        .await
        .expect("Process should exit after terminate")
        .unwrap();

    assert!(!status.success());
    assert!(!process_alive(pid));

    // Terminating a reaped process is a no-op
    process.terminate();
}

#[tokio::test]
async fn test_stderr_digest_from_real_process() {
    let dir = temp_dir();
    let script = "echo one >&2; echo two >&2; echo >&2; echo three >&2; echo four >&2; exit 1";
    let mut process = ChildProcess::spawn(&sh_child(ChildName::Node, script, dir.path()))
        .expect("Should spawn process");

    let (tx, mut rx) = mpsc::unbounded_channel();
    let stderr = process.take_stderr().expect("stderr is piped");
    let drain = drain::attach(stderr, ChildName::Node, StreamKind::Stderr, |_: &str| {}, Some(tx));

    process.wait_for_exit().await.unwrap();
    drain.await.unwrap();

    let report = rx.recv().await.expect("Should deliver a report");
    assert_eq!(report.stream, StreamKind::Stderr);
    assert_eq!(report.lines_read, 5);
    assert_eq!(report.lines, vec!["three", "four"]);
    assert!(rx.recv().await.is_none());
}
