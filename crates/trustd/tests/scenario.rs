//! The trustd binary end to end over a local socket

mod common;

use std::time::Duration;
use tempfile::tempdir;

use common::{ask_over_stdio, Daemon};
use trustd::store::{SqliteStore, Store};

const SERVICE: &str = "UnlikelyToEverExistOutsideOfTesting";

#[test]
fn test_fifty_requests_over_local_socket() {
    let dir = tempdir().unwrap();
    let endpoint = dir.path().join("agent.sock");
    let endpoint = endpoint.to_str().unwrap();
    let store = dir.path().join("store.db");

    let mut stub = Daemon::spawn(
        &[
            "stub",
            "--for-service",
            SERVICE,
            "--remote-agent",
            "local-socket",
            "--endpoint",
            endpoint,
        ],
        &[],
    );
    assert!(stub.wait_for_log("listening on", Duration::from_secs(10)));

    let skeleton = Daemon::spawn(
        &[
            "skeleton",
            "--for-service",
            SERVICE,
            "--remote-agent",
            "local-socket",
            "--endpoint",
            endpoint,
            "--local-agent",
            "always-deny",
            "--store-path",
            store.to_str().unwrap(),
        ],
        &[],
    );
    assert!(stub.wait_for_log("attached", Duration::from_secs(10)));

    let answers = ask_over_stdio(&mut stub, 50);
    assert_eq!(answers, vec!["denied"; 50]);

    assert!(skeleton.terminate().success());
    assert!(stub.terminate().success());

    let records = SqliteStore::open(&store).unwrap().records(SERVICE).unwrap();
    assert_eq!(records.len(), 50);
    assert!(records.iter().all(|r| !r.answer.is_granted()));
}

#[test]
fn test_stub_without_skeleton_denies() {
    let dir = tempdir().unwrap();
    let endpoint = dir.path().join("agent.sock");

    let mut stub = Daemon::spawn(
        &[
            "stub",
            "--for-service",
            SERVICE,
            "--remote-agent",
            "local-socket",
            "--endpoint",
            endpoint.to_str().unwrap(),
        ],
        &[],
    );
    assert!(stub.wait_for_log("listening on", Duration::from_secs(10)));

    assert_eq!(ask_over_stdio(&mut stub, 3), vec!["denied"; 3]);
    assert!(stub.terminate().success());
    assert!(!endpoint.exists());
}

#[test]
fn test_second_stub_on_live_endpoint_fails() {
    let dir = tempdir().unwrap();
    let endpoint = dir.path().join("agent.sock");
    let args = [
        "stub",
        "--for-service",
        SERVICE,
        "--remote-agent",
        "local-socket",
        "--endpoint",
        endpoint.to_str().unwrap(),
        "--no-stdio",
    ];

    let first = Daemon::spawn(&args, &[]);
    assert!(first.wait_for_log("listening on", Duration::from_secs(10)));

    let status = std::process::Command::new(common::BINARY)
        .args(args)
        .stdin(std::process::Stdio::null())
        .output()
        .unwrap()
        .status;
    assert!(!status.success());

    assert!(first.terminate().success());
}

#[test]
fn test_interactive_without_prompt_fails_at_startup() {
    let dir = tempdir().unwrap();
    let output = std::process::Command::new(common::BINARY)
        .args([
            "skeleton",
            "--for-service",
            SERVICE,
            "--remote-agent",
            "local-socket",
            "--endpoint",
            dir.path().join("agent.sock").to_str().unwrap(),
            "--local-agent",
            "interactive",
            "--memory-store",
        ])
        .env("HOME", dir.path())
        .env("XDG_CONFIG_HOME", dir.path())
        .output()
        .unwrap();

    assert!(!output.status.success());
}
