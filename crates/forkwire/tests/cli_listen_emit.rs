#![cfg(feature = "cli")]

use std::io::{BufRead, BufReader};
use std::net::TcpListener;
use std::process::{Command, Stdio};

#[test]
fn emit_talks_to_listen_until_bye_ack() {
    let mut listen = Command::new(env!("CARGO_BIN_EXE_forkwire"))
        .args([
            "--log-level",
            "error",
            "--format",
            "json",
            "listen",
            "--timeout",
            "20s",
        ])
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("listen should start");

    let mut stderr = BufReader::new(listen.stderr.take().expect("stderr should be piped"));
    let mut config = String::new();
    stderr
        .read_line(&mut config)
        .expect("listen should print the worker config");
    let config = config.trim().to_string();
    assert!(config.starts_with("tcp://127.0.0.1:"), "{config}");
    assert!(config.contains("?sessionId="), "{config}");

    let emit = Command::new(env!("CARGO_BIN_EXE_forkwire"))
        .args(["--log-level", "error", "--format", "json", "emit"])
        .arg(&config)
        .args(["--info", "starting", "--stdout", "line one", "--bye"])
        .output()
        .expect("emit should run");

    assert_eq!(
        emit.status.code(),
        Some(0),
        "{}",
        String::from_utf8_lossy(&emit.stderr)
    );
    let summary: serde_json::Value = serde_json::from_slice(&emit.stdout)
        .expect("emit should print a json summary");
    assert_eq!(summary["events_sent"], 3);
    assert_eq!(summary["bye_acknowledged"], true);
    assert_eq!(summary["variant"], "binary");

    let listened = listen.wait_with_output().expect("listen should finish");
    assert!(listened.status.success());
    let events: Vec<serde_json::Value> = String::from_utf8_lossy(&listened.stdout)
        .lines()
        .map(|line| serde_json::from_str(line).expect("each line should be json"))
        .collect();
    let opcodes: Vec<&str> = events
        .iter()
        .map(|event| event["opcode"].as_str().expect("opcode should be a string"))
        .collect();
    assert_eq!(
        opcodes,
        vec!["console-info-log", "std-out-stream-new-line", "bye"]
    );
    assert_eq!(events[0]["fields"][0], "starting");
    assert_eq!(events[1]["fields"][0], "line one");
    assert_eq!(events[0]["worker"], "worker-1");
}

#[test]
fn emit_rejects_unknown_transport_with_usage_code() {
    let output = Command::new(env!("CARGO_BIN_EXE_forkwire"))
        .args(["emit", "udp://127.0.0.1:9", "--info", "x"])
        .output()
        .expect("emit should run");

    assert_eq!(output.status.code(), Some(64));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("invalid channel configuration"), "{stderr}");
}

#[test]
fn emit_connect_refused_returns_transport_code() {
    let port = {
        let spare = TcpListener::bind("127.0.0.1:0").expect("spare port should bind");
        spare.local_addr().expect("spare addr").port()
    };

    let output = Command::new(env!("CARGO_BIN_EXE_forkwire"))
        .arg("emit")
        .arg(format!("tcp://127.0.0.1:{port}"))
        .args(["--info", "x"])
        .output()
        .expect("emit should run");

    assert_eq!(output.status.code(), Some(3));
}

#[test]
fn version_reports_package_version() {
    let output = Command::new(env!("CARGO_BIN_EXE_forkwire"))
        .arg("version")
        .output()
        .expect("version should run");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_eq!(
        stdout.trim(),
        format!("forkwire {}", env!("CARGO_PKG_VERSION"))
    );
}
