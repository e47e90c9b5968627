#![cfg(feature = "cli")]

use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

fn unique_capture(tag: &str, content: &[u8]) -> PathBuf {
    let dir = std::env::temp_dir().join(format!(
        "fwcli-{tag}-{}-{}",
        std::process::id(),
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("time should be after epoch")
            .as_nanos()
    ));
    std::fs::create_dir_all(&dir).expect("temp dir should be creatable");
    let path = dir.join("capture.bin");
    std::fs::write(&path, content).expect("capture should be writable");
    path
}

fn json_lines(stdout: &[u8]) -> Vec<serde_json::Value> {
    String::from_utf8_lossy(stdout)
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| serde_json::from_str(line).expect("each line should be json"))
        .collect()
}

#[test]
fn decode_clean_capture_prints_each_frame() {
    let capture = unique_capture(
        "clean",
        b":forkwire-event:console-info-log:UTF-8:5:hello:\n:forkwire-event:bye:\n",
    );

    let output = Command::new(env!("CARGO_BIN_EXE_forkwire"))
        .args(["--log-level", "error", "--format", "json", "decode"])
        .arg(&capture)
        .output()
        .expect("decode should run");

    assert_eq!(output.status.code(), Some(0));
    let frames = json_lines(&output.stdout);
    assert_eq!(frames.len(), 2);
    assert_eq!(frames[0]["stream"], "event");
    assert_eq!(frames[0]["opcode"], "console-info-log");
    assert_eq!(frames[0]["fields"][0], "hello");
    assert_eq!(frames[1]["opcode"], "bye");

    if let Some(dir) = capture.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[test]
fn decode_reports_console_noise_with_exit_60() {
    let capture = unique_capture(
        "noise",
        b"Picked up JAVA_TOOL_OPTIONS\n:forkwire-event:next-test:\n",
    );

    let output = Command::new(env!("CARGO_BIN_EXE_forkwire"))
        .args(["--log-level", "warn", "--format", "json", "decode"])
        .arg(&capture)
        .output()
        .expect("decode should run");

    assert_eq!(output.status.code(), Some(60));
    let frames = json_lines(&output.stdout);
    assert_eq!(frames.len(), 1);
    assert_eq!(frames[0]["opcode"], "next-test");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Picked up JAVA_TOOL_OPTIONS"), "{stderr}");

    if let Some(dir) = capture.parent() {
        let _ = std::fs::remove_dir_all(dir);
    }
}

#[test]
fn decode_legacy_stdin_raw_reproduces_frames() {
    let input: &[u8] = b":forkwire-command:run-testclass:UTF-8:cGtnLkE=:\n:forkwire-command:noop:\n";

    let mut child = Command::new(env!("CARGO_BIN_EXE_forkwire"))
        .args([
            "--log-level",
            "error",
            "--format",
            "raw",
            "decode",
            "--commands",
            "--variant",
            "legacy",
        ])
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("decode should start");

    child
        .stdin
        .take()
        .expect("stdin should be piped")
        .write_all(input)
        .expect("capture should be written");
    let output = child.wait_with_output().expect("decode should finish");

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(output.stdout, input);
}

#[test]
fn decode_missing_file_fails() {
    let output = Command::new(env!("CARGO_BIN_EXE_forkwire"))
        .args(["decode", "/nonexistent/forkwire/capture.bin"])
        .output()
        .expect("decode should run");

    assert_eq!(output.status.code(), Some(1));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("cannot open"), "{stderr}");
}
