// CLI integration tests for one-shot `invoke` runs against real scripts.
#![cfg(unix)]

use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output, Stdio};

use serde_json::{Value, json};

fn cmd() -> Command {
    let exe = env!("CARGO_BIN_EXE_predictcrop");
    Command::new(exe)
}

fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, body).expect("write script");
    path
}

fn script_command(path: &Path) -> String {
    format!("sh '{}'", path.display())
}

fn parse_json(output: &[u8]) -> Value {
    let text = String::from_utf8_lossy(output);
    let line = text.lines().next().expect("json line");
    serde_json::from_str(line).expect("valid json")
}

fn invoke_with_stdin(command: &str, extra: &[&str], stdin: &[u8]) -> Output {
    let mut child = cmd()
        .arg("invoke")
        .arg("--command")
        .arg(command)
        .args(extra)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .expect("spawn");
    child
        .stdin
        .take()
        .expect("stdin")
        .write_all(stdin)
        .expect("write stdin");
    child.wait_with_output().expect("output")
}

#[test]
fn invoke_relays_script_stdout() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        temp.path(),
        "backend.sh",
        "cat > /dev/null\nprintf '{\"predicted_crop\":\"Paddy\"}\\n'\n",
    );

    let output = cmd()
        .args([
            "invoke",
            "--command",
            &script_command(&script),
            "--data-json",
            r#"{"Carbon":1.1}"#,
        ])
        .output()
        .expect("invoke");
    assert!(output.status.success());
    let value = parse_json(&output.stdout);
    assert_eq!(
        value,
        json!({"status": 200, "body": {"predicted_crop": "Paddy"}})
    );
}

#[test]
fn invoke_reads_body_from_stdin() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(temp.path(), "echo.sh", "cat\n");

    let output = invoke_with_stdin(
        &script_command(&script),
        &[],
        br#"{"Magnesium": 7, "Calcium": 30}"#,
    );
    assert!(output.status.success());
    let value = parse_json(&output.stdout);
    assert_eq!(value["status"], 200);
    assert_eq!(value["body"], json!({"Magnesium": 7, "Calcium": 30}));
}

#[test]
fn invoke_reports_stderr_as_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(
        temp.path(),
        "warn.sh",
        "printf '{\"crop\":\"wheat\"}'\nprintf 'warning: deprecated' >&2\n",
    );

    let output = invoke_with_stdin(&script_command(&script), &[], b"{}");
    assert_eq!(output.status.code(), Some(1));
    let value = parse_json(&output.stdout);
    assert_eq!(
        value,
        json!({"status": 500, "body": {"error": "warning: deprecated"}})
    );
}

#[test]
fn invoke_masks_non_json_output() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(temp.path(), "oops.sh", "printf oops\n");

    let output = invoke_with_stdin(&script_command(&script), &[], b"{}");
    assert_eq!(output.status.code(), Some(1));
    let value = parse_json(&output.stdout);
    assert_eq!(
        value["body"],
        json!({"error": "Invalid response from Python script"})
    );
}

#[test]
fn invoke_times_out_slow_script() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(temp.path(), "slow.sh", "sleep 30\n");

    let output = invoke_with_stdin(&script_command(&script), &["--timeout-ms", "300"], b"{}");
    assert_eq!(output.status.code(), Some(1));
    let value = parse_json(&output.stdout);
    assert_eq!(value["status"], 500);
    let message = value["body"]["error"].as_str().expect("error message");
    assert!(message.contains("timed out after 300 ms"), "{message}");
}

#[test]
fn invoke_treats_non_zero_exit_as_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let script = write_script(temp.path(), "crash.sh", "printf '{}'\nexit 2\n");

    let output = invoke_with_stdin(&script_command(&script), &[], b"{}");
    assert_eq!(output.status.code(), Some(1));
    let value = parse_json(&output.stdout);
    let message = value["body"]["error"].as_str().expect("error message");
    assert!(message.contains("exit status: 2"), "{message}");
}

#[test]
fn data_json_and_stdin_decode_alike() {
    let from_flag = cmd()
        .args(["invoke", "--command", "cat", "--data-json", "{nope"])
        .output()
        .expect("invoke");
    let from_stdin = invoke_with_stdin("cat", &[], b"{nope");
    assert!(from_flag.status.success());
    assert!(from_stdin.status.success());
    let expected = json!({"status": 200, "body": "{nope"});
    assert_eq!(parse_json(&from_flag.stdout), expected);
    assert_eq!(parse_json(&from_stdin.stdout), expected);

    let empty = cmd()
        .args(["invoke", "--command", "cat", "--data-json", ""])
        .output()
        .expect("invoke");
    assert_eq!(parse_json(&empty.stdout), json!({"status": 200, "body": {}}));
}

#[test]
fn serve_check_emits_resolved_config() {
    let output = cmd()
        .args(["serve", "--timeout-ms", "1500", "check", "--json"])
        .output()
        .expect("check");
    assert!(output.status.success());
    let value = parse_json(&output.stdout);
    assert_eq!(value["config"]["timeout_ms"], 1500);
    assert_eq!(value["config"]["command"], "python3 functions/backend.py");
    assert_eq!(value["config"]["bind"], "127.0.0.1:8080");
}

#[test]
fn serve_check_rejects_zero_body_limit() {
    let output = cmd()
        .args(["serve", "--max-body-bytes", "0", "check"])
        .output()
        .expect("check");
    assert_eq!(output.status.code(), Some(2));
    let err = parse_json(&output.stderr);
    assert_eq!(err["error"]["kind"], "Usage");
    assert!(err["error"]["hint"].is_string());
}
