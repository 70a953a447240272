use std::fs;
use std::process::Command;

fn binary() -> &'static str {
    env!("CARGO_BIN_EXE_tacho-hold")
}

#[test]
fn test_help_lists_flags() {
    let output = Command::new(binary())
        .arg("--help")
        .output()
        .expect("Failed to run tacho-hold");

    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("USAGE"));
    assert!(stdout.contains("--target-hz"));
    assert!(stdout.contains("--journal"));
}

#[test]
fn test_unknown_flag_is_rejected() {
    let output = Command::new(binary())
        .arg("--no-such-flag")
        .output()
        .expect("Failed to run tacho-hold");

    assert_eq!(output.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&output.stderr).contains("--no-such-flag"));
}

#[test]
fn test_run_limit_cancels_and_journals() {
    let dir = tempfile::tempdir().expect("Failed to create temp dir");
    let journal = dir.path().join("session.jsonl");

    let output = Command::new(binary())
        .args(["--run-seconds", "1", "--target-hz", "30", "--journal"])
        .arg(&journal)
        .env("RUST_LOG", "warn")
        .output()
        .expect("Failed to run tacho-hold");

    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let content = fs::read_to_string(&journal).expect("Journal not written");
    let events: Vec<serde_json::Value> = content
        .lines()
        .map(|line| serde_json::from_str(line).expect("Invalid journal line"))
        .collect();

    assert_eq!(events.first().unwrap()["event_type"], "session_start");
    assert_eq!(events.first().unwrap()["details"]["target_hz"], 30.0);

    let last = events.last().unwrap();
    assert_eq!(last["event_type"], "session_cancelled");
    assert_eq!(last["details"]["outcome"], "cancelled");
    assert_eq!(last["details"]["session"]["phase"], "stopped");
    assert_eq!(last["details"]["session"]["current_duty_pct"], 0.0);

    assert!(events
        .iter()
        .any(|e| e["event_type"] == "phase_transition" && e["details"]["to"] == "calibrating"));
}
