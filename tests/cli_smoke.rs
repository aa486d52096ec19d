use std::process::{Command, Output};

use serde_json::json;
use tempfile::tempdir;

fn cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_feature-bank"))
        .args(args)
        .env("RUST_LOG", "warn")
        .output()
        .unwrap()
}

fn log_line(key: &str, response: &str) -> String {
    json!({
        "key": key,
        "ts": "2025-03-01T12:00:00.000Z",
        "input": "ačiū",
        "status": "ok",
        "response": {"response": response},
        "durationMs": 3
    })
    .to_string()
}

#[test]
fn providers_lists_builtin_plugins() {
    let out = cli(&["providers"]);
    assert!(out.status.success());
    let stdout = String::from_utf8(out.stdout).unwrap();
    assert!(stdout.contains("translategemma\tTRANSLATION"));
    assert!(stdout.contains("vdu_kirciuoklis\tPHONETICS"));
}

#[test]
fn run_exits_non_zero_when_a_bank_fails() {
    let dir = tempdir().unwrap();
    let in_dir = dir.path().join("in");
    let out_dir = dir.path().join("out");
    std::fs::create_dir_all(&in_dir).unwrap();
    let bank = json!({
        "schemaVersion": "1.0",
        "title": "Broken",
        "sourceLanguage": "lt",
        "features": [{"provider": "nope", "options": {}}],
        "data": ["ačiū"]
    });
    std::fs::write(in_dir.join("broken.json"), bank.to_string()).unwrap();

    let out = cli(&[
        "run",
        "--in-dir",
        in_dir.to_str().unwrap(),
        "--out-dir",
        out_dir.to_str().unwrap(),
        "--replay-policy",
        "REPLAY_ONLY",
    ]);
    assert!(!out.status.success());
    let stderr = String::from_utf8(out.stderr).unwrap();
    assert!(stderr.contains("[broken] Failed: Missing plugins for providers: nope"));
    assert!(!out_dir.join("broken.bank.json").exists());
}

#[test]
fn run_with_empty_input_dir_succeeds() {
    let dir = tempdir().unwrap();
    let in_dir = dir.path().join("in");
    std::fs::create_dir_all(&in_dir).unwrap();
    let out_dir = dir.path().join("out");

    let out = cli(&[
        "run",
        "--in-dir",
        in_dir.to_str().unwrap(),
        "--out-dir",
        out_dir.to_str().unwrap(),
    ]);
    assert!(out.status.success());
    assert!(out_dir.is_dir());
}

#[test]
fn log_stats_and_compact_report_counts() {
    let dir = tempdir().unwrap();
    let log = dir.path().join("api-calls.log.jsonl");
    let lines = [log_line("a", "1"), log_line("b", "2"), log_line("a", "3")];
    std::fs::write(&log, format!("{}\n", lines.join("\n"))).unwrap();
    let log_arg = log.to_str().unwrap();

    let stats = cli(&["log-stats", "--log", log_arg]);
    assert!(stats.status.success());
    assert_eq!(String::from_utf8(stats.stdout).unwrap().trim(), "3 lines; 2 keys");

    let compact = cli(&["log-compact", "--log", log_arg]);
    assert!(compact.status.success());
    assert_eq!(
        String::from_utf8(compact.stdout).unwrap().trim(),
        "compacted 3 lines to 2"
    );
    assert_eq!(std::fs::read_to_string(&log).unwrap().lines().count(), 2);
}

#[test]
fn log_commands_refuse_missing_files() {
    let dir = tempdir().unwrap();
    let missing = dir.path().join("nothing.jsonl");
    let out = cli(&["log-stats", "--log", missing.to_str().unwrap()]);
    assert!(!out.status.success());
    assert!(!missing.exists());
}
