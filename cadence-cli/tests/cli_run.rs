use assert_cmd::Command;
use predicates::prelude::*;
use serde_json::Value;
use std::fs;
use tempfile::tempdir;

const COUNTER_MACHINE: &str = r#"
initial: active
states:
  active:
    entry:
      - updateContext: { count: 0 }
    on:
      INC:
        actions:
          - updateContext: { count: { $add: ["$count", "$$by"] } }
      STOP: stopped
  stopped: {}
"#;

fn write_project(dir: &std::path::Path, manifest: &str) {
    fs::write(dir.join("counter.yml"), COUNTER_MACHINE).unwrap();
    fs::write(dir.join("cadence.yml"), manifest).unwrap();
}

#[test]
fn run_json_reports_final_state() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    write_project(
        dir.path(),
        r#"
runtime:
  dispatch:
    auto: false
documents:
  machines/counter: { file: counter.yml }
  config/counter: { state: machines/counter }
schemas:
  INC:
    type: object
    required: [by]
    properties:
      by: { type: integer }
  STOP: {}
actors:
  - id: counter
    accepts: [INC, STOP]
script:
  - send: { to: counter, type: INC, payload: { by: 2 } }
  - send: { to: counter, type: INC, payload: { by: "x" } }
  - send: { to: counter, type: INC, payload: { by: 5 } }
  - send: { to: counter, type: STOP, payload: {} }
"#,
    );

    #[allow(deprecated)]
    let assert = Command::cargo_bin("cadence")?
        .current_dir(dir.path())
        .args(["run", "cadence.yml", "--json"])
        .assert()
        .success();

    let report: Value = serde_json::from_slice(&assert.get_output().stdout)?;
    assert_eq!(report["steps"], 4);
    assert_eq!(report["totals"]["transitions"], 3);
    assert_eq!(report["totals"]["rejected"], 1);

    let counter = &report["actors"][0];
    assert_eq!(counter["id"], "counter");
    assert_eq!(counter["state"], "stopped");
    assert_eq!(counter["watermark"], 4);
    assert_eq!(counter["context"]["count"], 7);

    let diagnostics = report["diagnostics"].as_array().unwrap();
    assert_eq!(diagnostics.len(), 1);
    assert_eq!(diagnostics[0]["kind"], "payload_validation");
    assert_eq!(diagnostics[0]["sequence"], 2);
    Ok(())
}

#[test]
fn run_text_lists_actors() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    write_project(
        dir.path(),
        r#"
documents:
  machines/counter: { file: counter.yml }
  config/counter: { state: machines/counter }
schemas:
  INC: { type: object }
actors:
  - id: counter
    accepts: [INC]
script:
  - send: { to: counter, type: INC, payload: { by: 3 } }
"#,
    );

    #[allow(deprecated)]
    Command::cargo_bin("cadence")?
        .current_dir(dir.path())
        .arg("run")
        .assert()
        .success()
        .stdout(predicate::str::contains("counter  state=active  watermark=1"))
        .stdout(predicate::str::contains("count = 3"));
    Ok(())
}

#[test]
fn run_fails_on_unresolved_payload() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    write_project(
        dir.path(),
        r#"
documents:
  machines/counter: { file: counter.yml }
  config/counter: { state: machines/counter }
schemas:
  INC: { type: object }
actors:
  - id: counter
    accepts: [INC]
script:
  - send: { to: counter, type: INC, payload: { by: "$count" } }
"#,
    );

    #[allow(deprecated)]
    Command::cargo_bin("cadence")?
        .current_dir(dir.path())
        .arg("run")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Script step 1 failed"));
    Ok(())
}

#[test]
fn check_passes_clean_manifest() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    write_project(
        dir.path(),
        r#"
documents:
  machines/counter: { file: counter.yml }
  config/counter: { state: machines/counter }
schemas:
  INC: { type: object }
  STOP: {}
actors:
  - id: counter
    accepts: [INC, STOP]
"#,
    );

    #[allow(deprecated)]
    Command::cargo_bin("cadence")?
        .current_dir(dir.path())
        .args(["check", "cadence.yml"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 errors, 0 warnings"));
    Ok(())
}

#[test]
fn check_json_reports_errors() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    write_project(
        dir.path(),
        r#"
documents:
  machines/counter: { file: counter.yml }
  config/counter: { state: machines/counter }
actors:
  - id: counter
    accepts: [INC]
"#,
    );

    #[allow(deprecated)]
    let assert = Command::cargo_bin("cadence")?
        .current_dir(dir.path())
        .args(["check", "--json"])
        .assert()
        .failure();

    let summary: Value = serde_json::from_slice(&assert.get_output().stdout)?;
    assert_eq!(summary["errors"], 1);
    // STOP is handled but never accepted
    assert_eq!(summary["warnings"], 1);
    Ok(())
}
