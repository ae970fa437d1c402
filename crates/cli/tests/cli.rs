//! End-to-end tests of the `airway` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

const DEMO_PIPELINE: &str = r#"name: demo
stages:
  - name: mesh
    progress: { base: 0, span: 50 }
    artifacts:
      patterns: ["mesh/out.txt"]
    command:
      program: sh
      args: ["-c", "mkdir -p mesh && echo mesh > mesh/out.txt && echo Finished"]
      sentinel: Finished
      success: either
  - name: report
    progress: { base: 50, span: 50 }
    depends-on: [mesh]
    artifacts:
      dir: "report/{flow_rate}LPM"
      patterns: ["summary.txt"]
    command:
      program: sh
      args: ["-c", "echo rate {flow_rate} > summary.txt"]
"#;

fn airway(root: &Path) -> Command {
    let mut cmd = Command::cargo_bin("airway").unwrap();
    cmd.arg("--root").arg(root).env("RUST_LOG", "warn");
    cmd
}

fn demo_workspace(root: &Path) {
    let pipelines = root.join(".airway/pipelines");
    fs::create_dir_all(&pipelines).unwrap();
    fs::write(pipelines.join("demo.yaml"), DEMO_PIPELINE).unwrap();
}

#[test]
fn test_init_then_list_pipelines() {
    let dir = tempdir().unwrap();

    airway(dir.path())
        .arg("init")
        .assert()
        .success()
        .stdout(predicate::str::contains("config.toml"));

    airway(dir.path())
        .arg("pipelines")
        .assert()
        .success()
        .stdout(predicate::str::contains("airway-cfd"))
        .stdout(predicate::str::contains("segmentation-only"));

    airway(dir.path()).arg("init").assert().failure();
}

#[test]
fn test_run_then_reuse() {
    let dir = tempdir().unwrap();
    demo_workspace(dir.path());
    let case = dir.path().join("case");
    fs::create_dir_all(&case).unwrap();

    airway(dir.path())
        .args(["run", "--flow-rate", "15", "--case"])
        .arg(&case)
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"));

    assert_eq!(
        fs::read_to_string(case.join("report/15LPM/summary.txt")).unwrap(),
        "rate 15\n"
    );

    airway(dir.path())
        .args(["run", "--flow-rate", "15", "--case"])
        .arg(&case)
        .assert()
        .success()
        .stdout(predicate::str::contains("mesh (reused)"))
        .stdout(predicate::str::contains("report (reused)"));

    airway(dir.path())
        .args(["status", "--flow-rate", "20", "--case"])
        .arg(&case)
        .assert()
        .success()
        .stdout(predicate::str::is_match(r"mesh\s+complete").unwrap())
        .stdout(predicate::str::is_match(r"report\s+missing").unwrap());
}

#[test]
fn test_rejects_unusable_flow_rate() {
    let dir = tempdir().unwrap();
    demo_workspace(dir.path());
    let case = dir.path().join("case");
    fs::create_dir_all(&case).unwrap();

    for rate in ["--flow-rate=-5", "--flow-rate=NaN", "--flow-rate=inf", "--flow-rate=0", "--flow-rate=-0"] {
        airway(dir.path())
            .args(["run", rate, "--case"])
            .arg(&case)
            .assert()
            .failure()
            .stderr(predicate::str::contains("flow rate must be a positive number"));
    }
    assert!(!case.join("report").exists());
}

#[test]
fn test_failed_run_exits_nonzero_and_cleans_up() {
    let dir = tempdir().unwrap();
    let pipelines = dir.path().join(".airway/pipelines");
    fs::create_dir_all(&pipelines).unwrap();
    fs::write(
        pipelines.join("broken.yaml"),
        r#"name: broken
stages:
  - name: mesh
    progress: { base: 0, span: 100 }
    artifacts:
      dir: mesh
      patterns: ["out.txt"]
    command:
      program: sh
      args: ["-c", "echo half > half.txt; echo boom >&2; exit 3"]
"#,
    )
    .unwrap();
    let case = dir.path().join("case");
    fs::create_dir_all(&case).unwrap();

    airway(dir.path())
        .args(["run", "--case"])
        .arg(&case)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("boom"));
    assert!(case.join("mesh/half.txt").exists());

    airway(dir.path())
        .args(["cleanup", "--stage", "mesh", "--case"])
        .arg(&case)
        .assert()
        .success()
        .stdout(predicate::str::contains("removed output of mesh"));
    assert!(!case.join("mesh").exists());

    airway(dir.path())
        .args(["cleanup", "--stage", "mesh", "--case"])
        .arg(&case)
        .assert()
        .success()
        .stdout(predicate::str::contains("nothing to remove"));
}

#[test]
fn test_json_events() {
    let dir = tempdir().unwrap();
    demo_workspace(dir.path());
    let case = dir.path().join("case");
    fs::create_dir_all(&case).unwrap();

    let output = airway(dir.path())
        .args(["--json", "run", "--flow-rate", "10", "--case"])
        .arg(&case)
        .output()
        .unwrap();
    assert!(output.status.success());

    let stdout = String::from_utf8(output.stdout).unwrap();
    let types: Vec<String> = stdout
        .lines()
        .map(|line| serde_json::from_str::<serde_json::Value>(line).unwrap())
        .filter_map(|value| value["type"].as_str().map(str::to_string))
        .collect();
    assert_eq!(types.first().map(String::as_str), Some("runStarted"));
    assert!(types.iter().any(|t| t == "runCompleted"));
}
