//! Integration tests for the conductor CLI
//!
//! These tests drive the binary end to end on skill-only workflows, plus a
//! gate backed by a shell rating provider.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

/// Helper to create a conductor Command rooted in `dir`
fn conductor(dir: &TempDir) -> Command {
    let mut cmd = cargo_bin_cmd!("conductor");
    cmd.current_dir(dir.path())
        .env_remove("CONDUCTOR_STATE_DIR")
        .env_remove("CONDUCTOR_WORKER_CMD")
        .env_remove("CONDUCTOR_MAX_WORKERS")
        .env_remove("CONDUCTOR_MEMORY_CEILING_MB")
        .env_remove("CONDUCTOR_PRESSURE_POLICY")
        .env_remove("CONDUCTOR_LOG_LEVEL")
        .env("RUST_LOG", "warn");
    cmd
}

/// Helper to create a temporary project directory
fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn write_file(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, content).unwrap();
    path
}

fn runs_dir(dir: &TempDir) -> PathBuf {
    dir.path().join(".conductor").join("runs")
}

/// The only run in the project's state directory.
fn single_run_id(dir: &TempDir) -> String {
    let mut ids: Vec<String> = fs::read_dir(runs_dir(dir))
        .unwrap()
        .flatten()
        .filter(|e| e.path().join("run.json").exists())
        .map(|e| e.file_name().to_string_lossy().to_string())
        .collect();
    assert_eq!(ids.len(), 1, "expected exactly one run, found {:?}", ids);
    ids.remove(0)
}

fn run_json(dir: &TempDir, run_id: &str) -> serde_json::Value {
    let content = fs::read_to_string(runs_dir(dir).join(run_id).join("run.json")).unwrap();
    serde_json::from_str(&content).unwrap()
}

const EMIT_MERGE: &str = r##"
id: notes
steps:
  - id: intro
    kind: skill-invoke
    skill: emit
    params:
      text: "Goal: {{input.goal}}"
  - id: body
    kind: skill-invoke
    skill: emit
    params:
      text: "Body for {{run_id}}"
  - id: summary
    kind: skill-invoke
    skill: merge
    dependencies: [intro, body]
    params:
      header: "# Summary"
"##;

/// Plan, gate and a follow-up step. The provider command is filled in by
/// `write_gate_project`.
const PLAN_GATE: &str = r#"
id: gated
max_rating_rounds: 1
steps:
  - id: plan
    kind: skill-invoke
    skill: emit
    params:
      text: "Plan for {{input.goal}}"
  - id: review
    kind: gate
    dependencies: [plan]
    providers: [shell]
    minimum_score: 7
  - id: build
    kind: skill-invoke
    skill: emit
    dependencies: [review]
    params:
      text: built
"#;

fn write_gate_project(dir: &TempDir, score: u32) -> PathBuf {
    write_file(
        dir,
        ".conductor/conductor.toml",
        &format!(
            r#"
[[gate.providers]]
name = "shell"
kind = "command"
command = "echo '{{\"score\": {}, \"feedback\": \"needs more detail\"}}'"
"#,
            score
        ),
    );
    write_file(dir, "gated.yaml", PLAN_GATE)
}

fn artifact(dir: &TempDir, run_id: &str, name: &str) -> String {
    fs::read_to_string(runs_dir(dir).join(run_id).join("artifacts").join(name)).unwrap()
}

fn assert_file_exists(path: &Path) {
    assert!(path.exists(), "missing {}", path.display());
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_conductor_help() {
        let dir = create_temp_project();
        conductor(&dir)
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("run"))
            .stdout(predicate::str::contains("workflow"));
    }

    #[test]
    fn test_conductor_version() {
        let dir = create_temp_project();
        conductor(&dir).arg("--version").assert().success();
    }

    #[test]
    fn test_run_status_requires_run_id() {
        let dir = create_temp_project();
        conductor(&dir).args(["run", "status"]).assert().failure();
    }

    #[test]
    fn test_run_list_empty() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["run", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No runs"));
    }

    #[test]
    fn test_status_of_unknown_run_fails() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["run", "status", "--run-id", "does-not-exist"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("not found"));
    }
}

// =============================================================================
// Config Tests
// =============================================================================

mod config_commands {
    use super::*;

    #[test]
    fn test_config_show_defaults() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No conductor.toml found"))
            .stdout(predicate::str::contains("max_concurrent_workers = 3"));
    }

    #[test]
    fn test_config_init_creates_toml() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Created conductor.toml"));

        let path = dir.path().join(".conductor/conductor.toml");
        assert_file_exists(&path);
        let content = fs::read_to_string(path).unwrap();
        assert!(content.contains("[engine]"));
        assert!(content.contains("[pressure]"));

        conductor(&dir)
            .args(["config", "init"])
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));
    }

    #[test]
    fn test_config_validate_no_config() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Using defaults"));
    }

    #[test]
    fn test_config_validate_reports_warnings() {
        let dir = create_temp_project();
        write_file(
            &dir,
            ".conductor/conductor.toml",
            "[engine]\nmax_concurrent_workers = 0\n\n[pressure]\nceiling_mb = 1000\nmin_free_mb = 2000\n",
        );
        conductor(&dir)
            .args(["config", "validate"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_concurrent_workers"))
            .stdout(predicate::str::contains("min_free_mb"));
    }

    #[test]
    fn test_env_overrides_file() {
        let dir = create_temp_project();
        write_file(&dir, ".conductor/conductor.toml", "[engine]\nmax_concurrent_workers = 2\n");
        conductor(&dir)
            .env("CONDUCTOR_MAX_WORKERS", "5")
            .args(["config", "show"])
            .assert()
            .success()
            .stdout(predicate::str::contains("max_concurrent_workers = 5"));
    }

    #[test]
    fn test_invalid_config_fails() {
        let dir = create_temp_project();
        write_file(&dir, ".conductor/conductor.toml", "[pressure]\npolicy = \"panic\"\n");
        conductor(&dir).args(["config", "show"]).assert().failure();
    }
}

// =============================================================================
// Workflow Tests
// =============================================================================

mod workflow_check {
    use super::*;

    #[test]
    fn test_check_valid_workflow_prints_waves() {
        let dir = create_temp_project();
        let path = write_file(&dir, "notes.yaml", EMIT_MERGE);
        conductor(&dir)
            .args(["workflow", "check"])
            .arg(&path)
            .assert()
            .success()
            .stdout(predicate::str::contains("Workflow 'notes' is valid"))
            .stdout(predicate::str::contains("wave 1: intro, body"))
            .stdout(predicate::str::contains("wave 2: summary"));
    }

    #[test]
    fn test_check_reports_every_problem() {
        let dir = create_temp_project();
        let path = write_file(
            &dir,
            "broken.yaml",
            r#"
id: broken
steps:
  - id: a
    kind: skill-invoke
    skill: teleport
  - id: a
    kind: skill-invoke
    skill: emit
    dependencies: [ghost]
"#,
        );
        conductor(&dir)
            .args(["workflow", "check"])
            .arg(&path)
            .assert()
            .failure()
            .stdout(predicate::str::contains("unknown skill 'teleport'"))
            .stdout(predicate::str::contains("duplicate step id 'a'"))
            .stdout(predicate::str::contains("unknown step 'ghost'"));
    }

    #[test]
    fn test_check_rejects_cycle() {
        let dir = create_temp_project();
        let path = write_file(
            &dir,
            "cycle.json",
            r#"{"id": "cycle", "steps": [
                {"id": "a", "kind": "skill-invoke", "skill": "emit", "dependencies": ["b"]},
                {"id": "b", "kind": "skill-invoke", "skill": "emit", "dependencies": ["a"]}
            ]}"#,
        );
        conductor(&dir)
            .args(["workflow", "check"])
            .arg(&path)
            .assert()
            .failure()
            .stdout(predicate::str::contains("Cycle detected"));
    }

    #[test]
    fn test_check_missing_file_fails() {
        let dir = create_temp_project();
        conductor(&dir)
            .args(["workflow", "check", "nope.yaml"])
            .assert()
            .failure();
    }
}

// =============================================================================
// Run Tests
// =============================================================================

mod run_commands {
    use super::*;

    #[test]
    fn test_run_start_completes_skill_workflow() {
        let dir = create_temp_project();
        let path = write_file(&dir, "notes.yaml", EMIT_MERGE);
        conductor(&dir)
            .args(["run", "start"])
            .arg(&path)
            .args(["--input", "goal=ship the feature"])
            .assert()
            .success()
            .stdout(predicate::str::contains("started"))
            .stdout(predicate::str::contains("completed"));

        let run_id = single_run_id(&dir);
        assert_eq!(run_json(&dir, &run_id)["status"], "completed");
        assert_eq!(artifact(&dir, &run_id, "intro"), "Goal: ship the feature");

        let summary = artifact(&dir, &run_id, "summary");
        assert!(summary.starts_with("# Summary"));
        assert!(summary.contains("## intro"));
        assert!(summary.contains(&format!("Body for {}", run_id)));

        let checkpoints = runs_dir(&dir).join(&run_id).join("checkpoints");
        assert!(fs::read_dir(checkpoints).unwrap().count() >= 3);
    }

    #[test]
    fn test_status_and_list_after_run() {
        let dir = create_temp_project();
        let path = write_file(&dir, "notes.yaml", EMIT_MERGE);
        conductor(&dir).args(["run", "start"]).arg(&path).assert().success();
        let run_id = single_run_id(&dir);

        conductor(&dir)
            .args(["run", "status", &run_id])
            .assert()
            .success()
            .stdout(predicate::str::contains("completed"))
            .stdout(predicate::str::contains("Completed steps (3)"));

        let output = conductor(&dir)
            .args(["run", "status", "--run-id", &run_id, "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let state: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(state["run"]["status"], "completed");
        assert_eq!(state["pending_steps"].as_array().unwrap().len(), 0);
        assert_eq!(state["artifacts"].as_array().unwrap().len(), 3);
        assert_eq!(state["active"], false);

        conductor(&dir)
            .args(["run", "list"])
            .assert()
            .success()
            .stdout(predicate::str::contains(run_id.as_str()))
            .stdout(predicate::str::contains("notes"));
    }

    #[test]
    fn test_completed_run_cannot_resume_or_abort() {
        let dir = create_temp_project();
        let path = write_file(&dir, "notes.yaml", EMIT_MERGE);
        conductor(&dir).args(["run", "start"]).arg(&path).assert().success();
        let run_id = single_run_id(&dir);

        conductor(&dir)
            .args(["run", "resume", &run_id])
            .assert()
            .failure()
            .stderr(predicate::str::contains("cannot move from completed"));
        conductor(&dir)
            .args(["run", "abort", &run_id, "--reason", "late"])
            .assert()
            .failure();
    }

    #[test]
    fn test_invalid_workflow_creates_no_run() {
        let dir = create_temp_project();
        let path = write_file(
            &dir,
            "bad.yaml",
            "id: bad\nsteps:\n  - { id: a, kind: skill-invoke, skill: teleport }\n",
        );
        conductor(&dir)
            .args(["run", "start"])
            .arg(&path)
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid workflow"));
        assert!(!runs_dir(&dir).exists() || fs::read_dir(runs_dir(&dir)).unwrap().count() == 0);
    }

    #[test]
    fn test_malformed_input_fails() {
        let dir = create_temp_project();
        let path = write_file(&dir, "notes.yaml", EMIT_MERGE);
        conductor(&dir)
            .args(["run", "start"])
            .arg(&path)
            .args(["--input", "novalue"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("KEY=VALUE"));
    }

    #[test]
    fn test_failing_skill_exits_nonzero_and_records_error() {
        let dir = create_temp_project();
        let path = write_file(
            &dir,
            "fail.yaml",
            "id: fail\nsteps:\n  - { id: a, kind: skill-invoke, skill: emit }\n",
        );
        conductor(&dir)
            .args(["run", "start"])
            .arg(&path)
            .assert()
            .code(1)
            .stdout(predicate::str::contains("failed"));

        let run_id = single_run_id(&dir);
        let run = run_json(&dir, &run_id);
        assert_eq!(run["status"], "failed");
        assert_eq!(run["metadata"]["error"]["step_id"], "a");
    }

    #[test]
    fn test_state_dir_flag() {
        let dir = create_temp_project();
        let path = write_file(&dir, "notes.yaml", EMIT_MERGE);
        conductor(&dir)
            .args(["--state-dir", "elsewhere", "run", "start"])
            .arg(&path)
            .assert()
            .success();
        assert!(!runs_dir(&dir).exists());
        assert_eq!(fs::read_dir(dir.path().join("elsewhere")).unwrap().count(), 1);
    }
}

// =============================================================================
// Gate Tests
// =============================================================================

mod gate_runs {
    use super::*;

    #[test]
    fn test_gate_pass_completes_run() {
        let dir = create_temp_project();
        let path = write_gate_project(&dir, 9);
        conductor(&dir)
            .args(["run", "start"])
            .arg(&path)
            .args(["-i", "goal=cache layer"])
            .assert()
            .success()
            .stdout(predicate::str::contains("pass"));

        let run_id = single_run_id(&dir);
        let record = runs_dir(&dir)
            .join(&run_id)
            .join("plans")
            .join("plan-rating-r1.json");
        assert_file_exists(&record);
        let rating: serde_json::Value =
            serde_json::from_str(&fs::read_to_string(record).unwrap()).unwrap();
        assert_eq!(rating["passed"], true);
        assert_eq!(artifact(&dir, &run_id, "build"), "built");
    }

    #[test]
    fn test_low_score_waits_for_approval_then_approve_completes() {
        let dir = create_temp_project();
        let path = write_gate_project(&dir, 4);
        conductor(&dir)
            .args(["run", "start"])
            .arg(&path)
            .assert()
            .code(3)
            .stdout(predicate::str::contains("waiting for approval"));

        let run_id = single_run_id(&dir);
        let run = run_json(&dir, &run_id);
        assert_eq!(run["status"], "waiting_approval");
        assert_eq!(run["metadata"]["error"]["tag"], "quality_below_threshold");

        conductor(&dir)
            .args(["run", "resume", &run_id])
            .assert()
            .failure();

        conductor(&dir)
            .args(["run", "approve", &run_id, "--decision", "approve"])
            .assert()
            .success()
            .stdout(predicate::str::contains("completed"));
        assert_eq!(run_json(&dir, &run_id)["status"], "completed");
        assert_eq!(artifact(&dir, &run_id, "build"), "built");
    }

    #[test]
    fn test_reject_fails_run() {
        let dir = create_temp_project();
        let path = write_gate_project(&dir, 2);
        conductor(&dir).args(["run", "start"]).arg(&path).assert().code(3);
        let run_id = single_run_id(&dir);

        conductor(&dir)
            .args(["run", "approve", "--run-id", &run_id, "--decision", "reject"])
            .assert()
            .success()
            .stdout(predicate::str::contains("rejected"));
        assert_eq!(run_json(&dir, &run_id)["status"], "failed");
    }

    #[test]
    fn test_abort_waiting_run() {
        let dir = create_temp_project();
        let path = write_gate_project(&dir, 3);
        conductor(&dir).args(["run", "start"]).arg(&path).assert().code(3);
        let run_id = single_run_id(&dir);

        conductor(&dir)
            .args(["run", "abort", &run_id, "--reason", "superseded"])
            .assert()
            .success()
            .stdout(predicate::str::contains("aborted"));
        let run = run_json(&dir, &run_id);
        assert_eq!(run["status"], "aborted");
        assert_eq!(run["metadata"]["abort_reason"], "superseded");
    }
}
