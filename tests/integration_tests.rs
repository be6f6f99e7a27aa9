//! Integration tests for the mason CLI
//!
//! These drive the binary end to end against temporary projects.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use tempfile::TempDir;

/// Helper to create a mason Command
fn mason() -> Command {
    let mut cmd = cargo_bin_cmd!("mason");
    cmd.env_remove("MASON_DATA_DIR")
        .env_remove("MASON_AGENT_CMD")
        .env_remove("MASON_LOG");
    cmd
}

fn create_temp_project() -> TempDir {
    TempDir::new().unwrap()
}

fn init_mason_project(dir: &TempDir) {
    mason()
        .current_dir(dir.path())
        .arg("init")
        .assert()
        .success();
}

// =============================================================================
// Basic CLI Tests
// =============================================================================

mod cli_basics {
    use super::*;

    #[test]
    fn test_mason_help() {
        mason()
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("review"))
            .stdout(predicate::str::contains("execute"));
    }

    #[test]
    fn test_mason_version() {
        mason().arg("--version").assert().success();
    }

    #[test]
    fn test_init_creates_config_and_data_dir() {
        let dir = create_temp_project();

        mason()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("mason.config.json"));

        assert!(dir.path().join("mason.config.json").exists());
        assert!(dir.path().join(".mason/checkpoints").is_dir());
        assert!(dir.path().join(".mason/cache").is_dir());
        let gitignore = fs::read_to_string(dir.path().join(".gitignore")).unwrap();
        assert!(gitignore.contains(".mason/"));
    }

    #[test]
    fn test_init_keeps_existing_config() {
        let dir = create_temp_project();
        fs::write(
            dir.path().join("mason.config.json"),
            r#"{"stack": "rust", "cacheTtlHours": 2}"#,
        )
        .unwrap();

        mason()
            .current_dir(dir.path())
            .arg("init")
            .assert()
            .success()
            .stdout(predicate::str::contains("already exists"));

        let content = fs::read_to_string(dir.path().join("mason.config.json")).unwrap();
        assert!(content.contains("rust"));
    }

    #[test]
    fn test_project_dir_flag() {
        let dir = create_temp_project();

        mason()
            .arg("--project-dir")
            .arg(dir.path())
            .arg("init")
            .assert()
            .success();

        assert!(dir.path().join("mason.config.json").exists());
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let dir = create_temp_project();
        fs::write(
            dir.path().join("mason.config.json"),
            r#"{"limits": {"maxConcurrentItems": 0}}"#,
        )
        .unwrap();

        mason()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .failure();
    }
}

// =============================================================================
// Backlog Tests
// =============================================================================

mod backlog {
    use super::*;

    #[test]
    fn test_list_empty_backlog() {
        let dir = create_temp_project();
        init_mason_project(&dir);

        mason()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("Backlog is empty"));
    }

    #[test]
    fn test_list_json_empty() {
        let dir = create_temp_project();
        init_mason_project(&dir);

        mason()
            .current_dir(dir.path())
            .args(["list", "--json"])
            .assert()
            .success()
            .stdout(predicate::str::contains("[]"));
    }

    #[test]
    fn test_list_rejects_unknown_status() {
        let dir = create_temp_project();
        init_mason_project(&dir);

        mason()
            .current_dir(dir.path())
            .args(["list", "--status", "bogus"])
            .assert()
            .failure();
    }

    #[test]
    fn test_show_missing_item_fails() {
        let dir = create_temp_project();
        init_mason_project(&dir);

        mason()
            .current_dir(dir.path())
            .args(["show", "42"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Backlog item 42 not found"));
    }

    #[test]
    fn test_approve_all_with_empty_backlog() {
        let dir = create_temp_project();
        init_mason_project(&dir);

        mason()
            .current_dir(dir.path())
            .args(["approve", "--all"])
            .assert()
            .success()
            .stdout(predicate::str::contains("0 item(s) marked approved"));
    }
}

// =============================================================================
// Status and Execute Tests
// =============================================================================

mod status_and_execute {
    use super::*;

    #[test]
    fn test_status_fresh_project() {
        let dir = create_temp_project();
        init_mason_project(&dir);

        mason()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("Lock:"))
            .stdout(predicate::str::contains("Backlog:"));
    }

    #[test]
    fn test_status_json() {
        let dir = create_temp_project();
        init_mason_project(&dir);

        let output = mason()
            .current_dir(dir.path())
            .args(["status", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert!(value["lock"].is_null());
        assert!(value["latestRun"].is_null());
    }

    #[test]
    fn test_execute_without_approved_items() {
        let dir = create_temp_project();
        init_mason_project(&dir);

        mason()
            .current_dir(dir.path())
            .args(["execute", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No approved items"));
    }
}

// =============================================================================
// Lock Tests
// =============================================================================

mod locking {
    use super::*;
    use mason::lock::Lockfile;

    #[test]
    fn test_held_lock_blocks_state_changes() {
        let dir = create_temp_project();
        init_mason_project(&dir);

        // The test process is alive, so this lock is not stale.
        let holder = Lockfile::for_current_process("review");
        fs::write(
            dir.path().join(".mason/mason.lock"),
            serde_json::to_string(&holder).unwrap(),
        )
        .unwrap();

        mason()
            .current_dir(dir.path())
            .args(["approve", "--all"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Another mason run is in progress"));

        // Read-only commands still work and report the holder.
        mason()
            .current_dir(dir.path())
            .arg("status")
            .assert()
            .success()
            .stdout(predicate::str::contains("mason review"));

        assert!(dir.path().join(".mason/mason.lock").exists());
    }

    #[test]
    fn test_held_lock_blocks_execute_before_backlog_read() {
        let dir = create_temp_project();
        init_mason_project(&dir);

        let holder = Lockfile::for_current_process("review");
        fs::write(
            dir.path().join(".mason/mason.lock"),
            serde_json::to_string(&holder).unwrap(),
        )
        .unwrap();

        // With nothing approved, execute would otherwise exit cleanly.
        mason()
            .current_dir(dir.path())
            .arg("execute")
            .assert()
            .failure()
            .stderr(predicate::str::contains("Another mason run is in progress"))
            .stdout(predicate::str::contains("No approved items").not());

        // Planning only reads, so it does not wait on the holder.
        mason()
            .current_dir(dir.path())
            .args(["execute", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("No approved items"));
    }

    #[test]
    fn test_stale_lock_is_cleared() {
        let dir = create_temp_project();
        init_mason_project(&dir);

        let mut holder = Lockfile::for_current_process("execute");
        holder.hostname = "some-other-host".to_string();
        fs::write(
            dir.path().join(".mason/mason.lock"),
            serde_json::to_string(&holder).unwrap(),
        )
        .unwrap();

        mason()
            .current_dir(dir.path())
            .args(["approve", "--all"])
            .assert()
            .success();

        assert!(!dir.path().join(".mason/mason.lock").exists());
    }
}

// =============================================================================
// Doctor Tests
// =============================================================================

mod doctor {
    use super::*;

    #[test]
    fn test_doctor_outside_git_repo_fails() {
        let dir = create_temp_project();
        init_mason_project(&dir);

        mason()
            .current_dir(dir.path())
            .env("MASON_AGENT_CMD", "definitely-not-a-real-agent-cli")
            .arg("doctor")
            .assert()
            .failure()
            .stdout(predicate::str::contains("git"))
            .stderr(predicate::str::contains("check(s) failed"));
    }
}

// =============================================================================
// End-to-end review with a fake agent
// =============================================================================

#[cfg(unix)]
mod review_flow {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    const FAKE_AGENT: &str = r#"#!/bin/sh
cat > /dev/null
printf '%s\n' '{"result":"{\"improvements\":[{\"title\":\"Add input validation\",\"problem\":\"Inputs are trusted\",\"solution\":\"Validate at the boundary\",\"impactScore\":8,\"effortScore\":3,\"files\":[\"src/lib.rs\"]}]}","total_cost_usd":0.01,"usage":{"input_tokens":100,"output_tokens":20}}'
"#;

    fn setup_project() -> TempDir {
        let dir = create_temp_project();
        init_mason_project(&dir);
        fs::create_dir_all(dir.path().join("src")).unwrap();
        fs::write(
            dir.path().join("src/lib.rs"),
            "pub fn parse(input: &str) -> i32 { input.parse().unwrap() }\n",
        )
        .unwrap();
        let script = dir.path().join("fake-agent");
        fs::write(&script, FAKE_AGENT).unwrap();
        fs::set_permissions(&script, fs::Permissions::from_mode(0o755)).unwrap();
        dir
    }

    #[test]
    fn test_review_list_approve() {
        let dir = setup_project();
        let agent = dir.path().join("fake-agent");

        mason()
            .current_dir(dir.path())
            .env("MASON_AGENT_CMD", &agent)
            .arg("review")
            .assert()
            .success()
            .stdout(predicate::str::contains("Review complete"));

        mason()
            .current_dir(dir.path())
            .arg("list")
            .assert()
            .success()
            .stdout(predicate::str::contains("Add input validation"));

        mason()
            .current_dir(dir.path())
            .args(["approve", "--all"])
            .assert()
            .success()
            .stdout(predicate::str::contains("1 item(s) marked approved"));

        mason()
            .current_dir(dir.path())
            .args(["execute", "--dry-run"])
            .assert()
            .success()
            .stdout(predicate::str::contains("Wave 1"));
    }

    #[test]
    fn test_second_review_is_served_from_cache() {
        let dir = setup_project();
        let agent = dir.path().join("fake-agent");

        mason()
            .current_dir(dir.path())
            .env("MASON_AGENT_CMD", &agent)
            .arg("review")
            .assert()
            .success();

        let output = mason()
            .current_dir(dir.path())
            .env("MASON_AGENT_CMD", &agent)
            .args(["review", "--json"])
            .output()
            .unwrap();
        assert!(output.status.success());
        let outcome: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
        assert_eq!(outcome["status"], "completed");
        assert_eq!(outcome["tokensUsed"], 0);
        assert_eq!(outcome["itemIds"].as_array().unwrap().len(), 0);
    }
}
