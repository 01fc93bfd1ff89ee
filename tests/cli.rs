use std::path::Path;

use assert_cmd::Command;

const PROJECTS: &str = r#"
shutdown_sigterm_ms = 500
start_settle_ms = 50

[[project]]
name = "web"
command = "sleep 100"
workdir = "."
description = "frontend"

[[project]]
name = "api"
command = "sleep 100"
workdir = "."
port = 3000

[[project]]
name = "worker"
command = "sleep 100"
workdir = "."
port = 3000
"#;

fn pmctl(dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("pmctl").unwrap();
    cmd.current_dir(dir)
        .env_remove("PMCTL_CONFIG")
        .env_remove("PMCTL_PORT_REGISTRY")
        .env("NO_COLOR", "1")
        .arg("--state-dir")
        .arg(dir.join("state"));
    cmd
}

fn workspace() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(dir.path().join("projects.toml"), PROJECTS).unwrap();
    dir
}

fn stdout(output: &std::process::Output) -> String {
    String::from_utf8_lossy(&output.stdout).into_owned()
}

#[test]
fn list_shows_every_project_as_stopped() {
    let dir = workspace();
    let output = pmctl(dir.path()).arg("list").output().unwrap();
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("web"));
    assert!(text.contains("frontend"));
    assert!(text.contains("0/3 running"));
    assert!(text.contains("port 3000 is shared by api, worker"));

    let json = pmctl(dir.path()).args(["ls", "--json"]).output().unwrap();
    assert!(json.status.success());
    let value: serde_json::Value = serde_json::from_slice(&json.stdout).unwrap();
    assert_eq!(value.as_array().unwrap().len(), 3);
    assert_eq!(value[0]["state"], "stopped");
}

#[test]
fn unknown_project_exits_non_zero() {
    let dir = workspace();
    let output = pmctl(dir.path()).args(["start", "ghost"]).output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("ghost"));

    let status = pmctl(dir.path()).args(["status", "ghost"]).output().unwrap();
    assert!(!status.status.success());
}

#[test]
fn missing_config_fails_with_message() {
    let dir = tempfile::tempdir().unwrap();
    let output = pmctl(dir.path()).arg("list").output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("no project file found"));

    let invalid = pmctl(dir.path())
        .args(["--config", "missing.toml", "list"])
        .output()
        .unwrap();
    assert!(!invalid.status.success());
}

#[test]
fn stop_of_stopped_project_is_a_notice() {
    let dir = workspace();
    let output = pmctl(dir.path()).args(["stop", "web"]).output().unwrap();
    assert!(output.status.success());
    assert!(stdout(&output).contains("web is not running"));
}

#[test]
fn add_then_remove_edits_the_project_file() {
    let dir = workspace();
    let app = dir.path().join("app");
    std::fs::create_dir(&app).unwrap();
    std::fs::write(app.join("start.sh"), "sleep 100\n").unwrap();

    let added = pmctl(dir.path())
        .args(["add", "app", "app", "--port", "4100"])
        .output()
        .unwrap();
    assert!(added.status.success(), "{:?}", added);
    assert!(stdout(&added).contains("added app"));

    let duplicate = pmctl(dir.path()).args(["add", "app", "app"]).output().unwrap();
    assert!(!duplicate.status.success());
    assert!(String::from_utf8_lossy(&duplicate.stderr).contains("already exists"));

    let json = pmctl(dir.path()).args(["list", "--json"]).output().unwrap();
    let value: serde_json::Value = serde_json::from_slice(&json.stdout).unwrap();
    assert_eq!(value.as_array().unwrap().len(), 4);
    assert_eq!(value[3]["name"], "app");
    assert_eq!(value[3]["port"], 4100);

    let removed = pmctl(dir.path()).args(["remove", "app"]).output().unwrap();
    assert!(removed.status.success(), "{:?}", removed);
    assert!(stdout(&removed).contains("removed app"));
    let text = std::fs::read_to_string(dir.path().join("projects.toml")).unwrap();
    assert!(!text.contains("name = \"app\""));
    assert!(text.contains("name = \"worker\""));

    let unknown = pmctl(dir.path()).args(["remove", "app"]).output().unwrap();
    assert!(!unknown.status.success());
}

#[test]
fn add_without_command_or_script_fails() {
    let dir = workspace();
    std::fs::create_dir(dir.path().join("bare")).unwrap();
    let output = pmctl(dir.path()).args(["add", "bare", "bare"]).output().unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--command"));

    let missing = pmctl(dir.path()).args(["add", "ghost", "nowhere"]).output().unwrap();
    assert!(!missing.status.success());
}

#[test]
fn disk_reports_every_project() {
    let dir = workspace();
    let output = pmctl(dir.path()).args(["disk", "--json"]).output().unwrap();
    assert!(output.status.success());
    let value: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(value.as_array().unwrap().len(), 3);
    assert!(value[0]["bytes"].as_u64().unwrap() > 0);

    let table = pmctl(dir.path()).arg("disk").output().unwrap();
    assert!(stdout(&table).contains("total"));
}

#[cfg(unix)]
#[test]
fn remove_refuses_a_running_project_without_force() {
    let dir = workspace();
    assert!(pmctl(dir.path()).args(["start", "web"]).output().unwrap().status.success());

    let refused = pmctl(dir.path()).args(["remove", "web"]).output().unwrap();
    assert!(!refused.status.success());
    assert!(String::from_utf8_lossy(&refused.stderr).contains("--force"));

    let forced = pmctl(dir.path()).args(["remove", "web", "--force"]).output().unwrap();
    assert!(forced.status.success(), "{:?}", forced);
    assert!(stdout(&forced).contains("stopped web"));
    assert!(stdout(&forced).contains("removed web"));
}

#[cfg(unix)]
#[test]
fn start_status_stop_across_invocations() {
    let dir = workspace();

    let started = pmctl(dir.path()).args(["start", "web"]).output().unwrap();
    assert!(started.status.success(), "{:?}", started);
    assert!(stdout(&started).contains("started web"));

    let again = pmctl(dir.path()).args(["start", "web"]).output().unwrap();
    assert!(again.status.success());
    assert!(stdout(&again).contains("already running"));

    let status = pmctl(dir.path())
        .args(["status", "web", "--json"])
        .output()
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&status.stdout).unwrap();
    assert_eq!(value["state"], "running");
    assert!(value["pid"].as_u64().is_some());

    let stopped = pmctl(dir.path()).args(["stop", "web"]).output().unwrap();
    assert!(stopped.status.success());
    assert!(stdout(&stopped).contains("stopped web"));

    let after = pmctl(dir.path())
        .args(["status", "web", "--json"])
        .output()
        .unwrap();
    let value: serde_json::Value = serde_json::from_slice(&after.stdout).unwrap();
    assert_eq!(value["state"], "stopped");

    let logs = pmctl(dir.path()).args(["logs", "web", "-n", "5"]).output().unwrap();
    assert!(logs.status.success());
    assert!(stdout(&logs).contains("pmctl: starting sleep 100"));
}
