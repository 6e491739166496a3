#![allow(deprecated)] // cargo_bin is deprecated but still functional

use assert_cmd::Command;
use httpmock::Method::POST;
use httpmock::MockServer;
use predicates::str::contains;
use std::fs;
use std::net::TcpListener;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

fn can_bind_localhost() -> bool {
    TcpListener::bind("127.0.0.1:0").is_ok()
}

fn write_config(dir: &Path, base_url: &str) -> PathBuf {
    let path = dir.join("ardtrack.toml");
    let storage = dir.join("store");
    fs::write(
        &path,
        format!(
            r#"
[storage]
type = "filesystem"
path = "{}"

[remote]
base_url = "{base_url}"
token = "test-token"

[retry]
max_attempts = 1
initial_backoff_ms = 1
max_backoff_ms = 1
"#,
            storage.display()
        ),
    )
    .unwrap();
    path
}

fn ardtrack(config: &Path) -> Command {
    let mut cmd = Command::cargo_bin("ardtrack").unwrap();
    cmd.env("ARDTRACK_CONFIG", config).env_remove("RUST_LOG");
    cmd
}

#[test]
fn help_lists_commands() {
    Command::cargo_bin("ardtrack")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(contains("submit"))
        .stdout(contains("download"))
        .stdout(contains("clean"));
}

#[test]
fn list_on_empty_store() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "http://127.0.0.1:9");

    ardtrack(&config)
        .arg("list")
        .assert()
        .success()
        .stdout(contains("No tracking records"));
}

#[test]
fn invalid_config_is_rejected() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "http://127.0.0.1:9");

    ardtrack(&config)
        .env("ARDTRACK_TRACKER__CONCURRENCY", "0")
        .arg("list")
        .assert()
        .failure()
        .stderr(contains("invalid configuration"));
}

#[test]
fn submit_then_list_and_status() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }
    let server = MockServer::start();
    let submit = server.mock(|when, then| {
        when.method(POST)
            .path("/v1/jobs")
            .header("authorization", "Bearer test-token");
        then.status(200)
            .json_body(serde_json::json!({ "job_id": "op-1" }));
    });

    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), &server.base_url());

    ardtrack(&config)
        .args(["submit", "--tile", "T1", "--from", "2020-01-01", "--to", "2020-01-31"])
        .assert()
        .success()
        .stdout(contains("submitted T1_20200101_20200131 (job op-1)"));

    ardtrack(&config)
        .args(["submit", "--tile", "T1", "--from", "2020-01-01", "--to", "2020-01-31"])
        .assert()
        .success()
        .stdout(contains("exists T1_20200101_20200131 (SUBMITTED)"));
    submit.assert_hits(1);

    assert!(
        temp.path()
            .join("store/ARD_TRACKING/T1_20200101_20200131.json")
            .exists()
    );

    ardtrack(&config)
        .args(["list", "--status", "submitted"])
        .assert()
        .success()
        .stdout(contains("T1_20200101_20200131"))
        .stdout(contains("op-1"));

    ardtrack(&config)
        .args(["list", "--status", "completed"])
        .assert()
        .success()
        .stdout(contains("No tracking records"));

    ardtrack(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(contains("SUBMITTED  1"))
        .stdout(contains("TOTAL      1"));
}

#[test]
fn update_aborts_on_rejected_credentials() {
    if !can_bind_localhost() {
        eprintln!("Skipping httpmock tests: cannot bind to localhost");
        return;
    }
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(POST).path("/v1/jobs");
        then.status(200)
            .json_body(serde_json::json!({ "job_id": "op-1" }));
    });
    server.mock(|when, then| {
        when.method(POST).path("/v1/jobs/status");
        then.status(401).body("token revoked");
    });

    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), &server.base_url());

    ardtrack(&config)
        .args(["submit", "--grid", "3,9", "--from", "2020-01-01", "--to", "2020-01-31"])
        .assert()
        .success()
        .stdout(contains("h003v009_20200101_20200131"));

    ardtrack(&config)
        .arg("update")
        .assert()
        .failure()
        .stderr(contains("token revoked"));
}

#[test]
fn submit_requires_a_tile() {
    let temp = TempDir::new().unwrap();
    let config = write_config(temp.path(), "http://127.0.0.1:9");

    ardtrack(&config)
        .args(["submit", "--from", "2020-01-01", "--to", "2020-01-31"])
        .assert()
        .failure()
        .stderr(contains("at least one --tile or --grid"));
}
