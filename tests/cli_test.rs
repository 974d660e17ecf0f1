//! Command-line integration tests
//!
//! Runs the built binary with a configuration path that does not exist, so
//! every invocation uses defaults and the in-memory storage backend.

use assert_cmd::Command;
use predicates::prelude::*;

fn negotiator() -> Command {
    let mut cmd = Command::cargo_bin("mcp-negotiator").unwrap();
    cmd.args(["--config", "/nonexistent/negotiator.yaml"])
        .env_remove("MCP_NEGOTIATOR_RELAY_URL")
        .env_remove("MCP_NEGOTIATOR_RELAY_TOKEN")
        .env_remove("RUST_LOG");
    cmd
}

#[test]
fn test_pkce_prints_s256_pair() {
    negotiator()
        .arg("pkce")
        .assert()
        .success()
        .stdout(predicate::str::contains("code_challenge_method: S256"))
        .stdout(predicate::str::contains("code_verifier:"));
}

#[test]
fn test_recent_with_empty_store() {
    negotiator()
        .arg("recent")
        .assert()
        .success()
        .stdout(predicate::str::contains("No recent targets."));
}

#[test]
fn test_connect_rejects_unsupported_scheme() {
    negotiator()
        .args(["connect", "ftp://example.com"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("ftp"));
}

#[test]
fn test_callback_without_state_fails() {
    negotiator()
        .args(["callback", "http://localhost:3000/oauth/callback?code=abc"])
        .assert()
        .failure();
}

#[test]
fn test_missing_subcommand_fails() {
    negotiator().assert().failure();
}

#[test]
fn test_invalid_config_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("negotiator.yaml");
    std::fs::write(&path, "negotiation:\n  timeout_seconds: 0\n").unwrap();

    Command::cargo_bin("mcp-negotiator")
        .unwrap()
        .args(["--config", path.to_str().unwrap(), "pkce"])
        .assert()
        .failure();
}
