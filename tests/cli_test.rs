// Integration tests for the idlewire binary
// Run with: cargo test --test cli_test

use std::process::Command;
use tempfile::TempDir;

fn idlewire(config_dir: &TempDir) -> Command {
    let mut cmd = Command::new(env!("CARGO_BIN_EXE_idlewire"));
    cmd.env("IDLEWIRE_CONFIG_DIR", config_dir.path())
        .env_remove("IDLEWIRE_HOST")
        .env_remove("IDLEWIRE_PORT")
        .env_remove("IDLEWIRE_PASSWORD");
    cmd
}

/// Test the config command merges file, environment and flags
#[test]
fn test_config_command_layers_overrides() {
    let temp_dir = TempDir::new().unwrap();
    std::fs::write(
        temp_dir.path().join("config.json"),
        r#"{"host": "from-file", "port": 6601, "idle_when_unobserved": false}"#,
    )
    .unwrap();

    let output = idlewire(&temp_dir)
        .env("IDLEWIRE_HOST", "from-env")
        .args(["--port", "7000", "--password", "hunter2", "config"])
        .output()
        .expect("Failed to execute config command");

    assert!(output.status.success(), "Command should succeed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let config: serde_json::Value = serde_json::from_str(&stdout).unwrap();
    assert_eq!(config["host"], "from-env");
    assert_eq!(config["port"], 7000);
    assert_eq!(config["idle_when_unobserved"], false);
    assert!(!stdout.contains("hunter2"), "Password must never be printed");
}

/// Test that send fails cleanly when nothing listens on the port
#[test]
fn test_send_reports_unreachable_server() {
    let temp_dir = TempDir::new().unwrap();
    let port = {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        listener.local_addr().unwrap().port()
    };

    let output = idlewire(&temp_dir)
        .args(["--host", "127.0.0.1", "--port", &port.to_string(), "send", "status"])
        .output()
        .expect("Failed to execute send command");

    assert!(!output.status.success(), "Command should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(
        stderr.contains("connection to server lost"),
        "Unexpected stderr: {stderr}"
    );
}
