use assert_cmd::Command;

#[test]
fn help_lists_subcommands() {
    let output = Command::cargo_bin("castctl").unwrap().arg("--help").output().unwrap();
    assert!(output.status.success());
    let text = String::from_utf8_lossy(&output.stdout);
    for sub in ["status", "load", "queue", "seek", "volume", "info"] {
        assert!(text.contains(sub), "missing {sub} in:\n{text}");
    }
    assert!(text.contains("[default: 8009]"), "control port default missing:\n{text}");
}

#[test]
fn missing_address_fails() {
    let dir = tempfile::tempdir().unwrap();
    let output = Command::cargo_bin("castctl")
        .unwrap()
        .args(["--config"])
        .arg(dir.path().join("none.toml"))
        .arg("status")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--addr"));
}

#[test]
fn unreachable_device_exits_non_zero() {
    let dir = tempfile::tempdir().unwrap();
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    let output = Command::cargo_bin("castctl")
        .unwrap()
        .args(["--addr", "127.0.0.1", "--port", &port.to_string(), "--config"])
        .arg(dir.path().join("none.toml"))
        .arg("status")
        .output()
        .unwrap();
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("castctl:"));
}
