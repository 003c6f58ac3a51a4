use assert_cmd::Command;
use std::io::Write;

fn kubectl_link() -> Command {
    Command::cargo_bin("kubectl-link").unwrap()
}

#[test]
fn test_help_lists_flags() {
    let output = kubectl_link().arg("--help").output().unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    for flag in ["--device", "--dns-pod", "--dns-cluster-zone", "--kubeconfig", "--context"] {
        assert!(stdout.contains(flag), "missing {flag} in:\n{stdout}");
    }
}

#[test]
fn test_version() {
    let output = kubectl_link().arg("--version").output().unwrap();
    assert!(output.status.success());
    assert!(String::from_utf8_lossy(&output.stdout).contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_malformed_config_fails_before_connecting() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"[forward\nport_range_start = 1\n").unwrap();

    let output = kubectl_link()
        .arg("--config")
        .arg(file.path())
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("failed to load config"), "stderr:\n{stderr}");
}

#[test]
fn test_overlapping_dns_port_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let output = kubectl_link()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .args(["--dns-local-port", "30001"])
        .output()
        .unwrap();
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("overlaps"), "stderr:\n{stderr}");
}
