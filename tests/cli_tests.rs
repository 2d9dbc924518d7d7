//! Binary-level tests: argument handling and exit codes

use std::fs;
use std::process::Command;

fn easeinstall() -> Command {
    Command::new(env!("CARGO_BIN_EXE_easeinstall"))
}

#[test]
fn test_plan_prints_summary_and_exits_zero() {
    let out = easeinstall()
        .args(["plan", "--firmware", "uefi", "--disk", "/dev/nvme0n1"])
        .output()
        .expect("binary runs");

    assert!(out.status.success());
    let stdout = String::from_utf8_lossy(&out.stdout);
    assert!(stdout.contains("/dev/nvme0n1p1"));
    assert!(stdout.contains("/dev/nvme0n1p2"));
}

#[test]
fn test_plan_rejects_unknown_firmware() {
    let out = easeinstall()
        .args(["plan", "--firmware", "openfirmware"])
        .output()
        .expect("binary runs");
    assert!(!out.status.success());
}

#[test]
fn test_validate_config_accepts_empty_object() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("installer.json");
    fs::write(&path, "{}").expect("write");

    let status = easeinstall()
        .arg("validate-config")
        .arg(&path)
        .status()
        .expect("binary runs");
    assert_eq!(status.code(), Some(0));
}

#[test]
fn test_validate_config_rejects_bad_file_with_exit_one() {
    let dir = tempfile::tempdir().expect("tempdir");
    let path = dir.path().join("installer.json");
    fs::write(&path, r#"{ "mapper_name": "crypt root" }"#).expect("write");

    let out = easeinstall()
        .arg("validate-config")
        .arg(&path)
        .output()
        .expect("binary runs");
    assert_eq!(out.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&out.stderr).contains("mapper_name"));
}
