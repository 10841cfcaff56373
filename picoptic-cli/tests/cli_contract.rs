//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

const IMAGE: &str = ":040400008C30FF3FFE\n:00000001FF\n";

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("picoptic");
    cmd.env_remove("PICOPTIC_PORT")
        .env_remove("PICOPTIC_BAUD")
        .env_remove("PICOPTIC_NON_INTERACTIVE");
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("picoptic"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("picoptic"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn completions_bash_exits_zero() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .code(0)
        .stdout(predicate::str::contains("picoptic"));
}

#[test]
fn list_ports_json_returns_valid_json() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let stdout = String::from_utf8_lossy(&output.stdout);
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("stdout should be JSON");
    assert_eq!(parsed["ok"], true);
    assert!(parsed["data"]["ports"].is_array());
}

#[test]
fn info_prints_page_map() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("blink.hex");
    fs::write(&image, IMAGE).expect("write image");

    cli_cmd()
        .current_dir(dir.path())
        .arg("info")
        .arg(&image)
        .assert()
        .success()
        .stdout(predicate::str::contains("Programmed words: 1"))
        .stdout(predicate::str::contains("00000200 X-"));
}

#[test]
fn info_json_reports_pages() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("blink.hex");
    fs::write(&image, IMAGE).expect("write image");

    let output = cli_cmd()
        .current_dir(dir.path())
        .args(["info", "--json"])
        .arg(&image)
        .output()
        .expect("command should execute");
    assert!(output.status.success());

    let parsed: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(parsed["data"]["pages"], serde_json::json!([16]));
    assert_eq!(parsed["data"]["programmed_words"], 1);
}

#[test]
fn info_json_error_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let nonexistent = dir.path().join("not_exists.hex");

    cli_cmd()
        .current_dir(dir.path())
        .args(["info", "--json"])
        .arg(&nonexistent)
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn info_reports_bad_record_line() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("bad.hex");
    fs::write(&image, ":040400008C30FF3FFE\n:040400008C30FF3FFF\n").expect("write image");

    cli_cmd()
        .current_dir(dir.path())
        .arg("info")
        .arg(&image)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("line 2"));
}

#[test]
fn info_out_of_range_needs_flag() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("config.hex");
    fs::write(&image, ":01200000AB34\n:00000001FF\n").expect("write image");

    cli_cmd()
        .current_dir(dir.path())
        .arg("info")
        .arg(&image)
        .assert()
        .failure()
        .stderr(predicate::str::contains("out of range"));

    cli_cmd()
        .current_dir(dir.path())
        .args(["info", "-r"])
        .arg(&image)
        .assert()
        .success()
        .stdout(predicate::str::contains("Programmed words: 0"));
}

#[test]
fn flash_with_protected_data_fails_before_opening_port() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("boot.hex");
    // One word in page 2, inside the bootloader.
    fs::write(&image, ":0200A00000302E\n:00000001FF\n").expect("write image");

    cli_cmd()
        .current_dir(dir.path())
        .args(["--non-interactive", "flash", "-o", "/dev/picoptic-missing"])
        .arg(&image)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("protected page 2"));
}

#[test]
fn flash_missing_port_fails() {
    let dir = tempdir().expect("tempdir should be created");
    let image = dir.path().join("blink.hex");
    fs::write(&image, IMAGE).expect("write image");

    cli_cmd()
        .current_dir(dir.path())
        .args(["--non-interactive", "flash", "--port", "/dev/picoptic-missing"])
        .arg(&image)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("failed to open /dev/picoptic-missing"));
}

#[test]
fn exit_code_two_for_usage_error_unknown_command() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_missing_image() {
    cli_cmd()
        .arg("flash")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("IMAGE"));
}

#[test]
fn invalid_config_file_warns_but_continues() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("picoptic.toml"), "invalid toml [[[").expect("write config");

    let output = cli_cmd()
        .current_dir(dir.path())
        .arg("list-ports")
        .output()
        .expect("command should execute");
    assert!(output.status.success(), "command should succeed despite config warning");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("TOML"), "should warn about invalid TOML");
}
