//! Integration tests for core CLI contract behavior.

use {predicates::prelude::*, std::fs, tempfile::tempdir};

fn cli_cmd() -> assert_cmd::Command {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("groundlink");
    for var in [
        "GROUNDLINK_ENDPOINT",
        "GROUNDLINK_PORT",
        "GROUNDLINK_BAUD",
        "GROUNDLINK_CONFIG",
        "GROUNDLINK_SIGNING_KEY",
        "RUST_LOG",
    ] {
        cmd.env_remove(var);
    }
    cmd
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("groundlink"))
        .stdout(predicate::str::contains("Usage"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    cli_cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("groundlink"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn subcommand_help_lists_dfu_commands() {
    cli_cmd()
        .args(["dfu", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("flash"))
        .stdout(predicate::str::contains("list"));
}

#[test]
fn list_ports_json_returns_array() {
    let output = cli_cmd()
        .args(["list-ports", "--json"])
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    let parsed: serde_json::Value = serde_json::from_str(&stdout).expect("valid JSON");
    assert!(parsed.is_array(), "list-ports --json should return an array");
}

#[test]
fn completions_command_writes_to_stdout() {
    cli_cmd()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stderr(predicate::str::is_empty())
        .stdout(predicate::str::contains("_groundlink()"));
}

#[test]
fn completions_without_shell_is_usage_error() {
    cli_cmd()
        .arg("completions")
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("shell"));
}

// ============================================================================
// Firmware inspection
// ============================================================================

#[test]
fn firmware_info_json_for_intel_hex() {
    let dir = tempdir().expect("tempdir should be created");
    let hex = dir.path().join("app.hex");
    fs::write(
        &hex,
        ":020000040800F2\n:10000000000002201D0100081F0100082101000856\n:0400000508000101ED\n:00000001FF\n",
    )
    .expect("write hex");

    let output = cli_cmd()
        .args(["firmware", "info", "--json"])
        .arg(&hex)
        .assert()
        .success()
        .get_output()
        .clone();
    let value: serde_json::Value =
        serde_json::from_slice(&output.stdout).expect("stdout should be JSON");
    assert_eq!(value["format"], "Intel HEX");
    assert_eq!(value["start_address"], "0x08000000");
    assert_eq!(value["entry_point"], "0x08000101");
    assert_eq!(value["total_size"], 16);
}

#[test]
fn firmware_info_binary_honours_base() {
    let dir = tempdir().expect("tempdir should be created");
    let bin = dir.path().join("app.bin");
    fs::write(&bin, [0u8; 64]).expect("write bin");

    cli_cmd()
        .args(["firmware", "info", "--json", "--base", "0x08004000"])
        .arg(&bin)
        .assert()
        .success()
        .stdout(predicate::str::contains("0x08004000"));
}

#[test]
fn firmware_info_human_output_goes_to_stderr() {
    let dir = tempdir().expect("tempdir should be created");
    let bin = dir.path().join("app.bin");
    fs::write(&bin, [1u8; 8]).expect("write bin");

    cli_cmd()
        .args(["firmware", "info"])
        .arg(&bin)
        .assert()
        .success()
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Firmware Information"));
}

#[test]
fn firmware_info_error_keeps_stdout_clean() {
    let dir = tempdir().expect("tempdir should be created");
    let missing = dir.path().join("not_exists.hex");

    cli_cmd()
        .args(["firmware", "info", "--json"])
        .arg(&missing)
        .assert()
        .failure()
        .code(1)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("Error"));
}

#[test]
fn corrupt_hex_is_rejected() {
    let dir = tempdir().expect("tempdir should be created");
    let hex = dir.path().join("bad.hex");
    fs::write(&hex, ":0400000508000101EE\n:00000001FF\n").expect("write hex");

    cli_cmd()
        .args(["firmware", "info"])
        .arg(&hex)
        .assert()
        .failure()
        .stderr(predicate::str::contains("line 1"));
}

// ============================================================================
// Exit Code Tests
// ============================================================================

#[test]
fn exit_code_two_for_unknown_command() {
    cli_cmd()
        .arg("unknown-command-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_invalid_flag() {
    cli_cmd()
        .arg("--invalid-flag-xyz")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn exit_code_two_for_bad_endpoint() {
    cli_cmd()
        .args(["-e", "tcp:", "monitor"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("endpoint"));
}

#[test]
fn exit_code_two_for_bad_msp_payload() {
    cli_cmd()
        .args(["-e", "udp:127.0.0.1:0", "msp", "request", "108", "--payload", "xyz"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("payload"));
}

#[test]
fn exit_code_two_for_short_signing_key() {
    cli_cmd()
        .args(["-e", "udp:127.0.0.1:0", "mavlink", "sniff", "--signing-key", "abcd"])
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("32 bytes"));
}

#[test]
fn dfu_flash_requires_firmware() {
    cli_cmd()
        .args(["dfu", "flash"])
        .assert()
        .failure()
        .code(2)
        .stdout(predicate::str::is_empty())
        .stderr(predicate::str::contains("FIRMWARE"));
}

#[test]
fn unknown_command_suggests_similar() {
    cli_cmd()
        .arg("monitr")
        .assert()
        .failure()
        .stderr(predicate::str::contains("monitor"));
}

// ============================================================================
// Configuration
// ============================================================================

#[test]
fn invalid_local_config_is_a_warning() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(dir.path().join("groundlink.toml"), "invalid toml [[[").expect("write config");

    let output = cli_cmd()
        .current_dir(dir.path())
        .args(["completions", "bash"])
        .output()
        .expect("command should execute");
    assert!(output.status.success(), "invalid config must not be fatal");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("groundlink.toml"), "should warn about the file: {stderr}");
}

#[test]
fn config_endpoint_is_used() {
    let dir = tempdir().expect("tempdir should be created");
    fs::write(
        dir.path().join("groundlink.toml"),
        "[connection]\nendpoint = \"tcp:\"\n",
    )
    .expect("write config");

    cli_cmd()
        .current_dir(dir.path())
        .arg("monitor")
        .assert()
        .failure()
        .code(2)
        .stderr(predicate::str::contains("tcp:"));
}

#[test]
fn non_interactive_environment_variable_works() {
    cli_cmd()
        .env("GROUNDLINK_NON_INTERACTIVE", "true")
        .arg("--version")
        .assert()
        .success();
}

#[test]
fn colors_disabled_when_not_tty() {
    let output = cli_cmd()
        .arg("--help")
        .assert()
        .success()
        .get_output()
        .clone();
    let stdout = String::from_utf8(output.stdout).expect("stdout should be utf-8");
    assert!(!stdout.contains("\x1b["), "Colors should be disabled in non-TTY mode");
}
