//! CLI tests for the `scientist` binary.
//!
//! The reaper keyword list is narrowed in every config so teardown cannot touch
//! unrelated processes on the test host.

use std::fs;
use std::path::Path;
use std::process::Command;

use scientist::exit_codes;

const SAFE_REAPER: &str = r#"
[reaper]
grace_secs = 0
keywords = ["scientist-cli-test-no-such-process"]
"#;

fn write_config(dir: &Path, extra: &str) -> std::path::PathBuf {
    let path = dir.join("scientist.toml");
    fs::write(&path, format!("{extra}\n{SAFE_REAPER}")).expect("write config");
    path
}

#[test]
fn missing_adapter_settings_exits_with_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = write_config(temp.path(), "experiments_dir = \"runs\"");
    fs::write(temp.path().join("ideas.json"), r#"[{"Name": "n"}]"#).expect("ideas");

    let output = Command::new(env!("CARGO_BIN_EXE_scientist"))
        .current_dir(temp.path())
        .args(["--config"])
        .arg(&config)
        .args(["--load-ideas", "ideas.json"])
        .output()
        .expect("run scientist");

    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("prompt_adapter"), "{stderr}");
    assert!(!temp.path().join("runs").exists());
}

#[test]
fn missing_ideas_file_exits_with_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let config = write_config(
        temp.path(),
        "[prompt_adapter]\nmodel = \"adapter-model\"\n",
    );

    let output = Command::new(env!("CARGO_BIN_EXE_scientist"))
        .current_dir(temp.path())
        .args(["--config"])
        .arg(&config)
        .args(["--load-ideas", "does_not_exist.json"])
        .output()
        .expect("run scientist");

    assert_eq!(output.status.code(), Some(exit_codes::FAILED));
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does_not_exist.json"), "{stderr}");
}

#[test]
fn invalid_config_exits_with_failure() {
    let temp = tempfile::tempdir().expect("tempdir");
    let path = temp.path().join("scientist.toml");
    fs::write(&path, "[prompt_adapter]\ntemp = 0.1\n").expect("write config");

    let status = Command::new(env!("CARGO_BIN_EXE_scientist"))
        .current_dir(temp.path())
        .args(["--config"])
        .arg(&path)
        .status()
        .expect("run scientist");

    assert_eq!(status.code(), Some(exit_codes::FAILED));
}
