//! Integration tests for tagvaultd config: file, env overrides, CLI flags, precedence, and a
//! stdin ingestion run.

use std::io::Write;
use std::process::{Command, Stdio};

/// Run tagvaultd in a subprocess with the given args and env. Returns (success, stdout, stderr).
fn run_tagvaultd(args: &[&str], env_extra: &[(&str, &str)]) -> (bool, String, String) {
    run_tagvaultd_with_stdin(args, env_extra, "")
}

fn run_tagvaultd_with_stdin(
    args: &[&str],
    env_extra: &[(&str, &str)],
    stdin: &str,
) -> (bool, String, String) {
    let exe = env!("CARGO_BIN_EXE_tagvaultd");
    let mut cmd = Command::new(exe);
    cmd.args(args)
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    for (k, v) in env_extra {
        cmd.env(k, v);
    }
    let mut child = cmd.spawn().expect("spawn tagvaultd");
    {
        let mut pipe = child.stdin.take().expect("stdin");
        pipe.write_all(stdin.as_bytes()).expect("write stdin");
    }
    let out = child.wait_with_output().expect("run tagvaultd");
    let stdout = String::from_utf8_lossy(&out.stdout).into_owned();
    let stderr = String::from_utf8_lossy(&out.stderr).into_owned();
    (out.status.success(), stdout, stderr)
}

#[test]
fn validate_config_no_config_uses_defaults() {
    let (ok, stdout, stderr) = run_tagvaultd(&["--validate-config", "--no-config"], &[]);
    assert!(ok, "stderr: {}", stderr);
    assert!(
        stdout.contains("data_dir=./data") || stdout.contains("data_dir=.\\data"),
        "stdout: {}",
        stdout
    );
    assert!(stdout.contains("default_bucket_size=[1, months]"), "stdout: {}", stdout);
    assert!(stdout.contains("sync_mode=Local"), "stdout: {}", stdout);
}

#[test]
fn validate_config_cli_data_dir_overrides() {
    let (ok, stdout, _) = run_tagvaultd(
        &["--validate-config", "--no-config", "--data-dir", "/var/lib/tagvault"],
        &[],
    );
    assert!(ok);
    assert!(stdout.contains("data_dir=/var/lib/tagvault"), "stdout: {}", stdout);
}

#[test]
fn validate_config_env_data_dir_overridden_by_cli() {
    let (ok, stdout, _) = run_tagvaultd(
        &["--validate-config", "--no-config", "--data-dir", "/cli/dir"],
        &[("TAGVAULT_DATA_DIR", "/env/dir")],
    );
    assert!(ok);
    assert!(stdout.contains("data_dir=/cli/dir"), "CLI should win: {}", stdout);
}

#[test]
fn validate_config_env_overrides_file() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("tagvaultd.toml");
    std::fs::write(&config_path, "default_max_documents = 50\nsync_mode = \"remote\"\n")
        .expect("write config");
    let (ok, stdout, stderr) = run_tagvaultd(
        &["--validate-config", "--config", config_path.to_str().unwrap()],
        &[("TAGVAULT_DEFAULT_MAX_DOCUMENTS", "7")],
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("default_max_documents=7"), "stdout: {}", stdout);
    assert!(stdout.contains("sync_mode=Remote"), "stdout: {}", stdout);
}

#[test]
fn validate_config_env_sets_fields_without_cli_flags() {
    let (ok, stdout, stderr) = run_tagvaultd(
        &["--validate-config", "--no-config"],
        &[
            ("TAGVAULT_SYNC_MODE", "remote"),
            ("TAGVAULT_DEFAULT_MAX_DOCUMENTS", "12"),
            ("TAGVAULT_MAINTENANCE_INTERVAL_SECS", "90"),
        ],
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("sync_mode=Remote"), "stdout: {}", stdout);
    assert!(stdout.contains("default_max_documents=12"), "stdout: {}", stdout);
    assert!(stdout.contains("maintenance_interval_secs=90"), "stdout: {}", stdout);
}

#[test]
fn valid_config_file_merges_with_defaults() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("tagvaultd.toml");
    std::fs::write(
        &config_path,
        r#"
data_dir = "/tmp/tagvault_test"
snapshot_interval_secs = 30
default_bucket_size = [1, "days"]
"#,
    )
    .expect("write config");
    let (ok, stdout, stderr) = run_tagvaultd(
        &["--validate-config", "--config", config_path.to_str().unwrap()],
        &[],
    );
    assert!(ok, "stderr: {}", stderr);
    assert!(stdout.contains("data_dir=/tmp/tagvault_test"));
    assert!(stdout.contains("snapshot_interval_secs=30"));
    assert!(stdout.contains("default_bucket_size=[1, days]"));
    assert!(stdout.contains("enable_snapshots=true"));
}

#[test]
fn invalid_bucket_size_in_config_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let config_path = dir.path().join("bad.toml");
    std::fs::write(&config_path, "default_bucket_size = [1, \"fortnights\"]\n").expect("write config");
    let (ok, _stdout, stderr) = run_tagvaultd(
        &["--validate-config", "--config", config_path.to_str().unwrap()],
        &[],
    );
    assert!(!ok, "invalid bucket unit should fail");
    assert!(
        stderr.contains("unknown variant") || stderr.contains("fortnights") || stderr.contains("config error"),
        "stderr: {}",
        stderr
    );
}

#[test]
fn explicit_config_missing_file_fails() {
    let (ok, _stdout, stderr) = run_tagvaultd(
        &["--validate-config", "--config", "/nonexistent/tagvaultd.toml"],
        &[],
    );
    assert!(!ok, "missing config file with explicit --config should fail");
    assert!(
        stderr.contains("not found") || stderr.contains("config error"),
        "stderr: {}",
        stderr
    );
}

#[test]
fn ingests_stdin_and_snapshots_on_exit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let tags_path = dir.path().join("tags.json");
    std::fs::write(
        &tags_path,
        r#"[
  {"key": "Boiler", "kind": "object"},
  {"key": "Boiler.Temp", "kind": "variable", "ownerName": "Boiler"}
]"#,
    )
    .expect("write tags");
    let data_dir = dir.path().join("data");

    let stdin = concat!(
        "{\"tag\": \"Boiler.Temp\", \"key\": \"2022-01-05T10:00:00Z\", \"value\": 71.5}\n",
        "not json\n",
        "{\"tag\": \"Boiler.Temp\", \"key\": \"2022-01-06T10:00:00Z\", \"value\": 72.0}\n",
    );
    let (ok, _stdout, stderr) = run_tagvaultd_with_stdin(
        &[
            "--no-config",
            "--exit-on-eof",
            "--data-dir",
            data_dir.to_str().unwrap(),
            "--tags-file",
            tags_path.to_str().unwrap(),
        ],
        &[],
        stdin,
    );
    assert!(ok, "stderr: {}", stderr);

    let snapshots: Vec<_> = std::fs::read_dir(data_dir.join("snapshots"))
        .expect("snapshot dir")
        .filter_map(|e| e.ok())
        .filter(|e| e.file_name().to_string_lossy().starts_with("snapshot_"))
        .collect();
    assert!(!snapshots.is_empty(), "expected a final snapshot");
}
