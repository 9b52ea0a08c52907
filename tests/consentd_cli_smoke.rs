use predicates::prelude::*;
use std::fs;

fn write_directory(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("directory.json");
    fs::write(
        &path,
        r#"[
          {"id": "pat-1", "name": "Mira", "role": "patient"},
          {"id": "doc-1", "name": "Dr. Rao", "role": "doctor"}
        ]"#,
    )
    .unwrap();
    path
}

#[test]
fn help_lists_subcommands() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("consentd");
    cmd.arg("--help");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("check-config"))
        .stdout(predicate::str::contains("--access-window-secs"));
}

#[test]
fn check_config_reports_summary() {
    let tmp = tempfile::tempdir().unwrap();
    let directory = write_directory(tmp.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("consentd");
    cmd.env_remove("CONSENTD_CONSENSUS_NODES");
    cmd.env_remove("CONSENTD_REQUIRED_CONFIRMATIONS");
    cmd.arg("check-config").arg("--directory-file").arg(&directory);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("2 directory entries"))
        .stdout(predicate::str::contains("quorum 2/3"));
}

#[test]
fn check_config_rejects_threshold_above_node_count() {
    let tmp = tempfile::tempdir().unwrap();
    let directory = write_directory(tmp.path());

    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("consentd");
    cmd.args([
        "check-config",
        "--consensus-nodes",
        "a,b",
        "--required-confirmations",
        "3",
    ]);
    cmd.arg("--directory-file").arg(&directory);
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("required_confirmations"));
}

#[test]
fn check_config_requires_directory_file() {
    let mut cmd = assert_cmd::cargo::cargo_bin_cmd!("consentd");
    cmd.env_remove("CONSENTD_DIRECTORY_FILE");
    cmd.arg("check-config");
    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("--directory-file"));
}
