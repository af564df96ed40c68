//! Runs the built `trainer-distribute` binary and checks its exit status.

use std::fs;
use std::path::Path;
use std::process::{Command, Output};

fn launcher(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_trainer-distribute"))
        .args(["--script-dir", dir.to_str().unwrap(), "--interpreter", "sh"])
        .args(args)
        .env_remove("CUDA_VISIBLE_DEVICES")
        .output()
        .unwrap()
}

fn script(dir: &Path, name: &str, body: &str) {
    fs::write(dir.join(name), body).unwrap();
}

#[test]
fn test_exit_zero_when_every_worker_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    script(dir.path(), "ok.sh", "exit 0\n");

    let out = launcher(dir.path(), &["--script", "ok.sh", "--gpus", "0,1"]);
    assert_eq!(out.status.code(), Some(0));
}

#[test]
fn test_exit_one_when_a_worker_fails() {
    let dir = tempfile::tempdir().unwrap();
    script(dir.path(), "fail.sh", "[ \"$RANK\" = 1 ] && exit 3; exit 0\n");

    let out = launcher(dir.path(), &["--script", "fail.sh", "--gpus", "0,1"]);
    assert_eq!(out.status.code(), Some(1));
}

#[test]
fn test_exit_two_without_devices() {
    let dir = tempfile::tempdir().unwrap();
    script(dir.path(), "ok.sh", "exit 0\n");

    let out = launcher(dir.path(), &["--script", "ok.sh"]);
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_exit_two_when_mask_hides_every_device() {
    let dir = tempfile::tempdir().unwrap();
    script(dir.path(), "ok.sh", "exit 0\n");

    let out = Command::new(env!("CARGO_BIN_EXE_trainer-distribute"))
        .args(["--script-dir", dir.path().to_str().unwrap(), "--interpreter", "sh"])
        .args(["--script", "ok.sh"])
        .env("CUDA_VISIBLE_DEVICES", "-1")
        .output()
        .unwrap();
    assert_eq!(out.status.code(), Some(2));
}

#[test]
fn test_launcher_flags_after_training_flags() {
    let dir = tempfile::tempdir().unwrap();
    // succeed only if the training flag arrived and --gpus did not
    script(
        dir.path(),
        "check.sh",
        r#"seen=1
for a in "$@"; do
  [ "$a" = "--gpus" ] && exit 9
  [ "$a" = "--coqpit.lr=0.1" ] && seen=0
done
exit $seen
"#,
    );

    let out = launcher(
        dir.path(),
        &["--script", "check.sh", "--coqpit.lr=0.1", "--gpus", "0,1"],
    );
    assert_eq!(out.status.code(), Some(0));
}
