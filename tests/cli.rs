use std::fs;
use std::path::PathBuf;
use std::process::{Command, Output};

use assert_cmd::{assert::Assert, cargo::cargo_bin};
use predicates::prelude::*;
use serial_test::serial;
use tempfile::TempDir;

/// Write a passphrase file and return the directory guard and path.
fn keyfile(passphrase: &str) -> (TempDir, PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("passphrase");
    fs::write(&path, format!("{passphrase}\n")).unwrap();
    (dir, path)
}

fn keyed(args: &[&str]) -> Output {
    Command::new(cargo_bin("keyed"))
        .args(args)
        .output()
        .unwrap()
}

#[test]
fn help_goes_to_stdout() {
    Assert::new(keyed(&["-h"]))
        .success()
        .stdout(predicate::str::contains("usage: keyed"));
}

#[test]
fn missing_command_prints_usage() {
    Assert::new(keyed(&[]))
        .failure()
        .stderr(predicate::str::contains("usage: keyed"));
}

#[test]
fn unknown_option_is_rejected() {
    Assert::new(keyed(&["-z", "/bin/true"]))
        .failure()
        .stderr(predicate::str::contains("usage: keyed"));
}

#[test]
fn bad_pid_value_is_rejected() {
    Assert::new(keyed(&["-pabc", "/bin/true"]))
        .failure()
        .stderr(predicate::str::contains("invalid number"));
}

#[test]
fn missing_keyfile_is_fatal() {
    Assert::new(keyed(&["-k", "/no/such/file", "/bin/true"]))
        .failure()
        .stderr(predicate::str::contains("keyed: /no/such/file"));
}

#[test]
#[serial]
fn exit_status_is_propagated() {
    let (_dir, path) = keyfile("hunter2");
    Assert::new(keyed(&["-k", path.to_str().unwrap(), "/bin/sh", "-c", "exit 7"])).code(7);
}

#[test]
#[serial]
fn exec_failure_is_fatal() {
    let (_dir, path) = keyfile("hunter2");
    Assert::new(keyed(&["-k", path.to_str().unwrap(), "/no/such/binary"]))
        .failure()
        .stderr(predicate::str::contains("could not exec command"));
}

#[test]
#[serial]
fn urandom_reads_are_deterministic() {
    let (_dir, path) = keyfile("hunter2");
    let dump = "head -c 32 /dev/urandom | od -An -v -tx1";

    let first = keyed(&["-k", path.to_str().unwrap(), "/bin/sh", "-c", dump]);
    let second = keyed(&["-k", path.to_str().unwrap(), "/bin/sh", "-c", dump]);
    assert!(first.status.success());
    assert!(!first.stdout.is_empty());
    assert_eq!(first.stdout, second.stdout);

    // A different passphrase keys a different stream.
    let (_dir2, other) = keyfile("hunter3");
    let third = keyed(&["-k", other.to_str().unwrap(), "/bin/sh", "-c", dump]);
    assert!(third.status.success());
    assert_ne!(first.stdout, third.stdout);
}

#[test]
#[serial]
fn unmonitored_devices_are_passed_through() {
    let (_dir, path) = keyfile("hunter2");
    let out = keyed(&[
        "-k",
        path.to_str().unwrap(),
        "/bin/sh",
        "-c",
        "head -c 16 /dev/zero | od -An -v -tx1",
    ]);
    Assert::new(out).success().stdout(predicate::function(|s: &str| {
        s.split_whitespace().all(|byte| byte == "00")
    }));
}

#[test]
#[serial]
fn fake_pid_is_injected() {
    let (_dir, path) = keyfile("hunter2");
    Assert::new(keyed(&[
        "-k",
        path.to_str().unwrap(),
        "-p7",
        "/bin/sh",
        "-c",
        "echo $$",
    ]))
    .success()
    .stdout("7\n");
}

#[test]
#[serial]
fn fake_pid_defaults_to_two() {
    let (_dir, path) = keyfile("hunter2");
    Assert::new(keyed(&[
        "-k",
        path.to_str().unwrap(),
        "-p",
        "/bin/sh",
        "-c",
        "echo $$",
    ]))
    .success()
    .stdout("2\n");
}

#[test]
#[serial]
fn real_pid_without_flag() {
    let (_dir, path) = keyfile("hunter2");
    let out = keyed(&["-k", path.to_str().unwrap(), "/bin/sh", "-c", "echo $$"]);
    Assert::new(out)
        .success()
        .stdout(predicate::str::diff("2\n").not());
}
