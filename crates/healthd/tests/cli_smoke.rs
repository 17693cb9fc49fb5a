//! Command-line contract of the daemon binary.

use assert_cmd::Command;
use predicates::prelude::*;

fn healthd() -> Command {
    Command::cargo_bin("healthd").expect("healthd binary built")
}

#[test]
fn positional_argument_is_rejected() {
    healthd()
        .arg("foo")
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("Usage: healthd"));
}

#[test]
fn help_flag_is_not_special() {
    healthd().arg("--help").assert().failure().code(1);
}

#[test]
fn version_flag_is_rejected() {
    healthd().arg("-V").assert().failure().code(1);
}
