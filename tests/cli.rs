use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_subcommands() {
    Command::cargo_bin("packmap")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("install").and(predicate::str::contains("cache")));
}

#[test]
fn cache_path_prints_a_location() {
    Command::cargo_bin("packmap")
        .unwrap()
        .args(["cache", "path"])
        .assert()
        .success()
        .stdout(predicate::str::contains("packmap"));
}

#[test]
fn unknown_subcommand_fails() {
    Command::cargo_bin("packmap")
        .unwrap()
        .arg("definitely-not-a-command")
        .assert()
        .failure();
}
