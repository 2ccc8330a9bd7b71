use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn avitolog(state: &TempDir) -> Command {
    let mut cmd = Command::cargo_bin("avitolog").expect("avitolog binary");
    cmd.env("AVITOLOG_STORAGE__PATH", state.path().join("state.db"))
        .env("AVITOLOG_API__BASE_URL", "http://127.0.0.1:9/")
        .env("AVITOLOG_API__TIMEOUT", "2s")
        .env_remove("AVITOLOG_LOG");
    cmd
}

#[test]
fn prints_version() {
    let state = TempDir::new().unwrap();
    avitolog(&state)
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn prints_help() {
    let state = TempDir::new().unwrap();
    avitolog(&state)
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage: avitolog <COMMAND>"))
        .stdout(predicate::str::contains("whoami"))
        .stdout(predicate::str::contains("AVITOLOG_LOG"));
}

#[test]
fn unknown_command_fails() {
    let state = TempDir::new().unwrap();
    avitolog(&state)
        .arg("frobnicate")
        .assert()
        .failure()
        .stderr(predicate::str::contains("unrecognized subcommand 'frobnicate'"));
}

#[test]
fn malformed_search_url_fails() {
    let state = TempDir::new().unwrap();
    avitolog(&state)
        .args(["search", "not-a-url"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid listing url"));
}

#[test]
fn commenting_requires_sign_in() {
    let state = TempDir::new().unwrap();
    avitolog(&state)
        .args(["comment", "1", "hello"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("not signed in"));
}

#[test]
fn flag_like_words_stay_in_comment_text() {
    let state = TempDir::new().unwrap();
    avitolog(&state)
        .args(["comment", "5", "use", "-V", "carefully"])
        .assert()
        .failure()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")).not())
        .stderr(predicate::str::contains("not signed in"));
}

#[test]
fn invalid_listing_id_is_rejected() {
    let state = TempDir::new().unwrap();
    avitolog(&state)
        .args(["show", "abc"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid value 'abc'"));
}

#[test]
fn whoami_without_session() {
    let state = TempDir::new().unwrap();
    avitolog(&state)
        .arg("whoami")
        .assert()
        .success()
        .stdout(predicate::str::contains("Вы не вошли."));
}
