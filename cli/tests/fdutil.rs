use assert_cmd::Command;
use predicates::str::contains;
use std::io::Write;
use tempfile::NamedTempFile;

fn fdutil() -> Command {
    Command::cargo_bin("fdutil").unwrap()
}

fn image_path() -> std::path::PathBuf {
    let tmp = NamedTempFile::new().unwrap();
    let path = tmp.path().to_owned();
    tmp.close().unwrap();
    path
}

#[test]
fn init_reports_block_count() {
    let image = image_path();
    fdutil()
        .args([image.to_str().unwrap(), "init", "4"])
        .assert()
        .success()
        .stdout(contains("4 blocks"));
}

#[test]
fn write_then_list_shows_the_file() {
    let image = image_path();
    fdutil().args([image.to_str().unwrap(), "init", "4"]).assert().success();

    let mut payload = NamedTempFile::new().unwrap();
    payload.write_all(b"hello world").unwrap();

    fdutil()
        .args([
            image.to_str().unwrap(),
            "write",
            "greeting",
            "0",
            payload.path().to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(contains("written successfully"));

    fdutil()
        .args([image.to_str().unwrap(), "list"])
        .assert()
        .success()
        .stdout(contains("greeting"));
}

#[test]
fn write_then_read_round_trips_file_contents() {
    let image = image_path();
    fdutil().args([image.to_str().unwrap(), "init", "4"]).assert().success();

    let mut payload = NamedTempFile::new().unwrap();
    payload.write_all(b"round trip payload").unwrap();
    let out = NamedTempFile::new().unwrap();

    fdutil()
        .args([
            image.to_str().unwrap(),
            "write",
            "doc",
            "0",
            payload.path().to_str().unwrap(),
        ])
        .assert()
        .success();

    fdutil()
        .args([image.to_str().unwrap(), "read", "doc", out.path().to_str().unwrap()])
        .assert()
        .success();

    let contents = std::fs::read(out.path()).unwrap();
    assert_eq!(contents, b"round trip payload");
}

#[test]
fn read_missing_file_exits_nonzero_with_error_on_stderr() {
    let image = image_path();
    fdutil().args([image.to_str().unwrap(), "init", "2"]).assert().success();

    let out = NamedTempFile::new().unwrap();
    fdutil()
        .args([image.to_str().unwrap(), "read", "ghost", out.path().to_str().unwrap()])
        .assert()
        .failure()
        .code(1)
        .stderr(contains("error:"));
}

#[test]
fn delete_by_block_removes_the_file() {
    let image = image_path();
    fdutil().args([image.to_str().unwrap(), "init", "4"]).assert().success();

    let mut payload = NamedTempFile::new().unwrap();
    payload.write_all(b"x").unwrap();
    fdutil()
        .args([
            image.to_str().unwrap(),
            "write",
            "temp",
            "0",
            payload.path().to_str().unwrap(),
        ])
        .assert()
        .success();

    fdutil()
        .args([image.to_str().unwrap(), "delete", "#0"])
        .assert()
        .success()
        .stdout(contains("deleted successfully"));

    fdutil()
        .args([image.to_str().unwrap(), "list"])
        .assert()
        .success()
        .stdout(contains("Start").and(contains("temp").not()));
}

#[test]
fn list_prefix_filters_results() {
    let image = image_path();
    fdutil().args([image.to_str().unwrap(), "init", "4"]).assert().success();

    for name in ["alpha", "apple", "banana"] {
        let mut payload = NamedTempFile::new().unwrap();
        payload.write_all(b"x").unwrap();
        fdutil()
            .args([
                image.to_str().unwrap(),
                "write",
                name,
                "0",
                payload.path().to_str().unwrap(),
            ])
            .assert()
            .success();
    }

    fdutil()
        .args([image.to_str().unwrap(), "list", "a"])
        .assert()
        .success()
        .stdout(contains("alpha").and(contains("apple")).and(contains("banana").not()));
}
