//! The `sample` binary talking to an in-process server.

use std::time::Duration;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::str::contains;
use tempfile::TempDir;

use msgdispatch::{Dispatcher, DispatcherConfig, DispatcherHandle, ServiceEndpoint};
use msgdispatch_samples::sample;

fn start(dir: &TempDir) -> DispatcherHandle {
    let path = dir.path().join("d.sock");
    let endpoint = ServiceEndpoint::path(path.to_str().expect("utf8 path"));
    let config = DispatcherConfig::default().with_poll_timeout(Some(Duration::from_millis(20)));
    Dispatcher::new(sample::registry().expect("registry"), config)
        .spawn(&endpoint)
        .expect("spawn sample server")
}

#[test]
fn fact_prints_the_value() {
    let dir = TempDir::new().expect("temp dir");
    let handle = start(&dir);

    let mut command = cargo_bin_cmd!("sample");
    command.current_dir(dir.path()).args(["d.sock", "fact", "7"]);
    command.assert().success().stdout("5040\n");

    let mut command = cargo_bin_cmd!("sample");
    command.current_dir(dir.path()).args(["d.sock", "fact", "11"]);
    command.assert().success().stdout("39916800\n");

    handle.shutdown();
    handle.join().expect("join server");
}

#[test]
fn refused_fact_exits_with_the_server_code() {
    let dir = TempDir::new().expect("temp dir");
    let handle = start(&dir);

    let mut command = cargo_bin_cmd!("sample");
    command.current_dir(dir.path()).args(["d.sock", "fact", "30"]);
    command.assert().code(1).stdout("");

    let mut command = cargo_bin_cmd!("sample");
    command.current_dir(dir.path()).args(["d.sock", "fact", "-7"]);
    command.assert().code(1);

    handle.shutdown();
    handle.join().expect("join server");
}

#[test]
fn unreachable_server_is_reported() {
    let dir = TempDir::new().expect("temp dir");

    let mut command = cargo_bin_cmd!("sample");
    command.current_dir(dir.path()).args(["missing.sock", "fact", "3"]);
    command.assert().code(2).stderr(contains("request failed"));
}

#[test]
fn unknown_action_is_a_usage_error() {
    let mut command = cargo_bin_cmd!("sample");
    command.args(["d.sock", "divide"]);
    command.assert().failure().stderr(contains("divide"));
}
