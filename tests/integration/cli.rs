#[path = "common/mod.rs"]
mod common;

use std::fs;

use assert_cmd::Command;
use common::DaemonFixture;
use nix::sys::signal::Signal;
use predicates::prelude::*;

fn respawn() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("respawn"));
    cmd.env_remove("RESPAWN_PROCESS_ROLE");
    cmd
}

#[test]
fn help_lists_subcommands() {
    respawn()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("start"))
        .stdout(predicate::str::contains("stop"))
        .stdout(predicate::str::contains("status"))
        .stdout(predicate::str::contains("logs"));
}

#[test]
fn status_reports_not_running_without_pid_file() {
    let fixture = DaemonFixture::new();

    respawn()
        .arg("status")
        .arg("--pid-file")
        .arg(&fixture.pid_file)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("not running"));
    assert!(!fixture.pid_file.exists());
}

#[test]
fn status_and_stop_drive_a_running_daemon() {
    let fixture = DaemonFixture::new();
    let daemon_pid = fixture.start(&[]);

    respawn()
        .arg("status")
        .arg("--pid-file")
        .arg(&fixture.pid_file)
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "respawn is running (pid {daemon_pid})"
        )));

    respawn()
        .arg("stop")
        .arg("--pid-file")
        .arg(&fixture.pid_file)
        .arg("--timeout")
        .arg("10s")
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "Stopped respawn daemon (pid {daemon_pid})"
        )));

    assert!(!fixture.pid_file.exists());
    #[cfg(target_os = "linux")]
    common::wait_for_process_exit(daemon_pid);

    respawn()
        .arg("status")
        .arg("--pid-file")
        .arg(&fixture.pid_file)
        .assert()
        .code(1);
}

#[test]
fn status_shows_worker_pid_when_recorded() {
    let fixture = DaemonFixture::new();
    let daemon_pid = fixture.start(&["--record-worker-pid"]);
    let worker_pid = common::wait_for_worker_pid(&fixture.pid_file);

    respawn()
        .arg("status")
        .arg("--pid-file")
        .arg(&fixture.pid_file)
        .assert()
        .success()
        .stdout(predicate::str::contains(format!(
            "(pid {daemon_pid}, worker {worker_pid})"
        )));

    fixture.signal_and_wait(daemon_pid, Signal::SIGTERM);
}

#[test]
fn stop_without_daemon_is_a_no_op() {
    let fixture = DaemonFixture::new();

    respawn()
        .arg("stop")
        .arg("--pid-file")
        .arg(&fixture.pid_file)
        .assert()
        .success()
        .stdout(predicate::str::contains("not running"));
}

#[test]
fn logs_prints_the_tail_of_the_log_file() {
    let fixture = DaemonFixture::new();
    let daemon_pid = fixture.start(&["--tick", "50ms"]);
    fixture.wait_for_log(") tick", 3);

    respawn()
        .arg("logs")
        .arg("--log-file")
        .arg(&fixture.log_file)
        .arg("--lines")
        .arg("2")
        .assert()
        .success()
        .stdout(predicate::function(|out: &str| out.lines().count() == 2));

    fixture.signal_and_wait(daemon_pid, Signal::SIGTERM);
}

#[test]
fn logs_fails_for_missing_file() {
    let fixture = DaemonFixture::new();

    respawn()
        .arg("logs")
        .arg("--log-file")
        .arg(fixture.dir().join("absent.log"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("absent.log"));
}

#[test]
fn start_rejects_invalid_config() {
    let fixture = DaemonFixture::new();
    let config_path = fixture.dir().join("broken.yaml");
    fs::write(&config_path, "max_restarts: 3\n").unwrap();

    fixture
        .start_cmd(&["--config", config_path.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Invalid YAML format"));

    assert!(!fixture.pid_file.exists());
    assert!(!fixture.log_file.exists());
}
