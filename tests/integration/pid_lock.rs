#[path = "common/mod.rs"]
mod common;

use std::{
    fs, thread,
    time::{Duration, Instant},
};

use common::{DaemonFixture, count_matching, is_process_alive, wait_for_pid};
use nix::sys::signal::Signal;
use predicates::prelude::*;
use respawn::pidfile::read_pid;

#[test]
fn second_start_is_refused_while_running() {
    let fixture = DaemonFixture::new();
    let daemon_pid = fixture.start(&[]);

    let started = Instant::now();
    fixture
        .start_cmd(&[])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already running"))
        .stderr(predicate::str::contains("respawn.pid"));

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(read_pid(&fixture.pid_file), Some(daemon_pid));
    assert!(is_process_alive(daemon_pid));

    fixture.signal_and_wait(daemon_pid, Signal::SIGTERM);
}

#[test]
fn stale_pid_file_is_reclaimed() {
    let fixture = DaemonFixture::new();
    fs::create_dir_all(fixture.pid_file.parent().unwrap()).unwrap();
    fs::write(&fixture.pid_file, "999999\n").unwrap();

    fixture.start_cmd(&[]).assert().success();

    let deadline = Instant::now() + Duration::from_secs(5);
    let daemon_pid = loop {
        match read_pid(&fixture.pid_file) {
            Some(pid) if pid != 999999 => break pid,
            _ if Instant::now() >= deadline => panic!("stale pid was never replaced"),
            _ => thread::sleep(Duration::from_millis(50)),
        }
    };

    assert!(is_process_alive(daemon_pid));
    fixture.signal_and_wait(daemon_pid, Signal::SIGTERM);
}

#[test]
fn daemon_can_start_again_after_shutdown() {
    let fixture = DaemonFixture::new();

    let first = fixture.start(&[]);
    fixture.signal_and_wait(first, Signal::SIGTERM);

    let second = fixture.start(&[]);
    assert_ne!(first, second);
    fixture.signal_and_wait(second, Signal::SIGTERM);
}

#[test]
fn racing_launchers_leave_exactly_one_daemon() {
    let fixture = DaemonFixture::new();

    let mut first = fixture.start_cmd(&[]);
    let mut second = fixture.start_cmd(&[]);
    let a = thread::spawn(move || first.output().unwrap());
    let b = thread::spawn(move || second.output().unwrap());
    let outputs = [a.join().unwrap(), b.join().unwrap()];
    assert!(outputs.iter().any(|output| output.status.success()));

    let daemon_pid = wait_for_pid(&fixture.pid_file);
    // A launcher that passed the pre-check spawns a daemon that must lose the lock.
    let launched = outputs.iter().filter(|o| o.status.success()).count();
    if launched == 2 {
        fixture.wait_for_log("already running", 1);
    }

    thread::sleep(Duration::from_millis(300));
    let lines = fixture.log_lines();
    assert_eq!(count_matching(&lines, "Daemon started successfully"), 1);
    assert_eq!(read_pid(&fixture.pid_file), Some(daemon_pid));

    fixture.signal_and_wait(daemon_pid, Signal::SIGTERM);
}
