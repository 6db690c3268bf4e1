#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{DaemonFixture, is_process_alive, position_of, wait_for_worker_pid};
use nix::{
    sys::signal::Signal,
    unistd::{Pid, getsid},
};

#[test]
fn start_detaches_and_supervises_a_worker() {
    let fixture = DaemonFixture::new();

    let daemon_pid = fixture.start(&["--tick", "100ms"]);

    assert!(is_process_alive(daemon_pid));
    let lines = fixture.wait_for_log(") tick", 2);
    position_of(&lines, "Daemon initializing... (pid");
    position_of(
        &lines,
        &format!("Daemon started successfully, pid: {daemon_pid}"),
    );
    position_of(&lines, "Start with pid file: ");
    position_of(&lines, "Started worker(");

    fixture.signal_and_wait(daemon_pid, Signal::SIGTERM);
}

#[test]
fn pid_file_holds_the_daemon_pid() {
    let fixture = DaemonFixture::new();

    let daemon_pid = fixture.start(&[]);

    let contents = fs::read_to_string(&fixture.pid_file).unwrap();
    assert_eq!(contents, format!("{daemon_pid}\n"));

    fixture.signal_and_wait(daemon_pid, Signal::SIGTERM);
    assert!(!fixture.pid_file.exists());
}

#[test]
fn daemon_leads_its_own_session() {
    let fixture = DaemonFixture::new();

    let daemon_pid = fixture.start(&[]);

    let pid = Pid::from_raw(daemon_pid as i32);
    assert_eq!(getsid(Some(pid)).unwrap(), pid);
    assert_ne!(getsid(None).unwrap(), pid);

    fixture.signal_and_wait(daemon_pid, Signal::SIGTERM);
}

#[cfg(target_os = "linux")]
#[test]
fn worker_runs_with_worker_role_marker() {
    let fixture = DaemonFixture::new();

    let daemon_pid = fixture.start(&["--record-worker-pid"]);
    let worker_pid = wait_for_worker_pid(&fixture.pid_file);

    assert_ne!(worker_pid, daemon_pid);
    let environ = fs::read(format!("/proc/{worker_pid}/environ")).unwrap();
    let markers: Vec<_> = environ
        .split(|byte| *byte == 0)
        .filter(|entry| entry.starts_with(b"RESPAWN_PROCESS_ROLE="))
        .collect();
    assert_eq!(markers, vec![b"RESPAWN_PROCESS_ROLE=3".as_slice()]);

    fixture.signal_and_wait(daemon_pid, Signal::SIGTERM);
}

#[cfg(target_os = "linux")]
#[test]
fn process_title_is_applied_to_daemon_and_worker() {
    let fixture = DaemonFixture::new();

    let daemon_pid = fixture.start(&["--title", "hellod", "--record-worker-pid"]);
    let worker_pid = wait_for_worker_pid(&fixture.pid_file);
    fixture.wait_for_log(") tick", 1);

    let daemon_comm = fs::read_to_string(format!("/proc/{daemon_pid}/comm")).unwrap();
    let worker_comm = fs::read_to_string(format!("/proc/{worker_pid}/comm")).unwrap();
    assert_eq!(daemon_comm.trim(), "hellod");
    assert_eq!(worker_comm.trim(), "hellod");

    fixture.signal_and_wait(daemon_pid, Signal::SIGTERM);
}
