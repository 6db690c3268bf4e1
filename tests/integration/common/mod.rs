#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use assert_cmd::Command;
use nix::{
    sys::signal::{self, Signal},
    unistd::Pid as NixPid,
};
use respawn::pidfile::{read_pid, read_worker_pid};
use sysinfo::{Pid, ProcessesToUpdate, System};
use tempfile::TempDir;

/// Scratch directory holding the pid file and log file of one daemon.
///
/// Dropping the fixture stops any daemon still recorded in the pid file.
pub struct DaemonFixture {
    dir: TempDir,
    pub pid_file: PathBuf,
    pub log_file: PathBuf,
}

impl DaemonFixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create tempdir");
        let pid_file = dir.path().join("run/respawn.pid");
        let log_file = dir.path().join("logs/respawn.log");
        Self {
            dir,
            pid_file,
            log_file,
        }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    /// `respawn start` wired to this fixture's pid and log files.
    pub fn start_cmd(&self, extra: &[&str]) -> Command {
        let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("respawn"));
        cmd.arg("start")
            .arg("--pid-file")
            .arg(&self.pid_file)
            .arg("--log-file")
            .arg(&self.log_file)
            .args(["--log-level", "info"])
            .args(extra)
            .env_remove("RESPAWN_PROCESS_ROLE")
            .timeout(Duration::from_secs(10));
        cmd
    }

    /// Starts a daemon and waits until it has recorded its pid.
    pub fn start(&self, extra: &[&str]) -> u32 {
        self.start_cmd(extra).assert().success();
        wait_for_pid(&self.pid_file)
    }

    pub fn log(&self) -> String {
        fs::read_to_string(&self.log_file).unwrap_or_default()
    }

    pub fn log_lines(&self) -> Vec<String> {
        self.log().lines().map(str::to_string).collect()
    }

    /// Polls the log until `needle` appears `count` times.
    pub fn wait_for_log(&self, needle: &str, count: usize) -> Vec<String> {
        let deadline = Instant::now() + Duration::from_secs(10);
        loop {
            let lines = self.log_lines();
            if lines.iter().filter(|line| line.contains(needle)).count() >= count {
                return lines;
            }

            if Instant::now() >= deadline {
                panic!(
                    "Timed out waiting for {count}x {needle:?} in {:?}:\n{}",
                    self.log_file,
                    lines.join("\n")
                );
            }

            thread::sleep(Duration::from_millis(50));
        }
    }

    /// Sends `sig` to the daemon and waits for it to remove its pid file.
    pub fn signal_and_wait(&self, daemon_pid: u32, sig: Signal) {
        send_signal(daemon_pid, sig);
        wait_for_removed(&self.pid_file);
    }
}

impl Drop for DaemonFixture {
    fn drop(&mut self) {
        let Some(pid) = read_pid(&self.pid_file) else {
            return;
        };
        let target = NixPid::from_raw(pid as i32);
        if signal::kill(target, Signal::SIGTERM).is_err() {
            return;
        }

        let deadline = Instant::now() + Duration::from_secs(5);
        while self.pid_file.exists() && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(50));
        }
        if self.pid_file.exists() {
            let _ = signal::kill(target, Signal::SIGKILL);
        }
    }
}

pub fn send_signal(pid: u32, sig: Signal) {
    signal::kill(NixPid::from_raw(pid as i32), sig)
        .unwrap_or_else(|err| panic!("failed to send {sig} to {pid}: {err}"));
}

pub fn count_matching(lines: &[String], needle: &str) -> usize {
    lines.iter().filter(|line| line.contains(needle)).count()
}

pub fn position_of(lines: &[String], needle: &str) -> usize {
    lines
        .iter()
        .position(|line| line.contains(needle))
        .unwrap_or_else(|| panic!("missing {needle:?} in:\n{}", lines.join("\n")))
}

pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("Timed out waiting for {:?} to exist", path);
}

pub fn wait_for_removed(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("Timed out waiting for {:?} to be removed", path);
}

pub fn wait_for_pid(pid_file: &Path) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(pid) = read_pid(pid_file) {
            return pid;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for a pid in {:?}", pid_file);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

pub fn wait_for_worker_pid(pid_file: &Path) -> u32 {
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Some(pid) = read_worker_pid(pid_file) {
            return pid;
        }

        if Instant::now() >= deadline {
            panic!("Timed out waiting for a worker pid in {:?}", pid_file);
        }

        thread::sleep(Duration::from_millis(50));
    }
}

#[cfg(target_os = "linux")]
pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    let proc_path = PathBuf::from(format!("/proc/{}", pid));
    let stat_path = PathBuf::from(format!("/proc/{}/stat", pid));

    while Instant::now() < deadline {
        if !proc_path.exists() {
            return;
        }

        // Zombies and dead entries count as exited.
        if let Ok(stat) = fs::read_to_string(&stat_path)
            && let Some(state_start) = stat.rfind(')')
            && let Some(state_char) = stat[state_start + 1..].trim().chars().next()
            && (state_char == 'Z' || state_char == 'X')
        {
            return;
        }

        thread::sleep(Duration::from_millis(50));
    }

    panic!("Timed out waiting for PID {} to exit", pid);
}

pub fn is_process_alive(pid: u32) -> bool {
    let mut system = System::new();
    system.refresh_processes(ProcessesToUpdate::All, true);
    system.process(Pid::from_u32(pid)).is_some()
}
