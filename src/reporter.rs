//! Human-readable lifecycle lines written to the embedding application's sinks.
use std::{fmt, path::PathBuf, process::ExitStatus, time::Duration};

use chrono::Local;
use nix::sys::signal::Signal;
use tracing::debug;

use crate::sink::Sink;

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitOutcome {
    /// Exited normally with this status code.
    Code(i32),
    /// Terminated by this signal number.
    Signal(i32),
}

impl ExitOutcome {
    /// Converts a raw status as returned by `wait`.
    pub fn from_status(status: ExitStatus) -> Self {
        #[cfg(unix)]
        {
            use std::os::unix::process::ExitStatusExt;
            if let Some(signal) = status.signal() {
                return ExitOutcome::Signal(signal);
            }
        }
        ExitOutcome::Code(status.code().unwrap_or(-1))
    }

    /// Returns `true` only for a zero exit code.
    pub fn success(self) -> bool {
        matches!(self, ExitOutcome::Code(0))
    }

    /// Numeric code, with signals reported shell-style as `128 + signal`.
    pub fn code(self) -> i32 {
        match self {
            ExitOutcome::Code(code) => code,
            ExitOutcome::Signal(signal) => 128 + signal,
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ExitOutcome::Code(code) => write!(f, "exit code {code}"),
            ExitOutcome::Signal(signal) => match Signal::try_from(*signal) {
                Ok(sig) => write!(f, "signal {signal} ({sig})"),
                Err(_) => write!(f, "signal {signal}"),
            },
        }
    }
}

/// A state transition worth telling the operator about.
#[derive(Debug, Clone, PartialEq)]
pub enum LifecycleEvent {
    /// The launcher handed off to a background daemon.
    Initializing {
        /// Pid of the freshly started daemon.
        daemon_pid: u32,
    },
    /// The daemon owns its pid file and is about to supervise.
    DaemonStarted {
        /// Pid of the daemon.
        pid: u32,
    },
    /// The pid file was claimed.
    PidFileClaimed {
        /// Absolute path of the pid file.
        path: PathBuf,
    },
    /// A worker process was started.
    WorkerStarted {
        /// Pid of the worker.
        pid: u32,
    },
    /// A worker exited on its own.
    WorkerExited {
        /// Pid of the worker.
        pid: u32,
        /// How it ended.
        outcome: ExitOutcome,
    },
    /// A replacement worker is about to be started.
    Restarting {
        /// One-based restart number.
        attempt: u32,
        /// Configured limit, `None` when unlimited.
        limit: Option<u32>,
        /// Pause before the launch.
        delay: Duration,
    },
    /// The restart budget ran out.
    RestartLimitReached {
        /// Configured limit.
        limit: u32,
    },
    /// A termination signal arrived.
    SignalReceived {
        /// Signal number.
        signal: i32,
    },
    /// A worker was killed during shutdown.
    WorkerKilled {
        /// Pid of the worker.
        pid: u32,
        /// How it ended.
        outcome: ExitOutcome,
    },
    /// Killing a worker failed.
    KillFailed {
        /// Pid of the worker.
        pid: u32,
        /// Error text.
        error: String,
    },
    /// Supervision finished.
    DaemonExited,
    /// A failure that does not fit another event.
    Error {
        /// Error text.
        message: String,
    },
}

impl LifecycleEvent {
    /// Failures go to the error sink, everything else to the output sink.
    pub fn is_failure(&self) -> bool {
        match self {
            LifecycleEvent::WorkerExited { outcome, .. } => !outcome.success(),
            LifecycleEvent::KillFailed { .. } | LifecycleEvent::Error { .. } => true,
            _ => false,
        }
    }
}

impl fmt::Display for LifecycleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LifecycleEvent::Initializing { daemon_pid } => {
                write!(f, "Daemon initializing... (pid {daemon_pid})")
            }
            LifecycleEvent::DaemonStarted { pid } => {
                write!(f, "Daemon started successfully, pid: {pid}")
            }
            LifecycleEvent::PidFileClaimed { path } => {
                write!(f, "Start with pid file: {}", path.display())
            }
            LifecycleEvent::WorkerStarted { pid } => write!(f, "Started worker({pid})"),
            LifecycleEvent::WorkerExited { pid, outcome } => {
                write!(f, "Worker({pid}) exited with {outcome}")
            }
            LifecycleEvent::Restarting {
                attempt,
                limit,
                delay,
            } => {
                match limit {
                    Some(limit) => write!(f, "Restarting worker ({attempt}/{limit})")?,
                    None => write!(f, "Restarting worker ({attempt})")?,
                }
                if !delay.is_zero() {
                    write!(f, " in {}ms", delay.as_millis())?;
                }
                Ok(())
            }
            LifecycleEvent::RestartLimitReached { limit } => write!(
                f,
                "Exceeded the maximum number of restarts({limit}), exiting"
            ),
            LifecycleEvent::SignalReceived { signal } => {
                write!(f, "Daemon received exit signal({signal})")
            }
            LifecycleEvent::WorkerKilled { pid, outcome } => {
                write!(f, "Worker({pid}) killed ({outcome})")
            }
            LifecycleEvent::KillFailed { pid, error } => {
                write!(f, "Kill worker({pid}) error: {error}")
            }
            LifecycleEvent::DaemonExited => write!(f, "Daemon exited"),
            LifecycleEvent::Error { message } => write!(f, "{message}"),
        }
    }
}

/// Writes one timestamped line per [`LifecycleEvent`].
///
/// Writes are synchronous and best effort: a failing sink never disturbs the
/// caller.
#[derive(Debug, Clone, Default)]
pub struct Reporter {
    stdout: Sink,
    stderr: Sink,
}

impl Reporter {
    /// Creates a reporter writing to the given sinks.
    pub fn new(stdout: Sink, stderr: Sink) -> Self {
        Self { stdout, stderr }
    }

    /// Output sink, shared with launched processes.
    pub fn stdout(&self) -> &Sink {
        &self.stdout
    }

    /// Error sink, shared with launched processes.
    pub fn stderr(&self) -> &Sink {
        &self.stderr
    }

    /// Emits `event` to the matching sink.
    pub fn report(&self, event: &LifecycleEvent) {
        debug!("lifecycle: {event}");

        let line = format!("[{}] {}", Local::now().format("%Y-%m-%d %H:%M:%S%.3f"), event);
        let sink = if event.is_failure() {
            &self.stderr
        } else {
            &self.stdout
        };
        if let Err(err) = sink.write_line(&line) {
            debug!("Dropped lifecycle line ({err}): {line}");
        }
    }
}
