//! Self-daemonizing entry point.
//!
//! The same binary runs up to three times: the launcher re-executes itself as
//! a detached daemon and exits, the daemon claims the pid file and supervises,
//! and each worker runs the embedding application's payload.
use std::{
    path::{Path, PathBuf},
    process::{self, ExitCode},
    time::Duration,
};

use tracing::{debug, error, info};

use crate::{
    config::{DEFAULT_POLL_INTERVAL, DaemonConfig, RestartPolicy},
    error::{ConfigError, DaemonError},
    launcher::{LaunchDescriptor, launch_detached},
    pidfile::PidFile,
    reporter::{LifecycleEvent, Reporter},
    role::Role,
    sink::Sink,
    supervisor::Supervisor,
    title::apply_process_title,
};

/// What the calling process should do after [`Daemon::start`] returns.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Launch {
    /// This process has done its part and should exit with the given code.
    Exit(i32),
    /// This process is a worker: run the application payload.
    RunWorker,
}

impl Launch {
    /// Returns `true` when the caller should go on to run its payload.
    pub fn should_continue(&self) -> bool {
        matches!(self, Launch::RunWorker)
    }

    /// Exit code for [`Launch::Exit`]; success for a finished worker.
    pub fn exit_code(&self) -> ExitCode {
        match self {
            Launch::Exit(code) => u8::try_from(*code).map_or(ExitCode::FAILURE, ExitCode::from),
            Launch::RunWorker => ExitCode::SUCCESS,
        }
    }
}

/// Daemonization settings plus the sinks shared by every role.
#[derive(Debug, Clone)]
pub struct Daemon {
    pid_file: Option<PathBuf>,
    max_restart: u32,
    restart_policy: RestartPolicy,
    restart_delay: Duration,
    poll_interval: Duration,
    process_title: Option<String>,
    record_worker_pid: bool,
    stdout: Sink,
    stderr: Sink,
}

impl Default for Daemon {
    fn default() -> Self {
        Self {
            pid_file: None,
            max_restart: 0,
            restart_policy: RestartPolicy::default(),
            restart_delay: Duration::ZERO,
            poll_interval: DEFAULT_POLL_INTERVAL,
            process_title: None,
            record_worker_pid: false,
            stdout: Sink::null(),
            stderr: Sink::null(),
        }
    }
}

impl Daemon {
    /// Creates a daemon with unlimited restarts, no pid file and null sinks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a daemon from a loaded configuration file.
    pub fn from_config(config: &DaemonConfig) -> Result<Self, ConfigError> {
        Ok(Self {
            pid_file: config.pid_file.clone(),
            max_restart: config.max_restart,
            restart_policy: config.restart_policy,
            restart_delay: config.restart_delay()?,
            poll_interval: config.poll_interval()?,
            process_title: config.process_title.clone(),
            record_worker_pid: config.record_worker_pid,
            ..Self::default()
        })
    }

    pub fn pid_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.pid_file = Some(path.into());
        self
    }

    /// Number of restarts allowed, `0` for unlimited.
    pub fn max_restart(mut self, max_restart: u32) -> Self {
        self.max_restart = max_restart;
        self
    }

    pub fn restart_policy(mut self, policy: RestartPolicy) -> Self {
        self.restart_policy = policy;
        self
    }

    pub fn restart_delay(mut self, delay: Duration) -> Self {
        self.restart_delay = delay;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Kernel-visible name for the daemon and its workers.
    pub fn process_title(mut self, title: impl Into<String>) -> Self {
        self.process_title = Some(title.into());
        self
    }

    pub fn record_worker_pid(mut self, enabled: bool) -> Self {
        self.record_worker_pid = enabled;
        self
    }

    /// Sink receiving lifecycle lines and the standard output of every
    /// launched process.
    pub fn stdout(mut self, sink: Sink) -> Self {
        self.stdout = sink;
        self
    }

    /// Sink receiving failure lines and the standard error of every launched
    /// process.
    pub fn stderr(mut self, sink: Sink) -> Self {
        self.stderr = sink;
        self
    }

    /// Configured pid file path, if any.
    pub fn pid_file_path(&self) -> Option<&Path> {
        self.pid_file.as_deref()
    }

    /// Runs the part of the startup protocol that belongs to this process.
    pub fn start(&self) -> Result<Launch, DaemonError> {
        self.start_as(Role::detect())
    }

    /// Like [`Daemon::start`], with the role supplied by the caller.
    pub fn start_as(&self, role: Role) -> Result<Launch, DaemonError> {
        debug!("Starting in {role} role (pid {})", process::id());
        match role {
            Role::Uninitialized => self.launch(),
            Role::Daemon => self.supervise(),
            Role::Worker => {
                if let Some(title) = &self.process_title {
                    apply_process_title(title);
                }
                Ok(Launch::RunWorker)
            }
        }
    }

    fn reporter(&self) -> Reporter {
        Reporter::new(self.stdout.clone(), self.stderr.clone())
    }

    /// Launcher role: hand off to a detached daemon and exit.
    fn launch(&self) -> Result<Launch, DaemonError> {
        if let Some(path) = &self.pid_file {
            PidFile::probe(path)?;
        }

        let daemon = launch_detached(&self.stdout, &self.stderr, Role::Daemon)?;
        let daemon_pid = daemon.pid();
        info!("Daemon launched with pid {daemon_pid}");
        self.reporter()
            .report(&LifecycleEvent::Initializing { daemon_pid });

        Ok(Launch::Exit(0))
    }

    /// Daemon role: claim the pid file, then supervise until shutdown.
    ///
    /// Signal handlers are installed before the pid file is claimed.
    fn supervise(&self) -> Result<Launch, DaemonError> {
        let reporter = self.reporter();

        let mut supervisor = Supervisor::new(LaunchDescriptor::current()?, self.reporter())
            .max_restart(self.max_restart)
            .restart_policy(self.restart_policy)
            .restart_delay(self.restart_delay)
            .poll_interval(self.poll_interval)
            .record_worker_pid(self.record_worker_pid);
        supervisor.install_signal_handlers()?;

        if let Some(path) = &self.pid_file {
            match PidFile::acquire(path) {
                Ok(guard) => supervisor = supervisor.pid_file(guard),
                Err(err) => {
                    error!("{err}");
                    reporter.report(&LifecycleEvent::Error {
                        message: err.to_string(),
                    });
                    return Err(err.into());
                }
            }
        }

        reporter.report(&LifecycleEvent::DaemonStarted { pid: process::id() });
        if let Some(path) = supervisor.pid_file_path() {
            reporter.report(&LifecycleEvent::PidFileClaimed {
                path: path.to_path_buf(),
            });
        }

        if let Some(title) = &self.process_title {
            apply_process_title(title);
        }

        let outcome = supervisor.run();
        info!(
            "Supervision finished after {} restart(s): {:?}",
            outcome.restarts, outcome.reason
        );
        Ok(Launch::Exit(outcome.exit_code))
    }
}
