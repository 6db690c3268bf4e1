//! Command-line interface for the `respawn` binary.
use std::{path::PathBuf, str::FromStr, time::Duration};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::config::{RestartPolicy, parse_duration};

/// `--log-level` value: a level name ("info", "debug", ...) or a number 0-5.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    pub fn filter(self) -> LevelFilter {
        self.0
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        value
            .trim()
            .parse::<LevelFilter>()
            .map(LogLevelArg)
            .map_err(|_| format!("invalid log level '{value}' (expected a name or 0-5)"))
    }
}

/// Clap adapter over [`parse_duration`].
fn duration_arg(raw: &str) -> Result<Duration, String> {
    parse_duration(raw).map_err(|err| err.to_string())
}

/// Command-line interface for respawn.
#[derive(Parser)]
#[command(name = "respawn", version, author)]
#[command(about = "Run a payload as a self-supervising background daemon", long_about = None)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for respawn.
#[derive(Subcommand)]
pub enum Commands {
    /// Detach into the background and keep a worker running.
    Start {
        /// YAML configuration file; flags override its values.
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,

        /// Pid file guarding against a second instance.
        #[arg(short, long, value_name = "PATH")]
        pid_file: Option<PathBuf>,

        /// File receiving lifecycle lines and all daemon and worker output.
        #[arg(short, long, value_name = "PATH")]
        log_file: Option<PathBuf>,

        /// Number of restarts allowed, 0 for unlimited.
        #[arg(long, value_name = "N")]
        max_restart: Option<u32>,

        /// Which worker exits are restarted: always (default) or on_failure.
        #[arg(long, value_name = "POLICY")]
        restart_policy: Option<RestartPolicy>,

        /// Pause before each restart (e.g., "500ms", "2s").
        #[arg(long, value_name = "DURATION", value_parser = duration_arg)]
        restart_delay: Option<Duration>,

        /// Process name shown by ps and top.
        #[arg(long, value_name = "NAME")]
        title: Option<String>,

        /// Also record the current worker pid in the pid file.
        #[arg(long)]
        record_worker_pid: bool,

        /// Interval between heartbeat lines printed by the worker.
        #[arg(long, value_name = "DURATION", default_value = "1s", value_parser = duration_arg)]
        tick: Duration,

        /// Make the worker exit after this long, to exercise restarts.
        #[arg(long, value_name = "DURATION", value_parser = duration_arg)]
        crash_after: Option<Duration>,

        /// Exit code used together with --crash-after.
        #[arg(long, value_name = "CODE", default_value_t = 1)]
        exit_code: u8,
    },

    /// Ask a running daemon to shut down.
    Stop {
        /// Pid file of the daemon to stop.
        #[arg(short, long, value_name = "PATH")]
        pid_file: PathBuf,

        /// How long to wait for the pid file to disappear.
        #[arg(long, value_name = "DURATION", default_value = "10s", value_parser = duration_arg)]
        timeout: Duration,
    },

    /// Report whether a daemon is running.
    Status {
        /// Pid file of the daemon to check.
        #[arg(short, long, value_name = "PATH")]
        pid_file: PathBuf,
    },

    /// Show the tail of the daemon log file.
    Logs {
        /// Log file passed to `start --log-file`.
        #[arg(short, long, value_name = "PATH")]
        log_file: PathBuf,

        /// Number of lines to show (default: 50).
        #[arg(short = 'n', long, default_value = "50")]
        lines: usize,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
