//! Respawn turns an ordinary binary into a self-daemonizing, self-supervising
//! service on Unix-like operating systems. The binary re-executes itself in the
//! background, claims an exclusive pid file, and keeps a worker copy of itself
//! running, restarting it when it crashes and shutting down cleanly on SIGINT or
//! SIGTERM.
//!
//! ```no_run
//! use respawn::{Daemon, Sink};
//!
//! fn main() -> Result<std::process::ExitCode, Box<dyn std::error::Error>> {
//!     let launch = Daemon::new()
//!         .pid_file("/tmp/hellod.pid")
//!         .max_restart(5)
//!         .stdout(Sink::stdout())
//!         .stderr(Sink::stderr())
//!         .start()?;
//!     if !launch.should_continue() {
//!         return Ok(launch.exit_code());
//!     }
//!     // Worker payload runs here.
//!     Ok(std::process::ExitCode::SUCCESS)
//! }
//! ```

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Two-phase daemon startup.
pub mod daemon;

/// Error handling.
pub mod error;

/// Detached re-execution of the current binary.
pub mod launcher;

/// Logs management.
pub mod logs;

/// Exclusive pid file guard.
pub mod pidfile;

/// Lifecycle reporting.
pub mod reporter;

/// Process role detection.
pub mod role;

/// Output destinations.
pub mod sink;

/// Worker supervision loop.
pub mod supervisor;

/// Process naming.
pub mod title;

#[doc(hidden)]
pub mod test_utils;

pub use config::{DaemonConfig, RestartPolicy, load_config};
pub use daemon::{Daemon, Launch};
pub use error::{ConfigError, DaemonError, LaunchError, PidFileError};
pub use pidfile::PidFile;
pub use reporter::{ExitOutcome, LifecycleEvent, Reporter};
pub use role::Role;
pub use sink::Sink;
pub use supervisor::{ExitReason, RestartBudget, ShutdownHandle, Supervisor};
