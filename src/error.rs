//! Error handling for respawn.
use std::{io, path::PathBuf};

use thiserror::Error;

/// Top-level error surfaced by [`crate::daemon::Daemon::start`].
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Re-executing the current binary failed.
    #[error(transparent)]
    Launch(#[from] LaunchError),

    /// Claiming or releasing the pid file failed.
    #[error(transparent)]
    PidFile(#[from] PidFileError),

    /// Loading the configuration failed.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Registering the termination signal handlers failed.
    #[error("Failed to install signal handlers: {0}")]
    Signals(#[source] io::Error),
}

/// Errors raised while building or spawning a detached copy of a program.
#[derive(Debug, Error)]
pub enum LaunchError {
    /// The absolute path of the running executable could not be determined.
    #[error("Failed to resolve current executable: {0}")]
    ExecutablePath(#[source] io::Error),

    /// Attaching an output sink to the child failed.
    #[error("Failed to attach output sink: {0}")]
    Sink(#[source] io::Error),

    /// The operating system refused to start the process.
    #[error("Failed to spawn '{program}': {source}")]
    Spawn {
        /// Program that was being started.
        program: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },
}

/// Error type for pid file operations.
#[derive(Debug, Error)]
pub enum PidFileError {
    /// The working directory was needed to absolutize a relative path.
    #[error("Failed to resolve pid file path '{path}': {source}")]
    Resolve {
        /// The configured path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Parent directories of the pid file could not be created.
    #[error("Failed to create pid file directory '{path}': {source}")]
    CreateDir {
        /// Directory that could not be created.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// The pid file could not be opened.
    #[error("Failed to open pid file '{path}': {source}")]
    Open {
        /// Pid file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Another process holds the exclusive lock.
    #[error("Another instance is already running (pid file '{path}' is locked)")]
    AlreadyRunning {
        /// Pid file path.
        path: PathBuf,
    },

    /// The lock attempt failed for a reason other than contention.
    #[error("Failed to lock pid file '{path}': {source}")]
    Lock {
        /// Pid file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Writing the process id failed.
    #[error("Could not write pid to '{path}': {source}")]
    Write {
        /// Pid file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Removing the pid file on release failed.
    #[error("Failed to remove pid file '{path}': {source}")]
    Remove {
        /// Pid file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Releasing the lock failed.
    #[error("Failed to unlock pid file '{path}': {source}")]
    Unlock {
        /// Pid file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },
}

impl PidFileError {
    /// Returns `true` when the failure means another instance owns the path.
    pub fn is_already_running(&self) -> bool {
        matches!(self, PidFileError::AlreadyRunning { .. })
    }
}

/// Errors raised while loading a configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file '{path}': {source}")]
    Read {
        /// Config file path.
        path: PathBuf,
        /// The underlying error that occurred.
        #[source]
        source: io::Error,
    },

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    Parse(#[from] serde_yaml::Error),

    /// A `${VAR}` reference named an unset variable.
    #[error("Missing environment variable: {0}")]
    MissingVar(String),

    /// A duration string did not match `<number>[ms|s|m|h]`.
    #[error("Invalid duration value: '{0}'")]
    InvalidDuration(String),
}
