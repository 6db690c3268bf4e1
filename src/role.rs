//! Classifies the running process as launcher, daemon, or worker.
use std::{env, ffi::OsStr, fmt};

/// Environment variable carrying the [`Role`] across re-exec boundaries.
pub const ROLE_ENV_KEY: &str = "RESPAWN_PROCESS_ROLE";

const MARKER_INIT: i64 = 1;
const MARKER_DAEMON: i64 = 2;
const MARKER_WORKER: i64 = 3;

/// The part a process instance plays in the launch handshake.
///
/// A role is decided once at process entry and never changes afterwards.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Role {
    /// Started by a user or init system; has not detached yet.
    Uninitialized,
    /// Detached background process that owns the pid file and supervises.
    Daemon,
    /// Supervised child running the payload.
    Worker,
}

impl Role {
    /// Reads the role marker from the current process environment.
    pub fn detect() -> Self {
        Self::from_marker(env::var_os(ROLE_ENV_KEY).as_deref())
    }

    /// Classifies a raw marker value.
    ///
    /// Absent or non-numeric markers degrade to [`Role::Uninitialized`];
    /// numeric markers other than the launcher and daemon values are workers.
    pub fn from_marker(marker: Option<&OsStr>) -> Self {
        let Some(value) = marker.and_then(OsStr::to_str) else {
            return Role::Uninitialized;
        };

        match value.trim().parse::<i64>() {
            Err(_) => Role::Uninitialized,
            Ok(0) | Ok(MARKER_INIT) => Role::Uninitialized,
            Ok(MARKER_DAEMON) => Role::Daemon,
            Ok(_) => Role::Worker,
        }
    }

    /// Marker value a parent sets so that its child classifies as `self`.
    pub fn marker(self) -> String {
        let value = match self {
            Role::Uninitialized => MARKER_INIT,
            Role::Daemon => MARKER_DAEMON,
            Role::Worker => MARKER_WORKER,
        };
        value.to_string()
    }

    /// String representation used in log lines.
    pub fn as_str(self) -> &'static str {
        match self {
            Role::Uninitialized => "launcher",
            Role::Daemon => "daemon",
            Role::Worker => "worker",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
