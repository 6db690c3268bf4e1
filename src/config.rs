//! Configuration management for respawn.
use regex::{Captures, Regex};
use serde::Deserialize;
use std::{
    env, fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::error::ConfigError;

/// How often the supervisor polls its worker when no event arrives.
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(200);

static ENV_REFERENCE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("env reference pattern is valid")
});

/// Which worker exits lead to a restart.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize, EnumString, AsRefStr, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum RestartPolicy {
    /// Restart after every exit, successful or not.
    #[default]
    #[strum(to_string = "always")]
    Always,
    /// Restart after failures; a clean exit ends supervision.
    #[serde(alias = "on-failure")]
    #[strum(to_string = "on_failure", serialize = "on-failure")]
    OnFailure,
}

/// Represents the structure of the configuration file.
#[derive(Debug, Clone, Default, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct DaemonConfig {
    /// Pid file guarding single-instance execution; no guard when absent.
    pub pid_file: Option<PathBuf>,
    /// Number of restarts permitted, 0 for unlimited.
    pub max_restart: u32,
    /// Which exits trigger a restart.
    pub restart_policy: RestartPolicy,
    /// Pause before each restart (e.g. "500ms", "5s").
    pub restart_delay: Option<String>,
    /// Name shown by process listing tools.
    pub process_title: Option<String>,
    /// Whether the pid file also records the current worker pid.
    pub record_worker_pid: bool,
    /// Fallback polling period for worker exit detection.
    pub poll_interval: Option<String>,
}

impl DaemonConfig {
    /// Resolved restart delay; zero when unset.
    pub fn restart_delay(&self) -> Result<Duration, ConfigError> {
        self.restart_delay
            .as_deref()
            .map(parse_duration)
            .transpose()
            .map(Option::unwrap_or_default)
    }

    /// Resolved poll interval; [`DEFAULT_POLL_INTERVAL`] when unset.
    pub fn poll_interval(&self) -> Result<Duration, ConfigError> {
        Ok(self
            .poll_interval
            .as_deref()
            .map(parse_duration)
            .transpose()?
            .unwrap_or(DEFAULT_POLL_INTERVAL))
    }
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
///
/// A bare number is read as seconds.
pub fn parse_duration(raw: &str) -> Result<Duration, ConfigError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(ConfigError::InvalidDuration(raw.to_string()));
    }

    let invalid = || ConfigError::InvalidDuration(raw.to_string());

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

/// Expands `$VAR` and `${VAR}` references from the process environment.
fn expand_env_vars(input: &str) -> Result<String, ConfigError> {
    let mut missing: Option<String> = None;
    let result = ENV_REFERENCE.replace_all(input, |caps: &Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(name) => Err(ConfigError::MissingVar(name)),
        None => Ok(result.into_owned()),
    }
}

/// Loads and parses the configuration file, expanding environment variables.
///
/// A relative `pid_file` is resolved against the directory holding the config.
pub fn load_config(config_path: &Path) -> Result<DaemonConfig, ConfigError> {
    let content = fs::read_to_string(config_path).map_err(|source| ConfigError::Read {
        path: config_path.to_path_buf(),
        source,
    })?;

    let expanded_content = expand_env_vars(&content)?;
    let mut config: DaemonConfig = serde_yaml::from_str(&expanded_content)?;

    config.restart_delay()?;
    config.poll_interval()?;

    let base_path = config_path.parent().unwrap_or_else(|| Path::new("."));
    if let Some(pid_file) = config.pid_file.take() {
        config.pid_file = Some(if pid_file.is_absolute() {
            pid_file
        } else {
            base_path.join(pid_file)
        });
    }

    Ok(config)
}
