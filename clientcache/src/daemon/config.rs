//! Process-level daemon configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::TimeDelta;

use crate::{Error, Result};

/// Base interval of the data refresh loop.
pub const DEFAULT_REFRESH_INTERVAL: TimeDelta = TimeDelta::minutes(5);

/// Base interval of the support recheck loop.
pub const DEFAULT_RECHECK_SUPPORT_INTERVAL: TimeDelta = TimeDelta::hours(1);

/// Symmetric jitter applied to both loops.
pub const DEFAULT_RANDOMIZATION_FACTOR: f64 = 0.2;

/// How long shutdown waits for in-flight passes.
pub const DEFAULT_SHUTDOWN_GRACE: Duration = Duration::from_secs(10);

const DEFAULT_DOT_DIR_NAME: &str = ".clientcache";
const SOCKET_FILE_NAME: &str = "socket";
const LOG_DIR_NAME: &str = "logs";

/// Daemon configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct DaemonConfig {
    /// Base directory holding the database, socket and logs.
    pub dot_dir: PathBuf,
    pub refresh_interval: TimeDelta,
    pub recheck_support_interval: TimeDelta,
    pub randomization_factor: f64,
    /// Log every statement the store executes.
    pub store_debug: bool,
    pub shutdown_grace: Duration,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            dot_dir: PathBuf::from(DEFAULT_DOT_DIR_NAME),
            refresh_interval: DEFAULT_REFRESH_INTERVAL,
            recheck_support_interval: DEFAULT_RECHECK_SUPPORT_INTERVAL,
            randomization_factor: DEFAULT_RANDOMIZATION_FACTOR,
            store_debug: false,
            shutdown_grace: DEFAULT_SHUTDOWN_GRACE,
        }
    }
}

impl DaemonConfig {
    /// Defaults rooted at `dot_dir`.
    pub fn with_dot_dir(dot_dir: impl Into<PathBuf>) -> Self {
        Self {
            dot_dir: dot_dir.into(),
            ..Self::default()
        }
    }

    /// Load from the process environment.
    ///
    /// Supported env vars:
    /// - `CLIENTCACHE_DOT_DIR` (default `$HOME/.clientcache`)
    /// - `CLIENTCACHE_REFRESH_INTERVAL_SECS`
    /// - `CLIENTCACHE_RECHECK_SUPPORT_INTERVAL_SECS`
    /// - `CLIENTCACHE_RANDOMIZATION_FACTOR`
    /// - `CLIENTCACHE_STORE_DEBUG`
    /// - `CLIENTCACHE_SHUTDOWN_GRACE_SECS`
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an arbitrary key lookup. Blank values are ignored.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let mut config = Self::default();

        if let Some(dir) = get("CLIENTCACHE_DOT_DIR") {
            config.dot_dir = PathBuf::from(dir);
        } else if let Some(home) = get("HOME") {
            config.dot_dir = Path::new(&home).join(DEFAULT_DOT_DIR_NAME);
        }

        if let Some(secs) = get("CLIENTCACHE_REFRESH_INTERVAL_SECS") {
            config.refresh_interval =
                TimeDelta::seconds(parse::<i64>("CLIENTCACHE_REFRESH_INTERVAL_SECS", &secs)?);
        }

        if let Some(secs) = get("CLIENTCACHE_RECHECK_SUPPORT_INTERVAL_SECS") {
            config.recheck_support_interval = TimeDelta::seconds(parse::<i64>(
                "CLIENTCACHE_RECHECK_SUPPORT_INTERVAL_SECS",
                &secs,
            )?);
        }

        if let Some(factor) = get("CLIENTCACHE_RANDOMIZATION_FACTOR") {
            config.randomization_factor = parse::<f64>("CLIENTCACHE_RANDOMIZATION_FACTOR", &factor)?;
        }

        if let Some(debug) = get("CLIENTCACHE_STORE_DEBUG") {
            config.store_debug = parse_bool("CLIENTCACHE_STORE_DEBUG", &debug)?;
        }

        if let Some(secs) = get("CLIENTCACHE_SHUTDOWN_GRACE_SECS") {
            config.shutdown_grace =
                Duration::from_secs(parse::<u64>("CLIENTCACHE_SHUTDOWN_GRACE_SECS", &secs)?);
        }

        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.refresh_interval <= TimeDelta::zero() {
            return Err(Error::validation("refresh interval must be positive"));
        }
        if self.recheck_support_interval <= TimeDelta::zero() {
            return Err(Error::validation("recheck support interval must be positive"));
        }
        if self.randomization_factor.is_nan() || self.randomization_factor < 0.0 {
            return Err(Error::validation(
                "interval randomization factor must be non negative",
            ));
        }
        if self.randomization_factor.is_infinite() {
            return Err(Error::validation(
                "interval randomization factor must be finite",
            ));
        }
        if self.dot_dir.as_os_str().is_empty() {
            return Err(Error::validation("dot directory is empty"));
        }
        Ok(())
    }

    /// Path of the local query socket.
    pub fn socket_path(&self) -> PathBuf {
        self.dot_dir.join(SOCKET_FILE_NAME)
    }

    pub fn log_dir(&self) -> PathBuf {
        self.dot_dir.join(LOG_DIR_NAME)
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T>
where
    T::Err: std::fmt::Display,
{
    value
        .parse::<T>()
        .map_err(|e| Error::validation(format!("{key}: invalid value '{value}': {e}")))
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        _ => Err(Error::validation(format!(
            "{key}: invalid boolean '{value}'"
        ))),
    }
}
