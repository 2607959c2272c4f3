use std::{
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use envconfig::Envconfig;

use crate::parse_duration;

/// A duration read from the environment in the `N[s|m|h]` grammar.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EnvDuration(pub Duration);

impl FromStr for EnvDuration {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        parse_duration(value)
            .map(EnvDuration)
            .ok_or_else(|| format!("invalid duration '{value}', expected N[s|m|h]"))
    }
}

/// A boolean toggle accepting 1/0, true/false, yes/no, on/off.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Toggle(pub bool);

impl FromStr for Toggle {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Toggle(true)),
            "0" | "false" | "no" | "off" => Ok(Toggle(false)),
            other => Err(format!("invalid boolean '{other}'")),
        }
    }
}

/// Process-wide settings read from the environment.
///
/// `LOG_LEVEL` and `LOG_FORMAT` are consumed directly by the logging
/// bootstrap and are deliberately absent here.
#[derive(Clone, Debug, Envconfig)]
pub struct Settings {
    /// File or directory holding the blockchains TOML document. A
    /// directory is resolved to `<dir>/config.toml`.
    #[envconfig(from = "BLOCKCHAIN_EXPORTER_CONFIG_PATH", default = "./config.toml")]
    pub config_path: PathBuf,

    /// Poll interval applied to chains that do not set their own.
    #[envconfig(from = "POLL_DEFAULT_INTERVAL", default = "5m")]
    pub poll_default_interval: EnvDuration,

    /// Ceiling for the per-chain failure backoff.
    #[envconfig(from = "MAX_FAILURE_BACKOFF_SECONDS", default = "900")]
    pub max_failure_backoff_seconds: u64,

    /// Per-request RPC timeout.
    #[envconfig(from = "RPC_REQUEST_TIMEOUT_SECONDS", default = "10.0")]
    pub rpc_request_timeout_seconds: f64,

    /// A chain whose last success is older than this is stale for
    /// readiness purposes.
    #[envconfig(from = "READINESS_STALE_THRESHOLD_SECONDS", default = "300")]
    pub readiness_stale_threshold_seconds: u64,

    /// Port of the health listener.
    #[envconfig(from = "HEALTH_PORT", default = "8080")]
    pub health_port: u16,

    /// Port of the metrics listener.
    #[envconfig(from = "METRICS_PORT", default = "9100")]
    pub metrics_port: u16,

    /// Wait for one poll attempt per chain before serving readiness.
    #[envconfig(from = "WARM_POLL_ENABLED", default = "false")]
    pub warm_poll_enabled: Toggle,

    /// Upper bound on the warm poll wait.
    #[envconfig(from = "WARM_POLL_TIMEOUT_SECONDS", default = "30.0")]
    pub warm_poll_timeout_seconds: f64,

    /// Grace period granted to in-flight polls at shutdown.
    #[envconfig(from = "SHUTDOWN_GRACE_SECONDS", default = "5.0")]
    pub shutdown_grace_seconds: f64,
}

impl Settings {
    /// Read every setting from the process environment, falling back to
    /// the documented defaults.
    pub fn from_env() -> crate::Result<Self> {
        Self::init_from_env().map_err(|error| crate::Error::Environment(error.to_string()))
    }

    /// Resolve the config path, turning a directory into
    /// `<dir>/config.toml`.
    pub fn resolve_config_path(&self) -> PathBuf {
        resolve_config_path(&self.config_path)
    }

    /// Fallback poll interval for chains without one.
    pub fn default_poll_interval(&self) -> Duration {
        self.poll_default_interval.0
    }

    /// Failure backoff ceiling as a [`Duration`].
    pub fn max_failure_backoff(&self) -> Duration {
        Duration::from_secs(self.max_failure_backoff_seconds)
    }

    /// RPC request timeout as a [`Duration`].
    pub fn rpc_request_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.rpc_request_timeout_seconds.max(0.0))
    }

    /// Readiness staleness threshold as a [`Duration`].
    pub fn readiness_stale_threshold(&self) -> Duration {
        Duration::from_secs(self.readiness_stale_threshold_seconds)
    }

    /// Warm poll timeout as a [`Duration`].
    pub fn warm_poll_timeout(&self) -> Duration {
        Duration::from_secs_f64(self.warm_poll_timeout_seconds.max(0.0))
    }

    /// Shutdown grace period as a [`Duration`].
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs_f64(self.shutdown_grace_seconds.max(0.0))
    }
}

fn resolve_config_path(configured: &Path) -> PathBuf {
    if configured.is_dir() {
        configured.join("config.toml")
    } else {
        configured.to_path_buf()
    }
}
