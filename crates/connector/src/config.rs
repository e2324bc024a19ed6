use std::num::{NonZeroU16, NonZeroU32};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use crate::port::DEFAULT_PORT_SCAN_LIMIT;
use crate::reconnect::ReconnectConfig;
use crate::supervisor::{
    CommandLine, StartupPolicy, DEFAULT_MAX_START_ATTEMPTS, DEFAULT_SETTLE_DELAY,
    DEFAULT_START_RETRY_INTERVAL,
};

/// Default application name, used as the identity token prefix.
pub const DEFAULT_APP_NAME: &str = "comfy-connector";

/// Default host the local server is reached on.
pub const DEFAULT_API_HOST: &str = "127.0.0.1";

/// First port tried by port allocation.
pub const DEFAULT_INITIAL_PORT: u16 = 8188;

/// Default bound on one synthetic readiness job.
pub const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(120);

/// Errors from loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{var}={value:?} is invalid: {reason}")]
    Invalid {
        var: &'static str,
        value: String,
        reason: String,
    },
}

/// Connector configuration.
#[derive(Debug, Clone)]
pub struct ConnectorConfig {
    /// Prefix of the per-run identity token.
    pub app_name: String,
    /// Server launch command, without `--port`.
    pub command_line: CommandLine,
    /// Host the server is reached on (default: `127.0.0.1`).
    pub api_host: String,
    /// First port tried (default: `8188`).
    pub initial_port: u16,
    /// Graph run by the readiness probe.
    pub test_payload: PathBuf,
    /// Readiness checks before startup fails (default: `10`).
    pub max_start_attempts: u32,
    /// Pause between readiness checks (default: 1s).
    pub start_retry_interval: Duration,
    /// Pause after readiness before returning (default: 500ms).
    pub settle_delay: Duration,
    /// Ports probed before allocation fails (default: `100`).
    pub port_scan_limit: u16,
    /// Bound on waiting for one job. `None` waits indefinitely.
    pub job_timeout: Option<Duration>,
    /// Bound on one synthetic readiness job (default: 120s).
    pub probe_timeout: Duration,
    /// Backoff for reopening the event stream.
    pub reconnect: ReconnectConfig,
}

impl ConnectorConfig {
    /// Configuration with every optional value at its default.
    pub fn new(app_name: impl Into<String>, command_line: CommandLine, test_payload: impl Into<PathBuf>) -> Self {
        Self {
            app_name: app_name.into(),
            command_line,
            api_host: DEFAULT_API_HOST.to_string(),
            initial_port: DEFAULT_INITIAL_PORT,
            test_payload: test_payload.into(),
            max_start_attempts: DEFAULT_MAX_START_ATTEMPTS,
            start_retry_interval: DEFAULT_START_RETRY_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
            port_scan_limit: DEFAULT_PORT_SCAN_LIMIT,
            job_timeout: None,
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            reconnect: ReconnectConfig::default(),
        }
    }

    /// Load configuration from environment variables.
    ///
    /// | Env Var                         | Default            |
    /// |---------------------------------|--------------------|
    /// | `APP_NAME`                      | `comfy-connector`  |
    /// | `API_COMMAND_LINE`              | required           |
    /// | `API_URL`                       | `127.0.0.1`        |
    /// | `INITIAL_PORT`                  | `8188`             |
    /// | `TEST_PAYLOAD`                  | required           |
    /// | `MAX_COMFY_START_ATTEMPTS`      | `10`               |
    /// | `COMFY_START_RETRY_INTERVAL_MS` | `1000`             |
    /// | `COMFY_SETTLE_DELAY_MS`         | `500`              |
    /// | `PORT_SCAN_LIMIT`               | `100`              |
    /// | `COMFY_JOB_TIMEOUT_SECS`        | unset (no timeout) |
    /// | `COMFY_PROBE_TIMEOUT_SECS`      | `120`              |
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    /// Load configuration through an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let env = Env { lookup };

        let command = env.required("API_COMMAND_LINE")?;
        let command_line = command
            .parse::<CommandLine>()
            .map_err(|e| ConfigError::Invalid {
                var: "API_COMMAND_LINE",
                value: command.clone(),
                reason: e.to_string(),
            })?;
        let test_payload = env.required("TEST_PAYLOAD")?;
        let app_name = env.get("APP_NAME").unwrap_or_else(|| DEFAULT_APP_NAME.to_string());

        let mut config = Self::new(app_name, command_line, test_payload);

        if let Some(host) = env.get("API_URL") {
            config.api_host = host;
        }
        if let Some(port) = env.parse("INITIAL_PORT")? {
            config.initial_port = port;
        }
        // Zero attempts would fail startup without a single probe.
        if let Some(attempts) = env.parse::<NonZeroU32>("MAX_COMFY_START_ATTEMPTS")? {
            config.max_start_attempts = attempts.get();
        }
        if let Some(ms) = env.parse("COMFY_START_RETRY_INTERVAL_MS")? {
            config.start_retry_interval = Duration::from_millis(ms);
        }
        if let Some(ms) = env.parse("COMFY_SETTLE_DELAY_MS")? {
            config.settle_delay = Duration::from_millis(ms);
        }
        if let Some(limit) = env.parse::<NonZeroU16>("PORT_SCAN_LIMIT")? {
            config.port_scan_limit = limit.get();
        }
        config.job_timeout = env.parse("COMFY_JOB_TIMEOUT_SECS")?.map(Duration::from_secs);
        if let Some(secs) = env.parse("COMFY_PROBE_TIMEOUT_SECS")? {
            config.probe_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Readiness loop timing derived from this configuration.
    pub fn startup_policy(&self) -> StartupPolicy {
        StartupPolicy {
            max_attempts: self.max_start_attempts,
            retry_interval: self.start_retry_interval,
            settle_delay: self.settle_delay,
        }
    }
}

// ---- private helpers ----

struct Env<F> {
    lookup: F,
}

impl<F: Fn(&str) -> Option<String>> Env<F> {
    /// Value of `var`, treating blank values as unset.
    fn get(&self, var: &str) -> Option<String> {
        (self.lookup)(var)
            .map(|v| v.trim().to_string())
            .filter(|v| !v.is_empty())
    }

    fn required(&self, var: &'static str) -> Result<String, ConfigError> {
        self.get(var).ok_or(ConfigError::Missing(var))
    }

    fn parse<T>(&self, var: &'static str) -> Result<Option<T>, ConfigError>
    where
        T: FromStr,
        T::Err: std::fmt::Display,
    {
        self.get(var)
            .map(|value| {
                value.parse::<T>().map_err(|e| ConfigError::Invalid {
                    var,
                    reason: e.to_string(),
                    value,
                })
            })
            .transpose()
    }
}
