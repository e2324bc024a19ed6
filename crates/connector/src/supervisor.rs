//! Lifecycle of the locally spawned ComfyUI process.
//!
//! [`ProcessSupervisor`] launches the server with the allocated port
//! appended to its command line, polls a [`ReadinessCheck`] until the
//! server can run jobs, and kills the process on [`stop`](ProcessSupervisor::stop).

use std::fmt;
use std::process::{ExitStatus, Stdio};
use std::str::FromStr;
use std::time::Duration;

use tokio::process::{Child, Command};

use crate::readiness::ReadinessCheck;

/// Default number of readiness checks before giving up.
pub const DEFAULT_MAX_START_ATTEMPTS: u32 = 10;

/// Default pause between readiness checks.
pub const DEFAULT_START_RETRY_INTERVAL: Duration = Duration::from_secs(1);

/// Default pause after the server reported ready, absorbing server-side warm-up.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);

/// Program and arguments used to launch the server, without `--port`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandLine {
    pub program: String,
    pub args: Vec<String>,
}

/// Timing of the startup readiness loop.
#[derive(Debug, Clone)]
pub struct StartupPolicy {
    pub max_attempts: u32,
    pub retry_interval: Duration,
    pub settle_delay: Duration,
}

impl Default for StartupPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_START_ATTEMPTS,
            retry_interval: DEFAULT_START_RETRY_INTERVAL,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

/// What [`ProcessSupervisor::start`] did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartOutcome {
    /// A new process was launched and reported ready.
    Launched { pid: Option<u32> },
    /// The tracked process was still alive; nothing was launched.
    AlreadyRunning,
}

/// Errors from launching or readying the server process.
#[derive(Debug, thiserror::Error)]
pub enum SupervisorError {
    #[error("command line is empty")]
    EmptyCommand,

    #[error("failed to launch `{command}`: {source}")]
    Launch {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("server not ready after {attempts} attempts")]
    StartupTimeout { attempts: u32 },

    #[error("server exited during startup ({status})")]
    ExitedDuringStartup { status: ExitStatus },
}

/// Owns the child server process.
#[derive(Debug, Default)]
pub struct ProcessSupervisor {
    policy: StartupPolicy,
    child: Option<Child>,
}

impl CommandLine {
    /// Arguments for a launch on `port`.
    fn args_with_port(&self, port: u16) -> Vec<String> {
        let mut args = self.args.clone();
        args.push("--port".to_string());
        args.push(port.to_string());
        args
    }
}

impl FromStr for CommandLine {
    type Err = SupervisorError;

    /// Split on whitespace, e.g. `python3 ComfyUI/main.py --listen`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut parts = s.split_whitespace().map(str::to_string);
        let program = parts.next().ok_or(SupervisorError::EmptyCommand)?;
        Ok(Self {
            program,
            args: parts.collect(),
        })
    }
}

impl fmt::Display for CommandLine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {arg}")?;
        }
        Ok(())
    }
}

impl ProcessSupervisor {
    pub fn new(policy: StartupPolicy) -> Self {
        Self {
            policy,
            child: None,
        }
    }

    /// OS process ID of the tracked child, if any.
    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }

    /// Whether a tracked child exists and has not exited.
    pub fn is_running(&mut self) -> bool {
        let Some(child) = self.child.as_mut() else {
            return false;
        };
        match child.try_wait() {
            Ok(None) => true,
            Ok(Some(status)) => {
                tracing::warn!(%status, "ComfyUI process has exited");
                false
            }
            Err(e) => {
                tracing::warn!(error = %e, "Failed to poll ComfyUI process");
                false
            }
        }
    }

    /// Launch the server on `port` unless the tracked process is alive.
    ///
    /// After launching, polls `probe` up to `max_attempts` times. If the
    /// server never becomes ready, or exits in the meantime, the process
    /// is killed and an error returned.
    pub async fn start(
        &mut self,
        command: &CommandLine,
        port: u16,
        probe: &mut dyn ReadinessCheck,
    ) -> Result<StartOutcome, SupervisorError> {
        if self.is_running() {
            tracing::debug!(pid = self.pid(), "ComfyUI process already running");
            return Ok(StartOutcome::AlreadyRunning);
        }

        let child = Command::new(&command.program)
            .args(command.args_with_port(port))
            .stdin(Stdio::null())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| SupervisorError::Launch {
                command: command.to_string(),
                source,
            })?;
        let pid = child.id();
        tracing::info!(pid, port, command = %command, "ComfyUI process started");
        self.child = Some(child);

        match self.wait_until_ready(probe).await {
            Ok(attempts) => {
                tracing::info!(pid, port, attempts, "ComfyUI startup finalized");
                tokio::time::sleep(self.policy.settle_delay).await;
                Ok(StartOutcome::Launched { pid })
            }
            Err(e) => {
                tracing::error!(pid, port, error = %e, "ComfyUI startup failed");
                self.stop().await;
                Err(e)
            }
        }
    }

    /// Kill the tracked process, if any. Never fails; problems are logged.
    pub async fn stop(&mut self) {
        let Some(mut child) = self.child.take() else {
            return;
        };
        let pid = child.id();

        match child.try_wait() {
            Ok(Some(status)) => {
                tracing::debug!(pid, %status, "ComfyUI process already exited");
            }
            _ => match child.kill().await {
                Ok(()) => tracing::info!(pid, "ComfyUI process killed"),
                Err(e) => tracing::warn!(pid, error = %e, "Failed to kill ComfyUI process"),
            },
        }
    }

    /// Poll `probe` until it passes. Returns the number of attempts used.
    async fn wait_until_ready(&mut self, probe: &mut dyn ReadinessCheck) -> Result<u32, SupervisorError> {
        let max_attempts = self.policy.max_attempts;

        for attempt in 1..=max_attempts {
            if let Some(status) = self.exit_status() {
                return Err(SupervisorError::ExitedDuringStartup { status });
            }

            tracing::debug!(attempt, max_attempts, "Checking ComfyUI readiness");
            if probe.is_ready().await {
                return Ok(attempt);
            }

            if attempt < max_attempts {
                tokio::time::sleep(self.policy.retry_interval).await;
            }
        }

        Err(SupervisorError::StartupTimeout {
            attempts: max_attempts,
        })
    }

    fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child.as_mut().and_then(|child| child.try_wait().ok().flatten())
    }
}
