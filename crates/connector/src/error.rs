use crate::config::ConfigError;
use crate::graph::GraphError;
use crate::job::JobError;
use crate::port::PortError;
use crate::supervisor::SupervisorError;

/// Top-level connector error. Each message names the failing phase.
#[derive(Debug, thiserror::Error)]
pub enum ConnectorError {
    #[error("configuration: {0}")]
    Config(#[from] ConfigError),

    /// The readiness test graph could not be loaded.
    #[error("graph: cannot load test payload: {0}")]
    TestGraph(#[source] GraphError),

    #[error("port allocation: {0}")]
    PortAllocation(#[from] PortError),

    #[error("startup: {0}")]
    Startup(#[from] SupervisorError),

    /// Submission, synchronization, collection or upload failure. The
    /// inner message already names the phase.
    #[error(transparent)]
    Job(#[from] JobError),

    #[error("startup: no server instance after start")]
    NotStarted,
}

impl ConnectorError {
    /// Whether this error happened while bringing the server up.
    pub fn is_startup_failure(&self) -> bool {
        matches!(self, Self::PortAllocation(_) | Self::Startup(_) | Self::NotStarted)
    }
}
