//! Connector for a locally spawned ComfyUI server.
//!
//! Launches the server on a free port, waits until it can run a job end
//! to end, submits job graphs, waits for their completion on the event
//! stream and downloads the produced artifacts. Also provides structural
//! editing of job graphs (output-node lookup, field replacement).

pub mod api;
pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod graph;
pub mod job;
pub mod messages;
pub mod port;
pub mod processor;
pub mod readiness;
pub mod reconnect;
pub mod supervisor;

pub use config::ConnectorConfig;
pub use connector::ComfyConnector;
pub use error::ConnectorError;
pub use graph::{GraphValue, JobGraph, Node};
pub use job::Artifact;
