//! The connector facade.
//!
//! [`ComfyConnector`] is the single entry point a worker holds: it
//! allocates a port, launches and readies the local ComfyUI server, and
//! forwards jobs to it. Every server instance gets a fresh identity
//! token, so events from a previous run can never be mistaken for ours.
//!
//! ```text
//! start ──► find_available_port ──► ProcessSupervisor::start
//!                                      └─ SyntheticJobProbe (JobClient + test graph)
//! submit_and_collect ──► JobClient ──► /prompt, /ws, /history, /view
//! ```

use std::path::Path;

use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, UploadResponse};
use crate::client::ComfyUIClient;
use crate::config::ConnectorConfig;
use crate::error::ConnectorError;
use crate::graph::{self, JobGraph};
use crate::job::{Artifact, JobClient};
use crate::port;
use crate::readiness::SyntheticJobProbe;
use crate::supervisor::{ProcessSupervisor, StartOutcome};

/// Connection state of one launched server.
struct ServerInstance {
    port: u16,
    jobs: JobClient,
}

/// Owns the local ComfyUI server and the connection to it.
pub struct ComfyConnector {
    config: ConnectorConfig,
    http: reqwest::Client,
    test_graph: JobGraph,
    supervisor: ProcessSupervisor,
    instance: Option<ServerInstance>,
}

impl ComfyConnector {
    /// Create a connector, loading the readiness test graph from
    /// `config.test_payload`. Nothing is launched yet.
    pub async fn new(config: ConnectorConfig) -> Result<Self, ConnectorError> {
        let test_graph = graph::load_graph(&config.test_payload)
            .await
            .map_err(ConnectorError::TestGraph)?;
        Self::with_test_graph(config, test_graph)
    }

    /// Create a connector with an already loaded test graph.
    ///
    /// The test graph must contain an output node, otherwise the server
    /// could never be declared ready.
    pub fn with_test_graph(config: ConnectorConfig, test_graph: JobGraph) -> Result<Self, ConnectorError> {
        graph::require_output_node(&test_graph).map_err(ConnectorError::TestGraph)?;

        Ok(Self {
            supervisor: ProcessSupervisor::new(config.startup_policy()),
            config,
            http: reqwest::Client::new(),
            test_graph,
            instance: None,
        })
    }

    /// Make sure a ready server is running.
    ///
    /// Idempotent: while the launched process is alive this returns
    /// immediately. On failure everything is torn down again.
    pub async fn start(&mut self) -> Result<(), ConnectorError> {
        if self.instance.is_some() && self.supervisor.is_running() {
            tracing::debug!(port = self.port(), "ComfyUI already running");
            return Ok(());
        }
        if self.instance.is_some() {
            tracing::warn!(port = self.port(), "ComfyUI process is gone, relaunching");
            self.stop().await;
        }

        match self.launch().await {
            Ok(()) => Ok(()),
            Err(e) => {
                self.stop().await;
                Err(e)
            }
        }
    }

    /// Kill the server and drop all connection state.
    ///
    /// Safe to call at any time, including before [`start`](Self::start).
    /// Failures are logged, never returned.
    pub async fn stop(&mut self) {
        self.supervisor.stop().await;

        if let Some(mut instance) = self.instance.take() {
            if let Err(e) = instance.jobs.disconnect().await {
                tracing::warn!(port = instance.port, error = %e, "Failed to close event stream");
            }
            tracing::info!(port = instance.port, client_id = instance.jobs.client_id(), "ComfyUI instance torn down");
        }
    }

    /// Run a graph on the server, starting it first if needed, and
    /// return the produced artifacts.
    pub async fn submit_and_collect(&mut self, graph: &JobGraph) -> Result<Vec<Artifact>, ConnectorError> {
        let jobs = self.jobs().await?;
        Ok(jobs.submit_and_collect(graph).await?)
    }

    /// Upload a local image for graphs to reference, starting the server
    /// first if needed.
    pub async fn upload_image(
        &mut self,
        path: impl AsRef<Path>,
        subfolder: Option<&str>,
        folder_type: Option<&str>,
        overwrite: bool,
    ) -> Result<UploadResponse, ConnectorError> {
        let jobs = self.jobs().await?;
        Ok(jobs.upload_artifact(path, subfolder, folder_type, overwrite).await?)
    }

    pub fn config(&self) -> &ConnectorConfig {
        &self.config
    }

    /// Port of the running instance.
    pub fn port(&self) -> Option<u16> {
        self.instance.as_ref().map(|instance| instance.port)
    }

    /// `http://host:port` of the running instance.
    pub fn api_url(&self) -> Option<&str> {
        self.instance.as_ref().map(|instance| instance.jobs.api().api_url())
    }

    /// Identity token of the running instance.
    pub fn client_id(&self) -> Option<&str> {
        self.instance.as_ref().map(|instance| instance.jobs.client_id())
    }

    /// OS process ID of the server.
    pub fn pid(&self) -> Option<u32> {
        self.supervisor.pid()
    }

    /// Token that aborts the running instance's next or current wait.
    ///
    /// Once a cancellation has been handled the instance switches to a
    /// fresh token, so later jobs block normally again; fetch the token
    /// anew for each job that should be cancellable.
    pub fn cancellation_token(&self) -> Option<CancellationToken> {
        self.instance.as_ref().map(|instance| instance.jobs.cancellation_token())
    }

    // ---- private helpers ----

    /// Job client of a ready instance, starting the server if needed.
    async fn jobs(&mut self) -> Result<&mut JobClient, ConnectorError> {
        self.start().await?;
        self.instance
            .as_mut()
            .map(|instance| &mut instance.jobs)
            .ok_or(ConnectorError::NotStarted)
    }

    async fn launch(&mut self) -> Result<(), ConnectorError> {
        let port = port::find_available_port(
            &self.http,
            &self.config.api_host,
            self.config.initial_port,
            self.config.port_scan_limit,
        )
        .await?;

        let mut instance = self.connect(port);
        let outcome = {
            let mut probe = SyntheticJobProbe::new(&mut instance.jobs, &self.test_graph)
                .with_timeout(self.config.probe_timeout);
            self.supervisor
                .start(&self.config.command_line, port, &mut probe)
                .await?
        };

        if let StartOutcome::Launched { pid } = outcome {
            tracing::info!(
                port,
                pid,
                client_id = instance.jobs.client_id(),
                api_url = instance.jobs.api().api_url(),
                "ComfyUI ready",
            );
        }
        self.instance = Some(instance);
        Ok(())
    }

    /// Connection state for a server on `port` with a fresh identity token.
    fn connect(&self, port: u16) -> ServerInstance {
        let host = &self.config.api_host;
        let client_id = format!("{}-{}", self.config.app_name, uuid::Uuid::new_v4());

        let api = ComfyUIApi::with_client(self.http.clone(), format!("http://{host}:{port}"));
        let events = ComfyUIClient::new(format!("ws://{host}:{port}"), client_id);
        let jobs = JobClient::new(api, events)
            .with_reconnect(self.config.reconnect.clone())
            .with_job_timeout(self.config.job_timeout);

        ServerInstance { port, jobs }
    }
}
