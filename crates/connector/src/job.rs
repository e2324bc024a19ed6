//! Job submission, completion tracking and artifact retrieval.
//!
//! [`JobClient`] owns the REST client and the single event-stream
//! connection of a connector. One job is in flight at a time: callers
//! submit the next graph only after the previous one's artifacts have
//! been collected.

use std::path::Path;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::api::{ComfyUIApi, ComfyUIApiError, UploadResponse};
use crate::client::{ComfyUIClient, ComfyUIClientError, ComfyUIConnection};
use crate::graph::{self, GraphError, JobGraph};
use crate::messages::ErrorData;
use crate::processor::{self, Completion, ConnectionLost};
use crate::reconnect::{reconnect_loop, ReconnectConfig, ReconnectError};

/// One output file produced by a completed job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    pub filename: String,
    pub subfolder: String,
    /// Folder type the file lives in (`output`, `temp`, ...).
    pub folder_type: String,
    pub bytes: Vec<u8>,
}

/// Errors from job submission, synchronization, collection and upload.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// The graph cannot be submitted as-is.
    #[error("invalid job graph: {0}")]
    Graph(#[from] GraphError),

    /// `POST /prompt` failed or returned an unusable body.
    #[error("job submission failed: {0}")]
    SubmissionFailed(#[source] ComfyUIApiError),

    /// No event-stream connection could be opened.
    #[error("synchronization failed: event stream unavailable: {0}")]
    EventStream(#[from] ReconnectError),

    /// The event stream dropped while waiting. The next operation
    /// reconnects.
    #[error("synchronization failed for job {prompt_id}: {source}")]
    ConnectionLost {
        prompt_id: String,
        #[source]
        source: ConnectionLost,
    },

    /// ComfyUI ran the job and reported an error.
    #[error("execution failed for job {prompt_id}: {message}")]
    ExecutionFailed {
        prompt_id: String,
        /// Node that raised, when the server said which.
        node_id: Option<String>,
        message: String,
    },

    /// The wait was cancelled through the client's token.
    #[error("synchronization cancelled for job {prompt_id}")]
    Cancelled { prompt_id: String },

    /// The job did not complete within the configured timeout.
    #[error("synchronization timed out for job {prompt_id} after {timeout:?}")]
    TimedOut { prompt_id: String, timeout: Duration },

    /// History or output download failed.
    #[error("artifact collection failed for job {prompt_id}: {source}")]
    CollectionFailed {
        prompt_id: String,
        #[source]
        source: ComfyUIApiError,
    },

    /// The server has no history record for a completed job.
    #[error("artifact collection failed: no history record for job {prompt_id}")]
    MissingHistory { prompt_id: String },

    /// The local file to upload could not be read.
    #[error("upload failed: cannot read {path}: {source}")]
    UploadUnreadable {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// The server rejected the upload.
    #[error("upload failed for {path}: {source}")]
    UploadFailed {
        path: String,
        #[source]
        source: ComfyUIApiError,
    },
}

/// Result of racing the completion loop against cancellation and timeout.
enum WaitOutcome {
    Done(Result<Completion, ConnectionLost>),
    Cancelled,
    TimedOut(Duration),
}

/// Submits graphs to one ComfyUI instance and waits for their results.
pub struct JobClient {
    api: ComfyUIApi,
    events: ComfyUIClient,
    connection: Option<ComfyUIConnection>,
    reconnect: ReconnectConfig,
    cancel: CancellationToken,
    job_timeout: Option<Duration>,
}

impl JobClient {
    /// Create a client. No connection is opened until needed.
    pub fn new(api: ComfyUIApi, events: ComfyUIClient) -> Self {
        Self {
            api,
            events,
            connection: None,
            reconnect: ReconnectConfig::default(),
            cancel: CancellationToken::new(),
            job_timeout: None,
        }
    }

    /// Backoff policy used when the event stream has to be reopened.
    pub fn with_reconnect(mut self, config: ReconnectConfig) -> Self {
        self.reconnect = config;
        self
    }

    /// Token that aborts a blocked [`wait_for_completion`](Self::wait_for_completion).
    ///
    /// A token that has fired is used for one wait only; the client then
    /// switches to a fresh one, see [`cancellation_token`](Self::cancellation_token).
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Upper bound on a single wait. `None` waits indefinitely.
    pub fn with_job_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.job_timeout = timeout;
        self
    }

    pub fn job_timeout(&self) -> Option<Duration> {
        self.job_timeout
    }

    /// Token that aborts the next or current wait.
    ///
    /// Replaced once a cancellation has been handled, so fetch it again
    /// for every job that should be cancellable.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn api(&self) -> &ComfyUIApi {
        &self.api
    }

    /// Identity token sent with every submission and connection.
    pub fn client_id(&self) -> &str {
        self.events.client_id()
    }

    /// Whether an event-stream connection is currently held.
    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    /// Drop any existing event-stream connection and open a new one.
    ///
    /// Makes a single attempt, without backoff.
    pub async fn reconnect(&mut self) -> Result<(), ComfyUIClientError> {
        self.connection = None;
        self.connection = Some(self.events.connect().await?);
        Ok(())
    }

    /// Close the event stream, if open.
    pub async fn disconnect(&mut self) -> Result<(), ComfyUIClientError> {
        match self.connection.take() {
            Some(conn) => conn.close().await,
            None => Ok(()),
        }
    }

    /// Submit a graph. Returns the server-assigned prompt ID.
    pub async fn submit(&self, graph: &JobGraph) -> Result<String, JobError> {
        let response = self
            .api
            .submit_workflow(graph, self.client_id())
            .await
            .map_err(JobError::SubmissionFailed)?;

        tracing::info!(
            prompt_id = %response.prompt_id,
            queue_position = response.number,
            "Workflow submitted to ComfyUI",
        );

        Ok(response.prompt_id)
    }

    /// Block until ComfyUI reports that `prompt_id` has finished.
    ///
    /// Opens the event stream first if it is not connected. Returns
    /// early on cancellation or when the configured timeout elapses; in
    /// both cases the job is also deleted from the server queue on a
    /// best-effort basis. A job the server reports as failed is
    /// [`JobError::ExecutionFailed`].
    pub async fn wait_for_completion(&mut self, prompt_id: &str) -> Result<(), JobError> {
        self.wait_within(prompt_id, self.job_timeout).await
    }

    /// [`wait_for_completion`](Self::wait_for_completion) with an explicit
    /// bound instead of the configured job timeout.
    pub async fn wait_within(&mut self, prompt_id: &str, timeout: Option<Duration>) -> Result<(), JobError> {
        let cancel = self.cancel.clone();
        let conn = self.connection().await?;

        let outcome = tokio::select! {
            biased;
            _ = cancel.cancelled() => WaitOutcome::Cancelled,
            result = processor::await_completion(&mut conn.ws_stream, prompt_id) => WaitOutcome::Done(result),
            Some(elapsed) = sleep_for(timeout) => WaitOutcome::TimedOut(elapsed),
        };

        match outcome {
            WaitOutcome::Done(Ok(Completion::Finished)) => Ok(()),
            WaitOutcome::Done(Ok(Completion::Failed(error))) => Err(execution_failed(prompt_id, Some(error))),
            WaitOutcome::Done(Err(source)) => {
                tracing::warn!(prompt_id, error = %source, "Event stream lost, will reconnect");
                self.connection = None;
                Err(JobError::ConnectionLost {
                    prompt_id: prompt_id.to_string(),
                    source,
                })
            }
            WaitOutcome::Cancelled => {
                tracing::info!(prompt_id, "Wait for completion cancelled");
                self.rearm();
                self.abandon(prompt_id).await;
                Err(JobError::Cancelled {
                    prompt_id: prompt_id.to_string(),
                })
            }
            WaitOutcome::TimedOut(timeout) => {
                tracing::warn!(prompt_id, timeout_secs = timeout.as_secs_f64(), "Wait for completion timed out");
                self.abandon(prompt_id).await;
                Err(JobError::TimedOut {
                    prompt_id: prompt_id.to_string(),
                    timeout,
                })
            }
        }
    }

    /// Fetch every image listed in the job's history outputs.
    ///
    /// Artifacts follow the server's output order, then each output's
    /// image order.
    pub async fn collect_artifacts(&self, prompt_id: &str) -> Result<Vec<Artifact>, JobError> {
        let collection_failed = |source: ComfyUIApiError| JobError::CollectionFailed {
            prompt_id: prompt_id.to_string(),
            source,
        };

        let mut history = self
            .api
            .get_history(prompt_id)
            .await
            .map_err(collection_failed)?;
        let record = history
            .swap_remove(prompt_id)
            .ok_or_else(|| JobError::MissingHistory {
                prompt_id: prompt_id.to_string(),
            })?;
        if let Some(status) = record.status.as_ref().filter(|status| status.is_error()) {
            return Err(execution_failed(prompt_id, status.execution_error()));
        }

        let mut artifacts = Vec::new();
        for (node_id, output) in record.outputs {
            for image in output.images {
                let bytes = self.api.view(&image).await.map_err(collection_failed)?;
                tracing::debug!(
                    prompt_id,
                    node_id = %node_id,
                    filename = %image.filename,
                    size = bytes.len(),
                    "Fetched artifact",
                );
                artifacts.push(Artifact {
                    filename: image.filename,
                    subfolder: image.subfolder,
                    folder_type: image.folder_type,
                    bytes,
                });
            }
        }

        tracing::info!(prompt_id, count = artifacts.len(), "Collected artifacts");
        Ok(artifacts)
    }

    /// Submit a graph, wait for it, and return its artifacts.
    ///
    /// The graph must contain a `SaveImage` node. The event stream is
    /// opened before submission so the completion signal cannot be
    /// missed.
    pub async fn submit_and_collect(&mut self, graph: &JobGraph) -> Result<Vec<Artifact>, JobError> {
        self.submit_and_collect_within(graph, self.job_timeout).await
    }

    /// [`submit_and_collect`](Self::submit_and_collect) with an explicit
    /// wait bound. A job still running when it elapses is dequeued.
    pub async fn submit_and_collect_within(
        &mut self,
        graph: &JobGraph,
        timeout: Option<Duration>,
    ) -> Result<Vec<Artifact>, JobError> {
        graph::require_output_node(graph)?;
        self.connection().await?;

        let prompt_id = self.submit(graph).await?;
        self.wait_within(&prompt_id, timeout).await?;
        self.collect_artifacts(&prompt_id).await
    }

    /// Upload a local image so graphs can reference it (img2img,
    /// ControlNet inputs, ...).
    pub async fn upload_artifact(
        &self,
        path: impl AsRef<Path>,
        subfolder: Option<&str>,
        folder_type: Option<&str>,
        overwrite: bool,
    ) -> Result<UploadResponse, JobError> {
        let path = path.as_ref();
        let shown = path.display().to_string();

        let data = tokio::fs::read(path)
            .await
            .map_err(|source| JobError::UploadUnreadable {
                path: shown.clone(),
                source,
            })?;
        let file_name = path
            .file_name()
            .map(|name| name.to_string_lossy().into_owned())
            .unwrap_or_else(|| shown.clone());

        let response = self
            .api
            .upload_image(file_name, data, subfolder, folder_type, overwrite)
            .await
            .map_err(|source| JobError::UploadFailed {
                path: shown.clone(),
                source,
            })?;

        tracing::info!(
            path = %shown,
            name = %response.name,
            subfolder = %response.subfolder,
            "Uploaded input image",
        );
        Ok(response)
    }

    // ---- private helpers ----

    /// The open connection, reconnecting with backoff if there is none.
    async fn connection(&mut self) -> Result<&mut ComfyUIConnection, JobError> {
        let conn = match self.connection.take() {
            Some(conn) => conn,
            None => {
                tracing::info!(ws_url = self.events.ws_url(), "Event stream not connected, connecting");
                let result = reconnect_loop(&self.events, &self.reconnect, &self.cancel).await;
                match result {
                    Ok(conn) => conn,
                    Err(e) => {
                        if matches!(e, ReconnectError::Cancelled) {
                            self.rearm();
                        }
                        return Err(e.into());
                    }
                }
            }
        };
        Ok(self.connection.insert(conn))
    }

    /// Swap in a fresh token after a cancellation has been acted on.
    fn rearm(&mut self) {
        self.cancel = CancellationToken::new();
    }

    /// Best-effort removal of a job we stopped waiting for.
    async fn abandon(&self, prompt_id: &str) {
        if let Err(e) = self.api.delete_from_queue(prompt_id).await {
            tracing::warn!(prompt_id, error = %e, "Failed to delete abandoned job from queue");
        }
    }
}

fn execution_failed(prompt_id: &str, error: Option<ErrorData>) -> JobError {
    let (node_id, message) = match error {
        Some(error) => {
            let message = format!(
                "node {} ({}) raised {}: {}",
                error.node_id,
                error.node_type.as_deref().unwrap_or("unknown type"),
                error.exception_type,
                error.exception_message,
            );
            (Some(error.node_id), message)
        }
        None => (None, "server recorded the run as failed".to_string()),
    };
    JobError::ExecutionFailed {
        prompt_id: prompt_id.to_string(),
        node_id,
        message,
    }
}

/// Sleep for `timeout` and yield it, or never resolve when there is none.
async fn sleep_for(timeout: Option<Duration>) -> Option<Duration> {
    match timeout {
        Some(duration) => {
            tokio::time::sleep(duration).await;
            Some(duration)
        }
        None => std::future::pending().await,
    }
}
