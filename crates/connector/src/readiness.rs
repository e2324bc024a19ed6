//! Readiness detection for a starting ComfyUI server.
//!
//! ComfyUI answers HTTP well before its execution engine can run a
//! prompt, so a 200 on `/` is not enough. [`SyntheticJobProbe`] runs a
//! small fixed test graph end to end and only reports ready once that
//! job has produced at least one artifact.

use std::time::Duration;

use async_trait::async_trait;

use crate::graph::JobGraph;
use crate::job::{JobClient, JobError};

/// A check polled by the supervisor while the server starts up.
///
/// Failing checks are expected during startup, so implementations log
/// and return `false` instead of raising errors.
#[async_trait]
pub trait ReadinessCheck: Send {
    async fn is_ready(&mut self) -> bool;
}

/// Readiness check that runs a synthetic job through a [`JobClient`].
pub struct SyntheticJobProbe<'a> {
    jobs: &'a mut JobClient,
    test_graph: &'a JobGraph,
    timeout: Option<Duration>,
}

impl<'a> SyntheticJobProbe<'a> {
    pub fn new(jobs: &'a mut JobClient, test_graph: &'a JobGraph) -> Self {
        Self {
            jobs,
            test_graph,
            timeout: None,
        }
    }

    /// Give up on a test job that has not finished after `timeout`.
    /// Defaults to the job client's own timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }
}

#[async_trait]
impl ReadinessCheck for SyntheticJobProbe<'_> {
    async fn is_ready(&mut self) -> bool {
        let api_url = self.jobs.api().api_url().to_string();

        match self.jobs.api().probe().await {
            Ok(status) if status.is_success() => {}
            Ok(status) => {
                tracing::debug!(api_url = %api_url, status = %status, "Web server not ready");
                return false;
            }
            Err(e) => {
                tracing::debug!(api_url = %api_url, error = %e, "Web server unreachable");
                return false;
            }
        }

        tracing::info!(api_url = %api_url, "Web server is up, running test job");

        // Fresh subscription for every probe; a half-started server may
        // have accepted and then dropped the previous one.
        if let Err(e) = self.jobs.reconnect().await {
            tracing::debug!(error = %e, "Event stream not available yet");
            return false;
        }

        // A test job still running at the deadline is dequeued by the
        // job client, so retries never pile up behind a stuck one.
        let timeout = self.timeout.or(self.jobs.job_timeout());
        let result = self.jobs.submit_and_collect_within(self.test_graph, timeout).await;

        match result {
            Ok(artifacts) if !artifacts.is_empty() => {
                tracing::info!(count = artifacts.len(), "Test job produced artifacts");
                true
            }
            Ok(_) => {
                tracing::warn!("Test job completed without artifacts");
                false
            }
            Err(e @ JobError::TimedOut { .. }) => {
                tracing::warn!(error = %e, "Test job did not finish in time");
                false
            }
            Err(e) => {
                tracing::debug!(error = %e, "Test job failed");
                false
            }
        }
    }
}
