//! One-shot ComfyUI worker.
//!
//! Loads a job graph, optionally pins its seed, runs it on a locally
//! launched ComfyUI server through [`ComfyConnector`] and writes the
//! produced images to the output directory.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use comfy_connector::graph::{self, GraphValue};
use comfy_connector::{Artifact, ComfyConnector};

/// Default directory artifacts are written to.
pub const DEFAULT_OUTPUT_DIR: &str = "output";

/// What the worker runs and where results go.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    /// Job graph to run.
    pub job_graph: PathBuf,
    /// Directory receiving the artifacts (default: `output`).
    pub output_dir: PathBuf,
    /// Overrides every `seed` input in the graph.
    pub seed: Option<i64>,
}

impl WorkerSettings {
    /// Load settings from environment variables.
    ///
    /// | Variable     | Required | Default  |
    /// |--------------|----------|----------|
    /// | `JOB_GRAPH`  | yes      | --       |
    /// | `OUTPUT_DIR` | no       | `output` |
    /// | `SEED`       | no       | --       |
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|var| std::env::var(var).ok())
    }

    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let job_graph = lookup("JOB_GRAPH").context("JOB_GRAPH must be set")?;
        let output_dir = lookup("OUTPUT_DIR").unwrap_or_else(|| DEFAULT_OUTPUT_DIR.to_string());
        let seed = lookup("SEED")
            .map(|raw| {
                raw.trim()
                    .parse::<i64>()
                    .with_context(|| format!("SEED must be an integer, got {raw:?}"))
            })
            .transpose()?;

        Ok(Self {
            job_graph: job_graph.into(),
            output_dir: output_dir.into(),
            seed,
        })
    }
}

/// Run the configured job and save its artifacts. Returns the written paths.
pub async fn run(connector: &mut ComfyConnector, settings: &WorkerSettings) -> Result<Vec<PathBuf>> {
    let mut job = graph::load_graph(&settings.job_graph)
        .await
        .with_context(|| format!("loading job graph {}", settings.job_graph.display()))?;

    if let Some(seed) = settings.seed {
        let replaced = graph::replace_field(&mut job, "seed", &GraphValue::from(seed), None, true);
        tracing::info!(seed, replaced, "Seed override applied");
    }

    connector.start().await.context("starting ComfyUI")?;

    let artifacts = connector
        .submit_and_collect(&job)
        .await
        .context("running job")?;

    save_artifacts(&settings.output_dir, &artifacts).await
}

/// Write artifacts below `dir`, keeping their server-side subfolder.
pub async fn save_artifacts(dir: &Path, artifacts: &[Artifact]) -> Result<Vec<PathBuf>> {
    let mut written = Vec::with_capacity(artifacts.len());

    for artifact in artifacts {
        let path = artifact_path(dir, artifact)?;
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating {}", parent.display()))?;
        }
        tokio::fs::write(&path, &artifact.bytes)
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        tracing::info!(path = %path.display(), size = artifact.bytes.len(), "Artifact saved");
        written.push(path);
    }

    Ok(written)
}

/// Destination of one artifact. Only plain path components are kept, so
/// a server-supplied name cannot escape `dir`.
fn artifact_path(dir: &Path, artifact: &Artifact) -> Result<PathBuf> {
    let file_name = Path::new(&artifact.filename)
        .file_name()
        .with_context(|| format!("artifact has no usable file name: {:?}", artifact.filename))?;

    let mut path = dir.to_path_buf();
    path.extend(
        Path::new(&artifact.subfolder)
            .components()
            .filter_map(|c| match c {
                std::path::Component::Normal(part) => Some(part),
                _ => None,
            }),
    );
    path.push(file_name);
    Ok(path)
}
