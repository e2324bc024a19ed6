//! `comfy-worker` -- runs one job graph on a locally launched ComfyUI.
//!
//! # Environment variables
//!
//! See [`ConnectorConfig::from_env`] for the server launch settings
//! (`API_COMMAND_LINE`, `TEST_PAYLOAD`, ...) and
//! [`WorkerSettings::from_env`] for the job settings (`JOB_GRAPH`,
//! `OUTPUT_DIR`, `SEED`).

use std::process::ExitCode;

use anyhow::Context;
use comfy_connector::{ComfyConnector, ConnectorConfig};
use comfy_worker::WorkerSettings;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "comfy_worker=info,comfy_connector=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run().await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %format!("{e:#}"), "Worker failed");
            ExitCode::FAILURE
        }
    }
}

async fn run() -> anyhow::Result<()> {
    let config = ConnectorConfig::from_env().context("loading connector configuration")?;
    let settings = WorkerSettings::from_env()?;

    tracing::info!(
        app_name = %config.app_name,
        command = %config.command_line,
        job_graph = %settings.job_graph.display(),
        output_dir = %settings.output_dir.display(),
        "Worker starting",
    );

    let mut connector = ComfyConnector::new(config).await?;
    let result = comfy_worker::run(&mut connector, &settings).await;
    connector.stop().await;

    let written = result?;
    tracing::info!(count = written.len(), "Worker finished");
    Ok(())
}
