//! End-to-end tests for `ComfyConnector`.
//!
//! The "server process" is a plain `sleep`; the fake ComfyUI server plays
//! the part of the launched instance. It answers the first `GET /` with a
//! 503 so that port allocation picks its port, then behaves as a ready
//! server for the readiness probe and the jobs that follow.

mod common;

use std::time::Duration;

use assert_matches::assert_matches;

use comfy_connector::graph::{GraphError, JobGraph, Node};
use comfy_connector::job::JobError;
use comfy_connector::supervisor::{CommandLine, SupervisorError};
use comfy_connector::{ComfyConnector, ConnectorConfig, ConnectorError};
use common::{txt2img_graph, FakeComfyUI, FakeOptions};

fn config_for(fake: &FakeComfyUI) -> ConnectorConfig {
    let command = CommandLine {
        program: "sh".into(),
        args: vec!["-c".into(), "exec sleep 30".into()],
    };
    let mut config = ConnectorConfig::new("test-app", command, "unused.json");
    config.initial_port = fake.port();
    config.port_scan_limit = 1;
    config.start_retry_interval = Duration::from_millis(10);
    config.settle_delay = Duration::ZERO;
    config.probe_timeout = Duration::from_secs(10);
    config
}

async fn launchable_fake(options: FakeOptions) -> FakeComfyUI {
    FakeComfyUI::spawn(FakeOptions {
        not_ready_probes: 1,
        ..options
    })
    .await
}

// ---------------------------------------------------------------------------
// Test: start, run a job, stop
// ---------------------------------------------------------------------------

#[tokio::test]
async fn full_lifecycle() {
    let fake = launchable_fake(FakeOptions::default()).await;
    let mut connector = ComfyConnector::with_test_graph(config_for(&fake), txt2img_graph()).unwrap();

    connector.start().await.unwrap();

    assert_eq!(connector.port(), Some(fake.port()));
    assert_eq!(connector.api_url(), Some(fake.http_url().as_str()));
    assert!(connector.pid().is_some());
    let client_id = connector.client_id().unwrap().to_string();
    assert!(client_id.starts_with("test-app-"));
    // The readiness test job.
    assert_eq!(fake.submissions(), 1);

    let artifacts = connector.submit_and_collect(&txt2img_graph()).await.unwrap();
    assert_eq!(artifacts.len(), 2);
    assert_eq!(artifacts[0].bytes, b"first image");
    assert_eq!(artifacts[1].bytes, b"second image");
    assert_eq!(fake.submissions(), 2);

    let client_ids = fake.state.client_ids.lock().unwrap().clone();
    assert!(client_ids.iter().all(|id| *id == client_id));

    connector.stop().await;
    assert_eq!(connector.pid(), None);
    assert_eq!(connector.port(), None);
    assert_eq!(connector.client_id(), None);
}

// ---------------------------------------------------------------------------
// Test: a second start without stop launches nothing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn start_is_idempotent() {
    let fake = launchable_fake(FakeOptions::default()).await;
    let mut connector = ComfyConnector::with_test_graph(config_for(&fake), txt2img_graph()).unwrap();

    connector.start().await.unwrap();
    let pid = connector.pid();
    let client_id = connector.client_id().map(str::to_string);

    connector.start().await.unwrap();

    assert_eq!(connector.pid(), pid);
    assert_eq!(connector.client_id().map(str::to_string), client_id);
    assert_eq!(fake.submissions(), 1);

    connector.stop().await;
}

// ---------------------------------------------------------------------------
// Test: jobs start the server on demand
// ---------------------------------------------------------------------------

#[tokio::test]
async fn submit_starts_server_on_demand() {
    let fake = launchable_fake(FakeOptions::default()).await;
    let mut connector = ComfyConnector::with_test_graph(config_for(&fake), txt2img_graph()).unwrap();

    let artifacts = connector.submit_and_collect(&txt2img_graph()).await.unwrap();

    assert_eq!(artifacts.len(), 2);
    assert!(connector.pid().is_some());
    assert_eq!(fake.submissions(), 2);

    connector.stop().await;
}

// ---------------------------------------------------------------------------
// Test: cancelling one job leaves the connector usable
// ---------------------------------------------------------------------------

#[tokio::test]
async fn cancellation_affects_only_one_job() {
    let fake = launchable_fake(FakeOptions::default()).await;
    let mut connector = ComfyConnector::with_test_graph(config_for(&fake), txt2img_graph()).unwrap();
    assert!(connector.cancellation_token().is_none());
    connector.start().await.unwrap();

    connector.cancellation_token().unwrap().cancel();
    let err = connector.submit_and_collect(&txt2img_graph()).await.unwrap_err();
    assert_matches!(err, ConnectorError::Job(JobError::Cancelled { .. }));

    for _ in 0..2 {
        let artifacts = connector.submit_and_collect(&txt2img_graph()).await.unwrap();
        assert_eq!(artifacts.len(), 2);
    }
    assert!(!connector.cancellation_token().unwrap().is_cancelled());
    assert_eq!(*fake.state.deleted.lock().unwrap(), vec!["prompt-2"]);

    connector.stop().await;
}

// ---------------------------------------------------------------------------
// Test: a server that never produces the test artifact
// ---------------------------------------------------------------------------

#[tokio::test]
async fn startup_timeout_tears_everything_down() {
    let fake = launchable_fake(FakeOptions {
        images: vec![],
        ..FakeOptions::default()
    })
    .await;
    let mut config = config_for(&fake);
    config.max_start_attempts = 3;
    let mut connector = ComfyConnector::with_test_graph(config, txt2img_graph()).unwrap();

    let err = connector.start().await.unwrap_err();

    assert_matches!(err, ConnectorError::Startup(SupervisorError::StartupTimeout { attempts: 3 }));
    assert!(err.is_startup_failure());
    assert!(err.to_string().starts_with("startup:"));
    assert_eq!(fake.submissions(), 3);
    assert_eq!(connector.pid(), None);
    assert_eq!(connector.port(), None);
}

// ---------------------------------------------------------------------------
// Test: no free port within the scan limit
// ---------------------------------------------------------------------------

#[tokio::test]
async fn occupied_port_range_fails_port_allocation() {
    let fake = FakeComfyUI::spawn(FakeOptions::default()).await;
    let mut connector = ComfyConnector::with_test_graph(config_for(&fake), txt2img_graph()).unwrap();

    let err = connector.start().await.unwrap_err();

    assert_matches!(err, ConnectorError::PortAllocation(_));
    assert!(err.to_string().starts_with("port allocation:"));
    assert_eq!(connector.pid(), None);
}

// ---------------------------------------------------------------------------
// Test: stop before start and repeated stop are harmless
// ---------------------------------------------------------------------------

#[tokio::test]
async fn stop_is_safe_without_start() {
    let fake = FakeComfyUI::spawn(FakeOptions::default()).await;
    let mut connector = ComfyConnector::with_test_graph(config_for(&fake), txt2img_graph()).unwrap();

    connector.stop().await;
    connector.stop().await;

    assert_eq!(connector.pid(), None);
}

// ---------------------------------------------------------------------------
// Test: test payload loading
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_payload_is_loaded_from_disk() {
    let fake = launchable_fake(FakeOptions::default()).await;
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("test_payload.json");
    std::fs::write(&path, serde_json::to_string(&txt2img_graph()).unwrap()).unwrap();

    let mut config = config_for(&fake);
    config.test_payload = path;
    let mut connector = ComfyConnector::new(config).await.unwrap();

    connector.start().await.unwrap();
    assert_eq!(fake.submissions(), 1);
    connector.stop().await;
}

#[tokio::test]
async fn missing_test_payload_is_a_graph_error() {
    let fake = FakeComfyUI::spawn(FakeOptions::default()).await;
    let mut config = config_for(&fake);
    config.test_payload = "/nonexistent/test_payload.json".into();

    let err = ComfyConnector::new(config).await.err().unwrap();

    assert_matches!(err, ConnectorError::TestGraph(GraphError::Io { .. }));
    assert!(err.to_string().starts_with("graph:"));
}

#[tokio::test]
async fn test_payload_without_output_node_is_rejected() {
    let fake = FakeComfyUI::spawn(FakeOptions::default()).await;
    let graph: JobGraph = [("1".to_string(), Node::new("KSampler"))].into_iter().collect();

    let err = ComfyConnector::with_test_graph(config_for(&fake), graph).err().unwrap();

    assert_matches!(err, ConnectorError::TestGraph(GraphError::MissingOutputNode { .. }));
}

// ---------------------------------------------------------------------------
// Test: upload goes through the running instance
// ---------------------------------------------------------------------------

#[tokio::test]
async fn upload_image_through_connector() {
    let fake = launchable_fake(FakeOptions::default()).await;
    let mut connector = ComfyConnector::with_test_graph(config_for(&fake), txt2img_graph()).unwrap();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("depth.png");
    std::fs::write(&path, b"depth map").unwrap();

    let response = connector
        .upload_image(&path, None, Some("input"), false)
        .await
        .unwrap();

    assert_eq!(response.name, "depth.png");
    let uploads = fake.state.uploads.lock().unwrap().clone();
    assert_eq!(uploads[0].overwrite.as_deref(), Some("false"));
    assert_eq!(uploads[0].folder_type.as_deref(), Some("input"));

    connector.stop().await;
}
