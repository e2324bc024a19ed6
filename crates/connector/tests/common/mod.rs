//! Fake ComfyUI server shared by the integration tests.
//!
//! Serves the REST endpoints and the `/ws` event stream on an ephemeral
//! local port. Every submitted prompt is broadcast to the open event
//! streams, which answer with a scripted sequence of frames: a binary
//! preview, progress for the prompt, a completion for an unrelated
//! prompt and finally the prompt's own completion signal.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::{Arc, Mutex};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Multipart, Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::broadcast;

use comfy_connector::graph::{GraphValue, JobGraph, Node};

/// Behaviour of a [`FakeComfyUI`] instance.
#[derive(Debug, Clone)]
pub struct FakeOptions {
    /// `GET /` answers 503 this many times before answering 200.
    pub not_ready_probes: u32,
    /// Images listed in the history of every job, with their bytes.
    pub images: Vec<(String, Vec<u8>)>,
    /// Send the completion signal for submitted prompts.
    pub complete_jobs: bool,
    /// Answer `/history/{id}` with an empty object.
    pub missing_history: bool,
    /// Answer `/prompt` with a 400.
    pub reject_submissions: bool,
    /// Fail every job at node "4": an `execution_error` frame before the
    /// completion signal and an error status in history. The history
    /// still lists the images, as a partially run graph would.
    pub fail_jobs: bool,
}

impl Default for FakeOptions {
    fn default() -> Self {
        Self {
            not_ready_probes: 0,
            images: vec![
                ("out_00001_.png".to_string(), b"first image".to_vec()),
                ("out_00002_.png".to_string(), b"second image".to_vec()),
            ],
            complete_jobs: true,
            missing_history: false,
            reject_submissions: false,
            fail_jobs: false,
        }
    }
}

/// One multipart upload received by the fake.
#[derive(Debug, Clone, Default)]
pub struct UploadRecord {
    pub file_name: Option<String>,
    pub bytes: Vec<u8>,
    pub overwrite: Option<String>,
    pub subfolder: Option<String>,
    pub folder_type: Option<String>,
}

/// Observable state of the fake.
pub struct FakeState {
    options: FakeOptions,
    jobs: broadcast::Sender<String>,
    /// Close the event stream instead of completing the next job.
    pub close_on_next_job: AtomicBool,
    pub probes: AtomicU32,
    pub submissions: AtomicU32,
    pub ws_connections: AtomicU32,
    pub client_ids: Mutex<Vec<String>>,
    pub prompts: Mutex<Vec<Value>>,
    pub deleted: Mutex<Vec<String>>,
    pub uploads: Mutex<Vec<UploadRecord>>,
}

/// Handle to a running fake server.
pub struct FakeComfyUI {
    pub addr: SocketAddr,
    pub state: Arc<FakeState>,
}

impl FakeComfyUI {
    pub async fn spawn(options: FakeOptions) -> Self {
        let (jobs, _) = broadcast::channel(16);
        let state = Arc::new(FakeState {
            options,
            jobs,
            close_on_next_job: AtomicBool::new(false),
            probes: AtomicU32::new(0),
            submissions: AtomicU32::new(0),
            ws_connections: AtomicU32::new(0),
            client_ids: Mutex::new(Vec::new()),
            prompts: Mutex::new(Vec::new()),
            deleted: Mutex::new(Vec::new()),
            uploads: Mutex::new(Vec::new()),
        });

        let app = Router::new()
            .route("/", get(probe))
            .route("/prompt", post(submit))
            .route("/queue", post(queue))
            .route("/history/{prompt_id}", get(history))
            .route("/view", get(view))
            .route("/upload/image", post(upload))
            .route("/ws", get(events))
            .with_state(Arc::clone(&state));

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });

        Self { addr, state }
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }

    pub fn http_url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn ws_url(&self) -> String {
        format!("ws://{}", self.addr)
    }

    pub fn submissions(&self) -> u32 {
        self.state.submissions.load(Ordering::SeqCst)
    }

    pub fn ws_connections(&self) -> u32 {
        self.state.ws_connections.load(Ordering::SeqCst)
    }
}

/// Minimal txt2img graph with a `SaveImage` output node.
pub fn txt2img_graph() -> JobGraph {
    [
        (
            "3",
            Node::new("KSampler")
                .with_input("seed", 42_i64)
                .with_input("steps", 20_i64)
                .with_input("model", GraphValue::reference("4", 0))
                .with_input("positive", GraphValue::reference("6", 0)),
        ),
        (
            "4",
            Node::new("CheckpointLoaderSimple").with_input("ckpt_name", "sd_xl_base_1.0.safetensors"),
        ),
        (
            "6",
            Node::new("CLIPTextEncode")
                .with_input("text", "a lighthouse at dusk")
                .with_input("clip", GraphValue::reference("4", 1)),
        ),
        (
            "9",
            Node::new("SaveImage")
                .with_input("filename_prefix", "out")
                .with_input("images", GraphValue::reference("3", 0)),
        ),
    ]
    .into_iter()
    .map(|(id, node)| (id.to_string(), node))
    .collect()
}

// ---- handlers ----

async fn probe(State(state): State<Arc<FakeState>>) -> StatusCode {
    let n = state.probes.fetch_add(1, Ordering::SeqCst);
    if n < state.options.not_ready_probes {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    }
}

async fn submit(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> Response {
    if state.options.reject_submissions {
        let error = json!({"error": {"type": "prompt_outputs_failed_validation"}});
        return (StatusCode::BAD_REQUEST, Json(error)).into_response();
    }

    let number = state.submissions.fetch_add(1, Ordering::SeqCst);
    let prompt_id = format!("prompt-{}", number + 1);

    if let Some(client_id) = body.get("client_id").and_then(Value::as_str) {
        state.client_ids.lock().unwrap().push(client_id.to_string());
    }
    state.prompts.lock().unwrap().push(body["prompt"].clone());

    let _ = state.jobs.send(prompt_id.clone());
    Json(json!({"prompt_id": prompt_id, "number": number, "node_errors": {}})).into_response()
}

async fn queue(State(state): State<Arc<FakeState>>, Json(body): Json<Value>) -> StatusCode {
    if let Some(ids) = body.get("delete").and_then(Value::as_array) {
        let mut deleted = state.deleted.lock().unwrap();
        deleted.extend(ids.iter().filter_map(Value::as_str).map(str::to_string));
    }
    StatusCode::OK
}

async fn history(State(state): State<Arc<FakeState>>, Path(prompt_id): Path<String>) -> Json<Value> {
    if state.options.missing_history {
        return Json(json!({}));
    }

    let images: Vec<Value> = state
        .options
        .images
        .iter()
        .map(|(filename, _)| json!({"filename": filename, "subfolder": "", "type": "output"}))
        .collect();
    let outputs = if images.is_empty() {
        json!({})
    } else {
        json!({"9": {"images": images}})
    };

    let status = if state.options.fail_jobs {
        json!({
            "status_str": "error",
            "completed": false,
            "messages": [
                ["execution_start", {"prompt_id": &prompt_id}],
                ["execution_error", execution_error(&prompt_id)],
            ],
        })
    } else {
        json!({"status_str": "success", "completed": true, "messages": []})
    };

    Json(json!({
        prompt_id: {
            "prompt": [0, "ignored", {}, {}, ["9"]],
            "outputs": outputs,
            "status": status,
        }
    }))
}

#[derive(Deserialize)]
struct ViewQuery {
    filename: String,
}

async fn view(State(state): State<Arc<FakeState>>, Query(query): Query<ViewQuery>) -> Response {
    match state
        .options
        .images
        .iter()
        .find(|(filename, _)| *filename == query.filename)
    {
        Some((_, bytes)) => bytes.clone().into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn upload(State(state): State<Arc<FakeState>>, mut multipart: Multipart) -> Json<Value> {
    let mut record = UploadRecord::default();

    while let Some(field) = multipart.next_field().await.unwrap() {
        let name = field.name().unwrap_or_default().to_string();
        match name.as_str() {
            "image" => {
                record.file_name = field.file_name().map(str::to_string);
                record.bytes = field.bytes().await.unwrap().to_vec();
            }
            "overwrite" => record.overwrite = Some(field.text().await.unwrap()),
            "subfolder" => record.subfolder = Some(field.text().await.unwrap()),
            "type" => record.folder_type = Some(field.text().await.unwrap()),
            _ => {}
        }
    }

    let response = json!({
        "name": record.file_name.clone().unwrap_or_default(),
        "subfolder": record.subfolder.clone().unwrap_or_default(),
        "type": record.folder_type.clone().unwrap_or_else(|| "input".to_string()),
    });
    state.uploads.lock().unwrap().push(record);
    Json(response)
}

#[derive(Deserialize)]
struct EventsQuery {
    #[serde(rename = "clientId")]
    client_id: String,
}

async fn events(
    ws: WebSocketUpgrade,
    Query(query): Query<EventsQuery>,
    State(state): State<Arc<FakeState>>,
) -> Response {
    state.ws_connections.fetch_add(1, Ordering::SeqCst);
    state.client_ids.lock().unwrap().push(query.client_id);
    // Subscribe before the handshake completes so no job is missed.
    let jobs = state.jobs.subscribe();
    ws.on_upgrade(move |socket| stream_events(socket, jobs, state))
}

async fn stream_events(mut socket: WebSocket, mut jobs: broadcast::Receiver<String>, state: Arc<FakeState>) {
    let status = json!({"type": "status", "data": {"status": {"exec_info": {"queue_remaining": 0}}}});
    if socket.send(Message::Text(status.to_string().into())).await.is_err() {
        return;
    }

    while let Ok(prompt_id) = jobs.recv().await {
        if state.close_on_next_job.swap(false, Ordering::SeqCst) {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }

        for frame in job_frames(&prompt_id, &state.options) {
            if socket.send(frame).await.is_err() {
                return;
            }
        }
    }
}

/// Frames sent for one job, interleaving noise with the real signal.
fn job_frames(prompt_id: &str, options: &FakeOptions) -> Vec<Message> {
    let text = |value: Value| Message::Text(value.to_string().into());

    let mut frames = vec![
        text(json!({"type": "execution_start", "data": {"prompt_id": prompt_id}})),
        text(json!({"type": "executing", "data": {"node": "3", "prompt_id": prompt_id}})),
        Message::Binary(vec![0, 0, 0, 1, 0xff, 0xd8, 0xff].into()),
        text(json!({"type": "progress", "data": {"value": 10, "max": 20, "prompt_id": prompt_id}})),
        text(json!({"type": "executing", "data": {"node": null, "prompt_id": "someone-elses-prompt"}})),
        text(json!({"type": "crystools.monitor", "data": {"cpu_utilization": 12.5}})),
        text(json!({"type": "executing", "data": {"node": "9", "prompt_id": prompt_id}})),
    ];
    if options.fail_jobs {
        frames.push(text(json!({"type": "execution_error", "data": execution_error(prompt_id)})));
    }
    if options.complete_jobs {
        frames.push(text(json!({"type": "executing", "data": {"node": null, "prompt_id": prompt_id}})));
    }
    frames
}

/// `execution_error` payload for a job failing at the checkpoint loader.
fn execution_error(prompt_id: &str) -> Value {
    json!({
        "prompt_id": prompt_id,
        "node_id": "4",
        "node_type": "CheckpointLoaderSimple",
        "executed": ["6"],
        "exception_type": "FileNotFoundError",
        "exception_message": "sd_xl_base_1.0.safetensors not found",
        "traceback": [],
        "current_inputs": {},
        "current_outputs": {},
    })
}
