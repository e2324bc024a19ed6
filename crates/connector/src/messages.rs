//! Typed view of the ComfyUI event stream.
//!
//! Text frames are `{"type": ..., "data": {...}}` objects. Only the kinds
//! the completion loop reacts to are modelled; anything else (custom
//! node telemetry, cache notices, ...) fails to parse and is skipped by
//! the caller.

use serde::Deserialize;

/// An event-stream message.
#[derive(Debug, Clone, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "snake_case")]
pub enum ComfyUIMessage {
    /// Queue depth broadcast, sent on connect and whenever the queue changes.
    Status(StatusData),
    ExecutionStart(PromptData),
    /// Node `node` started running. A null node ends the prompt.
    Executing(ExecutingData),
    /// Sampler step progress.
    Progress(ProgressData),
    /// A node finished and reported its outputs.
    Executed(ExecutedData),
    ExecutionSuccess(PromptData),
    ExecutionInterrupted(PromptData),
    ExecutionError(ErrorData),
}

#[derive(Debug, Clone, Deserialize)]
pub struct StatusData {
    pub status: QueueStatus,
}

#[derive(Debug, Clone, Deserialize)]
pub struct QueueStatus {
    pub exec_info: ExecInfo,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecInfo {
    pub queue_remaining: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct PromptData {
    pub prompt_id: String,
}

/// `prompt_id` is absent on servers predating per-prompt events.
#[derive(Debug, Clone, Deserialize)]
pub struct ExecutingData {
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressData {
    pub value: u32,
    pub max: u32,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub prompt_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExecutedData {
    pub node: String,
    pub prompt_id: String,
    /// Output listing of the node, e.g. `{"images": [...]}` for `SaveImage`.
    #[serde(default)]
    pub output: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ErrorData {
    pub prompt_id: String,
    pub node_id: String,
    #[serde(default)]
    pub node_type: Option<String>,
    pub exception_type: String,
    pub exception_message: String,
}

impl ComfyUIMessage {
    /// Whether this is the completion signal for `prompt_id`:
    /// `executing` with a null node and a matching prompt ID.
    pub fn completes(&self, prompt_id: &str) -> bool {
        matches!(
            self,
            ComfyUIMessage::Executing(ExecutingData { node: None, prompt_id: Some(id) })
                if id == prompt_id
        )
    }

    /// Prompt the message is about, when it names one.
    pub fn prompt_id(&self) -> Option<&str> {
        match self {
            ComfyUIMessage::Status(_) => None,
            ComfyUIMessage::Executing(data) => data.prompt_id.as_deref(),
            ComfyUIMessage::Progress(data) => data.prompt_id.as_deref(),
            ComfyUIMessage::Executed(data) => Some(&data.prompt_id),
            ComfyUIMessage::ExecutionError(data) => Some(&data.prompt_id),
            ComfyUIMessage::ExecutionStart(data)
            | ComfyUIMessage::ExecutionSuccess(data)
            | ComfyUIMessage::ExecutionInterrupted(data) => Some(&data.prompt_id),
        }
    }
}

/// Parse one text frame. Unknown `type` values are an error.
pub fn parse_message(text: &str) -> Result<ComfyUIMessage, serde_json::Error> {
    serde_json::from_str(text)
}
