//! Completion-synchronization loop over the ComfyUI event stream.
//!
//! [`await_completion`] drains the event stream until the awaited
//! prompt either finishes or reports an execution error. Preview images,
//! events of other prompts and message kinds nobody models are logged
//! and dropped.

use futures::{Stream, StreamExt};
use tokio_tungstenite::tungstenite::{self, Message};

use crate::messages::{parse_message, ComfyUIMessage, ErrorData};

/// The event stream ended before the awaited prompt completed.
#[derive(Debug, thiserror::Error)]
#[error("event stream lost: {0}")]
pub struct ConnectionLost(pub String);

/// How the awaited prompt ended.
#[derive(Debug, Clone)]
pub enum Completion {
    /// All nodes ran.
    Finished,
    /// A node raised; the rest of the graph was skipped.
    Failed(ErrorData),
}

/// Consume frames until `prompt_id` finishes or fails.
///
/// Frames after the deciding one are left in the stream. Returns
/// [`ConnectionLost`] when the socket closes, errors, or is exhausted
/// first; the caller must then drop the connection and reconnect.
pub async fn await_completion<S>(stream: &mut S, prompt_id: &str) -> Result<Completion, ConnectionLost>
where
    S: Stream<Item = Result<Message, tungstenite::Error>> + Unpin,
{
    while let Some(msg_result) = stream.next().await {
        match msg_result {
            Ok(Message::Text(text)) => {
                if let Some(completion) = handle_text_message(&text, prompt_id) {
                    return Ok(completion);
                }
            }
            Ok(Message::Binary(data)) => {
                tracing::trace!(prompt_id, bytes = data.len(), "Skipping preview frame");
            }
            Ok(Message::Ping(_) | Message::Pong(_) | Message::Frame(_)) => {}
            Ok(Message::Close(frame)) => {
                tracing::info!(prompt_id, ?frame, "ComfyUI WebSocket closed");
                return Err(ConnectionLost(format!("closed by server ({frame:?})")));
            }
            Err(e) => {
                tracing::error!(prompt_id, error = %e, "WebSocket receive error");
                return Err(ConnectionLost(e.to_string()));
            }
        }
    }

    Err(ConnectionLost("stream ended".to_string()))
}

/// Inspect a single text frame. Returns the outcome once the awaited
/// prompt is decided.
fn handle_text_message(text: &str, prompt_id: &str) -> Option<Completion> {
    let msg = match parse_message(text) {
        Ok(msg) => msg,
        Err(e) => {
            // Custom nodes emit their own message types; not an error.
            tracing::debug!(error = %e, raw_message = %text, "Skipping unrecognised ComfyUI message");
            return None;
        }
    };

    if msg.completes(prompt_id) {
        tracing::info!(prompt_id, "Execution completed (all nodes done)");
        return Some(Completion::Finished);
    }

    match msg {
        ComfyUIMessage::Executing(data) => {
            tracing::debug!(
                awaited = prompt_id,
                prompt_id = ?data.prompt_id,
                node = ?data.node,
                "Executing node",
            );
        }
        ComfyUIMessage::Progress(data) => {
            let percent = if data.max > 0 {
                ((data.value as f64 / data.max as f64) * 100.0) as i16
            } else {
                0
            };
            tracing::debug!(prompt_id, value = data.value, max = data.max, percent, "Generation progress");
        }
        ComfyUIMessage::ExecutionStart(data) if data.prompt_id == prompt_id => {
            tracing::info!(prompt_id, "Execution started");
        }
        ComfyUIMessage::ExecutionError(data) if data.prompt_id == prompt_id => {
            tracing::error!(
                prompt_id,
                node_id = %data.node_id,
                error_type = %data.exception_type,
                error_message = %data.exception_message,
                "Execution error",
            );
            return Some(Completion::Failed(data));
        }
        ComfyUIMessage::Status(data) => {
            tracing::debug!(
                queue_remaining = data.status.exec_info.queue_remaining,
                "ComfyUI queue status",
            );
        }
        other => {
            tracing::trace!(msg = ?other, "Discarding message");
        }
    }

    None
}
